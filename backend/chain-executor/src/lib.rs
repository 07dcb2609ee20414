//! Dual-chain balance reads and transaction submission (Base, BSC).
//!
//! This crate owns all on-chain I/O so that every other component works
//! exclusively in the vault's normalized `Money` unit and never has to
//! reason about per-chain decimals or RPC failure modes directly.

use async_trait::async_trait;
use constitution::{chain_profile, raw_to_money, ChainId, Money};
use ethers::types::{Address, H256, U256};
use std::collections::HashMap;
use std::str::FromStr;
use tokio::sync::RwLock;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("rpc call to {chain} failed: {detail}")]
    Rpc { chain: &'static str, detail: String },
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("insufficient gas reserve on {0}")]
    InsufficientGas(&'static str),
    #[error("transaction reverted: {0}")]
    Reverted(String),
}

pub type ChainResult<T> = Result<T, ChainError>;

#[derive(Debug, Clone, Copy)]
pub struct ChainBalance {
    pub chain_id: ChainId,
    pub raw: u128,
    pub normalized: Money,
}

/// Abstraction over an RPC backend so tests can substitute a fake chain
/// without reaching the network. The production implementation wraps
/// `ethers::providers::Provider`.
#[async_trait]
pub trait ChainRpc: Send + Sync {
    async fn get_balance(&self, chain_id: ChainId, address: Address) -> ChainResult<u128>;
    async fn send_transaction(&self, chain_id: ChainId, to: Address, raw_amount: u128) -> ChainResult<H256>;
    async fn estimate_gas_cost_usd(&self, chain_id: ChainId) -> ChainResult<f64>;
}

/// In-memory RPC stand-in used by tests and by `mortal-runtime` in dry-run
/// mode before real RPC endpoints are configured.
pub struct MockChainRpc {
    balances: RwLock<HashMap<(ChainId, Address), u128>>,
    gas_usd: f64,
}

impl MockChainRpc {
    pub fn new(gas_usd: f64) -> Self {
        Self { balances: RwLock::new(HashMap::new()), gas_usd }
    }

    pub async fn set_balance(&self, chain_id: ChainId, address: Address, raw: u128) {
        self.balances.write().await.insert((chain_id, address), raw);
    }
}

#[async_trait]
impl ChainRpc for MockChainRpc {
    async fn get_balance(&self, chain_id: ChainId, address: Address) -> ChainResult<u128> {
        Ok(*self.balances.read().await.get(&(chain_id, address)).unwrap_or(&0))
    }

    async fn send_transaction(&self, chain_id: ChainId, to: Address, raw_amount: u128) -> ChainResult<H256> {
        let mut balances = self.balances.write().await;
        let entry = balances.entry((chain_id, to)).or_insert(0);
        *entry += raw_amount;
        Ok(H256::random())
    }

    async fn estimate_gas_cost_usd(&self, _chain_id: ChainId) -> ChainResult<f64> {
        Ok(self.gas_usd)
    }
}

/// Aggregates balances across both supported chains and enforces the
/// dual-chain independence floor: a single chain's balance may not count
/// toward the independence threshold by more than half of it, so a
/// concentrated balance on one chain cannot alone trigger independence.
pub struct ChainExecutor {
    rpc: Box<dyn ChainRpc>,
    vault_address: Address,
}

#[derive(Debug, Clone)]
pub struct AggregateBalance {
    pub total: Money,
    pub per_chain: Vec<ChainBalance>,
}

impl ChainExecutor {
    pub fn new(rpc: Box<dyn ChainRpc>, vault_address: Address) -> Self {
        Self { rpc, vault_address }
    }

    pub fn parse_address(raw: &str) -> ChainResult<Address> {
        Address::from_str(raw).map_err(|_| ChainError::InvalidAddress(raw.to_string()))
    }

    pub async fn balances(&self) -> ChainResult<AggregateBalance> {
        let mut per_chain = Vec::new();
        let mut total = 0;
        for profile in constitution::CHAIN_PROFILES {
            let raw = self.rpc.get_balance(profile.chain_id, self.vault_address).await?;
            let normalized = raw_to_money(raw, profile.token_decimals);
            total += normalized;
            per_chain.push(ChainBalance { chain_id: profile.chain_id, raw, normalized });
        }
        Ok(AggregateBalance { total, per_chain })
    }

    /// True only if the threshold is met by the aggregate AND no single
    /// chain supplies more than half of the threshold by itself — this
    /// is the resolution of the dual-chain independence Open Question in
    /// favor of requiring genuinely cross-chain solvency.
    pub async fn independence_floor_met(&self, threshold: Money) -> ChainResult<bool> {
        let agg = self.balances().await?;
        if agg.total < threshold {
            return Ok(false);
        }
        let half = threshold / 2;
        let max_single_chain = agg.per_chain.iter().map(|c| c.normalized).max().unwrap_or(0);
        Ok(max_single_chain <= half || agg.per_chain.len() == 1)
    }

    pub async fn send_payment(&self, chain_id: ChainId, to: &str, amount: Money) -> ChainResult<String> {
        let to_addr = Self::parse_address(to)?;
        let profile = chain_profile(chain_id);
        let raw = money_to_raw(amount, profile.token_decimals);
        let gas_usd = self.rpc.estimate_gas_cost_usd(chain_id).await?;
        if gas_usd * constitution::IronLaws::GAS_SAFETY_MULTIPLIER > amount as f64 / constitution::MICRO as f64 {
            warn!(target: "chain_executor", chain = chain_id.as_str(), "gas cost is disproportionate to payment size");
        }
        let hash = self.rpc.send_transaction(chain_id, to_addr, raw).await?;
        info!(target: "chain_executor", chain = chain_id.as_str(), %hash, "payment sent");
        Ok(format!("{:?}", hash))
    }
}

fn money_to_raw(amount: Money, decimals: u32) -> u128 {
    let amount = amount.max(0) as u128;
    if decimals <= 6 {
        amount / 10u128.pow(6 - decimals)
    } else {
        amount * 10u128.pow(decimals - 6)
    }
}
