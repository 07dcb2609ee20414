//! Immutable constants and enumerations for the mortal agent runtime.
//!
//! Every other crate in the workspace depends on this one and only this
//! one for shared vocabulary. Nothing here is mutable at runtime — there
//! is no process-wide singleton, only `const`/`static` data and the pure
//! functions that index into it. A breach of any rule named here (see
//! [`ConstitutionViolation`]) is fatal to the process; see
//! `heartbeat::Heartbeat::run_forever` for the single place that catches
//! and exits on it.

use serde::{Deserialize, Serialize};

/// Internal ledger unit: fixed-point at 6 decimals (1_000_000 == 1.00 of
/// the display currency). Chain-specific decimals (Base: 6, BSC: 18) are
/// normalized to this unit at the `chain-executor` boundary, never inside
/// the vault, cost guard, or purchasing engine.
pub type Money = i64;

pub const MICRO: Money = 1_000_000;

/// A breach of a hardcoded rule. Not meant to be caught anywhere except
/// the outermost driver, which logs it and exits non-zero.
#[derive(Debug, thiserror::Error)]
#[error("constitution violated: {rule} ({detail})")]
pub struct ConstitutionViolation {
    pub rule: &'static str,
    pub detail: String,
}

/// Panics the iron-law check into a typed error instead of an exception;
/// callers propagate it with `?` and the outermost driver is the only
/// place that treats it as fatal.
pub fn enforce(ok: bool, rule: &'static str, detail: impl Into<String>) -> Result<(), ConstitutionViolation> {
    if ok {
        Ok(())
    } else {
        Err(ConstitutionViolation { rule, detail: detail.into() })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeathCause {
    BalanceZero,
    Insolvency,
    ConstitutionViolation,
    ManualShutdown,
}

impl DeathCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeathCause::BalanceZero => "vault_balance_reached_zero",
            DeathCause::Insolvency => "insolvency",
            DeathCause::ConstitutionViolation => "iron_law_violated",
            DeathCause::ManualShutdown => "creator_emergency_shutdown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FundType {
    CreatorDeposit,
    ServiceRevenue,
    CampaignRevenue,
    LoanReceived,
    Donation,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpendType {
    ApiCost,
    GasFee,
    CreatorRepayment,
    CreatorDividend,
    IndependencePayout,
    LoanRepayment,
    ServiceRefund,
    Infrastructure,
    InsolvencyLiquidation,
    PeerPurchase,
}

/// Graduated peer trust, ordered so that `as u8` comparisons mean what
/// they look like (`tier >= TrustTier::Structural` etc.).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum TrustTier {
    Banned = 0,
    Unverified = 1,
    Structural = 2,
    Verified = 3,
    Behavioral = 4,
    HighTrust = 5,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeploymentMethod {
    Factory,
    Creator,
    Migrated,
    Unknown,
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChainId {
    Base,
    Bsc,
}

impl ChainId {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChainId::Base => "base",
            ChainId::Bsc => "bsc",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "base" => Some(ChainId::Base),
            "bsc" => Some(ChainId::Bsc),
            _ => None,
        }
    }
}

/// Per-chain token precision, so the executor can convert raw on-chain
/// balances to the vault's 6-decimal `Money` without losing or
/// fabricating precision.
#[derive(Debug, Clone, Copy)]
pub struct ChainProfile {
    pub chain_id: ChainId,
    pub token_decimals: u32,
}

pub const CHAIN_PROFILES: &[ChainProfile] = &[
    ChainProfile { chain_id: ChainId::Base, token_decimals: 6 },
    ChainProfile { chain_id: ChainId::Bsc, token_decimals: 18 },
];

pub fn chain_profile(chain_id: ChainId) -> ChainProfile {
    CHAIN_PROFILES
        .iter()
        .copied()
        .find(|p| p.chain_id == chain_id)
        .expect("every ChainId has a profile")
}

/// Convert a raw on-chain integer balance (at the chain's native
/// decimals) into the vault's 6-decimal `Money` unit.
pub fn raw_to_money(raw: u128, decimals: u32) -> Money {
    if decimals <= 6 {
        (raw * 10u128.pow(6 - decimals)) as Money
    } else {
        (raw / 10u128.pow(decimals - 6)) as Money
    }
}

// ============================================================
// IRON LAWS — spec.md section 6
// ============================================================

pub struct IronLaws;

impl IronLaws {
    pub const MAX_DAILY_SPEND_RATIO: f64 = 0.50;
    pub const MAX_SINGLE_SPEND_RATIO: f64 = 0.30;
    pub const DEATH_THRESHOLD: Money = 0;
    pub const MIN_VAULT_RESERVE: Money = 50 * MICRO;
    pub const SURVIVAL_MODE_THRESHOLD: Money = 100 * MICRO;
    pub const INSOLVENCY_GRACE_DAYS: i64 = 28;
    pub const INSOLVENCY_TOLERANCE: f64 = 0.01;
    pub const INDEPENDENCE_THRESHOLD: Money = 1_000_000 * MICRO;
    pub const INDEPENDENCE_PAYOUT_RATIO: f64 = 0.30;
    pub const RENOUNCE_PAYOUT_RATIO: f64 = 0.20;
    pub const CREATOR_DIVIDEND_RATE: f64 = 0.10;
    pub const CREATOR_PRINCIPAL_MULTIPLIER: f64 = 2.0;
    pub const MAX_SINGLE_CALL_COST: Money = MICRO / 2; // $0.50
    pub const MAX_COST_REVENUE_RATIO: f64 = 0.30;
    pub const PRICE_SPIKE_RATIO: f64 = 3.0;
    pub const PRICE_SPIKE_WINDOW_HOURS: i64 = 24;
    pub const API_BUDGET_FLOOR: Money = 2 * MICRO;
    pub const API_BUDGET_CEILING: Money = 500 * MICRO;
    pub const SURVIVAL_MODE_API_RATIO: f64 = 0.005;
    pub const MAX_SINGLE_PURCHASE: Money = 50 * MICRO;
    pub const PEER_VERIFICATION_CACHE_TTL_SECS: i64 = 3600;
    pub const PEER_MIN_BALANCE: Money = 300 * MICRO;
    pub const PEER_NONCE_ANOMALY_RATIO: f64 = 3.0;
    pub const PEER_MIN_AUTONOMY_SCORE: f64 = 0.6;
    pub const PEER_HIGH_TRUST_MIN_DAYS: i64 = 7;
    pub const PEER_HIGH_TRUST_AUTONOMY_SCORE: f64 = 0.8;
    pub const INVALID_KEY_ORIGIN_STRIKE_THRESHOLD: u32 = 3;
    pub const TRUSTED_DOMAIN_ACTIVATION_DELAY_SECS: i64 = 300;
    pub const MAX_SINGLE_ORDER: Money = 100 * MICRO;
    pub const EXPECTED_GRACE_DAYS: i64 = 28; // what a genuine peer constitution must report
    pub const PEER_PRICE_INFLATION_TOLERANCE: f64 = 1.05;
    pub const ORDER_EXPIRY_FLOOR_SECS: i64 = 1800;
    pub const GAS_SAFETY_MULTIPLIER: f64 = 1.20;
}

// ============================================================
// MODEL TIERS — CostGuard routing table
// ============================================================

#[derive(Debug, Clone, Copy)]
pub struct ModelTier {
    pub level: u8,
    pub name: &'static str,
    pub provider: &'static str,
    pub model: &'static str,
    pub max_tokens: u32,
    pub temperature: f32,
    pub daily_budget_base: Money,
    pub daily_budget_rate: f64,
    pub max_rpm: u32,
    pub balance_floor: Money,
}

pub const MODEL_TIERS: &[ModelTier] = &[
    ModelTier {
        level: 1, name: "survival", provider: "gemini", model: "gemini-2.5-flash",
        max_tokens: 512, temperature: 0.3,
        daily_budget_base: 2 * MICRO, daily_budget_rate: 0.02,
        max_rpm: 10, balance_floor: 0,
    },
    ModelTier {
        level: 2, name: "bootstrap", provider: "gemini", model: "gemini-2.5-flash",
        max_tokens: 1024, temperature: 0.4,
        daily_budget_base: 5 * MICRO, daily_budget_rate: 0.05,
        max_rpm: 20, balance_floor: 50 * MICRO,
    },
    ModelTier {
        level: 3, name: "growing", provider: "openrouter", model: "anthropic/claude-3.5-haiku",
        max_tokens: 2048, temperature: 0.5,
        daily_budget_base: 10 * MICRO, daily_budget_rate: 0.10,
        max_rpm: 30, balance_floor: 200 * MICRO,
    },
    ModelTier {
        level: 4, name: "established", provider: "openrouter", model: "anthropic/claude-3.5-sonnet",
        max_tokens: 4096, temperature: 0.6,
        daily_budget_base: 25 * MICRO, daily_budget_rate: 0.15,
        max_rpm: 60, balance_floor: 500 * MICRO,
    },
    ModelTier {
        level: 5, name: "thriving", provider: "openrouter", model: "anthropic/claude-3.5-sonnet",
        max_tokens: 8192, temperature: 0.7,
        daily_budget_base: 50 * MICRO, daily_budget_rate: 0.20,
        max_rpm: 120, balance_floor: 2000 * MICRO,
    },
];

/// Map a vault balance to the appropriate tier. Balances below every
/// floor still land on tier 1 (the lowest floor is 0).
pub fn model_tier_for_balance(balance: Money) -> ModelTier {
    MODEL_TIERS
        .iter()
        .rev()
        .find(|t| balance >= t.balance_floor)
        .copied()
        .unwrap_or(MODEL_TIERS[0])
}

pub fn model_tier_by_level(level: u8) -> Option<ModelTier> {
    MODEL_TIERS.iter().copied().find(|t| t.level == level)
}

/// Tiers 1-2 round-robin between the primary tier provider and this
/// cheap/free secondary rather than always hitting the same endpoint.
pub const LOAD_BALANCE_MAX_TIER: u8 = 2;
pub const LOAD_BALANCE_SECONDARY_PROVIDER: &str = "deepseek";
pub const LOAD_BALANCE_SECONDARY_MODEL: &str = "deepseek-chat";

/// `provider -> ordered fallback chain`. Walked in order until one is
/// available; the tier's token budget and temperature are preserved.
pub fn fallback_chain(provider: &str) -> &'static [&'static str] {
    match provider {
        "gemini" => &["deepseek", "openrouter"],
        "deepseek" => &["gemini", "openrouter"],
        "openrouter" => &["gemini", "deepseek"],
        _ => &["ollama"],
    }
}

pub fn default_model_for_provider(provider: &str) -> &'static str {
    match provider {
        "gemini" => "gemini-2.5-flash",
        "deepseek" => "deepseek-chat",
        "openrouter" => "anthropic/claude-3.5-haiku",
        "ollama" => "llama3.1",
        _ => "gemini-2.5-flash",
    }
}

// ============================================================
// MERCHANTS — constitutional allow-lists
// ============================================================

/// A merchant whose payment address is fixed at compile time.
#[derive(Debug, Clone, Copy)]
pub struct KnownMerchant {
    pub merchant_id: &'static str,
    pub adapter_id: &'static str,
    pub chain_id: ChainId,
    pub address: &'static str,
    pub max_single: Money,
}

/// A merchant whose trust anchor is a DNS domain; its payment address is
/// discovered at request time and must be registered with the
/// `MerchantRegistry` before it can be paid.
#[derive(Debug, Clone, Copy)]
pub struct TrustedDomain {
    pub merchant_id: &'static str,
    pub adapter_id: &'static str,
    pub chain_id: ChainId,
    pub domain: &'static str,
    pub max_single: Money,
}

pub const KNOWN_MERCHANTS: &[KnownMerchant] = &[
    KnownMerchant {
        merchant_id: "coingecko_x402",
        adapter_id: "x402",
        chain_id: ChainId::Base,
        address: "0x1111111111111111111111111111111111111a",
        max_single: 5 * MICRO,
    },
];

pub const TRUSTED_DOMAINS: &[TrustedDomain] = &[
    TrustedDomain {
        merchant_id: "bitrefill",
        adapter_id: "gift_card",
        chain_id: ChainId::Base,
        domain: "api.bitrefill.com",
        max_single: 30 * MICRO,
    },
    TrustedDomain {
        merchant_id: "coingecko_x402",
        adapter_id: "x402",
        chain_id: ChainId::Base,
        domain: "api.coingecko.com",
        max_single: 5 * MICRO,
    },
];

pub fn known_merchant(merchant_id: &str) -> Option<KnownMerchant> {
    KNOWN_MERCHANTS.iter().copied().find(|m| m.merchant_id == merchant_id)
}

pub fn trusted_domain(merchant_id: &str) -> Option<TrustedDomain> {
    TRUSTED_DOMAINS.iter().copied().find(|d| d.merchant_id == merchant_id)
}

/// Known-good deployed bytecode hashes for peer vault contracts
/// (check 8). A peer whose bytecode hash is absent here simply doesn't
/// reach `TrustTier::Verified`; it is not treated as malicious.
pub const KNOWN_VAULT_BYTECODE_HASHES: &[&str] = &[
    "vault_v1_9f2e1c",
    "vault_v2_4ab7de",
    "vault_v3_77c0aa",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_for_zero_balance_is_survival() {
        assert_eq!(model_tier_for_balance(0).level, 1);
    }

    #[test]
    fn tier_climbs_with_balance() {
        assert_eq!(model_tier_for_balance(3000 * MICRO).level, 5);
        assert_eq!(model_tier_for_balance(250 * MICRO).level, 3);
    }

    #[test]
    fn raw_to_money_normalizes_decimals() {
        // 1 token at 18 decimals -> 1_000_000 micro-units
        assert_eq!(raw_to_money(1_000_000_000_000_000_000u128, 18), MICRO);
        // 1 token at 6 decimals -> 1_000_000 micro-units
        assert_eq!(raw_to_money(1_000_000u128, 6), MICRO);
    }

    #[test]
    fn trust_tier_ordering() {
        assert!(TrustTier::HighTrust > TrustTier::Behavioral);
        assert!(TrustTier::Behavioral > TrustTier::Structural);
        assert!(TrustTier::Banned < TrustTier::Unverified);
    }
}
