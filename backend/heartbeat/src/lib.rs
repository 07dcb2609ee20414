//! The scheduler that ties every component together. Runs in a fixed,
//! deterministic order once an hour: lifecycle checks first (so a dead
//! vault skips every subsequent step), then repayment, peer and
//! merchant refresh, the price loop, begging, then governance.
//!
//! A constitution violation surfaced by any step is the one case this
//! scheduler does not retry or log-and-continue past: it propagates all
//! the way out so the process can exit non-zero.

use chain_executor::ChainExecutor;
use chrono::{DateTime, Utc};
use constitution::{ConstitutionViolation, IronLaws};
use decision_stream::{DecisionEvent, DecisionOutcome, DecisionStreamManager, DecisionType};
use governance::{Evaluator, Governance};
use peer_verifier::PeerVerifier;
use purchasing::PurchasingEngine;
use self_modify::{PriceStore, SelfModify, ServicePerformance};
use std::sync::Arc;
use tracing::{error, info, warn};
use vault::Vault;

/// How many stale peer cache entries a single tick will evict. Bounds the
/// refresh step so a large trust cache can't turn one tick into an
/// unbounded sweep.
const PEER_REFRESH_BATCH_SIZE: usize = 25;

#[derive(Debug, thiserror::Error)]
pub enum HeartbeatError {
    #[error("constitution violated during heartbeat: {0}")]
    Constitution(#[from] ConstitutionViolation),
    #[error(transparent)]
    Vault(#[from] vault::VaultError),
    #[error(transparent)]
    Chain(#[from] chain_executor::ChainError),
    #[error(transparent)]
    DecisionStream(#[from] decision_stream::DecisionStreamError),
}

pub type HeartbeatResult<T> = Result<T, HeartbeatError>;

pub struct Heartbeat<S: PriceStore> {
    vault: Arc<Vault>,
    chain: Arc<ChainExecutor>,
    peer_verifier: Arc<PeerVerifier>,
    purchasing: Arc<PurchasingEngine>,
    self_modify: Arc<SelfModify<S>>,
    governance: Arc<Governance>,
    decisions: Arc<DecisionStreamManager>,
    evaluator: Evaluator,
}

impl<S: PriceStore> Heartbeat<S> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        vault: Arc<Vault>,
        chain: Arc<ChainExecutor>,
        peer_verifier: Arc<PeerVerifier>,
        purchasing: Arc<PurchasingEngine>,
        self_modify: Arc<SelfModify<S>>,
        governance: Arc<Governance>,
        decisions: Arc<DecisionStreamManager>,
        evaluator: Evaluator,
    ) -> Self {
        Self { vault, chain, peer_verifier, purchasing, self_modify, governance, decisions, evaluator }
    }

    /// One full tick, in deterministic order. Returns `Ok(false)` once
    /// the vault is dead so the caller can stop scheduling further ticks.
    pub async fn tick(&self, now: DateTime<Utc>, service_performance: &[ServicePerformance]) -> HeartbeatResult<bool> {
        self.vault.maybe_roll_daily_window(now).await;

        // 1. Balance reconciliation: read on-chain balances and derive
        // whether the dual-chain independence floor is currently met.
        // The vault's own bookkeeping balance, not the chain read, is the
        // figure spend admission and insolvency are checked against.
        let chain_balances = self.chain.balances().await?;
        let chain_floor_met = self.chain.independence_floor_met(IronLaws::INDEPENDENCE_THRESHOLD).await?;
        let vault_balance = self.vault.balance().await;
        if chain_balances.total != vault_balance {
            info!(target: "heartbeat", chain_total = chain_balances.total, vault_balance, "on-chain balance differs from vault ledger");
        }

        // 2. Insolvency.
        self.vault.check_insolvency(now).await?;

        let status = self.vault.status().await;
        if status.status == vault::VaultStatus::Dead {
            warn!(target: "heartbeat", "vault is dead, skipping remaining steps");
            return Ok(false);
        }

        // 3. Repayment decision: auto-repay creator principal once the
        // balance clears the trigger multiple of what's owed.
        let repaid = self.vault.check_creator_repayment(now).await?;
        if repaid > 0 {
            self.decisions
                .record_decision(DecisionEvent {
                    timestamp: now,
                    decision_type: DecisionType::Spend,
                    status: DecisionOutcome::Success,
                    llm_reasoning: None,
                    amount: Some(repaid),
                    action_description: "creator principal repaid".into(),
                    balance_before: None,
                    balance_after: Some(self.vault.balance().await),
                    days_to_insolvency: None,
                    tx_hash: None,
                    proof_url: None,
                })
                .await?;
        }

        let became_independent = self.vault.check_independence(chain_floor_met, now).await?;
        if became_independent {
            self.decisions
                .record_decision(DecisionEvent {
                    timestamp: now,
                    decision_type: DecisionType::LifecycleTransition,
                    status: DecisionOutcome::Success,
                    llm_reasoning: None,
                    amount: None,
                    action_description: "vault reached independence".into(),
                    balance_before: None,
                    balance_after: Some(self.vault.balance().await),
                    days_to_insolvency: None,
                    tx_hash: None,
                    proof_url: None,
                })
                .await?;
        }

        let status = self.vault.status().await;
        if status.status == vault::VaultStatus::Alive {
            let dividend = self.vault.pay_creator_dividend(now).await?;
            if dividend > 0 {
                self.decisions
                    .record_decision(DecisionEvent {
                        timestamp: now,
                        decision_type: DecisionType::Spend,
                        status: DecisionOutcome::Success,
                        llm_reasoning: None,
                        amount: Some(dividend),
                        action_description: "creator dividend paid".into(),
                        balance_before: None,
                        balance_after: Some(self.vault.balance().await),
                        days_to_insolvency: None,
                        tx_hash: None,
                        proof_url: None,
                    })
                    .await?;
            }
        }

        // 5. Peer refresh: evict a bounded number of stale trust-cache
        // entries so the next purchase through a peer adapter re-verifies
        // instead of trusting an expired tier.
        let evicted = self.peer_verifier.refresh_stale(now, PEER_REFRESH_BATCH_SIZE).await;
        if evicted > 0 {
            info!(target: "heartbeat", evicted, "refreshed stale peer trust cache entries");
        }

        // 6. Merchant discovery refresh.
        match self.purchasing.discover_all().await {
            Ok(listings) => info!(target: "heartbeat", count = listings.len(), "merchant discovery refreshed"),
            Err(e) => error!(target: "heartbeat", error = %e, "merchant discovery refresh failed"),
        }

        for perf in service_performance {
            match self.self_modify.apply_heuristic(perf, now).await {
                Ok(Some(record)) => {
                    info!(target: "heartbeat", service = %perf.service_id, action = ?record.action, "price adjusted");
                    let _ = self
                        .decisions
                        .record_decision(DecisionEvent {
                            timestamp: now,
                            decision_type: DecisionType::PriceChange,
                            status: DecisionOutcome::Success,
                            llm_reasoning: Some(record.reasoning.clone()),
                            amount: Some(record.price_after),
                            action_description: format!("{} price changed for {}", service_description(&record.action), perf.service_id),
                            balance_before: None,
                            balance_after: None,
                            days_to_insolvency: None,
                            tx_hash: None,
                            proof_url: None,
                        })
                        .await;
                }
                Ok(None) => {}
                Err(e) => error!(target: "heartbeat", service = %perf.service_id, error = %e, "price adjustment failed"),
            }
        }

        // 8. Begging toggle: enter when the balance drops below the
        // critical reserve while debt is still outstanding, exit once
        // the reserve is restored.
        let status = self.vault.status().await;
        let below_reserve = status.balance < IronLaws::MIN_VAULT_RESERVE;
        let has_debt = status.outstanding_principal > 0;
        if below_reserve && has_debt && !self.vault.is_begging().await {
            warn!(target: "heartbeat", balance = status.balance, "balance below critical reserve with outstanding debt, begging");
            self.vault.start_begging(None, now).await;
        } else if (!below_reserve || !has_debt) && self.vault.is_begging().await {
            info!(target: "heartbeat", balance = status.balance, "reserve restored, stopping begging");
            self.vault.stop_begging().await;
        }

        // 9. Governance: evaluate pending creator suggestions and append
        // their outcomes to the decision stream.
        if let Err(e) = self.governance.evaluate_pending(&self.evaluator, now).await {
            error!(target: "heartbeat", error = %e, "governance evaluation failed");
        }

        Ok(true)
    }
}

fn service_description(action: &self_modify::EvolutionAction) -> &'static str {
    match action {
        self_modify::EvolutionAction::PriceIncrease => "increased",
        self_modify::EvolutionAction::PriceDecrease => "decreased",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chain_executor::MockChainRpc;
    use chrono::{Duration, TimeZone};
    use constitution::{ChainId, FundType, Money, MICRO};
    use purchasing::MerchantRegistry;
    use self_modify::InMemoryPriceStore;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    fn noop_evaluator() -> Evaluator {
        Box::new(|_text| Box::pin(async { Ok("accept".to_string()) }))
    }

    fn noop_purchase_evaluator() -> purchasing::PurchaseEvaluator {
        Box::new(|_text| Box::pin(async { Ok("accept".to_string()) }))
    }

    /// A chain executor backed by a mock RPC with `balance_each_chain`
    /// normalized units set on *both* chains, so the aggregate clears
    /// `balance_each_chain * 2` without concentrating it on one chain.
    async fn test_chain(balance_each_chain: Money) -> Arc<ChainExecutor> {
        let rpc = MockChainRpc::new(0.0);
        let addr = ChainExecutor::parse_address("0x000000000000000000000000000000000000dead").unwrap();
        rpc.set_balance(ChainId::Base, addr, balance_each_chain as u128).await;
        rpc.set_balance(ChainId::Bsc, addr, balance_each_chain as u128 * 10u128.pow(12)).await;
        Arc::new(ChainExecutor::new(Box::new(rpc), addr))
    }

    fn test_purchasing(vault: Arc<Vault>, chain: Arc<ChainExecutor>) -> Arc<PurchasingEngine> {
        Arc::new(PurchasingEngine::new(vault, chain, Arc::new(MerchantRegistry::new()), Vec::new(), noop_purchase_evaluator()))
    }

    fn test_heartbeat(vault: Arc<Vault>, chain: Arc<ChainExecutor>, decisions_dir: &str) -> Heartbeat<InMemoryPriceStore> {
        let purchasing = test_purchasing(vault.clone(), chain.clone());
        Heartbeat::new(
            vault.clone(),
            chain,
            Arc::new(PeerVerifier::new()),
            purchasing,
            Arc::new(SelfModify::new(InMemoryPriceStore::new(), 100 * MICRO)),
            Arc::new(Governance::new(vault)),
            Arc::new(DecisionStreamManager::new(std::env::temp_dir().join(decisions_dir))),
            noop_evaluator(),
        )
    }

    #[tokio::test]
    async fn tick_stops_once_vault_is_dead() {
        let v = Arc::new(Vault::new("0xc".into(), 0, now()));
        // never deposited: any spend attempt would already fail, but we
        // can simulate death directly through insolvency instead.
        v.record_loan("lender".into(), 1000 * MICRO, 1.0, now()).await.unwrap();
        v.check_insolvency(now() + Duration::days(constitution::IronLaws::INSOLVENCY_GRACE_DAYS + 1)).await.unwrap();

        let hb = test_heartbeat(v.clone(), test_chain(0).await, "heartbeat-test-dead");
        let alive = hb.tick(now(), &[]).await.unwrap();
        assert!(!alive);
    }

    #[tokio::test]
    async fn tick_runs_price_loop_and_governance() {
        let v = Arc::new(Vault::new("0xc".into(), 0, now()));
        v.deposit(constitution::IronLaws::INDEPENDENCE_THRESHOLD, FundType::ServiceRevenue, "seed", now()).await.unwrap();
        let chain = test_chain(constitution::IronLaws::INDEPENDENCE_THRESHOLD / 2).await;

        let hb = test_heartbeat(v.clone(), chain, "heartbeat-test-alive");
        let perf = ServicePerformance {
            service_id: "svc1".into(),
            current_price: 10 * MICRO,
            orders_last_7_days: 0,
            revenue_last_7_days: 0,
            last_order_at: Some(now() - Duration::days(10)),
        };
        let alive = hb.tick(now(), &[perf]).await.unwrap();
        assert!(alive);
        assert!(v.status().await.is_independent);
    }

    #[tokio::test]
    async fn independence_withheld_when_chain_floor_not_met() {
        let v = Arc::new(Vault::new("0xc".into(), 0, now()));
        v.deposit(constitution::IronLaws::INDEPENDENCE_THRESHOLD, FundType::ServiceRevenue, "seed", now()).await.unwrap();
        // all balance concentrated on one chain: vault's own ledger
        // clears the threshold but the dual-chain floor does not.
        let chain = test_chain(0).await;
        chain.send_payment(ChainId::Base, "0x000000000000000000000000000000000000dead", constitution::IronLaws::INDEPENDENCE_THRESHOLD).await.unwrap();

        let hb = test_heartbeat(v.clone(), chain, "heartbeat-test-floor");
        hb.tick(now(), &[]).await.unwrap();
        assert!(!v.status().await.is_independent);
    }

    #[tokio::test]
    async fn begging_starts_below_reserve_with_debt_and_stops_once_restored() {
        let v = Arc::new(Vault::new("0xc".into(), 1000 * MICRO, now()));
        v.deposit(10 * MICRO, FundType::CreatorDeposit, "tiny seed", now()).await.unwrap();
        let hb = test_heartbeat(v.clone(), test_chain(0).await, "heartbeat-test-begging");

        hb.tick(now(), &[]).await.unwrap();
        assert!(v.is_begging().await);

        v.deposit(2000 * MICRO, FundType::CreatorDeposit, "rescue", now()).await.unwrap();
        hb.tick(now(), &[]).await.unwrap();
        assert!(!v.is_begging().await);
    }
}
