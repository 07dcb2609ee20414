pub mod peer;
pub mod x402;
pub mod gift_card;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use constitution::Money;

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("merchant not configured: {0}")]
    NotConfigured(String),
    #[error("quoted amount {quoted} exceeds the allowed inflation over expected {expected}")]
    PriceInflated { quoted: Money, expected: Money },
    #[error("payment address did not come from the verified trust anchor")]
    UntrustedPaymentAddress,
    #[error("http error: {0}")]
    Http(String),
    #[error("delivery looks suspicious: {0}")]
    SuspiciousDelivery(String),
}

pub type AdapterResult<T> = Result<T, AdapterError>;

#[derive(Debug, Clone)]
pub struct ServiceListing {
    pub merchant_id: String,
    pub service_id: String,
    pub description: String,
    pub price: Money,
}

#[derive(Debug, Clone)]
pub struct OrderQuote {
    pub order_id: String,
    pub merchant_id: String,
    pub payment_address: String,
    pub amount: Money,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryStatus {
    Pending,
    Processing,
    PaymentPending,
    Completed,
    Delivered,
    Fulfilled,
    Expired,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone)]
pub struct DeliveryResult {
    pub status: DeliveryStatus,
    pub payload: Option<String>,
}

/// Every merchant integration implements this so the purchasing engine
/// never has to branch on adapter identity outside of admission/routing.
#[async_trait]
pub trait MerchantAdapter: Send + Sync {
    fn adapter_id(&self) -> &'static str;
    async fn discover_services(&self) -> AdapterResult<Vec<ServiceListing>>;
    async fn create_order(&self, service_id: &str, expected_amount: Money) -> AdapterResult<OrderQuote>;
    async fn verify_delivery(&self, order_id: &str, tx_hash: &str) -> AdapterResult<DeliveryResult>;
}
