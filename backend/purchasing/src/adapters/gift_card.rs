//! Bitrefill-style gift-card adapter: buys prepaid cards and top-ups
//! through a single trusted-domain anchor, requires an API key to be
//! configured at all, and treats the redemption code as the delivery
//! payload.

use super::{AdapterError, AdapterResult, DeliveryResult, DeliveryStatus, MerchantAdapter, OrderQuote, ServiceListing};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use constitution::{trusted_domain, IronLaws, Money};
use serde::Deserialize;

const MERCHANT_ID: &str = "bitrefill";

const RELEVANT_CATEGORIES: &[&str] = &["gift-cards", "mobile-topups", "esims"];

#[derive(Debug, Deserialize)]
struct ProductListing {
    products: Vec<Product>,
}

#[derive(Debug, Deserialize)]
struct Product {
    id: String,
    name: String,
    category: String,
    min_usd: f64,
}

#[derive(Debug, Deserialize)]
struct InvoiceResponse {
    invoice_id: String,
    payment_address: String,
    amount_usd: f64,
}

#[derive(Debug, Deserialize)]
struct RedemptionResponse {
    status: String,
    redemption_code: Option<String>,
}

pub struct GiftCardAdapter {
    http: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
}

impl GiftCardAdapter {
    pub fn new(http: reqwest::Client, api_key: Option<String>) -> Self {
        Self { http, api_key, base_url: "https://api.bitrefill.com/v2".to_string() }
    }

    pub fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    fn require_key(&self) -> AdapterResult<&str> {
        self.api_key.as_deref().ok_or_else(|| AdapterError::NotConfigured(MERCHANT_ID.to_string()))
    }
}

#[async_trait]
impl MerchantAdapter for GiftCardAdapter {
    fn adapter_id(&self) -> &'static str {
        "gift_card"
    }

    async fn discover_services(&self) -> AdapterResult<Vec<ServiceListing>> {
        let key = self.require_key()?;
        let resp = self
            .http
            .get(format!("{}/products", self.base_url))
            .bearer_auth(key)
            .send()
            .await
            .map_err(|e| AdapterError::Http(e.to_string()))?;
        let listing: ProductListing = resp.json().await.map_err(|e| AdapterError::Http(e.to_string()))?;

        Ok(listing
            .products
            .into_iter()
            .filter(|p| RELEVANT_CATEGORIES.contains(&p.category.as_str()))
            .map(|p| ServiceListing {
                merchant_id: MERCHANT_ID.to_string(),
                service_id: p.id,
                description: p.name,
                price: (p.min_usd * constitution::MICRO as f64) as Money,
            })
            .collect())
    }

    async fn create_order(&self, service_id: &str, expected_amount: Money) -> AdapterResult<OrderQuote> {
        let key = self.require_key()?;
        let domain = trusted_domain(MERCHANT_ID).ok_or_else(|| AdapterError::NotConfigured(MERCHANT_ID.to_string()))?;

        let resp = self
            .http
            .post(format!("{}/invoices", self.base_url))
            .bearer_auth(key)
            .json(&serde_json::json!({ "product_id": service_id }))
            .send()
            .await
            .map_err(|e| AdapterError::Http(e.to_string()))?;
        let invoice: InvoiceResponse = resp.json().await.map_err(|e| AdapterError::Http(e.to_string()))?;

        let amount = (invoice.amount_usd * constitution::MICRO as f64) as Money;
        if amount > (expected_amount as f64 * IronLaws::PEER_PRICE_INFLATION_TOLERANCE) as Money || amount > domain.max_single {
            return Err(AdapterError::PriceInflated { quoted: amount, expected: expected_amount });
        }

        Ok(OrderQuote {
            order_id: invoice.invoice_id,
            merchant_id: MERCHANT_ID.to_string(),
            // the invoice's own address is registered against the
            // trusted domain anchor, not trusted on its own terms
            payment_address: invoice.payment_address,
            amount,
            expires_at: Utc::now() + Duration::seconds(IronLaws::ORDER_EXPIRY_FLOOR_SECS),
        })
    }

    async fn verify_delivery(&self, order_id: &str, _tx_hash: &str) -> AdapterResult<DeliveryResult> {
        let key = self.require_key()?;
        let resp = self
            .http
            .get(format!("{}/invoices/{order_id}", self.base_url))
            .bearer_auth(key)
            .send()
            .await
            .map_err(|e| AdapterError::Http(e.to_string()))?;
        let redemption: RedemptionResponse = resp.json().await.map_err(|e| AdapterError::Http(e.to_string()))?;

        let status = match redemption.status.as_str() {
            "pending" | "processing" => DeliveryStatus::Pending,
            "paid" => DeliveryStatus::PaymentPending,
            "fulfilled" | "delivered" => DeliveryStatus::Fulfilled,
            "expired" => DeliveryStatus::Expired,
            "cancelled" => DeliveryStatus::Cancelled,
            _ => DeliveryStatus::Failed,
        };

        if status == DeliveryStatus::Fulfilled && redemption.redemption_code.as_deref().unwrap_or("").len() < 4 {
            return Err(AdapterError::SuspiciousDelivery("fulfilled invoice carries no usable redemption code".into()));
        }

        Ok(DeliveryResult { status, payload: redemption.redemption_code })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unconfigured_adapter_reports_not_configured() {
        let adapter = GiftCardAdapter::new(reqwest::Client::new(), None);
        assert!(!adapter.is_configured());
        assert!(adapter.require_key().is_err());
    }
}
