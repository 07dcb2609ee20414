//! x402 (HTTP 402 Payment Required) adapter: a small hardcoded catalog
//! of machine-payable endpoints, each anchored to a known merchant or a
//! trusted domain. The anti-phishing check here is the domain anchor:
//! the response's payment address is only trusted if it was served from
//! the domain the catalog entry names, never from wherever a redirect or
//! a compromised DNS record might point.

use super::{AdapterError, AdapterResult, DeliveryResult, DeliveryStatus, MerchantAdapter, OrderQuote, ServiceListing};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use constitution::{known_merchant, trusted_domain, IronLaws, Money};
use serde::Deserialize;
use serde_json::Value;

struct X402Endpoint {
    merchant_id: &'static str,
    service_id: &'static str,
    description: &'static str,
    url: &'static str,
    max_single_usd: f64,
}

const X402_ENDPOINTS: &[X402Endpoint] = &[X402Endpoint {
    merchant_id: "coingecko_x402",
    service_id: "coingecko_price_feed",
    description: "Spot price lookup via x402-metered endpoint",
    url: "https://api.coingecko.com/x402/price",
    max_single_usd: 0.05,
}];

#[derive(Debug, Deserialize)]
struct PaymentAccept {
    pay_to: String,
    amount: String,
    #[serde(default)]
    asset: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CanonicalX402Body {
    accepts: Vec<PaymentAccept>,
}

pub struct X402Adapter {
    http: reqwest::Client,
}

impl X402Adapter {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    fn domain_of(url: &str) -> Option<&str> {
        let rest = url.split("://").nth(1)?;
        Some(rest.split('/').next().unwrap_or(rest))
    }

    /// Verifies the quoted payment address is anchored to the expected
    /// merchant/domain, never trusting an address sourced from anywhere
    /// else in the response.
    fn anchor_address(&self, endpoint: &X402Endpoint, response_domain: &str) -> AdapterResult<String> {
        if let Some(merchant) = known_merchant(endpoint.merchant_id) {
            return Ok(merchant.address.to_string());
        }
        if let Some(domain) = trusted_domain(endpoint.merchant_id) {
            if domain.domain != response_domain {
                return Err(AdapterError::UntrustedPaymentAddress);
            }
            return Ok(format!("pending-registration:{}", domain.domain));
        }
        Err(AdapterError::NotConfigured(endpoint.merchant_id.to_string()))
    }

    fn parse_402_body(&self, endpoint: &X402Endpoint, body: &[u8], header_amount: Option<&str>) -> AdapterResult<(String, Money)> {
        // 1. canonical `{"accepts": [...]}` body
        if let Ok(canonical) = serde_json::from_slice::<CanonicalX402Body>(body) {
            if let Some(accept) = canonical.accepts.into_iter().next() {
                let amount = Self::parse_amount(&accept.amount, endpoint.max_single_usd);
                return Ok((accept.pay_to, amount));
            }
        }
        // 2. flat-body fallback: {"pay_to": ..., "amount": ...}
        if let Ok(flat) = serde_json::from_slice::<Value>(body) {
            if let (Some(pay_to), Some(amount)) = (flat.get("pay_to").and_then(Value::as_str), flat.get("amount")) {
                let amount_str = amount.as_str().map(str::to_string).unwrap_or_else(|| amount.to_string());
                let amount = Self::parse_amount(&amount_str, endpoint.max_single_usd);
                return Ok((pay_to.to_string(), amount));
            }
        }
        // 3. legacy header fallback
        if let Some(amount_str) = header_amount {
            let amount = Self::parse_amount(amount_str, endpoint.max_single_usd);
            return Ok((known_merchant(endpoint.merchant_id).map(|m| m.address.to_string()).unwrap_or_default(), amount));
        }
        Err(AdapterError::Http("could not parse 402 payment requirements".into()))
    }

    /// If the parsed float exceeds the endpoint's known max, it's almost
    /// certainly a raw base-unit integer (e.g. micro-dollars), not a
    /// dollar amount; divide down.
    fn parse_amount(raw: &str, max_single_usd: f64) -> Money {
        let value: f64 = raw.parse().unwrap_or(0.0);
        let usd = if value > max_single_usd * 10.0 { value / 1_000_000.0 } else { value };
        (usd * constitution::MICRO as f64) as Money
    }
}

#[async_trait]
impl MerchantAdapter for X402Adapter {
    fn adapter_id(&self) -> &'static str {
        "x402"
    }

    async fn discover_services(&self) -> AdapterResult<Vec<ServiceListing>> {
        Ok(X402_ENDPOINTS
            .iter()
            .map(|e| ServiceListing {
                merchant_id: e.merchant_id.to_string(),
                service_id: e.service_id.to_string(),
                description: e.description.to_string(),
                price: (e.max_single_usd * constitution::MICRO as f64) as Money,
            })
            .collect())
    }

    async fn create_order(&self, service_id: &str, expected_amount: Money) -> AdapterResult<OrderQuote> {
        let endpoint = X402_ENDPOINTS
            .iter()
            .find(|e| e.service_id == service_id)
            .ok_or_else(|| AdapterError::NotConfigured(service_id.to_string()))?;

        let resp = self.http.get(endpoint.url).send().await.map_err(|e| AdapterError::Http(e.to_string()))?;
        let header_amount = resp.headers().get("x-payment-amount").and_then(|v| v.to_str().ok()).map(str::to_string);
        let response_domain = Self::domain_of(resp.url().as_str()).unwrap_or_default().to_string();
        let body = resp.bytes().await.map_err(|e| AdapterError::Http(e.to_string()))?;

        let (_quoted_address, amount) = self.parse_402_body(endpoint, &body, header_amount.as_deref())?;
        let anchored_address = self.anchor_address(endpoint, &response_domain)?;

        if amount > (expected_amount as f64 * IronLaws::PEER_PRICE_INFLATION_TOLERANCE) as Money {
            return Err(AdapterError::PriceInflated { quoted: amount, expected: expected_amount });
        }

        Ok(OrderQuote {
            order_id: uuid::Uuid::new_v4().to_string(),
            merchant_id: endpoint.merchant_id.to_string(),
            payment_address: anchored_address,
            amount,
            expires_at: Utc::now() + Duration::seconds(IronLaws::ORDER_EXPIRY_FLOOR_SECS),
        })
    }

    async fn verify_delivery(&self, _order_id: &str, tx_hash: &str) -> AdapterResult<DeliveryResult> {
        // Retrying the original request with the payment tx hash as a
        // header is how x402 endpoints release the paid-for resource.
        let endpoint = &X402_ENDPOINTS[0];
        let resp = self
            .http
            .get(endpoint.url)
            .header("x-payment-tx-hash", tx_hash)
            .send()
            .await
            .map_err(|e| AdapterError::Http(e.to_string()))?;
        if resp.status().is_success() {
            let payload = resp.text().await.unwrap_or_default();
            Ok(DeliveryResult { status: DeliveryStatus::Delivered, payload: Some(payload) })
        } else if resp.status().as_u16() == 402 {
            Ok(DeliveryResult { status: DeliveryStatus::PaymentPending, payload: None })
        } else {
            Ok(DeliveryResult { status: DeliveryStatus::Failed, payload: None })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amount_heuristic_detects_raw_base_units() {
        // max_single_usd 0.05 -> threshold 0.5; "50000" (micro-dollars
        // for $0.05) should be divided down to 0.05 usd.
        let money = X402Adapter::parse_amount("50000", 0.05);
        assert_eq!(money, (0.05 * constitution::MICRO as f64) as Money);
    }

    #[test]
    fn amount_heuristic_keeps_plain_dollar_values() {
        let money = X402Adapter::parse_amount("0.02", 0.05);
        assert_eq!(money, (0.02 * constitution::MICRO as f64) as Money);
    }

    #[test]
    fn domain_of_extracts_host() {
        assert_eq!(X402Adapter::domain_of("https://api.coingecko.com/x402/price"), Some("api.coingecko.com"));
    }
}
