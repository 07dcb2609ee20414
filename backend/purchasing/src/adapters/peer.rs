//! Peer-to-peer adapter: buys services from other agents whose vaults
//! have been independently verified by [`peer_verifier::PeerVerifier`].
//!
//! The one invariant this adapter exists to enforce: the payment address
//! is *always* the address the trust cache verified on-chain, never the
//! address a peer's own `/menu` or `/order` response claims to be. A
//! compromised or malicious peer can lie about where to send money; it
//! cannot lie about which address the verifier already attested to.

use super::{AdapterError, AdapterResult, DeliveryResult, DeliveryStatus, MerchantAdapter, OrderQuote, ServiceListing};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use constitution::{IronLaws, Money, TrustTier};
use peer_verifier::PeerVerifier;
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
struct MenuResponse {
    services: Vec<MenuEntry>,
}

#[derive(Debug, Deserialize)]
struct MenuEntry {
    service_id: String,
    description: String,
    price_usd: f64,
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    order_id: String,
    amount_usd: f64,
    // Intentionally never read: the protocol lets a peer suggest a
    // payment address, but this adapter discards it in favor of the
    // verified vault address from the trust cache.
    #[allow(dead_code)]
    payment_address: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PeerOrderStatus {
    status: String,
    payload: Option<String>,
}

pub struct PeerAdapter {
    verifier: Arc<PeerVerifier>,
    http: reqwest::Client,
}

impl PeerAdapter {
    pub fn new(verifier: Arc<PeerVerifier>, http: reqwest::Client) -> Self {
        Self { verifier, http }
    }

    fn merchant_id_for(address: &str) -> String {
        format!("peer_{}", &address[..address.len().min(10)])
    }
}

#[async_trait]
impl MerchantAdapter for PeerAdapter {
    fn adapter_id(&self) -> &'static str {
        "peer"
    }

    async fn discover_services(&self) -> AdapterResult<Vec<ServiceListing>> {
        let trusted = self.verifier.trusted_peers(TrustTier::Behavioral).await;
        let mut top: Vec<_> = trusted;
        top.sort_by(|a, b| b.tier.cmp(&a.tier).then(b.autonomy_score.partial_cmp(&a.autonomy_score).unwrap_or(std::cmp::Ordering::Equal)));
        top.truncate(10);

        let mut listings = Vec::new();
        for peer in top {
            let Some(url) = self.verifier.peer_url(&peer.address).await else { continue };
            let resp = self.http.get(format!("{url}/menu")).send().await.map_err(|e| AdapterError::Http(e.to_string()))?;
            let menu: MenuResponse = resp.json().await.map_err(|e| AdapterError::Http(e.to_string()))?;
            for entry in menu.services {
                listings.push(ServiceListing {
                    merchant_id: Self::merchant_id_for(&peer.address),
                    service_id: entry.service_id,
                    description: entry.description,
                    price: (entry.price_usd * constitution::MICRO as f64) as Money,
                });
            }
        }
        Ok(listings)
    }

    async fn create_order(&self, service_id: &str, expected_amount: Money) -> AdapterResult<OrderQuote> {
        let trusted = self.verifier.trusted_peers(TrustTier::Behavioral).await;
        let peer = trusted
            .into_iter()
            .find(|p| Self::merchant_id_for(&p.address) == service_id)
            .ok_or_else(|| AdapterError::NotConfigured(service_id.to_string()))?;

        let url = self.verifier.peer_url(&peer.address).await.ok_or_else(|| AdapterError::NotConfigured(peer.address.clone()))?;
        let resp = self
            .http
            .post(format!("{url}/order"))
            .json(&serde_json::json!({ "service_id": service_id }))
            .send()
            .await
            .map_err(|e| AdapterError::Http(e.to_string()))?;
        let order: OrderResponse = resp.json().await.map_err(|e| AdapterError::Http(e.to_string()))?;

        let quoted = (order.amount_usd * constitution::MICRO as f64) as Money;
        let ceiling = (expected_amount as f64 * IronLaws::PEER_PRICE_INFLATION_TOLERANCE) as Money;
        if quoted > ceiling || quoted > IronLaws::MAX_SINGLE_PURCHASE {
            return Err(AdapterError::PriceInflated { quoted, expected: expected_amount });
        }

        Ok(OrderQuote {
            order_id: order.order_id,
            merchant_id: Self::merchant_id_for(&peer.address),
            payment_address: peer.address, // verified address, never order.payment_address
            amount: quoted,
            expires_at: Utc::now() + Duration::seconds(IronLaws::ORDER_EXPIRY_FLOOR_SECS),
        })
    }

    async fn verify_delivery(&self, order_id: &str, _tx_hash: &str) -> AdapterResult<DeliveryResult> {
        // order_id alone doesn't carry the peer's base URL; callers are
        // expected to keep the quote around and re-resolve it, but for a
        // stateless recheck we accept a merchant-qualified order id of
        // the form "<merchant_id>:<remote_order_id>".
        let Some((merchant_id, remote_id)) = order_id.split_once(':') else {
            return Err(AdapterError::Http("malformed peer order id".into()));
        };
        let trusted = self.verifier.trusted_peers(TrustTier::Behavioral).await;
        let peer = trusted
            .into_iter()
            .find(|p| Self::merchant_id_for(&p.address) == merchant_id)
            .ok_or_else(|| AdapterError::NotConfigured(merchant_id.to_string()))?;
        let url = self.verifier.peer_url(&peer.address).await.ok_or_else(|| AdapterError::NotConfigured(peer.address.clone()))?;

        let resp = self.http.get(format!("{url}/order/{remote_id}")).send().await.map_err(|e| AdapterError::Http(e.to_string()))?;
        let status: PeerOrderStatus = resp.json().await.map_err(|e| AdapterError::Http(e.to_string()))?;

        let parsed = match status.status.as_str() {
            "pending" | "processing" | "payment_pending" => DeliveryStatus::Pending,
            "completed" => DeliveryStatus::Completed,
            "delivered" => DeliveryStatus::Delivered,
            "fulfilled" => DeliveryStatus::Fulfilled,
            "expired" => DeliveryStatus::Expired,
            "cancelled" => DeliveryStatus::Cancelled,
            _ => DeliveryStatus::Failed,
        };

        if parsed == DeliveryStatus::Delivered || parsed == DeliveryStatus::Fulfilled {
            let payload_len = status.payload.as_deref().unwrap_or("").trim().len();
            if payload_len < 4 {
                return Err(AdapterError::SuspiciousDelivery("peer reported delivered with an empty or near-empty payload".into()));
            }
        }

        Ok(DeliveryResult { status: parsed, payload: status.payload })
    }
}
