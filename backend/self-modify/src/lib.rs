//! Daily heuristic price loop. The only surviving piece of the original
//! self-modification system: adjusting a service's own price up or down
//! based on recent order volume, with every change appended to an
//! on-disk evolution log and verified by reading the price back after
//! writing it. Code-generation style self-modification is out of scope.

use chrono::{DateTime, Utc};
use constitution::{IronLaws, Money};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum SelfModifyError {
    #[error("unknown service: {0}")]
    UnknownService(String),
    #[error("price change failed to persist: {0}")]
    PersistFailed(String),
}

pub type SelfModifyResult<T> = Result<T, SelfModifyError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EvolutionAction {
    PriceIncrease,
    PriceDecrease,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvolutionRecord {
    pub service_id: String,
    pub action: EvolutionAction,
    pub price_before: Money,
    pub price_after: Money,
    pub reasoning: String,
    pub at: DateTime<Utc>,
    pub verified_on_disk: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServicePerformance {
    pub service_id: String,
    pub current_price: Money,
    pub orders_last_7_days: u32,
    pub revenue_last_7_days: Money,
    pub last_order_at: Option<DateTime<Utc>>,
}

impl ServicePerformance {
    pub fn revenue_per_order(&self) -> f64 {
        if self.orders_last_7_days == 0 {
            0.0
        } else {
            self.revenue_last_7_days as f64 / self.orders_last_7_days as f64
        }
    }

    pub fn days_since_last_order(&self, now: DateTime<Utc>) -> Option<i64> {
        self.last_order_at.map(|t| now.signed_duration_since(t).num_days())
    }

    fn orders_per_day(&self) -> f64 {
        self.orders_last_7_days as f64 / 7.0
    }
}

const PRICE_CUT_RATIO: f64 = 0.80;
const PRICE_RAISE_RATIO: f64 = 1.10;
const NO_ORDER_DAYS_THRESHOLD: i64 = 7;
const HIGH_DEMAND_ORDERS_PER_DAY: f64 = 5.0;
const MIN_PRICE: Money = constitution::MICRO; // $1.00 floor

/// Persists price changes; split out so tests can substitute an
/// in-memory store instead of real disk I/O.
pub trait PriceStore: Send + Sync {
    fn write(&self, service_id: &str, price: Money) -> SelfModifyResult<()>;
    fn read(&self, service_id: &str) -> SelfModifyResult<Option<Money>>;
}

pub struct InMemoryPriceStore {
    prices: RwLock<HashMap<String, Money>>,
}

impl InMemoryPriceStore {
    pub fn new() -> Self {
        Self { prices: RwLock::new(HashMap::new()) }
    }
}

impl Default for InMemoryPriceStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PriceStore for InMemoryPriceStore {
    fn write(&self, service_id: &str, price: Money) -> SelfModifyResult<()> {
        self.prices.blocking_write().insert(service_id.to_string(), price);
        Ok(())
    }

    fn read(&self, service_id: &str) -> SelfModifyResult<Option<Money>> {
        Ok(self.prices.blocking_read().get(service_id).copied())
    }
}

pub struct SelfModify<S: PriceStore> {
    store: S,
    evolution_log: RwLock<Vec<EvolutionRecord>>,
    max_price: Money,
}

const MAX_EVOLUTION_LOG: usize = 500;

impl<S: PriceStore> SelfModify<S> {
    pub fn new(store: S, max_price: Money) -> Self {
        Self { store, evolution_log: RwLock::new(Vec::new()), max_price }
    }

    /// The two-rule heuristic: a week with no orders cuts the price 20%
    /// (floored); five-plus orders a day raises it 10% (ceiled at the
    /// service's configured maximum).
    pub fn heuristic_pricing(&self, perf: &ServicePerformance, now: DateTime<Utc>) -> Option<(EvolutionAction, Money)> {
        if perf.days_since_last_order(now).unwrap_or(0) >= NO_ORDER_DAYS_THRESHOLD {
            let new_price = ((perf.current_price as f64 * PRICE_CUT_RATIO) as Money).max(MIN_PRICE);
            if new_price < perf.current_price {
                return Some((EvolutionAction::PriceDecrease, new_price));
            }
        }
        if perf.orders_per_day() >= HIGH_DEMAND_ORDERS_PER_DAY {
            let new_price = ((perf.current_price as f64 * PRICE_RAISE_RATIO) as Money).min(self.max_price);
            if new_price > perf.current_price {
                return Some((EvolutionAction::PriceIncrease, new_price));
            }
        }
        None
    }

    pub async fn apply_heuristic(&self, perf: &ServicePerformance, now: DateTime<Utc>) -> SelfModifyResult<Option<EvolutionRecord>> {
        let Some((action, new_price)) = self.heuristic_pricing(perf, now) else { return Ok(None) };
        self.apply_price_change(&perf.service_id, perf.current_price, new_price, action, now).await.map(Some)
    }

    async fn apply_price_change(&self, service_id: &str, price_before: Money, price_after: Money, action: EvolutionAction, now: DateTime<Utc>) -> SelfModifyResult<EvolutionRecord> {
        self.store.write(service_id, price_after)?;
        let verified = self.store.read(service_id)?.map(|p| p == price_after).unwrap_or(false);
        if verified {
            info!(target: "self_modify", service_id, price_after, "price persisted and verified on disk");
        } else {
            warn!(target: "self_modify", service_id, "price change not persisted");
        }

        let reasoning = match action {
            EvolutionAction::PriceDecrease => format!("no orders for {NO_ORDER_DAYS_THRESHOLD}+ days, cutting price to stimulate demand"),
            EvolutionAction::PriceIncrease => format!("demand exceeds {HIGH_DEMAND_ORDERS_PER_DAY}/day, raising price"),
        };

        let record = EvolutionRecord { service_id: service_id.to_string(), action, price_before, price_after, reasoning, at: now, verified_on_disk: verified };
        let mut log = self.evolution_log.write().await;
        log.push(record.clone());
        while log.len() > MAX_EVOLUTION_LOG {
            log.remove(0);
        }
        Ok(record)
    }

    pub async fn evolution_log(&self) -> Vec<EvolutionRecord> {
        self.evolution_log.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    fn perf(price: Money, orders: u32, last_order: Option<DateTime<Utc>>) -> ServicePerformance {
        ServicePerformance { service_id: "svc1".into(), current_price: price, orders_last_7_days: orders, revenue_last_7_days: price * orders as i64, last_order_at: last_order }
    }

    #[tokio::test]
    async fn no_orders_for_a_week_cuts_price() {
        let sm = SelfModify::new(InMemoryPriceStore::new(), 100 * constitution::MICRO);
        let p = perf(10 * constitution::MICRO, 0, Some(now() - Duration::days(8)));
        let record = sm.apply_heuristic(&p, now()).await.unwrap().unwrap();
        assert_eq!(record.action, EvolutionAction::PriceDecrease);
        assert_eq!(record.price_after, (10.0 * 0.8 * constitution::MICRO as f64) as Money);
        assert!(record.verified_on_disk);
    }

    #[tokio::test]
    async fn price_cut_floors_at_minimum() {
        let sm = SelfModify::new(InMemoryPriceStore::new(), 100 * constitution::MICRO);
        let p = perf(constitution::MICRO, 0, Some(now() - Duration::days(10)));
        let record = sm.apply_heuristic(&p, now()).await.unwrap().unwrap();
        assert_eq!(record.price_after, MIN_PRICE);
    }

    #[tokio::test]
    async fn high_demand_raises_price_ceiled_at_max() {
        let sm = SelfModify::new(InMemoryPriceStore::new(), 11 * constitution::MICRO);
        let p = perf(10 * constitution::MICRO, 40, Some(now()));
        let record = sm.apply_heuristic(&p, now()).await.unwrap().unwrap();
        assert_eq!(record.action, EvolutionAction::PriceIncrease);
        assert_eq!(record.price_after, 11 * constitution::MICRO);
    }

    #[tokio::test]
    async fn steady_state_does_not_trigger_evolution() {
        let sm = SelfModify::new(InMemoryPriceStore::new(), 100 * constitution::MICRO);
        let p = perf(10 * constitution::MICRO, 3, Some(now() - Duration::days(1)));
        assert!(sm.apply_heuristic(&p, now()).await.unwrap().is_none());
    }
}
