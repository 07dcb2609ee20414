//! Tier-driven LLM provider routing and the cost admission pipeline that
//! keeps API spend from being the thing that kills the vault.

use chrono::{DateTime, Duration, Utc};
use constitution::{model_tier_for_balance, IronLaws, ModelTier, Money, MICRO};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use vault::Vault;

#[derive(Debug, thiserror::Error)]
pub enum CostGuardError {
    #[error("daily API budget of {cap} exhausted ({spent} spent)")]
    DailyCapExceeded { spent: Money, cap: Money },
    #[error("single call cost {cost} exceeds the hard per-call ceiling of {ceiling}")]
    PerCallCeilingBreached { cost: Money, ceiling: Money },
    #[error("provider {provider} shows a price spike: {ratio:.2}x its 24h average")]
    PriceSpike { provider: String, ratio: f64 },
    #[error("cost/revenue ratio {ratio:.2} exceeds the maximum of {max:.2}")]
    CostRevenueRatioExceeded { ratio: f64, max: f64 },
    #[error("rate limit exceeded for provider {0}")]
    RateLimited(String),
    #[error(transparent)]
    Vault(#[from] vault::VaultError),
}

pub type CostGuardResult<T> = Result<T, CostGuardError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingResult {
    pub provider: String,
    pub model: String,
    pub tier_level: u8,
    pub max_tokens: u32,
    pub temperature: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostRecord {
    pub provider: String,
    pub cost: Money,
    pub revenue_attributed: Money,
    pub at: DateTime<Utc>,
}

#[derive(Default)]
struct ProviderState {
    call_timestamps: Vec<DateTime<Utc>>,
    round_robin_counter: u64,
    cost_history: Vec<CostRecord>,
}

pub struct CostGuard {
    vault: std::sync::Arc<Vault>,
    providers: RwLock<HashMap<String, ProviderState>>,
}

impl CostGuard {
    pub fn new(vault: std::sync::Arc<Vault>) -> Self {
        Self { vault, providers: RwLock::new(HashMap::new()) }
    }

    /// Selects a tier from the current balance, then a provider within
    /// that tier, load-balancing round-robin across providers for the two
    /// cheapest tiers and otherwise preferring the tier's designated
    /// provider.
    pub async fn route(&self) -> CostGuardResult<RoutingResult> {
        let balance = self.vault.balance().await;
        let tier = model_tier_for_balance(balance);
        let provider = if tier.level <= constitution::LOAD_BALANCE_MAX_TIER {
            self.load_balance_pick(&tier).await
        } else {
            tier.provider.to_string()
        };
        let model = constitution::default_model_for_provider(&provider).to_string();
        Ok(RoutingResult { provider, model, tier_level: tier.level, max_tokens: tier.max_tokens, temperature: tier.temperature })
    }

    async fn load_balance_pick(&self, tier: &ModelTier) -> String {
        let mut providers = self.providers.write().await;
        let entry = providers.entry(tier.provider.to_string()).or_default();
        entry.round_robin_counter += 1;
        if entry.round_robin_counter % 2 == 0 {
            constitution::LOAD_BALANCE_SECONDARY_PROVIDER.to_string()
        } else {
            tier.provider.to_string()
        }
    }

    pub fn daily_cap(&self, balance: Money, tier: &ModelTier) -> Money {
        let survival_override = (balance as f64 * IronLaws::SURVIVAL_MODE_API_RATIO) as Money;
        let formula = tier.daily_budget_base + ((balance / 100) as f64 * tier.daily_budget_rate) as Money;
        let raw = if balance <= IronLaws::SURVIVAL_MODE_THRESHOLD { survival_override.max(formula) } else { formula };
        raw.clamp(IronLaws::API_BUDGET_FLOOR, IronLaws::API_BUDGET_CEILING)
    }

    /// The unified admission check that must pass before any LLM call is
    /// placed: per-call ceiling (fatal), daily cap, price spike,
    /// cost/revenue ratio, rate limit, then the vault's own admission.
    ///
    /// The per-call ceiling is a hard stop. The other three budget checks
    /// (daily cap, price spike, cost/revenue ratio) trigger a fallback walk:
    /// first the provider's compile-time fallback chain, then the cheapest
    /// available provider as a last resort. Returns the provider the call
    /// was actually admitted under, which may differ from `provider`.
    pub async fn pre_check(&self, provider: &str, estimated_cost: Money, attributed_revenue: Money, now: DateTime<Utc>) -> CostGuardResult<String> {
        if estimated_cost > IronLaws::MAX_SINGLE_CALL_COST {
            return Err(CostGuardError::PerCallCeilingBreached { cost: estimated_cost, ceiling: IronLaws::MAX_SINGLE_CALL_COST });
        }

        let mut candidates = vec![provider.to_string()];
        for fallback in constitution::fallback_chain(provider) {
            if !candidates.iter().any(|c| c == fallback) {
                candidates.push(fallback.to_string());
            }
        }
        let (cheapest, _) = self.cheapest_available();
        if !candidates.iter().any(|c| c == cheapest) {
            candidates.push(cheapest.to_string());
        }

        let mut last_err = None;
        for candidate in &candidates {
            match self.budget_check(candidate, estimated_cost, attributed_revenue, now).await {
                Ok(()) => {
                    let tier = model_tier_for_balance(self.vault.balance().await);
                    self.check_rate_limit(candidate, &tier, now).await?;
                    self.vault.can_spend(estimated_cost).await?;
                    if candidate != provider {
                        tracing::warn!(target: "cost_guard", from = provider, to = %candidate, "falling back to cheaper provider");
                    }
                    return Ok(candidate.clone());
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.expect("candidates is never empty"))
    }

    /// Daily cap, price spike, and cost/revenue ratio checks for a single
    /// candidate provider, with no rate-limit or vault side effects.
    async fn budget_check(&self, provider: &str, estimated_cost: Money, attributed_revenue: Money, now: DateTime<Utc>) -> CostGuardResult<()> {
        let balance = self.vault.balance().await;
        let tier = model_tier_for_balance(balance);
        let cap = self.daily_cap(balance, &tier);

        let spent_today = self.spent_since(provider, now - Duration::hours(24)).await;
        if spent_today + estimated_cost > cap {
            return Err(CostGuardError::DailyCapExceeded { spent: spent_today, cap });
        }

        if let Some(ratio) = self.price_spike_ratio(provider, estimated_cost).await {
            if ratio >= IronLaws::PRICE_SPIKE_RATIO {
                return Err(CostGuardError::PriceSpike { provider: provider.to_string(), ratio });
            }
        }

        if attributed_revenue > 0 {
            let ratio = estimated_cost as f64 / attributed_revenue as f64;
            if ratio > IronLaws::MAX_COST_REVENUE_RATIO {
                return Err(CostGuardError::CostRevenueRatioExceeded { ratio, max: IronLaws::MAX_COST_REVENUE_RATIO });
            }
        }

        Ok(())
    }

    async fn check_rate_limit(&self, provider: &str, tier: &ModelTier, now: DateTime<Utc>) -> CostGuardResult<()> {
        let mut providers = self.providers.write().await;
        let entry = providers.entry(provider.to_string()).or_default();
        entry.call_timestamps.retain(|t| now.signed_duration_since(*t) < Duration::seconds(60));
        if entry.call_timestamps.len() as u32 >= tier.max_rpm {
            return Err(CostGuardError::RateLimited(provider.to_string()));
        }
        entry.call_timestamps.push(now);
        Ok(())
    }

    async fn price_spike_ratio(&self, provider: &str, cost: Money) -> Option<f64> {
        let providers = self.providers.read().await;
        let history = &providers.get(provider)?.cost_history;
        if history.is_empty() {
            return None;
        }
        let avg: f64 = history.iter().map(|r| r.cost as f64).sum::<f64>() / history.len() as f64;
        if avg <= 0.0 {
            return None;
        }
        Some(cost as f64 / avg)
    }

    async fn spent_since(&self, provider: &str, since: DateTime<Utc>) -> Money {
        let providers = self.providers.read().await;
        providers
            .get(provider)
            .map(|p| p.cost_history.iter().filter(|r| r.at >= since).map(|r| r.cost).sum())
            .unwrap_or(0)
    }

    pub async fn record_cost(&self, provider: &str, cost: Money, revenue_attributed: Money, now: DateTime<Utc>) {
        let mut providers = self.providers.write().await;
        let entry = providers.entry(provider.to_string()).or_default();
        entry.cost_history.push(CostRecord { provider: provider.to_string(), cost, revenue_attributed, at: now });
        let cutoff = now - Duration::days(7);
        entry.cost_history.retain(|r| r.at >= cutoff);
    }

    /// The cheapest currently-available provider/model pair, used by the
    /// purchasing engine when it needs an LLM call but isn't tied to the
    /// tier-selected default (e.g. the governance evaluator).
    pub fn cheapest_available(&self) -> (&'static str, &'static str) {
        ("gemini", "gemini-2.5-flash")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use constitution::FundType;
    use std::sync::Arc;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    async fn vault_with_balance(balance: Money) -> Arc<Vault> {
        let v = Arc::new(Vault::new("0xcreator".into(), 0, now()));
        v.deposit(balance, FundType::CreatorDeposit, "seed", now()).await.unwrap();
        v.maybe_roll_daily_window(now() + Duration::hours(25)).await;
        v
    }

    #[tokio::test]
    async fn per_call_ceiling_is_fatal_regardless_of_balance() {
        let v = vault_with_balance(10_000 * MICRO).await;
        let guard = CostGuard::new(v);
        let result = guard.pre_check("gemini", IronLaws::MAX_SINGLE_CALL_COST + 1, 0, now()).await;
        assert!(matches!(result, Err(CostGuardError::PerCallCeilingBreached { .. })));
    }

    #[tokio::test]
    async fn daily_cap_grows_with_balance() {
        let v_small = vault_with_balance(10 * MICRO).await;
        let v_big = vault_with_balance(10_000 * MICRO).await;
        let guard_small = CostGuard::new(v_small.clone());
        let guard_big = CostGuard::new(v_big.clone());
        let cap_small = guard_small.daily_cap(v_small.balance().await, &model_tier_for_balance(v_small.balance().await));
        let cap_big = guard_big.daily_cap(v_big.balance().await, &model_tier_for_balance(v_big.balance().await));
        assert!(cap_big >= cap_small);
    }

    #[tokio::test]
    async fn price_spike_falls_back_to_a_cheaper_provider() {
        let v = vault_with_balance(10_000 * MICRO).await;
        let guard = CostGuard::new(v);
        for _ in 0..5 {
            guard.record_cost("gemini", MICRO / 100, MICRO / 10, now()).await;
        }
        let result = guard.pre_check("gemini", (MICRO as f64 * 0.05) as Money, 0, now()).await;
        let admitted = result.expect("fallback chain has providers with no spike history");
        assert_ne!(admitted, "gemini");
        assert!(constitution::fallback_chain("gemini").contains(&admitted.as_str()));
    }

    #[tokio::test]
    async fn cost_revenue_ratio_enforced_even_through_fallback() {
        let v = vault_with_balance(10_000 * MICRO).await;
        let guard = CostGuard::new(v);
        let result = guard.pre_check("gemini", MICRO / 10, MICRO / 100, now()).await;
        assert!(matches!(result, Err(CostGuardError::CostRevenueRatioExceeded { .. })));
    }

    #[tokio::test]
    async fn rate_limit_enforced_within_window() {
        let v = vault_with_balance(10 * MICRO).await;
        let guard = CostGuard::new(v);
        let tier = model_tier_for_balance(10 * MICRO);
        for _ in 0..tier.max_rpm {
            guard.check_rate_limit("gemini", &tier, now()).await.unwrap();
        }
        let result = guard.check_rate_limit("gemini", &tier, now()).await;
        assert!(matches!(result, Err(CostGuardError::RateLimited(_))));
    }
}
