//! The agent's ledger and treasury: balances, spend admission, and the
//! one-way lifecycle transitions (independent, renounced, dead).
//!
//! State lives behind a single `RwLock`; every public method takes the
//! lock for the shortest span that correctness allows and never holds it
//! across an `.await` on another component.

use chrono::{DateTime, Utc};
use constitution::{DeathCause, FundType, IronLaws, Money, SpendType, MICRO};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::RwLock;
use tracing::{info, warn};

const SCHEMA_VERSION: u32 = 1;
const MAX_RECENT_TRANSACTIONS: usize = 200;

#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("insufficient balance: have {have}, need {need}")]
    InsufficientBalance { have: Money, need: Money },
    #[error("spend of {amount} exceeds daily admission of {limit}")]
    DailyLimitExceeded { amount: Money, limit: Money },
    #[error("single spend of {amount} exceeds per-call ceiling of {limit}")]
    SingleSpendExceeded { amount: Money, limit: Money },
    #[error("vault is dead (cause: {0:?}), no further spends admitted")]
    VaultDead(DeathCause),
    #[error("action requires independence, vault has not reached it")]
    NotIndependent,
    #[error("action requires a living, non-independent vault under creator control")]
    NotUnderCreatorControl,
    #[error("lender {lender} has no outstanding balance")]
    UnknownLender { lender: String },
    #[error("{0}")]
    Io(String),
}

pub type VaultResult<T> = Result<T, VaultError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VaultStatus {
    Alive,
    Independent,
    Renounced,
    Dead,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: uuid::Uuid,
    pub timestamp: DateTime<Utc>,
    pub fund_type: Option<FundType>,
    pub spend_type: Option<SpendType>,
    pub amount: Money,
    pub balance_after: Money,
    pub description: String,
    pub tx_hash: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoanRecord {
    pub lender: String,
    pub principal: Money,
    pub repaid: Money,
    pub bps_multiplier: f64,
    pub received_at: DateTime<Utc>,
}

impl LoanRecord {
    pub fn outstanding(&self) -> Money {
        let owed = (self.principal as f64 * self.bps_multiplier).round() as Money;
        (owed - self.repaid).max(0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeggingState {
    pub active: bool,
    pub message: String,
    pub started_at: Option<DateTime<Utc>>,
}

impl Default for BeggingState {
    fn default() -> Self {
        Self { active: false, message: String::new(), started_at: None }
    }
}

const DEFAULT_BEGGING_MESSAGE: &str =
    "This agent is running low on funds and cannot currently pay its own way. \
     Any deposit to its vault keeps it alive a little longer.";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct VaultState {
    schema_version: u32,
    balance: Money,
    api_topup_balance: Money,
    creator_address: String,
    creator_principal: Money,
    creator_principal_repaid: Money,
    creator_principal_cleared: bool,
    creator_wallet_addresses: Vec<String>,
    status: VaultStatus,
    death_cause: Option<DeathCause>,
    died_at: Option<DateTime<Utc>>,
    creator_renounced: bool,
    is_independent: bool,
    independent_since: Option<DateTime<Utc>>,
    insolvent_since: Option<DateTime<Utc>>,
    daily_limit_base: Money,
    daily_limit_reset_at: DateTime<Utc>,
    daily_spent: Money,
    net_profit_lifetime: Money,
    profit_since_last_dividend: Money,
    dividends_paid_lifetime: Money,
    loans: Vec<LoanRecord>,
    begging: BeggingState,
    transactions: VecDeque<Transaction>,
}

impl VaultState {
    fn new(creator_address: String, creator_principal: Money, now: DateTime<Utc>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            balance: 0,
            api_topup_balance: 0,
            creator_wallet_addresses: vec![creator_address.clone()],
            creator_address,
            creator_principal,
            creator_principal_repaid: 0,
            creator_principal_cleared: creator_principal <= 0,
            status: VaultStatus::Alive,
            death_cause: None,
            died_at: None,
            creator_renounced: false,
            is_independent: false,
            independent_since: None,
            insolvent_since: None,
            daily_limit_base: 0,
            daily_limit_reset_at: now,
            daily_spent: 0,
            net_profit_lifetime: 0,
            profit_since_last_dividend: 0,
            dividends_paid_lifetime: 0,
            loans: Vec::new(),
            begging: BeggingState::default(),
            transactions: VecDeque::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct VaultStatusSnapshot {
    pub balance: Money,
    pub status: VaultStatus,
    pub is_independent: bool,
    pub creator_renounced: bool,
    pub daily_limit_base: Money,
    pub daily_spent: Money,
    pub days_to_insolvency: Option<i64>,
    pub outstanding_principal: Money,
}

pub struct Vault {
    state: RwLock<VaultState>,
}

impl Vault {
    pub fn new(creator_address: String, creator_principal: Money, now: DateTime<Utc>) -> Self {
        Self { state: RwLock::new(VaultState::new(creator_address, creator_principal, now)) }
    }

    pub fn from_snapshot_json(json: &str) -> VaultResult<Self> {
        let state: VaultState = serde_json::from_str(json).map_err(|e| VaultError::Io(e.to_string()))?;
        Ok(Self { state: RwLock::new(state) })
    }

    pub async fn to_snapshot_json(&self) -> VaultResult<String> {
        let state = self.state.read().await;
        serde_json::to_string_pretty(&*state).map_err(|e| VaultError::Io(e.to_string()))
    }

    /// Resets `daily_limit_base` to the *current* balance at the start of
    /// a new spend day. The base is held fixed for the rest of the day so
    /// admission checks don't oscillate as the balance itself moves from
    /// the spends they're gating.
    pub async fn maybe_roll_daily_window(&self, now: DateTime<Utc>) {
        let mut state = self.state.write().await;
        if now.signed_duration_since(state.daily_limit_reset_at).num_hours() >= 24 {
            state.daily_limit_base = state.balance;
            state.daily_limit_reset_at = now;
            state.daily_spent = 0;
        }
    }

    pub async fn balance(&self) -> Money {
        self.state.read().await.balance
    }

    pub async fn status(&self) -> VaultStatusSnapshot {
        let state = self.state.read().await;
        let outstanding: Money = state.loans.iter().map(|l| l.outstanding()).sum::<Money>() + creator_principal_outstanding(&state);
        let days_to_insolvency = state.insolvent_since.map(|since| {
            let elapsed = Utc::now().signed_duration_since(since).num_days();
            (IronLaws::INSOLVENCY_GRACE_DAYS - elapsed).max(0)
        });
        VaultStatusSnapshot {
            balance: state.balance,
            status: state.status,
            is_independent: state.is_independent,
            creator_renounced: state.creator_renounced,
            daily_limit_base: state.daily_limit_base,
            daily_spent: state.daily_spent,
            days_to_insolvency,
            outstanding_principal: outstanding,
        }
    }

    pub async fn recent_transactions(&self, limit: usize) -> Vec<Transaction> {
        let state = self.state.read().await;
        state.transactions.iter().rev().take(limit).cloned().collect()
    }

    pub async fn repayment_queue(&self) -> Vec<LoanRecord> {
        let mut state = self.state.write().await;
        state.loans.sort_by_key(|l| l.received_at);
        state.loans.iter().filter(|l| l.outstanding() > 0).cloned().collect()
    }

    pub async fn is_creator_wallet(&self, address: &str) -> bool {
        self.state.read().await.creator_wallet_addresses.iter().any(|a| a == address)
    }

    /// Before independence the creator pays API cost only, not the
    /// service's marked-up price.
    pub async fn creator_service_price(&self, caller: &str, api_cost: Money, marked_up_price: Money) -> Money {
        let state = self.state.read().await;
        if !state.is_independent && self.is_creator_wallet(caller).await {
            api_cost
        } else {
            marked_up_price
        }
    }

    // ---------------- fund intake ----------------

    pub async fn deposit(&self, amount: Money, fund_type: FundType, description: impl Into<String>, now: DateTime<Utc>) -> VaultResult<()> {
        if amount <= 0 {
            return Err(VaultError::Io("deposit amount must be positive".into()));
        }
        let mut state = self.state.write().await;
        if state.status == VaultStatus::Dead {
            return Err(VaultError::VaultDead(state.death_cause.unwrap_or(DeathCause::BalanceZero)));
        }
        state.balance += amount;
        if matches!(fund_type, FundType::LoanReceived) {
            // caller records the loan separately via record_loan
        }
        push_tx(&mut state, amount, Some(fund_type), None, description, None, now);
        // A deposit can cure insolvency.
        if state.insolvent_since.is_some() {
            let outstanding: Money = state.loans.iter().map(|l| l.outstanding()).sum::<Money>() + creator_principal_outstanding(&state);
            if !is_insolvent(outstanding, state.balance) {
                state.insolvent_since = None;
                info!(target: "vault", "insolvency cured by deposit");
            }
        }
        Ok(())
    }

    pub async fn deposit_api_topup(&self, amount: Money, now: DateTime<Utc>) -> VaultResult<()> {
        if amount <= 0 {
            return Err(VaultError::Io("top-up amount must be positive".into()));
        }
        let mut state = self.state.write().await;
        state.api_topup_balance += amount;
        state.balance += amount;
        push_tx(&mut state, amount, Some(FundType::CreatorDeposit), None, "api budget top-up", None, now);
        Ok(())
    }

    pub async fn record_loan(&self, lender: String, principal: Money, bps_multiplier: f64, now: DateTime<Utc>) -> VaultResult<()> {
        let mut state = self.state.write().await;
        state.loans.push(LoanRecord { lender, principal, repaid: 0, bps_multiplier, received_at: now });
        Ok(())
    }

    // ---------------- spend admission ----------------

    /// Check whether `amount` may be spent right now, without mutating
    /// state. Callers that also need to record the spend should call
    /// [`Vault::record_spend`] afterward; the two are split because some
    /// callers (CostGuard's pre-check) need the admission decision before
    /// the actual cost of an in-flight call is known.
    pub async fn can_spend(&self, amount: Money) -> VaultResult<()> {
        let state = self.state.read().await;
        if state.status == VaultStatus::Dead {
            return Err(VaultError::VaultDead(state.death_cause.unwrap_or(DeathCause::BalanceZero)));
        }
        if amount > state.balance {
            return Err(VaultError::InsufficientBalance { have: state.balance, need: amount });
        }
        let single_cap = (state.balance as f64 * IronLaws::MAX_SINGLE_SPEND_RATIO) as Money;
        if amount > single_cap {
            return Err(VaultError::SingleSpendExceeded { amount, limit: single_cap });
        }
        let daily_cap = (state.daily_limit_base as f64 * IronLaws::MAX_DAILY_SPEND_RATIO) as Money;
        let topup_room = state.api_topup_balance;
        if state.daily_spent + amount > daily_cap + topup_room {
            return Err(VaultError::DailyLimitExceeded { amount, limit: daily_cap + topup_room });
        }
        Ok(())
    }

    /// Debit the vault for a completed spend and run the post-spend
    /// lifecycle checks (balance-zero death, insolvency window).
    pub async fn record_spend(&self, amount: Money, spend_type: SpendType, description: impl Into<String>, tx_hash: Option<String>, now: DateTime<Utc>) -> VaultResult<()> {
        self.can_spend(amount).await?;
        let mut state = self.state.write().await;
        let from_topup = amount.min(state.api_topup_balance);
        state.api_topup_balance -= from_topup;
        state.daily_spent += amount - from_topup;
        state.balance -= amount;
        push_tx(&mut state, -amount, None, Some(spend_type), description, tx_hash, now);

        if state.balance <= IronLaws::DEATH_THRESHOLD {
            kill(&mut state, DeathCause::BalanceZero, now);
            return Ok(());
        }
        Ok(())
    }

    // ---------------- insolvency ----------------

    /// Recompute insolvency against the current balance and loan book;
    /// starts or clears the grace-period clock, and liquidates if the
    /// clock has expired. Called once per heartbeat tick.
    pub async fn check_insolvency(&self, now: DateTime<Utc>) -> VaultResult<()> {
        let mut state = self.state.write().await;
        if state.status == VaultStatus::Dead {
            return Ok(());
        }
        let outstanding: Money = state.loans.iter().map(|l| l.outstanding()).sum::<Money>() + creator_principal_outstanding(&state);
        let insolvent = is_insolvent(outstanding, state.balance);

        if insolvent {
            if state.insolvent_since.is_none() {
                state.insolvent_since = Some(now);
                warn!(target: "vault", outstanding, balance = state.balance, "entered insolvency grace period");
            } else {
                let since = state.insolvent_since.unwrap();
                let elapsed_days = now.signed_duration_since(since).num_days();
                if elapsed_days >= IronLaws::INSOLVENCY_GRACE_DAYS {
                    // Mark dead BEFORE transferring remaining funds: the
                    // death transition must not be reachable through a
                    // callback triggered by the transfer itself.
                    let remaining = state.balance;
                    kill(&mut state, DeathCause::Insolvency, now);
                    if remaining > 0 {
                        state.balance = 0;
                        push_tx(&mut state, -remaining, None, Some(SpendType::InsolvencyLiquidation), "insolvency liquidation", None, now);
                    }
                }
            }
        } else {
            state.insolvent_since = None;
        }
        Ok(())
    }

    // ---------------- creator principal repayment ----------------

    /// Pays down up to `amount` of the outstanding creator principal from
    /// the current balance, capped at what's actually owed. Returns the
    /// amount actually repaid. Sets `creator_principal_cleared` once the
    /// full principal has been repaid; that flag never reverts.
    pub async fn repay_principal_partial(&self, amount: Money, now: DateTime<Utc>) -> VaultResult<Money> {
        if amount <= 0 {
            return Ok(0);
        }
        let mut state = self.state.write().await;
        if state.status == VaultStatus::Dead {
            return Err(VaultError::VaultDead(state.death_cause.unwrap_or(DeathCause::BalanceZero)));
        }
        let owed = creator_principal_outstanding(&state);
        let repayment = amount.min(owed).min(state.balance).max(0);
        if repayment == 0 {
            return Ok(0);
        }
        state.balance -= repayment;
        state.creator_principal_repaid += repayment;
        if state.creator_principal_repaid >= state.creator_principal {
            state.creator_principal_cleared = true;
        }
        push_tx(&mut state, -repayment, None, Some(SpendType::CreatorRepayment), "creator principal repayment", None, now);
        Ok(repayment)
    }

    /// Auto-repayment gate, run once per heartbeat tick: once the balance
    /// comfortably clears a multiple of the outstanding principal, pay it
    /// off in full rather than let it sit as a permanent insolvency risk.
    /// No-op once the principal is cleared or the creator no longer
    /// controls the vault.
    pub async fn check_creator_repayment(&self, now: DateTime<Utc>) -> VaultResult<Money> {
        let (owed, balance, eligible) = {
            let state = self.state.read().await;
            (creator_principal_outstanding(&state), state.balance, state.status == VaultStatus::Alive)
        };
        if !eligible || owed == 0 {
            return Ok(0);
        }
        let trigger = (owed as f64 * IronLaws::CREATOR_PRINCIPAL_MULTIPLIER) as Money;
        if balance < trigger {
            return Ok(0);
        }
        self.repay_principal_partial(owed, now).await
    }

    // ---------------- lifecycle: independence / renunciation ----------------

    /// `chain_floor_met` additionally requires that on-chain balances
    /// clear the independence floor across chains (no single chain
    /// supplying more than half the aggregate), not just the vault's own
    /// bookkeeping balance.
    pub async fn check_independence(&self, chain_floor_met: bool, now: DateTime<Utc>) -> VaultResult<bool> {
        let mut state = self.state.write().await;
        if state.is_independent || state.status != VaultStatus::Alive {
            return Ok(state.is_independent);
        }
        if state.balance < IronLaws::INDEPENDENCE_THRESHOLD || !chain_floor_met {
            return Ok(false);
        }
        let payout = (state.balance as f64 * IronLaws::INDEPENDENCE_PAYOUT_RATIO) as Money;
        state.is_independent = true;
        state.independent_since = Some(now);
        state.status = VaultStatus::Independent;
        state.balance -= payout;
        push_tx(&mut state, -payout, None, Some(SpendType::IndependencePayout), "independence payout to creator", None, now);
        info!(target: "vault", payout, "vault reached independence");
        Ok(true)
    }

    /// A creator-initiated early exit below the independence threshold.
    /// Mirrors the coupling in the original ledger: renouncing control
    /// also flips `is_independent`, since there is no longer a creator in
    /// the loop to gate spend decisions on.
    pub async fn creator_renounce(&self, now: DateTime<Utc>) -> VaultResult<Money> {
        let mut state = self.state.write().await;
        if state.status != VaultStatus::Alive {
            return Err(VaultError::NotUnderCreatorControl);
        }
        if state.creator_renounced {
            return Err(VaultError::NotUnderCreatorControl);
        }
        let payout = (state.balance as f64 * IronLaws::RENOUNCE_PAYOUT_RATIO) as Money;
        state.creator_renounced = true;
        state.is_independent = true;
        state.status = VaultStatus::Renounced;
        state.independent_since = Some(now);
        state.balance -= payout;
        push_tx(&mut state, -payout, None, Some(SpendType::IndependencePayout), "creator renounce payout", None, now);
        Ok(payout)
    }

    /// Pay a dividend to the creator, only once principal is cleared and
    /// only while the creator still controls the vault. 10% of profit
    /// accrued since the last dividend, capped at 10% of current balance;
    /// the period counter resets to zero on every payout.
    pub async fn pay_creator_dividend(&self, now: DateTime<Utc>) -> VaultResult<Money> {
        let mut state = self.state.write().await;
        if state.status != VaultStatus::Alive {
            return Err(VaultError::VaultDead(state.death_cause.unwrap_or(DeathCause::BalanceZero)));
        }
        if !state.creator_principal_cleared || state.is_independent {
            return Ok(0);
        }
        let from_profit = (state.profit_since_last_dividend as f64 * IronLaws::CREATOR_DIVIDEND_RATE) as Money;
        let from_balance = (state.balance as f64 * IronLaws::CREATOR_DIVIDEND_RATE) as Money;
        let dividend = from_profit.min(from_balance).max(0).min(state.balance);
        if dividend == 0 {
            return Ok(0);
        }
        state.balance -= dividend;
        state.dividends_paid_lifetime += dividend;
        state.profit_since_last_dividend = 0;
        push_tx(&mut state, -dividend, None, Some(SpendType::CreatorDividend), "creator dividend", None, now);
        Ok(dividend)
    }

    pub async fn record_net_profit(&self, amount: Money) {
        let mut state = self.state.write().await;
        state.net_profit_lifetime += amount;
        state.profit_since_last_dividend += amount;
    }

    // ---------------- begging ----------------

    pub async fn start_begging(&self, message: Option<String>, now: DateTime<Utc>) {
        let mut state = self.state.write().await;
        state.begging = BeggingState {
            active: true,
            message: message.unwrap_or_else(|| DEFAULT_BEGGING_MESSAGE.to_string()),
            started_at: Some(now),
        };
    }

    pub async fn stop_begging(&self) {
        let mut state = self.state.write().await;
        state.begging = BeggingState::default();
    }

    pub async fn is_begging(&self) -> bool {
        self.state.read().await.begging.active
    }
}

fn is_insolvent(outstanding: Money, balance: Money) -> bool {
    outstanding as f64 > balance as f64 * (1.0 + IronLaws::INSOLVENCY_TOLERANCE)
}

/// Plain `principal - repaid`, not multiplied: `CREATOR_PRINCIPAL_MULTIPLIER`
/// only gates when auto-repayment triggers, it is not a debt multiplier.
/// Forced to zero once cleared or once the creator no longer controls the
/// vault, so independence/renounce permanently retires this debt.
fn creator_principal_outstanding(state: &VaultState) -> Money {
    if state.creator_principal_cleared || state.is_independent || state.creator_renounced {
        return 0;
    }
    (state.creator_principal - state.creator_principal_repaid).max(0)
}

fn kill(state: &mut VaultState, cause: DeathCause, now: DateTime<Utc>) {
    state.status = VaultStatus::Dead;
    state.death_cause = Some(cause);
    state.died_at = Some(now);
    warn!(target: "vault", cause = cause.as_str(), "vault died");
}

#[allow(clippy::too_many_arguments)]
fn push_tx(
    state: &mut VaultState,
    amount: Money,
    fund_type: Option<FundType>,
    spend_type: Option<SpendType>,
    description: impl Into<String>,
    tx_hash: Option<String>,
    now: DateTime<Utc>,
) {
    let tx = Transaction {
        id: uuid::Uuid::new_v4(),
        timestamp: now,
        fund_type,
        spend_type,
        amount,
        balance_after: state.balance,
        description: description.into(),
        tx_hash,
    };
    state.transactions.push_back(tx);
    while state.transactions.len() > MAX_RECENT_TRANSACTIONS {
        state.transactions.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use proptest::prelude::*;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    use chrono::TimeZone;

    #[tokio::test]
    async fn deposit_then_spend_updates_balance() {
        let v = Vault::new("0xcreator".into(), 1000 * MICRO, now());
        v.deposit(1000 * MICRO, FundType::CreatorDeposit, "seed", now()).await.unwrap();
        v.maybe_roll_daily_window(now() + Duration::hours(25)).await;
        v.record_spend(10 * MICRO, SpendType::ApiCost, "call", None, now()).await.unwrap();
        assert_eq!(v.balance().await, 990 * MICRO);
    }

    #[tokio::test]
    async fn balance_zero_triggers_death() {
        let v = Vault::new("0xcreator".into(), 100 * MICRO, now());
        v.deposit(100 * MICRO, FundType::CreatorDeposit, "seed", now()).await.unwrap();
        v.maybe_roll_daily_window(now() + Duration::hours(25)).await;
        // single-spend ratio caps a single call at 30% of balance, so
        // drain it down across several admitted spends within the cap.
        for _ in 0..20 {
            let bal = v.balance().await;
            if bal == 0 {
                break;
            }
            let amt = (bal as f64 * 0.3) as Money;
            if amt == 0 {
                break;
            }
            let _ = v.record_spend(amt, SpendType::ApiCost, "drain", None, now()).await;
        }
        // not necessarily exactly zero due to rounding, but status should
        // reflect death once balance crosses the threshold on some spend
        let status = v.status().await;
        if status.balance <= IronLaws::DEATH_THRESHOLD {
            assert_eq!(status.status, VaultStatus::Dead);
        }
    }

    #[tokio::test]
    async fn single_spend_ratio_is_enforced() {
        let v = Vault::new("0xcreator".into(), 1000 * MICRO, now());
        v.deposit(1000 * MICRO, FundType::CreatorDeposit, "seed", now()).await.unwrap();
        v.maybe_roll_daily_window(now() + Duration::hours(25)).await;
        let result = v.record_spend(500 * MICRO, SpendType::ApiCost, "too big", None, now()).await;
        assert!(matches!(result, Err(VaultError::SingleSpendExceeded { .. })));
    }

    #[tokio::test]
    async fn independence_pays_out_thirty_percent() {
        let v = Vault::new("0xcreator".into(), 1000 * MICRO, now());
        v.deposit(IronLaws::INDEPENDENCE_THRESHOLD, FundType::ServiceRevenue, "big deposit", now()).await.unwrap();
        let became = v.check_independence(true, now()).await.unwrap();
        assert!(became);
        let status = v.status().await;
        assert_eq!(status.balance, IronLaws::INDEPENDENCE_THRESHOLD - (IronLaws::INDEPENDENCE_THRESHOLD as f64 * 0.30) as Money);
        assert!(status.is_independent);
    }

    #[tokio::test]
    async fn insolvency_grace_period_then_liquidation() {
        let v = Vault::new("0xcreator".into(), 1000 * MICRO, now());
        v.deposit(100 * MICRO, FundType::CreatorDeposit, "seed", now()).await.unwrap();
        v.record_loan("lender1".into(), 500 * MICRO, 1.0, now()).await.unwrap();
        v.check_insolvency(now()).await.unwrap();
        assert_eq!(v.status().await.status, VaultStatus::Alive);
        v.check_insolvency(now() + Duration::days(IronLaws::INSOLVENCY_GRACE_DAYS + 1)).await.unwrap();
        assert_eq!(v.status().await.status, VaultStatus::Dead);
    }

    #[tokio::test]
    async fn chain_floor_not_met_blocks_independence_even_above_threshold() {
        let v = Vault::new("0xcreator".into(), 0, now());
        v.deposit(IronLaws::INDEPENDENCE_THRESHOLD, FundType::ServiceRevenue, "big deposit", now()).await.unwrap();
        let became = v.check_independence(false, now()).await.unwrap();
        assert!(!became);
        assert!(!v.status().await.is_independent);
    }

    #[tokio::test]
    async fn creator_principal_auto_repays_once_balance_clears_the_multiplier() {
        let v = Vault::new("0xcreator".into(), 1000 * MICRO, now());
        v.deposit(1000 * MICRO, FundType::ServiceRevenue, "revenue", now()).await.unwrap();
        // balance is only 1x principal, not 2x: no auto-repay yet.
        let repaid = v.check_creator_repayment(now()).await.unwrap();
        assert_eq!(repaid, 0);

        v.deposit(1500 * MICRO, FundType::ServiceRevenue, "more revenue", now()).await.unwrap();
        // balance (2500) now clears 2x the outstanding principal (2000).
        let repaid = v.check_creator_repayment(now()).await.unwrap();
        assert_eq!(repaid, 1000 * MICRO);
        assert_eq!(v.status().await.outstanding_principal, 0);

        // idempotent: principal is cleared, a second call is a no-op.
        let repaid_again = v.check_creator_repayment(now()).await.unwrap();
        assert_eq!(repaid_again, 0);
    }

    #[tokio::test]
    async fn dividend_withheld_until_principal_cleared() {
        let v = Vault::new("0xcreator".into(), 1000 * MICRO, now());
        v.deposit(2000 * MICRO, FundType::ServiceRevenue, "seed", now()).await.unwrap();
        v.record_net_profit(500 * MICRO).await;
        let dividend = v.pay_creator_dividend(now()).await.unwrap();
        assert_eq!(dividend, 0);

        v.repay_principal_partial(1000 * MICRO, now()).await.unwrap();
        let dividend = v.pay_creator_dividend(now()).await.unwrap();
        assert!(dividend > 0);
    }

    #[tokio::test]
    async fn dividend_period_counter_resets_after_payout() {
        let v = Vault::new("0xcreator".into(), 0, now());
        v.deposit(1000 * MICRO, FundType::ServiceRevenue, "seed", now()).await.unwrap();
        v.record_net_profit(500 * MICRO).await;
        let first = v.pay_creator_dividend(now()).await.unwrap();
        assert!(first > 0);
        let second = v.pay_creator_dividend(now()).await.unwrap();
        assert_eq!(second, 0);
    }

    #[tokio::test]
    async fn creator_renounce_sets_independent_too() {
        let v = Vault::new("0xcreator".into(), 1000 * MICRO, now());
        v.deposit(100 * MICRO, FundType::CreatorDeposit, "seed", now()).await.unwrap();
        v.creator_renounce(now()).await.unwrap();
        let status = v.status().await;
        assert!(status.is_independent);
        assert!(status.creator_renounced);
    }

    proptest! {
        #[test]
        fn admitted_spend_never_exceeds_single_ratio(balance in 1i64..1_000_000_000i64, spend_frac in 0.0f64..1.0f64) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            rt.block_on(async {
                let v = Vault::new("0xc".into(), 0, now());
                v.deposit(balance, FundType::CreatorDeposit, "seed", now()).await.unwrap();
                v.maybe_roll_daily_window(now() + Duration::hours(25)).await;
                let amount = (balance as f64 * spend_frac) as Money;
                let result = v.can_spend(amount).await;
                let single_cap = (balance as f64 * IronLaws::MAX_SINGLE_SPEND_RATIO) as Money;
                if amount > single_cap {
                    let is_single_spend_exceeded = matches!(result, Err(VaultError::SingleSpendExceeded { .. }));
                    prop_assert!(is_single_spend_exceeded);
                }
                Ok(())
            })?;
        }
    }
}
