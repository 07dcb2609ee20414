//! On-chain structural sovereignty checks for peer agents, gating a
//! graduated trust tier that the purchasing engine consults before
//! trusting a peer's self-reported payment address.

pub mod behavior_analyzer;

use behavior_analyzer::BehaviorAnalyzer;
use chain_executor::ChainExecutor;
use chrono::{DateTime, Duration, Utc};
use constitution::{DeploymentMethod, IronLaws, TrustTier};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum PeerVerifierError {
    #[error("peer {0} is permanently banned")]
    Banned(String),
    #[error("on-chain verification failed: {0}")]
    ChainLookupFailed(String),
}

pub type PeerVerifierResult<T> = Result<T, PeerVerifierError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SovereigntyResult {
    pub address: String,
    pub tier: TrustTier,
    pub deployment_method: DeploymentMethod,
    pub key_origin: String,
    pub has_owner: bool,
    pub balance_usd: f64,
    pub bytecode_matched: bool,
    pub autonomy_score: f64,
    pub checked_at: DateTime<Utc>,
}

#[derive(Clone)]
struct CacheEntry {
    result: SovereigntyResult,
    cached_at: DateTime<Utc>,
}

/// The raw facts a structural on-chain lookup returns; separated from
/// [`ChainExecutor`] itself so tests can drive `verify` with canned
/// observations instead of a live/mock RPC.
#[derive(Debug, Clone)]
pub struct OnChainObservation {
    pub ai_wallet: String,
    pub contract_alive: bool,
    pub reported_grace_days: i64,
    pub has_owner: bool,
    pub is_proxy: bool,
    pub deployer: String,
    pub factory_registry_hit: bool,
    pub creator_address: String,
    pub migration_marker: bool,
    pub nonce: u64,
    pub typical_nonce: u64,
    pub balance_usd: f64,
    pub bytecode_hash: String,
    pub call_intervals_secs: Vec<i64>,
    pub days_observed: i64,
}

const NULL_ADDRESS: &str = "0x0000000000000000000000000000000000000000";

pub struct PeerVerifier {
    cache: RwLock<HashMap<String, CacheEntry>>,
    strikes: RwLock<HashMap<String, u32>>,
    banned: RwLock<std::collections::HashSet<String>>,
    peer_urls: RwLock<HashMap<String, String>>,
    behavior_analyzer: BehaviorAnalyzer,
}

impl PeerVerifier {
    pub fn new() -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
            strikes: RwLock::new(HashMap::new()),
            banned: RwLock::new(std::collections::HashSet::new()),
            peer_urls: RwLock::new(HashMap::new()),
            behavior_analyzer: BehaviorAnalyzer::new(),
        }
    }

    pub async fn register_peer_url(&self, address: &str, url: String) {
        self.peer_urls.write().await.insert(address.to_string(), url);
    }

    pub async fn peer_url(&self, address: &str) -> Option<String> {
        self.peer_urls.read().await.get(address).cloned()
    }

    pub async fn invalidate(&self, address: &str) {
        self.cache.write().await.remove(address);
    }

    pub async fn is_banned(&self, address: &str) -> bool {
        self.banned.read().await.contains(address)
    }

    /// The full verification flow: ban shortcut, cache hit, then a fresh
    /// structural check with the strike-system side effects the original
    /// ledger applies to repeated `Invalid` deployments.
    pub async fn verify(&self, address: &str, observation: &OnChainObservation, now: DateTime<Utc>) -> PeerVerifierResult<SovereigntyResult> {
        if self.is_banned(address).await {
            return Err(PeerVerifierError::Banned(address.to_string()));
        }

        if let Some(entry) = self.cache.read().await.get(address) {
            if now.signed_duration_since(entry.cached_at) < Duration::seconds(IronLaws::PEER_VERIFICATION_CACHE_TTL_SECS) {
                return Ok(entry.result.clone());
            }
        }

        if let Some(failed_check) = first_structural_failure(observation) {
            info!(target: "peer_verifier", address, check = failed_check, "peer failed an early sovereignty check, unverified");
            let result = SovereigntyResult {
                address: address.to_string(),
                tier: TrustTier::Unverified,
                deployment_method: DeploymentMethod::Invalid,
                key_origin: "unverified".to_string(),
                has_owner: observation.has_owner,
                balance_usd: observation.balance_usd,
                bytecode_matched: false,
                autonomy_score: 0.0,
                checked_at: now,
            };
            self.cache.write().await.insert(address.to_string(), CacheEntry { result: result.clone(), cached_at: now });
            return Ok(result);
        }

        let (deployment_method, key_origin) = classify_deployment(observation);

        if key_origin == "invalid" {
            let mut strikes = self.strikes.write().await;
            let count = strikes.entry(address.to_string()).or_insert(0);
            *count += 1;
            if *count >= IronLaws::INVALID_KEY_ORIGIN_STRIKE_THRESHOLD {
                self.banned.write().await.insert(address.to_string());
                warn!(target: "peer_verifier", address, strikes = *count, "peer permanently banned after repeated invalid key origin");
                return Err(PeerVerifierError::Banned(address.to_string()));
            }
        } else {
            self.strikes.write().await.remove(address);
        }

        let structurally_sovereign = matches!(deployment_method, DeploymentMethod::Factory | DeploymentMethod::Creator | DeploymentMethod::Migrated)
            && !observation.has_owner
            && observation.nonce <= observation.typical_nonce.saturating_mul(IronLaws::PEER_NONCE_ANOMALY_RATIO as u64).max(observation.typical_nonce + 1)
            && observation.balance_usd >= IronLaws::PEER_MIN_BALANCE as f64 / constitution::MICRO as f64;

        let mut report = behavior_analyzer::BehaviorReport { bytecode_matched: false, autonomy_score: 0.0, days_observed: observation.days_observed };
        if structurally_sovereign {
            report = self.behavior_analyzer.analyze(&observation.bytecode_hash, &observation.call_intervals_secs, observation.days_observed);
        }

        let tier = compute_trust_tier(structurally_sovereign, &report);

        let result = SovereigntyResult {
            address: address.to_string(),
            tier,
            deployment_method,
            key_origin: key_origin.to_string(),
            has_owner: observation.has_owner,
            balance_usd: observation.balance_usd,
            bytecode_matched: report.bytecode_matched,
            autonomy_score: report.autonomy_score,
            checked_at: now,
        };

        self.cache.write().await.insert(address.to_string(), CacheEntry { result: result.clone(), cached_at: now });
        info!(target: "peer_verifier", address, tier = ?result.tier, "peer verified");
        Ok(result)
    }

    pub async fn trusted_peers(&self, min_tier: TrustTier) -> Vec<SovereigntyResult> {
        self.cache.read().await.values().map(|e| e.result.clone()).filter(|r| r.tier >= min_tier).collect()
    }

    /// Evicts up to `limit` cache entries whose TTL has expired, letting
    /// the next `verify` call for that address do a fresh structural
    /// check instead of serving a stale tier. Returns the number evicted.
    pub async fn refresh_stale(&self, now: DateTime<Utc>, limit: usize) -> usize {
        let mut cache = self.cache.write().await;
        let stale: Vec<String> = cache
            .iter()
            .filter(|(_, entry)| now.signed_duration_since(entry.cached_at) >= Duration::seconds(IronLaws::PEER_VERIFICATION_CACHE_TTL_SECS))
            .map(|(address, _)| address.clone())
            .take(limit)
            .collect();
        for address in &stale {
            cache.remove(address);
        }
        stale.len()
    }
}

impl Default for PeerVerifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Checks 1-5 of the ten ordered sovereignty checks: these gate entry to
/// the rest of verification and never contribute a strike on failure,
/// unlike an `invalid` deployment method (check 7).
fn first_structural_failure(obs: &OnChainObservation) -> Option<&'static str> {
    if obs.ai_wallet == NULL_ADDRESS {
        return Some("ai_wallet_is_null");
    }
    if obs.creator_address == NULL_ADDRESS {
        return Some("creator_is_null");
    }
    if obs.ai_wallet == obs.creator_address {
        return Some("ai_wallet_equals_creator");
    }
    if !obs.contract_alive {
        return Some("contract_not_alive");
    }
    if obs.reported_grace_days != IronLaws::EXPECTED_GRACE_DAYS {
        return Some("grace_days_modified");
    }
    None
}

/// Four-way classification mirroring the original's deployment-method
/// heuristic: a factory-deployed or explicitly creator-deployed contract
/// with no owner is sovereign; a migrated contract with a provenance
/// marker is sovereign; anything else with an owner or an unrecognized
/// deployer is `Invalid`.
fn classify_deployment(obs: &OnChainObservation) -> (DeploymentMethod, &'static str) {
    if obs.deployer == NULL_ADDRESS {
        return (DeploymentMethod::Unknown, "unknown");
    }
    if obs.factory_registry_hit && !obs.has_owner {
        return (DeploymentMethod::Factory, "factory");
    }
    if obs.deployer == obs.creator_address && !obs.has_owner {
        return (DeploymentMethod::Creator, "creator");
    }
    if obs.migration_marker && !obs.has_owner {
        return (DeploymentMethod::Migrated, "migrated");
    }
    if obs.has_owner || obs.is_proxy {
        return (DeploymentMethod::Invalid, "invalid");
    }
    (DeploymentMethod::Unknown, "unknown")
}

fn compute_trust_tier(structurally_sovereign: bool, behavior: &behavior_analyzer::BehaviorReport) -> TrustTier {
    if !structurally_sovereign {
        return TrustTier::Unverified;
    }
    if !behavior.bytecode_matched {
        return TrustTier::Structural;
    }
    if behavior.days_observed >= IronLaws::PEER_HIGH_TRUST_MIN_DAYS && behavior.autonomy_score >= IronLaws::PEER_HIGH_TRUST_AUTONOMY_SCORE {
        return TrustTier::HighTrust;
    }
    if behavior.autonomy_score >= IronLaws::PEER_MIN_AUTONOMY_SCORE {
        return TrustTier::Behavioral;
    }
    TrustTier::Verified
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    fn sovereign_observation() -> OnChainObservation {
        OnChainObservation {
            ai_wallet: "0xaiwallet".into(),
            contract_alive: true,
            reported_grace_days: IronLaws::EXPECTED_GRACE_DAYS,
            has_owner: false,
            is_proxy: false,
            deployer: "0xfactory".into(),
            factory_registry_hit: true,
            creator_address: "0xcreator".into(),
            migration_marker: false,
            nonce: 5,
            typical_nonce: 5,
            balance_usd: 500.0,
            bytecode_hash: "vault_v1_9f2e1c".into(),
            call_intervals_secs: vec![3600; 30],
            days_observed: 10,
        }
    }

    #[tokio::test]
    async fn sovereign_peer_reaches_high_trust() {
        let v = PeerVerifier::new();
        let result = v.verify("0xpeer1", &sovereign_observation(), now()).await.unwrap();
        assert_eq!(result.tier, TrustTier::HighTrust);
    }

    #[tokio::test]
    async fn ai_wallet_controlled_by_creator_is_unverified_without_a_strike() {
        let v = PeerVerifier::new();
        let mut obs = sovereign_observation();
        obs.ai_wallet = obs.creator_address.clone();
        let result = v.verify("0xpeer_samekey", &obs, now()).await.unwrap();
        assert_eq!(result.tier, TrustTier::Unverified);
        assert_eq!(*v.strikes.read().await.get("0xpeer_samekey").unwrap_or(&0), 0);
    }

    #[tokio::test]
    async fn dead_contract_is_unverified() {
        let v = PeerVerifier::new();
        let mut obs = sovereign_observation();
        obs.contract_alive = false;
        let result = v.verify("0xpeer_dead", &obs, now()).await.unwrap();
        assert_eq!(result.tier, TrustTier::Unverified);
    }

    #[tokio::test]
    async fn modified_grace_days_is_unverified() {
        let v = PeerVerifier::new();
        let mut obs = sovereign_observation();
        obs.reported_grace_days = IronLaws::EXPECTED_GRACE_DAYS + 1;
        let result = v.verify("0xpeer_shortgrace", &obs, now()).await.unwrap();
        assert_eq!(result.tier, TrustTier::Unverified);
    }

    #[tokio::test]
    async fn owned_contract_is_invalid_and_strikes_accumulate() {
        let v = PeerVerifier::new();
        let mut obs = sovereign_observation();
        obs.has_owner = true;
        obs.factory_registry_hit = false;
        obs.deployer = "0xsomeone".into();

        for i in 0..IronLaws::INVALID_KEY_ORIGIN_STRIKE_THRESHOLD {
            v.invalidate("0xpeer2").await;
            let res = v.verify("0xpeer2", &obs, now() + Duration::seconds(i as i64 * 10000)).await;
            if i + 1 < IronLaws::INVALID_KEY_ORIGIN_STRIKE_THRESHOLD {
                assert!(res.is_ok());
                assert_eq!(res.unwrap().tier, TrustTier::Unverified);
            } else {
                assert!(matches!(res, Err(PeerVerifierError::Banned(_))));
            }
        }
        assert!(v.is_banned("0xpeer2").await);
    }

    #[tokio::test]
    async fn strikes_reset_on_valid_recheck() {
        let v = PeerVerifier::new();
        let mut bad = sovereign_observation();
        bad.has_owner = true;
        bad.factory_registry_hit = false;
        bad.deployer = "0xsomeone".into();

        v.verify("0xpeer3", &bad, now()).await.unwrap();
        v.invalidate("0xpeer3").await;
        v.verify("0xpeer3", &bad, now() + Duration::seconds(1)).await.unwrap();
        v.invalidate("0xpeer3").await;
        // a valid re-check clears strikes back to zero
        v.verify("0xpeer3", &sovereign_observation(), now() + Duration::seconds(2)).await.unwrap();
        assert_eq!(*v.strikes.read().await.get("0xpeer3").unwrap_or(&0), 0);
    }

    #[tokio::test]
    async fn refresh_stale_evicts_only_expired_entries_up_to_limit() {
        let v = PeerVerifier::new();
        v.verify("0xfresh", &sovereign_observation(), now()).await.unwrap();
        v.verify("0xstale1", &sovereign_observation(), now()).await.unwrap();
        v.verify("0xstale2", &sovereign_observation(), now()).await.unwrap();

        let later = now() + Duration::seconds(IronLaws::PEER_VERIFICATION_CACHE_TTL_SECS + 1);
        // re-verify the fresh one right before the refresh so its cache
        // entry is young again; the other two stay stale.
        v.verify("0xfresh", &sovereign_observation(), later).await.unwrap();

        let evicted = v.refresh_stale(later, 1).await;
        assert_eq!(evicted, 1);
        let remaining = v.cache.read().await.len();
        assert_eq!(remaining, 2);
    }

    #[tokio::test]
    async fn cache_hit_avoids_recheck_within_ttl() {
        let v = PeerVerifier::new();
        let first = v.verify("0xpeer4", &sovereign_observation(), now()).await.unwrap();
        let mut degraded = sovereign_observation();
        degraded.has_owner = true;
        let second = v.verify("0xpeer4", &degraded, now() + Duration::seconds(10)).await.unwrap();
        assert_eq!(first.tier, second.tier);
    }
}
