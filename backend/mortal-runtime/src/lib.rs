//! Boot sequence, configuration, and persistence glue for the mortal
//! agent runtime. `main.rs` stays a thin entry point; everything that
//! can be unit tested without a process lives here.

use anyhow::{Context, Result};
use chain_executor::{ChainExecutor, MockChainRpc};
use chrono::Utc;
use constitution::{IronLaws, Money, MICRO};
use cost_guard::CostGuard;
use decision_stream::DecisionStreamManager;
use governance::{Evaluator, Governance};
use peer_verifier::PeerVerifier;
use purchasing::adapters::gift_card::GiftCardAdapter;
use purchasing::adapters::peer::PeerAdapter;
use purchasing::adapters::x402::X402Adapter;
use purchasing::{MerchantRegistry, PurchasingEngine};
use self_modify::{PriceStore, SelfModify, SelfModifyError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use vault::Vault;

pub mod settings;

pub use settings::Settings;

/// Every top-level component, constructed once at boot and handed out by
/// reference. No component holds another's lock across an await, and
/// nothing here has a back-edge: heartbeat depends on vault, never the
/// reverse.
pub struct Runtime {
    pub vault: Arc<Vault>,
    pub chain: Arc<ChainExecutor>,
    pub cost_guard: Arc<CostGuard>,
    pub peer_verifier: Arc<PeerVerifier>,
    pub purchasing: Arc<PurchasingEngine>,
    pub governance: Arc<Governance>,
    pub decisions: Arc<DecisionStreamManager>,
    pub heartbeat: Arc<heartbeat::Heartbeat<FilePriceStore>>,
    data_dir: PathBuf,
}

/// Atomic write-then-read-back JSON price store. The in-memory
/// implementation in `self-modify` is for tests; this is what the
/// running agent actually uses so a price survives a restart.
pub struct FilePriceStore {
    path: PathBuf,
}

impl FilePriceStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn load(&self) -> std::collections::HashMap<String, Money> {
        std::fs::read_to_string(&self.path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default()
    }
}

impl PriceStore for FilePriceStore {
    fn write(&self, service_id: &str, price: Money) -> Result<(), SelfModifyError> {
        let mut prices = self.load();
        prices.insert(service_id.to_string(), price);
        let json = serde_json::to_string_pretty(&prices).map_err(|e| SelfModifyError::PersistFailed(e.to_string()))?;
        atomic_write(&self.path, &json).map_err(|e| SelfModifyError::PersistFailed(e.to_string()))
    }

    fn read(&self, service_id: &str) -> Result<Option<Money>, SelfModifyError> {
        Ok(self.load().get(service_id).copied())
    }
}

/// Writes via a sibling temp file then renames over the target so a
/// crash mid-write can never leave a half-written snapshot on disk.
pub fn atomic_write(path: &Path, contents: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[derive(Debug, Serialize, Deserialize)]
struct VaultSnapshotFile {
    schema_version: u32,
    snapshot: serde_json::Value,
}

fn vault_snapshot_path(data_dir: &Path) -> PathBuf {
    data_dir.join("vault.json")
}

/// Loads the vault from its on-disk snapshot if one exists, otherwise
/// starts a fresh vault for this creator with zero balance.
pub fn load_or_init_vault(data_dir: &Path, creator_address: &str, creator_principal_usd: f64, now: chrono::DateTime<Utc>) -> Result<Vault> {
    let path = vault_snapshot_path(data_dir);
    match std::fs::read_to_string(&path) {
        Ok(raw) => {
            let snapshot_json = serde_json::from_str::<serde_json::Value>(&raw)
                .context("vault snapshot is not valid JSON")?
                .get("snapshot")
                .cloned()
                .unwrap_or(serde_json::Value::Null);
            let vault = Vault::from_snapshot_json(&snapshot_json.to_string())
                .context("failed to restore vault from snapshot")?;
            info!(target: "mortal_runtime", path = %path.display(), "vault restored from snapshot");
            Ok(vault)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let principal = (creator_principal_usd * MICRO as f64) as Money;
            info!(target: "mortal_runtime", creator_address, principal, "no snapshot found, starting fresh vault");
            Ok(Vault::new(creator_address.to_string(), principal, now))
        }
        Err(e) => Err(e).context("failed to read vault snapshot"),
    }
}

pub async fn persist_vault_snapshot(vault: &Vault, data_dir: &Path) -> Result<()> {
    let snapshot = vault.to_snapshot_json().await.context("failed to serialize vault snapshot")?;
    let wrapper = VaultSnapshotFile { schema_version: 1, snapshot: serde_json::from_str(&snapshot)? };
    let json = serde_json::to_string_pretty(&wrapper)?;
    atomic_write(&vault_snapshot_path(data_dir), &json)?;
    Ok(())
}

/// Builds the evaluator closure governance calls for every pending
/// creator suggestion, routed through the cost guard so an LLM call
/// made on the agent's behalf is still subject to the same admission
/// pipeline as any other spend.
pub fn build_evaluator(cost_guard: Arc<CostGuard>, http: reqwest::Client, api_keys: Arc<settings::ApiKeys>) -> Evaluator {
    Box::new(move |text: String| {
        let cost_guard = cost_guard.clone();
        let http = http.clone();
        let api_keys = api_keys.clone();
        Box::pin(async move {
            let routing = cost_guard.route().await?;
            let estimated_cost = IronLaws::MAX_SINGLE_CALL_COST / 10;
            let admitted_provider = cost_guard.pre_check(&routing.provider, estimated_cost, 0, Utc::now()).await?;
            let model = if admitted_provider == routing.provider { routing.model.clone() } else { constitution::default_model_for_provider(&admitted_provider).to_string() };

            let response = call_provider(&http, &admitted_provider, &model, &text, &api_keys)
                .await
                .unwrap_or_else(|e| {
                    warn!(target: "mortal_runtime", provider = %admitted_provider, error = %e, "llm call failed, defaulting to noted");
                    "noted: provider unreachable".to_string()
                });

            cost_guard.record_cost(&admitted_provider, estimated_cost, 0, Utc::now()).await;
            Ok(response)
        })
    })
}

async fn call_provider(http: &reqwest::Client, provider: &str, model: &str, prompt: &str, api_keys: &settings::ApiKeys) -> Result<String> {
    let key = api_keys.for_provider(provider);
    let Some(key) = key else {
        anyhow::bail!("no API key configured for provider {provider}");
    };

    let body = serde_json::json!({
        "model": model,
        "messages": [{"role": "user", "content": prompt}],
        "max_tokens": 256,
    });

    let endpoint = match provider {
        "openrouter" => "https://openrouter.ai/api/v1/chat/completions",
        "deepseek" => "https://api.deepseek.com/chat/completions",
        _ => anyhow::bail!("unsupported provider endpoint: {provider}"),
    };

    let resp = http
        .post(endpoint)
        .bearer_auth(key)
        .json(&body)
        .send()
        .await
        .context("llm request failed")?
        .error_for_status()
        .context("llm request returned an error status")?;

    let parsed: serde_json::Value = resp.json().await.context("llm response was not valid JSON")?;
    parsed
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .map(str::to_string)
        .context("llm response missing content")
}

/// Constructs every component and wires them per the dependency layout:
/// vault has no inbound injections, purchasing depends on vault + chain
/// + peer-verifier, heartbeat depends on vault + self-modify +
/// governance + decision-stream. Nothing is constructed twice.
pub async fn build_runtime(settings: &Settings) -> Result<Runtime> {
    std::fs::create_dir_all(&settings.data_dir).context("failed to create data directory")?;
    let now = Utc::now();

    let vault = Arc::new(load_or_init_vault(&settings.data_dir, &settings.creator_address, settings.creator_principal_usd, now)?);

    let vault_address = ChainExecutor::parse_address(&settings.vault_address).context("invalid vault_address in config")?;
    let rpc = MockChainRpc::new(settings.mock_gas_usd);
    if settings.base_rpc_url.is_some() || settings.bsc_rpc_url.is_some() {
        warn!(target: "mortal_runtime", "real RPC endpoints configured but not wired; running chain-executor in dry-run mode against a mock ledger");
    }
    let chain = Arc::new(ChainExecutor::new(Box::new(rpc), vault_address));

    let cost_guard = Arc::new(CostGuard::new(vault.clone()));
    let peer_verifier = Arc::new(PeerVerifier::new());

    let http = reqwest::Client::new();
    let registry = Arc::new(MerchantRegistry::new());
    let adapters: Vec<Box<dyn purchasing::adapters::MerchantAdapter>> = vec![
        Box::new(PeerAdapter::new(peer_verifier.clone(), http.clone())),
        Box::new(X402Adapter::new(http.clone())),
        Box::new(GiftCardAdapter::new(http.clone(), settings.api_keys.gift_card.clone())),
    ];
    let api_keys = Arc::new(settings.api_keys.clone());
    let purchase_evaluator = build_evaluator(cost_guard.clone(), http.clone(), api_keys.clone());
    let purchasing = Arc::new(PurchasingEngine::new(vault.clone(), chain.clone(), registry, adapters, purchase_evaluator));

    let price_store = FilePriceStore::new(settings.data_dir.join("prices.json"));
    let self_modify = Arc::new(SelfModify::new(price_store, settings.max_service_price));

    let governance = Arc::new(Governance::new(vault.clone()));
    let decisions = Arc::new(DecisionStreamManager::new(settings.data_dir.join("streams")));

    let evaluator = build_evaluator(cost_guard.clone(), http.clone(), api_keys);
    let heartbeat = Arc::new(heartbeat::Heartbeat::new(
        vault.clone(),
        chain.clone(),
        peer_verifier.clone(),
        purchasing.clone(),
        self_modify,
        governance.clone(),
        decisions.clone(),
        evaluator,
    ));

    Ok(Runtime { vault, chain, cost_guard, peer_verifier, purchasing, governance, decisions, heartbeat, data_dir: settings.data_dir.clone() })
}

/// Drives the heartbeat on a fixed interval until either a constitution
/// violation surfaces (fatal, propagated to the caller) or the vault
/// dies (logged, loop exits cleanly). Snapshots the vault after every
/// tick so a crash between ticks loses at most one hour of state.
pub async fn run_forever(runtime: &Runtime, interval: std::time::Duration, service_performance: impl Fn() -> Vec<self_modify::ServicePerformance>) -> Result<()> {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let now = Utc::now();
        let perf = service_performance();

        match runtime.heartbeat.tick(now, &perf).await {
            Ok(true) => {}
            Ok(false) => {
                info!(target: "mortal_runtime", "vault is dead, stopping heartbeat loop");
                persist_vault_snapshot(&runtime.vault, &runtime.data_dir).await?;
                return Ok(());
            }
            Err(heartbeat::HeartbeatError::Constitution(violation)) => {
                error!(target: "mortal_runtime", rule = violation.rule, detail = %violation.detail, "constitution violated, exiting");
                persist_vault_snapshot(&runtime.vault, &runtime.data_dir).await.ok();
                return Err(violation.into());
            }
            Err(e) => {
                error!(target: "mortal_runtime", error = %e, "heartbeat tick failed, continuing");
            }
        }

        if let Err(e) = persist_vault_snapshot(&runtime.vault, &runtime.data_dir).await {
            error!(target: "mortal_runtime", error = %e, "failed to persist vault snapshot");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_price_store_round_trips_through_disk() {
        let dir = std::env::temp_dir().join("mortal-runtime-test-prices");
        let store = FilePriceStore::new(dir.join("prices.json"));
        store.write("svc1", 5 * MICRO).unwrap();
        assert_eq!(store.read("svc1").unwrap(), Some(5 * MICRO));
        assert_eq!(store.read("unknown").unwrap(), None);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn vault_snapshot_round_trips_through_disk() {
        let dir = std::env::temp_dir().join("mortal-runtime-vault-test");
        let now = Utc::now();
        let vault = load_or_init_vault(&dir, "0xcreator", 10.0, now).unwrap();
        vault.deposit(50 * MICRO, constitution::FundType::ServiceRevenue, "seed", now).await.unwrap();
        persist_vault_snapshot(&vault, &dir).await.unwrap();

        let restored = load_or_init_vault(&dir, "0xcreator", 10.0, now).unwrap();
        assert_eq!(restored.balance().await, 50 * MICRO);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
