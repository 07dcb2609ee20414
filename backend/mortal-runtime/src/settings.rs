//! Layered configuration: built-in defaults, an optional TOML file, then
//! `MORTAL_*` environment variables, in that order — the same precedence
//! `config` gives any crate that layers sources this way.

use constitution::{Money, MICRO};
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ApiKeys {
    pub gemini: Option<String>,
    pub deepseek: Option<String>,
    pub openrouter: Option<String>,
    pub gift_card: Option<String>,
}

impl ApiKeys {
    pub fn for_provider(&self, provider: &str) -> Option<String> {
        match provider {
            "gemini" => self.gemini.clone(),
            "deepseek" => self.deepseek.clone(),
            "openrouter" => self.openrouter.clone(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub creator_address: String,
    pub creator_principal_usd: f64,
    pub vault_address: String,
    pub base_rpc_url: Option<String>,
    pub bsc_rpc_url: Option<String>,
    pub mock_gas_usd: f64,
    pub max_service_price: Money,
    pub heartbeat_interval_secs: u64,
    pub log_level: String,
    #[serde(default)]
    pub api_keys: ApiKeys,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            creator_address: "0x0000000000000000000000000000000000dead".to_string(),
            creator_principal_usd: 0.0,
            vault_address: "0x0000000000000000000000000000000000dead".to_string(),
            base_rpc_url: None,
            bsc_rpc_url: None,
            mock_gas_usd: 0.02,
            max_service_price: 100 * MICRO,
            heartbeat_interval_secs: 3600,
            log_level: "info".to_string(),
            api_keys: ApiKeys::default(),
        }
    }
}

impl Settings {
    /// Loads defaults, then overlays `config_path` if it exists, then
    /// overlays `MORTAL__*` environment variables (double underscore
    /// throughout, so nested keys like `api_keys.gemini` become
    /// `MORTAL__API_KEYS__GEMINI` without colliding with underscores
    /// already present in field names).
    pub fn load(config_path: &str) -> anyhow::Result<Self> {
        let defaults = Settings::default();
        let builder = config::Config::builder()
            .set_default("data_dir", defaults.data_dir.to_string_lossy().to_string())?
            .set_default("creator_address", defaults.creator_address.clone())?
            .set_default("creator_principal_usd", defaults.creator_principal_usd)?
            .set_default("vault_address", defaults.vault_address.clone())?
            .set_default("mock_gas_usd", defaults.mock_gas_usd)?
            .set_default("max_service_price", defaults.max_service_price)?
            .set_default("heartbeat_interval_secs", defaults.heartbeat_interval_secs)?
            .set_default("log_level", defaults.log_level.clone())?
            .add_source(config::File::with_name(config_path).required(false))
            .add_source(config::Environment::with_prefix("MORTAL").separator("__"));

        let settings: Settings = builder.build()?.try_deserialize()?;
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_load_without_a_config_file() {
        let settings = Settings::load("nonexistent-config-file").unwrap();
        assert_eq!(settings.heartbeat_interval_secs, 3600);
        assert_eq!(settings.max_service_price, 100 * MICRO);
    }

    #[test]
    fn environment_override_takes_precedence_over_defaults() {
        std::env::set_var("MORTAL__CREATOR_ADDRESS", "0xabc123");
        let settings = Settings::load("nonexistent-config-file").unwrap();
        assert_eq!(settings.creator_address, "0xabc123");
        std::env::remove_var("MORTAL__CREATOR_ADDRESS");
    }
}
