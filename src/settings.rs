use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;

#[derive(Debug, Deserialize, Clone)]
pub struct Rpc {
    pub ws_url: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    /// Requests per second sent over the socket. Unset means unlimited.
    #[serde(default)]
    pub qps_limit: Option<u32>,
}

fn default_request_timeout_ms() -> u64 {
    10_000
}
fn default_max_retries() -> usize {
    2
}
fn default_retry_base_ms() -> u64 {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncSettings {
    #[serde(default = "default_chain_id")]
    pub chain_id: String,
    /// Hex account whose pool positions are tracked.
    pub account_id: String,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_repository_domain")]
    pub repository_domain: String,
}

fn default_chain_id() -> String {
    "sora".to_string()
}
fn default_debounce_ms() -> u64 {
    250
}
fn default_max_concurrency() -> usize {
    8
}
fn default_repository_domain() -> String {
    "pools".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct Storage {
    #[serde(default = "default_keys_page_size")]
    pub keys_page_size: u32,
    #[serde(default = "default_query_batch_size")]
    pub query_batch_size: usize,
}

fn default_keys_page_size() -> u32 {
    500
}
fn default_query_batch_size() -> usize {
    100
}

impl Default for Storage {
    fn default() -> Self {
        Self {
            keys_page_size: default_keys_page_size(),
            query_batch_size: default_query_batch_size(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Apy {
    /// GraphQL endpoint serving the yield table. Unset disables APY lookups.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Seconds before the table is refetched. Unset keeps it for the process lifetime.
    #[serde(default)]
    pub ttl_seconds: Option<u64>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct OrderStoreSettings {
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Database {
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AssetConfig {
    pub id: String,
    pub symbol: String,
    pub precision: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub rpc: Rpc,
    pub sync: SyncSettings,
    #[serde(default)]
    pub storage: Storage,
    #[serde(default)]
    pub apy: Apy,
    #[serde(default)]
    pub order_store: OrderStoreSettings,
    #[serde(default)]
    pub database: Database,
    #[serde(default)]
    pub assets: Vec<AssetConfig>,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        Self::from_path("Config.toml")
    }

    pub fn from_path(path: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name(path))
            .add_source(Environment::with_prefix("POOL_SYNC_CFG").separator("__"))
            .build()?;

        let mut settings: Self = s.try_deserialize()?;
        settings.apply_env_overrides();
        Ok(settings)
    }

    fn apply_env_overrides(&mut self) {
        if let Some(ws) = non_empty_env("POOL_SYNC_WS_URL") {
            self.rpc.ws_url = ws;
        }
        if let Some(db) = non_empty_env("POOL_SYNC_DATABASE_URL") {
            self.database.url = Some(db);
        }
        if let Some(account) = non_empty_env("POOL_SYNC_ACCOUNT_ID") {
            self.sync.account_id = account;
        }
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
