use alloy::primitives::Address;
use serde::Deserialize;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub chain: ChainConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub dry_run: DryRunConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    /// JSON-RPC endpoint serving `eth_getLogs`
    #[serde(default = "default_rpc_url")]
    pub rpc_url: String,
    /// The worm contract emitting `WormStateUpdated`
    #[serde(default = "default_contract_address")]
    pub contract_address: String,
    /// Block the scan starts from when no checkpoint exists
    #[serde(default = "default_start_block")]
    pub start_block: u64,
    /// Number of blocks requested per `eth_getLogs` call
    #[serde(default = "default_batch_size")]
    pub batch_size: u64,
    /// Pause between batches, in milliseconds.
    #[serde(default = "default_batch_delay_ms")]
    pub batch_delay_ms: u64,
    /// Pause before the supervisor re-invokes the fetcher.
    #[serde(default = "default_restart_cooldown_secs")]
    pub restart_cooldown_secs: u64,
    /// Deadline for a single RPC call.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_events_channel_capacity")]
    pub events_channel_capacity: usize,
    #[serde(default = "default_checkpoints_channel_capacity")]
    pub checkpoints_channel_capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// SQLite database file
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// Drop and recreate all tables on startup
    #[serde(default)]
    pub clean_slate: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Number of most recent positions kept warm
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Size of the `recent` part of the overview
    #[serde(default = "default_recent_count")]
    pub recent_count: usize,
    /// Size of the `historical` sample of the overview
    #[serde(default = "default_sample_count")]
    pub sample_count: usize,
    /// Upper bound on `limit` for paged position queries
    #[serde(default = "default_max_page")]
    pub max_page: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DryRunConfig {
    /// Replace the chain fetcher with a synthetic event generator.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_dry_run_interval_secs")]
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_rpc_url() -> String {
    "https://api.hyperliquid-testnet.xyz/evm".to_string()
}
fn default_contract_address() -> String {
    "0x385B69Ef54332E6D3f00Ecf3384F890183e511F8".to_string()
}
fn default_start_block() -> u64 {
    14_419_337
}
fn default_batch_size() -> u64 {
    50
}
fn default_batch_delay_ms() -> u64 {
    1000
}
fn default_restart_cooldown_secs() -> u64 {
    60
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_events_channel_capacity() -> usize {
    10
}
fn default_checkpoints_channel_capacity() -> usize {
    1
}
fn default_db_path() -> String {
    "./worm-tracker.sqlite".to_string()
}
fn default_window_size() -> usize {
    1000
}
fn default_refresh_interval_secs() -> u64 {
    120
}
fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_recent_count() -> usize {
    100
}
fn default_sample_count() -> usize {
    400
}
fn default_max_page() -> usize {
    1000
}
fn default_dry_run_interval_secs() -> u64 {
    5
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            rpc_url: default_rpc_url(),
            contract_address: default_contract_address(),
            start_block: default_start_block(),
            batch_size: default_batch_size(),
            batch_delay_ms: default_batch_delay_ms(),
            restart_cooldown_secs: default_restart_cooldown_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            events_channel_capacity: default_events_channel_capacity(),
            checkpoints_channel_capacity: default_checkpoints_channel_capacity(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            clean_slate: false,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            refresh_interval_secs: default_refresh_interval_secs(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            recent_count: default_recent_count(),
            sample_count: default_sample_count(),
            max_page: default_max_page(),
        }
    }
}

impl Default for DryRunConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: default_dry_run_interval_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl ChainConfig {
    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }

    pub fn restart_cooldown(&self) -> Duration {
        Duration::from_secs(self.restart_cooldown_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Parsed contract address.
    pub fn contract(&self) -> Result<Address, ConfigError> {
        Address::from_str(&self.contract_address).map_err(|e| {
            ConfigError::Invalid(format!(
                "contract_address {:?}: {}",
                self.contract_address, e
            ))
        })
    }
}

impl CacheConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }
}

impl DryRunConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Config {
    /// Load config from a TOML file, then overlay environment variables.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides (no file needed).
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Config::default();
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("RPC_URL") {
            self.chain.rpc_url = url;
        }
        if let Ok(addr) = std::env::var("CONTRACT_ADDRESS") {
            self.chain.contract_address = addr;
        }
        if let Some(block) = std::env::var("START_BLOCK")
            .ok()
            .and_then(|b| b.trim().parse().ok())
        {
            self.chain.start_block = block;
        }
        if let Ok(path) = std::env::var("DB_PATH") {
            if !path.is_empty() {
                self.store.db_path = path;
            }
        }
        if let Ok(flag) = std::env::var("CLEAN_SLATE") {
            self.store.clean_slate = flag == "true";
        }
        if let Ok(flag) = std::env::var("DRY_RUN") {
            self.dry_run.enabled = flag == "true";
        }
        if let Ok(addr) = std::env::var("BIND_ADDR") {
            self.server.bind_addr = addr;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chain.batch_size == 0 {
            return Err(ConfigError::Invalid("chain.batch_size must be > 0".into()));
        }
        if self.chain.events_channel_capacity == 0 || self.chain.checkpoints_channel_capacity == 0
        {
            return Err(ConfigError::Invalid(
                "channel capacities must be > 0".into(),
            ));
        }
        if self.cache.window_size == 0 {
            return Err(ConfigError::Invalid("cache.window_size must be > 0".into()));
        }
        if self.cache.refresh_interval_secs == 0 || self.dry_run.interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "cache.refresh_interval_secs and dry_run.interval_secs must be > 0".into(),
            ));
        }
        self.chain.contract()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [chain]
            batch_size = 20

            [cache]
            window_size = 10
            "#,
        )
        .unwrap();

        assert_eq!(config.chain.batch_size, 20);
        assert_eq!(config.chain.start_block, 14_419_337);
        assert_eq!(config.cache.window_size, 10);
        assert_eq!(config.cache.refresh_interval(), Duration::from_secs(120));
        assert_eq!(config.server.sample_count, 400);
        assert!(!config.dry_run.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = Config::default();
        config.chain.batch_size = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.chain.contract_address = "not-an-address".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.cache.window_size = 0;
        assert!(config.validate().is_err());
    }
}
