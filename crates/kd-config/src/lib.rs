//! Dispatcher Pool Configuration
//!
//! TOML-based configuration with environment variable override support.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use kd_common::{ExhaustedAction, PoolConfig};

mod loader;

pub use loader::ConfigLoader;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Root application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub pool: PoolSettings,
    pub dispatcher: DispatcherSettings,
    pub metrics: MetricsSettings,
}

/// Keyed pool settings (durations in milliseconds, 0 = disabled)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub max_active_per_key: usize,
    pub max_idle_per_key: usize,
    /// 0 = unbounded
    pub max_total: usize,
    pub exhausted_action: ExhaustedAction,
    /// 0 = wait until capacity frees up or the pool closes
    pub max_wait_ms: u64,
    pub test_on_borrow: bool,
    pub test_on_return: bool,
    pub lifo: bool,
    pub min_evictable_idle_ms: u64,
    pub eviction_interval_ms: u64,
    pub close_timeout_ms: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_active_per_key: 8,
            max_idle_per_key: 8,
            max_total: 0,
            exhausted_action: ExhaustedAction::Block,
            max_wait_ms: 30_000,
            test_on_borrow: true,
            test_on_return: true,
            lifo: true,
            min_evictable_idle_ms: 1_800_000, // 30 minutes
            eviction_interval_ms: 60_000,
            close_timeout_ms: 30_000,
        }
    }
}

impl PoolSettings {
    pub fn to_pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_active_per_key: self.max_active_per_key,
            max_idle_per_key: self.max_idle_per_key,
            max_total: non_zero(self.max_total as u64).map(|v| v as usize),
            exhausted_action: self.exhausted_action,
            max_wait: non_zero(self.max_wait_ms).map(Duration::from_millis),
            test_on_borrow: self.test_on_borrow,
            test_on_return: self.test_on_return,
            lifo: self.lifo,
            min_evictable_idle_time: non_zero(self.min_evictable_idle_ms).map(Duration::from_millis),
            eviction_interval: non_zero(self.eviction_interval_ms).map(Duration::from_millis),
            close_timeout: Duration::from_millis(self.close_timeout_ms),
        }
    }
}

fn non_zero(value: u64) -> Option<u64> {
    (value > 0).then_some(value)
}

/// HTTP dispatcher settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherSettings {
    pub request_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    /// Dispatchers older than this fail validation (0 = no limit)
    pub max_lifetime_secs: u64,
    /// Force HTTP/1.1 instead of ALPN negotiation
    pub http1_only: bool,
    /// Maximum concurrent deliveries before input reading pauses
    pub max_in_flight: usize,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            request_timeout_ms: 30_000,
            connect_timeout_ms: 10_000,
            max_lifetime_secs: 3600,
            http1_only: false,
            max_in_flight: 256,
        }
    }
}

/// Prometheus exporter settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsSettings {
    pub enabled: bool,
    pub listen_addr: String,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: "0.0.0.0:9464".to_string(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration with environment variable override
    pub fn load() -> Result<Self, ConfigError> {
        ConfigLoader::new().load()
    }

    /// Reject settings the pool cannot operate with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let pool = &self.pool;
        if pool.max_active_per_key == 0 {
            return Err(ConfigError::ValidationError(
                "pool.max_active_per_key must be at least 1".to_string(),
            ));
        }
        if pool.max_idle_per_key > pool.max_active_per_key {
            return Err(ConfigError::ValidationError(format!(
                "pool.max_idle_per_key ({}) exceeds pool.max_active_per_key ({})",
                pool.max_idle_per_key, pool.max_active_per_key
            )));
        }
        if pool.max_total != 0 && pool.max_total < pool.max_active_per_key {
            return Err(ConfigError::ValidationError(format!(
                "pool.max_total ({}) is below pool.max_active_per_key ({})",
                pool.max_total, pool.max_active_per_key
            )));
        }
        if self.dispatcher.max_in_flight == 0 {
            return Err(ConfigError::ValidationError(
                "dispatcher.max_in_flight must be at least 1".to_string(),
            ));
        }
        if self.metrics.enabled && self.metrics.listen_addr.parse::<std::net::SocketAddr>().is_err() {
            return Err(ConfigError::ValidationError(format!(
                "metrics.listen_addr is not a socket address: {}",
                self.metrics.listen_addr
            )));
        }
        Ok(())
    }

    /// Generate an example TOML configuration
    pub fn example_toml() -> String {
        r#"# Dispatcher Pool Configuration
# Environment variables (KD_*) override these settings

[pool]
max_active_per_key = 8
max_idle_per_key = 8
max_total = 0                  # 0 = unbounded
exhausted_action = "block"     # block, fail
max_wait_ms = 30000            # 0 = wait until capacity or close
test_on_borrow = true
test_on_return = true
lifo = true
min_evictable_idle_ms = 1800000
eviction_interval_ms = 60000   # 0 = no background eviction
close_timeout_ms = 30000

[dispatcher]
request_timeout_ms = 30000
connect_timeout_ms = 10000
max_lifetime_secs = 3600
http1_only = false
max_in_flight = 256            # concurrent deliveries before input pauses

[metrics]
enabled = false
listen_addr = "0.0.0.0:9464"
"#
        .to_string()
    }
}
