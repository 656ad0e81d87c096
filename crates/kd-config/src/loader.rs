//! Configuration loader with file and environment variable support

use crate::{AppConfig, ConfigError};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::{info, warn};

use kd_common::ExhaustedAction;

/// Standard config file search paths
const CONFIG_PATHS: &[&str] = &[
    "config.toml",
    "kd-dispatch.toml",
    "./config/config.toml",
    "/etc/kd-dispatch/config.toml",
];

/// Configuration loader
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Create a loader with a specific config file path
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load configuration from file (if found) with environment variable overrides
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let mut config = AppConfig::default();

        if let Some(path) = self.find_config_file() {
            info!(?path, "Loading configuration from file");
            config = AppConfig::from_file(&path)?;
        }

        apply_overrides(&mut config, |name| env::var(name).ok());
        config.validate()?;

        Ok(config)
    }

    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
            warn!(?path, "Configured file does not exist, searching defaults");
        }

        if let Ok(path) = env::var("KD_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        CONFIG_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|path| path.exists())
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn set_parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str, target: &mut T) {
    if let Some(val) = lookup(name) {
        match val.trim().parse() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(variable = name, value = %val, "Ignoring unparsable override"),
        }
    }
}

/// Apply `KD_*` overrides; `lookup` resolves a variable name to its value
pub(crate) fn apply_overrides(config: &mut AppConfig, lookup: impl Fn(&str) -> Option<String>) {
    // Pool
    set_parsed(&lookup, "KD_POOL_MAX_ACTIVE_PER_KEY", &mut config.pool.max_active_per_key);
    set_parsed(&lookup, "KD_POOL_MAX_IDLE_PER_KEY", &mut config.pool.max_idle_per_key);
    set_parsed(&lookup, "KD_POOL_MAX_TOTAL", &mut config.pool.max_total);
    set_parsed(&lookup, "KD_POOL_MAX_WAIT_MS", &mut config.pool.max_wait_ms);
    set_parsed(&lookup, "KD_POOL_TEST_ON_BORROW", &mut config.pool.test_on_borrow);
    set_parsed(&lookup, "KD_POOL_TEST_ON_RETURN", &mut config.pool.test_on_return);
    set_parsed(&lookup, "KD_POOL_LIFO", &mut config.pool.lifo);
    set_parsed(&lookup, "KD_POOL_MIN_EVICTABLE_IDLE_MS", &mut config.pool.min_evictable_idle_ms);
    set_parsed(&lookup, "KD_POOL_EVICTION_INTERVAL_MS", &mut config.pool.eviction_interval_ms);
    set_parsed(&lookup, "KD_POOL_CLOSE_TIMEOUT_MS", &mut config.pool.close_timeout_ms);
    if let Some(val) = lookup("KD_POOL_EXHAUSTED_ACTION") {
        match val.trim().to_ascii_lowercase().as_str() {
            "block" => config.pool.exhausted_action = ExhaustedAction::Block,
            "fail" => config.pool.exhausted_action = ExhaustedAction::Fail,
            other => warn!(value = other, "Unknown KD_POOL_EXHAUSTED_ACTION, keeping configured value"),
        }
    }

    // Dispatcher
    set_parsed(&lookup, "KD_DISPATCHER_REQUEST_TIMEOUT_MS", &mut config.dispatcher.request_timeout_ms);
    set_parsed(&lookup, "KD_DISPATCHER_CONNECT_TIMEOUT_MS", &mut config.dispatcher.connect_timeout_ms);
    set_parsed(&lookup, "KD_DISPATCHER_MAX_LIFETIME_SECS", &mut config.dispatcher.max_lifetime_secs);
    set_parsed(&lookup, "KD_DISPATCHER_HTTP1_ONLY", &mut config.dispatcher.http1_only);
    set_parsed(&lookup, "KD_DISPATCHER_MAX_IN_FLIGHT", &mut config.dispatcher.max_in_flight);

    // Metrics
    set_parsed(&lookup, "KD_METRICS_ENABLED", &mut config.metrics.enabled);
    if let Some(val) = lookup("KD_METRICS_LISTEN_ADDR") {
        config.metrics.listen_addr = val;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_overrides_applied() {
        let mut config = AppConfig::default();
        apply_overrides(
            &mut config,
            lookup_from(&[
                ("KD_POOL_MAX_ACTIVE_PER_KEY", "3"),
                ("KD_POOL_EXHAUSTED_ACTION", "FAIL"),
                ("KD_POOL_LIFO", "false"),
                ("KD_DISPATCHER_HTTP1_ONLY", "true"),
                ("KD_DISPATCHER_MAX_IN_FLIGHT", "16"),
                ("KD_METRICS_LISTEN_ADDR", "127.0.0.1:9000"),
            ]),
        );

        assert_eq!(config.pool.max_active_per_key, 3);
        assert_eq!(config.pool.exhausted_action, ExhaustedAction::Fail);
        assert!(!config.pool.lifo);
        assert!(config.dispatcher.http1_only);
        assert_eq!(config.dispatcher.max_in_flight, 16);
        assert_eq!(config.metrics.listen_addr, "127.0.0.1:9000");
    }

    #[test]
    fn test_unparsable_override_is_ignored() {
        let mut config = AppConfig::default();
        apply_overrides(
            &mut config,
            lookup_from(&[
                ("KD_POOL_MAX_TOTAL", "lots"),
                ("KD_POOL_EXHAUSTED_ACTION", "grow"),
            ]),
        );

        assert_eq!(config.pool.max_total, 0);
        assert_eq!(config.pool.exhausted_action, ExhaustedAction::Block);
    }
}
