//! Shared types for the keyed dispatcher pool
//!
//! - EndpointKey: identity of a dispatch destination (pool partition key)
//! - PoolConfig: sizing, blocking and validation policy of a pool
//! - PoolStats: point-in-time snapshot of pool occupancy and lifetime counters

pub mod logging;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct EndpointKeyInner {
    uri: String,
    properties: BTreeMap<String, String>,
}

/// Identifier of a dispatch destination.
///
/// A key is the endpoint URI plus its connector properties. Two keys with the
/// same URI but different properties are different pool partitions. Keys are
/// immutable; cloning only bumps a reference count.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointKey(Arc<EndpointKeyInner>);

impl EndpointKey {
    pub fn new(uri: impl Into<String>) -> Self {
        Self(Arc::new(EndpointKeyInner {
            uri: uri.into(),
            properties: BTreeMap::new(),
        }))
    }

    pub fn with_properties<I, K, V>(uri: impl Into<String>, properties: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self(Arc::new(EndpointKeyInner {
            uri: uri.into(),
            properties: properties
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }))
    }

    pub fn uri(&self) -> &str {
        &self.0.uri
    }

    pub fn property(&self, name: &str) -> Option<&str> {
        self.0.properties.get(name).map(String::as_str)
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.0.properties
    }
}

// Display feeds logs, error messages, stats and metric labels. Properties may
// carry credentials, so Display and Debug only show their names.
impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.uri)?;
        if !self.0.properties.is_empty() {
            f.write_str("[")?;
            for (i, name) in self.0.properties.keys().enumerate() {
                if i > 0 {
                    f.write_str(",")?;
                }
                f.write_str(name)?;
            }
            f.write_str("]")?;
        }
        Ok(())
    }
}

impl fmt::Debug for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointKey")
            .field("uri", &self.0.uri)
            .field("properties", &self.0.properties.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// What `borrow` does when a key has no idle dispatcher and no free capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExhaustedAction {
    /// Fail immediately with `PoolExhausted`
    Fail,
    /// Wait for a dispatcher to be returned, bounded by `max_wait`
    #[default]
    Block,
}

/// Pool sizing and lifecycle policy
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle + active dispatchers per endpoint key
    pub max_active_per_key: usize,
    /// Maximum idle dispatchers kept per endpoint key; extras are destroyed on return
    pub max_idle_per_key: usize,
    /// Maximum dispatchers across all keys (None = unbounded)
    pub max_total: Option<usize>,
    pub exhausted_action: ExhaustedAction,
    /// Upper bound on a blocked borrow (None = wait until capacity or close)
    pub max_wait: Option<Duration>,
    /// Validate idle dispatchers (and fresh ones) before lending them out
    pub test_on_borrow: bool,
    /// Validate dispatchers when they are returned
    pub test_on_return: bool,
    /// Reuse the most recently returned dispatcher first
    pub lifo: bool,
    /// Idle dispatchers older than this are destroyed by the evictor
    pub min_evictable_idle_time: Option<Duration>,
    /// How often the evictor runs (None = no background eviction)
    pub eviction_interval: Option<Duration>,
    /// How long `close` waits for checked-out dispatchers to come back
    pub close_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_active_per_key: 8,
            max_idle_per_key: 8,
            max_total: None,
            exhausted_action: ExhaustedAction::Block,
            max_wait: None,
            test_on_borrow: true,
            test_on_return: true,
            lifo: true,
            min_evictable_idle_time: Some(Duration::from_secs(1800)),
            eviction_interval: None,
            close_timeout: Duration::from_secs(30),
        }
    }
}

impl PoolConfig {
    pub fn new(max_active_per_key: usize) -> Self {
        Self {
            max_active_per_key,
            max_idle_per_key: max_active_per_key,
            ..Self::default()
        }
    }

    pub fn with_max_idle(mut self, max_idle_per_key: usize) -> Self {
        self.max_idle_per_key = max_idle_per_key;
        self
    }

    pub fn with_max_total(mut self, max_total: usize) -> Self {
        self.max_total = Some(max_total);
        self
    }

    pub fn with_exhausted_action(mut self, action: ExhaustedAction) -> Self {
        self.exhausted_action = action;
        self
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = Some(max_wait);
        self
    }

    pub fn with_test_on_borrow(mut self, enabled: bool) -> Self {
        self.test_on_borrow = enabled;
        self
    }

    pub fn with_test_on_return(mut self, enabled: bool) -> Self {
        self.test_on_return = enabled;
        self
    }

    pub fn with_lifo(mut self, lifo: bool) -> Self {
        self.lifo = lifo;
        self
    }

    pub fn with_eviction(mut self, min_idle_time: Duration, interval: Option<Duration>) -> Self {
        self.min_evictable_idle_time = Some(min_idle_time);
        self.eviction_interval = interval;
        self
    }

    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }
}

/// Lifetime counters of a pool
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolCounters {
    pub created: u64,
    pub destroyed: u64,
    pub borrowed: u64,
    pub returned: u64,
    pub invalidated: u64,
    pub validation_failed: u64,
    pub exhausted: u64,
}

/// Occupancy of a single endpoint key
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyStats {
    pub endpoint: String,
    pub active: usize,
    pub idle: usize,
    pub max_active: usize,
}

/// Snapshot of a whole pool
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub total_active: usize,
    pub total_idle: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_total: Option<usize>,
    pub closed: bool,
    pub keys: Vec<KeyStats>,
    pub counters: PoolCounters,
    pub collected_at: DateTime<Utc>,
}
