//! Keyed Dispatcher Pool
//!
//! Pools stateful dispatchers, one partition per endpoint key:
//! - `KeyedPool`: borrow / release / invalidate / close with per-key and total bounds
//! - `DispatcherFactory`: create, activate, passivate, destroy, validate hooks
//! - `HttpDispatcherFactory`: HTTP dispatchers backed by reqwest
//! - Prometheus-style metrics through the `metrics` facade

pub mod dispatch;
pub mod error;
pub mod evictor;
pub mod factory;
pub mod http;
pub mod pool;
pub mod pool_metrics;

pub use dispatch::send;
pub use error::{FactoryError, PoolError};
pub use evictor::spawn_evictor;
pub use factory::DispatcherFactory;
pub use http::{
    DispatchOutcome, HttpDispatcher, HttpDispatcherConfig, HttpDispatcherFactory, OutboundMessage,
};
pub use kd_common::{EndpointKey, ExhaustedAction, PoolConfig, PoolStats};
pub use pool::{KeyedPool, PooledDispatcher};

pub type Result<T> = std::result::Result<T, PoolError>;
