//! Metrics for the dispatcher pool
//!
//! Prometheus-compatible series, labelled by endpoint:
//! - Dispatcher creation/destruction
//! - Borrow counts, wait latency and exhaustion
//! - Validation failures
//! - Per-endpoint occupancy gauges

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record a dispatcher being created
pub fn record_created(endpoint: &str) {
    counter!(
        "kd_pool_created_total",
        "endpoint" => endpoint.to_string()
    )
    .increment(1);
}

/// Record a failed create call
pub fn record_create_failed(endpoint: &str) {
    counter!(
        "kd_pool_create_failed_total",
        "endpoint" => endpoint.to_string()
    )
    .increment(1);
}

/// Record a dispatcher being destroyed, with the reason it left the pool
pub fn record_destroyed(endpoint: &str, reason: &'static str) {
    counter!(
        "kd_pool_destroyed_total",
        "endpoint" => endpoint.to_string(),
        "reason" => reason
    )
    .increment(1);
}

/// Record a successful borrow and how long the caller waited for it
pub fn record_borrowed(endpoint: &str, wait: Duration) {
    counter!(
        "kd_pool_borrowed_total",
        "endpoint" => endpoint.to_string()
    )
    .increment(1);
    histogram!(
        "kd_pool_borrow_wait_seconds",
        "endpoint" => endpoint.to_string()
    )
    .record(wait.as_secs_f64());
}

/// Record how long a dispatcher was checked out
pub fn record_hold_time(endpoint: &str, held: Duration) {
    histogram!(
        "kd_pool_hold_seconds",
        "endpoint" => endpoint.to_string()
    )
    .record(held.as_secs_f64());
}

/// Record a borrow that gave up because the endpoint had no capacity
pub fn record_exhausted(endpoint: &str) {
    counter!(
        "kd_pool_exhausted_total",
        "endpoint" => endpoint.to_string()
    )
    .increment(1);
}

/// Record a dispatcher failing validation (phase: borrow, return)
pub fn record_validation_failed(endpoint: &str, phase: &'static str) {
    counter!(
        "kd_pool_validation_failed_total",
        "endpoint" => endpoint.to_string(),
        "phase" => phase
    )
    .increment(1);
}

/// Update occupancy gauges for an endpoint
pub fn set_key_occupancy(endpoint: &str, active: usize, idle: usize) {
    gauge!(
        "kd_pool_active",
        "endpoint" => endpoint.to_string()
    )
    .set(active as f64);
    gauge!(
        "kd_pool_idle",
        "endpoint" => endpoint.to_string()
    )
    .set(idle as f64);
}
