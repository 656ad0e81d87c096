//! kd-dispatch
//!
//! Reads JSON lines from stdin and delivers each payload to its endpoint
//! through a keyed dispatcher pool:
//!
//! ```text
//! {"endpoint": "https://hooks.example/orders", "payload": {"id": 1}, "properties": {"auth": "token"}}
//! ```
//!
//! The pool is closed on EOF or on Ctrl-C / SIGTERM.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use kd_common::EndpointKey;
use kd_config::{AppConfig, DispatcherSettings};
use kd_pool::{
    send, spawn_evictor, DispatchOutcome, HttpDispatcherConfig, HttpDispatcherFactory, KeyedPool,
    OutboundMessage,
};

#[derive(Debug, Deserialize)]
struct InputLine {
    endpoint: String,
    payload: serde_json::Value,
    #[serde(default)]
    properties: BTreeMap<String, String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (for local development)
    let _ = dotenvy::dotenv();

    kd_common::logging::init_logging("kd-dispatch");

    let config = AppConfig::load().context("Failed to load configuration")?;
    log_config(&config);

    if config.metrics.enabled {
        install_metrics_exporter(&config.metrics.listen_addr)?;
    }

    let factory = HttpDispatcherFactory::new(dispatcher_config(&config.dispatcher));
    let pool = KeyedPool::new(config.pool.to_pool_config(), Arc::new(factory));
    let evictor = spawn_evictor(&pool);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut in_flight = JoinSet::new();
    let mut line_no = 0u64;
    let max_in_flight = config.dispatcher.max_in_flight.max(1);

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            // Stop reading input while the delivery backlog is full
            line = lines.next_line(), if in_flight.len() < max_in_flight => {
                match line {
                    Ok(Some(line)) => {
                        line_no += 1;
                        if line.trim().is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<InputLine>(&line) {
                            Ok(input) => {
                                let pool = pool.clone();
                                in_flight.spawn(async move { dispatch_line(&pool, line_no, input).await });
                            }
                            Err(e) => warn!(line = line_no, error = %e, "Skipping malformed input line"),
                        }
                    }
                    Ok(None) => {
                        info!(lines = line_no, "End of input");
                        break;
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to read input");
                        break;
                    }
                }
            }
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                if let Err(e) = joined {
                    error!(error = %e, "Dispatch task failed");
                }
            }
            _ = &mut shutdown => {
                info!("Shutdown signal received, aborting pending dispatches");
                in_flight.abort_all();
                break;
            }
        }
    }

    while let Some(joined) = in_flight.join_next().await {
        if let Err(e) = joined {
            if !e.is_cancelled() {
                error!(error = %e, "Dispatch task failed");
            }
        }
    }

    pool.close().await;
    if let Some(evictor) = evictor {
        let _ = evictor.await;
    }
    let stats = pool.stats();

    info!(
        created = stats.counters.created,
        borrowed = stats.counters.borrowed,
        destroyed = stats.counters.destroyed,
        exhausted = stats.counters.exhausted,
        "kd-dispatch finished"
    );
    Ok(())
}

async fn dispatch_line(pool: &KeyedPool<HttpDispatcherFactory>, line_no: u64, input: InputLine) {
    let key = EndpointKey::with_properties(input.endpoint, input.properties);
    let message = OutboundMessage::new(input.payload);

    match send(pool, &key, &message).await {
        Ok(DispatchOutcome::Delivered { status }) => {
            debug!(line = line_no, endpoint = %key.uri(), message_id = %message.id, status, "Delivered");
        }
        Ok(outcome) => {
            warn!(line = line_no, endpoint = %key.uri(), message_id = %message.id, ?outcome, "Not delivered");
        }
        Err(e) => {
            error!(line = line_no, endpoint = %key.uri(), message_id = %message.id, error = %e, "Dispatch failed");
        }
    }
}

fn dispatcher_config(settings: &DispatcherSettings) -> HttpDispatcherConfig {
    HttpDispatcherConfig {
        request_timeout: Duration::from_millis(settings.request_timeout_ms),
        connect_timeout: Duration::from_millis(settings.connect_timeout_ms),
        max_lifetime: (settings.max_lifetime_secs > 0)
            .then(|| Duration::from_secs(settings.max_lifetime_secs)),
        http1_only: settings.http1_only,
    }
}

fn install_metrics_exporter(listen_addr: &str) -> Result<()> {
    let addr: SocketAddr = listen_addr
        .parse()
        .with_context(|| format!("Invalid metrics listen address {}", listen_addr))?;

    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    info!(%addr, "Prometheus metrics exporter listening");
    Ok(())
}

fn log_config(config: &AppConfig) {
    info!("==========================================");
    info!("kd-dispatch starting");
    info!(
        max_active_per_key = config.pool.max_active_per_key,
        max_idle_per_key = config.pool.max_idle_per_key,
        max_total = config.pool.max_total,
        exhausted_action = ?config.pool.exhausted_action,
        max_wait_ms = config.pool.max_wait_ms,
        "  Pool"
    );
    info!(
        request_timeout_ms = config.dispatcher.request_timeout_ms,
        http1_only = config.dispatcher.http1_only,
        max_in_flight = config.dispatcher.max_in_flight,
        "  Dispatcher"
    );
    info!(enabled = config.metrics.enabled, listen_addr = %config.metrics.listen_addr, "  Metrics");
    info!("==========================================");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
