//! Background idle eviction

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::factory::DispatcherFactory;
use crate::pool::KeyedPool;

/// Run `evict_idle` every `eviction_interval` until the pool closes.
///
/// Returns `None` when the pool has no eviction interval or no idle time limit.
pub fn spawn_evictor<F: DispatcherFactory>(pool: &KeyedPool<F>) -> Option<JoinHandle<()>> {
    let interval = pool.config().eviction_interval?;
    if pool.config().min_evictable_idle_time.is_none() {
        return None;
    }

    let pool = pool.clone();
    let shutdown = pool.shutdown_token();

    Some(tokio::spawn(async move {
        let start = tokio::time::Instant::now() + interval;
        let mut ticker = tokio::time::interval_at(start, interval);
        info!(interval_ms = interval.as_millis() as u64, "Idle evictor started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let evicted = pool.evict_idle().await;
                    debug!(evicted, "Idle eviction pass complete");
                }
                _ = shutdown.cancelled() => {
                    info!("Idle evictor shutting down");
                    break;
                }
            }
        }
    }))
}
