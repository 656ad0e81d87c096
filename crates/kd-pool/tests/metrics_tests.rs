//! Pool metrics Tests
//!
//! Tests for:
//! - Occupancy gauges following borrows, returns and destruction as they happen

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use metrics::{Counter, Gauge, GaugeFn, Histogram, Key, KeyName, Metadata, Recorder, SharedString, Unit};
use parking_lot::Mutex;

use kd_pool::{DispatcherFactory, EndpointKey, FactoryError, KeyedPool, PoolConfig};

type GaugeValues = Arc<Mutex<HashMap<(String, String), f64>>>;

/// Keeps the last value set on each (gauge, endpoint) pair
#[derive(Default)]
struct GaugeRecorder {
    values: GaugeValues,
}

impl GaugeRecorder {
    fn get(&self, name: &str, endpoint: &str) -> Option<f64> {
        self.values
            .lock()
            .get(&(name.to_string(), endpoint.to_string()))
            .copied()
    }
}

struct RecordedGauge {
    slot: (String, String),
    values: GaugeValues,
}

impl GaugeFn for RecordedGauge {
    fn increment(&self, value: f64) {
        *self.values.lock().entry(self.slot.clone()).or_insert(0.0) += value;
    }

    fn decrement(&self, value: f64) {
        *self.values.lock().entry(self.slot.clone()).or_insert(0.0) -= value;
    }

    fn set(&self, value: f64) {
        self.values.lock().insert(self.slot.clone(), value);
    }
}

impl Recorder for GaugeRecorder {
    fn describe_counter(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}
    fn describe_gauge(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}
    fn describe_histogram(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}

    fn register_counter(&self, _key: &Key, _metadata: &Metadata<'_>) -> Counter {
        Counter::noop()
    }

    fn register_gauge(&self, key: &Key, _metadata: &Metadata<'_>) -> Gauge {
        let endpoint = key
            .labels()
            .find(|label| label.key() == "endpoint")
            .map(|label| label.value().to_string())
            .unwrap_or_default();
        Gauge::from_arc(Arc::new(RecordedGauge {
            slot: (key.name().to_string(), endpoint),
            values: self.values.clone(),
        }))
    }

    fn register_histogram(&self, _key: &Key, _metadata: &Metadata<'_>) -> Histogram {
        Histogram::noop()
    }
}

struct NullDispatcher;

struct NullFactory;

#[async_trait]
impl DispatcherFactory for NullFactory {
    type Key = EndpointKey;
    type Dispatcher = NullDispatcher;

    async fn create(&self, _key: &EndpointKey) -> Result<NullDispatcher, FactoryError> {
        Ok(NullDispatcher)
    }

    async fn destroy(&self, _key: &EndpointKey, _dispatcher: NullDispatcher) -> Result<(), FactoryError> {
        Ok(())
    }
}

#[test]
fn test_occupancy_gauges_track_changes_without_stats() {
    let recorder = GaugeRecorder::default();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();

    metrics::with_local_recorder(&recorder, || {
        runtime.block_on(async {
            let pool = KeyedPool::new(PoolConfig::new(2), Arc::new(NullFactory));
            let key = EndpointKey::new("http://a.example/hook");
            let label = key.to_string();

            let first = pool.borrow(&key).await.unwrap();
            let second = pool.borrow(&key).await.unwrap();
            assert_eq!(recorder.get("kd_pool_active", &label), Some(2.0));
            assert_eq!(recorder.get("kd_pool_idle", &label), Some(0.0));

            first.release().await;
            assert_eq!(recorder.get("kd_pool_active", &label), Some(1.0));
            assert_eq!(recorder.get("kd_pool_idle", &label), Some(1.0));

            second.invalidate().await;
            assert_eq!(recorder.get("kd_pool_active", &label), Some(0.0));
            assert_eq!(recorder.get("kd_pool_idle", &label), Some(1.0));

            assert_eq!(pool.clear(&key).await, 1);
            assert_eq!(recorder.get("kd_pool_idle", &label), Some(0.0));
        })
    });
}
