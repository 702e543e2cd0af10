//! Run metrics. Reporting is fire-and-forget: nothing here can fail an export.

mod graphite;

pub use graphite::GraphiteReporter;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Mutex;

#[async_trait]
pub trait MetricsReporter: Send + Sync {
    /// Add `value` to a counter
    fn incr(&self, name: &str, value: u64);

    /// Replace a gauge's value
    fn gauge(&self, name: &str, value: f64);

    /// Ship everything recorded so far. Errors are logged, never returned.
    async fn flush(&self);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReporter;

#[async_trait]
impl MetricsReporter for NoopReporter {
    fn incr(&self, _name: &str, _value: u64) {}

    fn gauge(&self, _name: &str, _value: f64) {}

    async fn flush(&self) {}
}

/// Values accumulated over one run, keyed by metric name
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    values: Mutex<BTreeMap<String, f64>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(&self, name: &str, value: u64) {
        if let Ok(mut values) = self.values.lock() {
            *values.entry(name.to_string()).or_insert(0.0) += value as f64;
        }
    }

    pub fn set(&self, name: &str, value: f64) {
        if let Ok(mut values) = self.values.lock() {
            values.insert(name.to_string(), value);
        }
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.lock().ok()?.get(name).copied()
    }

    pub fn snapshot(&self) -> BTreeMap<String, f64> {
        self.values
            .lock()
            .map(|values| values.clone())
            .unwrap_or_default()
    }
}

/// Keeps every value in memory; `flush` only logs them
#[derive(Debug, Default)]
pub struct InMemoryReporter {
    registry: MetricsRegistry,
}

impl InMemoryReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.registry.get(name)
    }

    pub fn snapshot(&self) -> BTreeMap<String, f64> {
        self.registry.snapshot()
    }
}

#[async_trait]
impl MetricsReporter for InMemoryReporter {
    fn incr(&self, name: &str, value: u64) {
        self.registry.incr(name, value);
    }

    fn gauge(&self, name: &str, value: f64) {
        self.registry.set(name, value);
    }

    async fn flush(&self) {
        tracing::info!(metrics = ?self.registry.snapshot(), "Run metrics");
    }
}
