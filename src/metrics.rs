//! Metrics collection and export for resource pools

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

#[cfg(feature = "serde")]
use serde::Serialize;

use crate::pool::PoolStatus;

/// Point-in-time snapshot of pool activity
///
/// # Examples
///
/// ```
/// use respool::{PoolConfiguration, PoolObject, ResourcePool};
/// use std::convert::Infallible;
///
/// struct Worker;
/// impl PoolObject for Worker {}
///
/// # #[tokio::main]
/// # async fn main() {
/// let config = PoolConfiguration::new().with_min_size(0).with_max_size(2);
/// let pool = ResourcePool::new(|| async { Ok::<_, Infallible>(Worker) }, config).unwrap();
///
/// let _worker = pool.acquire().await.unwrap().unwrap();
/// let metrics = pool.metrics();
/// assert_eq!(metrics.total_acquired, 1);
/// assert_eq!(metrics.in_use, 1);
/// # }
/// ```
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct PoolMetrics {
    /// Successful acquisitions
    pub total_acquired: u64,

    /// Objects handed back to the queue
    pub total_released: u64,

    /// Objects built by the factory
    pub total_created: u64,

    /// Objects permanently removed
    pub total_destroyed: u64,

    /// Factory calls that failed
    pub creation_failures: u64,

    /// Lifecycle hooks that failed or rejected an object
    pub hook_failures: u64,

    /// Acquires that timed out or hit a shut down pool
    pub pool_empty_events: u64,

    /// Objects currently tracked
    pub created: usize,

    /// Objects currently checked out
    pub in_use: usize,

    /// Objects currently queued
    pub available: usize,

    /// Configured cap
    pub max_size: usize,

    /// Configured floor
    pub min_size: usize,

    /// `in_use / max_size` (0.0 to 1.0)
    pub utilization: f64,
}

impl PoolMetrics {
    /// Export metrics as a HashMap
    pub fn export(&self) -> HashMap<String, String> {
        let mut metrics = HashMap::new();
        metrics.insert("total_acquired".to_string(), self.total_acquired.to_string());
        metrics.insert("total_released".to_string(), self.total_released.to_string());
        metrics.insert("total_created".to_string(), self.total_created.to_string());
        metrics.insert("total_destroyed".to_string(), self.total_destroyed.to_string());
        metrics.insert("creation_failures".to_string(), self.creation_failures.to_string());
        metrics.insert("hook_failures".to_string(), self.hook_failures.to_string());
        metrics.insert("pool_empty_events".to_string(), self.pool_empty_events.to_string());
        metrics.insert("created".to_string(), self.created.to_string());
        metrics.insert("in_use".to_string(), self.in_use.to_string());
        metrics.insert("available".to_string(), self.available.to_string());
        metrics.insert("max_size".to_string(), self.max_size.to_string());
        metrics.insert("min_size".to_string(), self.min_size.to_string());
        metrics.insert("utilization".to_string(), format!("{:.2}", self.utilization));
        metrics
    }
}

/// Metrics exporter for Prometheus format
pub struct MetricsExporter;

#[cfg(feature = "metrics")]
impl MetricsExporter {
    /// Export metrics in Prometheus exposition format
    ///
    /// Every series carries a `pool` label plus the optional `tags`.
    pub fn export_prometheus(
        metrics: &PoolMetrics,
        pool_name: &str,
        tags: Option<&HashMap<String, String>>,
    ) -> crate::errors::PoolResult<String> {
        use crate::errors::PoolError;
        use prometheus::{Encoder, Gauge, IntCounter, IntGauge, Opts, Registry, TextEncoder};

        fn export_err(err: prometheus::Error) -> PoolError {
            PoolError::MetricsExport(err.to_string())
        }

        let registry = Registry::new();
        let labels = Self::const_labels(pool_name, tags);
        let opts = |name: &str, help: &str| Opts::new(name, help).const_labels(labels.clone());

        let gauges = [
            ("respool_objects_created", "Objects currently tracked by the pool", metrics.created),
            ("respool_objects_in_use", "Objects currently checked out", metrics.in_use),
            ("respool_objects_available", "Objects currently queued", metrics.available),
            ("respool_max_size", "Configured pool capacity", metrics.max_size),
            ("respool_min_size", "Configured pool floor", metrics.min_size),
        ];
        for (name, help, value) in gauges {
            let gauge = IntGauge::with_opts(opts(name, help)).map_err(export_err)?;
            gauge.set(value as i64);
            registry.register(Box::new(gauge)).map_err(export_err)?;
        }

        let utilization =
            Gauge::with_opts(opts("respool_utilization", "Pool utilization ratio")).map_err(export_err)?;
        utilization.set(metrics.utilization);
        registry.register(Box::new(utilization)).map_err(export_err)?;

        let counters = [
            ("respool_acquired_total", "Total successful acquisitions", metrics.total_acquired),
            ("respool_released_total", "Total objects returned", metrics.total_released),
            ("respool_created_total", "Total objects created", metrics.total_created),
            ("respool_destroyed_total", "Total objects destroyed", metrics.total_destroyed),
            ("respool_creation_failures_total", "Factory failures", metrics.creation_failures),
            ("respool_hook_failures_total", "Lifecycle hook failures", metrics.hook_failures),
            ("respool_empty_events_total", "Acquires that found the pool empty", metrics.pool_empty_events),
        ];
        for (name, help, value) in counters {
            let counter = IntCounter::with_opts(opts(name, help)).map_err(export_err)?;
            counter.inc_by(value);
            registry.register(Box::new(counter)).map_err(export_err)?;
        }

        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&registry.gather(), &mut buffer)
            .map_err(export_err)?;
        String::from_utf8(buffer).map_err(|err| PoolError::MetricsExport(err.to_string()))
    }

    fn const_labels(pool_name: &str, tags: Option<&HashMap<String, String>>) -> HashMap<String, String> {
        let mut labels = HashMap::new();
        labels.insert("pool".to_string(), pool_name.to_string());

        if let Some(tags) = tags {
            for (key, value) in tags {
                labels.insert(key.clone(), value.clone());
            }
        }

        labels
    }
}

/// Internal metrics tracker
#[derive(Default)]
pub(crate) struct MetricsTracker {
    acquired: AtomicU64,
    released: AtomicU64,
    created: AtomicU64,
    destroyed: AtomicU64,
    creation_failures: AtomicU64,
    hook_failures: AtomicU64,
    empty_events: AtomicU64,
}

impl MetricsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_acquired(&self) {
        self.acquired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_released(&self) {
        self.released.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_created(&self) {
        self.created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_destroyed(&self) {
        self.destroyed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_creation_failure(&self) {
        self.creation_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_hook_failure(&self) {
        self.hook_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_empty(&self) {
        self.empty_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, status: &PoolStatus) -> PoolMetrics {
        let utilization = if status.max > 0 {
            status.in_use as f64 / status.max as f64
        } else {
            0.0
        };

        PoolMetrics {
            total_acquired: self.acquired.load(Ordering::Relaxed),
            total_released: self.released.load(Ordering::Relaxed),
            total_created: self.created.load(Ordering::Relaxed),
            total_destroyed: self.destroyed.load(Ordering::Relaxed),
            creation_failures: self.creation_failures.load(Ordering::Relaxed),
            hook_failures: self.hook_failures.load(Ordering::Relaxed),
            pool_empty_events: self.empty_events.load(Ordering::Relaxed),
            created: status.created,
            in_use: status.in_use,
            available: status.created.saturating_sub(status.in_use),
            max_size: status.max,
            min_size: status.min,
            utilization,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status() -> PoolStatus {
        PoolStatus {
            created: 4,
            in_use: 3,
            max: 6,
            min: 1,
        }
    }

    #[test]
    fn test_snapshot_derives_utilization() {
        let tracker = MetricsTracker::new();
        tracker.record_acquired();
        tracker.record_acquired();
        tracker.record_empty();

        let metrics = tracker.snapshot(&status());
        assert_eq!(metrics.total_acquired, 2);
        assert_eq!(metrics.pool_empty_events, 1);
        assert_eq!(metrics.available, 1);
        assert!((metrics.utilization - 0.5).abs() < f64::EPSILON);
        assert_eq!(metrics.export()["utilization"], "0.50");
    }

    #[cfg(feature = "metrics")]
    #[test]
    fn test_prometheus_export_labels() {
        let tracker = MetricsTracker::new();
        tracker.record_created();
        let metrics = tracker.snapshot(&status());

        let mut tags = HashMap::new();
        tags.insert("service".to_string(), "api".to_string());

        let output = MetricsExporter::export_prometheus(&metrics, "db", Some(&tags)).unwrap();
        assert!(output.contains("# TYPE respool_objects_in_use gauge"));
        assert!(output.contains("respool_objects_in_use{pool=\"db\",service=\"api\"} 3"));
        assert!(output.contains("respool_created_total{pool=\"db\",service=\"api\"} 1"));
    }

    #[cfg(feature = "metrics")]
    #[test]
    fn test_prometheus_rejects_bad_label() {
        let metrics = MetricsTracker::new().snapshot(&status());
        let mut tags = HashMap::new();
        tags.insert("bad-label".to_string(), "x".to_string());

        let result = MetricsExporter::export_prometheus(&metrics, "db", Some(&tags));
        assert!(matches!(result, Err(crate::errors::PoolError::MetricsExport(_))));
    }
}
