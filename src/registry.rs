//! # Metric Registry
//!
//! Process-wide store of counters, gauges and histograms fed by the transport
//! server and read by the exposition endpoint. Every metric family is declared
//! up front in [`DESCRIPTORS`] and backed by a `prometheus` vector
//! (`IntCounterVec`, `GaugeVec` or `HistogramVec`) registered in a private
//! `prometheus::Registry`. Updates name a family and supply its label values.
//!
//! ## Concurrency
//!
//! The prometheus vectors are updated atomically on their own. On top of
//! that, every update holds the shared side of a `parking_lot::RwLock` and
//! [`MetricRegistry::snapshot`] holds the exclusive side while it gathers, so
//! a scrape never observes half of a [`MetricRegistry::record_operation`]
//! (for example an operation counted but its duration not yet observed).
//!
//! Entries are never removed. Values accumulate for the lifetime of the
//! registry.

use crate::record::OperationRecord;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use prometheus::proto::{Metric, MetricFamily};
use prometheus::{GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::{error, warn};

pub const OPERATIONS_TOTAL: &str = "opmetrics_operations_total";
pub const BYTES_TOTAL: &str = "opmetrics_bytes_total";
pub const OPERATION_DURATION_SECONDS: &str = "opmetrics_operation_duration_seconds";
pub const OPERATION_SIZE_BYTES: &str = "opmetrics_operation_size_bytes";
pub const OPERATION_THROUGHPUT_MBPS: &str = "opmetrics_operation_throughput_mbps";
pub const ACTIVE_WORKERS: &str = "opmetrics_active_workers";
pub const TRANSPORT_CONNECTIONS_TOTAL: &str = "opmetrics_transport_connections_total";
pub const TRANSPORT_REFUSED_TOTAL: &str = "opmetrics_transport_connections_refused_total";
pub const TRANSPORT_MALFORMED_TOTAL: &str = "opmetrics_transport_malformed_messages_total";

/// Bucket upper bounds for operation duration, in seconds.
pub const DURATION_BUCKETS: [f64; 8] = [0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0];

/// Bucket upper bounds for payload size, in bytes (1 KiB to 1 GiB).
pub const SIZE_BUCKETS: [f64; 7] = [
    1024.0,
    10_240.0,
    102_400.0,
    1_048_576.0,
    10_485_760.0,
    104_857_600.0,
    1_073_741_824.0,
];

/// Distinct driver label values tracked before new ones collapse to
/// [`OVERFLOW_DRIVER`].
pub const MAX_DRIVER_SERIES: usize = 64;
/// Longest driver label value accepted verbatim.
pub const MAX_DRIVER_LEN: usize = 64;
pub const OVERFLOW_DRIVER: &str = "other";
const UNKNOWN_DRIVER: &str = "unknown";

const STATUS_LABELS: &[&str] = &["operation", "workload", "status"];
const DRIVER_LABELS: &[&str] = &["operation", "workload", "driver"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Histogram => "histogram",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static declaration of one metric family.
#[derive(Debug)]
pub struct MetricDescriptor {
    pub name: &'static str,
    pub help: &'static str,
    pub kind: MetricKind,
    pub label_names: &'static [&'static str],
    /// Histogram bucket upper bounds, ascending. Empty for other kinds.
    pub buckets: &'static [f64],
}

pub static DESCRIPTORS: [MetricDescriptor; 9] = [
    MetricDescriptor {
        name: OPERATIONS_TOTAL,
        help: "Total number of storage operations",
        kind: MetricKind::Counter,
        label_names: STATUS_LABELS,
        buckets: &[],
    },
    MetricDescriptor {
        name: BYTES_TOTAL,
        help: "Total payload bytes of storage operations",
        kind: MetricKind::Counter,
        label_names: STATUS_LABELS,
        buckets: &[],
    },
    MetricDescriptor {
        name: OPERATION_DURATION_SECONDS,
        help: "Duration of successful storage operations in seconds",
        kind: MetricKind::Histogram,
        label_names: DRIVER_LABELS,
        buckets: &DURATION_BUCKETS,
    },
    MetricDescriptor {
        name: OPERATION_SIZE_BYTES,
        help: "Payload size of storage operations in bytes",
        kind: MetricKind::Histogram,
        label_names: DRIVER_LABELS,
        buckets: &SIZE_BUCKETS,
    },
    MetricDescriptor {
        name: OPERATION_THROUGHPUT_MBPS,
        help: "Throughput of the most recent successful operation in MB/s",
        kind: MetricKind::Gauge,
        label_names: DRIVER_LABELS,
        buckets: &[],
    },
    MetricDescriptor {
        name: ACTIVE_WORKERS,
        help: "Number of workers currently connected to the aggregator",
        kind: MetricKind::Gauge,
        label_names: &[],
        buckets: &[],
    },
    MetricDescriptor {
        name: TRANSPORT_CONNECTIONS_TOTAL,
        help: "Transport connections accepted",
        kind: MetricKind::Counter,
        label_names: &[],
        buckets: &[],
    },
    MetricDescriptor {
        name: TRANSPORT_REFUSED_TOTAL,
        help: "Transport connections closed because the connection limit was reached",
        kind: MetricKind::Counter,
        label_names: &[],
        buckets: &[],
    },
    MetricDescriptor {
        name: TRANSPORT_MALFORMED_TOTAL,
        help: "Transport messages discarded because they could not be decoded",
        kind: MetricKind::Counter,
        label_names: &[],
        buckets: &[],
    },
];

pub fn descriptor(name: &str) -> Option<&'static MetricDescriptor> {
    DESCRIPTORS.iter().find(|d| d.name == name)
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unknown metric {0}")]
    UnknownMetric(String),

    #[error("metric {name} is a {actual}, not a {expected}")]
    KindMismatch {
        name: &'static str,
        expected: MetricKind,
        actual: MetricKind,
    },

    #[error("metric {name} expects labels {expected:?}, got {actual:?}")]
    LabelMismatch {
        name: &'static str,
        expected: &'static [&'static str],
        actual: Vec<&'static str>,
    },

    #[error(transparent)]
    Prometheus(#[from] prometheus::Error),
}

/// Ordered label pairs identifying one series within a family.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Labels(Vec<(&'static str, String)>);

impl Labels {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn with(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.0.push((name, value.into()));
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &str)> {
        self.0.iter().map(|(k, v)| (*k, v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn names(&self) -> Vec<&'static str> {
        self.0.iter().map(|(k, _)| *k).collect()
    }

    fn values(&self) -> Vec<&str> {
        self.0.iter().map(|(_, v)| v.as_str()).collect()
    }

    /// Whether a gathered series carries exactly these label pairs.
    fn matches(&self, metric: &Metric) -> bool {
        let pairs = metric.get_label();
        pairs.len() == self.0.len()
            && self.iter().all(|(name, value)| {
                pairs
                    .iter()
                    .any(|p| p.get_name() == name && p.get_value() == value)
            })
    }
}

/// Cumulative view of one histogram series.
#[derive(Debug, Clone, PartialEq)]
pub struct HistogramSnapshot {
    /// `(upper bound, observations <= bound)`, ending with `+Inf`.
    pub buckets: Vec<(f64, u64)>,
    pub count: u64,
    pub sum: f64,
}

impl HistogramSnapshot {
    fn from_metric(metric: &Metric) -> Self {
        let histogram = metric.get_histogram();
        let count = histogram.get_sample_count();
        let mut buckets: Vec<(f64, u64)> = histogram
            .get_bucket()
            .iter()
            .map(|b| (b.get_upper_bound(), b.get_cumulative_count()))
            .collect();
        buckets.push((f64::INFINITY, count));
        Self {
            buckets,
            count,
            sum: histogram.get_sample_sum(),
        }
    }
}

/// Point-in-time copy of every family that has at least one series.
#[derive(Debug, Clone)]
pub struct RegistrySnapshot {
    pub taken_at: DateTime<Utc>,
    pub families: Vec<MetricFamily>,
}

enum Family {
    Counter(IntCounterVec),
    Gauge(GaugeVec),
    Histogram(HistogramVec),
}

impl Family {
    fn build(desc: &MetricDescriptor, registry: &Registry) -> Result<Self, RegistryError> {
        let family = match desc.kind {
            MetricKind::Counter => {
                let vec = IntCounterVec::new(Opts::new(desc.name, desc.help), desc.label_names)?;
                registry.register(Box::new(vec.clone()))?;
                Family::Counter(vec)
            }
            MetricKind::Gauge => {
                let vec = GaugeVec::new(Opts::new(desc.name, desc.help), desc.label_names)?;
                registry.register(Box::new(vec.clone()))?;
                Family::Gauge(vec)
            }
            MetricKind::Histogram => {
                let opts = HistogramOpts::new(desc.name, desc.help).buckets(desc.buckets.to_vec());
                let vec = HistogramVec::new(opts, desc.label_names)?;
                registry.register(Box::new(vec.clone()))?;
                Family::Histogram(vec)
            }
        };
        Ok(family)
    }

    /// Materialize the label-free series so they are exposed from the start.
    fn touch_unlabelled(&self) -> Result<(), RegistryError> {
        match self {
            Family::Counter(vec) => {
                vec.get_metric_with_label_values(&[])?;
            }
            Family::Gauge(vec) => {
                vec.get_metric_with_label_values(&[])?;
            }
            Family::Histogram(vec) => {
                vec.get_metric_with_label_values(&[])?;
            }
        }
        Ok(())
    }
}

/// Thread-safe metric store shared by all transport connections.
pub struct MetricRegistry {
    registry: Registry,
    families: Vec<(&'static MetricDescriptor, Family)>,
    consistency: RwLock<()>,
    drivers: Mutex<HashSet<String>>,
    driver_overflow: AtomicBool,
    started_at: DateTime<Utc>,
}

impl MetricRegistry {
    pub fn new() -> Result<Self, RegistryError> {
        let registry = Registry::new();
        let mut families = Vec::with_capacity(DESCRIPTORS.len());
        for desc in DESCRIPTORS.iter() {
            let family = Family::build(desc, &registry)?;
            if desc.label_names.is_empty() {
                family.touch_unlabelled()?;
            }
            families.push((desc, family));
        }

        Ok(Self {
            registry,
            families,
            consistency: RwLock::new(()),
            drivers: Mutex::new(HashSet::new()),
            driver_overflow: AtomicBool::new(false),
            started_at: Utc::now(),
        })
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    fn resolve(
        &self,
        name: &str,
        kind: MetricKind,
        labels: &Labels,
    ) -> Result<&Family, RegistryError> {
        let (desc, family) = self
            .families
            .iter()
            .find(|(d, _)| d.name == name)
            .ok_or_else(|| RegistryError::UnknownMetric(name.to_string()))?;
        if desc.kind != kind {
            return Err(RegistryError::KindMismatch {
                name: desc.name,
                expected: kind,
                actual: desc.kind,
            });
        }
        let names = labels.names();
        if names.as_slice() != desc.label_names {
            return Err(RegistryError::LabelMismatch {
                name: desc.name,
                expected: desc.label_names,
                actual: names,
            });
        }
        Ok(family)
    }

    /// Add one to a counter.
    pub fn increment(&self, name: &str, labels: Labels) -> Result<(), RegistryError> {
        self.increment_by(name, labels, 1)
    }

    pub fn increment_by(&self, name: &str, labels: Labels, value: u64) -> Result<(), RegistryError> {
        let _guard = self.consistency.read();
        self.apply_counter(name, &labels, value)
    }

    /// Record one observation into a histogram.
    pub fn observe(&self, name: &str, labels: Labels, value: f64) -> Result<(), RegistryError> {
        let _guard = self.consistency.read();
        self.apply_observation(name, &labels, value)
    }

    pub fn set_gauge(&self, name: &str, labels: Labels, value: f64) -> Result<(), RegistryError> {
        let _guard = self.consistency.read();
        self.apply_gauge(name, &labels, |gauge| gauge.set(value))
    }

    /// Adjust a gauge by `delta` in a single update.
    pub fn add_gauge(&self, name: &str, labels: Labels, delta: f64) -> Result<(), RegistryError> {
        let _guard = self.consistency.read();
        self.apply_gauge(name, &labels, |gauge| gauge.add(delta))
    }

    fn apply_counter(&self, name: &str, labels: &Labels, value: u64) -> Result<(), RegistryError> {
        match self.resolve(name, MetricKind::Counter, labels)? {
            Family::Counter(vec) => {
                vec.get_metric_with_label_values(&labels.values())?.inc_by(value);
                Ok(())
            }
            _ => Err(RegistryError::UnknownMetric(name.to_string())),
        }
    }

    fn apply_observation(&self, name: &str, labels: &Labels, value: f64) -> Result<(), RegistryError> {
        match self.resolve(name, MetricKind::Histogram, labels)? {
            Family::Histogram(vec) => {
                vec.get_metric_with_label_values(&labels.values())?.observe(value);
                Ok(())
            }
            _ => Err(RegistryError::UnknownMetric(name.to_string())),
        }
    }

    fn apply_gauge(
        &self,
        name: &str,
        labels: &Labels,
        update: impl FnOnce(&prometheus::Gauge),
    ) -> Result<(), RegistryError> {
        match self.resolve(name, MetricKind::Gauge, labels)? {
            Family::Gauge(vec) => {
                update(&vec.get_metric_with_label_values(&labels.values())?);
                Ok(())
            }
            _ => Err(RegistryError::UnknownMetric(name.to_string())),
        }
    }

    /// Driver label value to use for `raw`
    ///
    /// Driver names arrive from worker processes. Empty names read as
    /// `unknown`; names that are too long, or new names once
    /// [`MAX_DRIVER_SERIES`] distinct ones have been seen, read as
    /// [`OVERFLOW_DRIVER`].
    fn driver_label(&self, raw: &str) -> String {
        if raw.is_empty() {
            return UNKNOWN_DRIVER.to_string();
        }
        if raw.len() > MAX_DRIVER_LEN {
            return OVERFLOW_DRIVER.to_string();
        }

        let mut drivers = self.drivers.lock();
        if drivers.contains(raw) {
            return raw.to_string();
        }
        if drivers.len() < MAX_DRIVER_SERIES {
            drivers.insert(raw.to_string());
            return raw.to_string();
        }
        if !self.driver_overflow.swap(true, Ordering::Relaxed) {
            warn!(
                limit = MAX_DRIVER_SERIES,
                driver = raw,
                "Driver label limit reached; new drivers are reported as \"other\""
            );
        }
        OVERFLOW_DRIVER.to_string()
    }

    /// Fold one operation record into the operation metrics
    ///
    /// Counters are labelled by outcome. Duration and throughput are only
    /// observed for successful operations; payload size is observed for all.
    pub fn record_operation(&self, record: &OperationRecord) {
        let status = if record.success() { "success" } else { "failure" };
        let driver = self.driver_label(record.driver());

        let by_status = Labels::new()
            .with("operation", record.operation().as_str())
            .with("workload", record.workload().as_str())
            .with("status", status);
        let by_driver = Labels::new()
            .with("operation", record.operation().as_str())
            .with("workload", record.workload().as_str())
            .with("driver", driver);

        let _guard = self.consistency.read();
        let mut results = vec![
            self.apply_counter(OPERATIONS_TOTAL, &by_status, 1),
            self.apply_counter(BYTES_TOTAL, &by_status, record.size_bytes()),
            self.apply_observation(OPERATION_SIZE_BYTES, &by_driver, record.size_bytes() as f64),
        ];
        if record.success() {
            results.push(self.apply_observation(
                OPERATION_DURATION_SECONDS,
                &by_driver,
                record.duration_ms() / 1_000.0,
            ));
            if let Some(mbps) = record.throughput_mbps() {
                results.push(self.apply_gauge(OPERATION_THROUGHPUT_MBPS, &by_driver, |g| {
                    g.set(mbps)
                }));
            }
        }

        for result in results {
            if let Err(e) = result {
                error!("Registry rejected operation update: {}", e);
            }
        }
    }

    /// Bump one of the unlabelled transport counters.
    pub fn note_transport_event(&self, name: &str) {
        if let Err(e) = self.increment(name, Labels::new()) {
            error!("Registry rejected transport event: {}", e);
        }
    }

    pub fn worker_connected(&self) {
        if let Err(e) = self.add_gauge(ACTIVE_WORKERS, Labels::new(), 1.0) {
            error!("Registry rejected gauge update: {}", e);
        }
    }

    pub fn worker_disconnected(&self) {
        if let Err(e) = self.add_gauge(ACTIVE_WORKERS, Labels::new(), -1.0) {
            error!("Registry rejected gauge update: {}", e);
        }
    }

    fn find_series(&self, name: &str, labels: &Labels) -> Option<Metric> {
        self.snapshot()
            .families
            .into_iter()
            .find(|family| family.get_name() == name)?
            .take_metric()
            .into_vec()
            .into_iter()
            .find(|metric| labels.matches(metric))
    }

    pub fn counter_value(&self, name: &str, labels: &Labels) -> Option<f64> {
        (descriptor(name)?.kind == MetricKind::Counter)
            .then(|| self.find_series(name, labels))
            .flatten()
            .map(|m| m.get_counter().get_value())
    }

    pub fn gauge_value(&self, name: &str, labels: &Labels) -> Option<f64> {
        (descriptor(name)?.kind == MetricKind::Gauge)
            .then(|| self.find_series(name, labels))
            .flatten()
            .map(|m| m.get_gauge().get_value())
    }

    pub fn histogram(&self, name: &str, labels: &Labels) -> Option<HistogramSnapshot> {
        (descriptor(name)?.kind == MetricKind::Histogram)
            .then(|| self.find_series(name, labels))
            .flatten()
            .map(|m| HistogramSnapshot::from_metric(&m))
    }

    /// Gather the current state of every family
    ///
    /// Writers are held off only while the values are copied out; encoding
    /// happens on the returned copy.
    pub fn snapshot(&self) -> RegistrySnapshot {
        let families = {
            let _guard = self.consistency.write();
            self.registry.gather()
        };
        RegistrySnapshot {
            taken_at: Utc::now(),
            families,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{OperationKind, WorkloadKind};
    use std::sync::Arc;

    fn download_by(driver: &str, success: bool, ms: i64) -> OperationRecord {
        let start = Utc::now();
        let builder = OperationRecord::builder(OperationKind::Download, WorkloadKind::ObjectStorage)
            .size_bytes(2048)
            .driver(driver)
            .started_at(start)
            .finished_at(start + chrono::Duration::milliseconds(ms));
        if success {
            builder.build().unwrap()
        } else {
            builder.failed("InternalError", "boom").build().unwrap()
        }
    }

    fn download(success: bool, ms: i64) -> OperationRecord {
        download_by("dummy", success, ms)
    }

    fn status_labels(status: &str) -> Labels {
        Labels::new()
            .with("operation", "download")
            .with("workload", "object-storage")
            .with("status", status)
    }

    fn driver_labels(driver: &str) -> Labels {
        Labels::new()
            .with("operation", "download")
            .with("workload", "object-storage")
            .with("driver", driver)
    }

    #[test]
    fn test_record_operation_counts_by_status() {
        let registry = MetricRegistry::new().unwrap();
        for _ in 0..3 {
            registry.record_operation(&download(true, 30));
        }
        registry.record_operation(&download(false, 0));

        assert_eq!(registry.counter_value(OPERATIONS_TOTAL, &status_labels("success")), Some(3.0));
        assert_eq!(registry.counter_value(OPERATIONS_TOTAL, &status_labels("failure")), Some(1.0));
        assert_eq!(registry.counter_value(BYTES_TOTAL, &status_labels("success")), Some(6144.0));

        let duration = registry
            .histogram(OPERATION_DURATION_SECONDS, &driver_labels("dummy"))
            .unwrap();
        assert_eq!(duration.count, 3);
        let size = registry
            .histogram(OPERATION_SIZE_BYTES, &driver_labels("dummy"))
            .unwrap();
        assert_eq!(size.count, 4);
    }

    #[test]
    fn test_histogram_buckets_are_cumulative() {
        let registry = MetricRegistry::new().unwrap();
        let labels = driver_labels("dummy");
        for value in [0.005, 0.01, 0.2, 3.0, 60.0] {
            registry.observe(OPERATION_DURATION_SECONDS, labels.clone(), value).unwrap();
        }

        let histogram = registry.histogram(OPERATION_DURATION_SECONDS, &labels).unwrap();
        let counts: Vec<u64> = histogram.buckets.iter().map(|(_, c)| *c).collect();
        assert_eq!(counts, vec![2, 2, 2, 3, 3, 3, 4, 4, 5]);
        assert_eq!(histogram.buckets.last().unwrap().0, f64::INFINITY);
        assert_eq!(histogram.count, 5);
        assert!((histogram.sum - 63.215).abs() < 1e-9);
    }

    #[test]
    fn test_rejects_misuse() {
        let registry = MetricRegistry::new().unwrap();
        assert!(matches!(
            registry.increment("nope", Labels::new()),
            Err(RegistryError::UnknownMetric(name)) if name == "nope"
        ));
        assert!(matches!(
            registry.observe(OPERATIONS_TOTAL, status_labels("success"), 1.0),
            Err(RegistryError::KindMismatch { .. })
        ));
        assert!(matches!(
            registry.increment(OPERATIONS_TOTAL, Labels::new().with("operation", "x")),
            Err(RegistryError::LabelMismatch { .. })
        ));
        assert_eq!(registry.counter_value(ACTIVE_WORKERS, &Labels::new()), None);
    }

    #[test]
    fn test_unlabelled_series_start_at_zero() {
        let registry = MetricRegistry::new().unwrap();
        assert_eq!(registry.gauge_value(ACTIVE_WORKERS, &Labels::new()), Some(0.0));
        assert_eq!(
            registry.counter_value(TRANSPORT_MALFORMED_TOTAL, &Labels::new()),
            Some(0.0)
        );

        registry.worker_connected();
        registry.worker_connected();
        registry.worker_disconnected();
        assert_eq!(registry.gauge_value(ACTIVE_WORKERS, &Labels::new()), Some(1.0));
    }

    #[test]
    fn test_concurrent_updates_are_not_lost() {
        let registry = Arc::new(MetricRegistry::new().unwrap());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        registry.record_operation(&download(true, 1));
                        let _ = registry.snapshot();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(
            registry.counter_value(OPERATIONS_TOTAL, &status_labels("success")),
            Some(4000.0)
        );
    }

    #[test]
    fn test_snapshot_is_consistent_under_writers() {
        let registry = Arc::new(MetricRegistry::new().unwrap());
        let writer = {
            let registry = registry.clone();
            std::thread::spawn(move || {
                for _ in 0..2000 {
                    registry.record_operation(&download(true, 5));
                }
            })
        };

        while !writer.is_finished() {
            let snapshot = registry.snapshot();
            let total = snapshot
                .families
                .iter()
                .find(|f| f.get_name() == OPERATIONS_TOTAL)
                .map(|f| f.get_metric()[0].get_counter().get_value() as u64);
            let observed = snapshot
                .families
                .iter()
                .find(|f| f.get_name() == OPERATION_DURATION_SECONDS)
                .map(|f| f.get_metric()[0].get_histogram().get_sample_count());
            assert_eq!(total, observed);
        }
        writer.join().unwrap();
    }

    #[test]
    fn test_driver_labels_are_capped() {
        let registry = MetricRegistry::new().unwrap();
        for i in 0..MAX_DRIVER_SERIES + 10 {
            registry.record_operation(&download_by(&format!("driver-{}", i), true, 5));
        }
        registry.record_operation(&download_by(&"x".repeat(MAX_DRIVER_LEN + 1), true, 5));
        registry.record_operation(&download_by("", true, 5));

        let families = registry.snapshot().families;
        let sizes = families
            .iter()
            .find(|f| f.get_name() == OPERATION_SIZE_BYTES)
            .unwrap();
        // One series per admitted driver, plus "other" and "unknown".
        assert_eq!(sizes.get_metric().len(), MAX_DRIVER_SERIES + 2);

        let other = registry
            .histogram(OPERATION_SIZE_BYTES, &driver_labels(OVERFLOW_DRIVER))
            .unwrap();
        assert_eq!(other.count, 11);
        let first = registry
            .histogram(OPERATION_SIZE_BYTES, &driver_labels("driver-0"))
            .unwrap();
        assert_eq!(first.count, 1);
        assert!(registry
            .histogram(OPERATION_SIZE_BYTES, &driver_labels("unknown"))
            .is_some());
    }
}
