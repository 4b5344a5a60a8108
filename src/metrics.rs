//! Statistical aggregation over operation records.
//!
//! [`AggregatedWindow`] is computed by the local collector once per window for
//! every (operation, workload) group. The same [`StatisticalSummary`] is used
//! for run-level summaries in [`crate::results`].

use crate::record::{OperationKind, OperationRecord, WorkloadKind};
use crate::utils::{percentile, sort_samples};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Distribution statistics for one sample set.
///
/// All fields are zero for an empty sample set. Standard deviation and
/// variance are sample statistics and are zero for fewer than two samples.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StatisticalSummary {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub median: f64,
    pub p50: f64,
    pub p75: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
    pub p99_9: f64,
    pub stddev: f64,
    pub variance: f64,
}

impl StatisticalSummary {
    /// Summarize an unordered sample set.
    pub fn from_samples(samples: &[f64]) -> Self {
        let mut sorted = samples.to_vec();
        sort_samples(&mut sorted);
        Self::from_sorted(&sorted)
    }

    /// Summarize samples already sorted ascending.
    pub fn from_sorted(sorted: &[f64]) -> Self {
        if sorted.is_empty() {
            return Self::default();
        }

        let n = sorted.len() as f64;
        let mean = sorted.iter().sum::<f64>() / n;
        let variance = if sorted.len() > 1 {
            sorted.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1.0)
        } else {
            0.0
        };

        Self {
            min: sorted[0],
            max: sorted[sorted.len() - 1],
            mean,
            median: percentile(sorted, 50.0),
            p50: percentile(sorted, 50.0),
            p75: percentile(sorted, 75.0),
            p90: percentile(sorted, 90.0),
            p95: percentile(sorted, 95.0),
            p99: percentile(sorted, 99.0),
            p99_9: percentile(sorted, 99.9),
            stddev: variance.sqrt(),
            variance,
        }
    }

    /// Percentiles in rank order, p50 through p99.9.
    pub fn percentiles(&self) -> [f64; 6] {
        [self.p50, self.p75, self.p90, self.p95, self.p99, self.p99_9]
    }
}

/// Outcome tallies for a set of records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationCounts {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    /// Percentage in `[0, 100]`; 0 when `total` is 0.
    pub success_rate: f64,
}

impl OperationCounts {
    pub fn new(successful: u64, failed: u64) -> Self {
        let total = successful + failed;
        let success_rate = if total == 0 {
            0.0
        } else {
            successful as f64 / total as f64 * 100.0
        };
        Self {
            total,
            successful,
            failed,
            success_rate,
        }
    }

    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a OperationRecord>) -> Self {
        let (mut successful, mut failed) = (0, 0);
        for record in records {
            if record.success() {
                successful += 1;
            } else {
                failed += 1;
            }
        }
        Self::new(successful, failed)
    }
}

/// Payload size statistics across every record in a window, failed ones included.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SizeSummary {
    pub min: u64,
    pub max: u64,
    pub mean: f64,
    pub total: u64,
}

impl SizeSummary {
    fn from_sizes(sizes: &[u64]) -> Self {
        if sizes.is_empty() {
            return Self::default();
        }
        let total: u64 = sizes.iter().sum();
        Self {
            min: sizes.iter().copied().min().unwrap_or(0),
            max: sizes.iter().copied().max().unwrap_or(0),
            mean: total as f64 / sizes.len() as f64,
            total,
        }
    }
}

/// Requests observed per second and per minute.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestRate {
    pub rps: f64,
    pub rpm: f64,
}

impl RequestRate {
    pub fn new(count: u64, span_seconds: f64) -> Self {
        if span_seconds <= 0.0 {
            return Self::default();
        }
        let rps = count as f64 / span_seconds;
        Self { rps, rpm: rps * 60.0 }
    }
}

/// Statistical summary of records sharing an operation and workload kind
/// within one window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedWindow {
    pub run_id: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub window_seconds: f64,
    pub operation_type: OperationKind,
    pub workload_type: WorkloadKind,
    pub operations: OperationCounts,
    /// Successful records only.
    pub duration_ms: StatisticalSummary,
    /// Successful records with a defined throughput only.
    pub throughput_mbps: StatisticalSummary,
    pub object_size_bytes: SizeSummary,
    /// Bytes moved by successful operations.
    pub total_bytes: u64,
    pub request_rate: RequestRate,
}

impl AggregatedWindow {
    /// Aggregate one group of records collected between `window_start` and
    /// `window_end`.
    ///
    /// Callers are responsible for grouping; the kinds of the records are not
    /// checked against `operation` and `workload`.
    pub fn from_records<'a>(
        run_id: &str,
        operation: OperationKind,
        workload: WorkloadKind,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
        records: impl IntoIterator<Item = &'a OperationRecord>,
    ) -> Self {
        let mut durations = Vec::new();
        let mut throughputs = Vec::new();
        let mut sizes = Vec::new();
        let mut total_bytes = 0u64;
        let (mut successful, mut failed) = (0u64, 0u64);

        for record in records {
            sizes.push(record.size_bytes());
            if record.success() {
                successful += 1;
                total_bytes += record.size_bytes();
                durations.push(record.duration_ms());
                if let Some(mbps) = record.throughput_mbps() {
                    throughputs.push(mbps);
                }
            } else {
                failed += 1;
            }
        }

        let operations = OperationCounts::new(successful, failed);
        let span = (window_end - window_start)
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);

        Self {
            run_id: run_id.to_string(),
            window_start,
            window_end,
            window_seconds: span,
            operation_type: operation,
            workload_type: workload,
            operations,
            duration_ms: StatisticalSummary::from_samples(&durations),
            throughput_mbps: StatisticalSummary::from_samples(&throughputs),
            object_size_bytes: SizeSummary::from_sizes(&sizes),
            total_bytes,
            request_rate: RequestRate::new(operations.total, span),
        }
    }
}
