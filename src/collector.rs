//! Per-worker collection of operation records.
//!
//! [`LocalCollector`] owns the records and run metadata of one run. Recording is
//! an in-memory push; windows are computed on demand by the owner, and the run
//! is exported once at the end. [`Recorder`] pairs a collector with a
//! [`RecordSink`] (normally the transport client) so that every record is
//! both kept locally and offered to the aggregator.

use crate::metrics::AggregatedWindow;
use crate::record::{OperationKind, OperationRecord, WorkloadKind};
use crate::results::{ExportOptions, ExportReport, ResultsManager, RunSummary, TestRunMetadata};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default aggregation window.
pub const DEFAULT_WINDOW: Duration = crate::defaults::WINDOW;

#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub window: Duration,
    pub export_dir: PathBuf,
    pub export: ExportOptions,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            window: DEFAULT_WINDOW,
            export_dir: PathBuf::from(crate::defaults::EXPORT_DIR),
            export: ExportOptions::default(),
        }
    }
}

/// Records, windows and metadata of one run
pub struct LocalCollector {
    config: CollectorConfig,
    metadata: TestRunMetadata,
    records: Vec<OperationRecord>,
    /// Index of the first record not yet covered by a window.
    pending_start: usize,
    window_start: DateTime<Utc>,
    windows: Vec<AggregatedWindow>,
}

impl LocalCollector {
    pub fn new(config: CollectorConfig, metadata: TestRunMetadata) -> Self {
        let window_start = metadata.start_time;
        Self {
            config,
            metadata,
            records: Vec::new(),
            pending_start: 0,
            window_start,
            windows: Vec::new(),
        }
    }

    /// Append one record. Never performs I/O.
    pub fn record(&mut self, record: OperationRecord) {
        self.records.push(record);
    }

    pub fn records(&self) -> &[OperationRecord] {
        &self.records
    }

    pub fn windows(&self) -> &[AggregatedWindow] {
        &self.windows
    }

    pub fn metadata(&self) -> &TestRunMetadata {
        &self.metadata
    }

    pub fn pending(&self) -> usize {
        self.records.len() - self.pending_start
    }

    /// Whether the current window has been open for at least the window length.
    pub fn window_due(&self, now: DateTime<Utc>) -> bool {
        (now - self.window_start)
            .to_std()
            .map(|elapsed| elapsed >= self.config.window)
            .unwrap_or(false)
    }

    /// Close the current window if it is due. Returns whether a flush happened.
    pub fn flush_if_due(&mut self, now: DateTime<Utc>) -> bool {
        if !self.window_due(now) {
            return false;
        }
        self.flush_window_at(now);
        true
    }

    pub fn flush_window(&mut self) -> &[AggregatedWindow] {
        self.flush_window_at(Utc::now())
    }

    /// Close the current window at `now`
    ///
    /// Produces one [`AggregatedWindow`] per (operation, workload) pair seen since
    /// the previous flush and returns the newly produced windows. An empty
    /// window produces nothing but still advances the window start.
    pub fn flush_window_at(&mut self, now: DateTime<Utc>) -> &[AggregatedWindow] {
        let first_new = self.windows.len();
        let window_end = now.max(self.window_start);

        let mut groups: BTreeMap<(OperationKind, WorkloadKind), Vec<&OperationRecord>> =
            BTreeMap::new();
        for record in &self.records[self.pending_start..] {
            groups
                .entry((record.operation(), record.workload()))
                .or_default()
                .push(record);
        }

        for ((operation, workload), group) in groups {
            self.windows.push(AggregatedWindow::from_records(
                &self.metadata.run_id,
                operation,
                workload,
                self.window_start,
                window_end,
                group,
            ));
        }

        debug!(
            run_id = %self.metadata.run_id,
            records = self.records.len() - self.pending_start,
            windows = self.windows.len() - first_new,
            "Window flushed"
        );

        self.pending_start = self.records.len();
        self.window_start = window_end;
        &self.windows[first_new..]
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary::from_records(&self.metadata, &self.records)
    }

    /// End the run and write its export files
    ///
    /// Flushes the last partial window, finalizes the metadata and exports.
    /// Export problems are reported in the returned value and logged; they
    /// never abort the run.
    pub fn finish(&mut self) -> ExportReport {
        let now = Utc::now();
        if self.pending() > 0 {
            self.flush_window_at(now);
        }
        self.metadata.finalize(now);

        let summary = self.summary();
        let manager = ResultsManager::new(self.config.export_dir.clone(), self.config.export);
        let report = manager.export_run(&self.metadata, &self.records, &self.windows, &summary);

        if report.is_complete() {
            info!(
                run_id = %self.metadata.run_id,
                operations = summary.operations.total,
                success_rate = %format!("{:.2}", summary.operations.success_rate),
                "Run finished"
            );
        } else {
            warn!(
                run_id = %self.metadata.run_id,
                failed = report.failed.len(),
                "Run finished with export errors"
            );
        }
        report
    }
}

/// Destination that receives a copy of each record as it is recorded
///
/// Delivery is best effort: implementations report whether the record was
/// handed off but must not fail or stall the caller.
#[async_trait]
pub trait RecordSink: Send {
    async fn deliver(&mut self, record: &OperationRecord) -> bool;
}

/// Sink that drops everything, for runs without an aggregator.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

#[async_trait]
impl RecordSink for NullSink {
    async fn deliver(&mut self, _record: &OperationRecord) -> bool {
        false
    }
}

/// Collector plus sink: the single entry point used by timed operations.
pub struct Recorder<S: RecordSink> {
    collector: LocalCollector,
    sink: S,
    delivered: u64,
    dropped: u64,
}

impl<S: RecordSink> Recorder<S> {
    pub fn new(collector: LocalCollector, sink: S) -> Self {
        Self {
            collector,
            sink,
            delivered: 0,
            dropped: 0,
        }
    }

    /// Offer the record to the sink, keep it locally, and close the window
    /// when it is due.
    pub async fn record(&mut self, record: OperationRecord) {
        if self.sink.deliver(&record).await {
            self.delivered += 1;
        } else {
            self.dropped += 1;
        }
        self.collector.record(record);
        self.collector.flush_if_due(Utc::now());
    }

    pub fn collector(&self) -> &LocalCollector {
        &self.collector
    }

    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn finish(mut self) -> (LocalCollector, ExportReport) {
        let report = self.collector.finish();
        (self.collector, report)
    }
}
