//! Run metadata, run summaries and run-end export files.
//!
//! [`ResultsManager`] writes every artifact of a finished run into one
//! directory. Each file goes through [`write_atomically`], so a crash mid-export
//! leaves either the previous file or nothing, never a truncated document that
//! still parses.

use crate::metrics::{AggregatedWindow, OperationCounts, StatisticalSummary};
use crate::record::{OperationKind, OperationRecord, RecordRepr, WorkloadKind};
use crate::utils::{get_cpu_cores, hostname, percentile, sort_samples, write_atomically};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const OPERATIONS_FILE: &str = "operations.json";
pub const SUMMARY_FILE: &str = "summary.json";
pub const METADATA_FILE: &str = "metadata.json";
pub const CSV_FILE: &str = "operations.csv";
pub const JSONL_FILE: &str = "operations.jsonl";

const CSV_COLUMNS: [&str; 15] = [
    "operation_id",
    "timestamp_start",
    "timestamp_end",
    "operation_type",
    "workload_type",
    "object_key",
    "object_size_bytes",
    "duration_ms",
    "throughput_mbps",
    "success",
    "error_code",
    "error_message",
    "retry_count",
    "driver",
    "user_id",
];

/// Host description recorded with each run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentInfo {
    pub hostname: String,
    pub os: String,
    pub architecture: String,
    pub cpu_cores: usize,
    pub version: String,
}

impl Default for EnvironmentInfo {
    fn default() -> Self {
        Self {
            hostname: hostname(),
            os: std::env::consts::OS.to_string(),
            architecture: std::env::consts::ARCH.to_string(),
            cpu_cores: get_cpu_cores(),
            version: crate::VERSION.to_string(),
        }
    }
}

/// Identity and parameters of one test run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestRunMetadata {
    pub run_id: String,
    pub name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    pub scenario: String,
    pub driver: String,
    pub workload: WorkloadKind,
    pub users: u32,
    pub processes: u32,
    pub environment: EnvironmentInfo,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub config: BTreeMap<String, serde_json::Value>,
}

impl TestRunMetadata {
    /// Start a new run now with a fresh run identifier.
    pub fn new(name: impl Into<String>, workload: WorkloadKind) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            name: name.into(),
            start_time: Utc::now(),
            end_time: None,
            duration_seconds: None,
            scenario: String::new(),
            driver: String::new(),
            workload,
            users: 1,
            processes: 1,
            environment: EnvironmentInfo::default(),
            tags: BTreeMap::new(),
            config: BTreeMap::new(),
        }
    }

    pub fn with_scenario(mut self, scenario: impl Into<String>) -> Self {
        self.scenario = scenario.into();
        self
    }

    pub fn with_driver(mut self, driver: impl Into<String>) -> Self {
        self.driver = driver.into();
        self
    }

    pub fn with_concurrency(mut self, users: u32, processes: u32) -> Self {
        self.users = users;
        self.processes = processes;
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn is_finished(&self) -> bool {
        self.end_time.is_some()
    }

    /// Stamp the end time. Calling it again keeps the first end time.
    pub fn finalize(&mut self, end: DateTime<Utc>) {
        if self.end_time.is_some() {
            return;
        }
        let end = end.max(self.start_time);
        self.end_time = Some(end);
        self.duration_seconds = (end - self.start_time)
            .to_std()
            .ok()
            .map(|d| d.as_secs_f64());
    }
}

/// Per-operation line of a run summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationBreakdown {
    pub count: u64,
    pub success_rate: f64,
    pub duration_mean_ms: f64,
    pub duration_p95_ms: f64,
    pub duration_p99_ms: f64,
    pub throughput_mean_mbps: f64,
    pub throughput_max_mbps: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorBreakdown {
    pub count: u64,
    pub by_code: BTreeMap<String, u64>,
}

/// Whole-run totals computed from every record of the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub operations: OperationCounts,
    pub total_bytes: u64,
    /// `None` when no operation succeeded.
    pub duration_ms: Option<StatisticalSummary>,
    pub throughput_mbps: Option<StatisticalSummary>,
    pub by_operation: BTreeMap<OperationKind, OperationBreakdown>,
    pub errors: ErrorBreakdown,
}

impl RunSummary {
    pub fn from_records(metadata: &TestRunMetadata, records: &[OperationRecord]) -> Self {
        let mut durations = Vec::new();
        let mut throughputs = Vec::new();
        let mut total_bytes = 0;
        let mut errors = ErrorBreakdown::default();
        let mut grouped: BTreeMap<OperationKind, Vec<&OperationRecord>> = BTreeMap::new();

        for record in records {
            grouped.entry(record.operation()).or_default().push(record);
            if record.success() {
                total_bytes += record.size_bytes();
                durations.push(record.duration_ms());
                throughputs.extend(record.throughput_mbps());
            } else {
                errors.count += 1;
                let code = record
                    .error()
                    .map(|e| e.code.clone())
                    .filter(|c| !c.is_empty())
                    .unwrap_or_else(|| "unknown".to_string());
                *errors.by_code.entry(code).or_default() += 1;
            }
        }

        let by_operation = grouped
            .into_iter()
            .map(|(kind, group)| (kind, breakdown(&group)))
            .collect();

        Self {
            run_id: metadata.run_id.clone(),
            name: metadata.name.clone(),
            start_time: metadata.start_time,
            end_time: metadata.end_time,
            operations: OperationCounts::from_records(records.iter()),
            total_bytes,
            duration_ms: (!durations.is_empty())
                .then(|| StatisticalSummary::from_samples(&durations)),
            throughput_mbps: (!throughputs.is_empty())
                .then(|| StatisticalSummary::from_samples(&throughputs)),
            by_operation,
            errors,
        }
    }
}

fn breakdown(group: &[&OperationRecord]) -> OperationBreakdown {
    let counts = OperationCounts::from_records(group.iter().copied());
    let mut durations: Vec<f64> = group
        .iter()
        .filter(|r| r.success())
        .map(|r| r.duration_ms())
        .collect();
    sort_samples(&mut durations);
    let throughputs: Vec<f64> = group.iter().filter_map(|r| r.throughput_mbps()).collect();

    let mean = |values: &[f64]| {
        if values.is_empty() {
            0.0
        } else {
            values.iter().sum::<f64>() / values.len() as f64
        }
    };

    OperationBreakdown {
        count: counts.total,
        success_rate: counts.success_rate,
        duration_mean_ms: mean(&durations),
        duration_p95_ms: percentile(&durations, 95.0),
        duration_p99_ms: percentile(&durations, 99.0),
        throughput_mean_mbps: mean(&throughputs),
        throughput_max_mbps: throughputs.iter().copied().fold(0.0, f64::max),
    }
}

/// Which optional formats accompany the JSON artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportOptions {
    pub csv: bool,
    pub jsonl: bool,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            csv: true,
            jsonl: true,
        }
    }
}

/// Outcome of an export: files written and files that failed.
#[derive(Debug, Default)]
pub struct ExportReport {
    pub written: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, String)>,
}

impl ExportReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    fn track(&mut self, path: PathBuf, result: Result<()>) {
        match result {
            Ok(()) => {
                debug!(path = %path.display(), "Export file written");
                self.written.push(path);
            }
            Err(e) => {
                warn!(path = %path.display(), "Export file failed: {:#}", e);
                self.failed.push((path, format!("{:#}", e)));
            }
        }
    }
}

#[derive(Serialize)]
struct SummaryDocument<'a> {
    summary: &'a RunSummary,
    windows: &'a [AggregatedWindow],
}

/// Writes run artifacts into an output directory
pub struct ResultsManager {
    output_dir: PathBuf,
    options: ExportOptions,
}

impl ResultsManager {
    pub fn new(output_dir: impl Into<PathBuf>, options: ExportOptions) -> Self {
        Self {
            output_dir: output_dir.into(),
            options,
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Write every artifact of a run
    ///
    /// Failures are collected in the returned report; one failed file does not
    /// stop the others from being written.
    pub fn export_run(
        &self,
        metadata: &TestRunMetadata,
        records: &[OperationRecord],
        windows: &[AggregatedWindow],
        summary: &RunSummary,
    ) -> ExportReport {
        let mut report = ExportReport::default();

        if let Err(e) = std::fs::create_dir_all(&self.output_dir) {
            warn!(dir = %self.output_dir.display(), "Cannot create export directory: {}", e);
            report
                .failed
                .push((self.output_dir.clone(), format!("create directory: {}", e)));
            return report;
        }

        let path = self.output_dir.join(OPERATIONS_FILE);
        report.track(path.clone(), write_json(&path, &records));

        let path = self.output_dir.join(SUMMARY_FILE);
        let document = SummaryDocument { summary, windows };
        report.track(path.clone(), write_json(&path, &document));

        let path = self.output_dir.join(METADATA_FILE);
        report.track(path.clone(), write_json(&path, metadata));

        if self.options.csv {
            let path = self.output_dir.join(CSV_FILE);
            report.track(path.clone(), write_csv(&path, records));
        }
        if self.options.jsonl {
            let path = self.output_dir.join(JSONL_FILE);
            report.track(path.clone(), write_jsonl(&path, records));
        }

        info!(
            dir = %self.output_dir.display(),
            records = records.len(),
            windows = windows.len(),
            failed = report.failed.len(),
            "Run export finished"
        );
        report
    }
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(value).context("Failed to serialize export")?;
    write_atomically(path, &json)
}

fn write_jsonl(path: &Path, records: &[OperationRecord]) -> Result<()> {
    let mut out = Vec::new();
    for record in records {
        serde_json::to_writer(&mut out, record).context("Failed to serialize record")?;
        out.push(b'\n');
    }
    write_atomically(path, &out)
}

fn write_csv(path: &Path, records: &[OperationRecord]) -> Result<()> {
    let mut out = String::new();
    out.push_str(&CSV_COLUMNS.join(","));
    out.push('\n');

    for record in records {
        let repr = RecordRepr::from(record.clone());
        let fields = [
            repr.operation_id.to_string(),
            repr.timestamp_start.to_rfc3339(),
            repr.timestamp_end.to_rfc3339(),
            repr.operation_type.to_string(),
            repr.workload_type.to_string(),
            repr.object_key,
            repr.object_size_bytes.to_string(),
            format!("{:.3}", repr.duration_ms),
            repr.throughput_mbps
                .map(|t| format!("{:.3}", t))
                .unwrap_or_default(),
            repr.success.to_string(),
            repr.error_code.unwrap_or_default(),
            repr.error_message.unwrap_or_default(),
            repr.retry_count.to_string(),
            repr.driver,
            repr.user_id,
        ];
        for (i, field) in fields.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            let _ = write!(out, "{}", csv_field(field));
        }
        out.push('\n');
    }

    write_atomically(path, out.as_bytes())
}

/// Quote a CSV field when it contains a delimiter, quote or line break.
fn csv_field(value: &str) -> std::borrow::Cow<'_, str> {
    if value.contains([',', '"', '\n', '\r']) {
        std::borrow::Cow::Owned(format!("\"{}\"", value.replace('"', "\"\"")))
    } else {
        std::borrow::Cow::Borrowed(value)
    }
}

/// Read records back from a JSONL export, skipping blank lines.
pub fn read_jsonl(path: &Path) -> Result<Vec<OperationRecord>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    contents
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("{}:{}: invalid record", path.display(), n + 1))
        })
        .collect()
}
