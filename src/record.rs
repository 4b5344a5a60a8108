//! # Operation Records
//!
//! An [`OperationRecord`] describes one completed, timed storage operation and
//! its outcome. Records are produced by the workload layer (through
//! [`OperationTimer`] or [`RecordBuilder`]), stored by the local collector and
//! shipped to the aggregator over the transport.
//!
//! ## Invariants
//!
//! - `finished_at >= started_at`, enforced at construction and again when a
//!   record is decoded from the wire
//! - duration is derived from the two timestamps and cannot be set directly
//! - throughput exists only for successful records with a non-zero duration
//! - error details are present only on failed records
//!
//! Timestamps are truncated to microsecond resolution when a record is built.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Bytes per MB used for throughput figures.
pub const BYTES_PER_MB: f64 = 1_048_576.0;

/// Storage operation kinds a workload can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Upload,
    Download,
    Delete,
    List,
    Head,
    Read,
    Write,
}

impl OperationKind {
    pub const ALL: [OperationKind; 7] = [
        OperationKind::Upload,
        OperationKind::Download,
        OperationKind::Delete,
        OperationKind::List,
        OperationKind::Head,
        OperationKind::Read,
        OperationKind::Write,
    ];

    /// Label value used in exports and exposition output.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Upload => "upload",
            OperationKind::Download => "download",
            OperationKind::Delete => "delete",
            OperationKind::List => "list",
            OperationKind::Head => "head",
            OperationKind::Read => "read",
            OperationKind::Write => "write",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Family of storage system a workload drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkloadKind {
    #[serde(alias = "s3")]
    ObjectStorage,
    #[serde(alias = "rbd")]
    BlockStorage,
}

impl WorkloadKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadKind::ObjectStorage => "object-storage",
            WorkloadKind::BlockStorage => "block-storage",
        }
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error details attached to a failed operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationError {
    pub code: String,
    pub message: String,
}

/// Reasons a record cannot be constructed or decoded.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("operation finished at {finished} before it started at {started}")]
    EndBeforeStart {
        started: DateTime<Utc>,
        finished: DateTime<Utc>,
    },

    #[error("successful operation {0} carries error details")]
    ErrorOnSuccess(Uuid),

    #[error("record is missing its {0} timestamp")]
    MissingTimestamp(&'static str),
}

/// One completed storage operation.
///
/// Fields are private so that the timestamp invariant and the derived
/// duration/throughput cannot drift apart; use [`OperationRecord::builder`] or
/// [`OperationTimer`] to create one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "RecordRepr", try_from = "RecordRepr")]
pub struct OperationRecord {
    operation_id: Uuid,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    operation: OperationKind,
    workload: WorkloadKind,
    key: String,
    size_bytes: u64,
    success: bool,
    error: Option<OperationError>,
    retry_count: u32,
    driver: String,
    worker_id: String,
    metadata: BTreeMap<String, serde_json::Value>,
}

impl OperationRecord {
    /// Start building a record for the given operation.
    pub fn builder(operation: OperationKind, workload: WorkloadKind) -> RecordBuilder {
        RecordBuilder::new(operation, workload)
    }

    pub fn operation_id(&self) -> Uuid {
        self.operation_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn finished_at(&self) -> DateTime<Utc> {
        self.finished_at
    }

    pub fn operation(&self) -> OperationKind {
        self.operation
    }

    pub fn workload(&self) -> WorkloadKind {
        self.workload
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn success(&self) -> bool {
        self.success
    }

    pub fn error(&self) -> Option<&OperationError> {
        self.error.as_ref()
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn driver(&self) -> &str {
        &self.driver
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn metadata(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.metadata
    }

    /// Elapsed time between start and end, in milliseconds.
    pub fn duration_ms(&self) -> f64 {
        let micros = (self.finished_at - self.started_at)
            .num_microseconds()
            .unwrap_or(i64::MAX);
        micros as f64 / 1_000.0
    }

    /// Throughput in MB/s, `None` for failed or zero-duration operations.
    pub fn throughput_mbps(&self) -> Option<f64> {
        let duration_ms = self.duration_ms();
        if !self.success || duration_ms <= 0.0 {
            return None;
        }
        Some((self.size_bytes as f64 / BYTES_PER_MB) / (duration_ms / 1_000.0))
    }

    fn validate(&self) -> Result<(), RecordError> {
        if self.finished_at < self.started_at {
            return Err(RecordError::EndBeforeStart {
                started: self.started_at,
                finished: self.finished_at,
            });
        }
        if self.success && self.error.is_some() {
            return Err(RecordError::ErrorOnSuccess(self.operation_id));
        }
        Ok(())
    }
}

/// Builder for [`OperationRecord`].
#[derive(Debug, Clone)]
pub struct RecordBuilder {
    operation_id: Uuid,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    operation: OperationKind,
    workload: WorkloadKind,
    key: String,
    size_bytes: u64,
    success: bool,
    error: Option<OperationError>,
    retry_count: u32,
    driver: String,
    worker_id: String,
    metadata: BTreeMap<String, serde_json::Value>,
}

impl RecordBuilder {
    fn new(operation: OperationKind, workload: WorkloadKind) -> Self {
        Self {
            operation_id: Uuid::new_v4(),
            started_at: None,
            finished_at: None,
            operation,
            workload,
            key: String::new(),
            size_bytes: 0,
            success: true,
            error: None,
            retry_count: 0,
            driver: String::new(),
            worker_id: String::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn operation_id(mut self, id: Uuid) -> Self {
        self.operation_id = id;
        self
    }

    pub fn started_at(mut self, at: DateTime<Utc>) -> Self {
        self.started_at = Some(at);
        self
    }

    pub fn finished_at(mut self, at: DateTime<Utc>) -> Self {
        self.finished_at = Some(at);
        self
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    pub fn size_bytes(mut self, size: u64) -> Self {
        self.size_bytes = size;
        self
    }

    pub fn retry_count(mut self, retries: u32) -> Self {
        self.retry_count = retries;
        self
    }

    pub fn driver(mut self, driver: impl Into<String>) -> Self {
        self.driver = driver.into();
        self
    }

    pub fn worker_id(mut self, worker: impl Into<String>) -> Self {
        self.worker_id = worker.into();
        self
    }

    /// Attach one operation-specific detail (e.g. `"multipart": true`).
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn succeeded(mut self) -> Self {
        self.success = true;
        self.error = None;
        self
    }

    pub fn failed(mut self, code: impl Into<String>, message: impl Into<String>) -> Self {
        self.success = false;
        self.error = Some(OperationError {
            code: code.into(),
            message: message.into(),
        });
        self
    }

    /// Validate and produce the record.
    ///
    /// A missing end timestamp defaults to the start timestamp, which is how
    /// operations that failed before doing any work are reported.
    pub fn build(self) -> Result<OperationRecord, RecordError> {
        let started_at = self
            .started_at
            .ok_or(RecordError::MissingTimestamp("start"))?
            .trunc_subsecs(6);
        let finished_at = self
            .finished_at
            .map(|at| at.trunc_subsecs(6))
            .unwrap_or(started_at);

        let record = OperationRecord {
            operation_id: self.operation_id,
            started_at,
            finished_at,
            operation: self.operation,
            workload: self.workload,
            key: self.key,
            size_bytes: self.size_bytes,
            success: self.success,
            error: self.error,
            retry_count: self.retry_count,
            driver: self.driver,
            worker_id: self.worker_id,
            metadata: self.metadata,
        };
        record.validate()?;
        Ok(record)
    }
}

/// Captures identity and start time when an operation begins.
///
/// ```rust
/// use opmetrics::record::{OperationKind, OperationTimer, WorkloadKind};
///
/// let timer = OperationTimer::start(OperationKind::Upload, WorkloadKind::ObjectStorage);
/// // ... perform the upload ...
/// let record = timer
///     .finish()
///     .key("bucket/object-1")
///     .size_bytes(4096)
///     .succeeded()
///     .build()
///     .unwrap();
/// assert!(record.success());
/// ```
#[derive(Debug, Clone)]
pub struct OperationTimer {
    builder: RecordBuilder,
}

impl OperationTimer {
    pub fn start(operation: OperationKind, workload: WorkloadKind) -> Self {
        Self {
            builder: RecordBuilder::new(operation, workload).started_at(Utc::now()),
        }
    }

    pub fn operation_id(&self) -> Uuid {
        self.builder.operation_id
    }

    /// Stamp the end time and hand back the builder to fill in the outcome.
    pub fn finish(self) -> RecordBuilder {
        self.builder.finished_at(Utc::now())
    }
}

/// Serialized shape of a record, shared by the wire format and the exports.
///
/// `duration_ms` and `throughput_mbps` are written for readers but ignored on
/// input; they are always re-derived from the timestamps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct RecordRepr {
    pub operation_id: Uuid,
    pub timestamp_start: DateTime<Utc>,
    pub timestamp_end: DateTime<Utc>,
    pub operation_type: OperationKind,
    pub workload_type: WorkloadKind,
    pub object_key: String,
    pub object_size_bytes: u64,
    #[serde(default)]
    pub duration_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub throughput_mbps: Option<f64>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub driver: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl From<OperationRecord> for RecordRepr {
    fn from(record: OperationRecord) -> Self {
        let duration_ms = record.duration_ms();
        let throughput_mbps = record.throughput_mbps();
        let (error_code, error_message) = match record.error {
            Some(err) => (Some(err.code), Some(err.message)),
            None => (None, None),
        };
        Self {
            operation_id: record.operation_id,
            timestamp_start: record.started_at,
            timestamp_end: record.finished_at,
            operation_type: record.operation,
            workload_type: record.workload,
            object_key: record.key,
            object_size_bytes: record.size_bytes,
            duration_ms,
            throughput_mbps,
            success: record.success,
            error_code,
            error_message,
            retry_count: record.retry_count,
            driver: record.driver,
            user_id: record.worker_id,
            metadata: record.metadata,
        }
    }
}

impl TryFrom<RecordRepr> for OperationRecord {
    type Error = RecordError;

    fn try_from(repr: RecordRepr) -> Result<Self, Self::Error> {
        let error = if repr.success {
            if repr.error_code.is_some() || repr.error_message.is_some() {
                return Err(RecordError::ErrorOnSuccess(repr.operation_id));
            }
            None
        } else {
            Some(OperationError {
                code: repr.error_code.unwrap_or_default(),
                message: repr.error_message.unwrap_or_default(),
            })
        };

        let record = OperationRecord {
            operation_id: repr.operation_id,
            started_at: repr.timestamp_start,
            finished_at: repr.timestamp_end,
            operation: repr.operation_type,
            workload: repr.workload_type,
            key: repr.object_key,
            size_bytes: repr.object_size_bytes,
            success: repr.success,
            error,
            retry_count: repr.retry_count,
            driver: repr.driver,
            worker_id: repr.user_id,
            metadata: repr.metadata,
        };
        record.validate()?;
        Ok(record)
    }
}
