//! # opmetrics
//!
//! Metrics aggregation for storage load generators. Many short-lived worker
//! processes time storage operations; their results are combined into one
//! continuously scrapeable view by a long-lived aggregator daemon, and each
//! worker also exports its own run to disk.
//!
//! ## Architecture Overview
//!
//! - `record`: the [`OperationRecord`] produced by every timed operation
//! - `collector`: per-worker [`LocalCollector`] and the [`Recorder`] facade
//! - `metrics`: statistical summaries and aggregated windows
//! - `results`: run metadata, run summary and run-end export files
//! - `ipc`: framing plus the transport client (workers) and server (aggregator)
//! - `registry`: the aggregator's concurrent [`MetricRegistry`]
//! - `exposition`: text exposition rendering and the HTTP scrape endpoint
//! - `aggregator`: the daemon process body
//! - `lifecycle`: start, stop and status of the daemon from other processes
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use opmetrics::collector::{CollectorConfig, LocalCollector, Recorder};
//! use opmetrics::ipc::{ClientConfig, TransportClient};
//! use opmetrics::record::{OperationKind, OperationTimer, WorkloadKind};
//! use opmetrics::results::TestRunMetadata;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let metadata = TestRunMetadata::new("nightly", WorkloadKind::ObjectStorage);
//!     let collector = LocalCollector::new(CollectorConfig::default(), metadata);
//!     let mut recorder = Recorder::new(collector, TransportClient::new(ClientConfig::default()));
//!
//!     let timer = OperationTimer::start(OperationKind::Upload, WorkloadKind::ObjectStorage);
//!     // ... perform the upload ...
//!     let record = timer.finish().key("bucket/object").size_bytes(4096).build()?;
//!     recorder.record(record).await;
//!
//!     let (_collector, report) = recorder.finish();
//!     println!("wrote {} files", report.written.len());
//!     Ok(())
//! }
//! ```

/// Daemon process body: registry, transport server and scrape endpoint
pub mod aggregator;

/// Command-line interface and configuration
pub mod cli;

/// Local collection of records and the sink seam toward the aggregator
pub mod collector;

/// Prometheus text rendering and the HTTP scrape endpoint
pub mod exposition;

/// Inter-process transport between workers and the aggregator
///
/// Length-prefixed JSON frames over a Unix domain socket. The client side
/// never blocks the measured operation beyond its send timeout; the server
/// side tolerates workers that connect, disconnect or crash at any time.
pub mod ipc;

/// Start, stop, status and stale-state recovery for the daemon
pub mod lifecycle;

pub mod logging;

/// Statistical analysis of operation samples
///
/// Percentiles use linear interpolation between closest ranks; standard
/// deviation and variance are sample statistics.
pub mod metrics;

pub mod record;

/// Shared, thread-safe metric store of the aggregator
pub mod registry;

/// Run metadata, summaries and export files
pub mod results;

pub mod utils;

pub use collector::{LocalCollector, Recorder, RecordSink};
pub use record::{OperationKind, OperationRecord, OperationTimer, WorkloadKind};
pub use registry::MetricRegistry;

/// Current version of the crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod defaults {
    use std::time::Duration;

    /// Aggregation window of the local collector
    pub const WINDOW: Duration = Duration::from_secs(10);

    /// Worker connections the aggregator services at once
    pub const MAX_CONNECTIONS: usize = 256;

    /// Budget for one transport send, connection included
    pub const SEND_TIMEOUT: Duration = Duration::from_millis(250);

    /// Directory for run-end export files
    pub const EXPORT_DIR: &str = "results";
}
