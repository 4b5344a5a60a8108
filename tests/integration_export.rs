use opmetrics::collector::{CollectorConfig, LocalCollector, NullSink, Recorder};
use opmetrics::ipc::{ClientConfig, TransportClient};
use opmetrics::record::{OperationKind, OperationRecord, WorkloadKind};
use opmetrics::results::{
    read_jsonl, ExportOptions, TestRunMetadata, CSV_FILE, JSONL_FILE, METADATA_FILE,
    OPERATIONS_FILE, SUMMARY_FILE,
};
use std::path::Path;
use std::time::Duration;

fn run_metadata() -> TestRunMetadata {
    TestRunMetadata::new("export-smoke", WorkloadKind::ObjectStorage)
        .with_scenario("mixed")
        .with_driver("dummy")
        .with_concurrency(4, 2)
        .with_tag("suite", "integration")
}

fn operation(kind: OperationKind, success: bool, ms: i64) -> OperationRecord {
    let start = chrono::Utc::now();
    let builder = OperationRecord::builder(kind, WorkloadKind::ObjectStorage)
        .key("bucket/object")
        .size_bytes(2 * 1_048_576)
        .driver("dummy")
        .started_at(start)
        .finished_at(start + chrono::Duration::milliseconds(ms));
    if success {
        builder.build().unwrap()
    } else {
        builder.failed("SlowDown", "Please reduce your request rate").build().unwrap()
    }
}

fn read_json(path: &Path) -> serde_json::Value {
    serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap()
}

/// A run recorded with no aggregator running still exports every artifact.
#[tokio::test]
async fn run_without_aggregator_exports_all_files() {
    let dir = tempfile::tempdir().unwrap();
    let export_dir = dir.path().join("run");
    let collector = LocalCollector::new(
        CollectorConfig {
            window: Duration::from_secs(3600),
            export_dir: export_dir.clone(),
            export: ExportOptions::default(),
        },
        run_metadata(),
    );
    let client = TransportClient::new(ClientConfig {
        socket_path: dir.path().join("nobody-listens.sock"),
        send_timeout: Duration::from_millis(50),
    });
    let mut recorder = Recorder::new(collector, client);

    for i in 0..10 {
        recorder.record(operation(OperationKind::Upload, true, 10 + i)).await;
    }
    for _ in 0..5 {
        recorder.record(operation(OperationKind::Upload, false, 5)).await;
    }
    recorder.record(operation(OperationKind::Download, true, 20)).await;

    assert_eq!(recorder.delivered(), 0);
    assert_eq!(recorder.dropped(), 16);

    let (collector, report) = recorder.finish();
    assert!(report.is_complete(), "export failures: {:?}", report.failed);
    assert_eq!(report.written.len(), 5);
    assert!(collector.metadata().is_finished());

    for file in [OPERATIONS_FILE, SUMMARY_FILE, METADATA_FILE, CSV_FILE, JSONL_FILE] {
        assert!(export_dir.join(file).exists(), "{} missing", file);
    }
    // Nothing but the artifacts: no leftover temporary files.
    assert_eq!(std::fs::read_dir(&export_dir).unwrap().count(), 5);

    let operations = read_json(&export_dir.join(OPERATIONS_FILE));
    assert_eq!(operations.as_array().unwrap().len(), 16);

    let summary = read_json(&export_dir.join(SUMMARY_FILE));
    assert_eq!(summary["summary"]["operations"]["total"], 16);
    assert_eq!(summary["summary"]["operations"]["failed"], 5);
    assert_eq!(summary["summary"]["errors"]["by_code"]["SlowDown"], 5);
    assert_eq!(summary["summary"]["total_bytes"], 11 * 2 * 1_048_576u64);

    let windows = summary["windows"].as_array().unwrap();
    assert_eq!(windows.len(), 2);
    let upload = windows
        .iter()
        .find(|w| w["operation_type"] == "upload")
        .unwrap();
    assert_eq!(upload["operations"]["total"], 15);
    assert_eq!(upload["operations"]["successful"], 10);

    let metadata = read_json(&export_dir.join(METADATA_FILE));
    assert_eq!(metadata["name"], "export-smoke");
    assert_eq!(metadata["tags"]["suite"], "integration");
    assert!(metadata["end_time"].is_string());

    let csv = std::fs::read_to_string(export_dir.join(CSV_FILE)).unwrap();
    let mut lines = csv.lines();
    assert!(lines.next().unwrap().starts_with("operation_id,timestamp_start,"));
    assert_eq!(lines.count(), 16);

    let replayed = read_jsonl(&export_dir.join(JSONL_FILE)).unwrap();
    assert_eq!(replayed.len(), 16);
    assert_eq!(replayed, collector.records());
}

/// Optional formats can be switched off.
#[tokio::test]
async fn optional_formats_are_skipped_when_disabled() {
    let dir = tempfile::tempdir().unwrap();
    let collector = LocalCollector::new(
        CollectorConfig {
            window: Duration::from_secs(3600),
            export_dir: dir.path().to_path_buf(),
            export: ExportOptions {
                csv: false,
                jsonl: false,
            },
        },
        run_metadata(),
    );
    let mut recorder = Recorder::new(collector, NullSink);
    recorder.record(operation(OperationKind::Head, true, 1)).await;

    let (_collector, report) = recorder.finish();
    assert!(report.is_complete());
    assert_eq!(report.written.len(), 3);
    assert!(!dir.path().join(CSV_FILE).exists());
    assert!(!dir.path().join(JSONL_FILE).exists());
}

/// An unwritable export directory is reported, not raised.
#[tokio::test]
async fn export_failure_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("not-a-dir");
    std::fs::write(&blocker, b"file in the way").unwrap();

    let mut collector = LocalCollector::new(
        CollectorConfig {
            window: Duration::from_secs(3600),
            export_dir: blocker.join("run"),
            export: ExportOptions::default(),
        },
        run_metadata(),
    );
    collector.record(operation(OperationKind::List, true, 1));

    let report = collector.finish();
    assert!(!report.is_complete());
    assert!(report.written.is_empty());
}
