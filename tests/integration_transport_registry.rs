use opmetrics::ipc::{
    encode_frame, write_frame, ClientConfig, TransportClient, TransportConfig, TransportServer,
};
use opmetrics::record::{OperationKind, OperationRecord, WorkloadKind};
use opmetrics::registry::{
    Labels, MetricRegistry, ACTIVE_WORKERS, BYTES_TOTAL, OPERATIONS_TOTAL,
    OPERATION_DURATION_SECONDS, TRANSPORT_MALFORMED_TOTAL,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio::sync::watch;

const CLIENTS: usize = 8;
const RECORDS_PER_CLIENT: usize = 250;

fn transport_config(dir: &Path) -> TransportConfig {
    TransportConfig {
        socket_path: dir.join("aggregator.sock"),
        accept_poll: Duration::from_millis(50),
        ..TransportConfig::default()
    }
}

fn record(worker: usize, success: bool) -> OperationRecord {
    let start = chrono::Utc::now();
    let builder = OperationRecord::builder(OperationKind::Upload, WorkloadKind::ObjectStorage)
        .key(format!("bucket/worker-{}", worker))
        .size_bytes(1024)
        .driver("dummy")
        .worker_id(format!("worker-{}", worker))
        .started_at(start)
        .finished_at(start + chrono::Duration::milliseconds(5));
    if success {
        builder.build().unwrap()
    } else {
        builder.failed("InternalError", "injected").build().unwrap()
    }
}

fn status_labels(status: &str) -> Labels {
    Labels::new()
        .with("operation", "upload")
        .with("workload", "object-storage")
        .with("status", status)
}

async fn wait_for(registry: &MetricRegistry, labels: &Labels, expected: f64) {
    for _ in 0..500 {
        if registry.counter_value(OPERATIONS_TOTAL, labels) == Some(expected) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "expected {} operations, registry has {:?}",
        expected,
        registry.counter_value(OPERATIONS_TOTAL, labels)
    );
}

/// Every record sent by concurrent workers is counted exactly once.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_workers_are_counted_exactly() {
    let dir = tempfile::tempdir().unwrap();
    let config = transport_config(dir.path());
    let socket_path = config.socket_path.clone();
    let registry = Arc::new(MetricRegistry::new().unwrap());
    let server = TransportServer::bind(config, Arc::clone(&registry)).unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server_task = tokio::spawn(server.serve(shutdown_rx));

    let mut workers = Vec::new();
    for worker in 0..CLIENTS {
        let socket_path = socket_path.clone();
        workers.push(tokio::spawn(async move {
            let mut client = TransportClient::new(ClientConfig {
                socket_path,
                send_timeout: Duration::from_secs(2),
            });
            for i in 0..RECORDS_PER_CLIENT {
                // Every tenth record is a failure.
                assert!(client.send(&record(worker, i % 10 != 0)).await);
            }
            client.close().await;
            client.sent()
        }));
    }

    let mut sent = 0;
    for worker in workers {
        sent += worker.await.unwrap();
    }
    assert_eq!(sent as usize, CLIENTS * RECORDS_PER_CLIENT);

    let failures = (CLIENTS * RECORDS_PER_CLIENT / 10) as f64;
    let successes = (CLIENTS * RECORDS_PER_CLIENT) as f64 - failures;
    wait_for(&registry, &status_labels("success"), successes).await;
    wait_for(&registry, &status_labels("failure"), failures).await;

    let driver_labels = Labels::new()
        .with("operation", "upload")
        .with("workload", "object-storage")
        .with("driver", "dummy");
    let histogram = registry
        .histogram(OPERATION_DURATION_SECONDS, &driver_labels)
        .unwrap();
    assert_eq!(histogram.count as f64, successes);
    assert_eq!(
        registry.counter_value(BYTES_TOTAL, &status_labels("success")),
        Some(successes * 1024.0)
    );

    shutdown_tx.send(true).unwrap();
    server_task.await.unwrap();
    assert_eq!(registry.gauge_value(ACTIVE_WORKERS, &Labels::new()), Some(0.0));
    assert!(!socket_path.exists());
}

/// A payload that frames correctly but is not a record is discarded without
/// closing the connection.
#[tokio::test]
async fn malformed_record_does_not_poison_connection() {
    let dir = tempfile::tempdir().unwrap();
    let config = transport_config(dir.path());
    let socket_path = config.socket_path.clone();
    let registry = Arc::new(MetricRegistry::new().unwrap());
    let server = TransportServer::bind(config, Arc::clone(&registry)).unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server_task = tokio::spawn(server.serve(shutdown_rx));

    let mut stream = UnixStream::connect(&socket_path).await.unwrap();
    stream
        .write_all(&encode_frame(&record(0, true)).unwrap())
        .await
        .unwrap();
    write_frame(&mut stream, b"definitely not json").await.unwrap();
    // Valid JSON, but the end precedes the start.
    let mut inverted = serde_json::to_value(record(0, true)).unwrap();
    inverted["timestamp_end"] = serde_json::json!("2000-01-01T00:00:00Z");
    write_frame(&mut stream, &serde_json::to_vec(&inverted).unwrap())
        .await
        .unwrap();
    stream
        .write_all(&encode_frame(&record(0, true)).unwrap())
        .await
        .unwrap();

    wait_for(&registry, &status_labels("success"), 2.0).await;
    assert_eq!(
        registry.counter_value(TRANSPORT_MALFORMED_TOTAL, &Labels::new()),
        Some(2.0)
    );

    drop(stream);
    shutdown_tx.send(true).unwrap();
    server_task.await.unwrap();
}

/// A worker that dies mid-frame affects neither the registry nor other workers.
#[tokio::test]
async fn crashed_worker_mid_frame_is_tolerated() {
    let dir = tempfile::tempdir().unwrap();
    let config = transport_config(dir.path());
    let socket_path = config.socket_path.clone();
    let registry = Arc::new(MetricRegistry::new().unwrap());
    let server = TransportServer::bind(config, Arc::clone(&registry)).unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server_task = tokio::spawn(server.serve(shutdown_rx));

    let frame = encode_frame(&record(1, true)).unwrap();
    let mut crashing = UnixStream::connect(&socket_path).await.unwrap();
    crashing.write_all(&frame[..frame.len() / 2]).await.unwrap();
    drop(crashing);

    let mut client = TransportClient::new(ClientConfig {
        socket_path: socket_path.clone(),
        send_timeout: Duration::from_secs(1),
    });
    for _ in 0..3 {
        assert!(client.send(&record(2, true)).await);
    }

    wait_for(&registry, &status_labels("success"), 3.0).await;
    client.close().await;
    shutdown_tx.send(true).unwrap();
    server_task.await.unwrap();
}

/// Records already written when shutdown begins are still applied.
#[tokio::test]
async fn shutdown_drains_buffered_records() {
    let dir = tempfile::tempdir().unwrap();
    let config = transport_config(dir.path());
    let socket_path = config.socket_path.clone();
    let registry = Arc::new(MetricRegistry::new().unwrap());
    let server = TransportServer::bind(config, Arc::clone(&registry)).unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server_task = tokio::spawn(server.serve(shutdown_rx));

    let mut client = TransportClient::new(ClientConfig {
        socket_path,
        send_timeout: Duration::from_secs(1),
    });
    for _ in 0..20 {
        assert!(client.send(&record(3, true)).await);
    }
    // Make sure the connection was accepted before shutdown begins.
    for _ in 0..500 {
        if registry.gauge_value(ACTIVE_WORKERS, &Labels::new()) == Some(1.0) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    shutdown_tx.send(true).unwrap();
    server_task.await.unwrap();

    assert_eq!(
        registry.counter_value(OPERATIONS_TOTAL, &status_labels("success")),
        Some(20.0)
    );
}
