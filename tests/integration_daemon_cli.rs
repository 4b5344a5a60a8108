use std::path::Path;
use std::process::{Command, Output};

fn opmetrics(dir: &Path, args: &[&str]) -> Output {
    // Lifecycle paths come from the environment to exercise the env fallbacks.
    Command::new(env!("CARGO_BIN_EXE_opmetrics"))
        .args(args)
        .env("OPMETRICS_PID_FILE", dir.join("cli.pid"))
        .env("OPMETRICS_STATE_FILE", dir.join("cli_state.json"))
        .env("OPMETRICS_SOCKET", dir.join("cli.sock"))
        .env("OPMETRICS_LOG_DIR", dir)
        .env("OPMETRICS_HOST", "127.0.0.1")
        .env("OPMETRICS_PORT", "0")
        .env_remove("RUST_LOG")
        .output()
        .expect("run opmetrics")
}

fn code(output: &Output) -> i32 {
    output.status.code().expect("exit code")
}

#[test]
fn daemon_start_status_stop_exit_codes() {
    let dir = tempfile::tempdir().unwrap();

    assert_eq!(code(&opmetrics(dir.path(), &["daemon", "status"])), 3);
    assert_eq!(code(&opmetrics(dir.path(), &["daemon", "stop"])), 3);

    let start = opmetrics(dir.path(), &["daemon", "start"]);
    assert_eq!(code(&start), 0, "stderr: {}", String::from_utf8_lossy(&start.stderr));
    assert!(dir.path().join("cli.pid").exists());
    assert!(dir.path().join("cli.sock").exists());

    assert_eq!(code(&opmetrics(dir.path(), &["daemon", "status"])), 0);
    assert_eq!(code(&opmetrics(dir.path(), &["daemon", "start"])), 2);
    assert_eq!(
        code(&opmetrics(dir.path(), &["daemon", "start", "--if-not-running"])),
        0
    );

    let status = opmetrics(dir.path(), &["daemon", "status", "--json"]);
    assert_eq!(code(&status), 0);
    let json: serde_json::Value = serde_json::from_slice(&status.stdout).unwrap();
    assert_eq!(json["state"], "running");
    assert_eq!(json["stale"], false);
    assert!(json["summary"]["scrape_port"].as_u64().unwrap() > 0);

    assert_eq!(code(&opmetrics(dir.path(), &["daemon", "stop"])), 0);
    assert_eq!(code(&opmetrics(dir.path(), &["daemon", "status"])), 3);
    assert!(!dir.path().join("cli.pid").exists());
    assert!(!dir.path().join("cli.sock").exists());
    assert!(dir.path().join("opmetrics-aggregator.log").exists());
}

#[test]
fn daemon_start_over_stale_marker() {
    let dir = tempfile::tempdir().unwrap();
    let mut exited = Command::new("true").spawn().unwrap();
    let stale_pid = exited.id();
    exited.wait().unwrap();
    std::fs::write(dir.path().join("cli.pid"), format!("{}\n", stale_pid)).unwrap();

    assert_eq!(code(&opmetrics(dir.path(), &["daemon", "status"])), 3);

    let refused = opmetrics(dir.path(), &["daemon", "start"]);
    assert_eq!(code(&refused), 4);
    assert!(String::from_utf8_lossy(&refused.stderr).contains("--force"));

    assert_eq!(code(&opmetrics(dir.path(), &["daemon", "start", "--force"])), 5);
    assert_eq!(code(&opmetrics(dir.path(), &["daemon", "status"])), 0);
    assert_eq!(code(&opmetrics(dir.path(), &["daemon", "stop"])), 0);
}

#[test]
fn replay_without_aggregator_drops_and_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("operations.jsonl");
    let record = opmetrics::record::OperationRecord::builder(
        opmetrics::record::OperationKind::Write,
        opmetrics::record::WorkloadKind::BlockStorage,
    )
    .size_bytes(512)
    .started_at(chrono::Utc::now())
    .build()
    .unwrap();
    let mut line = serde_json::to_string(&record).unwrap();
    line.push('\n');
    std::fs::write(&file, line.repeat(3)).unwrap();

    let output = opmetrics(dir.path(), &["replay", file.to_str().unwrap(), "--send-timeout", "50ms"]);
    assert_eq!(code(&output), 0);
    assert!(String::from_utf8_lossy(&output.stderr).contains("3 dropped"));

    let missing = opmetrics(dir.path(), &["replay", "does-not-exist.jsonl"]);
    assert_eq!(code(&missing), 1);
}
