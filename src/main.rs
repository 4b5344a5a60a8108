//! # opmetrics - Main Entry Point
//!
//! Dispatches the three command groups:
//!
//! - `daemon start|stop|status` control the background aggregator and exit
//!   with the codes in [`opmetrics::lifecycle::exit_codes`]
//! - `serve` is the aggregator process itself
//! - `replay` feeds a JSONL export back into a running aggregator

use clap::Parser;
use opmetrics::aggregator::{Aggregator, AggregatorConfig, ShutdownSignals};
use opmetrics::cli::{Args, Commands, DaemonAction, ServerArgs};
use opmetrics::ipc::{ClientConfig, TransportClient};
use opmetrics::lifecycle::{
    exit_codes, DaemonPaths, LifecycleError, LifecycleManager, StartOutcome, StateSummary,
    READY_BYTE,
};
use opmetrics::logging::{init_cli_logging, init_daemon_logging};
use opmetrics::results::read_jsonl;
use std::ffi::OsString;
use std::io::Write;
use std::path::Path;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info, warn};

fn main() -> ExitCode {
    let args = Args::parse();
    let paths = args.paths.resolve();

    match args.command {
        Commands::Serve {
            notify_ready,
            server,
        } => run_serve(paths, &server, notify_ready, args.verbose),
        Commands::Daemon { action } => {
            if let Err(e) = init_cli_logging(args.verbose) {
                eprintln!("{:#}", e);
            }
            run_daemon_action(paths, action, args.verbose)
        }
        Commands::Replay { file, send_timeout } => {
            if let Err(e) = init_cli_logging(args.verbose) {
                eprintln!("{:#}", e);
            }
            match run_replay(&paths, &file, send_timeout) {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    error!("Replay failed: {:#}", e);
                    ExitCode::from(exit_codes::FAILURE)
                }
            }
        }
    }
}

fn run_serve(paths: DaemonPaths, server: &ServerArgs, notify_ready: bool, verbose: bool) -> ExitCode {
    // A daemon launched with --notify-ready has no terminal; log to a file.
    let _guard = if notify_ready {
        match init_daemon_logging(&paths.log_dir, verbose) {
            Ok(guard) => Some(guard),
            Err(e) => {
                eprintln!("{:#}", e);
                None
            }
        }
    } else {
        if let Err(e) = init_cli_logging(verbose) {
            eprintln!("{:#}", e);
        }
        None
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to build runtime: {}", e);
            return ExitCode::from(exit_codes::FAILURE);
        }
    };

    let config = server.aggregator_config(paths);
    match runtime.block_on(serve(config, notify_ready)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Aggregator failed: {}", e);
            ExitCode::from(e.exit_code())
        }
    }
}

async fn serve(config: AggregatorConfig, notify_ready: bool) -> Result<(), LifecycleError> {
    let mut signals = ShutdownSignals::install()?;
    let aggregator = Aggregator::launch(config).await?;

    if notify_ready {
        let mut stdout = std::io::stdout();
        if let Err(e) = stdout.write_all(&[READY_BYTE]).and_then(|_| stdout.flush()) {
            warn!("Failed to notify readiness: {}", e);
        }
    }

    signals.recv().await;
    aggregator.shutdown().await;
    Ok(())
}

fn run_daemon_action(paths: DaemonPaths, action: DaemonAction, verbose: bool) -> ExitCode {
    let code = match action {
        DaemonAction::Start { ref server, .. } => {
            let mut serve_args: Vec<OsString> = server.to_serve_args();
            if verbose {
                serve_args.push("--verbose".into());
            }
            let manager = LifecycleManager::new(paths).with_serve_args(serve_args);
            let Some(options) = action.start_options() else {
                return ExitCode::from(exit_codes::FAILURE);
            };
            match manager.start(options) {
                Ok(outcome) => {
                    report_started(&manager, &outcome);
                    outcome.exit_code()
                }
                Err(e) => report_error(&e),
            }
        }
        DaemonAction::Stop { timeout } => {
            let manager = LifecycleManager::new(paths);
            match manager.stop(timeout) {
                Ok(pid) => {
                    info!("Aggregator stopped (pid {})", pid);
                    exit_codes::SUCCESS
                }
                Err(e) => report_error(&e),
            }
        }
        DaemonAction::Status { json } => {
            let manager = LifecycleManager::new(paths);
            match manager.status() {
                Ok(status) => {
                    if json {
                        match serde_json::to_string_pretty(&status) {
                            Ok(text) => println!("{}", text),
                            Err(e) => error!("Failed to encode status: {}", e),
                        }
                    } else if status.is_running() {
                        let pid = status.pid.unwrap_or_default();
                        info!("Aggregator is {} (pid {})", status.state, pid);
                        if let Some(summary) = &status.summary {
                            info!("  scrape: http://{}:{}/metrics", summary.scrape_host, summary.scrape_port);
                            info!("  socket: {}", summary.socket_path.display());
                            info!("  since:  {}", summary.started_at.to_rfc3339());
                        }
                        if status.scrape_reachable == Some(false) {
                            warn!("Scrape endpoint is not accepting connections");
                        }
                    } else if status.stale {
                        warn!("Aggregator is not running, but stale state was found");
                        warn!("Run `opmetrics daemon start --force` to clean it up");
                    } else {
                        info!("Aggregator is not running");
                    }

                    if status.is_running() {
                        exit_codes::SUCCESS
                    } else {
                        exit_codes::NOT_RUNNING
                    }
                }
                Err(e) => report_error(&e),
            }
        }
    };
    ExitCode::from(code)
}

fn report_started(manager: &LifecycleManager, outcome: &StartOutcome) {
    match outcome {
        StartOutcome::AlreadyRunning { pid } => {
            info!("Aggregator already running (pid {})", pid);
            return;
        }
        StartOutcome::RecoveredStale { .. } => warn!("Removed stale aggregator state"),
        StartOutcome::Replaced { previous, .. } => {
            warn!("Replaced running aggregator (pid {})", previous)
        }
        StartOutcome::Started { .. } => {}
    }

    info!("Aggregator started (pid {})", outcome.pid());
    if let Some(summary) = StateSummary::read(&manager.paths().state_file) {
        info!("  scrape: http://{}:{}/metrics", summary.scrape_host, summary.scrape_port);
        info!("  socket: {}", summary.socket_path.display());
    }
}

fn report_error(error: &LifecycleError) -> u8 {
    error!("{}", error);
    error.exit_code()
}

fn run_replay(paths: &DaemonPaths, file: &Path, send_timeout: Duration) -> anyhow::Result<()> {
    let records = read_jsonl(file)?;
    info!("Replaying {} records from {}", records.len(), file.display());

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let (sent, dropped) = runtime.block_on(async {
        let mut client = TransportClient::new(ClientConfig {
            socket_path: paths.socket_path.clone(),
            send_timeout,
        });
        for record in &records {
            client.send(record).await;
        }
        client.close().await;
        (client.sent(), client.dropped())
    });

    if dropped > 0 {
        warn!("Replay finished: {} sent, {} dropped", sent, dropped);
    } else {
        info!("Replay finished: {} sent", sent);
    }
    Ok(())
}
