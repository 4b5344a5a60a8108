use crate::aggregator::{AggregatorConfig, DEFAULT_SCRAPE_HOST, DEFAULT_SCRAPE_PORT};
use crate::ipc::TransportConfig;
use crate::lifecycle::{DaemonPaths, StartOptions};
use clap::{Parser, Subcommand};
use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

/// opmetrics - operation metrics aggregator for storage load generators
#[derive(Parser, Debug)]
#[clap(name = "opmetrics", version, about, long_about = None)]
pub struct Args {
    /// Verbose output
    #[clap(short = 'v', long, global = true, default_value_t = false)]
    pub verbose: bool,

    #[clap(flatten)]
    pub paths: PathArgs,

    #[clap(subcommand)]
    pub command: Commands,
}

/// Locations of the aggregator's lifecycle files
#[derive(clap::Args, Debug, Clone, Default)]
pub struct PathArgs {
    /// Liveness marker (pid file)
    #[clap(long, env = "OPMETRICS_PID_FILE", global = true, help_heading = "Paths")]
    pub pid_file: Option<PathBuf>,

    /// State summary file
    #[clap(long, env = "OPMETRICS_STATE_FILE", global = true, help_heading = "Paths")]
    pub state_file: Option<PathBuf>,

    /// Transport endpoint (Unix socket)
    #[clap(long, env = "OPMETRICS_SOCKET", global = true, help_heading = "Paths")]
    pub socket: Option<PathBuf>,

    /// Directory for the daemon log file
    #[clap(long, env = "OPMETRICS_LOG_DIR", global = true, help_heading = "Paths")]
    pub log_dir: Option<PathBuf>,
}

impl PathArgs {
    pub fn resolve(&self) -> DaemonPaths {
        let defaults = DaemonPaths::default();
        DaemonPaths {
            pid_file: self.pid_file.clone().unwrap_or(defaults.pid_file),
            state_file: self.state_file.clone().unwrap_or(defaults.state_file),
            socket_path: self.socket.clone().unwrap_or(defaults.socket_path),
            log_dir: self.log_dir.clone().unwrap_or(defaults.log_dir),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start, stop or inspect the background aggregator
    Daemon {
        #[clap(subcommand)]
        action: DaemonAction,
    },

    /// Run the aggregator in the foreground until SIGTERM or SIGINT
    Serve {
        /// Write a ready byte to stdout once both endpoints are bound
        #[clap(long, default_value_t = false)]
        notify_ready: bool,

        #[clap(flatten)]
        server: ServerArgs,
    },

    /// Send every record of a JSONL export to the running aggregator
    Replay {
        /// operations.jsonl file to replay
        file: PathBuf,

        /// Budget for delivering one record
        #[clap(long, value_parser = parse_duration, default_value = "250ms")]
        send_timeout: Duration,
    },
}

#[derive(Subcommand, Debug)]
pub enum DaemonAction {
    /// Start the aggregator in the background
    Start {
        /// Clean up stale state, or replace a running aggregator
        #[clap(short = 'f', long, default_value_t = false)]
        force: bool,

        /// Succeed without doing anything if an aggregator is already running
        #[clap(long, default_value_t = false)]
        if_not_running: bool,

        /// How long to wait for the aggregator to report ready
        #[clap(long, value_parser = parse_duration, default_value = "10s")]
        ready_timeout: Duration,

        /// How long a forced start waits for a running aggregator to stop
        #[clap(long, value_parser = parse_duration, default_value = "10s")]
        stop_timeout: Duration,

        #[clap(flatten)]
        server: ServerArgs,
    },

    /// Stop the background aggregator
    Stop {
        /// How long to wait for the aggregator to exit
        #[clap(long, value_parser = parse_duration, default_value = "10s")]
        timeout: Duration,
    },

    /// Report whether the aggregator is running
    Status {
        /// Print the status as JSON
        #[clap(long, default_value_t = false)]
        json: bool,
    },
}

/// Settings of the aggregator process itself
#[derive(clap::Args, Debug, Clone, PartialEq)]
pub struct ServerArgs {
    /// Host address for the scrape endpoint
    #[clap(long, env = "OPMETRICS_HOST", default_value = DEFAULT_SCRAPE_HOST, help_heading = "Aggregator")]
    pub host: String,

    /// Port for the scrape endpoint (0 picks a free port)
    #[clap(long, env = "OPMETRICS_PORT", default_value_t = DEFAULT_SCRAPE_PORT, help_heading = "Aggregator")]
    pub port: u16,

    /// Worker connections serviced at once
    #[clap(long, default_value_t = crate::defaults::MAX_CONNECTIONS, help_heading = "Aggregator")]
    pub max_connections: usize,

    /// Close worker connections idle for this long
    #[clap(long, value_parser = parse_duration, default_value = "60s", help_heading = "Aggregator")]
    pub idle_timeout: Duration,
}

impl ServerArgs {
    pub fn aggregator_config(&self, paths: DaemonPaths) -> AggregatorConfig {
        AggregatorConfig {
            scrape_host: self.host.clone(),
            scrape_port: self.port,
            transport: TransportConfig {
                socket_path: paths.socket_path.clone(),
                max_connections: self.max_connections,
                idle_timeout: self.idle_timeout,
                ..TransportConfig::default()
            },
            paths,
        }
    }

    /// The same settings as `serve` arguments, for launching the daemon.
    pub fn to_serve_args(&self) -> Vec<OsString> {
        vec![
            "--host".into(),
            self.host.clone().into(),
            "--port".into(),
            self.port.to_string().into(),
            "--max-connections".into(),
            self.max_connections.to_string().into(),
            "--idle-timeout".into(),
            format!("{}ms", self.idle_timeout.as_millis()).into(),
        ]
    }
}

impl DaemonAction {
    pub fn start_options(&self) -> Option<StartOptions> {
        match self {
            DaemonAction::Start {
                force,
                if_not_running,
                ready_timeout,
                stop_timeout,
                ..
            } => Some(StartOptions {
                force: *force,
                if_not_running: *if_not_running,
                ready_timeout: *ready_timeout,
                stop_timeout: *stop_timeout,
            }),
            _ => None,
        }
    }
}

/// Parse duration from string (e.g., "250ms", "10s", "5m", "1h")
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();

    if s.is_empty() {
        return Err("Duration cannot be empty".to_string());
    }

    let (num_str, unit) = if let Some(stripped) = s.strip_suffix("ms") {
        (stripped, "ms")
    } else if let Some(stripped) = s.strip_suffix('s') {
        (stripped, "s")
    } else if let Some(stripped) = s.strip_suffix('m') {
        (stripped, "m")
    } else if let Some(stripped) = s.strip_suffix('h') {
        (stripped, "h")
    } else {
        (s, "s") // Default to seconds
    };

    let num: f64 = num_str
        .trim()
        .parse()
        .map_err(|_| format!("Invalid number in duration: {}", num_str))?;
    if !num.is_finite() || num < 0.0 {
        return Err(format!("Duration must be a non-negative number: {}", s));
    }

    let seconds = match unit {
        "ms" => num / 1000.0,
        "s" => num,
        "m" => num * 60.0,
        "h" => num * 3600.0,
        _ => return Err(format!("Invalid duration unit: {}", unit)),
    };

    Duration::try_from_secs_f64(seconds).map_err(|e| format!("Duration out of range: {} ({})", s, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_duration("10").unwrap(), Duration::from_secs(10));

        assert!(parse_duration("").is_err());
        assert!(parse_duration("invalid").is_err());
        assert!(parse_duration("-1s").is_err());
        assert!(parse_duration("1e20s").is_err());
        assert!(parse_duration("1e300h").is_err());
    }

    #[test]
    fn test_oversized_timeout_flag_is_rejected() {
        let err = Args::try_parse_from(["opmetrics", "daemon", "stop", "--timeout", "1e20s"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }

    #[test]
    fn test_daemon_start_flags() {
        let args = Args::try_parse_from([
            "opmetrics",
            "daemon",
            "start",
            "--force",
            "--port",
            "0",
            "--ready-timeout",
            "2s",
        ])
        .unwrap();

        let Commands::Daemon { action } = args.command else {
            panic!("expected daemon command");
        };
        let options = action.start_options().unwrap();
        assert!(options.force);
        assert!(!options.if_not_running);
        assert_eq!(options.ready_timeout, Duration::from_secs(2));
        match action {
            DaemonAction::Start { server, .. } => assert_eq!(server.port, 0),
            other => panic!("unexpected action {:?}", other),
        }
    }

    #[test]
    fn test_global_paths_after_subcommand() {
        let args = Args::try_parse_from([
            "opmetrics",
            "serve",
            "--notify-ready",
            "--pid-file",
            "/tmp/x.pid",
            "--socket",
            "/tmp/x.sock",
        ])
        .unwrap();

        let paths = args.paths.resolve();
        assert_eq!(paths.pid_file, PathBuf::from("/tmp/x.pid"));
        assert_eq!(paths.socket_path, PathBuf::from("/tmp/x.sock"));
        assert!(matches!(
            args.command,
            Commands::Serve {
                notify_ready: true,
                ..
            }
        ));
    }

    #[test]
    fn test_serve_args_round_trip() {
        let server = ServerArgs {
            host: "127.0.0.1".to_string(),
            port: 9100,
            max_connections: 8,
            idle_timeout: Duration::from_millis(1500),
        };
        let mut argv: Vec<OsString> = vec!["opmetrics".into(), "serve".into()];
        argv.extend(server.to_serve_args());

        let args = Args::try_parse_from(argv).unwrap();
        match args.command {
            Commands::Serve { server: parsed, .. } => assert_eq!(parsed, server),
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_aggregator_config_uses_socket_from_paths() {
        let dir = tempfile::tempdir().unwrap();
        let server = ServerArgs {
            host: "127.0.0.1".to_string(),
            port: 0,
            max_connections: 4,
            idle_timeout: Duration::from_secs(1),
        };
        let config = server.aggregator_config(DaemonPaths::in_dir(dir.path()));
        assert_eq!(config.transport.socket_path, config.paths.socket_path);
        assert_eq!(config.transport.max_connections, 4);
    }
}
