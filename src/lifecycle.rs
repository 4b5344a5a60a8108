//! # Daemon Lifecycle Management
//!
//! Start, stop and inspect the aggregator daemon through three filesystem
//! resources:
//!
//! - the **liveness marker** (pid file) naming the daemon's process id,
//! - the **transport endpoint** (Unix socket file),
//! - the **state file**, a JSON [`StateSummary`] the daemon keeps current.
//!
//! A daemon counts as running only when the marker exists *and* the process
//! it names is alive. A marker naming a dead process, a corrupt marker, or a
//! leftover socket file with no marker is *stale state*: `status` reports it
//! as stopped, plain `start` refuses with [`LifecycleError::StaleState`], and
//! a forced start removes it first.
//!
//! ## Start protocol
//!
//! `start` re-executes the current binary as `serve --notify-ready` in its own
//! process group, with stdout bound to an OS pipe. The daemon writes a single
//! [`READY_BYTE`] once it holds the marker and both endpoints are bound. If the
//! pipe reaches EOF first, the daemon's exit code is mapped back to a
//! [`LifecycleError`].
//!
//! ## Exclusive creation
//!
//! [`LivenessMarker::acquire`] writes the pid to a temporary sibling and
//! hard-links it into place. `link(2)` fails if the marker exists, so two
//! daemons racing to start cannot both hold it.

use crate::utils::{default_runtime_dir, remove_if_exists, write_atomically};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Byte the daemon writes to its stdout once it is ready.
pub const READY_BYTE: u8 = 0x01;

pub const DEFAULT_PID_FILE: &str = "opmetrics.pid";
pub const DEFAULT_STATE_FILE: &str = "opmetrics_state.json";
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

const STOP_POLL_INITIAL: Duration = Duration::from_millis(50);
const STOP_POLL_MAX: Duration = Duration::from_millis(500);

/// Process exit codes of the daemon control commands.
pub mod exit_codes {
    pub const SUCCESS: u8 = 0;
    pub const FAILURE: u8 = 1;
    pub const ALREADY_RUNNING: u8 = 2;
    pub const NOT_RUNNING: u8 = 3;
    pub const STALE_STATE: u8 = 4;
    pub const FORCE_CLEANED: u8 = 5;
    pub const STOP_TIMEOUT: u8 = 6;
    pub const ADDRESS_IN_USE: u8 = 7;
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("aggregator is already running (pid {pid})")]
    AlreadyRunning { pid: u32 },

    #[error("aggregator is not running")]
    NotRunning,

    #[error("stale aggregator state: {detail}; run `opmetrics daemon start --force` to clean it up")]
    StaleState { detail: String },

    #[error("address already in use: {0}")]
    AddressInUse(String),

    #[error("transport endpoint {} is already bound", .0.display())]
    EndpointInUse(PathBuf),

    #[error("aggregator failed to start: {0}")]
    StartFailed(String),

    #[error("aggregator did not report ready within {0:?}")]
    StartTimedOut(Duration),

    #[error("aggregator (pid {pid}) still running after {timeout:?}")]
    StopTimedOut { pid: u32, timeout: Duration },

    #[error("lifecycle I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LifecycleError {
    pub fn exit_code(&self) -> u8 {
        match self {
            LifecycleError::AlreadyRunning { .. } => exit_codes::ALREADY_RUNNING,
            LifecycleError::NotRunning => exit_codes::NOT_RUNNING,
            LifecycleError::StaleState { .. } => exit_codes::STALE_STATE,
            LifecycleError::AddressInUse(_) | LifecycleError::EndpointInUse(_) => {
                exit_codes::ADDRESS_IN_USE
            }
            LifecycleError::StopTimedOut { .. } => exit_codes::STOP_TIMEOUT,
            LifecycleError::StartFailed(_)
            | LifecycleError::StartTimedOut(_)
            | LifecycleError::Io(_) => exit_codes::FAILURE,
        }
    }
}

/// Filesystem locations of the daemon's lifecycle state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonPaths {
    pub pid_file: PathBuf,
    pub state_file: PathBuf,
    pub socket_path: PathBuf,
    pub log_dir: PathBuf,
}

impl Default for DaemonPaths {
    fn default() -> Self {
        let dir = default_runtime_dir();
        Self {
            pid_file: dir.join(DEFAULT_PID_FILE),
            state_file: dir.join(DEFAULT_STATE_FILE),
            socket_path: dir.join(crate::ipc::DEFAULT_SOCKET_NAME),
            log_dir: dir,
        }
    }
}

impl DaemonPaths {
    /// All state under one directory, with the default file names.
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            pid_file: dir.join(DEFAULT_PID_FILE),
            state_file: dir.join(DEFAULT_STATE_FILE),
            socket_path: dir.join(crate::ipc::DEFAULT_SOCKET_NAME),
            log_dir: dir.to_path_buf(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DaemonState {
    Absent,
    Starting,
    Running,
    Stopping,
}

impl std::fmt::Display for DaemonState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DaemonState::Absent => "absent",
            DaemonState::Starting => "starting",
            DaemonState::Running => "running",
            DaemonState::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// Contents of the state file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSummary {
    pub pid: u32,
    pub state: DaemonState,
    pub scrape_host: String,
    pub scrape_port: u16,
    pub socket_path: PathBuf,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: String,
}

impl StateSummary {
    pub fn write(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        write_atomically(path, &json)
    }

    /// Read the state file; `None` when absent or unreadable.
    pub fn read(path: &Path) -> Option<Self> {
        let bytes = std::fs::read(path).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    /// Address to connect to the scrape endpoint on from this host.
    pub fn scrape_connect_addr(&self) -> Option<SocketAddr> {
        let host = match self.scrape_host.as_str() {
            "0.0.0.0" | "" => "127.0.0.1",
            "::" => "::1",
            other => other,
        };
        (host, self.scrape_port).to_socket_addrs().ok()?.next()
    }
}

/// What the marker file says about the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerState {
    Absent,
    Live(u32),
    Dead(u32),
    Corrupt,
}

impl MarkerState {
    pub fn inspect(path: &Path) -> std::io::Result<Self> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(MarkerState::Absent),
            Err(e) => return Err(e),
        };
        Ok(match contents.trim().parse::<u32>() {
            Ok(pid) if is_process_alive(pid) => MarkerState::Live(pid),
            Ok(pid) => MarkerState::Dead(pid),
            Err(_) => MarkerState::Corrupt,
        })
    }
}

/// Whether a process with this id exists and is not a zombie
///
/// Uses `kill(pid, 0)`: success or `EPERM` both mean the process exists.
pub fn is_process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match kill(Pid::from_raw(raw), None) {
        Ok(()) | Err(Errno::EPERM) => !is_zombie(pid),
        Err(_) => false,
    }
}

#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    // The state field follows the parenthesised command name, which may
    // itself contain spaces or parentheses.
    std::fs::read_to_string(format!("/proc/{}/stat", pid))
        .ok()
        .and_then(|stat| {
            let after = &stat[stat.rfind(')')? + 1..];
            after.split_whitespace().next().map(|state| state == "Z")
        })
        .unwrap_or(false)
}

#[cfg(not(target_os = "linux"))]
fn is_zombie(_pid: u32) -> bool {
    false
}

fn send_signal(pid: u32, signal: nix::sys::signal::Signal) -> Result<(), LifecycleError> {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let raw = i32::try_from(pid)
        .map_err(|_| LifecycleError::StartFailed(format!("invalid pid {}", pid)))?;
    match kill(Pid::from_raw(raw), signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(LifecycleError::Io(std::io::Error::from(e))),
    }
}

/// Exclusive ownership of the pid file for the current process
///
/// Dropping the marker removes the file, but only if it still names this
/// process.
#[derive(Debug)]
pub struct LivenessMarker {
    path: PathBuf,
    pid: u32,
}

impl LivenessMarker {
    pub fn acquire(path: &Path) -> Result<Self, LifecycleError> {
        let pid = std::process::id();
        let temp = path.with_file_name(format!(
            ".{}.{}.tmp",
            path.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            pid
        ));

        {
            let mut file = std::fs::File::create(&temp)?;
            writeln!(file, "{}", pid)?;
            file.sync_all()?;
        }
        let linked = std::fs::hard_link(&temp, path);
        let _ = std::fs::remove_file(&temp);

        match linked {
            Ok(()) => {
                debug!(path = %path.display(), pid, "Liveness marker acquired");
                Ok(Self {
                    path: path.to_path_buf(),
                    pid,
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                match MarkerState::inspect(path)? {
                    MarkerState::Live(other) => Err(LifecycleError::AlreadyRunning { pid: other }),
                    MarkerState::Dead(other) => Err(LifecycleError::StaleState {
                        detail: format!(
                            "pid file {} names exited process {}",
                            path.display(),
                            other
                        ),
                    }),
                    MarkerState::Corrupt => Err(LifecycleError::StaleState {
                        detail: format!("pid file {} is unreadable", path.display()),
                    }),
                    // Removed between our link attempt and the inspection.
                    MarkerState::Absent => Err(LifecycleError::Io(e)),
                }
            }
            Err(e) => Err(LifecycleError::Io(e)),
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LivenessMarker {
    fn drop(&mut self) {
        let still_ours = std::fs::read_to_string(&self.path)
            .ok()
            .and_then(|s| s.trim().parse::<u32>().ok())
            == Some(self.pid);
        if still_ours {
            if let Err(e) = remove_if_exists(&self.path) {
                warn!(path = %self.path.display(), "Failed to remove liveness marker: {}", e);
            }
        }
    }
}

/// Result of a `status` inspection
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DaemonStatus {
    pub state: DaemonState,
    pub pid: Option<u32>,
    /// Leftover lifecycle files that do not belong to a live daemon.
    pub stale: bool,
    pub summary: Option<StateSummary>,
    /// Whether the scrape port accepted a TCP connection; `None` if not checked.
    pub scrape_reachable: Option<bool>,
}

impl DaemonStatus {
    pub fn is_running(&self) -> bool {
        self.state != DaemonState::Absent
    }
}

/// How a start request relates to existing state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartDisposition {
    Fresh,
    RecoverStale,
    ReplaceLive(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartOptions {
    pub force: bool,
    pub if_not_running: bool,
    pub ready_timeout: Duration,
    pub stop_timeout: Duration,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            force: false,
            if_not_running: false,
            ready_timeout: DEFAULT_READY_TIMEOUT,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started { pid: u32 },
    AlreadyRunning { pid: u32 },
    RecoveredStale { pid: u32 },
    Replaced { previous: u32, pid: u32 },
}

impl StartOutcome {
    pub fn pid(&self) -> u32 {
        match *self {
            StartOutcome::Started { pid }
            | StartOutcome::AlreadyRunning { pid }
            | StartOutcome::RecoveredStale { pid }
            | StartOutcome::Replaced { pid, .. } => pid,
        }
    }

    pub fn exit_code(&self) -> u8 {
        match self {
            StartOutcome::Started { .. } | StartOutcome::AlreadyRunning { .. } => {
                exit_codes::SUCCESS
            }
            StartOutcome::RecoveredStale { .. } | StartOutcome::Replaced { .. } => {
                exit_codes::FORCE_CLEANED
            }
        }
    }
}

/// Controls the aggregator daemon from another process.
#[derive(Debug, Clone)]
pub struct LifecycleManager {
    paths: DaemonPaths,
    executable: Option<PathBuf>,
    serve_args: Vec<OsString>,
}

impl LifecycleManager {
    pub fn new(paths: DaemonPaths) -> Self {
        Self {
            paths,
            executable: None,
            serve_args: Vec::new(),
        }
    }

    /// Binary to launch instead of the current executable.
    pub fn with_executable(mut self, path: impl Into<PathBuf>) -> Self {
        self.executable = Some(path.into());
        self
    }

    /// Extra arguments appended to the daemon's `serve` command line.
    pub fn with_serve_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.serve_args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn paths(&self) -> &DaemonPaths {
        &self.paths
    }

    /// Inspect lifecycle state without changing anything.
    pub fn status(&self) -> Result<DaemonStatus, LifecycleError> {
        let marker = MarkerState::inspect(&self.paths.pid_file)?;
        let summary = StateSummary::read(&self.paths.state_file);

        let status = match marker {
            MarkerState::Live(pid) => {
                let summary = summary.filter(|s| s.pid == pid);
                let state = summary.as_ref().map_or(DaemonState::Starting, |s| s.state);
                let scrape_reachable = summary
                    .as_ref()
                    .and_then(StateSummary::scrape_connect_addr)
                    .map(|addr| TcpStream::connect_timeout(&addr, Duration::from_millis(200)).is_ok());
                DaemonStatus {
                    state,
                    pid: Some(pid),
                    stale: false,
                    summary,
                    scrape_reachable,
                }
            }
            MarkerState::Dead(pid) => DaemonStatus {
                state: DaemonState::Absent,
                pid: Some(pid),
                stale: true,
                summary,
                scrape_reachable: None,
            },
            MarkerState::Corrupt => DaemonStatus {
                state: DaemonState::Absent,
                pid: None,
                stale: true,
                summary,
                scrape_reachable: None,
            },
            MarkerState::Absent => DaemonStatus {
                state: DaemonState::Absent,
                pid: None,
                stale: self.paths.socket_path.exists() || summary.is_some(),
                summary,
                scrape_reachable: None,
            },
        };
        Ok(status)
    }

    /// Decide whether a start may proceed
    ///
    /// Without `force`, a live daemon yields [`LifecycleError::AlreadyRunning`]
    /// and leftover state yields [`LifecycleError::StaleState`].
    pub fn check_startable(&self, force: bool) -> Result<StartDisposition, LifecycleError> {
        let stale_detail = match MarkerState::inspect(&self.paths.pid_file)? {
            MarkerState::Live(pid) if force => return Ok(StartDisposition::ReplaceLive(pid)),
            MarkerState::Live(pid) => return Err(LifecycleError::AlreadyRunning { pid }),
            MarkerState::Dead(pid) => Some(format!(
                "pid file {} names exited process {}",
                self.paths.pid_file.display(),
                pid
            )),
            MarkerState::Corrupt => Some(format!(
                "pid file {} is unreadable",
                self.paths.pid_file.display()
            )),
            MarkerState::Absent if self.paths.socket_path.exists() => Some(format!(
                "transport endpoint {} exists without a running aggregator",
                self.paths.socket_path.display()
            )),
            MarkerState::Absent => None,
        };

        match stale_detail {
            None => Ok(StartDisposition::Fresh),
            Some(_) if force => Ok(StartDisposition::RecoverStale),
            Some(detail) => Err(LifecycleError::StaleState { detail }),
        }
    }

    /// Remove leftover lifecycle files; returns the files that existed
    ///
    /// Refuses with [`LifecycleError::AlreadyRunning`] if the marker names a
    /// live process, either on entry or because a concurrent start won the
    /// marker while cleanup was running. The socket and state file are only
    /// removed while no live marker exists: a daemon always holds the marker
    /// before it binds the socket.
    pub fn cleanup_stale(&self) -> Result<Vec<PathBuf>, LifecycleError> {
        self.ensure_no_live_marker()?;

        let mut removed = Vec::new();
        if self.remove_stale_marker()? {
            removed.push(self.paths.pid_file.clone());
        }

        self.ensure_no_live_marker()?;
        for path in [&self.paths.socket_path, &self.paths.state_file] {
            if remove_if_exists(path)? {
                info!(path = %path.display(), "Removed stale lifecycle file");
                removed.push(path.clone());
            }
        }
        Ok(removed)
    }

    fn ensure_no_live_marker(&self) -> Result<(), LifecycleError> {
        match MarkerState::inspect(&self.paths.pid_file)? {
            MarkerState::Live(pid) => Err(LifecycleError::AlreadyRunning { pid }),
            _ => Ok(()),
        }
    }

    /// Take the marker out of place and delete it unless it turns out live
    ///
    /// The rename claims exactly the file that was inspected, so a marker
    /// created afterwards by another daemon is never the one deleted. A live
    /// marker is linked back into place.
    fn remove_stale_marker(&self) -> Result<bool, LifecycleError> {
        let pid_file = &self.paths.pid_file;
        let file_name = pid_file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let claimed = pid_file.with_file_name(format!(
            ".{}.{}.stale",
            file_name,
            uuid::Uuid::new_v4().simple()
        ));

        match std::fs::rename(pid_file, &claimed) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        }

        if let MarkerState::Live(pid) = MarkerState::inspect(&claimed)? {
            if let Err(e) = std::fs::hard_link(&claimed, pid_file) {
                warn!(pid, error = %e, "Could not restore live aggregator marker");
            }
            let _ = std::fs::remove_file(&claimed);
            return Err(LifecycleError::AlreadyRunning { pid });
        }

        remove_if_exists(&claimed)?;
        info!(path = %pid_file.display(), "Removed stale lifecycle file");
        Ok(true)
    }

    pub fn start(&self, options: StartOptions) -> Result<StartOutcome, LifecycleError> {
        let disposition = match self.check_startable(options.force) {
            Err(LifecycleError::AlreadyRunning { pid }) if options.if_not_running => {
                info!(pid, "Aggregator already running");
                return Ok(StartOutcome::AlreadyRunning { pid });
            }
            other => other?,
        };

        match disposition {
            StartDisposition::Fresh => {
                remove_if_exists(&self.paths.state_file)?;
            }
            StartDisposition::RecoverStale => match self.cleanup_stale() {
                Err(LifecycleError::AlreadyRunning { pid }) if options.if_not_running => {
                    info!(pid, "Aggregator started concurrently");
                    return Ok(StartOutcome::AlreadyRunning { pid });
                }
                other => {
                    other?;
                }
            },
            StartDisposition::ReplaceLive(pid) => {
                info!(pid, "Stopping running aggregator before forced start");
                match self.stop(options.stop_timeout) {
                    Ok(_) | Err(LifecycleError::NotRunning) => {}
                    Err(e) => return Err(e),
                }
                self.cleanup_stale()?;
            }
        }

        let pid = self.spawn_daemon(options.ready_timeout)?;
        info!(pid, "Aggregator started");

        Ok(match disposition {
            StartDisposition::Fresh => StartOutcome::Started { pid },
            StartDisposition::RecoverStale => StartOutcome::RecoveredStale { pid },
            StartDisposition::ReplaceLive(previous) => StartOutcome::Replaced { previous, pid },
        })
    }

    fn executable(&self) -> Result<PathBuf, LifecycleError> {
        match &self.executable {
            Some(path) => Ok(path.clone()),
            None => std::env::current_exe().map_err(|e| {
                LifecycleError::StartFailed(format!("cannot locate current executable: {}", e))
            }),
        }
    }

    fn spawn_daemon(&self, ready_timeout: Duration) -> Result<u32, LifecycleError> {
        let exe = self.executable()?;
        let (mut reader, writer) = os_pipe::pipe()?;

        let mut child = {
            let mut cmd = Command::new(&exe);
            cmd.arg("serve")
                .arg("--notify-ready")
                .arg("--pid-file")
                .arg(&self.paths.pid_file)
                .arg("--state-file")
                .arg(&self.paths.state_file)
                .arg("--socket")
                .arg(&self.paths.socket_path)
                .arg("--log-dir")
                .arg(&self.paths.log_dir)
                .args(&self.serve_args)
                .stdin(Stdio::null())
                .stdout(writer)
                .stderr(Stdio::null())
                .process_group(0);
            debug!(exe = %exe.display(), "Spawning aggregator daemon");
            // `cmd` holds our copy of the pipe's write end; it must be
            // dropped here or the read below never sees EOF.
            cmd.spawn().map_err(|e| {
                LifecycleError::StartFailed(format!("cannot spawn {}: {}", exe.display(), e))
            })?
        };
        let pid = child.id();

        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let mut buf = [0u8; 1];
            let ready = matches!(reader.read(&mut buf), Ok(1) if buf[0] == READY_BYTE);
            let _ = tx.send(ready);
        });

        match rx.recv_timeout(ready_timeout) {
            Ok(true) => Ok(pid),
            Ok(false) => {
                let code = wait_for_exit(&mut child, Duration::from_secs(5));
                Err(self.error_from_daemon_exit(code))
            }
            Err(_) => {
                warn!(pid, "Aggregator did not become ready, terminating it");
                let _ = send_signal(pid, nix::sys::signal::Signal::SIGKILL);
                let _ = wait_for_exit(&mut child, Duration::from_secs(5));
                Err(LifecycleError::StartTimedOut(ready_timeout))
            }
        }
    }

    fn error_from_daemon_exit(&self, code: Option<i32>) -> LifecycleError {
        let log_hint = format!(
            "see {}",
            self.paths.log_dir.join(crate::logging::DAEMON_LOG_FILE).display()
        );
        match code.and_then(|c| u8::try_from(c).ok()) {
            Some(exit_codes::ALREADY_RUNNING) => {
                let pid = match MarkerState::inspect(&self.paths.pid_file) {
                    Ok(MarkerState::Live(pid)) => pid,
                    _ => 0,
                };
                LifecycleError::AlreadyRunning { pid }
            }
            Some(exit_codes::STALE_STATE) => LifecycleError::StaleState { detail: log_hint },
            Some(exit_codes::ADDRESS_IN_USE) => LifecycleError::AddressInUse(format!(
                "scrape port or transport endpoint already bound ({})",
                log_hint
            )),
            Some(other) => {
                LifecycleError::StartFailed(format!("daemon exited with code {} ({})", other, log_hint))
            }
            None => LifecycleError::StartFailed(format!("daemon exited abnormally ({})", log_hint)),
        }
    }

    /// Ask the daemon to shut down and wait for it
    ///
    /// Sends SIGTERM, then polls with exponential backoff until the marker is
    /// gone or the process has exited. Leftover files are removed afterwards.
    pub fn stop(&self, timeout: Duration) -> Result<u32, LifecycleError> {
        let pid = match MarkerState::inspect(&self.paths.pid_file)? {
            MarkerState::Live(pid) => pid,
            MarkerState::Dead(_) | MarkerState::Corrupt => {
                self.cleanup_stale()?;
                return Err(LifecycleError::NotRunning);
            }
            MarkerState::Absent => return Err(LifecycleError::NotRunning),
        };

        info!(pid, "Stopping aggregator");
        send_signal(pid, nix::sys::signal::Signal::SIGTERM)?;

        let started = Instant::now();
        let mut interval = STOP_POLL_INITIAL;
        loop {
            let marker_gone = !self.paths.pid_file.exists();
            if marker_gone || !is_process_alive(pid) {
                break;
            }
            let elapsed = started.elapsed();
            if elapsed >= timeout {
                return Err(LifecycleError::StopTimedOut { pid, timeout });
            }
            std::thread::sleep(interval.min(timeout - elapsed));
            interval = interval.mul_f64(1.5).min(STOP_POLL_MAX);
        }

        // The daemon removes its own files on a clean exit; this covers a
        // daemon that died before finishing cleanup.
        if !is_process_alive(pid) {
            self.cleanup_stale()?;
        }
        info!(pid, "Aggregator stopped");
        Ok(pid)
    }
}

fn wait_for_exit(child: &mut Child, timeout: Duration) -> Option<i32> {
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return status.code(),
            Ok(None) if Instant::now() < deadline => std::thread::sleep(Duration::from_millis(20)),
            _ => return None,
        }
    }
}
