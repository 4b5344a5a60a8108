//! The aggregator daemon body.
//!
//! [`Aggregator::launch`] brings the daemon up in a fixed order so that every
//! failure leaves nothing behind that `status` would misreport:
//!
//! 1. acquire the liveness marker,
//! 2. publish state `starting`,
//! 3. bind the transport endpoint,
//! 4. bind the scrape port,
//! 5. publish state `running` with the bound port and spawn the serving tasks.
//!
//! [`Aggregator::shutdown`] reverses it, removing the marker last.

use crate::exposition;
use crate::ipc::{IpcError, TransportConfig, TransportServer};
use crate::lifecycle::{DaemonPaths, DaemonState, LifecycleError, LivenessMarker, StateSummary};
use crate::registry::MetricRegistry;
use crate::utils::remove_if_exists;
use chrono::{DateTime, Utc};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

pub const DEFAULT_SCRAPE_HOST: &str = "0.0.0.0";
pub const DEFAULT_SCRAPE_PORT: u16 = 8090;

/// Extra time granted to the serving tasks beyond the transport drain.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub scrape_host: String,
    /// `0` lets the OS choose; the bound port is published in the state file.
    pub scrape_port: u16,
    /// Transport tuning. Its socket path is replaced by `paths.socket_path`.
    pub transport: TransportConfig,
    pub paths: DaemonPaths,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        let paths = DaemonPaths::default();
        Self {
            scrape_host: DEFAULT_SCRAPE_HOST.to_string(),
            scrape_port: DEFAULT_SCRAPE_PORT,
            transport: TransportConfig {
                socket_path: paths.socket_path.clone(),
                ..TransportConfig::default()
            },
            paths,
        }
    }
}

impl AggregatorConfig {
    pub fn scrape_addr(&self) -> Result<SocketAddr, LifecycleError> {
        (self.scrape_host.as_str(), self.scrape_port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                LifecycleError::StartFailed(format!(
                    "scrape host {} did not resolve",
                    self.scrape_host
                ))
            })
    }
}

/// A running aggregator
pub struct Aggregator {
    config: AggregatorConfig,
    registry: Arc<MetricRegistry>,
    marker: Option<LivenessMarker>,
    scrape_addr: SocketAddr,
    started_at: DateTime<Utc>,
    shutdown_tx: watch::Sender<bool>,
    transport_task: JoinHandle<()>,
    scrape_task: JoinHandle<std::io::Result<()>>,
}

impl Aggregator {
    /// Bring the daemon up. Must be called inside a tokio runtime.
    pub async fn launch(config: AggregatorConfig) -> Result<Self, LifecycleError> {
        let paths = config.paths.clone();
        let marker = LivenessMarker::acquire(&paths.pid_file)?;
        let started_at = Utc::now();
        info!(pid = marker.pid(), pid_file = %paths.pid_file.display(), "Aggregator starting");

        let requested = config.scrape_addr()?;
        write_state(&config, marker.pid(), DaemonState::Starting, requested.port(), started_at)?;

        let registry = match MetricRegistry::new() {
            Ok(registry) => Arc::new(registry),
            Err(e) => {
                let _ = remove_if_exists(&paths.state_file);
                return Err(LifecycleError::StartFailed(format!("metric registry: {}", e)));
            }
        };
        let bound = Self::bind_endpoints(&config, Arc::clone(&registry), requested);
        let (server, listener, scrape_addr) = match bound {
            Ok(bound) => bound,
            Err(e) => {
                let _ = remove_if_exists(&paths.state_file);
                return Err(e);
            }
        };

        if let Err(e) = write_state(&config, marker.pid(), DaemonState::Running, scrape_addr.port(), started_at) {
            drop(server);
            let _ = remove_if_exists(&paths.state_file);
            return Err(e);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let transport_task = tokio::spawn(server.serve(shutdown_rx.clone()));
        let scrape_task = tokio::spawn(exposition::serve(
            listener,
            Arc::clone(&registry),
            shutdown_rx,
        ));

        info!(
            scrape = %scrape_addr,
            socket = %paths.socket_path.display(),
            "Aggregator running"
        );

        Ok(Self {
            config,
            registry,
            marker: Some(marker),
            scrape_addr,
            started_at,
            shutdown_tx,
            transport_task,
            scrape_task,
        })
    }

    fn bind_endpoints(
        config: &AggregatorConfig,
        registry: Arc<MetricRegistry>,
        requested: SocketAddr,
    ) -> Result<(TransportServer, std::net::TcpListener, SocketAddr), LifecycleError> {
        let transport = TransportConfig {
            socket_path: config.paths.socket_path.clone(),
            ..config.transport.clone()
        };
        let server = TransportServer::bind(transport, registry).map_err(|e| match e {
            IpcError::EndpointInUse(path) => LifecycleError::EndpointInUse(path),
            IpcError::Io(e) => LifecycleError::Io(e),
            other => LifecycleError::StartFailed(other.to_string()),
        })?;

        // On failure `server` is dropped here, which unlinks its socket file.
        let listener = exposition::bind_listener(requested).map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                LifecycleError::AddressInUse(requested.to_string())
            } else {
                LifecycleError::Io(e)
            }
        })?;
        let scrape_addr = listener.local_addr()?;

        Ok((server, listener, scrape_addr))
    }

    pub fn registry(&self) -> &Arc<MetricRegistry> {
        &self.registry
    }

    pub fn scrape_addr(&self) -> SocketAddr {
        self.scrape_addr
    }

    pub fn socket_path(&self) -> &Path {
        &self.config.paths.socket_path
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn pid(&self) -> u32 {
        self.marker.as_ref().map_or_else(std::process::id, LivenessMarker::pid)
    }

    /// Stop serving and remove every lifecycle file, the marker last.
    pub async fn shutdown(mut self) {
        let pid = self.pid();
        info!(pid, "Aggregator shutting down");
        if let Err(e) = write_state(
            &self.config,
            pid,
            DaemonState::Stopping,
            self.scrape_addr.port(),
            self.started_at,
        ) {
            warn!("Failed to publish stopping state: {}", e);
        }

        let _ = self.shutdown_tx.send(true);
        let budget = self.config.transport.drain_timeout + SHUTDOWN_GRACE;

        if timeout(budget, &mut self.transport_task).await.is_err() {
            warn!("Transport server did not stop within {:?}", budget);
            self.transport_task.abort();
        }
        match timeout(budget, &mut self.scrape_task).await {
            Ok(Ok(Ok(()))) => debug!("Scrape endpoint stopped"),
            Ok(Ok(Err(e))) => warn!("Scrape endpoint failed: {}", e),
            Ok(Err(e)) => warn!("Scrape endpoint task failed: {}", e),
            Err(_) => {
                warn!("Scrape endpoint did not stop within {:?}", budget);
                self.scrape_task.abort();
            }
        }

        for path in [&self.config.paths.socket_path, &self.config.paths.state_file] {
            if let Err(e) = remove_if_exists(path) {
                warn!(path = %path.display(), "Failed to remove lifecycle file: {}", e);
            }
        }
        drop(self.marker.take());
        info!(pid, "Aggregator stopped");
    }
}

fn write_state(
    config: &AggregatorConfig,
    pid: u32,
    state: DaemonState,
    scrape_port: u16,
    started_at: DateTime<Utc>,
) -> Result<(), LifecycleError> {
    let summary = StateSummary {
        pid,
        state,
        scrape_host: config.scrape_host.clone(),
        scrape_port,
        socket_path: config.paths.socket_path.clone(),
        started_at,
        updated_at: Utc::now(),
        version: crate::VERSION.to_string(),
    };
    summary.write(&config.paths.state_file).map_err(|e| {
        LifecycleError::StartFailed(format!(
            "cannot write state file {}: {:#}",
            config.paths.state_file.display(),
            e
        ))
    })?;
    debug!(%state, "Published aggregator state");
    Ok(())
}

/// SIGTERM and SIGINT handlers
///
/// Install before [`Aggregator::launch`] so a signal arriving right after the
/// ready notification still goes through the orderly shutdown.
pub struct ShutdownSignals {
    term: Signal,
    int: Signal,
}

impl ShutdownSignals {
    pub fn install() -> std::io::Result<Self> {
        Ok(Self {
            term: signal(SignalKind::terminate())?,
            int: signal(SignalKind::interrupt())?,
        })
    }

    pub async fn recv(&mut self) {
        tokio::select! {
            _ = self.term.recv() => info!("Received SIGTERM"),
            _ = self.int.recv() => info!("Received SIGINT"),
        }
    }
}
