use super::{decode_record, read_frame, ConnectionId, IpcError, TransportConfig};
use crate::registry::{
    MetricRegistry, TRANSPORT_CONNECTIONS_TOTAL, TRANSPORT_MALFORMED_TOTAL,
    TRANSPORT_REFUSED_TOTAL,
};
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{watch, Semaphore};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Read wait while draining; a connection quiet for this long is closed.
const DRAIN_POLL: Duration = Duration::from_millis(100);

/// Aggregator side of the transport
///
/// Accepts worker connections on a Unix socket, decodes one record per frame
/// and applies it to the shared [`MetricRegistry`]. At most
/// `max_connections` connections are serviced at once; connections beyond
/// that are closed immediately and counted as refused.
pub struct TransportServer {
    listener: UnixListener,
    config: TransportConfig,
    registry: Arc<MetricRegistry>,
    next_connection_id: AtomicU64,
    active: Arc<AtomicUsize>,
    // Only the server that bound the socket file unlinks it.
    owns_socket_file: bool,
}

impl TransportServer {
    /// Bind the endpoint
    ///
    /// An existing file at the socket path is never removed here: stale
    /// endpoints are the lifecycle manager's business.
    pub fn bind(config: TransportConfig, registry: Arc<MetricRegistry>) -> Result<Self, IpcError> {
        let path = &config.socket_path;
        if std::fs::symlink_metadata(path).is_ok() {
            return Err(IpcError::EndpointInUse(path.clone()));
        }

        let listener = match UnixListener::bind(path) {
            Ok(listener) => listener,
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                return Err(IpcError::EndpointInUse(path.clone()));
            }
            Err(e) => return Err(IpcError::Io(e)),
        };

        // Relax permissions so workers running as other users can connect
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o666)) {
                warn!(socket = %path.display(), "Failed to set socket permissions: {}", e);
            }
        }

        info!(socket = %path.display(), "Transport endpoint bound");
        Ok(Self {
            listener,
            config,
            registry,
            next_connection_id: AtomicU64::new(1),
            active: Arc::new(AtomicUsize::new(0)),
            owns_socket_file: true,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.config.socket_path
    }

    /// Connections currently being serviced.
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Accept and service connections until `shutdown` turns true, then
    /// wait up to the drain timeout for open connections to finish.
    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) {
        let semaphore = Arc::new(Semaphore::new(self.config.max_connections));

        while !*shutdown.borrow() {
            let accepted = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                result = timeout(self.config.accept_poll, self.listener.accept()) => result,
            };

            let stream = match accepted {
                Err(_) => continue,
                Ok(Err(e)) => {
                    warn!("Failed to accept transport connection: {}", e);
                    continue;
                }
                Ok(Ok((stream, _addr))) => stream,
            };

            let permit = match semaphore.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    self.registry.note_transport_event(TRANSPORT_REFUSED_TOTAL);
                    warn!(
                        limit = self.config.max_connections,
                        "Connection limit reached, refusing transport connection"
                    );
                    drop(stream);
                    continue;
                }
            };

            let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
            self.registry.note_transport_event(TRANSPORT_CONNECTIONS_TOTAL);
            let connection = Connection {
                id,
                registry: Arc::clone(&self.registry),
                active: Arc::clone(&self.active),
                idle_timeout: self.config.idle_timeout,
            };
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                connection.run(stream, shutdown).await;
                drop(permit);
            });
        }

        self.drain().await;
    }

    async fn drain(&self) {
        let deadline = Instant::now() + self.config.drain_timeout;
        while self.active.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let remaining = self.active.load(Ordering::SeqCst);
        if remaining > 0 {
            warn!(remaining, "Transport connections still open after drain timeout");
        } else {
            debug!("Transport drained");
        }
    }

    fn cleanup_socket(&self) {
        if !self.owns_socket_file {
            return;
        }
        if let Err(e) = crate::utils::remove_if_exists(&self.config.socket_path) {
            warn!(
                socket = %self.config.socket_path.display(),
                "Failed to remove socket file: {}",
                e
            );
        }
    }
}

impl Drop for TransportServer {
    fn drop(&mut self) {
        self.cleanup_socket();
    }
}

struct Connection {
    id: ConnectionId,
    registry: Arc<MetricRegistry>,
    active: Arc<AtomicUsize>,
    idle_timeout: Duration,
}

impl Connection {
    async fn run(self, mut stream: UnixStream, mut shutdown: watch::Receiver<bool>) {
        self.active.fetch_add(1, Ordering::SeqCst);
        self.registry.worker_connected();
        debug!(connection = self.id, "Transport connection opened");

        let mut received = 0u64;
        let mut draining = false;
        loop {
            // Waiting for readability is cancel-safe; once bytes arrive the
            // whole frame is read without interruption.
            let wait = if draining { DRAIN_POLL } else { self.idle_timeout };
            let readable = tokio::select! {
                _ = shutdown.wait_for(|stop| *stop), if !draining => {
                    debug!(connection = self.id, "Draining connection for shutdown");
                    draining = true;
                    continue;
                }
                readable = timeout(wait, stream.readable()) => readable,
            };
            match readable {
                Err(_) if draining => break,
                Err(_) => {
                    debug!(connection = self.id, "Closing idle connection");
                    break;
                }
                Ok(Err(e)) => {
                    debug!(connection = self.id, "Connection failed: {}", e);
                    break;
                }
                Ok(Ok(())) => {}
            }

            let frame = match timeout(wait, read_frame(&mut stream)).await {
                Ok(frame) => frame,
                Err(_) => {
                    debug!(connection = self.id, "Timed out inside a frame");
                    break;
                }
            };

            match frame {
                Ok(None) => break,
                Ok(Some(payload)) => match decode_record(&payload) {
                    Ok(record) => {
                        received += 1;
                        self.registry.record_operation(&record);
                    }
                    Err(e) => {
                        // Framing is intact, so the connection stays usable.
                        self.registry.note_transport_event(TRANSPORT_MALFORMED_TOTAL);
                        warn!(connection = self.id, "Discarding malformed record: {}", e);
                    }
                },
                Err(e @ IpcError::FrameTooLarge(_)) => {
                    self.registry.note_transport_event(TRANSPORT_MALFORMED_TOTAL);
                    warn!(connection = self.id, "Closing connection: {}", e);
                    break;
                }
                Err(e) => {
                    debug!(connection = self.id, "Connection closed: {}", e);
                    break;
                }
            }
        }

        self.registry.worker_disconnected();
        self.active.fetch_sub(1, Ordering::SeqCst);
        debug!(connection = self.id, received, "Transport connection finished");
    }
}
