use super::{encode_frame, ClientConfig, IpcError};
use crate::collector::RecordSink;
use crate::record::OperationRecord;
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Best-effort sender of operation records to the aggregator
///
/// [`send`](TransportClient::send) never returns an error and never waits
/// longer than the configured send timeout. Records that cannot be delivered
/// are dropped; the first drop is logged as a warning, later ones at debug.
///
/// One connection is cached and reused. When it turns out to be dead the
/// client reconnects once within the same timeout budget.
pub struct TransportClient {
    config: ClientConfig,
    stream: Option<UnixStream>,
    warned: bool,
    sent: u64,
    dropped: u64,
}

impl TransportClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            stream: None,
            warned: false,
            sent: 0,
            dropped: 0,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Try to deliver one record; returns whether it was handed to the socket.
    pub async fn send(&mut self, record: &OperationRecord) -> bool {
        let frame = match encode_frame(record) {
            Ok(frame) => frame,
            Err(e) => {
                self.note_drop(&e);
                return false;
            }
        };

        let budget = self.config.send_timeout;
        let outcome = match timeout(budget, self.write_frame(&frame)).await {
            Ok(result) => result,
            Err(_) => Err(IpcError::Timeout(budget)),
        };

        match outcome {
            Ok(()) => {
                self.sent += 1;
                true
            }
            Err(e) => {
                // A cancelled write may have left half a frame on the stream.
                self.stream = None;
                self.note_drop(&e);
                false
            }
        }
    }

    async fn write_frame(&mut self, frame: &[u8]) -> Result<(), IpcError> {
        if let Some(stream) = self.stream.as_mut() {
            match stream.write_all(frame).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    debug!("Cached transport connection failed, reconnecting: {}", e);
                    self.stream = None;
                }
            }
        }

        if !self.config.socket_path.exists() {
            return Err(IpcError::EndpointAbsent(self.config.socket_path.clone()));
        }

        let mut stream = UnixStream::connect(&self.config.socket_path).await?;
        stream.write_all(frame).await?;
        self.stream = Some(stream);
        Ok(())
    }

    fn note_drop(&mut self, error: &IpcError) {
        self.dropped += 1;
        if self.warned {
            debug!(dropped = self.dropped, "Dropped operation record: {}", error);
        } else {
            self.warned = true;
            warn!(
                socket = %self.config.socket_path.display(),
                "Aggregator unavailable, operation records will be dropped: {}",
                error
            );
        }
    }

    /// Close the cached connection, if any.
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = timeout(self.config.send_timeout, stream.shutdown()).await;
        }
    }
}

#[async_trait]
impl RecordSink for TransportClient {
    async fn deliver(&mut self, record: &OperationRecord) -> bool {
        self.send(record).await
    }
}
