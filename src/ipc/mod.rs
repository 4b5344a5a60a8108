//! Transport between workers and the aggregator.
//!
//! Workers hold a [`client::TransportClient`]; the aggregator runs a
//! [`server::TransportServer`] on a Unix domain socket. Each message is one
//! [`OperationRecord`] framed as:
//!
//! ```text
//! +----------------------+---------------------------+
//! | length: u32 (LE)     | payload: JSON, `length` B |
//! +----------------------+---------------------------+
//! ```
//!
//! Payloads above [`MAX_FRAME_SIZE`] are rejected before any allocation.

use crate::record::OperationRecord;
use crate::utils::default_runtime_dir;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub mod client;
pub mod server;

pub use client::TransportClient;
pub use server::TransportServer;

/// Connection identifier for log correlation
pub type ConnectionId = u64;

/// Largest accepted payload.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

pub const DEFAULT_SOCKET_NAME: &str = "opmetrics.sock";

#[derive(Debug, Error)]
pub enum IpcError {
    #[error("frame of {0} bytes exceeds the 1 MiB limit")]
    FrameTooLarge(usize),

    #[error("connection closed in the middle of a frame")]
    TruncatedFrame,

    #[error("transport endpoint {} does not exist", .0.display())]
    EndpointAbsent(PathBuf),

    #[error("transport endpoint {} is already bound", .0.display())]
    EndpointInUse(PathBuf),

    #[error("failed to encode record: {0}")]
    Encode(serde_json::Error),

    #[error("failed to decode record: {0}")]
    Decode(serde_json::Error),

    #[error("transport operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Server-side transport settings
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub socket_path: PathBuf,
    /// Connections serviced at once; extra connections are closed on accept.
    pub max_connections: usize,
    /// A connection with no complete frame for this long is closed.
    pub idle_timeout: Duration,
    /// Upper bound on a single accept wait.
    pub accept_poll: Duration,
    /// How long shutdown waits for open connections to finish.
    pub drain_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            socket_path: default_runtime_dir().join(DEFAULT_SOCKET_NAME),
            max_connections: crate::defaults::MAX_CONNECTIONS,
            idle_timeout: Duration::from_secs(60),
            accept_poll: Duration::from_millis(500),
            drain_timeout: Duration::from_secs(2),
        }
    }
}

/// Worker-side transport settings
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub socket_path: PathBuf,
    /// Total budget for one send, connection included.
    pub send_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            socket_path: default_runtime_dir().join(DEFAULT_SOCKET_NAME),
            send_timeout: crate::defaults::SEND_TIMEOUT,
        }
    }
}

/// Serialize a record into a complete frame, length prefix included.
pub fn encode_frame(record: &OperationRecord) -> Result<Vec<u8>, IpcError> {
    let payload = serde_json::to_vec(record).map_err(IpcError::Encode)?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(IpcError::FrameTooLarge(payload.len()));
    }

    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

pub fn decode_record(payload: &[u8]) -> Result<OperationRecord, IpcError> {
    serde_json::from_slice(payload).map_err(IpcError::Decode)
}

/// Write one raw payload as a frame.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), IpcError>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_FRAME_SIZE {
        return Err(IpcError::FrameTooLarge(payload.len()));
    }
    writer
        .write_all(&(payload.len() as u32).to_le_bytes())
        .await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read the next frame's payload
///
/// Returns `Ok(None)` when the peer closed the connection on a frame
/// boundary. An EOF anywhere inside a frame is [`IpcError::TruncatedFrame`].
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>, IpcError>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 4];
    let mut filled = 0;
    while filled < len_bytes.len() {
        let n = reader.read(&mut len_bytes[filled..]).await?;
        if n == 0 {
            return if filled == 0 {
                Ok(None)
            } else {
                Err(IpcError::TruncatedFrame)
            };
        }
        filled += n;
    }

    let message_len = u32::from_le_bytes(len_bytes) as usize;
    if message_len > MAX_FRAME_SIZE {
        return Err(IpcError::FrameTooLarge(message_len));
    }

    let mut payload = vec![0u8; message_len];
    reader.read_exact(&mut payload).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            IpcError::TruncatedFrame
        } else {
            IpcError::Io(e)
        }
    })?;
    Ok(Some(payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{OperationKind, WorkloadKind};

    fn record() -> OperationRecord {
        OperationRecord::builder(OperationKind::Delete, WorkloadKind::ObjectStorage)
            .key("bucket/key")
            .started_at(chrono::Utc::now())
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_frames_are_read_in_order() {
        let first = encode_frame(&record()).unwrap();
        let second = encode_frame(&record()).unwrap();
        let mut wire = first.clone();
        wire.extend_from_slice(&second);

        let mut reader = wire.as_slice();
        let a = read_frame(&mut reader).await.unwrap().unwrap();
        let b = read_frame(&mut reader).await.unwrap().unwrap();
        assert_eq!(a, first[4..]);
        assert_eq!(b, second[4..]);
        assert!(read_frame(&mut reader).await.unwrap().is_none());
        assert!(decode_record(&a).is_ok());
    }

    #[tokio::test]
    async fn test_truncated_frames() {
        let frame = encode_frame(&record()).unwrap();

        let mut partial_header = &frame[..2];
        assert!(matches!(
            read_frame(&mut partial_header).await,
            Err(IpcError::TruncatedFrame)
        ));

        let mut partial_payload = &frame[..frame.len() - 1];
        assert!(matches!(
            read_frame(&mut partial_payload).await,
            Err(IpcError::TruncatedFrame)
        ));
    }

    #[tokio::test]
    async fn test_oversized_length_rejected_without_reading_payload() {
        let header = ((MAX_FRAME_SIZE + 1) as u32).to_le_bytes();
        let mut reader = &header[..];
        assert!(matches!(
            read_frame(&mut reader).await,
            Err(IpcError::FrameTooLarge(n)) if n == MAX_FRAME_SIZE + 1
        ));
    }

    #[tokio::test]
    async fn test_write_frame_matches_encode_frame() {
        let record = record();
        let payload = serde_json::to_vec(&record).unwrap();
        let mut out = Vec::new();
        write_frame(&mut out, &payload).await.unwrap();
        assert_eq!(out, encode_frame(&record).unwrap());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(decode_record(b"{not json"), Err(IpcError::Decode(_))));
    }

    #[test]
    fn test_config_defaults() {
        let config = TransportConfig::default();
        assert_eq!(config.max_connections, 256);
        assert_eq!(config.idle_timeout, Duration::from_secs(60));
        assert!(config.socket_path.ends_with(DEFAULT_SOCKET_NAME));
        assert_eq!(ClientConfig::default().send_timeout, Duration::from_millis(250));
    }
}
