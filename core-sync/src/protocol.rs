//! # Sync Session Protocol
//!
//! Messages exchanged over a peer session, encoded as JSON and framed with a
//! big-endian `u32` length prefix.
//!
//! ## Streams
//!
//! The downloading side (client) opens the first bidirectional stream. It
//! carries control messages for the life of the session:
//!
//! ```text
//! client                                server
//!   │ Identify{name} ─────────────────────▶ │
//!   │ ◀───────────────────── Identify{name} │
//!   │                                       │  admission
//!   │ ◀───────────────── Accepted | Denied  │
//!   │ ◀──────────────────────── Index{...}  │
//!   │ Download{jobs} ─────────────────────▶ │
//!   │ ◀── Transcoding | Ready | JobFailed   │
//! ```
//!
//! Every job that reaches `Ready` is fetched over its own stream: the client
//! writes one [`StreamRequest`] frame, the server answers with one
//! [`StreamResponse`] frame and, if accepted, exactly `size` raw bytes.

use crate::job::JobId;
use crate::{Result, SyncError};
use bridge_traits::transport::{BiStream, ByteReader, ByteWriter};
use bytes::Bytes;
use core_async::codec::{length_delimited, FramedRead, FramedWrite, LengthDelimitedCodec, MAX_FRAME_LENGTH};
use core_async::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use core_async::sync::Mutex;
use core_library::IndexItem;
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Bumped on incompatible message changes.
pub const PROTOCOL_VERSION: u32 = 1;

// ============================================================================
// Messages
// ============================================================================

/// Sent by the downloading side on the control stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Identify { name: String, version: u32 },
    /// Request files from the index. Job ids are chosen by the client.
    Download { jobs: Vec<JobRequest> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    pub job_id: JobId,
    pub root: String,
    pub path: String,
}

/// Sent by the serving side on the control stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Identify { name: String, version: u32 },
    Accepted,
    Denied,
    Index { items: Vec<IndexItem> },
    Transcoding { job_id: JobId },
    Ready {
        job_id: JobId,
        size: u64,
        /// Output extension when the file was transcoded
        #[serde(default, skip_serializing_if = "Option::is_none")]
        extension: Option<String>,
    },
    JobFailed { job_id: JobId, cause: String },
}

/// First frame on a file stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamRequest {
    pub job_id: JobId,
}

/// Server's answer on a file stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamResponse {
    Accept { size: u64 },
    Reject { cause: String },
}

// ============================================================================
// Control stream
// ============================================================================

/// Write half of a control stream. Shared by the tasks of one session.
pub struct ControlWriter {
    inner: Mutex<FramedWrite<ByteWriter, LengthDelimitedCodec>>,
}

impl ControlWriter {
    pub async fn send<T: Serialize>(&self, message: &T) -> Result<()> {
        let payload = serde_json::to_vec(message)?;
        let mut inner = self.inner.lock().await;
        inner.send(Bytes::from(payload)).await?;
        Ok(())
    }

    /// Flush and close the write side. Errors are ignored; the peer may
    /// already be gone.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        let _ = SinkExt::<Bytes>::close(&mut *inner).await;
    }
}

/// Read half of a control stream.
pub struct ControlReader {
    inner: FramedRead<ByteReader, LengthDelimitedCodec>,
}

impl ControlReader {
    /// Next message, or `None` once the peer closed the stream.
    pub async fn recv<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        match self.inner.next().await {
            Some(Ok(frame)) => Ok(Some(serde_json::from_slice(&frame)?)),
            Some(Err(e)) => Err(SyncError::Io(e)),
            None => Ok(None),
        }
    }

    /// Next message; a closed stream is an error.
    pub async fn expect<T: DeserializeOwned>(&mut self) -> Result<T> {
        self.recv()
            .await?
            .ok_or_else(|| SyncError::SessionClosed("control stream ended".to_string()))
    }
}

/// Split a bidirectional stream into framed control halves.
pub fn control_channel(stream: BiStream) -> (ControlWriter, ControlReader) {
    let writer = ControlWriter {
        inner: Mutex::new(FramedWrite::new(stream.send, length_delimited())),
    };
    let reader = ControlReader {
        inner: FramedRead::new(stream.recv, length_delimited()),
    };
    (writer, reader)
}

// ============================================================================
// File streams
// ============================================================================

/// Write one length-prefixed JSON frame.
///
/// Uses the same framing as the control codec, written by hand so the raw
/// file body can follow on the same stream without a codec buffering it.
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
    T: Serialize,
{
    let payload = serde_json::to_vec(message)?;
    if payload.len() > MAX_FRAME_LENGTH {
        return Err(SyncError::Protocol(format!(
            "frame of {} bytes exceeds limit",
            payload.len()
        )));
    }
    writer.write_u32(payload.len() as u32).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed JSON frame, consuming nothing past it.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin + ?Sized,
    T: DeserializeOwned,
{
    let len = reader.read_u32().await? as usize;
    if len > MAX_FRAME_LENGTH {
        return Err(SyncError::Protocol(format!(
            "frame of {} bytes exceeds limit",
            len
        )));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(serde_json::from_slice(&payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_traits::transport::NodeId;
    use core_async::io::{duplex, split};
    use core_library::FileSize;

    fn pipe() -> (BiStream, BiStream) {
        let (a, b) = duplex(64 * 1024);
        let (a_recv, a_send) = split(a);
        let (b_recv, b_send) = split(b);
        (
            BiStream {
                send: Box::new(a_send),
                recv: Box::new(a_recv),
            },
            BiStream {
                send: Box::new(b_send),
                recv: Box::new(b_recv),
            },
        )
    }

    #[tokio::test]
    async fn test_control_messages_cross_the_stream() {
        let (left, right) = pipe();
        let (client_tx, _client_rx) = control_channel(left);
        let (_server_tx, mut server_rx) = control_channel(right);

        client_tx
            .send(&ClientMessage::Identify {
                name: "laptop".to_string(),
                version: PROTOCOL_VERSION,
            })
            .await
            .unwrap();
        client_tx
            .send(&ClientMessage::Download {
                jobs: vec![JobRequest {
                    job_id: JobId(3),
                    root: "Music".to_string(),
                    path: "a.mp3".to_string(),
                }],
            })
            .await
            .unwrap();

        let first: ClientMessage = server_rx.expect().await.unwrap();
        assert!(matches!(first, ClientMessage::Identify { ref name, .. } if name == "laptop"));
        let second: ClientMessage = server_rx.expect().await.unwrap();
        match second {
            ClientMessage::Download { jobs } => assert_eq!(jobs[0].job_id, JobId(3)),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_closed_control_stream_reads_none() {
        let (left, right) = pipe();
        let (client_tx, _client_rx) = control_channel(left);
        let (_server_tx, mut server_rx) = control_channel(right);

        client_tx.close().await;
        let next: Option<ClientMessage> = server_rx.recv().await.unwrap();
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn test_frame_then_raw_body() {
        let (mut left, mut right) = pipe();

        write_frame(&mut left.send, &StreamResponse::Accept { size: 5 })
            .await
            .unwrap();
        left.send.write_all(b"hello").await.unwrap();
        left.send.shutdown().await.unwrap();

        let header: StreamResponse = read_frame(&mut right.recv).await.unwrap();
        assert_eq!(header, StreamResponse::Accept { size: 5 });
        let mut body = Vec::new();
        right.recv.read_to_end(&mut body).await.unwrap();
        assert_eq!(body, b"hello");
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut left, mut right) = pipe();
        left.send.write_u32(u32::MAX).await.unwrap();
        let err = read_frame::<_, StreamRequest>(&mut right.recv)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Protocol(_)));
    }

    #[test]
    fn test_index_message_shape() {
        let message = ServerMessage::Index {
            items: vec![IndexItem {
                node_id: NodeId::new("server"),
                root: "Music".to_string(),
                path: "a.flac".to_string(),
                hash_kind: "sha256".to_string(),
                hash: vec![1, 2],
                size: FileSize::Estimated(10),
                downloaded: false,
            }],
        };
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "index");
        assert_eq!(json["items"][0]["size"]["certainty"], "estimated");
    }
}
