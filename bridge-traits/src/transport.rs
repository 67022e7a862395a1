//! Peer Transport Abstractions
//!
//! The core never establishes network paths itself. A host transport (QUIC
//! with hole punching, a relay, or an in-process loopback for tests) hands
//! the core authenticated [`PeerSession`]s, and the core speaks its protocol
//! over bidirectional streams opened on them.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;

/// Stable identity of a node, as authenticated by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form used in log lines and default display names.
    pub fn short(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(10)
            .map(|(i, _)| i)
            .unwrap_or(self.0.len());
        &self.0[..end]
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for NodeId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Path the transport is currently using to reach a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionKind {
    /// Direct peer-to-peer path.
    Direct,
    /// Traffic forwarded through a relay server.
    Relay,
    /// Both a direct and a relayed path are in use.
    Mixed,
    /// No path information available.
    Unknown,
}

impl ConnectionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionKind::Direct => "direct",
            ConnectionKind::Relay => "relay",
            ConnectionKind::Mixed => "mixed",
            ConnectionKind::Unknown => "unknown",
        }
    }
}

/// Point-in-time connection metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub kind: ConnectionKind,
    /// Round-trip latency in milliseconds, when the transport measures it.
    pub latency_ms: Option<u64>,
}

impl Default for ConnectionInfo {
    fn default() -> Self {
        Self {
            kind: ConnectionKind::Unknown,
            latency_ms: None,
        }
    }
}

pub type ByteReader = Box<dyn AsyncRead + Send + Unpin>;
pub type ByteWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// One bidirectional stream on a peer session.
pub struct BiStream {
    pub send: ByteWriter,
    pub recv: ByteReader,
}

impl fmt::Debug for BiStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BiStream").finish_non_exhaustive()
    }
}

/// An established, authenticated connection to one remote node.
///
/// Streams are independent: a stalled stream must not block others opened on
/// the same session.
#[async_trait]
pub trait PeerSession: Send + Sync {
    /// Identity of the remote node.
    fn remote_node_id(&self) -> &NodeId;

    /// Current path kind and latency.
    fn connection_info(&self) -> ConnectionInfo;

    /// Open a new bidirectional stream to the remote node.
    async fn open_bi(&self) -> Result<BiStream>;

    /// Wait for the remote node to open a bidirectional stream.
    ///
    /// Returns [`BridgeError::ConnectionClosed`](crate::BridgeError::ConnectionClosed)
    /// once the session has ended.
    async fn accept_bi(&self) -> Result<BiStream>;

    /// Close the session. Pending and future stream operations fail.
    ///
    /// Calling this more than once has no further effect.
    fn close(&self, reason: &str);

    /// Resolves once the session has been closed by either side.
    async fn closed(&self);
}

/// Node-level transport endpoint.
///
/// # Example
///
/// ```ignore
/// use bridge_traits::transport::Transport;
///
/// async fn dial(transport: &dyn Transport, remote: &NodeId) -> Result<()> {
///     let session = transport.connect(remote).await?;
///     let stream = session.open_bi().await?;
///     // speak the protocol on `stream`
///     Ok(())
/// }
/// ```
#[async_trait]
pub trait Transport: Send + Sync {
    /// This node's identity.
    fn local_node_id(&self) -> NodeId;

    /// Establish a session with a remote node.
    async fn connect(&self, remote: &NodeId) -> Result<Arc<dyn PeerSession>>;

    /// Wait for the next incoming session.
    ///
    /// Returns [`BridgeError::ConnectionClosed`](crate::BridgeError::ConnectionClosed)
    /// once the endpoint has shut down.
    async fn accept(&self) -> Result<Arc<dyn PeerSession>>;

    /// Stop accepting sessions and close existing ones.
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}
