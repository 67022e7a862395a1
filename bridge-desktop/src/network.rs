//! In-process peer transport.
//!
//! `LoopbackNetwork` wires any number of endpoints together inside one
//! process using `tokio::io::duplex` pipes. It has no NAT traversal and no
//! encryption; it exists so two full sync cores can talk to each other in
//! tests and local demos exactly as they would over a real transport.

use async_trait::async_trait;
use bridge_traits::{
    error::{BridgeError, Result},
    transport::{BiStream, ConnectionInfo, ConnectionKind, NodeId, PeerSession, Transport},
};
use core_async::io::{duplex, split};
use core_async::sync::{mpsc, CancellationToken, Mutex};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

const PIPE_CAPACITY: usize = 64 * 1024;
const STREAM_BACKLOG: usize = 64;
const SESSION_BACKLOG: usize = 16;

type Registry = Arc<RwLock<HashMap<NodeId, mpsc::Sender<Arc<dyn PeerSession>>>>>;

/// A set of endpoints that can reach each other.
#[derive(Clone)]
pub struct LoopbackNetwork {
    registry: Registry,
    info: Arc<RwLock<ConnectionInfo>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(RwLock::new(HashMap::new())),
            info: Arc::new(RwLock::new(ConnectionInfo {
                kind: ConnectionKind::Direct,
                latency_ms: Some(0),
            })),
        }
    }

    /// Connection metadata reported by sessions created after this call.
    pub fn set_connection_info(&self, info: ConnectionInfo) {
        if let Ok(mut current) = self.info.write() {
            *current = info;
        }
    }

    /// Register a new endpoint with the given identity.
    ///
    /// Registering the same id twice replaces the earlier endpoint.
    pub fn endpoint(&self, id: impl Into<NodeId>) -> Arc<LoopbackTransport> {
        let local = id.into();
        let (tx, rx) = mpsc::channel(SESSION_BACKLOG);
        if let Ok(mut registry) = self.registry.write() {
            registry.insert(local.clone(), tx);
        }
        debug!(node_id = %local.short(), "Registered loopback endpoint");

        Arc::new(LoopbackTransport {
            local,
            network: self.clone(),
            incoming: Mutex::new(rx),
            shutdown: CancellationToken::new(),
        })
    }

    fn lookup(&self, id: &NodeId) -> Option<mpsc::Sender<Arc<dyn PeerSession>>> {
        self.registry.read().ok()?.get(id).cloned()
    }

    fn unregister(&self, id: &NodeId) {
        if let Ok(mut registry) = self.registry.write() {
            registry.remove(id);
        }
    }

    fn current_info(&self) -> ConnectionInfo {
        self.info.read().map(|i| *i).unwrap_or_default()
    }
}

impl Default for LoopbackNetwork {
    fn default() -> Self {
        Self::new()
    }
}

/// One endpoint on a [`LoopbackNetwork`].
pub struct LoopbackTransport {
    local: NodeId,
    network: LoopbackNetwork,
    incoming: Mutex<mpsc::Receiver<Arc<dyn PeerSession>>>,
    shutdown: CancellationToken,
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn local_node_id(&self) -> NodeId {
        self.local.clone()
    }

    async fn connect(&self, remote: &NodeId) -> Result<Arc<dyn PeerSession>> {
        if self.shutdown.is_cancelled() {
            return Err(BridgeError::ConnectionClosed(
                "endpoint shut down".to_string(),
            ));
        }

        let target = self
            .network
            .lookup(remote)
            .ok_or_else(|| BridgeError::Unreachable(remote.to_string()))?;

        let (ours, theirs) = LoopbackSession::pair(
            self.local.clone(),
            remote.clone(),
            self.network.current_info(),
        );

        target
            .send(theirs)
            .await
            .map_err(|_| BridgeError::Unreachable(remote.to_string()))?;

        debug!(local = %self.local.short(), remote = %remote.short(), "Loopback session opened");
        Ok(ours)
    }

    async fn accept(&self) -> Result<Arc<dyn PeerSession>> {
        let mut incoming = self.incoming.lock().await;
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(BridgeError::ConnectionClosed("endpoint shut down".to_string())),
            session = incoming.recv() => session.ok_or_else(|| BridgeError::ConnectionClosed("endpoint dropped".to_string())),
        }
    }

    async fn shutdown(&self) -> Result<()> {
        self.shutdown.cancel();
        self.network.unregister(&self.local);
        Ok(())
    }
}

struct LoopbackSession {
    remote: NodeId,
    info: ConnectionInfo,
    outgoing: mpsc::Sender<BiStream>,
    incoming: Mutex<mpsc::Receiver<BiStream>>,
    closed: CancellationToken,
}

impl LoopbackSession {
    /// Two ends of one session sharing a close signal.
    fn pair(
        a: NodeId,
        b: NodeId,
        info: ConnectionInfo,
    ) -> (Arc<dyn PeerSession>, Arc<dyn PeerSession>) {
        let (a_tx, b_rx) = mpsc::channel(STREAM_BACKLOG);
        let (b_tx, a_rx) = mpsc::channel(STREAM_BACKLOG);
        let closed = CancellationToken::new();

        let a_end = LoopbackSession {
            remote: b,
            info,
            outgoing: a_tx,
            incoming: Mutex::new(a_rx),
            closed: closed.clone(),
        };
        let b_end = LoopbackSession {
            remote: a,
            info,
            outgoing: b_tx,
            incoming: Mutex::new(b_rx),
            closed,
        };

        (Arc::new(a_end), Arc::new(b_end))
    }
}

#[async_trait]
impl PeerSession for LoopbackSession {
    fn remote_node_id(&self) -> &NodeId {
        &self.remote
    }

    fn connection_info(&self) -> ConnectionInfo {
        self.info
    }

    async fn open_bi(&self) -> Result<BiStream> {
        if self.closed.is_cancelled() {
            return Err(BridgeError::ConnectionClosed("session closed".to_string()));
        }

        let (local, remote) = duplex(PIPE_CAPACITY);
        let (local_recv, local_send) = split(local);
        let (remote_recv, remote_send) = split(remote);

        self.outgoing
            .send(BiStream {
                send: Box::new(remote_send),
                recv: Box::new(remote_recv),
            })
            .await
            .map_err(|_| BridgeError::ConnectionClosed("peer went away".to_string()))?;

        Ok(BiStream {
            send: Box::new(local_send),
            recv: Box::new(local_recv),
        })
    }

    async fn accept_bi(&self) -> Result<BiStream> {
        let mut incoming = self.incoming.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Err(BridgeError::ConnectionClosed("session closed".to_string())),
            stream = incoming.recv() => stream.ok_or_else(|| BridgeError::ConnectionClosed("peer went away".to_string())),
        }
    }

    fn close(&self, reason: &str) {
        if !self.closed.is_cancelled() {
            debug!(remote = %self.remote.short(), reason, "Closing loopback session");
            self.closed.cancel();
        }
    }

    async fn closed(&self) {
        self.closed.cancelled().await
    }
}
