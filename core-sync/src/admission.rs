//! # Admission Manager
//!
//! Owns every live connection and decides which of them may exchange an
//! index.
//!
//! ## Connection arena
//!
//! Connections are keyed by `(direction, node id)`, so a node can serve us and
//! download from us at the same time but never holds two connections in the
//! same direction:
//!
//! - a second incoming attempt while the first is still pending is closed and
//!   collapses onto the pending connection;
//! - a reconnect while accepted supersedes the old connection, which is torn
//!   down with its jobs cancelled;
//! - a second outgoing attempt reuses the live connection.
//!
//! ## Lifecycle
//!
//! ```text
//! incoming: Pending ──accept──▶ Accepted ──close──▶ Closed
//!              │ (trusted: straight to Accepted)
//!              └────deny────▶ Denied (removed, session closed)
//! outgoing: Pending ──remote verdict──▶ Accepted | Denied
//! ```
//!
//! Teardown is idempotent: it fails every non-terminal job with
//! `"cancelled"`, cancels the connection's token, closes the session and
//! waits for the connection's tasks to finish before returning.

use crate::job::{JobId, JobTable, JobView, TransferJob, CANCELLED};
use crate::protocol::ControlWriter;
use crate::{Result, SyncError};
use bridge_traits::time::Clock;
use bridge_traits::transport::{ConnectionInfo, ConnectionKind, NodeId, PeerSession};
use core_async::sync::{watch, CancellationToken, Mutex, RwLock, Semaphore};
use core_async::task::TaskTracker;
use core_library::repositories::TrustStore;
use core_library::{IndexItem, ItemKey};
use core_runtime::events::{
    ConnectionDirection, ConnectionEvent, CoreEvent, EventBus, LibraryEvent, TransferEvent,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Pending,
    Accepted,
    Denied,
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Pending => "pending",
            ConnectionState::Accepted => "accepted",
            ConnectionState::Denied => "denied",
            ConnectionState::Closed => "closed",
        }
    }
}

/// Outcome of the trust check for a new incoming connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    AutoAccept,
    AwaitOwner,
}

/// Result of registering a connection.
pub enum Admission {
    Admitted {
        connection: Arc<Connection>,
        decision: Decision,
    },
    /// A live connection already exists; the new session was closed.
    Collapsed(Arc<Connection>),
}

type ConnectionKey = (ConnectionDirection, NodeId);

// ============================================================================
// Connection
// ============================================================================

pub struct Connection {
    node_id: NodeId,
    direction: ConnectionDirection,
    generation: u64,
    name: String,
    connected_at: i64,
    info: ConnectionInfo,
    session: Arc<dyn PeerSession>,
    control: ControlWriter,
    cancel: CancellationToken,
    state: watch::Sender<ConnectionState>,
    trusted: AtomicBool,
    closed: AtomicBool,
    remote_index: RwLock<Option<Vec<IndexItem>>>,
    jobs: Mutex<JobTable>,
    transfers: Arc<Semaphore>,
    tasks: TaskTracker,
    events: EventBus,
}

impl Connection {
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn direction(&self) -> ConnectionDirection {
        self.direction
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn info(&self) -> ConnectionInfo {
        self.info
    }

    pub fn session(&self) -> &Arc<dyn PeerSession> {
        &self.session
    }

    pub fn control(&self) -> &ControlWriter {
        &self.control
    }

    /// Fires when the connection is torn down.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Tasks bound to this connection; waited for on teardown.
    pub fn tasks(&self) -> &TaskTracker {
        &self.tasks
    }

    /// Bounds the file streams running at once on this connection.
    pub fn transfers(&self) -> Arc<Semaphore> {
        Arc::clone(&self.transfers)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_trusted(&self) -> bool {
        self.trusted.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Wait until the connection leaves `Pending`.
    pub async fn wait_verdict(&self) -> ConnectionState {
        let mut receiver = self.state.subscribe();
        loop {
            let current = *receiver.borrow_and_update();
            if current != ConnectionState::Pending {
                return current;
            }
            if receiver.changed().await.is_err() {
                return ConnectionState::Closed;
            }
        }
    }

    /// Wait for the verdict and turn a refusal into an error.
    pub async fn wait_admitted(&self) -> Result<()> {
        match self.wait_verdict().await {
            ConnectionState::Accepted => Ok(()),
            ConnectionState::Denied => Err(SyncError::AdmissionDenied {
                node_id: self.node_id.to_string(),
            }),
            other => Err(SyncError::SessionClosed(format!(
                "connection {} before admission",
                other.as_str()
            ))),
        }
    }

    pub async fn remote_index(&self) -> Option<Vec<IndexItem>> {
        self.remote_index.read().await.clone()
    }

    /// Store the index received from the remote node. The index is sent once
    /// per session; later copies are ignored and `false` is returned.
    pub async fn set_remote_index(&self, items: Vec<IndexItem>) -> bool {
        let mut index = self.remote_index.write().await;
        if index.is_some() {
            return false;
        }
        *index = Some(items);
        true
    }

    pub async fn mark_item_downloaded(&self, key: &ItemKey) {
        if let Some(items) = self.remote_index.write().await.as_mut() {
            for item in items.iter_mut().filter(|item| &item.key() == key) {
                item.downloaded = true;
            }
        }
    }

    /// Add freshly created jobs.
    pub async fn insert_jobs(&self, new_jobs: Vec<TransferJob>) {
        let count = new_jobs.len() as u64;
        let mut jobs = self.jobs.lock().await;
        for job in new_jobs {
            jobs.insert(job);
        }
        self.emit(CoreEvent::Transfer(TransferEvent::JobsCreated {
            node_id: self.node_id.to_string(),
            direction: self.direction,
            count,
        }));
    }

    /// Keys of items that already have a live job on this connection.
    pub async fn active_item_keys(&self) -> HashSet<ItemKey> {
        self.jobs
            .lock()
            .await
            .iter()
            .filter(|job| !job.state.is_terminal())
            .map(|job| job.item.key())
            .collect()
    }

    pub async fn has_job(&self, id: JobId) -> bool {
        self.jobs.lock().await.contains(id)
    }

    /// A copy of one job.
    pub async fn job(&self, id: JobId) -> Option<TransferJob> {
        self.jobs.lock().await.get(id).cloned()
    }

    /// Apply a transition to one job and report its new state.
    ///
    /// Transitions of one job are serialised by the job table lock, so
    /// observers see them in order.
    pub async fn update_job<F>(&self, id: JobId, apply: F) -> Result<TransferJob>
    where
        F: FnOnce(&mut TransferJob) -> Result<()>,
    {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(id)?;
        apply(job)?;
        self.emit_job(job);
        Ok(job.clone())
    }

    pub fn report_progress(&self, id: JobId, bytes: u64, total: Option<u64>) {
        self.emit(CoreEvent::Transfer(TransferEvent::Progress {
            node_id: self.node_id.to_string(),
            direction: self.direction,
            job_id: id.0,
            bytes,
            total,
        }));
    }

    pub async fn job_views(&self) -> Vec<JobView> {
        self.jobs.lock().await.views()
    }

    pub async fn view(&self) -> ConnectionView {
        ConnectionView {
            node_id: self.node_id.clone(),
            name: self.name.clone(),
            direction: self.direction,
            state: self.state(),
            connected_at: self.connected_at,
            kind: self.info.kind,
            latency_ms: self.info.latency_ms,
            trusted: self.is_trusted(),
            jobs: self.job_views().await,
            index: self.remote_index().await,
        }
    }

    fn emit_job(&self, job: &TransferJob) {
        use crate::job::JobState;

        let node_id = self.node_id.to_string();
        let event = match &job.state {
            JobState::Finished { .. } => TransferEvent::Finished {
                node_id,
                direction: self.direction,
                job_id: job.id.0,
                bytes: job.bytes().get(),
            },
            JobState::Failed { error } => TransferEvent::Failed {
                node_id,
                direction: self.direction,
                job_id: job.id.0,
                message: error.clone(),
            },
            state => TransferEvent::StateChanged {
                node_id,
                direction: self.direction,
                job_id: job.id.0,
                state: state.as_str().to_string(),
            },
        };
        self.emit(CoreEvent::Transfer(event));
    }

    fn emit(&self, event: CoreEvent) {
        let _ = self.events.emit(event);
    }
}

/// Read-only view of a connection for snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionView {
    pub node_id: NodeId,
    pub name: String,
    pub direction: ConnectionDirection,
    pub state: ConnectionState,
    pub connected_at: i64,
    pub kind: ConnectionKind,
    pub latency_ms: Option<u64>,
    pub trusted: bool,
    pub jobs: Vec<JobView>,
    /// Index received from the remote node (outgoing connections only)
    pub index: Option<Vec<IndexItem>>,
}

// ============================================================================
// Admission Manager
// ============================================================================

pub struct AdmissionManager {
    trust: Arc<dyn TrustStore>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    max_transfers: usize,
    connections: RwLock<HashMap<ConnectionKey, Arc<Connection>>>,
    generations: AtomicU64,
}

impl AdmissionManager {
    pub fn new(
        trust: Arc<dyn TrustStore>,
        clock: Arc<dyn Clock>,
        events: EventBus,
        max_transfers: usize,
    ) -> Self {
        Self {
            trust,
            clock,
            events,
            max_transfers: max_transfers.max(1),
            connections: RwLock::new(HashMap::new()),
            generations: AtomicU64::new(0),
        }
    }

    /// Register an incoming connection after the identity exchange.
    ///
    /// Trusted nodes are accepted immediately; others wait for the owner.
    #[instrument(skip(self, info, session, control), fields(node_id = %node_id.short()))]
    pub async fn on_incoming(
        &self,
        node_id: NodeId,
        name: String,
        info: ConnectionInfo,
        session: Arc<dyn PeerSession>,
        control: ControlWriter,
    ) -> Result<Admission> {
        let trusted = self.trust.is_trusted(&node_id).await?;
        let decision = if trusted {
            Decision::AutoAccept
        } else {
            Decision::AwaitOwner
        };
        let key = (ConnectionDirection::Incoming, node_id.clone());

        let mut connections = self.connections.write().await;
        let mut superseded = None;
        if let Some(existing) = connections.get(&key).cloned() {
            match existing.state() {
                ConnectionState::Pending => {
                    drop(connections);
                    debug!("Duplicate attempt while pending");
                    session.close("duplicate connection");
                    return Ok(Admission::Collapsed(existing));
                }
                ConnectionState::Accepted => superseded = connections.remove(&key),
                _ => {}
            }
        }

        let initial = match decision {
            Decision::AutoAccept => ConnectionState::Accepted,
            Decision::AwaitOwner => ConnectionState::Pending,
        };
        let connection = self.build(
            node_id.clone(),
            ConnectionDirection::Incoming,
            name.clone(),
            info,
            session,
            control,
            initial,
            trusted,
        );
        connections.insert(key, Arc::clone(&connection));
        drop(connections);

        if let Some(old) = superseded {
            info!("Reconnect supersedes accepted connection");
            self.teardown(&old, "superseded by a new connection").await;
        }

        let event = match decision {
            Decision::AutoAccept => {
                info!("Trusted node admitted");
                ConnectionEvent::Accepted {
                    node_id: node_id.to_string(),
                    name,
                    direction: ConnectionDirection::Incoming,
                    trusted: true,
                }
            }
            Decision::AwaitOwner => {
                info!("Connection awaiting owner decision");
                ConnectionEvent::Pending {
                    node_id: node_id.to_string(),
                    name,
                    direction: ConnectionDirection::Incoming,
                }
            }
        };
        self.emit(CoreEvent::Connection(event));

        Ok(Admission::Admitted {
            connection,
            decision,
        })
    }

    /// Register an outgoing connection. It stays pending until the remote
    /// owner decides.
    #[instrument(skip(self, info, session, control), fields(node_id = %node_id.short()))]
    pub async fn register_outgoing(
        &self,
        node_id: NodeId,
        name: String,
        info: ConnectionInfo,
        session: Arc<dyn PeerSession>,
        control: ControlWriter,
    ) -> Admission {
        let key = (ConnectionDirection::Outgoing, node_id.clone());
        let mut connections = self.connections.write().await;
        if let Some(existing) = connections.get(&key).cloned() {
            drop(connections);
            debug!("Outgoing connection already live");
            session.close("duplicate connection");
            return Admission::Collapsed(existing);
        }

        let connection = self.build(
            node_id.clone(),
            ConnectionDirection::Outgoing,
            name.clone(),
            info,
            session,
            control,
            ConnectionState::Pending,
            false,
        );
        connections.insert(key, Arc::clone(&connection));
        drop(connections);

        self.emit(CoreEvent::Connection(ConnectionEvent::Pending {
            node_id: node_id.to_string(),
            name,
            direction: ConnectionDirection::Outgoing,
        }));

        Admission::Admitted {
            connection,
            decision: Decision::AwaitOwner,
        }
    }

    /// Record the remote owner's verdict on an outgoing connection.
    pub async fn remote_verdict(&self, connection: &Arc<Connection>, accepted: bool) -> Result<()> {
        let to = if accepted {
            ConnectionState::Accepted
        } else {
            ConnectionState::Denied
        };
        if !move_from_pending(connection, to) {
            return Err(SyncError::Protocol(format!(
                "verdict received while {}",
                connection.state().as_str()
            )));
        }

        let node_id = connection.node_id.to_string();
        if accepted {
            info!(node_id = %connection.node_id.short(), "Admitted by remote node");
            self.emit(CoreEvent::Connection(ConnectionEvent::Accepted {
                node_id,
                name: connection.name.clone(),
                direction: ConnectionDirection::Outgoing,
                trusted: false,
            }));
        } else {
            info!(node_id = %connection.node_id.short(), "Denied by remote node");
            self.remove(connection).await;
            self.emit(CoreEvent::Connection(ConnectionEvent::Denied {
                node_id,
                direction: ConnectionDirection::Outgoing,
            }));
        }
        Ok(())
    }

    /// Admit a pending incoming connection, optionally trusting the node for
    /// future connections. Trust is recorded before the connection is
    /// admitted.
    #[instrument(skip(self), fields(node_id = %node_id.short()))]
    pub async fn accept(&self, node_id: &NodeId, trust: bool) -> Result<()> {
        let connection = self.pending_incoming(node_id).await?;

        if trust {
            self.trust
                .trust(node_id, self.clock.unix_timestamp())
                .await?;
            connection.trusted.store(true, Ordering::SeqCst);
            self.emit(CoreEvent::Library(LibraryEvent::TrustChanged {
                node_id: node_id.to_string(),
                trusted: true,
            }));
        }

        if !move_from_pending(&connection, ConnectionState::Accepted) {
            return Err(invalid_state(&connection, ConnectionState::Pending));
        }

        info!(trust, "Connection accepted");
        self.emit(CoreEvent::Connection(ConnectionEvent::Accepted {
            node_id: node_id.to_string(),
            name: connection.name.clone(),
            direction: ConnectionDirection::Incoming,
            trusted: trust,
        }));
        Ok(())
    }

    /// Refuse a pending incoming connection. The session task tells the
    /// remote node and closes the session; no index is sent.
    #[instrument(skip(self), fields(node_id = %node_id.short()))]
    pub async fn deny(&self, node_id: &NodeId) -> Result<()> {
        let connection = self.pending_incoming(node_id).await?;
        if !move_from_pending(&connection, ConnectionState::Denied) {
            return Err(invalid_state(&connection, ConnectionState::Pending));
        }
        self.remove(&connection).await;

        info!("Connection denied");
        self.emit(CoreEvent::Connection(ConnectionEvent::Denied {
            node_id: node_id.to_string(),
            direction: ConnectionDirection::Incoming,
        }));
        Ok(())
    }

    /// Owner-initiated close.
    #[instrument(skip(self), fields(node_id = %node_id.short()))]
    pub async fn close(&self, node_id: &NodeId, direction: ConnectionDirection) -> Result<()> {
        let connection = self
            .get(node_id, direction)
            .await
            .ok_or_else(|| SyncError::ConnectionNotFound {
                node_id: node_id.to_string(),
                direction: direction.as_str().to_string(),
            })?;
        self.teardown(&connection, "closed by owner").await;
        Ok(())
    }

    /// Tear down a connection whose session ended.
    pub async fn release(&self, connection: &Arc<Connection>, reason: &str) {
        self.teardown(connection, reason).await;
    }

    pub async fn get(
        &self,
        node_id: &NodeId,
        direction: ConnectionDirection,
    ) -> Option<Arc<Connection>> {
        self.connections
            .read()
            .await
            .get(&(direction, node_id.clone()))
            .cloned()
    }

    /// Every live connection, ordered by direction then node id.
    pub async fn list(&self) -> Vec<Arc<Connection>> {
        let connections = self.connections.read().await;
        let mut list: Vec<_> = connections.values().cloned().collect();
        list.sort_by(|a, b| {
            (a.direction.as_str(), &a.node_id).cmp(&(b.direction.as_str(), &b.node_id))
        });
        list
    }

    /// Tear down every connection.
    pub async fn shutdown(&self) {
        let all: Vec<_> = self.connections.read().await.values().cloned().collect();
        for connection in all {
            self.teardown(&connection, "shutting down").await;
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        &self,
        node_id: NodeId,
        direction: ConnectionDirection,
        name: String,
        info: ConnectionInfo,
        session: Arc<dyn PeerSession>,
        control: ControlWriter,
        initial: ConnectionState,
        trusted: bool,
    ) -> Arc<Connection> {
        let (state, _) = watch::channel(initial);
        Arc::new(Connection {
            node_id,
            direction,
            generation: self.generations.fetch_add(1, Ordering::SeqCst),
            name,
            connected_at: self.clock.unix_timestamp(),
            info,
            session,
            control,
            cancel: CancellationToken::new(),
            state,
            trusted: AtomicBool::new(trusted),
            closed: AtomicBool::new(false),
            remote_index: RwLock::new(None),
            jobs: Mutex::new(JobTable::new()),
            transfers: Arc::new(Semaphore::new(self.max_transfers)),
            tasks: TaskTracker::new(),
            events: self.events.clone(),
        })
    }

    async fn pending_incoming(&self, node_id: &NodeId) -> Result<Arc<Connection>> {
        let connection = self
            .get(node_id, ConnectionDirection::Incoming)
            .await
            .ok_or_else(|| SyncError::ConnectionNotFound {
                node_id: node_id.to_string(),
                direction: ConnectionDirection::Incoming.as_str().to_string(),
            })?;
        if connection.state() != ConnectionState::Pending {
            return Err(invalid_state(&connection, ConnectionState::Pending));
        }
        Ok(connection)
    }

    /// Drop `connection` from the arena unless a newer one replaced it.
    async fn remove(&self, connection: &Arc<Connection>) {
        let key = (connection.direction, connection.node_id.clone());
        let mut connections = self.connections.write().await;
        if connections
            .get(&key)
            .is_some_and(|current| current.generation == connection.generation)
        {
            connections.remove(&key);
        }
    }

    async fn teardown(&self, connection: &Arc<Connection>, reason: &str) {
        if connection.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.remove(connection).await;

        // Jobs fail before the token fires so in-flight transfers cannot
        // record a different outcome.
        let cancelled = {
            let mut jobs = connection.jobs.lock().await;
            let ids = jobs.fail_all_active(CANCELLED);
            for id in &ids {
                if let Some(job) = jobs.get(*id) {
                    connection.emit_job(job);
                }
            }
            ids.len()
        };

        connection.cancel.cancel();
        connection.session.close(reason);
        connection.tasks.close();
        connection.tasks.wait().await;

        let was_denied = connection.state() == ConnectionState::Denied;
        connection.state.send_if_modified(|state| {
            if *state == ConnectionState::Denied {
                false
            } else {
                *state = ConnectionState::Closed;
                true
            }
        });

        if cancelled > 0 {
            warn!(node_id = %connection.node_id.short(), cancelled, "Cancelled outstanding jobs");
        }
        info!(node_id = %connection.node_id.short(), direction = connection.direction.as_str(), reason, "Connection closed");

        if !was_denied {
            self.emit(CoreEvent::Connection(ConnectionEvent::Closed {
                node_id: connection.node_id.to_string(),
                direction: connection.direction,
                reason: reason.to_string(),
            }));
        }
    }

    fn emit(&self, event: CoreEvent) {
        let _ = self.events.emit(event);
    }
}

fn move_from_pending(connection: &Connection, to: ConnectionState) -> bool {
    connection.state.send_if_modified(|state| {
        if *state == ConnectionState::Pending {
            *state = to;
            true
        } else {
            false
        }
    })
}

fn invalid_state(connection: &Connection, expected: ConnectionState) -> SyncError {
    SyncError::InvalidConnectionState {
        node_id: connection.node_id.to_string(),
        state: connection.state().as_str().to_string(),
        expected: expected.as_str().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobState;
    use crate::protocol::control_channel;
    use bridge_desktop::LoopbackNetwork;
    use bridge_traits::time::SystemClock;
    use bridge_traits::transport::Transport;
    use core_library::db::create_test_pool;
    use core_library::repositories::SqliteTrustStore;
    use core_library::FileSize;

    struct Harness {
        manager: AdmissionManager,
        trust: Arc<SqliteTrustStore>,
        events: EventBus,
        network: LoopbackNetwork,
    }

    async fn harness() -> Harness {
        let pool = create_test_pool().await.unwrap();
        let trust = Arc::new(SqliteTrustStore::new(pool));
        let events = EventBus::new(256);
        let manager = AdmissionManager::new(
            trust.clone(),
            Arc::new(SystemClock),
            events.clone(),
            2,
        );
        Harness {
            manager,
            trust,
            events,
            network: LoopbackNetwork::new(),
        }
    }

    /// An accepted session from `remote` plus a control writer on it.
    async fn incoming(h: &Harness, remote: &str) -> (Arc<dyn PeerSession>, ControlWriter) {
        let local = h.network.endpoint("local");
        let peer = h.network.endpoint(remote);
        let outgoing = peer.connect(&NodeId::new("local")).await.unwrap();
        let session = local.accept().await.unwrap();
        let stream = outgoing.open_bi().await.unwrap();
        let (writer, _reader) = control_channel(stream);
        (session, writer)
    }

    async fn admit(h: &Harness, remote: &str) -> Admission {
        let (session, control) = incoming(h, remote).await;
        h.manager
            .on_incoming(
                NodeId::new(remote),
                remote.to_string(),
                ConnectionInfo::default(),
                session,
                control,
            )
            .await
            .unwrap()
    }

    fn admitted(admission: Admission) -> (Arc<Connection>, Decision) {
        match admission {
            Admission::Admitted {
                connection,
                decision,
            } => (connection, decision),
            Admission::Collapsed(_) => panic!("expected a new connection"),
        }
    }

    fn item(path: &str) -> IndexItem {
        IndexItem {
            node_id: NodeId::new("remote"),
            root: "Music".to_string(),
            path: path.to_string(),
            hash_kind: "sha256".to_string(),
            hash: vec![1; 32],
            size: FileSize::Actual(10),
            downloaded: false,
        }
    }

    #[tokio::test]
    async fn test_unknown_node_waits_for_owner() {
        let h = harness().await;
        let (connection, decision) = admitted(admit(&h, "phone").await);
        assert_eq!(decision, Decision::AwaitOwner);
        assert_eq!(connection.state(), ConnectionState::Pending);

        h.manager.accept(&NodeId::new("phone"), false).await.unwrap();
        assert_eq!(connection.wait_verdict().await, ConnectionState::Accepted);
        assert!(!h.trust.is_trusted(&NodeId::new("phone")).await.unwrap());
    }

    #[tokio::test]
    async fn test_accept_and_trust_persists_before_accepting() {
        let h = harness().await;
        let (connection, _) = admitted(admit(&h, "phone").await);
        h.manager.accept(&NodeId::new("phone"), true).await.unwrap();
        assert!(h.trust.is_trusted(&NodeId::new("phone")).await.unwrap());
        assert!(connection.is_trusted());

        // Next time the node is admitted without asking.
        h.manager.close(&NodeId::new("phone"), ConnectionDirection::Incoming).await.unwrap();
        let (again, decision) = admitted(admit(&h, "phone").await);
        assert_eq!(decision, Decision::AutoAccept);
        assert_eq!(again.state(), ConnectionState::Accepted);
    }

    #[tokio::test]
    async fn test_deny_removes_connection() {
        let h = harness().await;
        let mut events = h.events.subscribe();
        let (connection, _) = admitted(admit(&h, "phone").await);

        h.manager.deny(&NodeId::new("phone")).await.unwrap();
        assert!(matches!(
            connection.wait_admitted().await,
            Err(SyncError::AdmissionDenied { .. })
        ));
        assert!(h
            .manager
            .get(&NodeId::new("phone"), ConnectionDirection::Incoming)
            .await
            .is_none());

        // Releasing afterwards reports no extra close.
        h.manager.release(&connection, "session ended").await;
        let mut closed = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, CoreEvent::Connection(ConnectionEvent::Closed { .. })) {
                closed += 1;
            }
        }
        assert_eq!(closed, 0);
        assert_eq!(connection.state(), ConnectionState::Denied);
    }

    #[tokio::test]
    async fn test_accept_requires_pending() {
        let h = harness().await;
        let err = h.manager.accept(&NodeId::new("ghost"), false).await.unwrap_err();
        assert!(matches!(err, SyncError::ConnectionNotFound { .. }));

        admit(&h, "phone").await;
        h.manager.accept(&NodeId::new("phone"), false).await.unwrap();
        let err = h.manager.deny(&NodeId::new("phone")).await.unwrap_err();
        assert!(matches!(err, SyncError::InvalidConnectionState { .. }));
    }

    #[tokio::test]
    async fn test_duplicate_pending_attempt_collapses() {
        let h = harness().await;
        let (first, _) = admitted(admit(&h, "phone").await);
        match admit(&h, "phone").await {
            Admission::Collapsed(existing) => assert!(Arc::ptr_eq(&existing, &first)),
            Admission::Admitted { .. } => panic!("second attempt should collapse"),
        }
        assert_eq!(h.manager.list().await.len(), 1);
    }

    #[tokio::test]
    async fn test_reconnect_supersedes_accepted_connection() {
        let h = harness().await;
        let (old, _) = admitted(admit(&h, "phone").await);
        h.manager.accept(&NodeId::new("phone"), false).await.unwrap();
        old.insert_jobs(vec![TransferJob::new(JobId(1), item("a.mp3"), 0)])
            .await;

        let (new, _) = admitted(admit(&h, "phone").await);
        assert!(old.is_closed());
        assert!(old.cancel_token().is_cancelled());
        assert!(matches!(
            old.job(JobId(1)).await.unwrap().state,
            JobState::Failed { .. }
        ));

        let current = h
            .manager
            .get(&NodeId::new("phone"), ConnectionDirection::Incoming)
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&current, &new));
    }

    #[tokio::test]
    async fn test_close_cancels_each_active_job_once() {
        let h = harness().await;
        let mut events = h.events.subscribe();
        let (connection, _) = admitted(admit(&h, "phone").await);
        h.manager.accept(&NodeId::new("phone"), false).await.unwrap();

        let mut done = TransferJob::new(JobId(1), item("a.mp3"), 0);
        done.mark_ready(Some(10)).unwrap();
        done.start(0).unwrap();
        done.finish(1).unwrap();
        connection
            .insert_jobs(vec![
                done,
                TransferJob::new(JobId(2), item("b.mp3"), 0),
                TransferJob::new(JobId(3), item("c.mp3"), 0),
            ])
            .await;

        let node = NodeId::new("phone");
        h.manager.close(&node, ConnectionDirection::Incoming).await.unwrap();
        // Second close finds nothing; release is a no-op.
        assert!(h.manager.close(&node, ConnectionDirection::Incoming).await.is_err());
        h.manager.release(&connection, "again").await;

        let mut cancelled = 0;
        let mut closed = 0;
        while let Ok(event) = events.try_recv() {
            match event {
                CoreEvent::Transfer(TransferEvent::Failed { message, .. }) => {
                    assert_eq!(message, CANCELLED);
                    cancelled += 1;
                }
                CoreEvent::Connection(ConnectionEvent::Closed { .. }) => closed += 1,
                _ => {}
            }
        }
        assert_eq!(cancelled, 2);
        assert_eq!(closed, 1);
        assert_eq!(connection.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_update_job_rejects_invalid_transition() {
        let h = harness().await;
        let (connection, _) = admitted(admit(&h, "phone").await);
        connection
            .insert_jobs(vec![TransferJob::new(JobId(4), item("a.mp3"), 0)])
            .await;

        let err = connection
            .update_job(JobId(4), |job| job.start(0))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidStateTransition { .. }));
        let err = connection
            .update_job(JobId(99), |job| job.fail("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::JobNotFound { job_id: 99 }));
    }

    #[tokio::test]
    async fn test_remote_index_is_one_shot() {
        let h = harness().await;
        let (connection, _) = admitted(admit(&h, "phone").await);
        assert!(connection.set_remote_index(vec![item("a.mp3")]).await);
        assert!(!connection.set_remote_index(vec![]).await);

        connection
            .mark_item_downloaded(&ItemKey::new("remote", "Music", "a.mp3"))
            .await;
        let index = connection.remote_index().await.unwrap();
        assert_eq!(index.len(), 1);
        assert!(index[0].downloaded);
    }
}
