//! # Sync Coordinator
//!
//! Owns the peer side of the core: the accept loop for incoming sessions,
//! outgoing connections, admission decisions, download requests and the
//! transcode gate.
//!
//! ## Workflow
//!
//! ### Serving
//! 1. Accept a session from the transport
//! 2. Exchange identities and register the connection with admission
//! 3. Wait for the owner (trusted nodes skip this)
//! 4. Send the local index, then serve requested files, transcoding first
//!    where the gate says so
//!
//! ### Downloading
//! 1. Dial the remote node and exchange identities
//! 2. Wait for the remote owner's verdict and the index
//! 3. Plan jobs from the index (everything new, or a chosen subset)
//! 4. Fetch each file as soon as the server reports it ready
//!
//! ## Usage
//!
//! ```rust,ignore
//! let coordinator = SyncCoordinator::start(&config, library, trust, recent, events).await?;
//!
//! let connection = coordinator.connect(&server_id).await?;
//! connection.wait_admitted().await?;
//! let jobs = coordinator.download_all(&server_id, &destination).await?;
//! ```

use crate::admission::{AdmissionManager, Connection, ConnectionView};
use crate::client::{self, Selection};
use crate::context::SyncContext;
use crate::job::{JobId, JobIdAllocator};
use crate::server;
use crate::transcode::TranscodeGate;
use crate::Result;
use bridge_traits::transport::NodeId;
use core_async::sync::CancellationToken;
use core_async::task::TaskTracker;
use core_async::time::{sleep, Duration};
use core_library::repositories::{RecentServerRepository, TrustStore};
use core_library::{ItemKey, Library};
use core_runtime::config::{CoreConfig, TranscodePolicy};
use core_runtime::events::{ConnectionDirection, EventBus};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Pause after a transient accept error.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

pub struct SyncCoordinator {
    ctx: Arc<SyncContext>,
}

impl SyncCoordinator {
    /// Build the coordinator and start accepting sessions.
    ///
    /// Transcoded artifacts left by an earlier run are recovered before the
    /// first session is served.
    pub async fn start(
        config: &CoreConfig,
        library: Arc<Library>,
        trust: Arc<dyn TrustStore>,
        recent_servers: Arc<dyn RecentServerRepository>,
        events: EventBus,
    ) -> Result<Self> {
        let gate = TranscodeGate::start(
            &config.transcode,
            config.transcode_dir(),
            config.transcoder.clone(),
            Arc::clone(&config.file_system),
            events.clone(),
        );
        let recovered = gate.recover().await?;
        if recovered > 0 {
            info!(recovered, "Recovered transcoded artifacts");
        }

        let admission = AdmissionManager::new(
            trust,
            Arc::clone(&config.clock),
            events.clone(),
            config.transfer.max_concurrent_transfers,
        );

        let ctx = Arc::new(SyncContext {
            local_node_id: config.transport.local_node_id(),
            display_name: config.display_name.clone(),
            transport: Arc::clone(&config.transport),
            file_system: Arc::clone(&config.file_system),
            clock: Arc::clone(&config.clock),
            library,
            admission,
            gate,
            recent_servers,
            events,
            job_ids: JobIdAllocator::new(),
            transfer: config.transfer.clone(),
            tasks: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        });

        let accept_ctx = Arc::clone(&ctx);
        ctx.tasks.spawn(async move { accept_loop(accept_ctx).await });

        info!(node_id = %ctx.local_node_id.short(), "Sync coordinator started");
        Ok(Self { ctx })
    }

    pub fn local_node_id(&self) -> &NodeId {
        &self.ctx.local_node_id
    }

    pub fn gate(&self) -> &Arc<TranscodeGate> {
        &self.ctx.gate
    }

    /// Dial `node_id`. The returned connection is pending until the remote
    /// owner decides; see [`Connection::wait_admitted`].
    pub async fn connect(&self, node_id: &NodeId) -> Result<Arc<Connection>> {
        client::connect(&self.ctx, node_id).await
    }

    /// Admit a pending incoming connection.
    pub async fn accept(&self, node_id: &NodeId, trust: bool) -> Result<()> {
        self.ctx.admission.accept(node_id, trust).await
    }

    /// Refuse a pending incoming connection.
    pub async fn deny(&self, node_id: &NodeId) -> Result<()> {
        self.ctx.admission.deny(node_id).await
    }

    /// Close a connection. Its unfinished jobs fail as cancelled.
    pub async fn close(&self, node_id: &NodeId, direction: ConnectionDirection) -> Result<()> {
        self.ctx.admission.close(node_id, direction).await
    }

    /// Download everything from `node_id` not downloaded before.
    pub async fn download_all(&self, node_id: &NodeId, destination: &Path) -> Result<Vec<JobId>> {
        client::request_downloads(&self.ctx, node_id, Selection::All, destination).await
    }

    /// Download exactly `keys` from `node_id`.
    pub async fn download_partial(
        &self,
        node_id: &NodeId,
        keys: Vec<ItemKey>,
        destination: &Path,
    ) -> Result<Vec<JobId>> {
        client::request_downloads(&self.ctx, node_id, Selection::Keys(keys), destination).await
    }

    pub async fn connection(
        &self,
        node_id: &NodeId,
        direction: ConnectionDirection,
    ) -> Option<Arc<Connection>> {
        self.ctx.admission.get(node_id, direction).await
    }

    /// Views of every live connection, ordered by direction then node id.
    pub async fn connections(&self) -> Vec<ConnectionView> {
        let mut views = Vec::new();
        for connection in self.ctx.admission.list().await {
            views.push(connection.view().await);
        }
        views
    }

    pub async fn transcode_policy(&self) -> TranscodePolicy {
        self.ctx.gate.policy().await
    }

    /// Switch the transcode policy. Switching to `Always` converts the
    /// library in the background.
    #[instrument(skip(self))]
    pub async fn set_transcode_policy(&self, policy: TranscodePolicy) {
        self.ctx.gate.set_policy(policy).await;
        if policy == TranscodePolicy::Always {
            self.prestage_library();
        }
    }

    /// Queue every local file that needs converting. Runs in the background.
    pub fn prestage_library(&self) {
        let ctx = Arc::clone(&self.ctx);
        self.ctx.tasks.spawn(async move {
            match ctx.library.local_files().await {
                Ok(files) => {
                    let queued = ctx.gate.prestage(&files).await;
                    debug!(queued, "Prestaged library");
                }
                Err(e) => warn!(error = %e, "Could not list files to prestage"),
            }
        });
    }

    /// Stop accepting, close every connection and stop the transcoder.
    pub async fn shutdown(&self) {
        info!("Shutting down sync coordinator");
        self.ctx.shutdown.cancel();
        self.ctx.admission.shutdown().await;
        self.ctx.tasks.close();
        self.ctx.tasks.wait().await;
        self.ctx.gate.shutdown().await;
        if let Err(e) = self.ctx.transport.shutdown().await {
            warn!(error = %e, "Transport shutdown failed");
        }
    }
}

async fn accept_loop(ctx: Arc<SyncContext>) {
    loop {
        let session = tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            session = ctx.transport.accept() => session,
        };

        match session {
            Ok(session) => {
                debug!(node_id = %session.remote_node_id().short(), "Incoming session");
                let session_ctx = Arc::clone(&ctx);
                ctx.tasks
                    .spawn(async move { server::serve_incoming(session_ctx, session).await });
            }
            Err(e) if e.is_connection_closed() => {
                debug!("Transport closed, accept loop stopping");
                break;
            }
            Err(e) => {
                warn!(error = %e, "Accept failed");
                sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }
}
