//! Core service façade and bootstrap.
//!
//! This crate wires the host-provided bridges (transport, filesystem,
//! transcoder, clock) carried by a [`CoreConfig`] into the shared core and
//! exposes the owner's command surface. Desktop apps typically enable the
//! `desktop-shims` feature so the filesystem defaults to the `bridge-desktop`
//! implementation. Without a transcoder every file is served unchanged.
//!
//! Owner-facing state is published as two snapshots, [`NodeModel`] and
//! [`LibraryModel`]. Both are rebuilt whenever core events arrive and can
//! also be read on demand.

pub mod error;
pub mod models;
mod publisher;

pub use error::{CoreError, Result};
pub use models::{ConnectionGroup, LibraryModel, NodeModel, NodeStats};

use bridge_traits::transport::NodeId;
use core_async::sync::{CancellationToken, Mutex};
use core_async::task::TaskTracker;
use core_library::db::{create_pool, DatabaseConfig};
use core_library::repositories::{
    RecentServerRepository, SqliteRecentServerRepository, SqliteTrustStore, TrustStore,
};
use core_library::{ItemKey, Library, LibraryRoot, ScanReport, TrustedNode};
use core_runtime::config::{CoreConfig, TranscodePolicy};
use core_runtime::events::{
    ConnectionDirection, CoreEvent, EventBus, LibraryEvent, Receiver,
};
use core_runtime::snapshot::{SnapshotChannel, SnapshotReceiver};
use core_sync::{JobId, SyncCoordinator};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, instrument, warn};

pub(crate) struct ServiceInner {
    display_name: String,
    library: Arc<Library>,
    trust: Arc<dyn TrustStore>,
    recent_servers: Arc<dyn RecentServerRepository>,
    coordinator: SyncCoordinator,
    events: EventBus,
    node_snapshot: SnapshotChannel<NodeModel>,
    library_snapshot: SnapshotChannel<LibraryModel>,
    /// Held across a whole rebuild so an older read never publishes over a newer one
    refresh_lock: Mutex<()>,
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

/// Primary façade exposed to host applications.
#[derive(Clone)]
pub struct CoreService {
    inner: Arc<ServiceInner>,
}

impl CoreService {
    /// Open the database, recover the transcode cache and start serving.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let config = CoreConfig::builder()
    ///     .database_path(data_dir.join("musync.db"))
    ///     .cache_dir(cache_dir)
    ///     .transport(transport)
    ///     .build()?;
    /// let core = CoreService::start(config).await?;
    /// core.add_library_root("music", Path::new("/home/me/Music")).await?;
    /// ```
    pub async fn start(config: CoreConfig) -> Result<Self> {
        let pool = create_pool(DatabaseConfig::new(&config.database_path)).await?;
        let events = EventBus::new(config.event_buffer_size);
        let local_node_id = config.transport.local_node_id();

        let library = Arc::new(Library::new(
            pool.clone(),
            local_node_id.clone(),
            Arc::clone(&config.file_system),
            Arc::clone(&config.clock),
            config.scan_extensions.clone(),
        ));
        let trust: Arc<dyn TrustStore> = Arc::new(SqliteTrustStore::new(pool.clone()));
        let recent_servers: Arc<dyn RecentServerRepository> =
            Arc::new(SqliteRecentServerRepository::new(pool));

        let coordinator = SyncCoordinator::start(
            &config,
            Arc::clone(&library),
            Arc::clone(&trust),
            Arc::clone(&recent_servers),
            events.clone(),
        )
        .await?;

        let inner = Arc::new(ServiceInner {
            display_name: config.display_name.clone(),
            library,
            trust,
            recent_servers,
            coordinator,
            events,
            node_snapshot: SnapshotChannel::new(NodeModel::empty(
                local_node_id.clone(),
                config.display_name.clone(),
            )),
            library_snapshot: SnapshotChannel::new(LibraryModel::default()),
            refresh_lock: Mutex::new(()),
            tasks: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        });

        publisher::refresh(&inner).await;
        let receiver = inner.events.subscribe();
        inner.tasks.spawn(publisher::run(
            Arc::clone(&inner),
            receiver,
            inner.shutdown.clone(),
        ));

        if inner.coordinator.transcode_policy().await == TranscodePolicy::Always {
            inner.coordinator.prestage_library();
        }

        info!(node_id = %local_node_id.short(), "Core service started");
        Ok(Self { inner })
    }

    pub fn local_node_id(&self) -> &NodeId {
        self.inner.coordinator.local_node_id()
    }

    // ------------------------------------------------------------------------
    // Connections
    // ------------------------------------------------------------------------

    /// Connect to `node_id` and wait for its owner's decision.
    ///
    /// # Errors
    ///
    /// `AdmissionDenied` if the remote owner refuses.
    #[instrument(skip(self), fields(node_id = %node_id.short()))]
    pub async fn connect(&self, node_id: &NodeId) -> Result<()> {
        let connection = self.inner.coordinator.connect(node_id).await?;
        connection.wait_admitted().await?;
        Ok(())
    }

    pub async fn accept_connection(&self, node_id: &NodeId) -> Result<()> {
        Ok(self.inner.coordinator.accept(node_id, false).await?)
    }

    /// Accept and remember the node so its future connections skip the
    /// owner.
    pub async fn accept_connection_and_trust(&self, node_id: &NodeId) -> Result<()> {
        Ok(self.inner.coordinator.accept(node_id, true).await?)
    }

    pub async fn deny_connection(&self, node_id: &NodeId) -> Result<()> {
        Ok(self.inner.coordinator.deny(node_id).await?)
    }

    pub async fn close_connection(
        &self,
        node_id: &NodeId,
        direction: ConnectionDirection,
    ) -> Result<()> {
        Ok(self.inner.coordinator.close(node_id, direction).await?)
    }

    // ------------------------------------------------------------------------
    // Transfers
    // ------------------------------------------------------------------------

    /// Download every file of `node_id`'s index not downloaded before into
    /// `destination/<root>/<path>`.
    pub async fn download_all(&self, node_id: &NodeId, destination: &Path) -> Result<Vec<JobId>> {
        Ok(self
            .inner
            .coordinator
            .download_all(node_id, destination)
            .await?)
    }

    /// Download exactly the selected files.
    ///
    /// # Errors
    ///
    /// `IndexInvalidSelection` if any key is missing from the index; no job
    /// is created in that case.
    pub async fn download_partial(
        &self,
        node_id: &NodeId,
        keys: Vec<ItemKey>,
        destination: &Path,
    ) -> Result<Vec<JobId>> {
        Ok(self
            .inner
            .coordinator
            .download_partial(node_id, keys, destination)
            .await?)
    }

    // ------------------------------------------------------------------------
    // Library
    // ------------------------------------------------------------------------

    /// Share a directory under `name` and index it.
    #[instrument(skip(self, path))]
    pub async fn add_library_root(&self, name: &str, path: &Path) -> Result<LibraryRoot> {
        let root = self.inner.library.add_root(name, path).await?;
        self.emit(LibraryEvent::RootAdded {
            name: root.name.clone(),
        });
        self.rescan_library().await?;

        let roots = self.inner.library.roots().await?;
        Ok(roots
            .into_iter()
            .find(|r| r.name == root.name)
            .unwrap_or(root))
    }

    pub async fn remove_library_root(&self, name: &str) -> Result<()> {
        let root = self.inner.library.remove_root(name).await?;
        self.emit(LibraryEvent::RootRemoved { name: root.name });
        Ok(())
    }

    /// Re-index every root. Roots that cannot be read are reported and keep
    /// their previous files.
    pub async fn rescan_library(&self) -> Result<ScanReport> {
        let roots = self.inner.library.roots().await?.len() as u64;
        self.emit(LibraryEvent::ScanStarted { roots });

        let report = self.inner.library.rescan().await?;
        for error in &report.errors {
            self.emit(LibraryEvent::ScanError {
                root: error.root.clone(),
                message: error.message.clone(),
            });
        }
        self.emit(LibraryEvent::ScanCompleted {
            roots: report.roots as u64,
            files: report.files as u64,
            duration_ms: report.duration_ms,
        });

        if self.inner.coordinator.transcode_policy().await == TranscodePolicy::Always {
            self.inner.coordinator.prestage_library();
        }
        Ok(report)
    }

    pub async fn set_transcode_policy(&self, policy: TranscodePolicy) {
        self.inner.coordinator.set_transcode_policy(policy).await;
    }

    pub async fn trusted_nodes(&self) -> Result<Vec<TrustedNode>> {
        Ok(self.inner.trust.list().await?)
    }

    /// Forget a trusted node. Its next connection waits for the owner again.
    pub async fn untrust_node(&self, node_id: &NodeId) -> Result<bool> {
        let removed = self.inner.trust.untrust(node_id).await?;
        if removed {
            self.emit(LibraryEvent::TrustChanged {
                node_id: node_id.to_string(),
                trusted: false,
            });
        }
        Ok(removed)
    }

    /// Forget every root and indexed file. Trust and recent servers are kept.
    pub async fn reset_database(&self) -> Result<()> {
        warn!("Resetting library database");
        self.inner.library.reset().await?;
        self.emit(LibraryEvent::DatabaseReset);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // State
    // ------------------------------------------------------------------------

    /// Current node state, read fresh.
    pub async fn node_model(&self) -> NodeModel {
        publisher::refresh(&self.inner).await;
        (*self.inner.node_snapshot.latest()).clone()
    }

    /// Current library state, read fresh.
    pub async fn library_model(&self) -> LibraryModel {
        publisher::refresh(&self.inner).await;
        (*self.inner.library_snapshot.latest()).clone()
    }

    pub fn subscribe_node(&self) -> SnapshotReceiver<NodeModel> {
        self.inner.node_snapshot.subscribe()
    }

    pub fn subscribe_library(&self) -> SnapshotReceiver<LibraryModel> {
        self.inner.library_snapshot.subscribe()
    }

    /// Raw core events.
    pub fn subscribe_events(&self) -> Receiver<CoreEvent> {
        self.inner.events.subscribe()
    }

    /// Close every connection, stop the transcoder and the publisher.
    pub async fn shutdown(&self) {
        self.inner.coordinator.shutdown().await;
        self.inner.shutdown.cancel();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        info!("Core service stopped");
    }

    fn emit(&self, event: LibraryEvent) {
        let _ = self.inner.events.emit(CoreEvent::Library(event));
    }
}
