//! State shared by the coordinator and every session task.

use crate::admission::AdmissionManager;
use crate::job::JobIdAllocator;
use crate::transcode::TranscodeGate;
use bridge_traits::storage::FileSystemAccess;
use bridge_traits::time::Clock;
use bridge_traits::transport::{NodeId, Transport};
use core_async::sync::CancellationToken;
use core_async::task::TaskTracker;
use core_library::repositories::RecentServerRepository;
use core_library::Library;
use core_runtime::config::TransferConfig;
use core_runtime::events::{CoreEvent, EventBus};
use std::sync::Arc;

pub(crate) struct SyncContext {
    pub local_node_id: NodeId,
    pub display_name: String,
    pub transport: Arc<dyn Transport>,
    pub file_system: Arc<dyn FileSystemAccess>,
    pub clock: Arc<dyn Clock>,
    pub library: Arc<Library>,
    pub admission: AdmissionManager,
    pub gate: Arc<TranscodeGate>,
    pub recent_servers: Arc<dyn RecentServerRepository>,
    pub events: EventBus,
    pub job_ids: JobIdAllocator,
    pub transfer: TransferConfig,
    /// Session tasks (accept loop, per-connection control loops)
    pub tasks: TaskTracker,
    pub shutdown: CancellationToken,
}

impl SyncContext {
    pub fn emit(&self, event: CoreEvent) {
        let _ = self.events.emit(event);
    }

    pub fn now(&self) -> i64 {
        self.clock.unix_timestamp()
    }
}
