//! Coalescing snapshot publisher.
//!
//! Every burst of core events becomes one rebuild of the owner-facing models.
//! Events queued while a rebuild runs are folded into the next one, so a fast
//! transfer produces a handful of snapshots rather than one per event.

use crate::models::{LibraryModel, NodeModel};
use crate::ServiceInner;
use core_async::sync::broadcast::error::TryRecvError;
use core_async::sync::CancellationToken;
use core_runtime::events::{CoreEvent, EventSeverity, Receiver, RecvError};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub(crate) async fn run(
    inner: Arc<ServiceInner>,
    mut events: Receiver<CoreEvent>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            received = events.recv() => match received {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => debug!(skipped, "Snapshot publisher lagged"),
                Err(RecvError::Closed) => break,
            },
        }

        loop {
            match events.try_recv() {
                Ok(event) => log_event(&event),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }

        refresh(&inner).await;
    }
    debug!("Snapshot publisher stopped");
}

fn log_event(event: &CoreEvent) {
    match event.severity() {
        EventSeverity::Error => error!(?event, "{}", event.description()),
        EventSeverity::Warning => warn!(?event, "{}", event.description()),
        EventSeverity::Info => info!(?event, "{}", event.description()),
        EventSeverity::Debug => debug!(?event, "{}", event.description()),
    }
}

/// Rebuild both models and publish the ones that changed.
///
/// Rebuilds are serialized: the publisher task and the direct getters may
/// race, and a rebuild that read state first must not publish last.
pub(crate) async fn refresh(inner: &ServiceInner) {
    let _guard = inner.refresh_lock.lock().await;

    let node = NodeModel::build(
        inner.coordinator.local_node_id().clone(),
        inner.display_name.clone(),
        inner.coordinator.connections().await,
        inner.recent_servers.list().await.unwrap_or_else(|e| {
            warn!(error = %e, "Could not list recent servers");
            Vec::new()
        }),
        inner.trust.list().await.unwrap_or_else(|e| {
            warn!(error = %e, "Could not list trusted nodes");
            Vec::new()
        }),
    );
    inner.node_snapshot.publish(node);

    match inner.library.roots().await {
        Ok(roots) => {
            let gate = inner.coordinator.gate();
            let library = LibraryModel::build(roots, gate.policy().await, gate.counters().await);
            inner.library_snapshot.publish(library);
        }
        Err(e) => warn!(error = %e, "Could not list library roots"),
    }
}

