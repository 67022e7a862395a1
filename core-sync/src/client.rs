//! Downloading side of a sync session.
//!
//! Dials a remote node, waits for its owner's verdict, keeps the received
//! index and turns a selection into transfer jobs. Each job that the server
//! reports `Ready` is fetched over its own stream into a staged file which
//! only appears at its destination once every byte has arrived.

use crate::admission::{Admission, Connection, ConnectionState};
use crate::context::SyncContext;
use crate::job::{JobId, TransferJob, CANCELLED};
use crate::protocol::{
    control_channel, read_frame, write_frame, ClientMessage, ControlReader, JobRequest,
    ServerMessage, StreamRequest, StreamResponse, PROTOCOL_VERSION,
};
use crate::server::HANDSHAKE_TIMEOUT;
use crate::transfer::{copy_counted, ProgressThrottle};
use crate::{Result, SyncError};
use bridge_traits::transport::{BiStream, NodeId, PeerSession};
use core_async::io::AsyncReadExt;
use core_async::time::timeout;
use core_library::index::resolve_relative;
use core_library::{plan_partial, reconcile, FileSize, IndexItem, ItemKey};
use core_runtime::events::{ConnectionDirection, ConnectionEvent, CoreEvent};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Which part of a remote index to download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// Everything not already downloaded from that node
    All,
    /// Exactly these items, whether or not they were downloaded before
    Keys(Vec<ItemKey>),
}

/// Open (or reuse) the outgoing connection to `node_id`.
///
/// Returns once the identify exchange is done; the connection is still
/// pending until the remote owner decides.
#[instrument(skip(ctx), fields(node_id = %node_id.short()))]
pub(crate) async fn connect(ctx: &Arc<SyncContext>, node_id: &NodeId) -> Result<Arc<Connection>> {
    if let Some(existing) = ctx
        .admission
        .get(node_id, ConnectionDirection::Outgoing)
        .await
    {
        debug!("Reusing outgoing connection");
        return Ok(existing);
    }

    let session = ctx.transport.connect(node_id).await.map_err(|e| {
        report_failure(ctx, node_id, &e.to_string());
        SyncError::from(e)
    })?;

    let (control, reader, name) = match identify(ctx, &session).await {
        Ok(handshake) => handshake,
        Err(e) => {
            session.close("handshake failed");
            report_failure(ctx, node_id, &e.to_string());
            return Err(e);
        }
    };

    let admission = ctx
        .admission
        .register_outgoing(
            node_id.clone(),
            name,
            session.connection_info(),
            Arc::clone(&session),
            control,
        )
        .await;

    match admission {
        Admission::Collapsed(existing) => Ok(existing),
        Admission::Admitted { connection, .. } => {
            info!(name = %connection.name(), "Connected, awaiting admission");
            let (task_ctx, task_connection) = (Arc::clone(ctx), Arc::clone(&connection));
            ctx.tasks
                .spawn(async move { run_outgoing(task_ctx, task_connection, reader).await });
            Ok(connection)
        }
    }
}

fn report_failure(ctx: &SyncContext, node_id: &NodeId, message: &str) {
    warn!(node_id = %node_id.short(), error = %message, "Outgoing connection failed");
    ctx.emit(CoreEvent::Connection(ConnectionEvent::Failed {
        node_id: node_id.to_string(),
        direction: ConnectionDirection::Outgoing,
        message: message.to_string(),
    }));
}

async fn identify(
    ctx: &SyncContext,
    session: &Arc<dyn PeerSession>,
) -> Result<(crate::protocol::ControlWriter, ControlReader, String)> {
    let stream = session.open_bi().await?;
    let (control, mut reader) = control_channel(stream);

    control
        .send(&ClientMessage::Identify {
            name: ctx.display_name.clone(),
            version: PROTOCOL_VERSION,
        })
        .await?;

    let reply = timeout(HANDSHAKE_TIMEOUT, reader.expect::<ServerMessage>())
        .await
        .map_err(|_| SyncError::Protocol("identify timed out".to_string()))??;
    match reply {
        ServerMessage::Identify { name, version } if version == PROTOCOL_VERSION => {
            Ok((control, reader, name))
        }
        ServerMessage::Identify { version, .. } => Err(SyncError::Protocol(format!(
            "unsupported protocol version {}",
            version
        ))),
        _ => Err(SyncError::Protocol("expected identify".to_string())),
    }
}

async fn run_outgoing(ctx: Arc<SyncContext>, connection: Arc<Connection>, mut reader: ControlReader) {
    let outcome = receive_messages(&ctx, &connection, &mut reader).await;

    let reason = match &outcome {
        Ok(()) => "session ended".to_string(),
        Err(e) => {
            if connection.state() == ConnectionState::Pending && !connection.is_closed() {
                report_failure(&ctx, connection.node_id(), &e.to_string());
            } else if !e.is_session_closed() {
                warn!(node_id = %connection.node_id().short(), error = %e, "Outgoing session failed");
            }
            e.to_string()
        }
    };
    ctx.admission.release(&connection, &reason).await;
}

async fn receive_messages(
    ctx: &Arc<SyncContext>,
    connection: &Arc<Connection>,
    reader: &mut ControlReader,
) -> Result<()> {
    loop {
        let message = tokio::select! {
            biased;
            message = reader.recv::<ServerMessage>() => message?,
            _ = connection.cancel_token().cancelled() => return Ok(()),
            _ = ctx.shutdown.cancelled() => return Ok(()),
            _ = connection.session().closed() => {
                return Err(SyncError::SessionClosed("remote node hung up".to_string()))
            }
        };
        let Some(message) = message else {
            return Err(SyncError::SessionClosed("control stream ended".to_string()));
        };

        match message {
            ServerMessage::Accepted => {
                ctx.admission.remote_verdict(connection, true).await?;
                if let Err(e) = ctx
                    .recent_servers
                    .touch(connection.node_id(), ctx.now())
                    .await
                {
                    warn!(error = %e, "Failed to remember server");
                }
            }
            ServerMessage::Denied => {
                ctx.admission.remote_verdict(connection, false).await?;
                return Ok(());
            }
            ServerMessage::Index { items } => {
                receive_index(ctx, connection, items).await?;
            }
            ServerMessage::Transcoding { job_id } => {
                log_job_error(connection.update_job(job_id, |job| job.start_transcoding()).await);
            }
            ServerMessage::Ready {
                job_id,
                size,
                extension,
            } => {
                let ready = connection
                    .update_job(job_id, |job| {
                        job.mark_ready(Some(size))?;
                        if let (Some(extension), Some(path)) = (&extension, job.local_path.as_mut()) {
                            path.set_extension(extension);
                        }
                        Ok(())
                    })
                    .await;
                if ready.is_ok() {
                    let (task_ctx, task_connection) = (Arc::clone(ctx), Arc::clone(connection));
                    connection
                        .tasks()
                        .spawn(async move { download(task_ctx, task_connection, job_id).await });
                }
                log_job_error(ready);
            }
            ServerMessage::JobFailed { job_id, cause } => {
                log_job_error(connection.update_job(job_id, |job| job.fail(cause.clone())).await);
            }
            ServerMessage::Identify { .. } => {
                return Err(SyncError::Protocol("identify sent twice".to_string()));
            }
        }
    }
}

fn log_job_error(result: Result<TransferJob>) {
    if let Err(e) = result {
        debug!(error = %e, "Ignoring job update");
    }
}

async fn receive_index(
    ctx: &SyncContext,
    connection: &Connection,
    mut items: Vec<IndexItem>,
) -> Result<()> {
    if connection.state() != ConnectionState::Accepted {
        return Err(SyncError::Protocol("index sent before admission".to_string()));
    }

    // Identity comes from the session, never from what the peer claims
    for item in &mut items {
        item.node_id = connection.node_id().clone();
    }
    let downloaded = ctx.library.downloaded_keys(connection.node_id()).await?;
    core_library::mark_downloaded(&mut items, &downloaded);

    let count = items.len();
    if connection.set_remote_index(items).await {
        info!(node_id = %connection.node_id().short(), items = count, "Index received");
        ctx.emit(CoreEvent::Connection(ConnectionEvent::IndexReceived {
            node_id: connection.node_id().to_string(),
            items: count as u64,
        }));
    } else {
        warn!(node_id = %connection.node_id().short(), "Ignoring repeated index");
    }
    Ok(())
}

/// Create jobs for `selection` of the remote index and ask the server for
/// them. Files land at `destination/<root>/<path>`.
#[instrument(skip(ctx, selection), fields(node_id = %node_id.short()))]
pub(crate) async fn request_downloads(
    ctx: &SyncContext,
    node_id: &NodeId,
    selection: Selection,
    destination: &Path,
) -> Result<Vec<JobId>> {
    let connection = ctx
        .admission
        .get(node_id, ConnectionDirection::Outgoing)
        .await
        .ok_or_else(|| SyncError::ConnectionNotFound {
            node_id: node_id.to_string(),
            direction: ConnectionDirection::Outgoing.as_str().to_string(),
        })?;

    let state = connection.state();
    if state != ConnectionState::Accepted {
        return Err(SyncError::InvalidConnectionState {
            node_id: node_id.to_string(),
            state: state.as_str().to_string(),
            expected: ConnectionState::Accepted.as_str().to_string(),
        });
    }

    let index = connection
        .remote_index()
        .await
        .ok_or_else(|| SyncError::NoRemoteIndex {
            node_id: node_id.to_string(),
        })?;

    let plan = match selection {
        Selection::All => {
            let downloaded = ctx.library.downloaded_keys(node_id).await?;
            reconcile(&index, &downloaded)
        }
        Selection::Keys(keys) => plan_partial(&index, &keys)?,
    };

    let active = connection.active_item_keys().await;
    let now = ctx.now();
    let jobs: Vec<TransferJob> = plan
        .into_iter()
        .filter(|item| !active.contains(&item.key()))
        .map(|item| {
            let target = resolve_relative(&destination.join(&item.root), &item.path);
            TransferJob::new(ctx.job_ids.next(), item, now).with_local_path(target)
        })
        .collect();

    if jobs.is_empty() {
        debug!("Nothing to download");
        return Ok(Vec::new());
    }

    let requests: Vec<JobRequest> = jobs
        .iter()
        .map(|job| JobRequest {
            job_id: job.id,
            root: job.item.root.clone(),
            path: job.item.path.clone(),
        })
        .collect();
    let ids: Vec<JobId> = jobs.iter().map(|job| job.id).collect();

    info!(jobs = ids.len(), "Requesting downloads");
    connection.insert_jobs(jobs).await;
    connection
        .control()
        .send(&ClientMessage::Download { jobs: requests })
        .await?;
    Ok(ids)
}

/// Fetch one ready job. Any error fails the job.
async fn download(ctx: Arc<SyncContext>, connection: Arc<Connection>, id: JobId) {
    if let Err(e) = fetch(&ctx, &connection, id).await {
        if !e.is_session_closed() {
            warn!(job_id = %id, error = %e, "Download failed");
        }
        let _ = connection.update_job(id, |job| job.fail(e.to_string())).await;
    }
}

async fn fetch(ctx: &SyncContext, connection: &Connection, id: JobId) -> Result<()> {
    let cancel = connection.cancel_token();
    let transfers = connection.transfers();
    let _permit = tokio::select! {
        permit = transfers.acquire_owned() => {
            permit.map_err(|_| SyncError::SessionClosed(CANCELLED.to_string()))?
        }
        _ = cancel.cancelled() => return Err(SyncError::SessionClosed(CANCELLED.to_string())),
    };

    let now = ctx.now();
    let job = connection.update_job(id, |job| job.start(now)).await?;
    let destination = job
        .local_path
        .clone()
        .ok_or_else(|| SyncError::TransferFailed("no destination".to_string()))?;
    let size = job
        .size
        .ok_or_else(|| SyncError::TransferFailed("size not known".to_string()))?;

    let stream = tokio::select! {
        stream = connection.session().open_bi() => stream?,
        _ = cancel.cancelled() => return Err(SyncError::SessionClosed(CANCELLED.to_string())),
    };
    let BiStream { mut send, mut recv } = stream;
    write_frame(&mut send, &StreamRequest { job_id: id }).await?;

    let response: StreamResponse = tokio::select! {
        response = read_frame(&mut recv) => response?,
        _ = cancel.cancelled() => return Err(SyncError::SessionClosed(CANCELLED.to_string())),
    };
    match response {
        StreamResponse::Accept { size: offered } if offered == size => {}
        StreamResponse::Accept { size: offered } => {
            return Err(SyncError::TransferFailed(format!(
                "server offered {} bytes, expected {}",
                offered, size
            )));
        }
        StreamResponse::Reject { cause } => return Err(SyncError::TransferFailed(cause)),
    }

    let mut staged = ctx.file_system.create_staged(&destination).await?;
    let mut limited = (&mut recv).take(size);
    let mut throttle = ProgressThrottle::new(ctx.transfer.progress_interval_ms);
    let copied = copy_counted(
        &mut limited,
        staged.as_mut(),
        job.bytes(),
        cancel,
        &mut throttle,
        |total| connection.report_progress(id, total, Some(size)),
    )
    .await;

    match copied {
        Ok(copied) if copied == size => {}
        Ok(copied) => {
            let _ = staged.discard().await;
            return Err(SyncError::TransferFailed(format!(
                "stream ended after {} of {} bytes",
                copied, size
            )));
        }
        Err(e) => {
            let _ = staged.discard().await;
            return Err(e);
        }
    }

    let path = staged.commit().await?;
    let now = ctx.now();
    if let Err(e) = connection.update_job(id, |job| job.finish(now)).await {
        // Closed while committing; a cancelled job leaves no file behind
        let _ = ctx.file_system.delete_file(&path).await;
        return Err(e);
    }

    let mut item = job.item.clone();
    item.size = FileSize::Actual(size);
    if let Err(e) = ctx.library.record_download(&item, &path).await {
        warn!(job_id = %id, error = %e, "Failed to record download");
    }
    connection.mark_item_downloaded(&item.key()).await;
    debug!(job_id = %id, path = ?path, "Download complete");
    Ok(())
}
