//! Serving side of a sync session.
//!
//! Answers the identify exchange, holds the connection until the owner
//! decides, pushes the local index once and then serves every requested file
//! over its own stream. A file is only streamed once its job is `Ready`,
//! which for converted files means the transcode gate has produced the
//! artifact.

use crate::admission::{Admission, Connection, ConnectionState};
use crate::context::SyncContext;
use crate::job::{JobId, TransferJob};
use crate::protocol::{
    control_channel, read_frame, write_frame, ClientMessage, ControlReader, JobRequest,
    ServerMessage, StreamRequest, StreamResponse, PROTOCOL_VERSION,
};
use crate::transcode::GateDecision;
use crate::transfer::{copy_counted, ProgressThrottle};
use crate::{Result, SyncError};
use bridge_traits::transport::{BiStream, ByteWriter, PeerSession};
use core_async::io::{AsyncReadExt, AsyncWriteExt};
use core_async::time::{timeout, Duration};
use core_library::IndexItem;
use core_runtime::events::{ConnectionDirection, ConnectionEvent, CoreEvent};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

pub(crate) const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// How long to wait for the peer to hang up after a refusal.
pub(crate) const LINGER_TIMEOUT: Duration = Duration::from_secs(5);

/// Run one incoming session from the identify exchange to teardown.
#[instrument(skip_all, fields(node_id = %session.remote_node_id().short()))]
pub(crate) async fn serve_incoming(ctx: Arc<SyncContext>, session: Arc<dyn PeerSession>) {
    let node_id = session.remote_node_id().clone();

    let (connection, reader) = match handshake(&ctx, &session).await {
        Ok(Some(admitted)) => admitted,
        Ok(None) => return,
        Err(e) => {
            warn!(error = %e, "Incoming session failed before admission");
            session.close("handshake failed");
            ctx.emit(CoreEvent::Connection(ConnectionEvent::Failed {
                node_id: node_id.to_string(),
                direction: ConnectionDirection::Incoming,
                message: e.to_string(),
            }));
            return;
        }
    };

    let outcome = run_admitted(&ctx, &connection, reader).await;
    let reason = match &outcome {
        Ok(()) => "session ended".to_string(),
        Err(e) => {
            if connection.state() == ConnectionState::Pending && !connection.is_closed() {
                ctx.emit(CoreEvent::Connection(ConnectionEvent::Failed {
                    node_id: node_id.to_string(),
                    direction: ConnectionDirection::Incoming,
                    message: e.to_string(),
                }));
            }
            if !e.is_session_closed() {
                warn!(error = %e, "Incoming session failed");
            }
            e.to_string()
        }
    };
    ctx.admission.release(&connection, &reason).await;
}

async fn handshake(
    ctx: &Arc<SyncContext>,
    session: &Arc<dyn PeerSession>,
) -> Result<Option<(Arc<Connection>, ControlReader)>> {
    let stream = tokio::select! {
        stream = timeout(HANDSHAKE_TIMEOUT, session.accept_bi()) => stream
            .map_err(|_| SyncError::Protocol("no control stream opened".to_string()))??,
        _ = ctx.shutdown.cancelled() => return Err(shutting_down()),
    };
    let (writer, mut reader) = control_channel(stream);

    let hello = tokio::select! {
        hello = timeout(HANDSHAKE_TIMEOUT, reader.expect::<ClientMessage>()) => hello
            .map_err(|_| SyncError::Protocol("identify timed out".to_string()))??,
        _ = ctx.shutdown.cancelled() => return Err(shutting_down()),
    };
    let ClientMessage::Identify { name, version } = hello else {
        return Err(SyncError::Protocol("expected identify".to_string()));
    };
    if version != PROTOCOL_VERSION {
        return Err(SyncError::Protocol(format!(
            "unsupported protocol version {}",
            version
        )));
    }

    writer
        .send(&ServerMessage::Identify {
            name: ctx.display_name.clone(),
            version: PROTOCOL_VERSION,
        })
        .await?;

    let admission = ctx
        .admission
        .on_incoming(
            session.remote_node_id().clone(),
            name,
            session.connection_info(),
            Arc::clone(session),
            writer,
        )
        .await?;

    match admission {
        Admission::Admitted { connection, .. } => Ok(Some((connection, reader))),
        Admission::Collapsed(_) => Ok(None),
    }
}

async fn run_admitted(
    ctx: &Arc<SyncContext>,
    connection: &Arc<Connection>,
    mut reader: ControlReader,
) -> Result<()> {
    let verdict = tokio::select! {
        state = connection.wait_verdict() => state,
        _ = connection.cancel_token().cancelled() => return Ok(()),
        _ = ctx.shutdown.cancelled() => return Ok(()),
        _ = connection.session().closed() => {
            return Err(SyncError::SessionClosed("peer left before admission".to_string()))
        }
    };

    match verdict {
        ConnectionState::Accepted => {}
        ConnectionState::Denied => {
            connection.control().send(&ServerMessage::Denied).await?;
            let _ = timeout(LINGER_TIMEOUT, connection.session().closed()).await;
            return Ok(());
        }
        _ => return Ok(()),
    }

    connection.control().send(&ServerMessage::Accepted).await?;
    let items = advertised_index(ctx).await?;
    info!(items = items.len(), "Sending index");
    connection
        .control()
        .send(&ServerMessage::Index { items })
        .await?;

    let (streams_ctx, streams_connection) = (Arc::clone(ctx), Arc::clone(connection));
    connection
        .tasks()
        .spawn(async move { accept_streams(streams_ctx, streams_connection).await });

    loop {
        let message = tokio::select! {
            biased;
            _ = connection.cancel_token().cancelled() => return Ok(()),
            _ = ctx.shutdown.cancelled() => return Ok(()),
            message = reader.recv::<ClientMessage>() => message?,
            _ = connection.session().closed() => return Ok(()),
        };

        match message {
            None => return Ok(()),
            Some(ClientMessage::Download { jobs }) => {
                handle_download(ctx, connection, jobs).await?;
            }
            Some(ClientMessage::Identify { .. }) => {
                return Err(SyncError::Protocol("identify sent twice".to_string()));
            }
        }
    }
}

fn shutting_down() -> SyncError {
    SyncError::SessionClosed("shutting down".to_string())
}

/// The local index with sizes as this node will actually send them.
async fn advertised_index(ctx: &SyncContext) -> Result<Vec<IndexItem>> {
    let mut items = ctx.library.local_index().await?;
    for item in &mut items {
        item.size = ctx.gate.advertised_size(item).await;
    }
    Ok(items)
}

async fn handle_download(
    ctx: &Arc<SyncContext>,
    connection: &Arc<Connection>,
    requests: Vec<JobRequest>,
) -> Result<()> {
    let now = ctx.now();
    let mut jobs = Vec::new();

    for request in requests {
        if connection.has_job(request.job_id).await {
            warn!(job_id = %request.job_id, "Ignoring repeated job id");
            continue;
        }
        match ctx.library.local_file(&request.root, &request.path).await? {
            Some(record) => {
                let source = PathBuf::from(&record.local_path);
                jobs.push(
                    TransferJob::new(request.job_id, record.to_index_item(), now)
                        .with_local_path(source),
                );
            }
            None => {
                connection
                    .control()
                    .send(&ServerMessage::JobFailed {
                        job_id: request.job_id,
                        cause: format!("{}/{} is not shared", request.root, request.path),
                    })
                    .await?;
            }
        }
    }

    if jobs.is_empty() {
        return Ok(());
    }

    let planned: Vec<_> = jobs
        .iter()
        .map(|job| (job.id, job.item.clone(), job.local_path.clone()))
        .collect();
    debug!(jobs = planned.len(), "Download requested");
    connection.insert_jobs(jobs).await;

    for (id, item, source) in planned {
        if let Some(source) = source {
            prepare_job(ctx, connection, id, item, source).await?;
        }
    }
    Ok(())
}

/// Move a new job to `Ready`, directly or through the transcode gate.
async fn prepare_job(
    ctx: &Arc<SyncContext>,
    connection: &Arc<Connection>,
    id: JobId,
    item: IndexItem,
    source: PathBuf,
) -> Result<()> {
    if ctx.gate.decide(&item) == GateDecision::PassThrough {
        let size = match item.size.bytes() {
            Some(size) => size,
            None => match ctx.file_system.metadata(&source).await {
                Ok(metadata) => metadata.size,
                Err(e) => return fail_job(connection, id, e.to_string()).await,
            },
        };
        connection
            .update_job(id, |job| job.mark_ready(Some(size)))
            .await?;
        return connection
            .control()
            .send(&ServerMessage::Ready {
                job_id: id,
                size,
                extension: None,
            })
            .await;
    }

    let extension = ctx.gate.profile().target.extension.clone();
    if let Some((artifact, size)) = ctx.gate.ready_artifact(&item).await {
        connection
            .update_job(id, |job| {
                job.local_path = Some(artifact);
                job.mark_ready(Some(size))
            })
            .await?;
        return connection
            .control()
            .send(&ServerMessage::Ready {
                job_id: id,
                size,
                extension: Some(extension),
            })
            .await;
    }

    connection
        .update_job(id, |job| job.start_transcoding())
        .await?;
    connection
        .control()
        .send(&ServerMessage::Transcoding { job_id: id })
        .await?;

    let (ctx, task_connection) = (Arc::clone(ctx), Arc::clone(connection));
    connection.tasks().spawn(async move {
        await_transcode(ctx, task_connection, id, item, source, extension).await;
    });
    Ok(())
}

async fn await_transcode(
    ctx: Arc<SyncContext>,
    connection: Arc<Connection>,
    id: JobId,
    item: IndexItem,
    source: PathBuf,
    extension: String,
) {
    let outcome = tokio::select! {
        outcome = ctx.gate.transcode(&item, &source) => outcome,
        _ = connection.cancel_token().cancelled() => return,
    };

    let result = match outcome {
        Ok((artifact, size)) => {
            let ready = connection
                .update_job(id, |job| {
                    job.local_path = Some(artifact);
                    job.mark_ready(Some(size))
                })
                .await;
            match ready {
                Ok(_) => {
                    connection
                        .control()
                        .send(&ServerMessage::Ready {
                            job_id: id,
                            size,
                            extension: Some(extension),
                        })
                        .await
                }
                Err(e) => Err(e),
            }
        }
        Err(e) => fail_job(&connection, id, e.to_string()).await,
    };

    if let Err(e) = result {
        debug!(job_id = %id, error = %e, "Could not report transcode outcome");
    }
}

async fn fail_job(connection: &Connection, id: JobId, cause: String) -> Result<()> {
    connection
        .update_job(id, |job| job.fail(cause.clone()))
        .await?;
    connection
        .control()
        .send(&ServerMessage::JobFailed { job_id: id, cause })
        .await
}

async fn accept_streams(ctx: Arc<SyncContext>, connection: Arc<Connection>) {
    loop {
        let stream = tokio::select! {
            _ = connection.cancel_token().cancelled() => return,
            stream = connection.session().accept_bi() => stream,
        };
        match stream {
            Ok(stream) => {
                let (ctx, stream_connection) = (Arc::clone(&ctx), Arc::clone(&connection));
                connection.tasks().spawn(async move {
                    serve_stream(&ctx, &stream_connection, stream).await;
                });
            }
            Err(e) => {
                debug!(error = %e, "Stopped accepting file streams");
                return;
            }
        }
    }
}

/// Serve one file stream. The stream's outcome updates exactly one job.
async fn serve_stream(ctx: &SyncContext, connection: &Connection, stream: BiStream) {
    let BiStream { mut send, mut recv } = stream;

    let request: StreamRequest = tokio::select! {
        request = read_frame(&mut recv) => match request {
            Ok(request) => request,
            Err(e) => {
                debug!(error = %e, "Malformed stream request");
                return;
            }
        },
        _ = connection.cancel_token().cancelled() => return,
    };
    let id = request.job_id;

    let now = ctx.now();
    let job = match connection.update_job(id, |job| job.start(now)).await {
        Ok(job) => job,
        Err(e) => {
            debug!(job_id = %id, error = %e, "Rejecting stream");
            let _ = write_frame(
                &mut send,
                &StreamResponse::Reject {
                    cause: e.to_string(),
                },
            )
            .await;
            return;
        }
    };

    match send_file(ctx, connection, &job, &mut send).await {
        Ok(bytes) => {
            let now = ctx.now();
            if connection.update_job(id, |job| job.finish(now)).await.is_ok() {
                debug!(job_id = %id, bytes, "File sent");
            }
        }
        Err(e) => {
            if !e.is_session_closed() {
                warn!(job_id = %id, error = %e, "Failed to send file");
            }
            let _ = connection.update_job(id, |job| job.fail(e.to_string())).await;
        }
    }
}

async fn send_file(
    ctx: &SyncContext,
    connection: &Connection,
    job: &TransferJob,
    send: &mut ByteWriter,
) -> Result<u64> {
    let path = job
        .local_path
        .as_ref()
        .ok_or_else(|| SyncError::TransferFailed("no file to send".to_string()))?;
    let size = job
        .size
        .ok_or_else(|| SyncError::TransferFailed("size not known".to_string()))?;

    let mut file = ctx.file_system.open_read_stream(path).await?;
    write_frame(send, &StreamResponse::Accept { size }).await?;

    let mut limited = (&mut file).take(size);
    let mut throttle = ProgressThrottle::new(ctx.transfer.progress_interval_ms);
    let copied = copy_counted(
        &mut limited,
        send,
        job.bytes(),
        connection.cancel_token(),
        &mut throttle,
        |total| connection.report_progress(job.id, total, Some(size)),
    )
    .await?;
    send.shutdown().await?;

    if copied != size {
        return Err(SyncError::TransferFailed(format!(
            "file changed on disk: sent {} of {} bytes",
            copied, size
        )));
    }
    Ok(copied)
}
