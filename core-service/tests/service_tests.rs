//! Integration tests for the core service façade
//!
//! Complete services talk over a `LoopbackNetwork`; assertions are made on
//! the published snapshots the way a host UI would observe them.

use async_trait::async_trait;
use bridge_desktop::{LoopbackNetwork, TokioFileSystem};
use bridge_traits::error::{BridgeError, Result as BridgeResult};
use bridge_traits::transcode::{TranscodeTarget, Transcoder};
use bridge_traits::transport::NodeId;
use core_async::time::{timeout, Duration};
use core_library::LibraryError;
use core_runtime::config::{CoreConfig, TranscodePolicy};
use core_runtime::events::{ConnectionDirection, CoreEvent, RecvError, TransferEvent};
use core_service::{CoreError, CoreService, LibraryModel, NodeModel};
use core_sync::SyncError;
use mockall::mock;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

const WAIT: Duration = Duration::from_secs(10);

mock! {
    Encoder {}

    #[async_trait]
    impl Transcoder for Encoder {
        fn name(&self) -> &str;
        async fn transcode(&self, input: &Path, output: &Path, target: &TranscodeTarget) -> BridgeResult<()>;
    }
}

/// Copies the input unchanged.
#[derive(Default)]
struct CopyTranscoder {
    calls: AtomicUsize,
}

#[async_trait]
impl Transcoder for CopyTranscoder {
    fn name(&self) -> &str {
        "copy"
    }

    async fn transcode(
        &self,
        input: &Path,
        output: &Path,
        _target: &TranscodeTarget,
    ) -> BridgeResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::fs::copy(input, output).await?;
        Ok(())
    }
}

async fn start_service(
    network: &LoopbackNetwork,
    name: &str,
    files: &[(&str, &[u8])],
    transcoder: Option<Arc<dyn Transcoder>>,
) -> (CoreService, TempDir) {
    let dir = TempDir::new().unwrap();
    let mut builder = CoreConfig::builder()
        .database_path(dir.path().join("core.db"))
        .cache_dir(dir.path().join("cache"))
        .display_name(name)
        .transport(network.endpoint(name))
        .file_system(Arc::new(TokioFileSystem::with_directories(
            dir.path().join("cache"),
            dir.path().to_path_buf(),
        )))
        .progress_interval_ms(0);
    if let Some(transcoder) = transcoder {
        builder = builder.transcoder(transcoder);
    }
    let service = CoreService::start(builder.build().unwrap()).await.unwrap();

    if !files.is_empty() {
        let music = dir.path().join("music");
        for (path, data) in files {
            let target = music.join(path);
            std::fs::create_dir_all(target.parent().unwrap()).unwrap();
            std::fs::write(target, data).unwrap();
        }
        service.add_library_root("music", &music).await.unwrap();
    }
    (service, dir)
}

async fn wait_node<F>(service: &CoreService, mut check: F) -> NodeModel
where
    F: FnMut(&NodeModel) -> bool,
{
    let mut receiver = service.subscribe_node();
    timeout(WAIT, async {
        let mut model = receiver.current();
        loop {
            if check(&model) {
                return (*model).clone();
            }
            model = receiver.changed().await.expect("publisher stopped");
        }
    })
    .await
    .expect("timed out waiting for node snapshot")
}

async fn wait_library<F>(service: &CoreService, mut check: F) -> LibraryModel
where
    F: FnMut(&LibraryModel) -> bool,
{
    let mut receiver = service.subscribe_library();
    timeout(WAIT, async {
        let mut model = receiver.current();
        loop {
            if check(&model) {
                return (*model).clone();
            }
            model = receiver.changed().await.expect("publisher stopped");
        }
    })
    .await
    .expect("timed out waiting for library snapshot")
}

/// Connect `client` to `server` and have the server owner answer.
async fn connect(client: &CoreService, server: &CoreService, trust: bool) {
    let client_id = client.local_node_id().clone();
    let server_id = server.local_node_id().clone();
    let connecting = tokio::spawn({
        let client = client.clone();
        async move { client.connect(&server_id).await }
    });

    wait_node(server, |model| {
        model.incoming.pending.iter().any(|view| view.node_id == client_id)
    })
    .await;
    if trust {
        server.accept_connection_and_trust(&client_id).await.unwrap();
    } else {
        server.accept_connection(&client_id).await.unwrap();
    }
    connecting.await.unwrap().unwrap();
}

fn index_len(model: &NodeModel, server: &NodeId) -> Option<usize> {
    model
        .connection(server, ConnectionDirection::Outgoing)?
        .index
        .as_ref()
        .map(Vec::len)
}

const SONGS: &[(&str, &[u8])] = &[
    ("a.mp3", b"0123456789"),
    ("b.mp3", b"abcdefghijklmnopqrst"),
    ("nested/c.mp3", b"xyz"),
];

#[tokio::test]
async fn test_snapshots_follow_a_full_download() {
    let network = LoopbackNetwork::new();
    let (server, _server_dir) = start_service(&network, "server", SONGS, None).await;
    let (client, client_dir) = start_service(&network, "client", &[], None).await;
    let server_id = server.local_node_id().clone();

    connect(&client, &server, false).await;
    wait_node(&client, |model| index_len(model, &server_id) == Some(3)).await;

    let destination = client_dir.path().join("downloads");
    let jobs = client.download_all(&server_id, &destination).await.unwrap();
    assert_eq!(jobs.len(), 3);

    let model = wait_node(&client, |model| model.stats.finished_jobs == 3).await;
    assert_eq!(model.stats.bytes_received, 33);
    assert_eq!(model.stats.active_jobs, 0);
    let view = model
        .connection(&server_id, ConnectionDirection::Outgoing)
        .unwrap();
    assert!(view.index.as_ref().unwrap().iter().all(|item| item.downloaded));

    let served = wait_node(&server, |model| model.stats.bytes_sent == 33).await;
    assert_eq!(served.incoming.accepted.len(), 1);

    let node = client.node_model().await;
    assert!(node
        .recent_servers
        .iter()
        .any(|recent| recent.node_id == server_id));
    assert_eq!(
        std::fs::read(destination.join("music/nested/c.mp3")).unwrap(),
        b"xyz"
    );

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_library_roots_and_rescan() {
    let network = LoopbackNetwork::new();
    let (service, dir) = start_service(&network, "solo", SONGS, None).await;

    let model = service.library_model().await;
    assert_eq!(model.roots.len(), 1);
    assert_eq!(model.roots[0].file_count, 3);
    assert_eq!(model.total_files, 3);

    // Rescanning unchanged roots changes nothing
    let report = service.rescan_library().await.unwrap();
    assert_eq!(report.files, 3);
    assert!(report.errors.is_empty());
    assert_eq!(service.library_model().await, model);

    let err = service
        .add_library_root("again", &dir.path().join("music"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CoreError::Library(LibraryError::RootConflict { .. })
    ));

    service.remove_library_root("music").await.unwrap();
    assert_eq!(service.library_model().await.total_files, 0);

    service
        .add_library_root("music", &dir.path().join("music"))
        .await
        .unwrap();
    service.reset_database().await.unwrap();
    assert!(service.library_model().await.roots.is_empty());
}

#[tokio::test]
async fn test_untrusted_node_waits_for_owner_again() {
    let network = LoopbackNetwork::new();
    let (server, _server_dir) = start_service(&network, "server", SONGS, None).await;
    let (client, _client_dir) = start_service(&network, "client", &[], None).await;
    let client_id = client.local_node_id().clone();
    let server_id = server.local_node_id().clone();

    connect(&client, &server, true).await;
    let trusted = server.trusted_nodes().await.unwrap();
    assert_eq!(trusted.len(), 1);
    assert_eq!(trusted[0].node_id, client_id);

    client
        .close_connection(&server_id, ConnectionDirection::Outgoing)
        .await
        .unwrap();
    wait_node(&server, |model| model.incoming.is_empty()).await;

    assert!(server.untrust_node(&client_id).await.unwrap());
    assert!(!server.untrust_node(&client_id).await.unwrap());

    let connecting = tokio::spawn({
        let client = client.clone();
        let server_id = server_id.clone();
        async move { client.connect(&server_id).await }
    });
    wait_node(&server, |model| {
        model.incoming.pending.iter().any(|view| view.node_id == client_id)
    })
    .await;
    server.deny_connection(&client_id).await.unwrap();

    let err = connecting.await.unwrap().unwrap_err();
    assert!(matches!(
        err.as_sync(),
        Some(SyncError::AdmissionDenied { .. })
    ));
}

#[tokio::test]
async fn test_failed_transcode_fails_only_its_job() {
    let mut encoder = MockEncoder::new();
    encoder
        .expect_transcode()
        .returning(|_, _, _| Err(BridgeError::OperationFailed("encoder crashed".to_string())));

    let network = LoopbackNetwork::new();
    let (server, _server_dir) = start_service(
        &network,
        "server",
        &[("fine.mp3", b"mp3 data"), ("broken.flac", b"flac data")],
        Some(Arc::new(encoder)),
    )
    .await;
    let (client, client_dir) = start_service(&network, "client", &[], None).await;
    let server_id = server.local_node_id().clone();
    connect(&client, &server, false).await;
    wait_node(&client, |model| index_len(model, &server_id) == Some(2)).await;

    let mut events = client.subscribe_events();
    client
        .download_all(&server_id, &client_dir.path().join("downloads"))
        .await
        .unwrap();

    let (mut finished, mut failures) = (0, Vec::new());
    timeout(WAIT, async {
        while finished + failures.len() < 2 {
            match events.recv().await {
                Ok(CoreEvent::Transfer(TransferEvent::Finished { .. })) => finished += 1,
                Ok(CoreEvent::Transfer(TransferEvent::Failed { message, .. })) => {
                    failures.push(message)
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for jobs");

    assert_eq!(finished, 1);
    assert_eq!(failures.len(), 1);
    assert!(failures[0].contains("encoder crashed"));

    // The session survives a failed job
    let model = client.node_model().await;
    assert_eq!(model.outgoing.accepted.len(), 1);
    assert_eq!(model.stats.failed_jobs, 1);

    let library = wait_library(&server, |model| model.transcode.failed == 1).await;
    assert_eq!(library.transcode.ready, 0);
}

#[tokio::test]
async fn test_always_policy_converts_library_ahead_of_requests() {
    let network = LoopbackNetwork::new();
    let encoder = Arc::new(CopyTranscoder::default());
    let (server, _server_dir) = start_service(
        &network,
        "server",
        &[("one.flac", b"1"), ("two.wav", b"2"), ("three.mp3", b"3")],
        Some(Arc::clone(&encoder) as Arc<dyn Transcoder>),
    )
    .await;

    server.set_transcode_policy(TranscodePolicy::Always).await;
    let model = wait_library(&server, |model| model.transcode.ready == 2).await;
    assert_eq!(model.transcode_policy, TranscodePolicy::Always);
    assert_eq!(model.transcode.failed, 0);
    assert_eq!(encoder.calls.load(Ordering::SeqCst), 2);

    // A peer downloading afterwards is served the converted files from cache
    let (client, client_dir) = start_service(&network, "client", &[], None).await;
    let server_id = server.local_node_id().clone();
    connect(&client, &server, false).await;
    wait_node(&client, |model| index_len(model, &server_id) == Some(3)).await;

    let mut events = client.subscribe_events();
    let destination = client_dir.path().join("downloads");
    let jobs = client.download_all(&server_id, &destination).await.unwrap();
    assert_eq!(jobs.len(), 3);

    let (mut finished, mut states) = (0, Vec::new());
    timeout(WAIT, async {
        while finished < 3 {
            match events.recv().await {
                Ok(CoreEvent::Transfer(TransferEvent::Finished { .. })) => finished += 1,
                Ok(CoreEvent::Transfer(TransferEvent::StateChanged { state, .. })) => {
                    states.push(state)
                }
                Ok(CoreEvent::Transfer(TransferEvent::Failed { message, .. })) => {
                    panic!("job failed: {}", message)
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for jobs");

    assert!(
        !states.iter().any(|state| state == "transcoding"),
        "client saw states {:?}",
        states
    );
    assert_eq!(encoder.calls.load(Ordering::SeqCst), 2);
    assert_eq!(std::fs::read(destination.join("music/one.ogg")).unwrap(), b"1");
    assert_eq!(std::fs::read(destination.join("music/two.ogg")).unwrap(), b"2");
    assert_eq!(std::fs::read(destination.join("music/three.mp3")).unwrap(), b"3");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_snapshots_never_move_backwards() {
    let tracks: Vec<(String, Vec<u8>)> = (0..40)
        .map(|n| (format!("track{:02}.mp3", n), vec![n as u8; 4096]))
        .collect();
    let files: Vec<(&str, &[u8])> = tracks
        .iter()
        .map(|(path, data)| (path.as_str(), data.as_slice()))
        .collect();

    let network = LoopbackNetwork::new();
    let (server, _server_dir) = start_service(&network, "server", &files, None).await;
    let (client, client_dir) = start_service(&network, "client", &[], None).await;
    let server_id = server.local_node_id().clone();
    connect(&client, &server, false).await;
    wait_node(&client, |model| index_len(model, &server_id) == Some(40)).await;

    let mut receiver = client.subscribe_node();
    let watcher = tokio::spawn(async move {
        let mut last = receiver.current().stats;
        while last.finished_jobs < 40 {
            let model = receiver.changed().await.expect("publisher stopped");
            let stats = model.stats;
            assert!(
                stats.finished_jobs >= last.finished_jobs
                    && stats.bytes_received >= last.bytes_received,
                "snapshot went from {:?} to {:?}",
                last,
                stats
            );
            last = stats;
        }
    });

    // Direct reads race the background publisher the whole way through
    let readers: Vec<_> = (0..4)
        .map(|_| {
            let client = client.clone();
            tokio::spawn(async move {
                let mut last_finished = 0;
                while last_finished < 40 {
                    let stats = client.node_model().await.stats;
                    assert!(stats.finished_jobs >= last_finished);
                    last_finished = stats.finished_jobs;
                    tokio::task::yield_now().await;
                }
            })
        })
        .collect();

    client
        .download_all(&server_id, &client_dir.path().join("downloads"))
        .await
        .unwrap();

    timeout(WAIT, watcher)
        .await
        .expect("timed out waiting for snapshots")
        .unwrap();
    for reader in readers {
        timeout(WAIT, reader)
            .await
            .expect("timed out reading node model")
            .unwrap();
    }
}
