//! End-to-end tests for peer sessions
//!
//! Two (or three) complete nodes talk over a `LoopbackNetwork`:
//! - Admission: pending, accept, deny, trusted reconnect
//! - Download of a whole index and of a selection
//! - Transcoding before transfer, with the artifact reused across peers
//! - Closing a connection with live jobs, queued or mid-transfer

use async_trait::async_trait;
use bridge_desktop::{LoopbackNetwork, TokioFileSystem};
use bridge_traits::error::Result as BridgeResult;
use bridge_traits::storage::FileSystemAccess;
use bridge_traits::transcode::{TranscodeTarget, Transcoder};
use bridge_traits::transport::NodeId;
use core_async::sync::Semaphore;
use core_async::time::{timeout, Duration};
use core_library::db::create_test_pool;
use core_library::repositories::{SqliteRecentServerRepository, SqliteTrustStore};
use core_library::{ItemKey, Library};
use core_runtime::config::{CoreConfig, TranscodePolicy};
use core_runtime::events::{
    ConnectionDirection, ConnectionEvent, CoreEvent, EventBus, Receiver, RecvError,
    TransferEvent,
};
use core_sync::{JobState, SyncCoordinator, SyncError};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

const WAIT: Duration = Duration::from_secs(10);

// ============================================================================
// Test Harness
// ============================================================================

/// Prefixes its input so tests can tell converted files apart.
struct StubTranscoder {
    calls: AtomicUsize,
    hold: Option<Arc<Semaphore>>,
}

impl StubTranscoder {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            hold: None,
        })
    }

    fn held(hold: Arc<Semaphore>) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            hold: Some(hold),
        })
    }
}

#[async_trait]
impl Transcoder for StubTranscoder {
    fn name(&self) -> &str {
        "stub"
    }

    async fn transcode(
        &self,
        input: &Path,
        output: &Path,
        _target: &TranscodeTarget,
    ) -> BridgeResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(hold) = &self.hold {
            let _permit = hold.acquire().await;
        }
        let data = tokio::fs::read(input).await?;
        tokio::fs::write(output, [b"ogg:".as_slice(), &data].concat()).await?;
        Ok(())
    }
}

struct Node {
    id: NodeId,
    dir: TempDir,
    library: Arc<Library>,
    events: EventBus,
    coordinator: SyncCoordinator,
}

impl Node {
    fn downloads(&self) -> PathBuf {
        self.dir.path().join("downloads")
    }

    fn subscribe(&self) -> Receiver<CoreEvent> {
        self.events.subscribe()
    }
}

async fn start_node(
    network: &LoopbackNetwork,
    name: &str,
    files: &[(&str, &[u8])],
    transcoder: Option<Arc<StubTranscoder>>,
) -> Node {
    let dir = TempDir::new().unwrap();
    let music = dir.path().join("music");
    std::fs::create_dir_all(&music).unwrap();
    for (path, data) in files {
        let target = music.join(path);
        std::fs::create_dir_all(target.parent().unwrap()).unwrap();
        std::fs::write(target, data).unwrap();
    }

    let file_system: Arc<dyn FileSystemAccess> = Arc::new(TokioFileSystem::with_directories(
        dir.path().join("cache"),
        dir.path().join("data"),
    ));
    let mut builder = CoreConfig::builder()
        .database_path(dir.path().join("core.db"))
        .cache_dir(dir.path().join("cache"))
        .display_name(name)
        .transport(network.endpoint(name))
        .file_system(Arc::clone(&file_system))
        .progress_interval_ms(0);
    if let Some(transcoder) = transcoder {
        builder = builder.transcoder(transcoder);
    }
    let config = builder.build().unwrap();

    let pool = create_test_pool().await.unwrap();
    let events = EventBus::new(4096);
    let library = Arc::new(Library::new(
        pool.clone(),
        config.transport.local_node_id(),
        file_system,
        Arc::clone(&config.clock),
        config.scan_extensions.clone(),
    ));
    library.add_root("music", &music).await.unwrap();
    library.rescan().await.unwrap();

    let coordinator = SyncCoordinator::start(
        &config,
        Arc::clone(&library),
        Arc::new(SqliteTrustStore::new(pool.clone())),
        Arc::new(SqliteRecentServerRepository::new(pool)),
        events.clone(),
    )
    .await
    .unwrap();

    Node {
        id: NodeId::from(name),
        dir,
        library,
        events,
        coordinator,
    }
}

/// Wait for the first event matching `matches`.
async fn next_event<F>(events: &mut Receiver<CoreEvent>, mut matches: F) -> CoreEvent
where
    F: FnMut(&CoreEvent) -> bool,
{
    timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn count_events<F>(events: &mut Receiver<CoreEvent>, count: usize, mut matches: F) -> Vec<CoreEvent>
where
    F: FnMut(&CoreEvent) -> bool,
{
    let mut seen = Vec::new();
    while seen.len() < count {
        seen.push(next_event(events, &mut matches).await);
    }
    seen
}

fn is_pending(event: &CoreEvent) -> bool {
    matches!(
        event,
        CoreEvent::Connection(ConnectionEvent::Pending {
            direction: ConnectionDirection::Incoming,
            ..
        })
    )
}

fn is_index(event: &CoreEvent) -> bool {
    matches!(
        event,
        CoreEvent::Connection(ConnectionEvent::IndexReceived { .. })
    )
}

fn is_download_finished(event: &CoreEvent) -> bool {
    matches!(
        event,
        CoreEvent::Transfer(TransferEvent::Finished {
            direction: ConnectionDirection::Outgoing,
            ..
        })
    )
}

/// Connect `client` to `server`, have the server owner accept, and wait for
/// the index.
async fn admit(client: &Node, server: &Node, trust: bool) {
    let mut server_events = server.subscribe();
    let mut client_events = client.subscribe();

    let connection = client.coordinator.connect(&server.id).await.unwrap();
    next_event(&mut server_events, is_pending).await;
    server.coordinator.accept(&client.id, trust).await.unwrap();

    connection.wait_admitted().await.unwrap();
    next_event(&mut client_events, is_index).await;
}

fn is_transcoding(event: &CoreEvent) -> bool {
    matches!(
        event,
        CoreEvent::Transfer(TransferEvent::StateChanged { state, .. }) if state == "transcoding"
    )
}

/// Every regular file below `dir`, staged `.part` files included.
fn files_under(dir: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let Ok(entries) = std::fs::read_dir(dir) else {
        return found;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            found.extend(files_under(&path));
        } else {
            found.push(path);
        }
    }
    found
}

fn digest(path: &Path) -> Vec<u8> {
    Sha256::digest(std::fs::read(path).unwrap()).to_vec()
}

const SONGS: &[(&str, &[u8])] = &[
    ("a.mp3", b"first song"),
    ("b.mp3", b"second song, a little longer"),
    ("albums/c.mp3", b"third"),
];

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_download_all_copies_every_file() {
    let network = LoopbackNetwork::new();
    let server = start_node(&network, "server", SONGS, None).await;
    let client = start_node(&network, "client", &[], None).await;
    admit(&client, &server, false).await;

    let mut events = client.subscribe();
    let jobs = client
        .coordinator
        .download_all(&server.id, &client.downloads())
        .await
        .unwrap();
    assert_eq!(jobs.len(), 3);
    count_events(&mut events, 3, is_download_finished).await;

    for (path, _) in SONGS {
        let original = server.dir.path().join("music").join(path);
        let copy = client.downloads().join("music").join(path);
        assert_eq!(digest(&copy), digest(&original), "{} differs", path);
    }

    // Everything is downloaded now; a second pass plans nothing
    let again = client
        .coordinator
        .download_all(&server.id, &client.downloads())
        .await
        .unwrap();
    assert!(again.is_empty());

    let downloaded = client.library.downloaded_keys(&server.id).await.unwrap();
    assert_eq!(downloaded.len(), 3);
}

#[tokio::test]
async fn test_download_partial_fetches_only_selection() {
    let network = LoopbackNetwork::new();
    let server = start_node(&network, "server", SONGS, None).await;
    let client = start_node(&network, "client", &[], None).await;
    admit(&client, &server, false).await;

    let mut events = client.subscribe();
    let key = ItemKey::new("server", "music", "b.mp3");
    let jobs = client
        .coordinator
        .download_partial(&server.id, vec![key.clone(), key], &client.downloads())
        .await
        .unwrap();
    assert_eq!(jobs.len(), 1);
    next_event(&mut events, is_download_finished).await;

    assert!(client.downloads().join("music/b.mp3").exists());
    assert!(!client.downloads().join("music/a.mp3").exists());

    let err = client
        .coordinator
        .download_partial(
            &server.id,
            vec![ItemKey::new("server", "music", "missing.mp3")],
            &client.downloads(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::IndexInvalidSelection { .. }));
}

#[tokio::test]
async fn test_deny_sends_no_index() {
    let network = LoopbackNetwork::new();
    let server = start_node(&network, "server", SONGS, None).await;
    let client = start_node(&network, "client", &[], None).await;

    let mut server_events = server.subscribe();
    let connection = client.coordinator.connect(&server.id).await.unwrap();
    next_event(&mut server_events, is_pending).await;
    server.coordinator.deny(&client.id).await.unwrap();

    let err = connection.wait_admitted().await.unwrap_err();
    assert!(matches!(err, SyncError::AdmissionDenied { .. }));
    assert!(connection.remote_index().await.is_none());

    let err = client
        .coordinator
        .download_all(&server.id, &client.downloads())
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::ConnectionNotFound { .. }));
}

#[tokio::test]
async fn test_trusted_node_is_admitted_without_owner() {
    let network = LoopbackNetwork::new();
    let server = start_node(&network, "server", SONGS, None).await;
    let client = start_node(&network, "client", &[], None).await;
    admit(&client, &server, true).await;

    let mut server_events = server.subscribe();
    client
        .coordinator
        .close(&server.id, ConnectionDirection::Outgoing)
        .await
        .unwrap();
    next_event(&mut server_events, |event| {
        matches!(
            event,
            CoreEvent::Connection(ConnectionEvent::Closed {
                direction: ConnectionDirection::Incoming,
                ..
            })
        )
    })
    .await;

    let connection = client.coordinator.connect(&server.id).await.unwrap();
    connection.wait_admitted().await.unwrap();
    assert!(server
        .coordinator
        .connections()
        .await
        .iter()
        .any(|view| view.node_id == client.id && view.trusted));
}

#[tokio::test]
async fn test_transcoded_file_is_reused_for_second_peer() {
    let network = LoopbackNetwork::new();
    let hold = Arc::new(Semaphore::new(0));
    let transcoder = StubTranscoder::held(Arc::clone(&hold));
    let server = start_node(
        &network,
        "server",
        &[("live.flac", b"lossless bytes")],
        Some(Arc::clone(&transcoder)),
    )
    .await;
    let first = start_node(&network, "first", &[], None).await;
    let second = start_node(&network, "second", &[], None).await;
    admit(&first, &server, false).await;

    let mut events = first.subscribe();
    first
        .coordinator
        .download_all(&server.id, &first.downloads())
        .await
        .unwrap();
    next_event(&mut events, |event| {
        matches!(
            event,
            CoreEvent::Transfer(TransferEvent::StateChanged { state, .. }) if state == "transcoding"
        )
    })
    .await;
    hold.add_permits(16);
    next_event(&mut events, is_download_finished).await;

    let converted = first.downloads().join("music/live.ogg");
    assert_eq!(std::fs::read(&converted).unwrap(), b"ogg:lossless bytes");
    assert!(!first.downloads().join("music/live.flac").exists());

    admit(&second, &server, false).await;
    let mut events = second.subscribe();
    second
        .coordinator
        .download_all(&server.id, &second.downloads())
        .await
        .unwrap();

    // The cached artifact is served directly; the job never waits on the encoder
    let mut states = Vec::new();
    next_event(&mut events, |event| {
        if let CoreEvent::Transfer(TransferEvent::StateChanged { state, .. }) = event {
            states.push(state.clone());
        }
        is_download_finished(event)
    })
    .await;
    assert!(
        !states.iter().any(|state| state == "transcoding"),
        "second peer saw states {:?}",
        states
    );

    assert_eq!(
        std::fs::read(second.downloads().join("music/live.ogg")).unwrap(),
        b"ogg:lossless bytes"
    );
    assert_eq!(transcoder.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_close_cancels_live_jobs() {
    let network = LoopbackNetwork::new();
    let hold = Arc::new(Semaphore::new(0));
    let server = start_node(
        &network,
        "server",
        &[("one.flac", b"1"), ("two.flac", b"22")],
        Some(StubTranscoder::held(hold)),
    )
    .await;
    let client = start_node(&network, "client", &[], None).await;
    admit(&client, &server, false).await;

    let mut events = client.subscribe();
    let jobs = client
        .coordinator
        .download_all(&server.id, &client.downloads())
        .await
        .unwrap();
    assert_eq!(jobs.len(), 2);
    count_events(&mut events, 2, is_transcoding).await;

    let connection = client
        .coordinator
        .connection(&server.id, ConnectionDirection::Outgoing)
        .await
        .unwrap();
    client
        .coordinator
        .close(&server.id, ConnectionDirection::Outgoing)
        .await
        .unwrap();

    let failed = count_events(&mut events, 2, |event| {
        matches!(event, CoreEvent::Transfer(TransferEvent::Failed { .. }))
    })
    .await;
    for event in failed {
        if let CoreEvent::Transfer(TransferEvent::Failed { message, .. }) = event {
            assert_eq!(message, "cancelled");
        }
    }
    for view in connection.job_views().await {
        assert!(matches!(view.state, JobState::Failed { .. }));
    }
    assert!(client
        .coordinator
        .connection(&server.id, ConnectionDirection::Outgoing)
        .await
        .is_none());
    assert!(!client.downloads().exists() || std::fs::read_dir(client.downloads()).unwrap().count() == 0);
}

#[tokio::test]
async fn test_close_mid_transfer_leaves_no_partial_file() {
    let network = LoopbackNetwork::new();
    let big = vec![0x5a_u8; 64 * 1024 * 1024];
    let server = start_node(&network, "server", &[("big.mp3", big.as_slice())], None).await;
    let client = start_node(&network, "client", &[], None).await;
    admit(&client, &server, false).await;

    let mut events = client.subscribe();
    let jobs = client
        .coordinator
        .download_all(&server.id, &client.downloads())
        .await
        .unwrap();
    assert_eq!(jobs.len(), 1);
    next_event(&mut events, |event| {
        matches!(
            event,
            CoreEvent::Transfer(TransferEvent::Progress { bytes, total: Some(total), .. }) if *bytes > 0 && bytes < total
        )
    })
    .await;

    let connection = client
        .coordinator
        .connection(&server.id, ConnectionDirection::Outgoing)
        .await
        .unwrap();
    client
        .coordinator
        .close(&server.id, ConnectionDirection::Outgoing)
        .await
        .unwrap();

    let failed = next_event(&mut events, |event| {
        matches!(event, CoreEvent::Transfer(TransferEvent::Failed { .. }))
    })
    .await;
    if let CoreEvent::Transfer(TransferEvent::Failed { message, .. }) = failed {
        assert_eq!(message, "cancelled");
    }
    for view in connection.job_views().await {
        assert!(
            matches!(&view.state, JobState::Failed { error } if error == "cancelled"),
            "job left in {:?}",
            view.state
        );
    }
    let leftovers = files_under(&client.downloads());
    assert!(leftovers.is_empty(), "files after close: {:?}", leftovers);
}

#[tokio::test]
async fn test_request_before_admission_is_rejected() {
    let network = LoopbackNetwork::new();
    let server = start_node(&network, "server", SONGS, None).await;
    let client = start_node(&network, "client", &[], None).await;

    client.coordinator.connect(&server.id).await.unwrap();
    let err = client
        .coordinator
        .download_all(&server.id, &client.downloads())
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::InvalidConnectionState { .. }));

    client.coordinator.shutdown().await;
    server.coordinator.shutdown().await;
}
