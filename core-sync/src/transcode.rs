//! # Transcode Gate
//!
//! Decides whether a file must be converted before it is sent and runs the
//! conversions on a bounded worker pool.
//!
//! ## Overview
//!
//! Artifacts are cached on disk under the transcode directory, keyed by the
//! source hash and the target profile:
//!
//! ```text
//! <cache_dir>/transcodes/<hash_kind>-<hex hash>-<profile>.<ext>
//! ```
//!
//! Encodes write to `<name>.part` and are renamed into place on success, so a
//! crash never leaves a truncated artifact behind. [`TranscodeGate::recover`]
//! registers existing artifacts and deletes stale `.part` files at startup.
//!
//! ## Entry lifecycle
//!
//! ```text
//! Waiting → Queued → InProgress → Ready
//!                         └─────→ Failed → (next request) Waiting
//! ```
//!
//! `Waiting` entries are blocked on a free queue slot. Concurrent requests for
//! the same key share one entry, so at most one encode per key is in flight.
//! Every transition moves exactly one unit between [`TranscodeCounters`]
//! buckets while the gate lock is held.

use crate::{Result, SyncError};
use bridge_traits::storage::FileSystemAccess;
use bridge_traits::transcode::Transcoder;
use core_async::sync::{mpsc, watch, CancellationToken, Mutex, RwLock};
use core_async::task::TaskTracker;
use core_library::{FileRecord, FileSize, IndexItem};
use core_runtime::config::{TranscodeConfig, TranscodePolicy, TranscodeProfile};
use core_runtime::events::{CoreEvent, EventBus, TranscodeEvent};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

const PART_SUFFIX: &str = ".part";

/// Whether a file is sent as-is or converted first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    PassThrough,
    NeedsTranscode,
}

/// Identity of a cached artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub hash_kind: String,
    pub hash: Vec<u8>,
    pub profile: String,
}

impl CacheKey {
    pub fn for_item(item: &IndexItem, profile: &str) -> Self {
        Self {
            hash_kind: item.hash_kind.clone(),
            hash: item.hash.clone(),
            profile: profile.to_string(),
        }
    }

    pub fn file_name(&self, extension: &str) -> String {
        format!(
            "{}-{}-{}.{}",
            self.hash_kind,
            hex::encode(&self.hash),
            self.profile,
            extension
        )
    }

    /// Parse an artifact file name. The profile may itself contain dashes.
    pub fn parse(file_name: &str) -> Option<Self> {
        let (stem, _extension) = file_name.rsplit_once('.')?;
        let mut parts = stem.splitn(3, '-');
        let hash_kind = parts.next()?;
        let hash = hex::decode(parts.next()?).ok()?;
        let profile = parts.next()?;
        if hash_kind.is_empty() || hash.is_empty() || profile.is_empty() {
            return None;
        }
        Some(Self {
            hash_kind: hash_kind.to_string(),
            hash,
            profile: profile.to_string(),
        })
    }

    fn hash_hex(&self) -> String {
        hex::encode(&self.hash)
    }
}

/// State of one cache entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactState {
    Waiting,
    Queued,
    InProgress,
    Ready { path: PathBuf, size: u64 },
    Failed { error: String },
}

/// Running totals over every tracked entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscodeCounters {
    pub waiting: u64,
    pub queued: u64,
    pub in_progress: u64,
    pub ready: u64,
    pub failed: u64,
}

impl TranscodeCounters {
    pub fn total(&self) -> u64 {
        self.waiting + self.queued + self.in_progress + self.ready + self.failed
    }

    fn bucket(&mut self, state: &ArtifactState) -> &mut u64 {
        match state {
            ArtifactState::Waiting => &mut self.waiting,
            ArtifactState::Queued => &mut self.queued,
            ArtifactState::InProgress => &mut self.in_progress,
            ArtifactState::Ready { .. } => &mut self.ready,
            ArtifactState::Failed { .. } => &mut self.failed,
        }
    }

    fn to_event(self) -> TranscodeEvent {
        TranscodeEvent::CountersChanged {
            waiting: self.waiting,
            queued: self.queued,
            in_progress: self.in_progress,
            ready: self.ready,
            failed: self.failed,
        }
    }
}

struct EncodeTask {
    key: CacheKey,
    source: PathBuf,
}

#[derive(Default)]
struct GateState {
    entries: HashMap<CacheKey, watch::Sender<ArtifactState>>,
    counters: TranscodeCounters,
}

pub struct TranscodeGate {
    transcoder: Option<Arc<dyn Transcoder>>,
    file_system: Arc<dyn FileSystemAccess>,
    profile: TranscodeProfile,
    dir: PathBuf,
    policy: RwLock<TranscodePolicy>,
    state: Mutex<GateState>,
    queue: mpsc::Sender<EncodeTask>,
    events: EventBus,
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

impl TranscodeGate {
    /// Create the gate and start its workers.
    pub fn start(
        config: &TranscodeConfig,
        dir: PathBuf,
        transcoder: Option<Arc<dyn Transcoder>>,
        file_system: Arc<dyn FileSystemAccess>,
        events: EventBus,
    ) -> Arc<Self> {
        let (queue, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let gate = Arc::new(Self {
            transcoder,
            file_system,
            profile: config.profile.clone(),
            dir,
            policy: RwLock::new(config.policy),
            state: Mutex::new(GateState::default()),
            queue,
            events,
            tasks: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        });

        let receiver = Arc::new(Mutex::new(receiver));
        for worker in 0..config.workers.max(1) {
            let gate = Arc::clone(&gate);
            let receiver = Arc::clone(&receiver);
            gate.tasks.clone().spawn(async move {
                gate.run_worker(worker, receiver).await;
            });
        }
        gate
    }

    pub fn profile(&self) -> &TranscodeProfile {
        &self.profile
    }

    pub async fn policy(&self) -> TranscodePolicy {
        *self.policy.read().await
    }

    pub async fn set_policy(&self, policy: TranscodePolicy) {
        *self.policy.write().await = policy;
        info!(policy = policy.as_str(), "Transcode policy changed");
        let _ = self
            .events
            .emit(CoreEvent::Transcode(TranscodeEvent::PolicyChanged {
                policy: policy.as_str().to_string(),
            }));
    }

    pub async fn counters(&self) -> TranscodeCounters {
        self.state.lock().await.counters
    }

    /// Whether `item` must be converted before it is sent.
    pub fn decide(&self, item: &IndexItem) -> GateDecision {
        if self.transcoder.is_none() {
            return GateDecision::PassThrough;
        }
        match item.extension() {
            Some(ext) if self.profile.is_native(&ext) => GateDecision::PassThrough,
            _ => GateDecision::NeedsTranscode,
        }
    }

    fn key_for(&self, item: &IndexItem) -> CacheKey {
        CacheKey::for_item(item, &self.profile.target.name)
    }

    /// The cached artifact for `item`, if one is ready.
    pub async fn ready_artifact(&self, item: &IndexItem) -> Option<(PathBuf, u64)> {
        let key = self.key_for(item);
        let state = self.state.lock().await;
        let entry = state.entries.get(&key)?;
        let current = entry.borrow();
        match &*current {
            ArtifactState::Ready { path, size } => Some((path.clone(), *size)),
            _ => None,
        }
    }

    /// Size to advertise for `item` in an index.
    ///
    /// Files that will be converted carry an estimate until their artifact
    /// exists.
    pub async fn advertised_size(&self, item: &IndexItem) -> FileSize {
        if self.decide(item) == GateDecision::PassThrough {
            return item.size;
        }
        if let Some((_, size)) = self.ready_artifact(item).await {
            return FileSize::Actual(size);
        }
        match item.size.bytes() {
            Some(bytes) => FileSize::Estimated(self.profile.estimate_size(bytes)),
            None => FileSize::Unknown,
        }
    }

    /// Ask for an artifact of `item`, converting `source` if needed.
    ///
    /// Returns a receiver that follows the entry's state. A new encode waits
    /// for a queue slot on the gate's own tasks, so dropping the returned
    /// receiver never strands an entry.
    #[instrument(skip(self, item, source), fields(path = %item.path))]
    pub async fn request(
        self: &Arc<Self>,
        item: &IndexItem,
        source: &Path,
    ) -> Result<watch::Receiver<ArtifactState>> {
        if self.shutdown.is_cancelled() {
            return Err(SyncError::TranscodeFailed(
                "transcode gate stopped".to_string(),
            ));
        }
        let key = self.key_for(item);

        let receiver = {
            let mut state = self.state.lock().await;
            let existing = state.entries.get(&key).map(|entry| {
                let failed = matches!(*entry.borrow(), ArtifactState::Failed { .. });
                (failed, entry.subscribe())
            });
            match existing {
                Some((false, receiver)) => {
                    debug!("Joining existing transcode entry");
                    return Ok(receiver);
                }
                Some((true, receiver)) => {
                    debug!("Retrying failed transcode");
                    self.transition(&mut state, &key, ArtifactState::Waiting);
                    receiver
                }
                None => {
                    let (sender, receiver) = watch::channel(ArtifactState::Waiting);
                    state.entries.insert(key.clone(), sender);
                    state.counters.waiting += 1;
                    self.emit_counters(&state);
                    receiver
                }
            }
        };

        let gate = Arc::clone(self);
        let task = EncodeTask {
            key,
            source: source.to_path_buf(),
        };
        self.tasks.spawn(async move { gate.enqueue(task).await });
        Ok(receiver)
    }

    async fn enqueue(&self, task: EncodeTask) {
        let permit = reserve_slot(&self.queue, &self.shutdown).await;
        let mut state = self.state.lock().await;
        match permit {
            Some(permit) => {
                self.transition(&mut state, &task.key, ArtifactState::Queued);
                permit.send(task);
            }
            None => {
                self.transition(
                    &mut state,
                    &task.key,
                    ArtifactState::Failed {
                        error: "transcoder shut down".to_string(),
                    },
                );
            }
        }
    }

    /// Request an artifact and wait until it is ready.
    pub async fn transcode(
        self: &Arc<Self>,
        item: &IndexItem,
        source: &Path,
    ) -> Result<(PathBuf, u64)> {
        let receiver = self.request(item, source).await?;
        wait_ready(receiver).await
    }

    /// Queue every local file that will need conversion. Returns how many
    /// were requested.
    pub async fn prestage(self: &Arc<Self>, files: &[FileRecord]) -> usize {
        let mut requested = 0;
        for record in files {
            if self.shutdown.is_cancelled() {
                break;
            }
            let item = record.to_index_item();
            if self.decide(&item) == GateDecision::PassThrough {
                continue;
            }
            match self.request(&item, Path::new(&record.local_path)).await {
                Ok(_) => requested += 1,
                Err(e) => warn!(path = %item.path, error = %e, "Failed to prestage file"),
            }
        }
        requested
    }

    /// Register artifacts left by a previous run and delete unfinished ones.
    #[instrument(skip(self))]
    pub async fn recover(&self) -> Result<usize> {
        self.file_system.create_dir_all(&self.dir).await?;
        let paths = self.file_system.list_directory(&self.dir).await?;

        let mut state = self.state.lock().await;
        let mut recovered = 0;
        for path in paths {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.ends_with(PART_SUFFIX) {
                if let Err(e) = self.file_system.delete_file(&path).await {
                    warn!(file = name, error = %e, "Failed to delete unfinished artifact");
                }
                continue;
            }
            let Some(key) = CacheKey::parse(name) else {
                continue;
            };
            let size = match self.file_system.metadata(&path).await {
                Ok(metadata) if !metadata.is_directory => metadata.size,
                _ => continue,
            };
            if state.entries.contains_key(&key) {
                continue;
            }
            let (sender, _) = watch::channel(ArtifactState::Ready { path, size });
            state.entries.insert(key, sender);
            state.counters.ready += 1;
            recovered += 1;
        }

        if recovered > 0 {
            self.emit_counters(&state);
        }
        info!(recovered, "Transcode cache recovered");
        Ok(recovered)
    }

    /// Stop the workers. Queued encodes are dropped.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }

    async fn run_worker(&self, worker: usize, receiver: Arc<Mutex<mpsc::Receiver<EncodeTask>>>) {
        loop {
            let task = {
                let mut receiver = receiver.lock().await;
                next_task(&mut receiver, &self.shutdown).await
            };
            let Some(task) = task else {
                debug!(worker, "Transcode worker stopped");
                return;
            };
            self.encode(task).await;
        }
    }

    #[instrument(skip(self, task), fields(hash = %task.key.hash_hex()))]
    async fn encode(&self, task: EncodeTask) {
        {
            let mut state = self.state.lock().await;
            self.transition(&mut state, &task.key, ArtifactState::InProgress);
        }

        let outcome = self.run_encoder(&task).await;

        let mut state = self.state.lock().await;
        let event = match outcome {
            Ok((path, size)) => {
                info!(size, "Transcode finished");
                self.transition(&mut state, &task.key, ArtifactState::Ready { path, size });
                TranscodeEvent::Finished {
                    hash: task.key.hash_hex(),
                    profile: task.key.profile.clone(),
                }
            }
            Err(e) => {
                warn!(error = %e, "Transcode failed");
                self.transition(
                    &mut state,
                    &task.key,
                    ArtifactState::Failed {
                        error: e.to_string(),
                    },
                );
                TranscodeEvent::Failed {
                    hash: task.key.hash_hex(),
                    profile: task.key.profile.clone(),
                    message: e.to_string(),
                }
            }
        };
        let _ = self.events.emit(CoreEvent::Transcode(event));
    }

    async fn run_encoder(&self, task: &EncodeTask) -> Result<(PathBuf, u64)> {
        let transcoder = self
            .transcoder
            .as_ref()
            .ok_or_else(|| SyncError::TranscodeFailed("no transcoder available".to_string()))?;

        let final_path = self
            .dir
            .join(task.key.file_name(&self.profile.target.extension));
        let part_path = PathBuf::from(format!("{}{}", final_path.display(), PART_SUFFIX));

        self.file_system.create_dir_all(&self.dir).await?;
        if let Err(e) = transcoder
            .transcode(&task.source, &part_path, &self.profile.target)
            .await
        {
            let _ = self.file_system.delete_file(&part_path).await;
            return Err(SyncError::TranscodeFailed(e.to_string()));
        }

        self.file_system.rename(&part_path, &final_path).await?;
        let size = self.file_system.metadata(&final_path).await?.size;
        Ok((final_path, size))
    }

    /// Move an entry to `to`, keeping the counters in step. Caller holds the lock.
    fn transition(&self, state: &mut GateState, key: &CacheKey, to: ArtifactState) {
        let Some(entry) = state.entries.get(key) else {
            return;
        };
        let from = entry.send_replace(to.clone());
        let bucket = state.counters.bucket(&from);
        *bucket = bucket.saturating_sub(1);
        *state.counters.bucket(&to) += 1;
        self.emit_counters(state);
    }

    fn emit_counters(&self, state: &GateState) {
        let _ = self
            .events
            .emit(CoreEvent::Transcode(state.counters.to_event()));
    }
}

/// Follow an entry until it is ready or failed.
pub async fn wait_ready(mut receiver: watch::Receiver<ArtifactState>) -> Result<(PathBuf, u64)> {
    loop {
        {
            let current = receiver.borrow_and_update();
            match &*current {
                ArtifactState::Ready { path, size } => return Ok((path.clone(), *size)),
                ArtifactState::Failed { error } => {
                    return Err(SyncError::TranscodeFailed(error.clone()))
                }
                _ => {}
            }
        }
        if receiver.changed().await.is_err() {
            return Err(SyncError::TranscodeFailed(
                "transcode gate stopped".to_string(),
            ));
        }
    }
}

async fn reserve_slot<'a>(
    queue: &'a mpsc::Sender<EncodeTask>,
    shutdown: &CancellationToken,
) -> Option<mpsc::Permit<'a, EncodeTask>> {
    tokio::select! {
        permit = queue.reserve() => permit.ok(),
        _ = shutdown.cancelled() => None,
    }
}

async fn next_task(
    receiver: &mut mpsc::Receiver<EncodeTask>,
    shutdown: &CancellationToken,
) -> Option<EncodeTask> {
    tokio::select! {
        task = receiver.recv() => task,
        _ = shutdown.cancelled() => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bridge_desktop::TokioFileSystem;
    use bridge_traits::error::{BridgeError, Result as BridgeResult};
    use bridge_traits::transcode::TranscodeTarget;
    use bridge_traits::transport::NodeId;
    use core_async::sync::Notify;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Copies the first half of the input; optionally fails or holds until released.
    #[derive(Default)]
    struct StubTranscoder {
        calls: AtomicUsize,
        fail: AtomicBool,
        hold: Option<Arc<Notify>>,
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
                hold.notified().await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(BridgeError::OperationFailed("encoder crashed".to_string()));
            }
            let data = tokio::fs::read(input).await?;
            tokio::fs::write(output, &data[..data.len() / 2]).await?;
            Ok(())
        }
    }

    struct Fixture {
        _dir: TempDir,
        source: PathBuf,
        cache: PathBuf,
        events: EventBus,
        fs: Arc<TokioFileSystem>,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("song.flac");
        std::fs::write(&source, vec![7u8; 1000]).unwrap();
        let cache = dir.path().join("cache").join("transcodes");
        let fs = Arc::new(TokioFileSystem::with_directories(
            dir.path().join("cache"),
            dir.path().to_path_buf(),
        ));
        Fixture {
            _dir: dir,
            source,
            cache,
            events: EventBus::new(256),
            fs,
        }
    }

    fn gate(fx: &Fixture, transcoder: Option<Arc<dyn Transcoder>>) -> Arc<TranscodeGate> {
        TranscodeGate::start(
            &TranscodeConfig::default(),
            fx.cache.clone(),
            transcoder,
            fx.fs.clone(),
            fx.events.clone(),
        )
    }

    fn item(path: &str) -> IndexItem {
        IndexItem {
            node_id: NodeId::new("me"),
            root: "Music".to_string(),
            path: path.to_string(),
            hash_kind: "sha256".to_string(),
            hash: vec![0xab; 4],
            size: FileSize::Actual(1000),
            downloaded: false,
        }
    }

    #[test]
    fn test_cache_key_file_name_round_trip() {
        let key = CacheKey {
            hash_kind: "sha256".to_string(),
            hash: vec![0xde, 0xad],
            profile: "opus-128".to_string(),
        };
        let name = key.file_name("ogg");
        assert_eq!(name, "sha256-dead-opus-128.ogg");
        assert_eq!(CacheKey::parse(&name), Some(key));
        assert_eq!(CacheKey::parse("notes.txt"), None);
        assert_eq!(CacheKey::parse("sha256-zz-opus.ogg"), None);
    }

    #[tokio::test]
    async fn test_decide() {
        let fx = fixture();
        let with = gate(&fx, Some(Arc::new(StubTranscoder::default())));
        assert_eq!(with.decide(&item("a.mp3")), GateDecision::PassThrough);
        assert_eq!(with.decide(&item("a.OGG")), GateDecision::PassThrough);
        assert_eq!(with.decide(&item("a.flac")), GateDecision::NeedsTranscode);
        assert_eq!(with.decide(&item("noext")), GateDecision::NeedsTranscode);

        let without = gate(&fx, None);
        assert_eq!(without.decide(&item("a.flac")), GateDecision::PassThrough);
    }

    #[tokio::test]
    async fn test_concurrent_requests_encode_once() {
        let fx = fixture();
        let hold = Arc::new(Notify::new());
        let stub = Arc::new(StubTranscoder {
            hold: Some(hold.clone()),
            ..Default::default()
        });
        let gate = gate(&fx, Some(stub.clone()));
        let item = item("song.flac");

        let first = gate.request(&item, &fx.source).await.unwrap();
        let second = gate.request(&item, &fx.source).await.unwrap();
        hold.notify_one();

        let (path, size) = wait_ready(first).await.unwrap();
        let (again, _) = wait_ready(second).await.unwrap();
        assert_eq!(path, again);
        assert_eq!(size, 500);
        assert!(path.starts_with(&fx.cache));
        assert_eq!(stub.calls.load(Ordering::SeqCst), 1);

        // A later request reuses the cached artifact.
        gate.transcode(&item, &fx.source).await.unwrap();
        assert_eq!(stub.calls.load(Ordering::SeqCst), 1);

        let counters = gate.counters().await;
        assert_eq!(counters.ready, 1);
        assert_eq!(counters.total(), 1);
    }

    #[tokio::test]
    async fn test_failure_is_counted_and_retried() {
        let fx = fixture();
        let stub = Arc::new(StubTranscoder::default());
        stub.fail.store(true, Ordering::SeqCst);
        let gate = gate(&fx, Some(stub.clone()));
        let item = item("song.flac");

        let err = gate.transcode(&item, &fx.source).await.unwrap_err();
        assert!(matches!(err, SyncError::TranscodeFailed(_)));
        let counters = gate.counters().await;
        assert_eq!(counters.failed, 1);
        assert_eq!(counters.total(), 1);

        stub.fail.store(false, Ordering::SeqCst);
        gate.transcode(&item, &fx.source).await.unwrap();
        let counters = gate.counters().await;
        assert_eq!(counters.failed, 0);
        assert_eq!(counters.ready, 1);
        assert_eq!(stub.calls.load(Ordering::SeqCst), 2);

        // No stray staging files.
        let leftovers: Vec<_> = std::fs::read_dir(&fx.cache)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".part"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_counter_events_reconcile() {
        let fx = fixture();
        let mut events = fx.events.subscribe();
        let gate = gate(&fx, Some(Arc::new(StubTranscoder::default())));
        gate.transcode(&item("song.flac"), &fx.source).await.unwrap();

        let mut totals = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let CoreEvent::Transcode(TranscodeEvent::CountersChanged {
                waiting,
                queued,
                in_progress,
                ready,
                failed,
            }) = event
            {
                totals.push(waiting + queued + in_progress + ready + failed);
            }
        }
        // waiting, queued, in progress, ready
        assert_eq!(totals, vec![1, 1, 1, 1]);
    }

    #[tokio::test]
    async fn test_recover_registers_artifacts_and_removes_partials() {
        let fx = fixture();
        std::fs::create_dir_all(&fx.cache).unwrap();
        let key = CacheKey::for_item(&item("song.flac"), "opus-128");
        std::fs::write(fx.cache.join(key.file_name("ogg")), vec![1u8; 42]).unwrap();
        let partial = fx.cache.join(format!("{}.part", key.file_name("ogg")));
        std::fs::write(&partial, b"half").unwrap();
        std::fs::write(fx.cache.join("README"), b"ignored").unwrap();

        let stub = Arc::new(StubTranscoder::default());
        let gate = gate(&fx, Some(stub.clone()));
        assert_eq!(gate.recover().await.unwrap(), 1);
        assert!(!partial.exists());

        let (_, size) = gate.transcode(&item("song.flac"), &fx.source).await.unwrap();
        assert_eq!(size, 42);
        assert_eq!(stub.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_advertised_size() {
        let fx = fixture();
        let gate = gate(&fx, Some(Arc::new(StubTranscoder::default())));

        assert_eq!(
            gate.advertised_size(&item("a.mp3")).await,
            FileSize::Actual(1000)
        );
        assert_eq!(
            gate.advertised_size(&item("song.flac")).await,
            FileSize::Estimated(150)
        );

        gate.transcode(&item("song.flac"), &fx.source).await.unwrap();
        assert_eq!(
            gate.advertised_size(&item("song.flac")).await,
            FileSize::Actual(500)
        );
    }

    #[tokio::test]
    async fn test_prestage_skips_native_files() {
        let fx = fixture();
        let stub = Arc::new(StubTranscoder::default());
        let gate = gate(&fx, Some(stub.clone()));
        let records = vec![
            FileRecord {
                node_id: NodeId::new("me"),
                root: "Music".to_string(),
                path: "song.flac".to_string(),
                hash_kind: "sha256".to_string(),
                hash: vec![0xab; 4],
                size: Some(1000),
                local_path: fx.source.to_string_lossy().into_owned(),
            },
            FileRecord {
                node_id: NodeId::new("me"),
                root: "Music".to_string(),
                path: "other.mp3".to_string(),
                hash_kind: "sha256".to_string(),
                hash: vec![0xcd; 4],
                size: Some(10),
                local_path: "/nowhere/other.mp3".to_string(),
            },
        ];

        assert_eq!(gate.prestage(&records).await, 1);
        let receiver = gate
            .request(&records[0].to_index_item(), &fx.source)
            .await
            .unwrap();
        wait_ready(receiver).await.unwrap();
        assert_eq!(stub.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_policy_change_emits_event() {
        let fx = fixture();
        let mut events = fx.events.subscribe();
        let gate = gate(&fx, None);
        assert_eq!(gate.policy().await, TranscodePolicy::IfRequested);
        gate.set_policy(TranscodePolicy::Always).await;
        assert_eq!(gate.policy().await, TranscodePolicy::Always);
        assert_eq!(
            events.recv().await.unwrap(),
            CoreEvent::Transcode(TranscodeEvent::PolicyChanged {
                policy: "always".to_string()
            })
        );
    }
}
