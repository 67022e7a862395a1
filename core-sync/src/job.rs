//! # Transfer Job State Machine
//!
//! One job per selected file per session, with validated state transitions.
//!
//! ## State Machine
//!
//! ```text
//! Requested → Transcoding → Ready → InProgress → Finished
//!     │            │          │          │
//!     └────────────┴──────────┴──────────┴──→ Failed
//! Requested → Ready
//! ```
//!
//! `Finished` and `Failed` are terminal. Any non-terminal job can fail, which
//! is how cancellation and server-reported errors are recorded.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let mut job = TransferJob::new(ids.next(), item, now);
//! job.mark_ready(Some(4096))?;
//! job.start(now)?;
//! job.bytes().add(4096);
//! job.finish(now)?;
//! ```

use crate::{Result, SyncError};
use core_library::IndexItem;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Cause recorded on jobs stopped by closing their connection.
pub const CANCELLED: &str = "cancelled";

// ============================================================================
// ID Types
// ============================================================================

/// Identifier of a transfer job. Assigned by the downloading side and echoed
/// by the serving side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Process-wide source of job ids. Ids are never reused, so a job from an
/// earlier session can never be confused with a new one.
#[derive(Debug)]
pub struct JobIdAllocator {
    next: AtomicU64,
}

impl Default for JobIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl JobIdAllocator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next(&self) -> JobId {
        JobId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

// ============================================================================
// Byte Counter
// ============================================================================

/// Bytes moved so far on a job.
///
/// One writer adds to it; any number of readers can load it at any time
/// without blocking the writer. The value only grows.
#[derive(Debug, Clone, Default)]
pub struct ByteCounter(Arc<AtomicU64>);

impl ByteCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, n: u64) -> u64 {
        self.0.fetch_add(n, Ordering::Relaxed) + n
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

// ============================================================================
// State Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Requested,
    Transcoding,
    Ready,
    InProgress { started_at: i64 },
    Finished { finished_at: i64 },
    Failed { error: String },
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Finished { .. } | JobState::Failed { .. })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Requested => "requested",
            JobState::Transcoding => "transcoding",
            JobState::Ready => "ready",
            JobState::InProgress { .. } => "in_progress",
            JobState::Finished { .. } => "finished",
            JobState::Failed { .. } => "failed",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Transfer Job Entity
// ============================================================================

#[derive(Debug, Clone)]
pub struct TransferJob {
    pub id: JobId,
    /// The remote file this job fetches (or, on the serving side, sends)
    pub item: IndexItem,
    /// Bytes to transfer, known once the job is ready
    pub size: Option<u64>,
    pub state: JobState,
    pub created_at: i64,
    /// Destination file on the downloading side, file being served on the
    /// serving side
    pub local_path: Option<PathBuf>,
    bytes: ByteCounter,
}

impl TransferJob {
    pub fn new(id: JobId, item: IndexItem, created_at: i64) -> Self {
        Self {
            id,
            item,
            size: None,
            state: JobState::Requested,
            created_at,
            local_path: None,
            bytes: ByteCounter::new(),
        }
    }

    pub fn with_local_path(mut self, path: PathBuf) -> Self {
        self.local_path = Some(path);
        self
    }

    pub fn bytes(&self) -> &ByteCounter {
        &self.bytes
    }

    pub fn start_transcoding(&mut self) -> Result<()> {
        self.transition(JobState::Transcoding)
    }

    pub fn mark_ready(&mut self, size: Option<u64>) -> Result<()> {
        self.transition(JobState::Ready)?;
        if size.is_some() {
            self.size = size;
        }
        Ok(())
    }

    pub fn start(&mut self, now: i64) -> Result<()> {
        self.transition(JobState::InProgress { started_at: now })
    }

    pub fn finish(&mut self, now: i64) -> Result<()> {
        self.transition(JobState::Finished { finished_at: now })
    }

    pub fn fail(&mut self, error: impl Into<String>) -> Result<()> {
        self.transition(JobState::Failed {
            error: error.into(),
        })
    }

    fn transition(&mut self, to: JobState) -> Result<()> {
        validate_transition(&self.state, &to)?;
        self.state = to;
        Ok(())
    }
}

/// Check that `from → to` is an edge of the job state machine.
pub fn validate_transition(from: &JobState, to: &JobState) -> Result<()> {
    let valid = match (from, to) {
        (JobState::Requested, JobState::Transcoding) => true,
        (JobState::Requested, JobState::Ready) => true,
        (JobState::Transcoding, JobState::Ready) => true,
        (JobState::Ready, JobState::InProgress { .. }) => true,
        (JobState::InProgress { .. }, JobState::Finished { .. }) => true,

        // Terminal states cannot transition
        (JobState::Finished { .. }, _) => false,
        (JobState::Failed { .. }, _) => false,

        // Any live job can fail
        (_, JobState::Failed { .. }) => true,

        _ => false,
    };

    if !valid {
        return Err(SyncError::InvalidStateTransition {
            from: from.as_str().to_string(),
            to: to.as_str().to_string(),
            reason: format!("Cannot transition from {} to {}", from, to),
        });
    }

    Ok(())
}

// ============================================================================
// Job Table
// ============================================================================

/// Read-only view of a job for snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobView {
    pub id: JobId,
    pub root: String,
    pub path: String,
    pub size: Option<u64>,
    pub bytes: u64,
    #[serde(flatten)]
    pub state: JobState,
}

/// The jobs of one connection, ordered by id.
#[derive(Debug, Default)]
pub struct JobTable {
    jobs: BTreeMap<JobId, TransferJob>,
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, job: TransferJob) {
        self.jobs.insert(job.id, job);
    }

    pub fn contains(&self, id: JobId) -> bool {
        self.jobs.contains_key(&id)
    }

    pub fn get(&self, id: JobId) -> Option<&TransferJob> {
        self.jobs.get(&id)
    }

    /// Look up a job for mutation.
    pub fn get_mut(&mut self, id: JobId) -> Result<&mut TransferJob> {
        self.jobs
            .get_mut(&id)
            .ok_or(SyncError::JobNotFound { job_id: id.0 })
    }

    /// Fail every non-terminal job with `cause`. Returns the ids that changed.
    pub fn fail_all_active(&mut self, cause: &str) -> Vec<JobId> {
        self.jobs
            .values_mut()
            .filter(|job| !job.state.is_terminal())
            .filter_map(|job| job.fail(cause).ok().map(|_| job.id))
            .collect()
    }

    /// Jobs that have not reached a terminal state.
    pub fn active_count(&self) -> usize {
        self.jobs
            .values()
            .filter(|job| !job.state.is_terminal())
            .count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TransferJob> {
        self.jobs.values()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn views(&self) -> Vec<JobView> {
        self.jobs
            .values()
            .map(|job| JobView {
                id: job.id,
                root: job.item.root.clone(),
                path: job.item.path.clone(),
                size: job.size,
                bytes: job.bytes.get(),
                state: job.state.clone(),
            })
            .collect()
    }
}
