//! Core event bus.
//!
//! Every component reports what it did as a [`CoreEvent`] on one
//! `tokio::sync::broadcast` channel. The service's snapshot publisher is the
//! main subscriber; hosts may subscribe too.
//!
//! ```text
//! admission ─┐
//! scheduler ─┼─ emit ─> EventBus ─ subscribe ─> snapshot publisher
//! transcode ─┘                              └─> host subscriber
//! ```
//!
//! ```rust
//! use core_runtime::events::{ConnectionDirection, ConnectionEvent, CoreEvent, EventBus};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let event_bus = EventBus::new(100);
//! let mut subscriber = event_bus.subscribe();
//!
//! event_bus
//!     .emit(CoreEvent::Connection(ConnectionEvent::Pending {
//!         node_id: "a1b2c3".to_string(),
//!         name: "Laptop".to_string(),
//!         direction: ConnectionDirection::Incoming,
//!     }))
//!     .ok();
//!
//! let event = subscriber.recv().await.unwrap();
//! assert_eq!(event.description(), "Connection awaiting owner decision");
//! # }
//! ```
//!
//! A subscriber that falls behind gets `RecvError::Lagged(n)`. Consumers that
//! only need current state should treat that as "something changed" and
//! re-read, not try to replay.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;

pub use tokio::sync::broadcast::error::{RecvError, SendError};
pub use tokio::sync::broadcast::Receiver;

/// Top-level event enum encompassing all event categories.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    /// Peer connection lifecycle
    Connection(ConnectionEvent),
    /// Per-file transfer jobs
    Transfer(TransferEvent),
    /// Library roots, scans and trust
    Library(LibraryEvent),
    /// Transcode gate activity
    Transcode(TranscodeEvent),
}

impl CoreEvent {
    /// Short fixed text for logs.
    pub fn description(&self) -> &str {
        match self {
            CoreEvent::Connection(e) => e.description(),
            CoreEvent::Transfer(e) => e.description(),
            CoreEvent::Library(e) => e.description(),
            CoreEvent::Transcode(e) => e.description(),
        }
    }

    pub fn severity(&self) -> EventSeverity {
        match self {
            CoreEvent::Connection(ConnectionEvent::Failed { .. }) => EventSeverity::Error,
            CoreEvent::Transfer(TransferEvent::Failed { .. }) => EventSeverity::Error,
            CoreEvent::Transcode(TranscodeEvent::Failed { .. }) => EventSeverity::Error,
            CoreEvent::Connection(ConnectionEvent::Denied { .. }) => EventSeverity::Warning,
            CoreEvent::Library(LibraryEvent::ScanError { .. }) => EventSeverity::Warning,
            CoreEvent::Connection(ConnectionEvent::Accepted { .. }) => EventSeverity::Info,
            CoreEvent::Transfer(TransferEvent::Finished { .. }) => EventSeverity::Info,
            CoreEvent::Library(LibraryEvent::ScanCompleted { .. }) => EventSeverity::Info,
            _ => EventSeverity::Debug,
        }
    }
}

/// How loudly an event is logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventSeverity {
    Debug,
    Info,
    Warning,
    Error,
}

/// Which side opened a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionDirection {
    /// The remote node connected to us; we serve our index.
    Incoming,
    /// We connected to the remote node; we download from it.
    Outgoing,
}

impl ConnectionDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionDirection::Incoming => "incoming",
            ConnectionDirection::Outgoing => "outgoing",
        }
    }
}

// ============================================================================
// Connection Events
// ============================================================================

/// Events related to peer connections and admission.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum ConnectionEvent {
    /// Identity exchanged; the owner has to accept or deny.
    Pending {
        node_id: String,
        name: String,
        direction: ConnectionDirection,
    },
    /// Connection admitted.
    Accepted {
        node_id: String,
        name: String,
        direction: ConnectionDirection,
        /// Admitted automatically because the node is trusted.
        trusted: bool,
    },
    /// Owner (or the remote owner) refused the connection.
    Denied {
        node_id: String,
        direction: ConnectionDirection,
    },
    /// Remote index received on an outgoing connection.
    IndexReceived { node_id: String, items: u64 },
    /// Connection torn down.
    Closed {
        node_id: String,
        direction: ConnectionDirection,
        reason: String,
    },
    /// Session-level failure before or during admission.
    Failed {
        node_id: String,
        direction: ConnectionDirection,
        message: String,
    },
}

impl ConnectionEvent {
    fn description(&self) -> &str {
        match self {
            ConnectionEvent::Pending { .. } => "Connection awaiting owner decision",
            ConnectionEvent::Accepted { .. } => "Connection accepted",
            ConnectionEvent::Denied { .. } => "Connection denied",
            ConnectionEvent::IndexReceived { .. } => "Remote index received",
            ConnectionEvent::Closed { .. } => "Connection closed",
            ConnectionEvent::Failed { .. } => "Connection failed",
        }
    }
}

// ============================================================================
// Transfer Events
// ============================================================================

/// Events related to per-file transfer jobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum TransferEvent {
    /// Jobs created for a selection.
    JobsCreated {
        node_id: String,
        direction: ConnectionDirection,
        count: u64,
    },
    /// Job moved to a non-terminal state (`transcoding`, `ready`, `in_progress`).
    StateChanged {
        node_id: String,
        direction: ConnectionDirection,
        job_id: u64,
        state: String,
    },
    /// Bytes moved on an in-progress job. Throttled per job.
    Progress {
        node_id: String,
        direction: ConnectionDirection,
        job_id: u64,
        bytes: u64,
        total: Option<u64>,
    },
    /// Job finished successfully.
    Finished {
        node_id: String,
        direction: ConnectionDirection,
        job_id: u64,
        bytes: u64,
    },
    /// Job failed. The message is kept for display.
    Failed {
        node_id: String,
        direction: ConnectionDirection,
        job_id: u64,
        message: String,
    },
}

impl TransferEvent {
    fn description(&self) -> &str {
        match self {
            TransferEvent::JobsCreated { .. } => "Transfer jobs created",
            TransferEvent::StateChanged { .. } => "Transfer job state changed",
            TransferEvent::Progress { .. } => "Transfer in progress",
            TransferEvent::Finished { .. } => "Transfer finished",
            TransferEvent::Failed { .. } => "Transfer failed",
        }
    }
}

// ============================================================================
// Library Events
// ============================================================================

/// Events related to library roots, scanning and trust.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum LibraryEvent {
    RootAdded { name: String },
    RootRemoved { name: String },
    ScanStarted { roots: u64 },
    ScanCompleted {
        roots: u64,
        files: u64,
        duration_ms: u64,
    },
    /// One root could not be scanned; other roots are unaffected.
    ScanError { root: String, message: String },
    TrustChanged { node_id: String, trusted: bool },
    DatabaseReset,
}

impl LibraryEvent {
    fn description(&self) -> &str {
        match self {
            LibraryEvent::RootAdded { .. } => "Library root added",
            LibraryEvent::RootRemoved { .. } => "Library root removed",
            LibraryEvent::ScanStarted { .. } => "Library scan started",
            LibraryEvent::ScanCompleted { .. } => "Library scan completed",
            LibraryEvent::ScanError { .. } => "Library root could not be scanned",
            LibraryEvent::TrustChanged { .. } => "Trusted nodes changed",
            LibraryEvent::DatabaseReset => "Database reset",
        }
    }
}

// ============================================================================
// Transcode Events
// ============================================================================

/// Events related to the transcode gate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum TranscodeEvent {
    PolicyChanged { policy: String },
    /// Gate counters moved. Carries the new totals.
    CountersChanged {
        waiting: u64,
        queued: u64,
        in_progress: u64,
        ready: u64,
        failed: u64,
    },
    /// Artifact produced for a source hash.
    Finished { hash: String, profile: String },
    Failed {
        hash: String,
        profile: String,
        message: String,
    },
}

impl TranscodeEvent {
    fn description(&self) -> &str {
        match self {
            TranscodeEvent::PolicyChanged { .. } => "Transcode policy changed",
            TranscodeEvent::CountersChanged { .. } => "Transcode counters changed",
            TranscodeEvent::Finished { .. } => "Transcode finished",
            TranscodeEvent::Failed { .. } => "Transcode failed",
        }
    }
}

// ============================================================================
// Event Bus
// ============================================================================

/// Cloneable handle to the broadcast channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Number of receivers reached; an error only means nobody listens.
    pub fn emit(&self, event: CoreEvent) -> Result<usize, SendError<CoreEvent>> {
        self.sender.send(event)
    }

    /// Receiver for events emitted from now on.
    pub fn subscribe(&self) -> Receiver<CoreEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
