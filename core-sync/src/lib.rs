//! # Peer Sync Module
//!
//! Moves music files between nodes over authenticated peer sessions.
//!
//! ## Overview
//!
//! A node serves its library to other nodes and downloads from theirs:
//! - Incoming connections wait for the owner's decision unless the node is
//!   trusted
//! - An admitted peer receives the local index once
//! - The peer requests files; each becomes a transfer job
//! - Files in formats a peer should not receive are converted first
//!
//! ## Components
//!
//! - **Admission** (`admission`): Connection registry, owner decisions and teardown
//! - **Transfer Jobs** (`job`): Per-file job state machine with validated transitions
//! - **Protocol** (`protocol`): Control messages and framing
//! - **Transcode Gate** (`transcode`): Deduplicated, cached format conversion
//! - **Sync Coordinator** (`coordinator`): Accept loop and owner-facing operations

pub mod admission;
mod client;
mod context;
pub mod coordinator;
pub mod error;
pub mod job;
pub mod protocol;
mod server;
pub mod transcode;
pub mod transfer;

pub use admission::{Admission, AdmissionManager, Connection, ConnectionState, ConnectionView};
pub use client::Selection;
pub use coordinator::SyncCoordinator;
pub use error::{Result, SyncError};
pub use job::{ByteCounter, JobId, JobIdAllocator, JobState, JobView, TransferJob};
pub use transcode::{ArtifactState, CacheKey, GateDecision, TranscodeCounters, TranscodeGate};
