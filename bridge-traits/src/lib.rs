//! # Host Bridge Traits
//!
//! Platform abstraction traits that must be implemented by each host.
//!
//! ## Overview
//!
//! This crate defines the contract between the sync core and what the host
//! owns: peer transport, filesystem and audio encoder. Each trait is a
//! capability the core requires but that a host provides.
//!
//! ## Traits
//!
//! ### Networking
//! - [`Transport`](transport::Transport) - Establishes authenticated peer sessions
//! - [`PeerSession`](transport::PeerSession) - One connection to a remote node, carrying bidirectional streams
//!
//! ### Storage
//! - [`FileSystemAccess`](storage::FileSystemAccess) - Scanning, hashing, streaming reads and staged writes
//! - [`StagedFile`](storage::StagedFile) - A destination file that only becomes visible on commit
//!
//! ### Media
//! - [`Transcoder`](transcode::Transcoder) - Converts one audio file into a target profile
//!
//! ### Utilities
//! - [`Clock`](time::Clock) - Time source for deterministic testing
//! - [`LoggerSink`](time::LoggerSink) - Forward structured logs to host logging
//!
//! ## Fail-Fast Strategy
//!
//! The core fails fast with descriptive errors when a required capability is
//! missing:
//!
//! ```ignore
//! let transport = builder.transport
//!     .ok_or_else(|| Error::CapabilityMissing {
//!         capability: "Transport".to_string(),
//!         message: "No peer transport provided. Inject one with .transport().".to_string(),
//!     })?;
//! ```
//!
//! ## Error Handling
//!
//! All bridge traits use [`BridgeError`](error::BridgeError). Implementations
//! should convert platform errors into it and include context such as the
//! path or peer involved.
//!
//! ## Thread Safety
//!
//! All bridge traits require `Send + Sync` so they can be shared across async
//! tasks behind an `Arc`.

pub mod error;
pub mod storage;
pub mod time;
pub mod transcode;
pub mod transport;

pub use error::BridgeError;

pub use storage::{FileMetadata, FileSystemAccess, ScannedFile, StagedFile};
pub use time::{Clock, LogEntry, LogLevel, LoggerSink, SystemClock};
pub use transcode::{TranscodeTarget, Transcoder};
pub use transport::{
    BiStream, ByteReader, ByteWriter, ConnectionInfo, ConnectionKind, NodeId, PeerSession,
    Transport,
};
