//! # Desktop Bridge Implementations
//!
//! Default implementations of bridge traits for desktop platforms
//! (macOS, Windows, Linux).
//!
//! ## Overview
//!
//! - `FileSystemAccess` using `tokio::fs`, hashing with `sha2`
//! - `Transcoder` by shelling out to an ffmpeg-compatible encoder
//! - `Transport` as an in-process loopback network, for tests and local demos
//!
//! Real peer-to-peer transports are injected by the host; this crate does not
//! ship one.
//!
//! ## Usage
//!
//! ```ignore
//! use bridge_desktop::{CommandTranscoder, LoopbackNetwork, TokioFileSystem};
//!
//! #[tokio::main]
//! async fn main() {
//!     let network = LoopbackNetwork::new();
//!     let transport = network.endpoint("laptop");
//!     let fs = TokioFileSystem::new();
//!     let transcoder = CommandTranscoder::new();
//!
//!     // Use in core configuration
//! }
//! ```

mod filesystem;
mod network;
mod transcoder;

pub use filesystem::{TokioFileSystem, HASH_KIND};
pub use network::{LoopbackNetwork, LoopbackTransport};
pub use transcoder::CommandTranscoder;
