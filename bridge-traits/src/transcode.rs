//! Audio Transcoding Abstraction
//!
//! The core decides *when* a file is transcoded and where the result is
//! cached. How the audio is actually converted is the host's business.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::Result;

/// Output format a transcoder should produce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscodeTarget {
    /// Profile name, part of the cache key (e.g. `opus-128`).
    pub name: String,
    /// File extension of the produced artifact, without the dot.
    pub extension: String,
    /// Audio codec the encoder should use.
    pub codec: String,
    pub bitrate_kbps: u32,
}

impl Default for TranscodeTarget {
    fn default() -> Self {
        Self {
            name: "opus-128".to_string(),
            extension: "ogg".to_string(),
            codec: "libopus".to_string(),
            bitrate_kbps: 128,
        }
    }
}

/// Converts a single audio file.
///
/// Implementations write to exactly `output` and nothing else. On error the
/// caller deletes whatever was written there.
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Human-readable name for logs.
    fn name(&self) -> &str;

    async fn transcode(&self, input: &Path, output: &Path, target: &TranscodeTarget)
        -> Result<()>;
}
