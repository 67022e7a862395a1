//! # Core Configuration Module
//!
//! Provides configuration management for the Musync core.
//!
//! ## Overview
//!
//! The configuration system uses a builder pattern to construct a `CoreConfig`
//! instance that holds all necessary dependencies and settings for the core.
//! It enforces fail-fast validation so a misconfigured core never starts.
//!
//! ## Required Dependencies
//!
//! - `Transport` - Establishes peer sessions; the core cannot do anything without it
//!
//! ## Optional Dependencies (with platform defaults)
//!
//! - `FileSystemAccess` - Scanning and file I/O (desktop default: tokio fs)
//! - `Transcoder` - Audio conversion; without one every file is sent as-is
//! - `Clock` - Time source (default: system clock)
//!
//! ## Usage
//!
//! ```ignore
//! use core_runtime::config::{CoreConfig, TranscodePolicy};
//!
//! let config = CoreConfig::builder()
//!     .database_path("/path/to/musync.db")
//!     .cache_dir("/path/to/cache")
//!     .display_name("Living room")
//!     .transport(transport)
//!     .transcode_policy(TranscodePolicy::Always)
//!     .build()?;
//! ```
//!
//! ## Error Handling
//!
//! ```should_panic
//! use core_runtime::config::CoreConfig;
//!
//! // No transport injected
//! let config = CoreConfig::builder()
//!     .database_path("/path/to/musync.db")
//!     .cache_dir("/path/to/cache")
//!     .build()
//!     .expect("Should fail - missing transport");
//! ```

use crate::error::{Error, Result};
use bridge_traits::{Clock, FileSystemAccess, SystemClock, TranscodeTarget, Transcoder, Transport};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Extensions indexed by a library scan.
pub const DEFAULT_SCAN_EXTENSIONS: &[&str] = &["mp3", "flac", "ogg", "m4a", "wav", "aif", "aiff"];

/// Extensions a receiving device is assumed to play without conversion.
pub const DEFAULT_NATIVE_EXTENSIONS: &[&str] = &["mp3", "ogg", "opus", "m4a", "aac"];

pub const DEFAULT_MAX_CONCURRENT_TRANSFERS: usize = 4;
pub const DEFAULT_TRANSCODE_WORKERS: usize = 2;
pub const DEFAULT_TRANSCODE_QUEUE_CAPACITY: usize = 64;
pub const DEFAULT_PROGRESS_INTERVAL_MS: u64 = 200;
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 256;

/// When the transcode gate converts files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscodePolicy {
    /// Convert a file only when a transfer job asks for it.
    #[default]
    IfRequested,
    /// Convert every local file that needs it as soon as it is indexed.
    Always,
}

impl TranscodePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            TranscodePolicy::IfRequested => "if_requested",
            TranscodePolicy::Always => "always",
        }
    }
}

/// Target profile for transcoded artifacts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscodeProfile {
    /// What the encoder produces. `target.name` is part of the cache key.
    pub target: TranscodeTarget,

    /// Source extensions sent untouched (compared case-insensitively).
    pub native_extensions: Vec<String>,

    /// Expected output size as a fraction of the source size, used to
    /// advertise an estimated size before the artifact exists.
    pub size_ratio: f64,
}

impl TranscodeProfile {
    /// True when files with this extension need no conversion.
    pub fn is_native(&self, extension: &str) -> bool {
        self.native_extensions
            .iter()
            .any(|e| e.eq_ignore_ascii_case(extension))
    }

    /// Estimated artifact size for a source of `source_size` bytes.
    pub fn estimate_size(&self, source_size: u64) -> u64 {
        (source_size as f64 * self.size_ratio).round() as u64
    }
}

impl Default for TranscodeProfile {
    fn default() -> Self {
        Self {
            target: TranscodeTarget::default(),
            native_extensions: DEFAULT_NATIVE_EXTENSIONS
                .iter()
                .map(|e| e.to_string())
                .collect(),
            size_ratio: 0.15,
        }
    }
}

/// Transcode gate settings.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscodeConfig {
    pub policy: TranscodePolicy,
    pub profile: TranscodeProfile,
    /// Number of concurrent encodes.
    pub workers: usize,
    /// Encodes that may wait for a free worker before requests back up.
    pub queue_capacity: usize,
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            policy: TranscodePolicy::default(),
            profile: TranscodeProfile::default(),
            workers: DEFAULT_TRANSCODE_WORKERS,
            queue_capacity: DEFAULT_TRANSCODE_QUEUE_CAPACITY,
        }
    }
}

/// Transfer scheduler settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferConfig {
    /// Streams a single session may run at once.
    pub max_concurrent_transfers: usize,
    /// Minimum spacing between progress events for one job.
    pub progress_interval_ms: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_concurrent_transfers: DEFAULT_MAX_CONCURRENT_TRANSFERS,
            progress_interval_ms: DEFAULT_PROGRESS_INTERVAL_MS,
        }
    }
}

/// Core configuration for the Musync core.
///
/// This struct holds all dependencies and settings required to initialize
/// the core. Use [`CoreConfigBuilder`] to construct instances.
#[derive(Clone)]
pub struct CoreConfig {
    /// Path to the SQLite database file
    pub database_path: PathBuf,

    /// Directory for cached files; transcoded artifacts live in `transcodes/`
    pub cache_dir: PathBuf,

    /// Name announced to peers during the identify exchange
    pub display_name: String,

    /// Peer transport (required)
    pub transport: Arc<dyn Transport>,

    /// File system access abstraction (desktop default)
    pub file_system: Arc<dyn FileSystemAccess>,

    /// Audio encoder (optional)
    pub transcoder: Option<Arc<dyn Transcoder>>,

    /// Time source
    pub clock: Arc<dyn Clock>,

    pub transfer: TransferConfig,

    pub transcode: TranscodeConfig,

    /// Extensions indexed by library scans, lowercase without the dot
    pub scan_extensions: Vec<String>,

    /// Capacity of the core event bus
    pub event_buffer_size: usize,
}

impl std::fmt::Debug for CoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreConfig")
            .field("database_path", &self.database_path)
            .field("cache_dir", &self.cache_dir)
            .field("display_name", &self.display_name)
            .field("transport", &"Transport { ... }")
            .field("file_system", &"FileSystemAccess { ... }")
            .field(
                "transcoder",
                &self.transcoder.as_ref().map(|t| t.name().to_string()),
            )
            .field("transfer", &self.transfer)
            .field("transcode", &self.transcode)
            .field("scan_extensions", &self.scan_extensions)
            .field("event_buffer_size", &self.event_buffer_size)
            .finish()
    }
}

impl CoreConfig {
    /// Creates a new builder for constructing a `CoreConfig`.
    pub fn builder() -> CoreConfigBuilder {
        CoreConfigBuilder::default()
    }

    /// Directory holding transcoded artifacts.
    pub fn transcode_dir(&self) -> PathBuf {
        self.cache_dir.join("transcodes")
    }

    /// Validates the configuration and returns an error if invalid.
    ///
    /// This checks:
    /// - Paths are not empty
    /// - Display name is non-empty and at most 64 characters
    /// - Concurrency bounds are within sane limits
    /// - At least one extension is scanned
    pub fn validate(&self) -> Result<()> {
        if self.database_path.as_os_str().is_empty() {
            return Err(Error::Config("Database path cannot be empty".to_string()));
        }

        if self.cache_dir.as_os_str().is_empty() {
            return Err(Error::Config("Cache directory cannot be empty".to_string()));
        }

        let name = self.display_name.trim();
        if name.is_empty() {
            return Err(Error::Config("Display name cannot be empty".to_string()));
        }
        if name.chars().count() > 64 {
            return Err(Error::Config(
                "Display name exceeds maximum of 64 characters".to_string(),
            ));
        }

        if self.transfer.max_concurrent_transfers == 0
            || self.transfer.max_concurrent_transfers > 64
        {
            return Err(Error::Config(
                "Max concurrent transfers must be between 1 and 64".to_string(),
            ));
        }

        if self.transcode.workers == 0 || self.transcode.workers > 32 {
            return Err(Error::Config(
                "Transcode workers must be between 1 and 32".to_string(),
            ));
        }

        if self.transcode.queue_capacity == 0 {
            return Err(Error::Config(
                "Transcode queue capacity must be greater than 0".to_string(),
            ));
        }

        let ratio = self.transcode.profile.size_ratio;
        if !(ratio > 0.0 && ratio <= 4.0) {
            return Err(Error::Config(
                "Transcode size ratio must be in (0, 4]".to_string(),
            ));
        }

        if self.transcode.profile.target.extension.is_empty()
            || self.transcode.profile.target.name.is_empty()
        {
            return Err(Error::Config(
                "Transcode profile needs a name and an output extension".to_string(),
            ));
        }

        if self.scan_extensions.is_empty() {
            return Err(Error::Config(
                "At least one scan extension is required".to_string(),
            ));
        }

        if self.event_buffer_size == 0 {
            return Err(Error::Config(
                "Event buffer size must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

fn transport_missing_error() -> Error {
    Error::CapabilityMissing {
        capability: "Transport".to_string(),
        message: "A peer transport is required to reach other devices. \
                 Inject one with .transport(); tests can use bridge_desktop::LoopbackNetwork."
            .to_string(),
    }
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_file_system(
    _database_path: &Path,
    _cache_dir: &Path,
) -> Result<Arc<dyn FileSystemAccess>> {
    Err(Error::CapabilityMissing {
        capability: "FileSystemAccess".to_string(),
        message: "FileSystemAccess implementation is required for library scans and transfers. \
                 Desktop: ensure the 'desktop-shims' feature is enabled to use the default TokioFileSystem. \
                 Other hosts: inject a platform file system adapter."
            .to_string(),
    })
}

#[cfg(feature = "desktop-shims")]
fn provide_default_file_system(
    database_path: &Path,
    cache_dir: &Path,
) -> Result<Arc<dyn FileSystemAccess>> {
    use bridge_desktop::TokioFileSystem;

    let data_dir = database_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let fs: Arc<dyn FileSystemAccess> = Arc::new(TokioFileSystem::with_directories(
        cache_dir.to_path_buf(),
        data_dir,
    ));
    Ok(fs)
}

/// Builder for constructing a [`CoreConfig`].
#[derive(Default)]
pub struct CoreConfigBuilder {
    database_path: Option<PathBuf>,
    cache_dir: Option<PathBuf>,
    display_name: Option<String>,
    transport: Option<Arc<dyn Transport>>,
    file_system: Option<Arc<dyn FileSystemAccess>>,
    transcoder: Option<Arc<dyn Transcoder>>,
    clock: Option<Arc<dyn Clock>>,
    transfer: TransferConfig,
    transcode: TranscodeConfig,
    scan_extensions: Option<Vec<String>>,
    event_buffer_size: Option<usize>,
}

impl CoreConfigBuilder {
    /// Sets the database path.
    ///
    /// # Examples
    ///
    /// ```
    /// use core_runtime::config::CoreConfig;
    ///
    /// let builder = CoreConfig::builder()
    ///     .database_path("/path/to/musync.db");
    /// ```
    pub fn database_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.database_path = Some(path.into());
        self
    }

    /// Sets the cache directory.
    pub fn cache_dir<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.cache_dir = Some(path.into());
        self
    }

    /// Sets the name announced to peers.
    ///
    /// Default: `musync-<first ten characters of the node id>`
    pub fn display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Injects the peer transport.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Injects a file system implementation.
    pub fn file_system(mut self, fs: Arc<dyn FileSystemAccess>) -> Self {
        self.file_system = Some(fs);
        self
    }

    /// Injects an audio encoder.
    pub fn transcoder(mut self, transcoder: Arc<dyn Transcoder>) -> Self {
        self.transcoder = Some(transcoder);
        self
    }

    /// Injects a time source.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Sets how many file streams one session may run at once.
    ///
    /// Default: 4
    pub fn max_concurrent_transfers(mut self, max: usize) -> Self {
        self.transfer.max_concurrent_transfers = max;
        self
    }

    /// Sets the minimum spacing between progress events for one job.
    ///
    /// Default: 200 ms
    pub fn progress_interval_ms(mut self, interval_ms: u64) -> Self {
        self.transfer.progress_interval_ms = interval_ms;
        self
    }

    /// Sets the initial transcode policy. It can be changed at runtime.
    pub fn transcode_policy(mut self, policy: TranscodePolicy) -> Self {
        self.transcode.policy = policy;
        self
    }

    pub fn transcode_profile(mut self, profile: TranscodeProfile) -> Self {
        self.transcode.profile = profile;
        self
    }

    /// Sets the number of concurrent encodes.
    ///
    /// Default: 2
    pub fn transcode_workers(mut self, workers: usize) -> Self {
        self.transcode.workers = workers;
        self
    }

    /// Default: 64
    pub fn transcode_queue_capacity(mut self, capacity: usize) -> Self {
        self.transcode.queue_capacity = capacity;
        self
    }

    /// Replaces the set of scanned extensions.
    pub fn scan_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scan_extensions = Some(
            extensions
                .into_iter()
                .map(|e| e.into().trim_start_matches('.').to_ascii_lowercase())
                .collect(),
        );
        self
    }

    /// Default: 256
    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.event_buffer_size = Some(size);
        self
    }

    /// Builds the final `CoreConfig` instance.
    ///
    /// Returns an error if:
    /// - Required paths are missing
    /// - No transport was injected
    /// - No file system is available for this build
    /// - Configuration values are invalid
    pub fn build(self) -> Result<CoreConfig> {
        let database_path = self.database_path.ok_or_else(|| {
            Error::Config("Database path is required. Use .database_path() to set it.".to_string())
        })?;

        let cache_dir = self.cache_dir.ok_or_else(|| {
            Error::Config("Cache directory is required. Use .cache_dir() to set it.".to_string())
        })?;

        let transport = self.transport.ok_or_else(transport_missing_error)?;

        let file_system = match self.file_system {
            Some(fs) => fs,
            None => provide_default_file_system(&database_path, &cache_dir)?,
        };

        let display_name = self
            .display_name
            .unwrap_or_else(|| format!("musync-{}", transport.local_node_id().short()));

        let config = CoreConfig {
            database_path,
            cache_dir,
            display_name,
            transport,
            file_system,
            transcoder: self.transcoder,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            transfer: self.transfer,
            transcode: self.transcode,
            scan_extensions: self.scan_extensions.unwrap_or_else(|| {
                DEFAULT_SCAN_EXTENSIONS
                    .iter()
                    .map(|e| e.to_string())
                    .collect()
            }),
            event_buffer_size: self.event_buffer_size.unwrap_or(DEFAULT_EVENT_BUFFER_SIZE),
        };

        config.validate()?;

        Ok(config)
    }
}
