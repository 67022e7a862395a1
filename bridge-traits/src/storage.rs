//! Storage and File System Abstractions
//!
//! Provides the filesystem capabilities the sync core needs: walking a
//! library root and hashing what it finds, streaming files out to peers, and
//! writing received files so that a half-written file is never visible at
//! its final path.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWrite;

use crate::error::Result;
use crate::transport::ByteReader;

/// File metadata information
#[derive(Debug, Clone)]
pub struct FileMetadata {
    pub size: u64,
    pub modified_at: Option<i64>,
    pub is_directory: bool,
}

/// One audio file found while scanning a library root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScannedFile {
    /// Path relative to the scanned root, `/`-separated.
    pub relative_path: String,
    pub size: u64,
    /// Name of the content hash algorithm, e.g. `sha256`.
    pub hash_kind: String,
    pub hash: Vec<u8>,
}

/// File system access trait
///
/// # Example
///
/// ```ignore
/// use bridge_traits::storage::FileSystemAccess;
///
/// async fn receive(fs: &dyn FileSystemAccess, dest: &Path, mut body: ByteReader) -> Result<()> {
///     let mut staged = fs.create_staged(dest).await?;
///     tokio::io::copy(&mut body, &mut staged).await?;
///     staged.commit().await?;
///     Ok(())
/// }
/// ```
#[async_trait]
pub trait FileSystemAccess: Send + Sync {
    /// Get the application's cache directory
    ///
    /// Transcoded artifacts live below this directory.
    async fn get_cache_directory(&self) -> Result<PathBuf>;

    /// Get the application's data directory
    ///
    /// The index database lives here.
    async fn get_data_directory(&self) -> Result<PathBuf>;

    /// Check if a file or directory exists
    async fn exists(&self, path: &Path) -> Result<bool>;

    /// Get metadata for a file or directory
    async fn metadata(&self, path: &Path) -> Result<FileMetadata>;

    /// Resolve a path to its absolute, symlink-free form
    async fn canonicalize(&self, path: &Path) -> Result<PathBuf>;

    /// Create a directory and all parent directories if they don't exist
    async fn create_dir_all(&self, path: &Path) -> Result<()>;

    /// Delete a file. Deleting a missing file succeeds.
    async fn delete_file(&self, path: &Path) -> Result<()>;

    /// Rename a file, replacing the destination if it exists
    async fn rename(&self, from: &Path, to: &Path) -> Result<()>;

    /// List all entries in a directory
    async fn list_directory(&self, path: &Path) -> Result<Vec<PathBuf>>;

    /// Open a file for streaming reads
    async fn open_read_stream(&self, path: &Path) -> Result<ByteReader>;

    /// Walk `root` recursively and hash every file whose extension is in
    /// `extensions` (compared case-insensitively).
    ///
    /// Results are sorted by `relative_path` so identical trees always
    /// produce identical output.
    async fn scan_root(&self, root: &Path, extensions: &[String]) -> Result<Vec<ScannedFile>>;

    /// Begin writing `destination` through a staging file.
    ///
    /// Parent directories are created as needed. Nothing appears at
    /// `destination` until [`StagedFile::commit`] succeeds.
    async fn create_staged(&self, destination: &Path) -> Result<Box<dyn StagedFile>>;
}

/// A destination file being written through a staging path.
///
/// Dropping a staged file without committing leaves the staging file behind;
/// callers should `discard` it.
#[async_trait]
pub trait StagedFile: AsyncWrite + Send + Unpin {
    /// Where bytes are currently being written.
    fn staging_path(&self) -> &Path;

    /// Where the file will appear once committed.
    fn destination(&self) -> &Path;

    /// Flush and atomically move the staging file to its destination.
    async fn commit(self: Box<Self>) -> Result<PathBuf>;

    /// Remove the staging file.
    async fn discard(self: Box<Self>) -> Result<()>;
}
