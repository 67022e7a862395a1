//! File System Access Implementation using Tokio

use async_trait::async_trait;
use bridge_traits::{
    error::{BridgeError, Result},
    storage::{FileMetadata, FileSystemAccess, ScannedFile, StagedFile},
    transport::ByteReader,
};
use sha2::{Digest, Sha256};
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

/// Hash algorithm name recorded alongside every scanned file.
pub const HASH_KIND: &str = "sha256";

const STAGING_SUFFIX: &str = "part";
const HASH_CHUNK_SIZE: usize = 64 * 1024;

/// Tokio-based file system implementation
///
/// Provides async file I/O operations using:
/// - `tokio::fs` for async operations
/// - `sha2` for content hashing during scans
/// - Platform-specific app directories
pub struct TokioFileSystem {
    cache_dir: PathBuf,
    data_dir: PathBuf,
}

impl TokioFileSystem {
    /// Create a new file system accessor with default directories
    pub fn new() -> Self {
        let cache_dir = dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("musync");

        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| {
                dirs::home_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join(".local")
                    .join("share")
            })
            .join("musync");

        Self {
            cache_dir,
            data_dir,
        }
    }

    /// Create a new file system accessor with custom directories
    pub fn with_directories(cache_dir: PathBuf, data_dir: PathBuf) -> Self {
        Self {
            cache_dir,
            data_dir,
        }
    }

    /// Convert std::io::Error to BridgeError
    fn map_io_error(e: io::Error) -> BridgeError {
        BridgeError::Io(e)
    }

    /// Staging path for a destination: `song.flac` becomes `song.flac.part`.
    pub fn staging_path_for(destination: &Path) -> PathBuf {
        let mut name = destination
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".");
        name.push(STAGING_SUFFIX);
        destination.with_file_name(name)
    }

    async fn hash_file(path: &Path) -> Result<(u64, Vec<u8>)> {
        let mut file = fs::File::open(path).await.map_err(Self::map_io_error)?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; HASH_CHUNK_SIZE];
        let mut size = 0u64;

        loop {
            let n = file.read(&mut buf).await.map_err(Self::map_io_error)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            size += n as u64;
        }

        Ok((size, hasher.finalize().to_vec()))
    }

    fn has_extension(path: &Path, extensions: &[String]) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|ext| extensions.iter().any(|want| want.eq_ignore_ascii_case(ext)))
            .unwrap_or(false)
    }

    fn relative_path(root: &Path, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(root).ok()?;
        let parts: Vec<&str> = rel
            .components()
            .map(|c| c.as_os_str().to_str())
            .collect::<Option<Vec<_>>>()?;
        Some(parts.join("/"))
    }
}

impl Default for TokioFileSystem {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FileSystemAccess for TokioFileSystem {
    async fn get_cache_directory(&self) -> Result<PathBuf> {
        if !self.cache_dir.exists() {
            fs::create_dir_all(&self.cache_dir)
                .await
                .map_err(Self::map_io_error)?;
            debug!(path = ?self.cache_dir, "Created cache directory");
        }
        Ok(self.cache_dir.clone())
    }

    async fn get_data_directory(&self) -> Result<PathBuf> {
        if !self.data_dir.exists() {
            fs::create_dir_all(&self.data_dir)
                .await
                .map_err(Self::map_io_error)?;
            debug!(path = ?self.data_dir, "Created data directory");
        }
        Ok(self.data_dir.clone())
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        fs::try_exists(path).await.map_err(Self::map_io_error)
    }

    async fn metadata(&self, path: &Path) -> Result<FileMetadata> {
        let metadata = fs::metadata(path).await.map_err(Self::map_io_error)?;

        Ok(FileMetadata {
            size: metadata.len(),
            modified_at: metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64),
            is_directory: metadata.is_dir(),
        })
    }

    async fn canonicalize(&self, path: &Path) -> Result<PathBuf> {
        fs::canonicalize(path).await.map_err(Self::map_io_error)
    }

    async fn create_dir_all(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path).await.map_err(Self::map_io_error)?;
        debug!(path = ?path, "Created directory");
        Ok(())
    }

    async fn delete_file(&self, path: &Path) -> Result<()> {
        match fs::remove_file(path).await {
            Ok(()) => {
                debug!(path = ?path, "Deleted file");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Self::map_io_error(e)),
        }
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        fs::rename(from, to).await.map_err(Self::map_io_error)
    }

    async fn list_directory(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let mut entries = Vec::new();
        let mut read_dir = fs::read_dir(path).await.map_err(Self::map_io_error)?;

        while let Some(entry) = read_dir.next_entry().await.map_err(Self::map_io_error)? {
            entries.push(entry.path());
        }

        debug!(path = ?path, count = entries.len(), "Listed directory");
        Ok(entries)
    }

    async fn open_read_stream(&self, path: &Path) -> Result<ByteReader> {
        let file = fs::File::open(path).await.map_err(Self::map_io_error)?;
        debug!(path = ?path, "Opened file for reading");
        Ok(Box::new(file))
    }

    async fn scan_root(&self, root: &Path, extensions: &[String]) -> Result<Vec<ScannedFile>> {
        let mut files = Vec::new();
        let mut pending = vec![root.to_path_buf()];

        while let Some(dir) = pending.pop() {
            let mut read_dir = fs::read_dir(&dir).await.map_err(Self::map_io_error)?;

            while let Some(entry) = read_dir.next_entry().await.map_err(Self::map_io_error)? {
                let path = entry.path();
                let file_type = match entry.file_type().await {
                    Ok(t) => t,
                    Err(e) => {
                        warn!(path = ?path, error = %e, "Skipping unreadable entry");
                        continue;
                    }
                };

                if file_type.is_dir() {
                    pending.push(path);
                    continue;
                }

                if !Self::has_extension(&path, extensions) {
                    continue;
                }

                let Some(relative_path) = Self::relative_path(root, &path) else {
                    warn!(path = ?path, "Skipping file with non UTF-8 path");
                    continue;
                };

                match Self::hash_file(&path).await {
                    Ok((size, hash)) => files.push(ScannedFile {
                        relative_path,
                        size,
                        hash_kind: HASH_KIND.to_string(),
                        hash,
                    }),
                    Err(e) => warn!(path = ?path, error = %e, "Failed to hash file"),
                }
            }
        }

        files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        debug!(root = ?root, count = files.len(), "Scanned root");
        Ok(files)
    }

    async fn create_staged(&self, destination: &Path) -> Result<Box<dyn StagedFile>> {
        if let Some(parent) = destination.parent() {
            self.create_dir_all(parent).await?;
        }

        let staging = Self::staging_path_for(destination);
        let file = fs::File::create(&staging)
            .await
            .map_err(Self::map_io_error)?;
        debug!(path = ?staging, "Opened staging file");

        Ok(Box::new(TokioStagedFile {
            file,
            staging,
            destination: destination.to_path_buf(),
        }))
    }
}

/// Staged write backed by a sibling `.part` file.
struct TokioStagedFile {
    file: fs::File,
    staging: PathBuf,
    destination: PathBuf,
}

impl AsyncWrite for TokioStagedFile {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.file).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.file).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.file).poll_shutdown(cx)
    }
}

#[async_trait]
impl StagedFile for TokioStagedFile {
    fn staging_path(&self) -> &Path {
        &self.staging
    }

    fn destination(&self) -> &Path {
        &self.destination
    }

    async fn commit(mut self: Box<Self>) -> Result<PathBuf> {
        self.file.flush().await.map_err(TokioFileSystem::map_io_error)?;
        self.file
            .sync_all()
            .await
            .map_err(TokioFileSystem::map_io_error)?;

        let TokioStagedFile {
            file,
            staging,
            destination,
        } = *self;
        drop(file);

        fs::rename(&staging, &destination)
            .await
            .map_err(TokioFileSystem::map_io_error)?;
        debug!(path = ?destination, "Committed staged file");
        Ok(destination)
    }

    async fn discard(self: Box<Self>) -> Result<()> {
        let TokioStagedFile { file, staging, .. } = *self;
        drop(file);

        match fs::remove_file(&staging).await {
            Ok(()) => {
                debug!(path = ?staging, "Discarded staged file");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(TokioFileSystem::map_io_error(e)),
        }
    }
}
