//! Local library facade
//!
//! Ties the root and file repositories to the filesystem bridge: adding and
//! removing roots, rescanning, serving the local index and recording files
//! received from peers.

use crate::db;
use crate::error::{LibraryError, Result};
use crate::index::{build_local_index, RootScanError};
use crate::models::{FileRecord, IndexItem, ItemKey, LibraryRoot};
use crate::repositories::{
    FileRepository, NewFile, RootRepository, SqliteFileRepository, SqliteRootRepository,
};
use bridge_traits::storage::FileSystemAccess;
use bridge_traits::time::Clock;
use bridge_traits::transport::NodeId;
use core_async::sync::Mutex;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, instrument};

/// Summary of one rescan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanReport {
    pub roots: usize,
    pub files: usize,
    pub errors: Vec<RootScanError>,
    pub duration_ms: u64,
}

pub struct Library {
    local_node_id: NodeId,
    pool: SqlitePool,
    roots: Arc<dyn RootRepository>,
    files: Arc<dyn FileRepository>,
    file_system: Arc<dyn FileSystemAccess>,
    clock: Arc<dyn Clock>,
    scan_extensions: Vec<String>,
    // Serialises scans so two rescans never interleave their writes
    scan_lock: Mutex<()>,
}

impl Library {
    pub fn new(
        pool: SqlitePool,
        local_node_id: NodeId,
        file_system: Arc<dyn FileSystemAccess>,
        clock: Arc<dyn Clock>,
        scan_extensions: Vec<String>,
    ) -> Self {
        Self {
            local_node_id,
            roots: Arc::new(SqliteRootRepository::new(pool.clone())),
            files: Arc::new(SqliteFileRepository::new(pool.clone())),
            pool,
            file_system,
            clock,
            scan_extensions,
            scan_lock: Mutex::new(()),
        }
    }

    pub fn local_node_id(&self) -> &NodeId {
        &self.local_node_id
    }

    /// Share a directory under `name`.
    ///
    /// The path is canonicalised first so the same directory reached through
    /// different spellings is detected as a duplicate.
    #[instrument(skip(self, path), fields(root = %name))]
    pub async fn add_root(&self, name: &str, path: &Path) -> Result<LibraryRoot> {
        let name = name.trim();
        let canonical = self.file_system.canonicalize(path).await.map_err(|e| {
            LibraryError::InvalidInput {
                field: "path".to_string(),
                message: e.to_string(),
            }
        })?;

        let metadata = self.file_system.metadata(&canonical).await?;
        if !metadata.is_directory {
            return Err(LibraryError::InvalidInput {
                field: "path".to_string(),
                message: "not a directory".to_string(),
            });
        }

        let canonical = canonical.to_string_lossy().into_owned();
        self.roots
            .insert(
                &self.local_node_id,
                name,
                &canonical,
                self.clock.unix_timestamp(),
            )
            .await?;

        info!("Added library root");
        Ok(LibraryRoot {
            name: name.to_string(),
            path: canonical,
            file_count: 0,
        })
    }

    /// Stop sharing a root and drop its indexed files.
    #[instrument(skip(self))]
    pub async fn remove_root(&self, name: &str) -> Result<LibraryRoot> {
        let root = self
            .roots
            .find_by_name(&self.local_node_id, name)
            .await?
            .ok_or_else(|| LibraryError::NotFound {
                entity_type: "LibraryRoot".to_string(),
                id: name.to_string(),
            })?;

        self.roots.delete(&self.local_node_id, &root.name).await?;
        let removed = self
            .files
            .delete_by_root(&self.local_node_id, &root.name)
            .await?;

        info!(files = removed, "Removed library root");
        Ok(root)
    }

    pub async fn roots(&self) -> Result<Vec<LibraryRoot>> {
        self.roots.list(&self.local_node_id).await
    }

    /// Walk every root, hash its files and replace the stored local index.
    #[instrument(skip(self))]
    pub async fn rescan(&self) -> Result<ScanReport> {
        let _guard = self.scan_lock.lock().await;
        let started = std::time::Instant::now();

        let roots = self.roots.list(&self.local_node_id).await?;
        let index = build_local_index(
            self.file_system.as_ref(),
            &self.local_node_id,
            &roots,
            &self.scan_extensions,
        )
        .await;

        // Roots that failed to scan keep their previous files.
        let mut files = index.to_new_files();
        if !index.errors.is_empty() {
            let failed: HashSet<&str> = index.errors.iter().map(|e| e.root.as_str()).collect();
            let previous = self.files.list_by_node(&self.local_node_id).await?;
            files.extend(
                previous
                    .into_iter()
                    .filter(|f| failed.contains(f.root.as_str()))
                    .map(|f| NewFile {
                        root: f.root,
                        path: f.path,
                        hash_kind: f.hash_kind,
                        hash: f.hash,
                        size: f.size,
                        local_path: f.local_path,
                    }),
            );
        }

        self.files
            .replace_node_files(&self.local_node_id, &files)
            .await?;

        let report = ScanReport {
            roots: roots.len(),
            files: index.entries.len(),
            errors: index.errors,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            roots = report.roots,
            files = report.files,
            errors = report.errors.len(),
            "Library scan finished"
        );
        Ok(report)
    }

    /// The stored local index, ordered by root then path.
    pub async fn local_index(&self) -> Result<Vec<IndexItem>> {
        let records = self.local_files().await?;
        Ok(records.iter().map(FileRecord::to_index_item).collect())
    }

    /// Every locally hosted file together with its location on disk.
    pub async fn local_files(&self) -> Result<Vec<FileRecord>> {
        self.files.list_by_node(&self.local_node_id).await
    }

    /// Look up a locally hosted file by root and path.
    pub async fn local_file(&self, root: &str, path: &str) -> Result<Option<FileRecord>> {
        self.files
            .find(&ItemKey {
                node_id: self.local_node_id.clone(),
                root: root.to_string(),
                path: path.to_string(),
            })
            .await
    }

    /// Remember that `item` was received from its node and stored at `local_path`.
    pub async fn record_download(&self, item: &IndexItem, local_path: &Path) -> Result<()> {
        self.files
            .upsert(
                &item.node_id,
                &NewFile {
                    root: item.root.clone(),
                    path: item.path.clone(),
                    hash_kind: item.hash_kind.clone(),
                    hash: item.hash.clone(),
                    size: item.size.bytes(),
                    local_path: local_path.to_string_lossy().into_owned(),
                },
            )
            .await
    }

    /// Keys already downloaded from `remote`.
    pub async fn downloaded_keys(&self, remote: &NodeId) -> Result<HashSet<ItemKey>> {
        self.files.keys_by_node(remote).await
    }

    /// Forget every root and indexed file.
    #[instrument(skip(self))]
    pub async fn reset(&self) -> Result<()> {
        let _guard = self.scan_lock.lock().await;
        db::reset_library(&self.pool).await
    }
}
