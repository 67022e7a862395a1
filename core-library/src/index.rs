//! Index building and reconciliation
//!
//! ## Overview
//!
//! - [`build_local_index`] walks the local roots through the filesystem bridge
//!   and produces one item per audio file. Building twice over unchanged roots
//!   yields identical output, ordered by root then path.
//! - [`reconcile`] picks the remote items that have not been downloaded yet.
//! - [`plan_partial`] validates an explicit selection against the last
//!   received remote index. A selection with any unknown key is rejected as a
//!   whole.

use crate::error::{LibraryError, Result};
use crate::models::{FileSize, IndexItem, ItemKey, LibraryRoot};
use crate::repositories::NewFile;
use bridge_traits::storage::FileSystemAccess;
use bridge_traits::transport::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, instrument, warn};

/// A root that could not be scanned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootScanError {
    pub root: String,
    pub message: String,
}

/// An index item together with where it lives on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalEntry {
    pub item: IndexItem,
    pub local_path: PathBuf,
}

/// Result of walking the local roots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalIndex {
    pub entries: Vec<LocalEntry>,
    pub errors: Vec<RootScanError>,
}

impl LocalIndex {
    pub fn items(&self) -> Vec<IndexItem> {
        self.entries.iter().map(|e| e.item.clone()).collect()
    }

    /// Rows for the `files` table.
    pub fn to_new_files(&self) -> Vec<NewFile> {
        self.entries
            .iter()
            .map(|entry| NewFile {
                root: entry.item.root.clone(),
                path: entry.item.path.clone(),
                hash_kind: entry.item.hash_kind.clone(),
                hash: entry.item.hash.clone(),
                size: entry.item.size.bytes(),
                local_path: entry.local_path.to_string_lossy().into_owned(),
            })
            .collect()
    }
}

/// Join a `/`-separated relative path onto a root directory.
pub fn resolve_relative(root: &Path, relative: &str) -> PathBuf {
    relative
        .split('/')
        .filter(|c| !c.is_empty() && *c != "." && *c != "..")
        .fold(root.to_path_buf(), |path, component| path.join(component))
}

/// Walk and hash every root.
///
/// A root that cannot be read is reported in [`LocalIndex::errors`] and the
/// remaining roots are still scanned.
#[instrument(skip(fs, roots, extensions), fields(roots = roots.len()))]
pub async fn build_local_index(
    fs: &dyn FileSystemAccess,
    node_id: &NodeId,
    roots: &[LibraryRoot],
    extensions: &[String],
) -> LocalIndex {
    let mut sorted: Vec<&LibraryRoot> = roots.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));

    let mut index = LocalIndex::default();

    for root in sorted {
        let root_path = Path::new(&root.path);
        match fs.scan_root(root_path, extensions).await {
            Ok(mut files) => {
                files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
                debug!(root = %root.name, files = files.len(), "Scanned root");
                index.entries.extend(files.into_iter().map(|file| LocalEntry {
                    local_path: resolve_relative(root_path, &file.relative_path),
                    item: IndexItem {
                        node_id: node_id.clone(),
                        root: root.name.clone(),
                        path: file.relative_path,
                        hash_kind: file.hash_kind,
                        hash: file.hash,
                        size: FileSize::Actual(file.size),
                        downloaded: false,
                    },
                }));
            }
            Err(e) => {
                warn!(root = %root.name, error = %e, "Failed to scan root");
                index.errors.push(RootScanError {
                    root: root.name.clone(),
                    message: e.to_string(),
                });
            }
        }
    }

    index
}

/// Remote items whose key is not in `downloaded`.
pub fn reconcile(remote: &[IndexItem], downloaded: &HashSet<ItemKey>) -> Vec<IndexItem> {
    remote
        .iter()
        .filter(|item| !downloaded.contains(&item.key()))
        .cloned()
        .collect()
}

/// Set the `downloaded` flag on each item from the given key set.
pub fn mark_downloaded(items: &mut [IndexItem], downloaded: &HashSet<ItemKey>) {
    for item in items {
        item.downloaded = downloaded.contains(&item.key());
    }
}

/// Resolve a selection against a remote index.
///
/// Duplicate keys are collapsed, keeping the first occurrence's position.
///
/// # Errors
///
/// Returns `InvalidSelection` listing every key missing from `remote`.
pub fn plan_partial(remote: &[IndexItem], selected: &[ItemKey]) -> Result<Vec<IndexItem>> {
    let by_key: HashMap<ItemKey, &IndexItem> =
        remote.iter().map(|item| (item.key(), item)).collect();

    let mut seen = HashSet::new();
    let mut plan = Vec::new();
    let mut unknown = Vec::new();

    for key in selected {
        if !seen.insert(key) {
            continue;
        }
        match by_key.get(key) {
            Some(item) => plan.push((*item).clone()),
            None => unknown.push(key.to_string()),
        }
    }

    if unknown.is_empty() {
        Ok(plan)
    } else {
        Err(LibraryError::InvalidSelection { unknown })
    }
}
