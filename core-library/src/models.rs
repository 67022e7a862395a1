//! Domain models for the content index
//!
//! An index is the list of files a node offers. Local items come from
//! scanning the configured roots; remote items arrive over a sync session and
//! carry a `downloaded` flag from the receiving node's point of view.

use bridge_traits::transport::NodeId;
use serde::{Deserialize, Serialize};
use std::fmt;

// =============================================================================
// Index items
// =============================================================================

/// Size of a file as advertised in an index.
///
/// Files that will be transcoded before transfer only have an estimate until
/// the encoded artifact exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "certainty", content = "bytes", rename_all = "snake_case")]
pub enum FileSize {
    Actual(u64),
    Estimated(u64),
    Unknown,
}

impl FileSize {
    pub fn bytes(&self) -> Option<u64> {
        match self {
            FileSize::Actual(n) | FileSize::Estimated(n) => Some(*n),
            FileSize::Unknown => None,
        }
    }

    pub fn is_actual(&self) -> bool {
        matches!(self, FileSize::Actual(_))
    }
}

/// Identity of an indexed file: (node, root, path).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemKey {
    pub node_id: NodeId,
    pub root: String,
    pub path: String,
}

impl ItemKey {
    pub fn new(node_id: impl Into<NodeId>, root: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            root: root.into(),
            path: path.into(),
        }
    }
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.node_id.short(), self.root, self.path)
    }
}

/// One file in a content index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexItem {
    pub node_id: NodeId,
    pub root: String,
    /// Path relative to the root, `/`-separated
    pub path: String,
    pub hash_kind: String,
    #[serde(with = "hex_bytes")]
    pub hash: Vec<u8>,
    pub size: FileSize,
    #[serde(default)]
    pub downloaded: bool,
}

impl IndexItem {
    pub fn key(&self) -> ItemKey {
        ItemKey {
            node_id: self.node_id.clone(),
            root: self.root.clone(),
            path: self.path.clone(),
        }
    }

    pub fn hash_hex(&self) -> String {
        hex::encode(&self.hash)
    }

    /// Lowercase file extension of the path, if any.
    pub fn extension(&self) -> Option<String> {
        let name = self.path.rsplit('/').next()?;
        let (stem, ext) = name.rsplit_once('.')?;
        if stem.is_empty() || ext.is_empty() {
            return None;
        }
        Some(ext.to_ascii_lowercase())
    }
}

/// Hashes travel as hex strings; a JSON number array is several times larger
/// and bounds how big an index fits in one frame.
mod hex_bytes {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        hex::decode(&text).map_err(D::Error::custom)
    }
}

// =============================================================================
// Roots
// =============================================================================

/// A named directory whose files are offered to peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryRoot {
    pub name: String,
    pub path: String,
    pub file_count: u64,
}

/// Check a root name.
///
/// Names are shown to peers and used as the first path component on the
/// receiving side, so only letters, digits, spaces, `_` and `-` are allowed.
pub fn validate_root_name(name: &str) -> Result<(), String> {
    if name.trim().is_empty() {
        return Err("Root name cannot be empty".to_string());
    }
    if name.len() > 128 {
        return Err("Root name cannot exceed 128 characters".to_string());
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_alphanumeric() || *c == ' ' || *c == '_' || *c == '-'))
    {
        return Err(format!("Root name contains invalid character {:?}", c));
    }
    Ok(())
}

// =============================================================================
// Stored rows
// =============================================================================

/// A file row as stored in the `files` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub node_id: NodeId,
    pub root: String,
    pub path: String,
    pub hash_kind: String,
    pub hash: Vec<u8>,
    pub size: Option<u64>,
    /// Where the file lives on this machine
    pub local_path: String,
}

impl FileRecord {
    pub fn key(&self) -> ItemKey {
        ItemKey {
            node_id: self.node_id.clone(),
            root: self.root.clone(),
            path: self.path.clone(),
        }
    }

    /// Index entry for a locally hosted file.
    pub fn to_index_item(&self) -> IndexItem {
        IndexItem {
            node_id: self.node_id.clone(),
            root: self.root.clone(),
            path: self.path.clone(),
            hash_kind: self.hash_kind.clone(),
            hash: self.hash.clone(),
            size: self.size.map(FileSize::Actual).unwrap_or(FileSize::Unknown),
            downloaded: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustedNode {
    pub node_id: NodeId,
    pub trusted_at: i64,
}

/// A server this node connected to, with the last connection time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecentServer {
    pub node_id: NodeId,
    pub connected_at: i64,
}
