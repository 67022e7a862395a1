//! File repository trait and implementation
//!
//! Holds two kinds of rows in one table, told apart by `node_id`:
//! the local node's scanned files, replaced wholesale on every scan, and
//! files downloaded from remote nodes, upserted one at a time as transfers
//! finish.

use crate::error::Result;
use crate::models::{FileRecord, ItemKey};
use async_trait::async_trait;
use bridge_traits::transport::NodeId;
use sqlx::{FromRow, SqlitePool};
use std::collections::HashSet;
use tracing::debug;

/// Values for a new `files` row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewFile {
    pub root: String,
    pub path: String,
    pub hash_kind: String,
    pub hash: Vec<u8>,
    pub size: Option<u64>,
    pub local_path: String,
}

#[async_trait]
pub trait FileRepository: Send + Sync {
    /// Replace every file of `node_id` with `files` in one transaction.
    async fn replace_node_files(&self, node_id: &NodeId, files: &[NewFile]) -> Result<()>;

    /// Insert a file, overwriting an existing row with the same key.
    async fn upsert(&self, node_id: &NodeId, file: &NewFile) -> Result<()>;

    /// All files of a node ordered by root and path.
    async fn list_by_node(&self, node_id: &NodeId) -> Result<Vec<FileRecord>>;

    async fn find(&self, key: &ItemKey) -> Result<Option<FileRecord>>;

    /// Keys of every file recorded for a node.
    async fn keys_by_node(&self, node_id: &NodeId) -> Result<HashSet<ItemKey>>;

    /// Delete every file of a node under one root. Returns the number removed.
    async fn delete_by_root(&self, node_id: &NodeId, root: &str) -> Result<u64>;

    async fn count_by_root(&self, node_id: &NodeId, root: &str) -> Result<u64>;
}

pub struct SqliteFileRepository {
    pool: SqlitePool,
}

impl SqliteFileRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, FromRow)]
struct FileRow {
    node_id: String,
    root: String,
    path: String,
    hash_kind: String,
    hash: Vec<u8>,
    size: Option<i64>,
    local_path: String,
}

impl From<FileRow> for FileRecord {
    fn from(row: FileRow) -> Self {
        FileRecord {
            node_id: NodeId::new(row.node_id),
            root: row.root,
            path: row.path,
            hash_kind: row.hash_kind,
            hash: row.hash,
            size: row.size.map(|s| s.max(0) as u64),
            local_path: row.local_path,
        }
    }
}

const SELECT_FILES: &str =
    "SELECT node_id, root, path, hash_kind, hash, size, local_path FROM files";

const INSERT_FILE: &str = r#"
    INSERT INTO files (hash_kind, hash, node_id, root, path, size, local_path)
    VALUES (?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT (node_id, root, path) DO UPDATE SET
        hash_kind = excluded.hash_kind,
        hash = excluded.hash,
        size = excluded.size,
        local_path = excluded.local_path
"#;

#[async_trait]
impl FileRepository for SqliteFileRepository {
    async fn replace_node_files(&self, node_id: &NodeId, files: &[NewFile]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM files WHERE node_id = ?")
            .bind(node_id.as_str())
            .execute(&mut *tx)
            .await?;

        for file in files {
            sqlx::query(INSERT_FILE)
                .bind(&file.hash_kind)
                .bind(&file.hash)
                .bind(node_id.as_str())
                .bind(&file.root)
                .bind(&file.path)
                .bind(file.size.map(|s| s as i64))
                .bind(&file.local_path)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        debug!(node_id = %node_id.short(), files = files.len(), "Replaced node files");
        Ok(())
    }

    async fn upsert(&self, node_id: &NodeId, file: &NewFile) -> Result<()> {
        sqlx::query(INSERT_FILE)
            .bind(&file.hash_kind)
            .bind(&file.hash)
            .bind(node_id.as_str())
            .bind(&file.root)
            .bind(&file.path)
            .bind(file.size.map(|s| s as i64))
            .bind(&file.local_path)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_by_node(&self, node_id: &NodeId) -> Result<Vec<FileRecord>> {
        let sql = format!("{} WHERE node_id = ? ORDER BY root ASC, path ASC", SELECT_FILES);
        let rows: Vec<FileRow> = sqlx::query_as(&sql)
            .bind(node_id.as_str())
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(FileRecord::from).collect())
    }

    async fn find(&self, key: &ItemKey) -> Result<Option<FileRecord>> {
        let sql = format!(
            "{} WHERE node_id = ? AND root = ? AND path = ? LIMIT 1",
            SELECT_FILES
        );
        let row: Option<FileRow> = sqlx::query_as(&sql)
            .bind(key.node_id.as_str())
            .bind(&key.root)
            .bind(&key.path)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(FileRecord::from))
    }

    async fn keys_by_node(&self, node_id: &NodeId) -> Result<HashSet<ItemKey>> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT root, path FROM files WHERE node_id = ?")
                .bind(node_id.as_str())
                .fetch_all(&self.pool)
                .await?;
        Ok(rows
            .into_iter()
            .map(|(root, path)| ItemKey {
                node_id: node_id.clone(),
                root,
                path,
            })
            .collect())
    }

    async fn delete_by_root(&self, node_id: &NodeId, root: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM files WHERE node_id = ? AND root = ?")
            .bind(node_id.as_str())
            .bind(root)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn count_by_root(&self, node_id: &NodeId, root: &str) -> Result<u64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM files WHERE node_id = ? AND root = ?")
                .bind(node_id.as_str())
                .bind(root)
                .fetch_one(&self.pool)
                .await?;
        Ok(count.max(0) as u64)
    }
}
