//! Root repository trait and implementation

use crate::error::{LibraryError, Result};
use crate::models::{validate_root_name, LibraryRoot};
use async_trait::async_trait;
use bridge_traits::transport::NodeId;
use sqlx::{FromRow, SqlitePool};

/// Root repository interface
#[async_trait]
pub trait RootRepository: Send + Sync {
    /// Insert a root for a node
    ///
    /// # Errors
    /// Returns `RootConflict` if the node already has a root with the same
    /// name (case-insensitive) or the same path.
    async fn insert(&self, node_id: &NodeId, name: &str, path: &str, created_at: i64)
        -> Result<()>;

    /// Delete a root by name
    ///
    /// # Returns
    /// - `Ok(true)` if the root was deleted
    /// - `Ok(false)` if no such root exists
    async fn delete(&self, node_id: &NodeId, name: &str) -> Result<bool>;

    /// List a node's roots ordered by name, with indexed file counts
    async fn list(&self, node_id: &NodeId) -> Result<Vec<LibraryRoot>>;

    /// Find a root by name (case-insensitive)
    async fn find_by_name(&self, node_id: &NodeId, name: &str) -> Result<Option<LibraryRoot>>;
}

/// SQLite implementation of RootRepository
pub struct SqliteRootRepository {
    pool: SqlitePool,
}

impl SqliteRootRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, FromRow)]
struct RootRow {
    name: String,
    path: String,
    file_count: i64,
}

impl From<RootRow> for LibraryRoot {
    fn from(row: RootRow) -> Self {
        LibraryRoot {
            name: row.name,
            path: row.path,
            file_count: row.file_count.max(0) as u64,
        }
    }
}

const SELECT_ROOTS: &str = r#"
    SELECT r.name AS name, r.path AS path,
        (SELECT COUNT(*) FROM files f WHERE f.node_id = r.node_id AND f.root = r.name) AS file_count
    FROM roots r
"#;

#[async_trait]
impl RootRepository for SqliteRootRepository {
    async fn insert(
        &self,
        node_id: &NodeId,
        name: &str,
        path: &str,
        created_at: i64,
    ) -> Result<()> {
        validate_root_name(name).map_err(|message| LibraryError::InvalidInput {
            field: "name".to_string(),
            message,
        })?;

        let existing: Option<(String, String)> = sqlx::query_as(
            "SELECT name, path FROM roots WHERE node_id = ? AND (name = ? OR path = ?) LIMIT 1",
        )
        .bind(node_id.as_str())
        .bind(name)
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;

        if let Some((existing_name, existing_path)) = existing {
            let reason = if existing_name.eq_ignore_ascii_case(name) {
                format!("a root named {} already exists", existing_name)
            } else {
                format!("path {} is already shared as {}", existing_path, existing_name)
            };
            return Err(LibraryError::RootConflict {
                name: name.to_string(),
                reason,
            });
        }

        sqlx::query("INSERT INTO roots (node_id, name, path, created_at) VALUES (?, ?, ?, ?)")
            .bind(node_id.as_str())
            .bind(name)
            .bind(path)
            .bind(created_at)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                if matches!(&e, sqlx::Error::Database(db) if db.is_unique_violation()) {
                    LibraryError::RootConflict {
                        name: name.to_string(),
                        reason: "root already exists".to_string(),
                    }
                } else {
                    LibraryError::Database(e)
                }
            })?;

        Ok(())
    }

    async fn delete(&self, node_id: &NodeId, name: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM roots WHERE node_id = ? AND name = ?")
            .bind(node_id.as_str())
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list(&self, node_id: &NodeId) -> Result<Vec<LibraryRoot>> {
        let sql = format!("{} WHERE r.node_id = ? ORDER BY r.name ASC", SELECT_ROOTS);
        let rows: Vec<RootRow> = sqlx::query_as(&sql)
            .bind(node_id.as_str())
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(LibraryRoot::from).collect())
    }

    async fn find_by_name(&self, node_id: &NodeId, name: &str) -> Result<Option<LibraryRoot>> {
        let sql = format!("{} WHERE r.node_id = ? AND r.name = ? LIMIT 1", SELECT_ROOTS);
        let row: Option<RootRow> = sqlx::query_as(&sql)
            .bind(node_id.as_str())
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(LibraryRoot::from))
    }
}
