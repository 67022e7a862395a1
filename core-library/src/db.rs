//! SQLite pool for the library index, trust list and server history.
//!
//! The pool is opened in WAL mode with foreign keys on and the embedded
//! migrations applied, so callers receive a ready-to-use schema.
//!
//! ```rust,ignore
//! use core_library::db::{create_pool, DatabaseConfig};
//!
//! let pool = create_pool(DatabaseConfig::new(data_dir.join("musync.db"))).await?;
//! let library = Library::new(pool, node_id, fs, clock, extensions);
//! ```

use crate::{LibraryError, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Sqlite};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// `sqlite:` URL, `sqlite::memory:` for a private in-memory database
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Option<Duration>,
}

impl DatabaseConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            url: format!("sqlite:{}", path.into().display()),
            max_connections: 5,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Some(Duration::from_secs(600)),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
            // A second connection would open a second, empty database
            max_connections: 1,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: None,
        }
    }

    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }
}

/// Open the pool and bring the schema up to date.
///
/// # Errors
///
/// `LibraryError::Database` if the file cannot be opened,
/// `LibraryError::Migration` if the schema cannot be applied.
pub async fn create_pool(config: DatabaseConfig) -> Result<Pool<Sqlite>> {
    info!(url = %config.url, max_connections = config.max_connections, "Opening database");

    let options = SqliteConnectOptions::from_str(&config.url)?
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true)
        .create_if_missing(true)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .min_connections(1)
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout)
        .idle_timeout(config.idle_timeout)
        // In-memory databases vanish with their last connection
        .max_lifetime(None)
        .connect_with(options)
        .await
        .map_err(|e| {
            warn!(error = %e, "Could not open database");
            LibraryError::Database(e)
        })?;

    sqlx::migrate!("./migrations").run(&pool).await.map_err(|e| {
        warn!(error = %e, "Migration failed");
        LibraryError::Migration(e.to_string())
    })?;

    debug!(connections = pool.size(), "Database ready");
    Ok(pool)
}

/// In-memory pool with the schema applied.
pub async fn create_test_pool() -> Result<Pool<Sqlite>> {
    create_pool(DatabaseConfig::in_memory()).await
}

/// Remove all roots and indexed files.
///
/// Trusted nodes and recent servers are kept; they describe peers rather
/// than library content.
pub async fn reset_library(pool: &Pool<Sqlite>) -> Result<()> {
    warn!("Resetting library tables");

    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM files").execute(&mut *tx).await?;
    sqlx::query("DELETE FROM roots").execute(&mut *tx).await?;
    tx.commit().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn count(pool: &Pool<Sqlite>, sql: &str) -> i64 {
        let row: (i64,) = sqlx::query_as(sql).fetch_one(pool).await.unwrap();
        row.0
    }

    #[tokio::test]
    async fn test_migrations_create_tables() {
        let pool = create_test_pool().await.unwrap();

        for table in ["roots", "files", "trusted_nodes", "recent_servers"] {
            let found: (i64,) =
                sqlx::query_as("SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?")
                    .bind(table)
                    .fetch_one(&pool)
                    .await
                    .unwrap();
            assert_eq!(found.0, 1, "{} table should exist", table);
        }
        assert_eq!(count(&pool, "PRAGMA foreign_keys").await, 1);
    }

    #[tokio::test]
    async fn test_file_database_uses_wal() {
        let dir = tempfile::tempdir().unwrap();
        let pool = create_pool(DatabaseConfig::new(dir.path().join("core.db")))
            .await
            .unwrap();

        let (mode,): (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }

    #[tokio::test]
    async fn test_reopening_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("core.db");

        let pool = create_pool(DatabaseConfig::new(&path)).await.unwrap();
        sqlx::query("INSERT INTO trusted_nodes (node_id, trusted_at) VALUES ('peer', 0)")
            .execute(&pool)
            .await
            .unwrap();
        pool.close().await;

        let pool = create_pool(DatabaseConfig::new(&path)).await.unwrap();
        assert_eq!(count(&pool, "SELECT COUNT(*) FROM trusted_nodes").await, 1);
    }

    #[tokio::test]
    async fn test_reset_library_keeps_trust() {
        let pool = create_test_pool().await.unwrap();
        sqlx::query("INSERT INTO roots (node_id, name, path, created_at) VALUES ('n', 'Music', '/m', 0)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO trusted_nodes (node_id, trusted_at) VALUES ('peer', 0)")
            .execute(&pool)
            .await
            .unwrap();

        reset_library(&pool).await.unwrap();

        assert_eq!(count(&pool, "SELECT COUNT(*) FROM roots").await, 0);
        assert_eq!(count(&pool, "SELECT COUNT(*) FROM trusted_nodes").await, 1);
    }
}
