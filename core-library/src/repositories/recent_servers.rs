//! Servers this node has connected to

use crate::error::Result;
use crate::models::RecentServer;
use async_trait::async_trait;
use bridge_traits::transport::NodeId;
use sqlx::SqlitePool;

#[async_trait]
pub trait RecentServerRepository: Send + Sync {
    /// Record a successful connection, replacing the previous timestamp.
    async fn touch(&self, node_id: &NodeId, connected_at: i64) -> Result<()>;

    /// Most recent first.
    async fn list(&self) -> Result<Vec<RecentServer>>;
}

pub struct SqliteRecentServerRepository {
    pool: SqlitePool,
}

impl SqliteRecentServerRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RecentServerRepository for SqliteRecentServerRepository {
    async fn touch(&self, node_id: &NodeId, connected_at: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO recent_servers (node_id, connected_at) VALUES (?, ?)
            ON CONFLICT (node_id) DO UPDATE SET connected_at = excluded.connected_at
            "#,
        )
        .bind(node_id.as_str())
        .bind(connected_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<RecentServer>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT node_id, connected_at FROM recent_servers ORDER BY connected_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(node_id, connected_at)| RecentServer {
                node_id: NodeId::new(node_id),
                connected_at,
            })
            .collect())
    }
}
