//! Trusted node store
//!
//! A trusted node is admitted without asking the owner. Trust is granted by
//! "accept and trust" and lasts until the owner revokes it.

use crate::error::Result;
use crate::models::TrustedNode;
use async_trait::async_trait;
use bridge_traits::transport::NodeId;
use sqlx::SqlitePool;

#[async_trait]
pub trait TrustStore: Send + Sync {
    async fn is_trusted(&self, node_id: &NodeId) -> Result<bool>;

    /// Record `node_id` as trusted. Trusting an already trusted node keeps
    /// the original timestamp.
    async fn trust(&self, node_id: &NodeId, trusted_at: i64) -> Result<()>;

    /// Returns `true` if the node was trusted before the call.
    async fn untrust(&self, node_id: &NodeId) -> Result<bool>;

    async fn list(&self) -> Result<Vec<TrustedNode>>;
}

pub struct SqliteTrustStore {
    pool: SqlitePool,
}

impl SqliteTrustStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TrustStore for SqliteTrustStore {
    async fn is_trusted(&self, node_id: &NodeId) -> Result<bool> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM trusted_nodes WHERE node_id = ? LIMIT 1")
                .bind(node_id.as_str())
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.is_some())
    }

    async fn trust(&self, node_id: &NodeId, trusted_at: i64) -> Result<()> {
        sqlx::query(
            "INSERT INTO trusted_nodes (node_id, trusted_at) VALUES (?, ?) ON CONFLICT (node_id) DO NOTHING",
        )
        .bind(node_id.as_str())
        .bind(trusted_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn untrust(&self, node_id: &NodeId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM trusted_nodes WHERE node_id = ?")
            .bind(node_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list(&self) -> Result<Vec<TrustedNode>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT node_id, trusted_at FROM trusted_nodes ORDER BY trusted_at ASC, node_id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(node_id, trusted_at)| TrustedNode {
                node_id: NodeId::new(node_id),
                trusted_at,
            })
            .collect())
    }
}
