//! PostgreSQL retry queue repository.

use crate::persistence::postgres::db_error;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_server_domain::queue::{QueueItem, QueueItemStatus, QueueRepository};
use courier_server_domain::shared_kernel::{DeliveryId, Result};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

#[derive(Debug, Clone)]
pub struct PostgresQueueRepository {
    pool: PgPool,
}

impl PostgresQueueRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn status_str(status: QueueItemStatus) -> &'static str {
    match status {
        QueueItemStatus::Pending => "pending",
        QueueItemStatus::Done => "done",
        QueueItemStatus::Dead => "dead",
    }
}

fn map_item(row: PgRow) -> QueueItem {
    let status = match row.get::<String, _>("status").as_str() {
        "done" => QueueItemStatus::Done,
        "dead" => QueueItemStatus::Dead,
        _ => QueueItemStatus::Pending,
    };
    QueueItem {
        id: row.get("id"),
        delivery_id: DeliveryId(row.get("delivery_id")),
        payload: row.get("payload"),
        status,
        retry_count: row.get("retry_count"),
        next_attempt_at: row.get("next_attempt_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

#[async_trait]
impl QueueRepository for PostgresQueueRepository {
    async fn enqueue(&self, item: &QueueItem) -> Result<()> {
        sqlx::query(
            "INSERT INTO message_queue \
             (id, delivery_id, payload, status, retry_count, next_attempt_at, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(item.id)
        .bind(item.delivery_id.0)
        .bind(&item.payload)
        .bind(status_str(item.status))
        .bind(item.retry_count)
        .bind(item.next_attempt_at)
        .bind(item.created_at)
        .bind(item.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("failed to enqueue retry item", e))?;
        Ok(())
    }

    async fn due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<QueueItem>> {
        sqlx::query(
            "SELECT id, delivery_id, payload, status, retry_count, next_attempt_at, \
             created_at, updated_at FROM message_queue \
             WHERE status = 'pending' AND next_attempt_at <= $1 \
             ORDER BY next_attempt_at LIMIT $2",
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map(|rows| rows.into_iter().map(map_item).collect())
        .map_err(|e| db_error("failed to load due retry items", e))
    }

    async fn update(&self, item: &QueueItem) -> Result<()> {
        sqlx::query(
            "UPDATE message_queue SET status = $2, retry_count = $3, next_attempt_at = $4, \
             updated_at = $5 WHERE id = $1",
        )
        .bind(item.id)
        .bind(status_str(item.status))
        .bind(item.retry_count)
        .bind(item.next_attempt_at)
        .bind(item.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("failed to update retry item", e))?;
        Ok(())
    }

    async fn prune(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM message_queue WHERE status IN ('done', 'dead') AND updated_at < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("failed to prune retry queue", e))?;
        Ok(result.rows_affected())
    }
}
