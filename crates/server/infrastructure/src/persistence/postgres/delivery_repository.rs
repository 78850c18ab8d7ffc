//! PostgreSQL delivery repository.
//!
//! State transitions are conditional updates keyed on the current status;
//! a transition that matches zero rows is reported as a contract violation
//! (or a missing row), never applied blindly.

use crate::persistence::postgres::db_error;
use async_trait::async_trait;
use courier_server_domain::deliveries::{DeliveryAttempt, DeliveryRepository};
use courier_server_domain::shared_kernel::{
    ChannelKind, DeliveryId, DeliveryStatus, DeviceId, DomainError, NotificationId, Result,
};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct PostgresDeliveryRepository {
    pool: PgPool,
}

impl PostgresDeliveryRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Explains a conditional update that matched nothing: either the row
    /// is gone or it was in a state the transition does not allow.
    async fn rejection(&self, id: &DeliveryId, to: DeliveryStatus) -> DomainError {
        match self.find_by_id(id).await {
            Ok(Some(attempt)) => DomainError::InvalidStateTransition {
                delivery_id: *id,
                from: attempt.status,
                to,
            },
            Ok(None) => DomainError::DeliveryNotFound { delivery_id: *id },
            Err(err) => err,
        }
    }
}

fn map_attempt(row: PgRow) -> DeliveryAttempt {
    DeliveryAttempt {
        id: DeliveryId(row.get("id")),
        notification_id: NotificationId(row.get("notification_id")),
        device_id: DeviceId(row.get("device_id")),
        channel: ChannelKind::from_str(row.get::<String, _>("channel").as_str())
            .unwrap_or(ChannelKind::WebSocket),
        status: DeliveryStatus::from_str(row.get::<String, _>("status").as_str())
            .unwrap_or(DeliveryStatus::Pending),
        sent_at: row.get("sent_at"),
        delivered_at: row.get("delivered_at"),
        failed_at: row.get("failed_at"),
        retry_count: row.get("retry_count"),
        error_message: row.get("error_message"),
        provider_message_id: row.get("provider_message_id"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

const SELECT_COLUMNS: &str = "id, notification_id, device_id, channel, status, sent_at, \
     delivered_at, failed_at, retry_count, error_message, provider_message_id, created_at, \
     updated_at";

async fn insert(pool: &PgPool, attempt: &DeliveryAttempt) -> Result<()> {
    sqlx::query(
        "INSERT INTO delivery_tracking \
         (id, notification_id, device_id, channel, status, sent_at, delivered_at, failed_at, \
          retry_count, error_message, provider_message_id, created_at, updated_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
    )
    .bind(attempt.id.0)
    .bind(attempt.notification_id.0)
    .bind(attempt.device_id.0)
    .bind(attempt.channel.as_str())
    .bind(attempt.status.as_str())
    .bind(attempt.sent_at)
    .bind(attempt.delivered_at)
    .bind(attempt.failed_at)
    .bind(attempt.retry_count)
    .bind(&attempt.error_message)
    .bind(&attempt.provider_message_id)
    .bind(attempt.created_at)
    .bind(attempt.updated_at)
    .execute(pool)
    .await
    .map_err(|e| db_error("failed to create delivery record", e))?;
    Ok(())
}

#[async_trait]
impl DeliveryRepository for PostgresDeliveryRepository {
    async fn create(&self, attempt: &DeliveryAttempt) -> Result<()> {
        insert(&self.pool, attempt).await
    }

    async fn find_by_id(&self, id: &DeliveryId) -> Result<Option<DeliveryAttempt>> {
        sqlx::query(&format!(
            "SELECT {} FROM delivery_tracking WHERE id = $1",
            SELECT_COLUMNS
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .map(|row| row.map(map_attempt))
        .map_err(|e| db_error("failed to load delivery record", e))
    }

    async fn find_by_notification(
        &self,
        notification_id: &NotificationId,
    ) -> Result<Vec<DeliveryAttempt>> {
        sqlx::query(&format!(
            "SELECT {} FROM delivery_tracking WHERE notification_id = $1 ORDER BY created_at",
            SELECT_COLUMNS
        ))
        .bind(notification_id.0)
        .fetch_all(&self.pool)
        .await
        .map(|rows| rows.into_iter().map(map_attempt).collect())
        .map_err(|e| db_error("failed to load delivery records", e))
    }

    async fn find_by_device(&self, device_id: &DeviceId) -> Result<Vec<DeliveryAttempt>> {
        sqlx::query(&format!(
            "SELECT {} FROM delivery_tracking WHERE device_id = $1 ORDER BY created_at DESC",
            SELECT_COLUMNS
        ))
        .bind(device_id.0)
        .fetch_all(&self.pool)
        .await
        .map(|rows| rows.into_iter().map(map_attempt).collect())
        .map_err(|e| db_error("failed to load device deliveries", e))
    }

    async fn find_for_ack(
        &self,
        notification_id: &NotificationId,
        device_id: &DeviceId,
    ) -> Result<Option<DeliveryAttempt>> {
        sqlx::query(&format!(
            "SELECT {} FROM delivery_tracking \
             WHERE notification_id = $1 AND device_id = $2 \
             ORDER BY created_at DESC LIMIT 1",
            SELECT_COLUMNS
        ))
        .bind(notification_id.0)
        .bind(device_id.0)
        .fetch_optional(&self.pool)
        .await
        .map(|row| row.map(map_attempt))
        .map_err(|e| db_error("failed to load delivery for ack", e))
    }

    async fn find_retryable(&self, max_retries: u32, limit: i64) -> Result<Vec<DeliveryAttempt>> {
        sqlx::query(&format!(
            "SELECT {} FROM delivery_tracking \
             WHERE status = 'failed' AND retry_count < $1 \
             ORDER BY updated_at LIMIT $2",
            SELECT_COLUMNS
        ))
        .bind(max_retries as i32)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map(|rows| rows.into_iter().map(map_attempt).collect())
        .map_err(|e| db_error("failed to load retryable deliveries", e))
    }

    async fn mark_sent(&self, id: &DeliveryId, provider_message_id: Option<&str>) -> Result<()> {
        let result = sqlx::query(
            "UPDATE delivery_tracking SET status = 'sent', sent_at = NOW(), \
             provider_message_id = COALESCE($2, provider_message_id), updated_at = NOW() \
             WHERE id = $1 AND status = 'pending'",
        )
        .bind(id.0)
        .bind(provider_message_id)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("failed to mark delivery sent", e))?;

        if result.rows_affected() == 0 {
            return Err(self.rejection(id, DeliveryStatus::Sent).await);
        }
        Ok(())
    }

    async fn mark_delivered(&self, id: &DeliveryId) -> Result<()> {
        let result = sqlx::query(
            "UPDATE delivery_tracking SET status = 'delivered', delivered_at = NOW(), \
             updated_at = NOW() WHERE id = $1 AND status = 'sent'",
        )
        .bind(id.0)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("failed to mark delivery delivered", e))?;

        if result.rows_affected() == 0 {
            return Err(self.rejection(id, DeliveryStatus::Delivered).await);
        }
        Ok(())
    }

    async fn mark_failed(&self, id: &DeliveryId, error: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE delivery_tracking SET status = 'failed', failed_at = NOW(), \
             error_message = $2, updated_at = NOW() \
             WHERE id = $1 AND status IN ('pending', 'sent')",
        )
        .bind(id.0)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("failed to mark delivery failed", e))?;

        if result.rows_affected() == 0 {
            return Err(self.rejection(id, DeliveryStatus::Failed).await);
        }
        Ok(())
    }

    async fn mark_retrying(&self, id: &DeliveryId) -> Result<()> {
        let result = sqlx::query(
            "UPDATE delivery_tracking SET status = 'pending', \
             retry_count = retry_count + 1, updated_at = NOW() \
             WHERE id = $1 AND status = 'failed'",
        )
        .bind(id.0)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("failed to mark delivery retrying", e))?;

        if result.rows_affected() == 0 {
            return Err(self.rejection(id, DeliveryStatus::Pending).await);
        }
        Ok(())
    }

    async fn create_delivered(&self, attempt: &DeliveryAttempt) -> Result<()> {
        insert(&self.pool, attempt).await
    }

    async fn expire_for_notification(&self, notification_id: &NotificationId) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE delivery_tracking SET status = 'expired', updated_at = NOW() \
             WHERE notification_id = $1 AND status IN ('pending', 'sent', 'failed')",
        )
        .bind(notification_id.0)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("failed to expire deliveries", e))?;
        Ok(result.rows_affected())
    }
}
