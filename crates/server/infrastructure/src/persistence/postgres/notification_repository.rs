//! PostgreSQL notification repository.

use crate::persistence::postgres::db_error;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_server_domain::notifications::{Notification, NotificationRepository};
use courier_server_domain::shared_kernel::{NotificationId, NotificationKind, Result, UserId};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct PostgresNotificationRepository {
    pool: PgPool,
}

impl PostgresNotificationRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn map_notification(row: PgRow) -> Notification {
    Notification {
        id: NotificationId(row.get("id")),
        user_id: UserId::from(row.get::<String, _>("user_id")),
        title: row.get("title"),
        message: row.get("message"),
        data: row.get("data"),
        kind: NotificationKind::from_str(row.get::<String, _>("notification_type").as_str())
            .unwrap_or_default(),
        sender_id: row.get("sender_id"),
        priority: row.get("priority"),
        created_at: row.get("created_at"),
        expires_at: row.get("expires_at"),
    }
}

const SELECT_COLUMNS: &str = "id, user_id, title, message, data, notification_type, sender_id, \
     priority, created_at, expires_at";

#[async_trait]
impl NotificationRepository for PostgresNotificationRepository {
    async fn save(&self, notification: &Notification) -> Result<()> {
        sqlx::query(
            "INSERT INTO notifications \
             (id, user_id, title, message, data, notification_type, sender_id, priority, created_at, expires_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(notification.id.0)
        .bind(notification.user_id.as_str())
        .bind(&notification.title)
        .bind(&notification.message)
        .bind(&notification.data)
        .bind(notification.kind.as_str())
        .bind(&notification.sender_id)
        .bind(notification.priority)
        .bind(notification.created_at)
        .bind(notification.expires_at)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("failed to save notification", e))?;
        Ok(())
    }

    async fn find_by_id(&self, id: &NotificationId) -> Result<Option<Notification>> {
        sqlx::query(&format!(
            "SELECT {} FROM notifications WHERE id = $1",
            SELECT_COLUMNS
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .map(|row| row.map(map_notification))
        .map_err(|e| db_error("failed to load notification", e))
    }

    async fn find_by_user(
        &self,
        user_id: &UserId,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Notification>> {
        sqlx::query(&format!(
            "SELECT {} FROM notifications WHERE user_id = $1 \
             ORDER BY created_at DESC LIMIT $2 OFFSET $3",
            SELECT_COLUMNS
        ))
        .bind(user_id.as_str())
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map(|rows| rows.into_iter().map(map_notification).collect())
        .map_err(|e| db_error("failed to load user notifications", e))
    }

    async fn find_expired(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Notification>> {
        sqlx::query(&format!(
            "SELECT {} FROM notifications WHERE expires_at IS NOT NULL AND expires_at < $1 \
             ORDER BY expires_at LIMIT $2",
            SELECT_COLUMNS
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map(|rows| rows.into_iter().map(map_notification).collect())
        .map_err(|e| db_error("failed to load expired notifications", e))
    }
}
