//! PostgreSQL channel token repository.
//!
//! The (device_id, token_type) unique constraint plus the upsert keep the
//! one-valid-token-per-channel invariant at the storage level.

use crate::persistence::postgres::db_error;
use async_trait::async_trait;
use courier_server_domain::shared_kernel::{ChannelKind, ChannelTokenId, DeviceId, Result};
use courier_server_domain::tokens::{ChannelToken, ChannelTokenRepository};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct PostgresChannelTokenRepository {
    pool: PgPool,
}

impl PostgresChannelTokenRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn map_token(row: PgRow) -> ChannelToken {
    ChannelToken {
        id: ChannelTokenId(row.get("id")),
        device_id: DeviceId(row.get("device_id")),
        value: row.get("token"),
        kind: ChannelKind::from_str(row.get::<String, _>("token_type").as_str())
            .unwrap_or(ChannelKind::WebSocket),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        expires_at: row.get("expires_at"),
        active: row.get("is_active"),
        revoked: row.get("is_revoked"),
    }
}

const SELECT_COLUMNS: &str =
    "id, device_id, token, token_type, created_at, updated_at, expires_at, is_active, is_revoked";

#[async_trait]
impl ChannelTokenRepository for PostgresChannelTokenRepository {
    async fn upsert(&self, token: &ChannelToken) -> Result<()> {
        sqlx::query(
            "INSERT INTO notification_tokens \
             (id, device_id, token, token_type, created_at, updated_at, expires_at, is_active, is_revoked) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             ON CONFLICT (device_id, token_type) DO UPDATE SET \
               token = EXCLUDED.token, \
               updated_at = EXCLUDED.updated_at, \
               expires_at = EXCLUDED.expires_at, \
               is_active = TRUE, \
               is_revoked = FALSE",
        )
        .bind(token.id.0)
        .bind(token.device_id.0)
        .bind(&token.value)
        .bind(token.kind.as_str())
        .bind(token.created_at)
        .bind(token.updated_at)
        .bind(token.expires_at)
        .bind(token.active)
        .bind(token.revoked)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("failed to upsert channel token", e))?;
        Ok(())
    }

    async fn find_active(
        &self,
        device_id: &DeviceId,
        kind: ChannelKind,
    ) -> Result<Option<ChannelToken>> {
        sqlx::query(&format!(
            "SELECT {} FROM notification_tokens \
             WHERE device_id = $1 AND token_type = $2 \
               AND is_active AND NOT is_revoked AND expires_at > NOW()",
            SELECT_COLUMNS
        ))
        .bind(device_id.0)
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await
        .map(|row| row.map(map_token))
        .map_err(|e| db_error("failed to load channel token", e))
    }

    async fn all_for_device(&self, device_id: &DeviceId) -> Result<Vec<ChannelToken>> {
        sqlx::query(&format!(
            "SELECT {} FROM notification_tokens \
             WHERE device_id = $1 AND is_active AND NOT is_revoked AND expires_at > NOW()",
            SELECT_COLUMNS
        ))
        .bind(device_id.0)
        .fetch_all(&self.pool)
        .await
        .map(|rows| rows.into_iter().map(map_token).collect())
        .map_err(|e| db_error("failed to load device tokens", e))
    }

    async fn revoke(&self, token_id: &ChannelTokenId) -> Result<()> {
        sqlx::query(
            "UPDATE notification_tokens SET is_revoked = TRUE, is_active = FALSE, \
             updated_at = NOW() WHERE id = $1",
        )
        .bind(token_id.0)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("failed to revoke channel token", e))?;
        Ok(())
    }

    async fn revoke_all_for_device(&self, device_id: &DeviceId) -> Result<()> {
        sqlx::query(
            "UPDATE notification_tokens SET is_revoked = TRUE, is_active = FALSE, \
             updated_at = NOW() WHERE device_id = $1",
        )
        .bind(device_id.0)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("failed to revoke device tokens", e))?;
        Ok(())
    }

    async fn delete_expired(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM notification_tokens WHERE expires_at < NOW()")
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("failed to delete expired tokens", e))?;
        Ok(result.rows_affected())
    }
}
