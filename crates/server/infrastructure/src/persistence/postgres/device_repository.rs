//! PostgreSQL device repository.

use crate::persistence::postgres::db_error;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_server_domain::devices::{Device, DeviceRepository};
use courier_server_domain::shared_kernel::{DeviceId, Result, UserId};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

#[derive(Debug, Clone)]
pub struct PostgresDeviceRepository {
    pool: PgPool,
}

impl PostgresDeviceRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn map_device(row: PgRow) -> Device {
    Device {
        id: DeviceId(row.get("id")),
        device_identifier: row.get("device_identifier"),
        user_id: row.get::<Option<String>, _>("user_id").map(UserId::from),
        model: row.get("model"),
        verified: row.get("verified"),
        last_access: row.get("last_access"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        deleted_at: row.get("deleted_at"),
    }
}

const SELECT_COLUMNS: &str = "id, device_identifier, user_id, model, verified, last_access, \
     created_at, updated_at, deleted_at";

#[async_trait]
impl DeviceRepository for PostgresDeviceRepository {
    async fn save(&self, device: &Device) -> Result<()> {
        sqlx::query(
            "INSERT INTO devices \
             (id, device_identifier, user_id, model, verified, last_access, created_at, updated_at, deleted_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(device.id.0)
        .bind(&device.device_identifier)
        .bind(device.user_id.as_ref().map(|u| u.as_str()))
        .bind(&device.model)
        .bind(device.verified)
        .bind(device.last_access)
        .bind(device.created_at)
        .bind(device.updated_at)
        .bind(device.deleted_at)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("failed to save device", e))?;
        Ok(())
    }

    async fn update(&self, device: &Device) -> Result<()> {
        sqlx::query(
            "UPDATE devices SET user_id = $2, model = $3, verified = $4, last_access = $5, \
             updated_at = $6, deleted_at = $7 WHERE id = $1",
        )
        .bind(device.id.0)
        .bind(device.user_id.as_ref().map(|u| u.as_str()))
        .bind(&device.model)
        .bind(device.verified)
        .bind(device.last_access)
        .bind(device.updated_at)
        .bind(device.deleted_at)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("failed to update device", e))?;
        Ok(())
    }

    async fn find_by_id(&self, device_id: &DeviceId) -> Result<Option<Device>> {
        sqlx::query(&format!("SELECT {} FROM devices WHERE id = $1", SELECT_COLUMNS))
            .bind(device_id.0)
            .fetch_optional(&self.pool)
            .await
            .map(|row| row.map(map_device))
            .map_err(|e| db_error("failed to load device", e))
    }

    async fn find_by_identifier(&self, device_identifier: &str) -> Result<Option<Device>> {
        sqlx::query(&format!(
            "SELECT {} FROM devices WHERE device_identifier = $1 AND deleted_at IS NULL",
            SELECT_COLUMNS
        ))
        .bind(device_identifier)
        .fetch_optional(&self.pool)
        .await
        .map(|row| row.map(map_device))
        .map_err(|e| db_error("failed to load device by identifier", e))
    }

    async fn find_by_user(&self, user_id: &UserId) -> Result<Vec<Device>> {
        sqlx::query(&format!(
            "SELECT {} FROM devices WHERE user_id = $1 AND deleted_at IS NULL",
            SELECT_COLUMNS
        ))
        .bind(user_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map(|rows| rows.into_iter().map(map_device).collect())
        .map_err(|e| db_error("failed to load user devices", e))
    }

    async fn update_last_access(&self, device_id: &DeviceId) -> Result<()> {
        sqlx::query("UPDATE devices SET last_access = NOW(), updated_at = NOW() WHERE id = $1")
            .bind(device_id.0)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("failed to touch device", e))?;
        Ok(())
    }

    async fn soft_delete(&self, device_id: &DeviceId) -> Result<()> {
        sqlx::query(
            "UPDATE devices SET deleted_at = NOW(), updated_at = NOW() \
             WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(device_id.0)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("failed to delete device", e))?;
        Ok(())
    }

    async fn find_inactive(&self, threshold: DateTime<Utc>) -> Result<Vec<Device>> {
        sqlx::query(&format!(
            "SELECT {} FROM devices WHERE last_access < $1 AND deleted_at IS NULL",
            SELECT_COLUMNS
        ))
        .bind(threshold)
        .fetch_all(&self.pool)
        .await
        .map(|rows| rows.into_iter().map(map_device).collect())
        .map_err(|e| db_error("failed to load inactive devices", e))
    }
}
