//! Schema bootstrap.
//!
//! Idempotent DDL for the five service tables and the indexes the delivery
//! engine depends on. Applied at startup before any repository is used.

use crate::persistence::postgres::db_error;
use courier_server_domain::shared_kernel::Result;
use sqlx::PgPool;
use tracing::info;

const STATEMENTS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS devices (
        id UUID PRIMARY KEY,
        device_identifier TEXT NOT NULL,
        user_id TEXT,
        model TEXT,
        verified BOOLEAN NOT NULL DEFAULT FALSE,
        last_access TIMESTAMPTZ NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        deleted_at TIMESTAMPTZ
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_devices_identifier_live
        ON devices (device_identifier) WHERE deleted_at IS NULL",
    "CREATE INDEX IF NOT EXISTS idx_devices_user_id ON devices (user_id)",
    "CREATE TABLE IF NOT EXISTS notification_tokens (
        id UUID PRIMARY KEY,
        device_id UUID NOT NULL,
        token TEXT NOT NULL,
        token_type TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        expires_at TIMESTAMPTZ NOT NULL,
        is_active BOOLEAN NOT NULL DEFAULT TRUE,
        is_revoked BOOLEAN NOT NULL DEFAULT FALSE,
        UNIQUE (device_id, token_type)
    )",
    "CREATE INDEX IF NOT EXISTS idx_notification_tokens_device_id
        ON notification_tokens (device_id)",
    "CREATE INDEX IF NOT EXISTS idx_notification_tokens_token_type
        ON notification_tokens (token_type)",
    "CREATE TABLE IF NOT EXISTS notifications (
        id UUID PRIMARY KEY,
        user_id TEXT NOT NULL,
        title TEXT NOT NULL,
        message TEXT NOT NULL,
        data JSONB NOT NULL DEFAULT '{}'::jsonb,
        notification_type TEXT NOT NULL,
        sender_id TEXT,
        priority INTEGER NOT NULL DEFAULT 0,
        created_at TIMESTAMPTZ NOT NULL,
        expires_at TIMESTAMPTZ
    )",
    "CREATE INDEX IF NOT EXISTS idx_notifications_user_id ON notifications (user_id)",
    "CREATE TABLE IF NOT EXISTS delivery_tracking (
        id UUID PRIMARY KEY,
        notification_id UUID NOT NULL,
        device_id UUID NOT NULL,
        channel TEXT NOT NULL,
        status TEXT NOT NULL,
        sent_at TIMESTAMPTZ,
        delivered_at TIMESTAMPTZ,
        failed_at TIMESTAMPTZ,
        retry_count INTEGER NOT NULL DEFAULT 0,
        error_message TEXT,
        provider_message_id TEXT,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_delivery_tracking_notification_id
        ON delivery_tracking (notification_id)",
    "CREATE INDEX IF NOT EXISTS idx_delivery_tracking_device_id
        ON delivery_tracking (device_id)",
    "CREATE INDEX IF NOT EXISTS idx_delivery_tracking_status
        ON delivery_tracking (status)",
    "CREATE TABLE IF NOT EXISTS message_queue (
        id UUID PRIMARY KEY,
        delivery_id UUID NOT NULL,
        payload JSONB NOT NULL,
        status TEXT NOT NULL,
        retry_count INTEGER NOT NULL DEFAULT 0,
        next_attempt_at TIMESTAMPTZ NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_message_queue_status ON message_queue (status)",
    "CREATE INDEX IF NOT EXISTS idx_message_queue_next_attempt_at
        ON message_queue (next_attempt_at)",
];

/// Creates the schema and tables if they do not exist.
pub async fn run_migrations(pool: &PgPool, schema: &str) -> Result<()> {
    sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", schema))
        .execute(pool)
        .await
        .map_err(|e| db_error("failed to create schema", e))?;

    for statement in STATEMENTS {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| db_error("migration statement failed", e))?;
    }

    info!(schema, "database migrations applied");
    Ok(())
}
