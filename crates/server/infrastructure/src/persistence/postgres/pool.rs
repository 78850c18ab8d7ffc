//! Connection pool construction.

use crate::persistence::postgres::db_error;
use courier_server_domain::shared_kernel::Result;
use courier_shared::DatabaseConfig;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use std::str::FromStr;

/// Builds the pool with the service schema on the search path, so the
/// repositories can use unqualified table names.
pub async fn connect_pool(config: &DatabaseConfig) -> Result<PgPool> {
    let options = PgConnectOptions::from_str(&config.url)
        .map_err(|e| db_error("invalid database url", e))?
        .options([("search_path", config.schema.as_str())]);

    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.connect_timeout)
        .connect_with(options)
        .await
        .map_err(|e| db_error("failed to connect to database", e))
}
