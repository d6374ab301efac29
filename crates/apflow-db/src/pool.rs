use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use tracing::info;

use crate::config::DbConfig;
use crate::schema::TaskTableSchema;

/// Create a connection pool with sensible defaults.
pub async fn create_pool(config: &DbConfig) -> Result<SqlitePool> {
    let mut options = SqlitePoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(10));

    if config.is_memory() {
        // A memory database exists per-connection; one connection that is
        // never reaped keeps it alive for the pool's lifetime.
        options = options
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None);
    }

    let pool = options
        .connect(&config.database_url)
        .await
        .with_context(|| format!("failed to connect to database at {}", config.database_url))?;
    Ok(pool)
}

/// Create the task table and its indexes if they do not exist yet.
///
/// The DDL is generated from the active [`TaskTableSchema`] so user-defined
/// columns are part of the table from the start.
pub async fn ensure_schema(pool: &SqlitePool, schema: &TaskTableSchema) -> Result<()> {
    sqlx::query(&schema.create_table_sql())
        .execute(pool)
        .await
        .with_context(|| format!("failed to create table {}", schema.table()))?;

    for stmt in schema.create_index_sql() {
        sqlx::query(&stmt)
            .execute(pool)
            .await
            .with_context(|| format!("failed to create index: {stmt}"))?;
    }

    info!(table = schema.table(), "task table schema ensured");
    Ok(())
}
