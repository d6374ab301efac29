//! Shared test utilities for apflow integration tests.
//!
//! Each test gets its own SQLite database: a temp file by default (so
//! multiple pool connections see the same data), or a single-connection
//! in-memory pool for tests that never exercise concurrency.

use std::sync::Arc;

use sqlx::SqlitePool;
use tempfile::NamedTempFile;

use apflow_db::models::TaskDependency;
use apflow_db::schema::TaskTableSchema;
use apflow_db::{DbConfig, TaskRepository, create_pool, ensure_schema};

/// A per-test database. The temp file is deleted when this is dropped.
pub struct TestDb {
    pub pool: SqlitePool,
    pub schema: Arc<TaskTableSchema>,
    _file: NamedTempFile,
}

impl TestDb {
    /// Repository over this database with its schema.
    pub fn repository(&self) -> TaskRepository {
        TaskRepository::new(self.pool.clone(), Arc::clone(&self.schema))
    }
}

/// Create a temp-file database with the default task table applied.
pub async fn create_test_db() -> TestDb {
    create_test_db_with_schema(TaskTableSchema::default()).await
}

/// Create a temp-file database with a caller-supplied table schema applied.
pub async fn create_test_db_with_schema(schema: TaskTableSchema) -> TestDb {
    let file = NamedTempFile::new().expect("failed to create temp database file");
    let url = format!("sqlite://{}?mode=rwc", file.path().display());
    let pool = create_pool(&DbConfig::new(url))
        .await
        .expect("failed to open temp database");
    ensure_schema(&pool, &schema)
        .await
        .expect("schema setup should succeed");
    TestDb {
        pool,
        schema: Arc::new(schema),
        _file: file,
    }
}

/// Initialize tracing for tests. Safe to call more than once.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// `{id, required: true}` dependency reference.
pub fn dep(id: &str) -> TaskDependency {
    TaskDependency::required_on(id)
}
