//! Shared test utilities for warden integration tests.
//!
//! Each test gets its own SQLite database file in a temp directory with
//! all migrations applied. The temp directory handle must be kept alive
//! for the duration of the test; dropping it deletes the database.

use sqlx::SqlitePool;
use tempfile::TempDir;
use uuid::Uuid;

use warden_db::{DbConfig, create_pool, default_migrations_path, run_migrations};

/// Create a temporary database with migrations applied.
///
/// Returns `(pool, dir)`. Hold `dir` until the test is done; the database
/// file lives inside it.
pub async fn create_test_db() -> (SqlitePool, TempDir) {
    let dir = TempDir::new().expect("failed to create temp dir for test database");
    let db_path = dir.path().join(format!("warden_test_{}.db", Uuid::new_v4().simple()));

    let config = DbConfig::at_path(&db_path);
    let pool = create_pool(&config)
        .await
        .expect("failed to open test database");

    run_migrations(&pool, default_migrations_path())
        .await
        .expect("failed to run migrations on test database");

    (pool, dir)
}

/// Install a subscriber that prints `tracing` output for failing tests.
///
/// Safe to call from every test; only the first call installs.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_test_writer()
        .try_init();
}
