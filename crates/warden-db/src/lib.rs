//! Persistence layer for the warden kernel.
//!
//! Exposes a SQLite-backed store for workflow and task state, the
//! append-only event log, the versioned world state (with snapshots), and
//! the outbox. All tenant filtering happens inside the SQL queries in
//! [`queries`] -- callers never filter materialized rows.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;

pub use config::DbConfig;
pub use pool::{create_pool, default_migrations_path, run_migrations};
