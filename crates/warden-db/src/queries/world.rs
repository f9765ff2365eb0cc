//! Database query functions for the `world_state` and `world_snapshots`
//! tables.
//!
//! Updates and deletes carry the caller's expected version in the WHERE
//! clause; a zero-row update means the version has moved (optimistic
//! concurrency conflict) or the key is gone.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::SqlitePool;
use sqlx::types::Json;

use crate::models::{Snapshot, WorldEntry};

/// Insert a new entry at version 1. Returns `true` when the key was
/// created, `false` when it already existed.
pub async fn insert_entry(
    pool: &SqlitePool,
    key: &str,
    value: &Value,
    now: DateTime<Utc>,
) -> Result<bool> {
    let result = sqlx::query(
        "INSERT INTO world_state (key, value, version, created_at, updated_at) \
         VALUES (?, ?, 1, ?, ?) \
         ON CONFLICT (key) DO NOTHING",
    )
    .bind(key)
    .bind(Json(value))
    .bind(now)
    .bind(now)
    .execute(pool)
    .await
    .with_context(|| format!("failed to insert world entry {key:?}"))?;

    Ok(result.rows_affected() > 0)
}

/// Fetch a single entry by key.
pub async fn get_entry(pool: &SqlitePool, key: &str) -> Result<Option<WorldEntry>> {
    let entry = sqlx::query_as::<_, WorldEntry>("SELECT * FROM world_state WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await
        .with_context(|| format!("failed to fetch world entry {key:?}"))?;

    Ok(entry)
}

/// List all entries ordered by key (lexicographic).
pub async fn list_entries(pool: &SqlitePool) -> Result<Vec<WorldEntry>> {
    let entries =
        sqlx::query_as::<_, WorldEntry>("SELECT * FROM world_state ORDER BY key ASC")
            .fetch_all(pool)
            .await
            .context("failed to list world entries")?;

    Ok(entries)
}

/// Update an entry, bumping its version. When `expected_version` is
/// supplied the update only applies if the stored version matches.
/// Returns rows affected.
pub async fn update_entry(
    pool: &SqlitePool,
    key: &str,
    value: &Value,
    expected_version: Option<i64>,
    now: DateTime<Utc>,
) -> Result<u64> {
    let result = match expected_version {
        Some(expected) => {
            sqlx::query(
                "UPDATE world_state \
                 SET value = ?, version = version + 1, updated_at = ? \
                 WHERE key = ? AND version = ?",
            )
            .bind(Json(value))
            .bind(now)
            .bind(key)
            .bind(expected)
            .execute(pool)
            .await
        }
        None => {
            sqlx::query(
                "UPDATE world_state \
                 SET value = ?, version = version + 1, updated_at = ? \
                 WHERE key = ?",
            )
            .bind(Json(value))
            .bind(now)
            .bind(key)
            .execute(pool)
            .await
        }
    }
    .with_context(|| format!("failed to update world entry {key:?}"))?;

    Ok(result.rows_affected())
}

/// Delete an entry, optionally guarded by an expected version. Returns
/// rows affected.
pub async fn delete_entry(
    pool: &SqlitePool,
    key: &str,
    expected_version: Option<i64>,
) -> Result<u64> {
    let result = match expected_version {
        Some(expected) => {
            sqlx::query("DELETE FROM world_state WHERE key = ? AND version = ?")
                .bind(key)
                .bind(expected)
                .execute(pool)
                .await
        }
        None => {
            sqlx::query("DELETE FROM world_state WHERE key = ?")
                .bind(key)
                .execute(pool)
                .await
        }
    }
    .with_context(|| format!("failed to delete world entry {key:?}"))?;

    Ok(result.rows_affected())
}

/// Upsert an entry during snapshot restore, forcing the given version.
pub async fn restore_entry(
    pool: &SqlitePool,
    key: &str,
    value: &Value,
    version: i64,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO world_state (key, value, version, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?) \
         ON CONFLICT (key) DO UPDATE SET value = excluded.value, \
                                         version = excluded.version, \
                                         updated_at = excluded.updated_at",
    )
    .bind(key)
    .bind(Json(value))
    .bind(version)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await
    .with_context(|| format!("failed to restore world entry {key:?}"))?;

    Ok(())
}

/// Persist a snapshot (full keyed copy of the world state).
pub async fn insert_snapshot(
    pool: &SqlitePool,
    id: &str,
    entries: &Value,
    taken_at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query("INSERT INTO world_snapshots (id, entries, taken_at) VALUES (?, ?, ?)")
        .bind(id)
        .bind(Json(entries))
        .bind(taken_at)
        .execute(pool)
        .await
        .with_context(|| format!("failed to insert snapshot {id}"))?;

    Ok(())
}

/// Fetch a persisted snapshot by id.
pub async fn get_snapshot(pool: &SqlitePool, id: &str) -> Result<Option<Snapshot>> {
    let snapshot =
        sqlx::query_as::<_, Snapshot>("SELECT * FROM world_snapshots WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await
            .with_context(|| format!("failed to fetch snapshot {id}"))?;

    Ok(snapshot)
}
