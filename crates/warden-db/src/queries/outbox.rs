//! Database query functions for the `outbox_entries` table.
//!
//! The UNIQUE index on `idempotency_key` is the at-most-once guard: an
//! insert that loses the race affects zero rows and the caller re-reads
//! the surviving entry.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::SqlitePool;
use sqlx::types::Json;

use crate::models::{OutboxEntry, OutboxState};

/// Parameters for inserting a new outbox entry.
#[derive(Debug, Clone)]
pub struct NewOutboxEntry {
    pub id: String,
    pub workflow_id: String,
    pub task_id: String,
    pub tool_id: String,
    pub params: Value,
    pub idempotency_key: String,
    pub max_attempts: i64,
}

/// Insert a pending entry if the idempotency key is unused. Returns
/// `true` when the row was created, `false` when the key already exists.
pub async fn insert_pending(
    pool: &SqlitePool,
    new: &NewOutboxEntry,
    now: DateTime<Utc>,
) -> Result<bool> {
    let result = sqlx::query(
        "INSERT INTO outbox_entries \
         (id, workflow_id, task_id, tool_id, params, idempotency_key, state, attempts, max_attempts, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, 'pending', 0, ?, ?, ?) \
         ON CONFLICT (idempotency_key) DO NOTHING",
    )
    .bind(&new.id)
    .bind(&new.workflow_id)
    .bind(&new.task_id)
    .bind(&new.tool_id)
    .bind(Json(&new.params))
    .bind(&new.idempotency_key)
    .bind(new.max_attempts)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await
    .with_context(|| format!("failed to insert outbox entry for key {}", new.idempotency_key))?;

    Ok(result.rows_affected() > 0)
}

/// Fetch an entry by idempotency key.
pub async fn get_by_idempotency_key(
    pool: &SqlitePool,
    idempotency_key: &str,
) -> Result<Option<OutboxEntry>> {
    let entry = sqlx::query_as::<_, OutboxEntry>(
        "SELECT * FROM outbox_entries WHERE idempotency_key = ?",
    )
    .bind(idempotency_key)
    .fetch_optional(pool)
    .await
    .with_context(|| format!("failed to fetch outbox entry for key {idempotency_key}"))?;

    Ok(entry)
}

/// Claim an entry for execution: `pending` or `failed` -> `processing`,
/// incrementing the attempt counter. Returns rows affected; zero means
/// another worker holds the entry or it reached a terminal state.
pub async fn mark_processing(pool: &SqlitePool, id: &str, now: DateTime<Utc>) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE outbox_entries \
         SET state = 'processing', attempts = attempts + 1, updated_at = ? \
         WHERE id = ? AND state IN ('pending', 'failed')",
    )
    .bind(now)
    .bind(id)
    .execute(pool)
    .await
    .with_context(|| format!("failed to mark outbox entry {id} processing"))?;

    Ok(result.rows_affected())
}

/// Commit an entry with its result: `processing` -> `committed`.
pub async fn mark_committed(
    pool: &SqlitePool,
    id: &str,
    result_value: &Value,
    now: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE outbox_entries \
         SET state = 'committed', result = ?, error = NULL, updated_at = ? \
         WHERE id = ? AND state = 'processing'",
    )
    .bind(Json(result_value))
    .bind(now)
    .bind(id)
    .execute(pool)
    .await
    .with_context(|| format!("failed to commit outbox entry {id}"))?;

    Ok(result.rows_affected())
}

/// Record a failed execution: `processing` -> `failed`.
pub async fn mark_failed(
    pool: &SqlitePool,
    id: &str,
    error: &str,
    now: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE outbox_entries \
         SET state = 'failed', error = ?, updated_at = ? \
         WHERE id = ? AND state = 'processing'",
    )
    .bind(error)
    .bind(now)
    .bind(id)
    .execute(pool)
    .await
    .with_context(|| format!("failed to mark outbox entry {id} failed"))?;

    Ok(result.rows_affected())
}

/// Promote an exhausted entry to the dead letter state: `failed` ->
/// `dead_letter` when attempts have reached the budget.
pub async fn promote_dead_letter(pool: &SqlitePool, id: &str, now: DateTime<Utc>) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE outbox_entries \
         SET state = 'dead_letter', updated_at = ? \
         WHERE id = ? AND state = 'failed' AND attempts >= max_attempts",
    )
    .bind(now)
    .bind(id)
    .execute(pool)
    .await
    .with_context(|| format!("failed to dead-letter outbox entry {id}"))?;

    Ok(result.rows_affected())
}

/// Reset entries stuck in `processing` since before `stale_cutoff` back to
/// `pending`. Returns rows affected.
pub async fn reset_stale_processing(
    pool: &SqlitePool,
    stale_cutoff: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE outbox_entries \
         SET state = 'pending', updated_at = ? \
         WHERE state = 'processing' AND updated_at < ?",
    )
    .bind(now)
    .bind(stale_cutoff)
    .execute(pool)
    .await
    .context("failed to reset stale processing outbox entries")?;

    Ok(result.rows_affected())
}

/// Reset `failed` entries with retry budget left back to `pending`,
/// scoped to entries created after `min_created_at`. Returns rows
/// affected.
pub async fn retry_failed(
    pool: &SqlitePool,
    min_created_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE outbox_entries \
         SET state = 'pending', updated_at = ? \
         WHERE state = 'failed' AND attempts < max_attempts AND created_at >= ?",
    )
    .bind(now)
    .bind(min_created_at)
    .execute(pool)
    .await
    .context("failed to retry failed outbox entries")?;

    Ok(result.rows_affected())
}

/// Delete committed entries older than the retention horizon. Returns
/// rows deleted.
pub async fn delete_committed_before(
    pool: &SqlitePool,
    horizon: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "DELETE FROM outbox_entries WHERE state = 'committed' AND updated_at < ?",
    )
    .bind(horizon)
    .execute(pool)
    .await
    .context("failed to clean up committed outbox entries")?;

    Ok(result.rows_affected())
}

/// Count entries per state.
pub async fn count_by_state(pool: &SqlitePool) -> Result<Vec<(OutboxState, i64)>> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT state, COUNT(*) FROM outbox_entries GROUP BY state ORDER BY state",
    )
    .fetch_all(pool)
    .await
    .context("failed to count outbox entries by state")?;

    rows.into_iter()
        .map(|(state, count)| {
            let state = state
                .parse::<OutboxState>()
                .with_context(|| format!("unexpected outbox state {state:?} in database"))?;
            Ok((state, count))
        })
        .collect()
}

/// Whether any entry for the workflow is currently `processing`.
pub async fn has_processing_for_workflow(
    pool: &SqlitePool,
    workflow_id: &str,
) -> Result<bool> {
    let count: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM outbox_entries WHERE workflow_id = ? AND state = 'processing'",
    )
    .bind(workflow_id)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to check processing entries for workflow {workflow_id}"))?;

    Ok(count.0 > 0)
}
