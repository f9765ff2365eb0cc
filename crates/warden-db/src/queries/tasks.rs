//! Database query functions for the `task_states` table.
//!
//! Status transitions use optimistic locking: every UPDATE carries the
//! expected current status in its WHERE clause and reports the number of
//! rows touched, so a single-writer discipline violation surfaces as a
//! zero-row update instead of silent state corruption.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::SqlitePool;
use sqlx::types::Json;

use crate::models::{Task, TaskStatus};

/// Insert a task row with default state if absent. Returns `true` when a
/// new row was created.
pub async fn insert_task(
    pool: &SqlitePool,
    workflow_id: &str,
    task_id: &str,
    now: DateTime<Utc>,
) -> Result<bool> {
    let result = sqlx::query(
        "INSERT INTO task_states (workflow_id, task_id, status, attempt, metadata, updated_at) \
         VALUES (?, ?, 'pending', 0, '{}', ?) \
         ON CONFLICT (workflow_id, task_id) DO NOTHING",
    )
    .bind(workflow_id)
    .bind(task_id)
    .bind(now)
    .execute(pool)
    .await
    .with_context(|| format!("failed to insert task {workflow_id}/{task_id}"))?;

    Ok(result.rows_affected() > 0)
}

/// Fetch a single task by workflow and task id (unscoped, kernel-internal).
pub async fn get_task(
    pool: &SqlitePool,
    workflow_id: &str,
    task_id: &str,
) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>(
        "SELECT * FROM task_states WHERE workflow_id = ? AND task_id = ?",
    )
    .bind(workflow_id)
    .bind(task_id)
    .fetch_optional(pool)
    .await
    .with_context(|| format!("failed to fetch task {workflow_id}/{task_id}"))?;

    Ok(task)
}

/// Fetch a single task, visible only when the owning workflow belongs to
/// the given tenant. Task visibility is inherited from the workflow, and
/// the tenant predicate lives in the JOIN, not in post-filtering.
pub async fn get_task_for_tenant(
    pool: &SqlitePool,
    workflow_id: &str,
    task_id: &str,
    tenant_id: &str,
) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>(
        "SELECT t.* FROM task_states t \
         JOIN workflow_states w ON w.workflow_id = t.workflow_id \
         WHERE t.workflow_id = ? AND t.task_id = ? AND w.tenant_id = ?",
    )
    .bind(workflow_id)
    .bind(task_id)
    .bind(tenant_id)
    .fetch_optional(pool)
    .await
    .with_context(|| format!("failed to fetch task {workflow_id}/{task_id} for tenant"))?;

    Ok(task)
}

/// List all tasks for a workflow, ordered by task id.
pub async fn list_tasks_for_workflow(
    pool: &SqlitePool,
    workflow_id: &str,
) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM task_states WHERE workflow_id = ? ORDER BY task_id ASC",
    )
    .bind(workflow_id)
    .fetch_all(pool)
    .await
    .with_context(|| format!("failed to list tasks for workflow {workflow_id}"))?;

    Ok(tasks)
}

/// Begin an attempt: transition `pending` or `retrying` to `running`,
/// incrementing the attempt counter and stamping `started_at`. Returns
/// rows affected.
pub async fn begin_attempt(
    pool: &SqlitePool,
    workflow_id: &str,
    task_id: &str,
    from: TaskStatus,
    now: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE task_states \
         SET status = 'running', attempt = attempt + 1, started_at = ?, updated_at = ? \
         WHERE workflow_id = ? AND task_id = ? AND status = ?",
    )
    .bind(now)
    .bind(now)
    .bind(workflow_id)
    .bind(task_id)
    .bind(from)
    .execute(pool)
    .await
    .with_context(|| format!("failed to begin attempt for task {workflow_id}/{task_id}"))?;

    Ok(result.rows_affected())
}

/// Resume an interrupted attempt: transition `running` back to `running`
/// is not a legal edge, so crash recovery re-enters through `retrying`
/// without touching the attempt counter. Returns rows affected.
pub async fn reset_running_to_retrying(
    pool: &SqlitePool,
    workflow_id: &str,
    task_id: &str,
    now: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE task_states \
         SET status = 'retrying', attempt = CASE WHEN attempt > 0 THEN attempt - 1 ELSE 0 END, \
             updated_at = ? \
         WHERE workflow_id = ? AND task_id = ? AND status = 'running'",
    )
    .bind(now)
    .bind(workflow_id)
    .bind(task_id)
    .execute(pool)
    .await
    .with_context(|| format!("failed to reset orphaned task {workflow_id}/{task_id}"))?;

    Ok(result.rows_affected())
}

/// Complete a task: `running -> completed`, recording the result and
/// merged metadata. Returns rows affected.
pub async fn complete_task(
    pool: &SqlitePool,
    workflow_id: &str,
    task_id: &str,
    result_value: &Value,
    metadata: &Value,
    now: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE task_states \
         SET status = 'completed', result = ?, metadata = ?, completed_at = ?, updated_at = ? \
         WHERE workflow_id = ? AND task_id = ? AND status = 'running'",
    )
    .bind(Json(result_value))
    .bind(Json(metadata))
    .bind(now)
    .bind(now)
    .bind(workflow_id)
    .bind(task_id)
    .execute(pool)
    .await
    .with_context(|| format!("failed to complete task {workflow_id}/{task_id}"))?;

    Ok(result.rows_affected())
}

/// Terminally fail a task: `running -> failed` or `running -> timeout`,
/// recording the error, metadata, and the timed-out flag. Returns rows
/// affected.
pub async fn fail_task(
    pool: &SqlitePool,
    workflow_id: &str,
    task_id: &str,
    to: TaskStatus,
    error: &str,
    metadata: &Value,
    timed_out: bool,
    now: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE task_states \
         SET status = ?, error = ?, metadata = ?, timed_out = ?, completed_at = ?, updated_at = ? \
         WHERE workflow_id = ? AND task_id = ? AND status = 'running'",
    )
    .bind(to)
    .bind(error)
    .bind(Json(metadata))
    .bind(timed_out)
    .bind(now)
    .bind(now)
    .bind(workflow_id)
    .bind(task_id)
    .execute(pool)
    .await
    .with_context(|| format!("failed to fail task {workflow_id}/{task_id}"))?;

    Ok(result.rows_affected())
}

/// Mark a failed attempt as eligible for retry: `running -> retrying`,
/// recording the attempt's error. Returns rows affected.
pub async fn mark_retrying(
    pool: &SqlitePool,
    workflow_id: &str,
    task_id: &str,
    error: &str,
    timed_out: bool,
    now: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE task_states \
         SET status = 'retrying', error = ?, timed_out = ?, updated_at = ? \
         WHERE workflow_id = ? AND task_id = ? AND status = 'running'",
    )
    .bind(error)
    .bind(timed_out)
    .bind(now)
    .bind(workflow_id)
    .bind(task_id)
    .execute(pool)
    .await
    .with_context(|| format!("failed to mark task {workflow_id}/{task_id} retrying"))?;

    Ok(result.rows_affected())
}
