//! Semantic state-transition helpers used by the orchestrator.
//!
//! Each helper validates the transition against [`super::TaskStateMachine`]
//! and surfaces an optimistic-lock failure as an error naming the actual
//! status found in the store.

use anyhow::{Context, Result, bail};
use chrono::Utc;
use serde_json::Value;
use sqlx::SqlitePool;

use warden_db::models::{TaskStatus, WorkflowStatus};
use warden_db::queries::tasks as task_db;
use warden_db::queries::workflows as workflow_db;

use super::TaskStateMachine;

/// Begin a task attempt: `pending`/`retrying` -> `running`, incrementing
/// the attempt counter.
pub async fn begin_attempt(pool: &SqlitePool, workflow_id: &str, task_id: &str) -> Result<i64> {
    let task = task_db::get_task(pool, workflow_id, task_id)
        .await?
        .with_context(|| format!("task {workflow_id}/{task_id} not found"))?;

    if !TaskStateMachine::is_valid_transition(task.status, TaskStatus::Running) {
        bail!(
            "invalid state transition: {} -> running for task {}/{}",
            task.status,
            workflow_id,
            task_id
        );
    }

    let rows = task_db::begin_attempt(pool, workflow_id, task_id, task.status, Utc::now()).await?;
    if rows == 0 {
        bail!(
            "optimistic lock failed beginning attempt for task {}/{}",
            workflow_id,
            task_id
        );
    }

    Ok(task.attempt + 1)
}

/// Complete a task: `running -> completed` with result and metadata.
pub async fn complete_task(
    pool: &SqlitePool,
    workflow_id: &str,
    task_id: &str,
    result: &Value,
    metadata: &Value,
) -> Result<()> {
    let rows =
        task_db::complete_task(pool, workflow_id, task_id, result, metadata, Utc::now()).await?;
    if rows == 0 {
        fail_with_actual_status(pool, workflow_id, task_id, TaskStatus::Completed).await?;
    }
    Ok(())
}

/// Terminally fail a task: `running -> failed` (or `running -> timeout`
/// when `timed_out` is set).
pub async fn fail_task(
    pool: &SqlitePool,
    workflow_id: &str,
    task_id: &str,
    error: &str,
    metadata: &Value,
    timed_out: bool,
) -> Result<()> {
    let to = if timed_out {
        TaskStatus::Timeout
    } else {
        TaskStatus::Failed
    };
    let rows = task_db::fail_task(
        pool,
        workflow_id,
        task_id,
        to,
        error,
        metadata,
        timed_out,
        Utc::now(),
    )
    .await?;
    if rows == 0 {
        fail_with_actual_status(pool, workflow_id, task_id, to).await?;
    }
    Ok(())
}

/// Record a failed attempt with retry budget left: `running -> retrying`.
pub async fn mark_retrying(
    pool: &SqlitePool,
    workflow_id: &str,
    task_id: &str,
    error: &str,
    timed_out: bool,
) -> Result<()> {
    let rows =
        task_db::mark_retrying(pool, workflow_id, task_id, error, timed_out, Utc::now()).await?;
    if rows == 0 {
        fail_with_actual_status(pool, workflow_id, task_id, TaskStatus::Retrying).await?;
    }
    Ok(())
}

/// Crash recovery: put a task found `running` back into `retrying` so the
/// next `begin_attempt` re-enters with the same attempt number.
pub async fn reset_orphaned_task(
    pool: &SqlitePool,
    workflow_id: &str,
    task_id: &str,
) -> Result<bool> {
    let rows =
        task_db::reset_running_to_retrying(pool, workflow_id, task_id, Utc::now()).await?;
    Ok(rows > 0)
}

/// Mark the workflow running (from `pending`, `running`, or `failed` when
/// resuming after a crash).
pub async fn mark_workflow_running(pool: &SqlitePool, workflow_id: &str) -> Result<()> {
    let now = Utc::now();
    let rows = workflow_db::transition_workflow_status(
        pool,
        workflow_id,
        &[
            WorkflowStatus::Pending,
            WorkflowStatus::Running,
            WorkflowStatus::Failed,
            WorkflowStatus::Paused,
        ],
        WorkflowStatus::Running,
        Some(now),
        None,
        now,
    )
    .await?;
    if rows == 0 {
        bail!("workflow {workflow_id} cannot transition to running");
    }
    Ok(())
}

/// Mark the workflow completed.
pub async fn mark_workflow_completed(pool: &SqlitePool, workflow_id: &str) -> Result<()> {
    let now = Utc::now();
    let rows = workflow_db::transition_workflow_status(
        pool,
        workflow_id,
        &[WorkflowStatus::Running],
        WorkflowStatus::Completed,
        None,
        Some(now),
        now,
    )
    .await?;
    if rows == 0 {
        bail!("workflow {workflow_id} cannot transition to completed");
    }
    Ok(())
}

/// Mark the workflow failed.
pub async fn mark_workflow_failed(pool: &SqlitePool, workflow_id: &str) -> Result<()> {
    let now = Utc::now();
    let rows = workflow_db::transition_workflow_status(
        pool,
        workflow_id,
        &[WorkflowStatus::Pending, WorkflowStatus::Running],
        WorkflowStatus::Failed,
        None,
        Some(now),
        now,
    )
    .await?;
    if rows == 0 {
        bail!("workflow {workflow_id} cannot transition to failed");
    }
    Ok(())
}

/// Produce a descriptive error after a zero-row optimistic update.
async fn fail_with_actual_status(
    pool: &SqlitePool,
    workflow_id: &str,
    task_id: &str,
    wanted: TaskStatus,
) -> Result<()> {
    let task = task_db::get_task(pool, workflow_id, task_id).await?;
    match task {
        None => bail!("task {workflow_id}/{task_id} not found"),
        Some(t) => bail!(
            "optimistic lock failed: task {}/{} has status {}, cannot move to {}",
            workflow_id,
            task_id,
            t.status,
            wanted
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_graph_edges() {
        use TaskStatus::*;
        let valid = [
            (Pending, Running),
            (Retrying, Running),
            (Running, Completed),
            (Running, Failed),
            (Running, Timeout),
            (Running, Retrying),
        ];
        for (from, to) in valid {
            assert!(
                TaskStateMachine::is_valid_transition(from, to),
                "{from} -> {to} should be valid"
            );
        }

        let invalid = [
            (Pending, Completed),
            (Completed, Running),
            (Failed, Running),
            (Timeout, Running),
            (Retrying, Failed),
            (Pending, Retrying),
        ];
        for (from, to) in invalid {
            assert!(
                !TaskStateMachine::is_valid_transition(from, to),
                "{from} -> {to} should be invalid"
            );
        }
    }
}
