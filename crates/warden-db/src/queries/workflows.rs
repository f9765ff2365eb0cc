//! Database query functions for the `workflow_states` table.
//!
//! Every tenant-scoped read carries its tenant predicate in the SQL text;
//! rows owned by another tenant are never materialized.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::models::{Workflow, WorkflowStatus};

/// Insert a workflow row if absent. Returns `true` when a new row was
/// created, `false` when the workflow already existed.
pub async fn insert_workflow(
    pool: &SqlitePool,
    workflow_id: &str,
    tenant_id: Option<&str>,
    now: DateTime<Utc>,
) -> Result<bool> {
    let result = sqlx::query(
        "INSERT INTO workflow_states (workflow_id, tenant_id, status, created_at, updated_at) \
         VALUES (?, ?, 'pending', ?, ?) \
         ON CONFLICT (workflow_id) DO NOTHING",
    )
    .bind(workflow_id)
    .bind(tenant_id)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await
    .with_context(|| format!("failed to insert workflow {workflow_id}"))?;

    Ok(result.rows_affected() > 0)
}

/// Fetch a single workflow.
///
/// When `tenant_id` is supplied the lookup only matches rows tagged with
/// exactly that tenant; a workflow owned by another tenant (or untagged)
/// resolves to `None`.
pub async fn get_workflow(
    pool: &SqlitePool,
    workflow_id: &str,
    tenant_id: Option<&str>,
) -> Result<Option<Workflow>> {
    let workflow = match tenant_id {
        Some(tenant) => {
            sqlx::query_as::<_, Workflow>(
                "SELECT * FROM workflow_states WHERE workflow_id = ? AND tenant_id = ?",
            )
            .bind(workflow_id)
            .bind(tenant)
            .fetch_optional(pool)
            .await
        }
        None => {
            sqlx::query_as::<_, Workflow>("SELECT * FROM workflow_states WHERE workflow_id = ?")
                .bind(workflow_id)
                .fetch_optional(pool)
                .await
        }
    }
    .with_context(|| format!("failed to fetch workflow {workflow_id}"))?;

    Ok(workflow)
}

/// List all workflows owned by a tenant, ordered by creation time.
pub async fn list_workflows_by_tenant(
    pool: &SqlitePool,
    tenant_id: &str,
) -> Result<Vec<Workflow>> {
    let workflows = sqlx::query_as::<_, Workflow>(
        "SELECT * FROM workflow_states WHERE tenant_id = ? ORDER BY created_at ASC, workflow_id ASC",
    )
    .bind(tenant_id)
    .fetch_all(pool)
    .await
    .with_context(|| format!("failed to list workflows for tenant {tenant_id}"))?;

    Ok(workflows)
}

/// Transition a workflow's status with optimistic locking on the current
/// status. Returns the number of rows updated (0 means the status did not
/// match or the workflow does not exist).
pub async fn transition_workflow_status(
    pool: &SqlitePool,
    workflow_id: &str,
    from: &[WorkflowStatus],
    to: WorkflowStatus,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<u64> {
    let placeholders = vec!["?"; from.len()].join(", ");
    let sql = format!(
        "UPDATE workflow_states \
         SET status = ?, \
             updated_at = ?, \
             started_at = COALESCE(started_at, ?), \
             completed_at = COALESCE(?, completed_at) \
         WHERE workflow_id = ? AND status IN ({placeholders})"
    );

    let mut query = sqlx::query(&sql)
        .bind(to)
        .bind(now)
        .bind(started_at)
        .bind(completed_at)
        .bind(workflow_id);
    for status in from {
        query = query.bind(*status);
    }

    let result = query
        .execute(pool)
        .await
        .with_context(|| format!("failed to transition workflow {workflow_id} to {to}"))?;

    Ok(result.rows_affected())
}
