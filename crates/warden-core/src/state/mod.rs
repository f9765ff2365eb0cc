//! Workflow and task state: the durable store surface and the task state
//! machine.
//!
//! The orchestrator is the single writer for a workflow's state; every
//! transition goes through [`dispatch`], which enforces the allowed
//! transition graph with optimistic locking in the UPDATE's WHERE clause.

pub mod dispatch;

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::SqlitePool;

use warden_db::models::{Task, TaskStatus, Workflow, WorkflowStatus};
use warden_db::queries::tasks as task_db;
use warden_db::queries::workflows as workflow_db;

/// The task state machine.
///
/// Enforces the valid transition graph:
///
/// ```text
/// pending  -> running
/// retrying -> running
/// running  -> completed
/// running  -> failed
/// running  -> timeout
/// running  -> retrying  (attempt failed, budget left)
/// ```
///
/// `completed`, `failed`, and `timeout` are terminal.
pub struct TaskStateMachine;

impl TaskStateMachine {
    /// Check whether a transition from `from` to `to` is a valid edge in
    /// the state graph.
    pub fn is_valid_transition(from: TaskStatus, to: TaskStatus) -> bool {
        matches!(
            (from, to),
            (TaskStatus::Pending, TaskStatus::Running)
                | (TaskStatus::Retrying, TaskStatus::Running)
                | (TaskStatus::Running, TaskStatus::Completed)
                | (TaskStatus::Running, TaskStatus::Failed)
                | (TaskStatus::Running, TaskStatus::Timeout)
                | (TaskStatus::Running, TaskStatus::Retrying)
        )
    }
}

// ---------------------------------------------------------------------------
// Materialized state
// ---------------------------------------------------------------------------

/// Point-in-time view of one task's state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskState {
    pub status: TaskStatus,
    pub attempt: i64,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub timed_out: bool,
    pub metadata: Value,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<Task> for TaskState {
    fn from(row: Task) -> Self {
        Self {
            status: row.status,
            attempt: row.attempt,
            result: row.result.map(|j| j.0),
            error: row.error,
            timed_out: row.timed_out,
            metadata: row.metadata.0,
            started_at: row.started_at,
            completed_at: row.completed_at,
        }
    }
}

/// Point-in-time view of a workflow and all of its tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowState {
    pub workflow_id: String,
    pub tenant_id: Option<String>,
    pub status: WorkflowStatus,
    pub task_states: BTreeMap<String, TaskState>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowState {
    fn assemble(workflow: Workflow, tasks: Vec<Task>) -> Self {
        let task_states = tasks
            .into_iter()
            .map(|t| (t.task_id.clone(), TaskState::from(t)))
            .collect();
        Self {
            workflow_id: workflow.workflow_id,
            tenant_id: workflow.tenant_id,
            status: workflow.status,
            task_states,
            created_at: workflow.created_at,
            updated_at: workflow.updated_at,
            started_at: workflow.started_at,
            completed_at: workflow.completed_at,
        }
    }

    pub fn task(&self, task_id: &str) -> Option<&TaskState> {
        self.task_states.get(task_id)
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Tenant-aware store for workflow and task state.
#[derive(Debug, Clone)]
pub struct StateStore {
    pool: SqlitePool,
}

impl StateStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Ensure the workflow row and one task row per task id exist.
    ///
    /// Idempotent: resuming a workflow re-runs this without clobbering
    /// existing state.
    pub async fn init_workflow(
        &self,
        workflow_id: &str,
        tenant_id: Option<&str>,
        task_ids: &[&str],
    ) -> Result<()> {
        let now = Utc::now();
        workflow_db::insert_workflow(&self.pool, workflow_id, tenant_id, now).await?;
        for task_id in task_ids {
            task_db::insert_task(&self.pool, workflow_id, task_id, now).await?;
        }
        Ok(())
    }

    /// Load a workflow with all of its task states.
    ///
    /// With `tenant_id` supplied, a workflow owned by a different tenant
    /// (or untagged) is invisible and resolves to `None`.
    pub async fn load_workflow_state(
        &self,
        workflow_id: &str,
        tenant_id: Option<&str>,
    ) -> Result<Option<WorkflowState>> {
        let Some(workflow) =
            workflow_db::get_workflow(&self.pool, workflow_id, tenant_id).await?
        else {
            return Ok(None);
        };
        let tasks = task_db::list_tasks_for_workflow(&self.pool, workflow_id).await?;
        Ok(Some(WorkflowState::assemble(workflow, tasks)))
    }

    /// Load one task's state. Visibility is inherited from the owning
    /// workflow when a tenant is supplied.
    pub async fn load_task_state(
        &self,
        workflow_id: &str,
        task_id: &str,
        tenant_id: Option<&str>,
    ) -> Result<Option<TaskState>> {
        let task = match tenant_id {
            Some(tenant) => {
                task_db::get_task_for_tenant(&self.pool, workflow_id, task_id, tenant).await?
            }
            None => task_db::get_task(&self.pool, workflow_id, task_id).await?,
        };
        Ok(task.map(TaskState::from))
    }

    /// List the workflows owned by a tenant.
    pub async fn list_workflows_by_tenant(&self, tenant_id: &str) -> Result<Vec<WorkflowState>> {
        let workflows = workflow_db::list_workflows_by_tenant(&self.pool, tenant_id).await?;
        let mut states = Vec::with_capacity(workflows.len());
        for workflow in workflows {
            let tasks =
                task_db::list_tasks_for_workflow(&self.pool, &workflow.workflow_id).await?;
            states.push(WorkflowState::assemble(workflow, tasks));
        }
        Ok(states)
    }

    /// Fetch the raw task row (kernel-internal; no tenant scoping).
    pub async fn get_task(&self, workflow_id: &str, task_id: &str) -> Result<Option<Task>> {
        task_db::get_task(&self.pool, workflow_id, task_id).await
    }

    /// Fetch the raw workflow row (kernel-internal; no tenant scoping).
    pub async fn get_workflow(&self, workflow_id: &str) -> Result<Workflow> {
        workflow_db::get_workflow(&self.pool, workflow_id, None)
            .await?
            .with_context(|| format!("workflow {workflow_id} not found"))
    }
}
