//! Reverse-order saga compensation.
//!
//! After a mid-workflow failure, the compensation actions of every
//! completed step run in LIFO order, each independently: a failing
//! compensation emits `compensation_failed` and the saga continues. The
//! runner is driven by the orchestrator only and never interleaves with
//! forward progress on the same workflow.

use std::sync::Arc;

use serde_json::json;
use tracing::{info, warn};

use crate::capability::CompensationExecutor;
use crate::events::{EventKind, EventLog};
use crate::spec::WorkflowSpec;

/// Result of one compensation action.
#[derive(Debug, Clone)]
pub struct CompensationOutcome {
    pub task_id: String,
    pub tool: String,
    pub success: bool,
    pub error: Option<String>,
}

/// Executes compensations in reverse completion order.
pub struct SagaRunner {
    executor: Arc<dyn CompensationExecutor>,
    events: EventLog,
}

impl SagaRunner {
    pub fn new(executor: Arc<dyn CompensationExecutor>, events: EventLog) -> Self {
        Self { executor, events }
    }

    /// Run the compensation action of each completed step, last completed
    /// first. Steps without a compensation action are skipped.
    pub async fn compensate(
        &self,
        spec: &WorkflowSpec,
        completed_steps: &[String],
        tenant_id: Option<&str>,
    ) -> Vec<CompensationOutcome> {
        let mut outcomes = Vec::new();

        for task_id in completed_steps.iter().rev() {
            let Some(task) = spec.task(task_id) else {
                continue;
            };
            let Some(action) = &task.compensation_action else {
                continue;
            };

            let result = self.executor.execute(action, &spec.id, task_id).await;

            let outcome = match result {
                Ok(_) => {
                    info!(
                        workflow_id = %spec.id,
                        task_id = %task_id,
                        tool = %action.tool,
                        "compensation completed"
                    );
                    self.emit(
                        EventKind::CompensationCompleted,
                        spec,
                        task_id,
                        tenant_id,
                        json!({ "tool": action.tool }),
                    )
                    .await;
                    CompensationOutcome {
                        task_id: task_id.clone(),
                        tool: action.tool.clone(),
                        success: true,
                        error: None,
                    }
                }
                Err(e) => {
                    warn!(
                        workflow_id = %spec.id,
                        task_id = %task_id,
                        tool = %action.tool,
                        error = %e,
                        "compensation failed, saga continues"
                    );
                    self.emit(
                        EventKind::CompensationFailed,
                        spec,
                        task_id,
                        tenant_id,
                        json!({ "tool": action.tool, "error": e.to_string() }),
                    )
                    .await;
                    CompensationOutcome {
                        task_id: task_id.clone(),
                        tool: action.tool.clone(),
                        success: false,
                        error: Some(e.to_string()),
                    }
                }
            };

            outcomes.push(outcome);
        }

        outcomes
    }

    async fn emit(
        &self,
        kind: EventKind,
        spec: &WorkflowSpec,
        task_id: &str,
        tenant_id: Option<&str>,
        data: serde_json::Value,
    ) {
        if let Err(e) = self
            .events
            .append(kind, &spec.id, Some(task_id), tenant_id, Some(data))
            .await
        {
            warn!(error = %e, "failed to append compensation event");
        }
    }
}
