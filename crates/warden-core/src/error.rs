//! Structured error types surfaced at the kernel boundary.
//!
//! Gate denials never escape the orchestrator as errors -- they become
//! task failures. What does escape is enumerated here, and every variant
//! carries enough context to be serialized into telemetry and audit
//! payloads.

use serde_json::{Value, json};
use thiserror::Error;

/// Errors surfaced by the kernel's public operations.
#[derive(Debug, Error)]
pub enum KernelError {
    /// A task failed and exhausted its recovery options.
    #[error("workflow {workflow_id} failed at task {task_id} (attempt {attempt}): {message}")]
    WorkflowExecution {
        workflow_id: String,
        task_id: String,
        attempt: i64,
        message: String,
    },

    /// Task execution exceeded its configured timeout.
    #[error("task {task_id} in workflow {workflow_id} timed out after {timeout_ms}ms")]
    TaskTimeout {
        workflow_id: String,
        task_id: String,
        timeout_ms: u64,
    },

    /// A persistence operation failed.
    #[error("state store failure: {0}")]
    StateStore(#[from] anyhow::Error),

    /// An outbox idempotency key was reused with different parameters.
    #[error("idempotency key {key:?} reused inconsistently: {reason}")]
    IdempotencyViolation { key: String, reason: String },

    /// A world-state rollback could not be performed.
    #[error("rollback failed: {0}")]
    Rollback(String),

    /// The requested snapshot does not exist.
    #[error("snapshot {0} not found")]
    SnapshotNotFound(String),

    /// The validation gate blocked a commit and recovery did not succeed.
    #[error("validation gate blocked task {task_id}: {reasons:?}")]
    CrvValidation {
        task_id: String,
        reasons: Vec<String>,
    },

    /// The policy gate denied an action.
    #[error("policy violation: {reason}")]
    PolicyViolation { reason: String },

    /// A required permission is missing.
    #[error("permission denied: {reason}")]
    PermissionDenied { reason: String },

    /// Principal or approval-token authentication failed.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Optimistic world-state version mismatch.
    #[error("version conflict on {key:?}: expected {expected}, found {actual}")]
    Conflict {
        key: String,
        expected: i64,
        actual: i64,
    },

    /// The scheduler encountered an unmet or undeclared dependency.
    #[error("dependency error for task {task_id}: {message}")]
    Dependency { task_id: String, message: String },

    /// A lock, outbox, or retry budget was exhausted.
    #[error("resource exhausted ({resource}): {message}")]
    ResourceExhausted { resource: String, message: String },

    /// A tool adapter failed.
    #[error("tool {tool} failed: {message}")]
    ToolExecution { tool: String, message: String },

    /// The workflow spec failed static validation.
    #[error("workflow validation failed: {0}")]
    Validation(String),
}

impl KernelError {
    /// Structured context for telemetry and audit payloads.
    pub fn context_json(&self) -> Value {
        match self {
            Self::WorkflowExecution {
                workflow_id,
                task_id,
                attempt,
                message,
            } => json!({
                "kind": "workflow_execution",
                "workflow_id": workflow_id,
                "task_id": task_id,
                "attempt": attempt,
                "error": message,
            }),
            Self::TaskTimeout {
                workflow_id,
                task_id,
                timeout_ms,
            } => json!({
                "kind": "task_timeout",
                "workflow_id": workflow_id,
                "task_id": task_id,
                "timeout_ms": timeout_ms,
            }),
            Self::StateStore(e) => json!({ "kind": "state_store", "error": e.to_string() }),
            Self::IdempotencyViolation { key, reason } => json!({
                "kind": "idempotency_violation",
                "key": key,
                "reason": reason,
            }),
            Self::Rollback(reason) => json!({ "kind": "rollback", "reason": reason }),
            Self::SnapshotNotFound(id) => json!({ "kind": "snapshot_not_found", "id": id }),
            Self::CrvValidation { task_id, reasons } => json!({
                "kind": "crv_validation",
                "task_id": task_id,
                "reasons": reasons,
            }),
            Self::PolicyViolation { reason } => {
                json!({ "kind": "policy_violation", "reason": reason })
            }
            Self::PermissionDenied { reason } => {
                json!({ "kind": "permission_denied", "reason": reason })
            }
            Self::Authentication(reason) => {
                json!({ "kind": "authentication", "reason": reason })
            }
            Self::Conflict {
                key,
                expected,
                actual,
            } => json!({
                "kind": "conflict",
                "key": key,
                "expected": expected,
                "actual": actual,
            }),
            Self::Dependency { task_id, message } => json!({
                "kind": "dependency",
                "task_id": task_id,
                "message": message,
            }),
            Self::ResourceExhausted { resource, message } => json!({
                "kind": "resource_exhausted",
                "resource": resource,
                "message": message,
            }),
            Self::ToolExecution { tool, message } => json!({
                "kind": "tool_execution",
                "tool": tool,
                "message": message,
            }),
            Self::Validation(message) => json!({ "kind": "validation", "message": message }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_json_carries_identifiers() {
        let err = KernelError::WorkflowExecution {
            workflow_id: "wf-1".into(),
            task_id: "t-2".into(),
            attempt: 3,
            message: "boom".into(),
        };
        let ctx = err.context_json();
        assert_eq!(ctx["kind"], "workflow_execution");
        assert_eq!(ctx["workflow_id"], "wf-1");
        assert_eq!(ctx["task_id"], "t-2");
        assert_eq!(ctx["attempt"], 3);
    }

    #[test]
    fn conflict_display_names_versions() {
        let err = KernelError::Conflict {
            key: "inventory".into(),
            expected: 4,
            actual: 7,
        };
        let text = err.to_string();
        assert!(text.contains("expected 4"));
        assert!(text.contains("found 7"));
    }
}
