//! Capability traits consumed by the kernel.
//!
//! The host injects implementations of these at construction time; the
//! kernel never knows what a tool, sandbox, or telemetry sink actually
//! is. Every trait here is object-safe so capabilities can be stored as
//! `Arc<dyn Trait>`.

use async_trait::async_trait;
use serde_json::Value;

use crate::feasibility::FeasibilityReport;
use crate::policy::PolicyDecision;
use crate::spec::{CompensationAction, TaskSpec};
use crate::validation::GateOutcome;
use crate::world::StateSnapshot;

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// Executes a task against the current world state.
///
/// Implementors wrap tool adapters; the kernel treats the return value as
/// opaque data to be validated and committed.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, task: &TaskSpec, state: &StateSnapshot) -> anyhow::Result<Value>;
}

/// Outcome of a sandboxed execution.
#[derive(Debug, Clone)]
pub struct SandboxOutcome {
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<String>,
    pub metadata: Value,
}

/// Context handed to the sandbox for one execution.
#[derive(Debug, Clone)]
pub struct SandboxContext {
    pub workflow_id: String,
    pub task_id: String,
    pub attempt: i64,
}

/// Isolated execution backend.
///
/// The sandbox decides how to confine the executor (process, container,
/// simulation); the kernel only sees the outcome.
#[async_trait]
pub trait Sandbox: Send + Sync {
    async fn execute_in_sandbox(
        &self,
        task: &TaskSpec,
        state: &StateSnapshot,
        executor: &dyn TaskExecutor,
        context: &SandboxContext,
    ) -> SandboxOutcome;
}

/// Executes a compensation action during saga rollback.
#[async_trait]
pub trait CompensationExecutor: Send + Sync {
    async fn execute(
        &self,
        action: &CompensationAction,
        workflow_id: &str,
        task_id: &str,
    ) -> anyhow::Result<Value>;
}

// ---------------------------------------------------------------------------
// Observability
// ---------------------------------------------------------------------------

/// Fire-and-forget telemetry sink.
pub trait Telemetry: Send + Sync {
    fn record_policy_decision(
        &self,
        workflow_id: &str,
        task_id: &str,
        principal_id: &str,
        decision: &PolicyDecision,
    );

    fn record_feasibility(&self, workflow_id: &str, task_id: &str, report: &FeasibilityReport);

    fn record_validation(&self, workflow_id: &str, task_id: &str, outcome: &GateOutcome);
}

/// Telemetry sink that drops everything.
pub struct NoopTelemetry;

impl Telemetry for NoopTelemetry {
    fn record_policy_decision(
        &self,
        _workflow_id: &str,
        _task_id: &str,
        _principal_id: &str,
        _decision: &PolicyDecision,
    ) {
    }

    fn record_feasibility(
        &self,
        _workflow_id: &str,
        _task_id: &str,
        _report: &FeasibilityReport,
    ) {
    }

    fn record_validation(&self, _workflow_id: &str, _task_id: &str, _outcome: &GateOutcome) {}
}

/// Timeline memory the kernel writes task outcomes into.
#[async_trait]
pub trait MemoryWriter: Send + Sync {
    async fn write(&self, content: Value, provenance: &str) -> anyhow::Result<()>;

    async fn list_timeline(&self, workflow_id: &str) -> anyhow::Result<Vec<Value>>;
}

/// Memory writer that drops everything.
pub struct NoopMemory;

#[async_trait]
impl MemoryWriter for NoopMemory {
    async fn write(&self, _content: Value, _provenance: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn list_timeline(&self, _workflow_id: &str) -> anyhow::Result<Vec<Value>> {
        Ok(Vec::new())
    }
}

// ---------------------------------------------------------------------------
// Test hooks & human-in-the-loop
// ---------------------------------------------------------------------------

/// Optional fault injector wrapping the execution step.
pub trait FaultInjector: Send + Sync {
    /// Return an error to inject in place of running the task.
    fn maybe_inject(&self, task: &TaskSpec) -> Option<anyhow::Error>;
}

/// Human-in-the-loop channel for `ask_user` validation recovery.
#[async_trait]
pub trait UserInteraction: Send + Sync {
    /// Present a prompt; `None` means no answer was produced.
    async fn ask(&self, prompt: &str) -> Option<Value>;
}

// Compile-time assertions: capabilities must be object-safe.
const _: () = {
    fn _assert_object_safe(
        _: &dyn TaskExecutor,
        _: &dyn Sandbox,
        _: &dyn CompensationExecutor,
        _: &dyn Telemetry,
        _: &dyn MemoryWriter,
        _: &dyn FaultInjector,
        _: &dyn UserInteraction,
    ) {
    }
};
