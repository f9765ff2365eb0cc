//! The workflow orchestrator: drives a validated spec to completion.
//!
//! Tasks run in stable topological order, each through the fixed
//! pipeline: policy gate, feasibility check, before-snapshot, (sandboxed)
//! execution with timeout, validation gate with recovery, commit, diff,
//! events. Every state write persists before the next pipeline step, so a
//! crashed run resumes from the stored state: completed tasks are
//! skipped, interrupted tasks re-enter with their attempt preserved, and
//! side effects stay idempotent through the outbox.

pub mod order;

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use rand::Rng;
use serde_json::{Value, json};
use sqlx::SqlitePool;
use tracing::{info, warn};

use warden_db::models::TaskStatus;

use crate::audit::AuditChain;
use crate::capability::{
    CompensationExecutor, FaultInjector, MemoryWriter, Sandbox, SandboxContext, TaskExecutor,
    Telemetry, UserInteraction,
};
use crate::error::KernelError;
use crate::events::{EventKind, EventLog};
use crate::feasibility::FeasibilityChecker;
use crate::outbox::OutboxService;
use crate::policy::{PolicyEvaluator, Principal};
use crate::safety::WorkflowChecker;
use crate::saga::SagaRunner;
use crate::spec::{TaskSpec, WorkflowSpec};
use crate::state::{StateStore, WorkflowState, dispatch};
use crate::validation::{Commit, GateOutcome, RecoveryStrategy, ValidatorPipeline};
use crate::world::{StateSnapshot, WorldStateStore, diff};

/// Configuration for the orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Hard cap on the computed retry backoff.
    pub max_retry_delay: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_retry_delay: Duration::from_secs(60),
        }
    }
}

/// Host-injected capabilities.
pub struct Capabilities {
    pub executor: Arc<dyn TaskExecutor>,
    pub policy: Arc<dyn PolicyEvaluator>,
    pub validators: Arc<dyn ValidatorPipeline>,
    pub compensations: Arc<dyn CompensationExecutor>,
    pub sandbox: Option<Arc<dyn Sandbox>>,
    pub fault_injector: Option<Arc<dyn FaultInjector>>,
    pub telemetry: Arc<dyn Telemetry>,
    pub memory: Arc<dyn MemoryWriter>,
    pub user: Option<Arc<dyn UserInteraction>>,
}

/// A rollback request against a workflow's world state.
#[derive(Debug, Clone)]
pub struct RollbackRequest {
    pub workflow_id: String,
    pub task_id: String,
    pub snapshot_id: String,
    pub requested_by: String,
    pub reason: String,
}

/// Result of a performed rollback.
#[derive(Debug, Clone)]
pub struct RollbackResult {
    pub snapshot_id: String,
    pub restored_keys: usize,
}

/// The workflow orchestrator.
pub struct Orchestrator {
    store: StateStore,
    events: EventLog,
    world: WorldStateStore,
    outbox: OutboxService,
    audit: Arc<AuditChain>,
    feasibility: FeasibilityChecker,
    checker: WorkflowChecker,
    caps: Capabilities,
    config: OrchestratorConfig,
}

/// Outcome of one task's pipeline, attempts included.
enum TaskOutcome {
    Completed,
    Failed {
        error: KernelError,
        timed_out: bool,
        graceful: bool,
    },
}

/// Error surface of the execution step (e).
struct StepError {
    message: String,
    timed_out: bool,
}

enum RecoveryResult {
    Recovered { data: Value, note: Value },
    Graceful { reason: String },
    Unrecovered { reasons: Vec<String> },
}

impl Orchestrator {
    pub fn new(
        pool: SqlitePool,
        audit: Arc<AuditChain>,
        feasibility: FeasibilityChecker,
        checker: WorkflowChecker,
        caps: Capabilities,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store: StateStore::new(pool.clone()),
            events: EventLog::new(pool.clone()),
            world: WorldStateStore::new(pool.clone()),
            outbox: OutboxService::new(pool),
            audit,
            feasibility,
            checker,
            caps,
            config,
        }
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    pub fn world(&self) -> &WorldStateStore {
        &self.world
    }

    pub fn outbox(&self) -> &OutboxService {
        &self.outbox
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn audit(&self) -> &Arc<AuditChain> {
        &self.audit
    }

    /// Execute a workflow to completion.
    ///
    /// Returns the final [`WorkflowState`] on success and on graceful
    /// failure; throws a structured error otherwise. Re-running a
    /// partially executed workflow resumes from persisted state.
    pub async fn execute_workflow(
        &self,
        spec: &WorkflowSpec,
        principal: &Principal,
    ) -> Result<WorkflowState, KernelError> {
        // 1. Static validation before anything persists.
        let warnings = self
            .checker
            .check(spec)
            .map_err(|e| KernelError::Validation(e.to_string()))?;
        for warning in &warnings {
            warn!(workflow_id = %spec.id, %warning, "workflow admitted with warning");
        }

        let tenant = spec.tenant_id.as_deref();

        // 2. Load or initialize state; a finished workflow is idempotent.
        let task_ids: Vec<&str> = spec.tasks.iter().map(|t| t.id.as_str()).collect();
        self.store.init_workflow(&spec.id, tenant, &task_ids).await?;

        let existing = self
            .store
            .load_workflow_state(&spec.id, None)
            .await?
            .ok_or_else(|| KernelError::StateStore(anyhow!("workflow vanished after init")))?;
        if existing.status == warden_db::models::WorkflowStatus::Completed {
            info!(workflow_id = %spec.id, "workflow already completed, nothing to do");
            return Ok(existing);
        }

        dispatch::mark_workflow_running(self.store.pool(), &spec.id).await?;
        self.emit(EventKind::WorkflowStarted, spec, None, None).await;
        self.audit_event("workflow_started", json!({ "workflow_id": spec.id }));

        // 3. Schedule and run.
        let order = order::topo_order(spec)?;
        let mut completed_steps: Vec<String> = Vec::new();

        for task in order {
            let current = self.store.get_task(&spec.id, &task.id).await?;
            if let Some(current) = &current {
                if current.status == TaskStatus::Completed {
                    // Idempotent resume: already done in a previous run.
                    completed_steps.push(task.id.clone());
                    continue;
                }
                if current.status == TaskStatus::Running {
                    // Crash recovery: re-enter with the attempt preserved.
                    dispatch::reset_orphaned_task(self.store.pool(), &spec.id, &task.id).await?;
                    warn!(
                        workflow_id = %spec.id,
                        task_id = %task.id,
                        "reset orphaned running task for resume"
                    );
                }
            }

            match self.run_task(spec, task, principal).await? {
                TaskOutcome::Completed => {
                    completed_steps.push(task.id.clone());
                }
                TaskOutcome::Failed {
                    error,
                    timed_out,
                    graceful,
                } => {
                    return self
                        .handle_workflow_failure(
                            spec,
                            task,
                            &completed_steps,
                            error,
                            timed_out,
                            graceful,
                        )
                        .await;
                }
            }
        }

        // 4. Every reachable task completed.
        dispatch::mark_workflow_completed(self.store.pool(), &spec.id).await?;
        self.emit(EventKind::WorkflowCompleted, spec, None, None).await;
        self.audit_event("workflow_completed", json!({ "workflow_id": spec.id }));

        self.final_state(spec).await
    }

    /// Restore the world state to a snapshot, subject to policy and the
    /// outbox in-flight guard.
    pub async fn rollback(
        &self,
        request: &RollbackRequest,
        principal: &Principal,
    ) -> Result<RollbackResult, KernelError> {
        let gate_task = rollback_gate_task(request);
        let decision = self
            .caps
            .policy
            .evaluate(principal, &gate_task, &request.workflow_id)
            .await;
        if !decision.allowed {
            return Err(KernelError::PolicyViolation {
                reason: format!("rollback denied: {}", decision.reason),
            });
        }

        // Refuse while any outbox effect for this workflow is in flight.
        if self
            .outbox
            .has_processing_for_workflow(&request.workflow_id)
            .await?
        {
            return Err(KernelError::Rollback(format!(
                "workflow {} has outbox entries in processing",
                request.workflow_id
            )));
        }

        let snapshot = self.world.load_snapshot(&request.snapshot_id).await?;
        self.world.restore(&snapshot).await?;

        let data = json!({
            "snapshot_id": request.snapshot_id,
            "task_id": request.task_id,
            "requested_by": request.requested_by,
            "reason": request.reason,
        });
        if let Err(e) = self
            .events
            .append(
                EventKind::RollbackPerformed,
                &request.workflow_id,
                Some(&request.task_id),
                None,
                Some(data.clone()),
            )
            .await
        {
            warn!(error = %e, "failed to append rollback event");
        }
        self.audit_event("rollback_performed", data);

        Ok(RollbackResult {
            snapshot_id: request.snapshot_id.clone(),
            restored_keys: snapshot.entries.len(),
        })
    }

    // -----------------------------------------------------------------
    // Per-task pipeline
    // -----------------------------------------------------------------

    async fn run_task(
        &self,
        spec: &WorkflowSpec,
        task: &TaskSpec,
        principal: &Principal,
    ) -> Result<TaskOutcome, KernelError> {
        let tenant = spec.tenant_id.as_deref();

        loop {
            // (a) Begin the attempt.
            let attempt = dispatch::begin_attempt(self.store.pool(), &spec.id, &task.id).await?;
            self.emit(
                EventKind::TaskStarted,
                spec,
                Some(&task.id),
                Some(json!({ "attempt": attempt })),
            )
            .await;
            info!(
                workflow_id = %spec.id,
                task_id = %task.id,
                attempt,
                "task started"
            );

            // (b) Policy gate.
            let decision = self.caps.policy.evaluate(principal, task, &spec.id).await;
            self.emit(
                EventKind::PolicyDecision,
                spec,
                Some(&task.id),
                Some(json!({
                    "allowed": decision.allowed,
                    "reason": decision.reason,
                    "requires_human_approval": decision.requires_human_approval,
                })),
            )
            .await;
            if !decision.allowed {
                let metadata = json!({
                    "policyBlocked": true,
                    "requiresHumanApproval": decision.requires_human_approval,
                    "approvalRequest": decision.approval_request,
                });
                return Ok(self
                    .fail_task_terminal(
                        spec,
                        task,
                        &decision.reason,
                        metadata,
                        false,
                        KernelError::PolicyViolation {
                            reason: decision.reason.clone(),
                        },
                    )
                    .await?);
            }

            // (c) Feasibility check.
            let view = self.world.peek().await?;
            let report = self.feasibility.check(task, &view);
            self.caps
                .telemetry
                .record_feasibility(&spec.id, &task.id, &report);
            self.emit(
                EventKind::FeasibilityDecision,
                spec,
                Some(&task.id),
                Some(json!({
                    "feasible": report.feasible,
                    "reasons": report.reasons,
                    "confidence_score": report.confidence_score,
                })),
            )
            .await;
            if !report.feasible {
                let reason = report.reasons.join("; ");
                let metadata = json!({ "feasibilityBlocked": true, "reasons": report.reasons });
                return Ok(self
                    .fail_task_terminal(
                        spec,
                        task,
                        &reason,
                        metadata,
                        false,
                        KernelError::Validation(format!(
                            "task {} infeasible: {reason}",
                            task.id
                        )),
                    )
                    .await?);
            }

            // (d) Before-snapshot.
            let before = self.world.snapshot().await?;
            self.emit(
                EventKind::StateSnapshot,
                spec,
                Some(&task.id),
                Some(json!({ "snapshot_id": before.id })),
            )
            .await;

            // (e) Execute, bounded by the task timeout.
            let executed = self.execute_step(spec, task, &before, attempt).await;

            let data = match executed {
                Ok(data) => data,
                Err(step) => {
                    // (6) Retry or terminal failure.
                    if attempt < task.retry.max_attempts as i64 {
                        dispatch::mark_retrying(
                            self.store.pool(),
                            &spec.id,
                            &task.id,
                            &step.message,
                            step.timed_out,
                        )
                        .await?;
                        self.emit(
                            EventKind::TaskRetrying,
                            spec,
                            Some(&task.id),
                            Some(json!({
                                "attempt": attempt,
                                "error": step.message,
                                "timed_out": step.timed_out,
                            })),
                        )
                        .await;
                        let delay = self.retry_delay(task, attempt);
                        info!(
                            workflow_id = %spec.id,
                            task_id = %task.id,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            "task attempt failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }

                    let error = if step.timed_out {
                        KernelError::TaskTimeout {
                            workflow_id: spec.id.clone(),
                            task_id: task.id.clone(),
                            timeout_ms: task.timeout_ms.unwrap_or_default(),
                        }
                    } else {
                        KernelError::WorkflowExecution {
                            workflow_id: spec.id.clone(),
                            task_id: task.id.clone(),
                            attempt,
                            message: step.message.clone(),
                        }
                    };
                    let metadata = json!({ "attempts": attempt, "timed_out": step.timed_out });
                    return Ok(self
                        .fail_task_terminal(spec, task, &step.message, metadata, step.timed_out, error)
                        .await?);
                }
            };

            // (f) Validation gate.
            let commit = Commit {
                id: format!("{}:{}:{}", spec.id, task.id, attempt),
                data: data.clone(),
                previous_state: Some(json!({ "snapshot_id": before.id })),
                metadata: json!({
                    "workflow_id": spec.id,
                    "task_id": task.id,
                    "attempt": attempt,
                }),
            };
            let outcome = self.caps.validators.validate(&commit).await;
            self.caps
                .telemetry
                .record_validation(&spec.id, &task.id, &outcome);
            self.emit(
                EventKind::ValidationDecision,
                spec,
                Some(&task.id),
                Some(json!({
                    "passed": outcome.passed,
                    "blocked_commit": outcome.blocked_commit,
                    "failure_code": outcome.failure_code,
                })),
            )
            .await;

            if outcome.passed {
                self.commit_success(spec, task, &before, data, None).await?;
                return Ok(TaskOutcome::Completed);
            }

            // (f-recovery) A blocked commit may still recover.
            match self.attempt_recovery(spec, task, &commit, &outcome).await? {
                RecoveryResult::Recovered { data, note } => {
                    self.commit_success(spec, task, &before, data, Some(note)).await?;
                    return Ok(TaskOutcome::Completed);
                }
                RecoveryResult::Graceful { reason } => {
                    let metadata = json!({
                        "crvBlocked": true,
                        "crvRecoveryGracefulFailure": true,
                        "reason": reason.clone(),
                    });
                    let mut reasons = outcome.failure_reasons();
                    reasons.push(reason.clone());
                    return Ok(self
                        .fail_task_terminal(
                            spec,
                            task,
                            &reason,
                            metadata,
                            false,
                            KernelError::CrvValidation {
                                task_id: task.id.clone(),
                                reasons,
                            },
                        )
                        .await
                        .map(|outcome| match outcome {
                            TaskOutcome::Failed { error, timed_out, .. } => TaskOutcome::Failed {
                                error,
                                timed_out,
                                graceful: true,
                            },
                            other => other,
                        })?);
                }
                RecoveryResult::Unrecovered { reasons } => {
                    let message = reasons.join("; ");
                    let metadata = json!({ "crvBlocked": true, "reasons": reasons.clone() });
                    return Ok(self
                        .fail_task_terminal(
                            spec,
                            task,
                            &message,
                            metadata,
                            false,
                            KernelError::CrvValidation {
                                task_id: task.id.clone(),
                                reasons,
                            },
                        )
                        .await?);
                }
            }
        }
    }

    /// Step (e): fault injection, sandbox/direct execution, timeout race,
    /// and the outbox for idempotent side effects.
    async fn execute_step(
        &self,
        spec: &WorkflowSpec,
        task: &TaskSpec,
        before: &StateSnapshot,
        attempt: i64,
    ) -> Result<Value, StepError> {
        if let Some(injector) = &self.caps.fault_injector {
            if let Some(fault) = injector.maybe_inject(task) {
                self.emit(
                    EventKind::FaultInjected,
                    spec,
                    Some(&task.id),
                    Some(json!({ "error": fault.to_string() })),
                )
                .await;
                return Err(StepError {
                    message: format!("injected fault: {fault}"),
                    timed_out: false,
                });
            }
        }

        let run = self.run_executor(spec, task, before, attempt);

        let result = match task.timeout_ms {
            Some(timeout_ms) => {
                match tokio::time::timeout(Duration::from_millis(timeout_ms), run).await {
                    Ok(result) => result,
                    Err(_elapsed) => {
                        return Err(StepError {
                            message: format!(
                                "task {} exceeded timeout of {timeout_ms}ms",
                                task.id
                            ),
                            timed_out: true,
                        });
                    }
                }
            }
            None => run.await,
        };

        result.map_err(|e| StepError {
            message: e.to_string(),
            timed_out: false,
        })
    }

    /// Run the executor (through the sandbox when configured), routed
    /// through the outbox when the task carries an idempotency key.
    async fn run_executor(
        &self,
        spec: &WorkflowSpec,
        task: &TaskSpec,
        before: &StateSnapshot,
        attempt: i64,
    ) -> anyhow::Result<Value> {
        let invoke = || async {
            if task.sandboxed() {
                if let Some(sandbox) = &self.caps.sandbox {
                    let context = SandboxContext {
                        workflow_id: spec.id.clone(),
                        task_id: task.id.clone(),
                        attempt,
                    };
                    let outcome = sandbox
                        .execute_in_sandbox(task, before, self.caps.executor.as_ref(), &context)
                        .await;
                    return if outcome.success {
                        Ok(outcome.data.unwrap_or(Value::Null))
                    } else {
                        Err(anyhow!(
                            outcome
                                .error
                                .unwrap_or_else(|| "sandbox execution failed".to_owned())
                        ))
                    };
                }
                warn!(
                    task_id = %task.id,
                    "task requests sandboxing but no sandbox is configured, running directly"
                );
            }
            self.caps.executor.execute(task, before).await
        };

        match task.idempotency_key.as_deref() {
            Some(key) => {
                let tool = task.tool_name.clone().unwrap_or_else(|| "unknown".to_owned());
                let params = json!({ "task_id": task.id, "attempt": attempt });
                self.outbox
                    .execute(
                        &spec.id,
                        &task.id,
                        &tool,
                        params,
                        key,
                        task.retry.max_attempts as i64,
                        |_params| invoke(),
                    )
                    .await
                    .map_err(|e| anyhow!(e.to_string()))
            }
            None => invoke().await,
        }
    }

    /// Step (g): persist the completed task, diff the world, emit events.
    async fn commit_success(
        &self,
        spec: &WorkflowSpec,
        task: &TaskSpec,
        before: &StateSnapshot,
        data: Value,
        recovery_note: Option<Value>,
    ) -> Result<(), KernelError> {
        let mut metadata = json!({});
        if let Some(note) = &recovery_note {
            metadata = json!({ "crvRecovery": note });
        }

        dispatch::complete_task(self.store.pool(), &spec.id, &task.id, &data, &metadata).await?;
        self.emit(
            EventKind::TaskCompleted,
            spec,
            Some(&task.id),
            Some(json!({ "result": data })),
        )
        .await;
        self.audit_event(
            "task_completed",
            json!({ "workflow_id": spec.id, "task_id": task.id }),
        );

        let after = self.world.snapshot().await?;
        let delta = diff(before, &after);
        let mut update = json!({
            "before_snapshot_id": before.id,
            "after_snapshot_id": after.id,
            "diff": delta,
        });
        if let Some(note) = recovery_note {
            update["crvRecovery"] = note;
        }
        self.emit(EventKind::StateUpdated, spec, Some(&task.id), Some(update)).await;

        let timeline_entry = json!({
            "workflow_id": spec.id,
            "task_id": task.id,
            "result": data,
        });
        if let Err(e) = self.caps.memory.write(timeline_entry, "orchestrator").await {
            warn!(error = %e, "failed to write timeline memory (non-fatal)");
        }

        Ok(())
    }

    /// Persist a terminal task failure and emit the matching event.
    async fn fail_task_terminal(
        &self,
        spec: &WorkflowSpec,
        task: &TaskSpec,
        message: &str,
        metadata: Value,
        timed_out: bool,
        error: KernelError,
    ) -> Result<TaskOutcome, KernelError> {
        dispatch::fail_task(
            self.store.pool(),
            &spec.id,
            &task.id,
            message,
            &metadata,
            timed_out,
        )
        .await?;

        let kind = if timed_out {
            EventKind::TaskTimeout
        } else {
            EventKind::TaskFailed
        };
        self.emit(
            kind,
            spec,
            Some(&task.id),
            Some(json!({ "error": message, "metadata": metadata })),
        )
        .await;
        self.audit_event(
            kind.as_str(),
            json!({
                "workflow_id": spec.id,
                "task_id": task.id,
                "error": message,
            }),
        );

        Ok(TaskOutcome::Failed {
            error,
            timed_out,
            graceful: false,
        })
    }

    // -----------------------------------------------------------------
    // Validation recovery
    // -----------------------------------------------------------------

    async fn attempt_recovery(
        &self,
        spec: &WorkflowSpec,
        task: &TaskSpec,
        commit: &Commit,
        outcome: &GateOutcome,
    ) -> Result<RecoveryResult, KernelError> {
        let Some(strategy) = &outcome.recovery else {
            return Ok(RecoveryResult::Unrecovered {
                reasons: outcome.failure_reasons(),
            });
        };

        match strategy {
            RecoveryStrategy::Ignore { justification } => {
                info!(
                    workflow_id = %spec.id,
                    task_id = %task.id,
                    justification = %justification,
                    "validation failure ignored by recovery policy"
                );
                Ok(RecoveryResult::Recovered {
                    data: commit.data.clone(),
                    note: json!({
                        "strategy": "ignore",
                        "success": true,
                        "justification": justification,
                    }),
                })
            }
            RecoveryStrategy::RetryAltTool {
                tool_name,
                max_retries,
            } => {
                self.recover_via_alt_tool(spec, task, outcome, tool_name, *max_retries)
                    .await
            }
            RecoveryStrategy::AskUser { prompt } => {
                self.recover_via_user(spec, task, outcome, prompt).await
            }
            RecoveryStrategy::Escalate { reason } => Ok(RecoveryResult::Graceful {
                reason: reason.clone(),
            }),
        }
    }

    async fn recover_via_alt_tool(
        &self,
        spec: &WorkflowSpec,
        task: &TaskSpec,
        outcome: &GateOutcome,
        tool_name: &str,
        max_retries: u32,
    ) -> Result<RecoveryResult, KernelError> {
        let mut alt_task = task.clone();
        alt_task.tool_name = Some(tool_name.to_owned());
        // The alternate run bypasses the outbox: it is a fresh effect,
        // not a replay of the original key.
        alt_task.idempotency_key = None;

        let mut last_error = None;
        for retry in 1..=max_retries.max(1) {
            self.emit(
                EventKind::StateUpdated,
                spec,
                Some(&task.id),
                Some(json!({
                    "crvRecovery": {
                        "strategy": "retry_alt_tool",
                        "tool": tool_name,
                        "attempt": retry,
                    }
                })),
            )
            .await;

            let view = self.world.peek().await?;
            match self.caps.executor.execute(&alt_task, &view).await {
                Ok(data) => {
                    // Recovered data re-enters the gate once.
                    let recheck = Commit {
                        id: format!("{}:{}:recovery:{}", spec.id, task.id, retry),
                        data: data.clone(),
                        previous_state: None,
                        metadata: json!({ "recovery": "retry_alt_tool", "tool": tool_name }),
                    };
                    let revalidated = self.caps.validators.validate(&recheck).await;
                    if revalidated.passed {
                        return Ok(RecoveryResult::Recovered {
                            data,
                            note: json!({
                                "strategy": "retry_alt_tool",
                                "success": true,
                                "tool": tool_name,
                            }),
                        });
                    }
                    let mut reasons = outcome.failure_reasons();
                    reasons.extend(revalidated.failure_reasons());
                    return Ok(RecoveryResult::Unrecovered { reasons });
                }
                Err(e) => {
                    warn!(
                        task_id = %task.id,
                        tool = tool_name,
                        retry,
                        error = %e,
                        "alternate tool execution failed"
                    );
                    last_error = Some(e.to_string());
                }
            }
        }

        let mut reasons = outcome.failure_reasons();
        if let Some(e) = last_error {
            reasons.push(format!("alternate tool {tool_name:?} failed: {e}"));
        }
        Ok(RecoveryResult::Unrecovered { reasons })
    }

    async fn recover_via_user(
        &self,
        spec: &WorkflowSpec,
        task: &TaskSpec,
        outcome: &GateOutcome,
        prompt: &str,
    ) -> Result<RecoveryResult, KernelError> {
        let Some(user) = &self.caps.user else {
            return Ok(RecoveryResult::Graceful {
                reason: "validation blocked and no user channel is configured".into(),
            });
        };

        self.emit(
            EventKind::StateUpdated,
            spec,
            Some(&task.id),
            Some(json!({
                "crvRecovery": { "strategy": "ask_user", "prompt": prompt }
            })),
        )
        .await;

        match user.ask(prompt).await {
            Some(data) => {
                let recheck = Commit {
                    id: format!("{}:{}:recovery:user", spec.id, task.id),
                    data: data.clone(),
                    previous_state: None,
                    metadata: json!({ "recovery": "ask_user" }),
                };
                let revalidated = self.caps.validators.validate(&recheck).await;
                if revalidated.passed {
                    Ok(RecoveryResult::Recovered {
                        data,
                        note: json!({ "strategy": "ask_user", "success": true }),
                    })
                } else {
                    let mut reasons = outcome.failure_reasons();
                    reasons.extend(revalidated.failure_reasons());
                    Ok(RecoveryResult::Unrecovered { reasons })
                }
            }
            None => Ok(RecoveryResult::Graceful {
                reason: "user provided no recovery data".into(),
            }),
        }
    }

    // -----------------------------------------------------------------
    // Failure handling
    // -----------------------------------------------------------------

    async fn handle_workflow_failure(
        &self,
        spec: &WorkflowSpec,
        failed_task: &TaskSpec,
        completed_steps: &[String],
        error: KernelError,
        timed_out: bool,
        graceful: bool,
    ) -> Result<WorkflowState, KernelError> {
        let tenant = spec.tenant_id.as_deref();

        // (5a) Compensation hook for the failed task, executed once.
        let hook = if timed_out {
            failed_task
                .compensation
                .on_timeout
                .as_deref()
                .or(failed_task.compensation.on_failure.as_deref())
        } else {
            failed_task.compensation.on_failure.as_deref()
        };
        if let Some(hook_id) = hook {
            self.run_compensation_hook(spec, failed_task, hook_id).await;
        }

        // (5b) Saga: compensate in reverse order. The failed task's own
        // compensation action (partial effects) runs first, then every
        // completed step, last completed first.
        let mut to_compensate = completed_steps.to_vec();
        if failed_task.compensation_action.is_some() {
            to_compensate.push(failed_task.id.clone());
        }
        let saga = SagaRunner::new(Arc::clone(&self.caps.compensations), self.events.clone());
        let outcomes = saga.compensate(spec, &to_compensate, tenant).await;
        if !outcomes.is_empty() {
            info!(
                workflow_id = %spec.id,
                compensated = outcomes.len(),
                "saga compensation finished"
            );
        }

        // (5c) Mark the workflow failed.
        dispatch::mark_workflow_failed(self.store.pool(), &spec.id).await?;
        self.emit(
            EventKind::WorkflowFailed,
            spec,
            Some(&failed_task.id),
            Some(json!({ "error": error.to_string(), "graceful": graceful })),
        )
        .await;
        self.audit_event(
            "workflow_failed",
            json!({
                "workflow_id": spec.id,
                "task_id": failed_task.id,
                "error": error.context_json(),
            }),
        );

        // (5d) Graceful failures surface state; everything else throws.
        if graceful {
            return self.final_state(spec).await;
        }
        Err(error)
    }

    /// Execute a compensation-hook task once; failures are logged, never
    /// rethrown.
    async fn run_compensation_hook(
        &self,
        spec: &WorkflowSpec,
        failed_task: &TaskSpec,
        hook_id: &str,
    ) {
        self.emit(
            EventKind::CompensationTriggered,
            spec,
            Some(&failed_task.id),
            Some(json!({ "hook_task": hook_id })),
        )
        .await;

        let Some(hook_task) = spec.task(hook_id) else {
            warn!(
                workflow_id = %spec.id,
                hook_task = hook_id,
                "compensation hook references unknown task"
            );
            return;
        };

        let view = match self.world.peek().await {
            Ok(view) => view,
            Err(e) => {
                warn!(error = %e, "failed to read world state for compensation hook");
                return;
            }
        };

        match self.caps.executor.execute(hook_task, &view).await {
            Ok(_) => {
                self.emit(
                    EventKind::CompensationCompleted,
                    spec,
                    Some(&failed_task.id),
                    Some(json!({ "hook_task": hook_id })),
                )
                .await;
            }
            Err(e) => {
                warn!(
                    workflow_id = %spec.id,
                    hook_task = hook_id,
                    error = %e,
                    "compensation hook failed (logged, not rethrown)"
                );
                self.emit(
                    EventKind::CompensationFailed,
                    spec,
                    Some(&failed_task.id),
                    Some(json!({ "hook_task": hook_id, "error": e.to_string() })),
                )
                .await;
            }
        }
    }

    // -----------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------

    fn retry_delay(&self, task: &TaskSpec, attempt: i64) -> Duration {
        let base = task.retry.base_delay_ms(attempt as u32);
        let with_jitter = if task.retry.jitter {
            let factor: f64 = rand::rng().random_range(0.5..1.5);
            (base as f64 * factor) as u64
        } else {
            base
        };
        Duration::from_millis(with_jitter).min(self.config.max_retry_delay)
    }

    async fn final_state(&self, spec: &WorkflowSpec) -> Result<WorkflowState, KernelError> {
        self.store
            .load_workflow_state(&spec.id, None)
            .await?
            .ok_or_else(|| KernelError::StateStore(anyhow!("workflow state vanished")))
    }

    async fn emit(
        &self,
        kind: EventKind,
        spec: &WorkflowSpec,
        task_id: Option<&str>,
        data: Option<Value>,
    ) {
        if let Err(e) = self
            .events
            .append(kind, &spec.id, task_id, spec.tenant_id.as_deref(), data)
            .await
        {
            warn!(error = %e, kind = %kind, "failed to append event");
        }
    }

    fn audit_event(&self, kind: &str, payload: Value) {
        if let Err(e) = self.audit.log_event(kind, payload) {
            warn!(error = %e, kind, "failed to append audit record");
        }
    }
}

/// Synthetic task spec the policy gate evaluates for a rollback request.
fn rollback_gate_task(request: &RollbackRequest) -> TaskSpec {
    let mut task = TaskSpec::new(format!("rollback:{}", request.task_id));
    task.risk_tier = crate::spec::RiskTier::High;
    task.required_permissions = vec![crate::spec::PermissionRequirement {
        action: "rollback".into(),
        resource: "world_state".into(),
        intent: Some(crate::spec::ActionIntent::Write),
        data_zone: None,
    }];
    task
}
