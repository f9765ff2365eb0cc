//! Validation gate recovery: alternate-tool retry, ask-user, ignore, and
//! graceful escalation.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use serde_json::{Value, json};

use warden_core::audit::AuditChain;
use warden_core::capability::{
    CompensationExecutor, NoopMemory, NoopTelemetry, TaskExecutor, UserInteraction,
};
use warden_core::error::KernelError;
use warden_core::feasibility::{FeasibilityChecker, ToolDescriptor, ToolRegistry};
use warden_core::orchestrator::{Capabilities, Orchestrator, OrchestratorConfig};
use warden_core::policy::{PolicyDecision, PolicyEvaluator, Principal};
use warden_core::safety::WorkflowChecker;
use warden_core::spec::{CompensationAction, RiskTier, TaskSpec, WorkflowSpec};
use warden_core::validation::{
    Commit, GateOutcome, RecoveryStrategy, ValidationResult, ValidatorPipeline,
};
use warden_core::world::StateSnapshot;

use warden_db::models::{TaskStatus, WorkflowStatus};
use warden_test_utils::create_test_db;

// ===========================================================================
// Mock capabilities
// ===========================================================================

/// Executor whose output depends on the tool: the primary tool produces
/// unverifiable data, the fallback produces verified data.
struct ToolAwareExecutor;

#[async_trait]
impl TaskExecutor for ToolAwareExecutor {
    async fn execute(&self, task: &TaskSpec, _state: &StateSnapshot) -> anyhow::Result<Value> {
        match task.tool_name.as_deref() {
            Some("fallback_tool") => Ok(json!({ "verified": true, "tool": "fallback_tool" })),
            _ => Ok(json!({ "verified": false, "tool": "primary_tool" })),
        }
    }
}

struct AllowAllPolicy;

#[async_trait]
impl PolicyEvaluator for AllowAllPolicy {
    async fn evaluate(
        &self,
        _principal: &Principal,
        _task: &TaskSpec,
        _workflow_id: &str,
    ) -> PolicyDecision {
        PolicyDecision {
            allowed: true,
            reason: "allowed".into(),
            requires_human_approval: false,
            approval_request: None,
        }
    }
}

struct NoopCompensation;

#[async_trait]
impl CompensationExecutor for NoopCompensation {
    async fn execute(
        &self,
        _action: &CompensationAction,
        _workflow_id: &str,
        _task_id: &str,
    ) -> anyhow::Result<Value> {
        Ok(json!({}))
    }
}

/// Pipeline that passes commits whose data has `"verified": true` and
/// blocks everything else with the configured recovery strategy.
struct VerifiedFieldPipeline {
    recovery: Option<RecoveryStrategy>,
    validations: AtomicU32,
}

impl VerifiedFieldPipeline {
    fn new(recovery: Option<RecoveryStrategy>) -> Self {
        Self {
            recovery,
            validations: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl ValidatorPipeline for VerifiedFieldPipeline {
    async fn validate(&self, commit: &Commit) -> GateOutcome {
        self.validations.fetch_add(1, Ordering::SeqCst);
        let valid = commit.data["verified"] == json!(true);
        let result = ValidationResult {
            validator: "verified_field".into(),
            valid,
            reason: (!valid).then(|| "result is not verified".to_owned()),
            confidence: 1.0,
        };
        if valid {
            GateOutcome::passed(vec![result])
        } else {
            GateOutcome::blocked(vec![result], "crv:verified_field", self.recovery.clone())
        }
    }
}

/// User channel returning a fixed answer (or nothing).
struct ScriptedUser {
    answer: Option<Value>,
}

#[async_trait]
impl UserInteraction for ScriptedUser {
    async fn ask(&self, _prompt: &str) -> Option<Value> {
        self.answer.clone()
    }
}

// ===========================================================================
// Harness
// ===========================================================================

fn registry() -> ToolRegistry {
    ToolRegistry::new()
        .with_tool(ToolDescriptor {
            name: "primary_tool".into(),
            available: true,
            risk_level: RiskTier::Low,
        })
        .with_tool(ToolDescriptor {
            name: "fallback_tool".into(),
            available: true,
            risk_level: RiskTier::Low,
        })
}

fn orchestrator(
    pool: sqlx::SqlitePool,
    validators: Arc<dyn ValidatorPipeline>,
    user: Option<Arc<dyn UserInteraction>>,
) -> Orchestrator {
    let caps = Capabilities {
        executor: Arc::new(ToolAwareExecutor),
        policy: Arc::new(AllowAllPolicy),
        validators,
        compensations: Arc::new(NoopCompensation),
        sandbox: None,
        fault_injector: None,
        telemetry: Arc::new(NoopTelemetry),
        memory: Arc::new(NoopMemory),
        user,
    };
    Orchestrator::new(
        pool,
        Arc::new(AuditChain::in_memory()),
        FeasibilityChecker::new(registry()),
        WorkflowChecker::new(),
        caps,
        OrchestratorConfig::default(),
    )
}

fn workflow(workflow_id: &str) -> WorkflowSpec {
    let mut task = TaskSpec::new("t1");
    task.tool_name = Some("primary_tool".into());
    task.retry.max_attempts = 1;
    let mut spec = WorkflowSpec::new(workflow_id, "validated");
    spec.tasks = vec![task];
    spec
}

// ===========================================================================
// Tests
// ===========================================================================

#[tokio::test]
async fn retry_alt_tool_recovers_and_completes() {
    let (pool, _dir) = create_test_db().await;
    let pipeline = Arc::new(VerifiedFieldPipeline::new(Some(
        RecoveryStrategy::RetryAltTool {
            tool_name: "fallback_tool".into(),
            max_retries: 1,
        },
    )));
    let orch = orchestrator(pool, Arc::clone(&pipeline) as _, None);

    let spec = workflow("wf-s6");
    let state = orch
        .execute_workflow(&spec, &Principal::new("alice"))
        .await
        .unwrap();

    assert_eq!(state.status, WorkflowStatus::Completed);
    let t1 = state.task("t1").unwrap();
    assert_eq!(t1.status, TaskStatus::Completed);
    // The committed result is the recovered data.
    assert_eq!(t1.result.as_ref().unwrap()["tool"], "fallback_tool");
    assert_eq!(t1.metadata["crvRecovery"]["success"], true);

    // Original validation + one re-validation of the recovered data.
    assert_eq!(pipeline.validations.load(Ordering::SeqCst), 2);

    let events = orch.events().read("wf-s6", None).await.unwrap();
    let completed = events
        .iter()
        .filter(|e| e.event_type == "task_completed")
        .count();
    assert_eq!(completed, 1);

    // A state_updated event records the successful recovery.
    let recovered = events.iter().any(|e| {
        e.event_type == "state_updated"
            && e.data
                .as_ref()
                .is_some_and(|d| d.0["crvRecovery"]["success"] == json!(true))
    });
    assert!(recovered, "expected state_updated with crvRecovery.success");
}

#[tokio::test]
async fn failed_revalidation_fails_with_both_reasons() {
    let (pool, _dir) = create_test_db().await;
    // The fallback tool also produces unverified data here.
    struct StubbornExecutor;

    #[async_trait]
    impl TaskExecutor for StubbornExecutor {
        async fn execute(
            &self,
            _task: &TaskSpec,
            _state: &StateSnapshot,
        ) -> anyhow::Result<Value> {
            Ok(json!({ "verified": false }))
        }
    }

    let pipeline = Arc::new(VerifiedFieldPipeline::new(Some(
        RecoveryStrategy::RetryAltTool {
            tool_name: "fallback_tool".into(),
            max_retries: 1,
        },
    )));
    let caps = Capabilities {
        executor: Arc::new(StubbornExecutor),
        policy: Arc::new(AllowAllPolicy),
        validators: Arc::clone(&pipeline) as _,
        compensations: Arc::new(NoopCompensation),
        sandbox: None,
        fault_injector: None,
        telemetry: Arc::new(NoopTelemetry),
        memory: Arc::new(NoopMemory),
        user: None,
    };
    let orch = Orchestrator::new(
        pool,
        Arc::new(AuditChain::in_memory()),
        FeasibilityChecker::new(registry()),
        WorkflowChecker::new(),
        caps,
        OrchestratorConfig::default(),
    );

    let spec = workflow("wf-revalidate-fail");
    let err = orch
        .execute_workflow(&spec, &Principal::new("alice"))
        .await
        .unwrap_err();

    let KernelError::CrvValidation { reasons, .. } = err else {
        panic!("expected CrvValidation, got different error");
    };
    // Both the original and the re-validation failure are recorded.
    assert!(reasons.len() >= 2);

    let state = orch
        .store()
        .load_workflow_state("wf-revalidate-fail", None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.task("t1").unwrap().metadata["crvBlocked"], true);
}

#[tokio::test]
async fn escalate_yields_graceful_failure_without_throwing() {
    let (pool, _dir) = create_test_db().await;
    let pipeline = Arc::new(VerifiedFieldPipeline::new(Some(
        RecoveryStrategy::Escalate {
            reason: "needs operator review".into(),
        },
    )));
    let orch = orchestrator(pool, pipeline as _, None);

    let spec = workflow("wf-escalate");
    // Graceful failure: state comes back as a value, no error thrown.
    let state = orch
        .execute_workflow(&spec, &Principal::new("alice"))
        .await
        .unwrap();

    assert_eq!(state.status, WorkflowStatus::Failed);
    let t1 = state.task("t1").unwrap();
    assert_eq!(t1.status, TaskStatus::Failed);
    assert_eq!(t1.metadata["crvRecoveryGracefulFailure"], true);
}

#[tokio::test]
async fn ask_user_with_answer_revalidates_and_completes() {
    let (pool, _dir) = create_test_db().await;
    let pipeline = Arc::new(VerifiedFieldPipeline::new(Some(
        RecoveryStrategy::AskUser {
            prompt: "please verify the result".into(),
        },
    )));
    let user = Arc::new(ScriptedUser {
        answer: Some(json!({ "verified": true, "source": "user" })),
    });
    let orch = orchestrator(pool, pipeline as _, Some(user as _));

    let spec = workflow("wf-ask-user");
    let state = orch
        .execute_workflow(&spec, &Principal::new("alice"))
        .await
        .unwrap();

    assert_eq!(state.status, WorkflowStatus::Completed);
    let t1 = state.task("t1").unwrap();
    assert_eq!(t1.result.as_ref().unwrap()["source"], "user");
}

#[tokio::test]
async fn ask_user_without_answer_fails_gracefully() {
    let (pool, _dir) = create_test_db().await;
    let pipeline = Arc::new(VerifiedFieldPipeline::new(Some(
        RecoveryStrategy::AskUser {
            prompt: "please verify the result".into(),
        },
    )));
    let user = Arc::new(ScriptedUser { answer: None });
    let orch = orchestrator(pool, pipeline as _, Some(user as _));

    let spec = workflow("wf-ask-user-silent");
    let state = orch
        .execute_workflow(&spec, &Principal::new("alice"))
        .await
        .unwrap();

    assert_eq!(state.status, WorkflowStatus::Failed);
    assert_eq!(
        state.task("t1").unwrap().metadata["crvRecoveryGracefulFailure"],
        true
    );
}

#[tokio::test]
async fn ignore_strategy_commits_original_data() {
    let (pool, _dir) = create_test_db().await;
    let pipeline = Arc::new(VerifiedFieldPipeline::new(Some(
        RecoveryStrategy::Ignore {
            justification: "known benign validator gap".into(),
        },
    )));
    let orch = orchestrator(pool, pipeline as _, None);

    let spec = workflow("wf-ignore");
    let state = orch
        .execute_workflow(&spec, &Principal::new("alice"))
        .await
        .unwrap();

    assert_eq!(state.status, WorkflowStatus::Completed);
    let t1 = state.task("t1").unwrap();
    assert_eq!(t1.result.as_ref().unwrap()["tool"], "primary_tool");
    assert_eq!(t1.metadata["crvRecovery"]["justification"], "known benign validator gap");
}

#[tokio::test]
async fn blocked_commit_without_recovery_fails() {
    let (pool, _dir) = create_test_db().await;
    let pipeline = Arc::new(VerifiedFieldPipeline::new(None));
    let orch = orchestrator(pool, pipeline as _, None);

    let spec = workflow("wf-no-recovery");
    let err = orch
        .execute_workflow(&spec, &Principal::new("alice"))
        .await
        .unwrap_err();
    assert!(matches!(err, KernelError::CrvValidation { .. }));
}
