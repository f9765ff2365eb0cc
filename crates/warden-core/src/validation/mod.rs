//! Post-execution validation gate.
//!
//! A task's result enters the gate as a [`Commit`]; a composed validator
//! sequence produces per-validator results and an overall
//! [`GateOutcome`]. A blocked commit may carry a [`RecoveryStrategy`] the
//! orchestrator can attempt before failing the task.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A structured object offered to the validation gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Commit {
    pub id: String,
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_state: Option<Value>,
    #[serde(default)]
    pub metadata: Value,
}

/// One validator's verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub validator: String,
    pub valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub confidence: f64,
}

/// How the orchestrator may recover from a blocked commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum RecoveryStrategy {
    /// Record a justification and let the commit proceed.
    Ignore { justification: String },
    /// Re-run the execution through an alternate tool; the new data
    /// re-enters the gate.
    RetryAltTool { tool_name: String, max_retries: u32 },
    /// Ask a human; new data re-validates once, no answer fails
    /// gracefully.
    AskUser { prompt: String },
    /// Mark the task as a graceful failure; the workflow surfaces state
    /// without throwing.
    Escalate { reason: String },
}

/// The gate's overall verdict for one commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateOutcome {
    pub passed: bool,
    pub blocked_commit: bool,
    pub results: Vec<ValidationResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery: Option<RecoveryStrategy>,
}

impl GateOutcome {
    pub fn passed(results: Vec<ValidationResult>) -> Self {
        Self {
            passed: true,
            blocked_commit: false,
            results,
            failure_code: None,
            recovery: None,
        }
    }

    pub fn blocked(
        results: Vec<ValidationResult>,
        failure_code: impl Into<String>,
        recovery: Option<RecoveryStrategy>,
    ) -> Self {
        Self {
            passed: false,
            blocked_commit: true,
            results,
            failure_code: Some(failure_code.into()),
            recovery,
        }
    }

    /// Reasons from every failing validator.
    pub fn failure_reasons(&self) -> Vec<String> {
        self.results
            .iter()
            .filter(|r| !r.valid)
            .map(|r| {
                r.reason
                    .clone()
                    .unwrap_or_else(|| format!("validator {} failed", r.validator))
            })
            .collect()
    }
}

/// The composed validation pipeline capability.
#[async_trait]
pub trait ValidatorPipeline: Send + Sync {
    async fn validate(&self, commit: &Commit) -> GateOutcome;
}

// Compile-time assertion: ValidatorPipeline must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn ValidatorPipeline) {}
};

/// A single validator in a composed sequence.
#[async_trait]
pub trait CommitValidator: Send + Sync {
    fn name(&self) -> &str;
    async fn validate(&self, commit: &Commit) -> ValidationResult;
}

/// Pipeline that accepts every commit. Useful as a default and in tests.
pub struct ApproveAll;

#[async_trait]
impl ValidatorPipeline for ApproveAll {
    async fn validate(&self, _commit: &Commit) -> GateOutcome {
        GateOutcome::passed(vec![ValidationResult {
            validator: "approve_all".into(),
            valid: true,
            reason: None,
            confidence: 1.0,
        }])
    }
}

/// Recovery policy: maps the first failing result to a strategy.
pub type RecoveryPolicy =
    Arc<dyn Fn(&ValidationResult) -> Option<RecoveryStrategy> + Send + Sync>;

/// A composed validator sequence with an optional recovery policy.
///
/// Runs every validator in order; the first failure sets the failure
/// code (`crv:<validator name>`) and is offered to the recovery policy.
pub struct ValidatorSet {
    validators: Vec<Box<dyn CommitValidator>>,
    recovery_policy: Option<RecoveryPolicy>,
}

impl ValidatorSet {
    pub fn new(validators: Vec<Box<dyn CommitValidator>>) -> Self {
        Self {
            validators,
            recovery_policy: None,
        }
    }

    pub fn with_recovery_policy(mut self, policy: RecoveryPolicy) -> Self {
        self.recovery_policy = Some(policy);
        self
    }
}

#[async_trait]
impl ValidatorPipeline for ValidatorSet {
    async fn validate(&self, commit: &Commit) -> GateOutcome {
        let mut results = Vec::with_capacity(self.validators.len());
        for validator in &self.validators {
            results.push(validator.validate(commit).await);
        }

        match results.iter().find(|r| !r.valid) {
            None => GateOutcome::passed(results),
            Some(first_failure) => {
                let failure_code = format!("crv:{}", first_failure.validator);
                let recovery = self
                    .recovery_policy
                    .as_ref()
                    .and_then(|policy| policy(first_failure));
                GateOutcome::blocked(results.clone(), failure_code, recovery)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct FieldPresent(&'static str);

    #[async_trait]
    impl CommitValidator for FieldPresent {
        fn name(&self) -> &str {
            self.0
        }

        async fn validate(&self, commit: &Commit) -> ValidationResult {
            let valid = commit.data.get(self.0).is_some();
            ValidationResult {
                validator: self.0.to_owned(),
                valid,
                reason: (!valid).then(|| format!("missing field {:?}", self.0)),
                confidence: 1.0,
            }
        }
    }

    fn commit(data: Value) -> Commit {
        Commit {
            id: "c1".into(),
            data,
            previous_state: None,
            metadata: json!({}),
        }
    }

    #[tokio::test]
    async fn all_validators_passing_passes_the_gate() {
        let set = ValidatorSet::new(vec![
            Box::new(FieldPresent("status")),
            Box::new(FieldPresent("detail")),
        ]);
        let outcome = set
            .validate(&commit(json!({"status": "ok", "detail": 1})))
            .await;
        assert!(outcome.passed);
        assert!(!outcome.blocked_commit);
        assert_eq!(outcome.results.len(), 2);
    }

    #[tokio::test]
    async fn first_failure_sets_failure_code() {
        let set = ValidatorSet::new(vec![
            Box::new(FieldPresent("status")),
            Box::new(FieldPresent("detail")),
        ]);
        let outcome = set.validate(&commit(json!({"detail": 1}))).await;
        assert!(!outcome.passed);
        assert!(outcome.blocked_commit);
        assert_eq!(outcome.failure_code.as_deref(), Some("crv:status"));
        assert_eq!(outcome.failure_reasons().len(), 1);
    }

    #[tokio::test]
    async fn recovery_policy_attaches_strategy() {
        let set = ValidatorSet::new(vec![Box::new(FieldPresent("status"))])
            .with_recovery_policy(Arc::new(|_failure| {
                Some(RecoveryStrategy::RetryAltTool {
                    tool_name: "fallback_tool".into(),
                    max_retries: 2,
                })
            }));
        let outcome = set.validate(&commit(json!({}))).await;
        assert_eq!(
            outcome.recovery,
            Some(RecoveryStrategy::RetryAltTool {
                tool_name: "fallback_tool".into(),
                max_retries: 2,
            })
        );
    }

    #[test]
    fn recovery_strategy_serde_is_tagged() {
        let strategy = RecoveryStrategy::Escalate {
            reason: "cannot verify".into(),
        };
        let json = serde_json::to_value(&strategy).unwrap();
        assert_eq!(json["strategy"], "escalate");
        assert_eq!(json["reason"], "cannot verify");
    }
}
