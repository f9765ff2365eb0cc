//! Declarative workflow and task specifications.
//!
//! A [`WorkflowSpec`] is the immutable input to the orchestrator: a set of
//! tasks, a dependency mapping (which must form a DAG -- enforced by
//! [`crate::safety`] before execution), and optional tenancy and safety
//! policy. Task specs carry everything the per-task pipeline needs: risk
//! tier, permissions, retry policy, timeout, compensation, and sandboxing.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::safety::SafetyPolicy;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Risk tier of a task. Ordered: `Low < Medium < High < Critical`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum RiskTier {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for RiskTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        };
        f.write_str(s)
    }
}

impl FromStr for RiskTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(format!("invalid risk tier: {other:?}")),
        }
    }
}

/// What kind of effect an action has. Ordered so that a broader intent
/// subsumes a narrower one (`Admin` covers everything).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ActionIntent {
    Read,
    Write,
    Delete,
    Execute,
    Admin,
}

/// Data sensitivity zone. Ordered: a grant for a higher zone covers reads
/// and writes in every lower zone.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum DataZone {
    Public,
    Internal,
    Confidential,
    Restricted,
}

/// Structural kind of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    #[default]
    Action,
    Decision,
    Parallel,
}

// ---------------------------------------------------------------------------
// Component specs
// ---------------------------------------------------------------------------

/// A single permission a task requires: an (action, resource) pair with
/// optional intent and data-zone qualifiers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionRequirement {
    pub action: String,
    pub resource: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<ActionIntent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_zone: Option<DataZone>,
}

impl PermissionRequirement {
    /// Structurally valid: action and resource are non-empty.
    pub fn is_well_formed(&self) -> bool {
        !self.action.trim().is_empty() && !self.resource.trim().is_empty()
    }
}

/// Retry policy for a task's execution step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts allowed (>= 1).
    pub max_attempts: u32,
    /// Base delay before the first retry (>= 1).
    pub backoff_ms: u64,
    /// Multiplier applied per attempt (>= 1).
    pub multiplier: f64,
    /// Apply uniform jitter in [0.5, 1.5] to each delay.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 1_000,
            multiplier: 2.0,
            jitter: false,
        }
    }
}

impl RetryPolicy {
    /// Whether the policy satisfies its field constraints.
    pub fn is_valid(&self) -> bool {
        self.max_attempts >= 1 && self.backoff_ms >= 1 && self.multiplier >= 1.0
    }

    /// Delay before re-entering the pipeline after the given attempt
    /// (1-based), without jitter applied.
    pub fn base_delay_ms(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1);
        let scaled = self.backoff_ms as f64 * self.multiplier.powi(exponent as i32);
        scaled.min(u64::MAX as f64) as u64
    }
}

/// Compensation hooks: tasks to run when this task fails or times out.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompensationHooks {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_failure: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_timeout: Option<String>,
}

impl CompensationHooks {
    pub fn is_empty(&self) -> bool {
        self.on_failure.is_none() && self.on_timeout.is_none()
    }
}

/// A direct compensation action: invoke `tool` with `args` to undo this
/// task's effect during saga rollback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationAction {
    pub tool: String,
    #[serde(default)]
    pub args: Value,
}

/// Sandbox configuration for the execution step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxConfig {
    pub enabled: bool,
    /// Backend identifier (e.g. "process", "container").
    pub kind: String,
    /// Dry-run mode: the sandbox simulates effects instead of applying them.
    #[serde(default)]
    pub simulation_mode: bool,
    #[serde(default)]
    pub permissions: Vec<String>,
}

// ---------------------------------------------------------------------------
// TaskSpec / WorkflowSpec
// ---------------------------------------------------------------------------

/// Immutable specification of a single task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Unique within the workflow.
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub kind: TaskKind,
    #[serde(default)]
    pub risk_tier: RiskTier,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<ActionIntent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_zone: Option<DataZone>,
    #[serde(default)]
    pub required_permissions: Vec<PermissionRequirement>,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    /// When non-empty, the only tools the policy gate will admit.
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    #[serde(default)]
    pub compensation: CompensationHooks,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensation_action: Option<CompensationAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<SandboxConfig>,
}

impl TaskSpec {
    /// Minimal task spec for the given id; everything else defaulted.
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            kind: TaskKind::default(),
            risk_tier: RiskTier::default(),
            intent: None,
            data_zone: None,
            required_permissions: Vec::new(),
            retry: RetryPolicy::default(),
            timeout_ms: None,
            idempotency_key: None,
            tool_name: None,
            allowed_tools: Vec::new(),
            compensation: CompensationHooks::default(),
            compensation_action: None,
            sandbox: None,
        }
    }

    /// Whether the execution step should run inside a sandbox.
    pub fn sandboxed(&self) -> bool {
        self.sandbox.as_ref().is_some_and(|s| s.enabled)
    }
}

/// Immutable specification of a workflow: a DAG of tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSpec {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    /// Task declaration order is significant: it breaks scheduling ties.
    pub tasks: Vec<TaskSpec>,
    /// Mapping from task id to the ids it depends on.
    #[serde(default)]
    pub dependencies: BTreeMap<String, BTreeSet<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub safety_policy: Option<SafetyPolicy>,
}

impl WorkflowSpec {
    /// Workflow with no tasks (legal; completes immediately).
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            tenant_id: None,
            tasks: Vec::new(),
            dependencies: BTreeMap::new(),
            safety_policy: None,
        }
    }

    /// Look up a task by id.
    pub fn task(&self, id: &str) -> Option<&TaskSpec> {
        self.tasks.iter().find(|t| t.id == id)
    }

    /// The declared dependencies of a task (empty set when none declared).
    pub fn dependencies_of(&self, id: &str) -> impl Iterator<Item = &str> {
        self.dependencies
            .get(id)
            .into_iter()
            .flat_map(|deps| deps.iter().map(String::as_str))
    }

    /// Task ids that directly depend on the given task.
    pub fn dependents_of<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a str> {
        self.dependencies
            .iter()
            .filter(move |(_, deps)| deps.contains(id))
            .map(|(task, _)| task.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn risk_tiers_are_ordered() {
        assert!(RiskTier::Low < RiskTier::Medium);
        assert!(RiskTier::Medium < RiskTier::High);
        assert!(RiskTier::High < RiskTier::Critical);
    }

    #[test]
    fn risk_tier_roundtrip() {
        for s in ["low", "medium", "high", "critical"] {
            let parsed: RiskTier = s.parse().unwrap();
            assert_eq!(parsed.to_string(), s);
        }
        assert!("extreme".parse::<RiskTier>().is_err());
    }

    #[test]
    fn data_zones_are_ordered() {
        assert!(DataZone::Public < DataZone::Internal);
        assert!(DataZone::Confidential < DataZone::Restricted);
    }

    #[test]
    fn retry_policy_default_is_valid() {
        assert!(RetryPolicy::default().is_valid());
    }

    #[test]
    fn retry_policy_rejects_zero_attempts() {
        let policy = RetryPolicy {
            max_attempts: 0,
            ..RetryPolicy::default()
        };
        assert!(!policy.is_valid());
    }

    #[test]
    fn base_delay_grows_with_multiplier() {
        let policy = RetryPolicy {
            max_attempts: 5,
            backoff_ms: 100,
            multiplier: 2.0,
            jitter: false,
        };
        assert_eq!(policy.base_delay_ms(1), 100);
        assert_eq!(policy.base_delay_ms(2), 200);
        assert_eq!(policy.base_delay_ms(3), 400);
    }

    #[test]
    fn dependents_of_inverts_dependencies() {
        let mut spec = WorkflowSpec::new("wf", "test");
        spec.tasks = vec![TaskSpec::new("a"), TaskSpec::new("b"), TaskSpec::new("c")];
        spec.dependencies
            .insert("b".into(), BTreeSet::from(["a".to_string()]));
        spec.dependencies
            .insert("c".into(), BTreeSet::from(["a".to_string()]));

        let mut dependents: Vec<&str> = spec.dependents_of("a").collect();
        dependents.sort_unstable();
        assert_eq!(dependents, vec!["b", "c"]);
    }

    #[test]
    fn task_spec_serde_defaults() {
        let task: TaskSpec = serde_json::from_str(r#"{"id": "t1", "name": "first"}"#).unwrap();
        assert_eq!(task.risk_tier, RiskTier::Low);
        assert_eq!(task.retry.max_attempts, 3);
        assert!(task.allowed_tools.is_empty());
        assert!(!task.sandboxed());
    }
}
