//! Static workflow validation, run before a workflow is admitted for
//! execution.
//!
//! Validates structure (unique task ids, declared dependencies) and a
//! configurable rule set over the spec. Rule severities split findings
//! into hard errors (the spec is rejected) and warnings (returned to the
//! caller). Cycle detection runs as a rule but is not skippable by
//! execution: the orchestrator refuses specs that were not checked.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::spec::{RiskTier, WorkflowSpec};

// ---------------------------------------------------------------------------
// Policy types
// ---------------------------------------------------------------------------

/// Severity of a rule finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleSeverity {
    Error,
    Warning,
}

/// Per-rule configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleConfig {
    pub enabled: bool,
    pub severity: RuleSeverity,
}

impl RuleConfig {
    pub fn error() -> Self {
        Self {
            enabled: true,
            severity: RuleSeverity::Error,
        }
    }

    pub fn warning() -> Self {
        Self {
            enabled: true,
            severity: RuleSeverity::Warning,
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            severity: RuleSeverity::Warning,
        }
    }
}

/// Safety policy attached to a workflow spec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyPolicy {
    /// Direct dependents of a CRITICAL task must be its compensation,
    /// carry their own compensation action, or be explicitly approved.
    pub no_action_after_critical: RuleConfig,
    /// Task ids exempt from `no_action_after_critical`.
    #[serde(default)]
    pub approved_critical_followers: BTreeSet<String>,
    /// HIGH/CRITICAL tasks must declare at least one required permission.
    pub require_permissions_for_high_risk: RuleConfig,
    /// CRITICAL tasks must declare a compensation hook or action.
    pub require_compensation_for_critical: RuleConfig,
    /// The dependency graph must be acyclic.
    pub no_cycles: RuleConfig,
    /// Stop at the first error-severity finding.
    #[serde(default)]
    pub fail_fast: bool,
}

impl Default for SafetyPolicy {
    fn default() -> Self {
        Self {
            no_action_after_critical: RuleConfig::error(),
            approved_critical_followers: BTreeSet::new(),
            require_permissions_for_high_risk: RuleConfig::error(),
            require_compensation_for_critical: RuleConfig::warning(),
            no_cycles: RuleConfig::error(),
            fail_fast: false,
        }
    }
}

/// A single rule finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub rule: String,
    pub severity: RuleSeverity,
    pub task_id: Option<String>,
    pub message: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.task_id {
            Some(task) => write!(f, "[{}] task {task:?}: {}", self.rule, self.message),
            None => write!(f, "[{}] {}", self.rule, self.message),
        }
    }
}

/// Errors that reject a workflow spec outright.
#[derive(Debug, Error)]
pub enum WorkflowCheckError {
    #[error("duplicate task id: {0:?}")]
    DuplicateTaskId(String),

    #[error("task {task:?} depends on unknown task {dependency:?}")]
    UnknownDependency { task: String, dependency: String },

    #[error("dependency mapping references unknown task {0:?}")]
    UnknownTaskInDependencies(String),

    #[error("task {0:?} depends on itself")]
    SelfDependency(String),

    #[error("workflow rejected with {} error(s): {}", .0.len(), format_violations(.0))]
    Violations(Vec<Violation>),
}

fn format_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(Violation::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// A caller-supplied predicate over the whole spec.
#[derive(Clone)]
pub struct CustomRule {
    pub name: String,
    pub severity: RuleSeverity,
    /// Returns a violation message, or `None` when the rule passes.
    pub check: Arc<dyn Fn(&WorkflowSpec) -> Option<String> + Send + Sync>,
}

impl fmt::Debug for CustomRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomRule")
            .field("name", &self.name)
            .field("severity", &self.severity)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Checker
// ---------------------------------------------------------------------------

/// Static workflow checker.
#[derive(Debug, Default)]
pub struct WorkflowChecker {
    custom_rules: Vec<CustomRule>,
}

impl WorkflowChecker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a custom rule evaluated after the built-in rules.
    pub fn with_rule(mut self, rule: CustomRule) -> Self {
        self.custom_rules.push(rule);
        self
    }

    /// Validate a workflow spec against its safety policy.
    ///
    /// Returns the warning-severity findings on success. Structural
    /// problems and error-severity findings reject the spec.
    pub fn check(&self, spec: &WorkflowSpec) -> Result<Vec<Violation>, WorkflowCheckError> {
        let policy = spec.safety_policy.clone().unwrap_or_default();

        validate_structure(spec)?;

        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        for violation in rule_findings(spec, &policy, &self.custom_rules) {
            if violation.severity == RuleSeverity::Error {
                errors.push(violation);
                if policy.fail_fast {
                    return Err(WorkflowCheckError::Violations(errors));
                }
            } else {
                warnings.push(violation);
            }
        }

        if errors.is_empty() {
            Ok(warnings)
        } else {
            Err(WorkflowCheckError::Violations(errors))
        }
    }
}

/// Reject malformed structure before any rule runs.
fn validate_structure(spec: &WorkflowSpec) -> Result<(), WorkflowCheckError> {
    let mut seen = BTreeSet::new();
    for task in &spec.tasks {
        if !seen.insert(task.id.as_str()) {
            return Err(WorkflowCheckError::DuplicateTaskId(task.id.clone()));
        }
    }

    for (task, deps) in &spec.dependencies {
        if !seen.contains(task.as_str()) {
            return Err(WorkflowCheckError::UnknownTaskInDependencies(task.clone()));
        }
        for dep in deps {
            if dep == task {
                return Err(WorkflowCheckError::SelfDependency(task.clone()));
            }
            if !seen.contains(dep.as_str()) {
                return Err(WorkflowCheckError::UnknownDependency {
                    task: task.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    Ok(())
}

/// Evaluate every enabled rule, yielding findings in rule order.
fn rule_findings(
    spec: &WorkflowSpec,
    policy: &SafetyPolicy,
    custom: &[CustomRule],
) -> Vec<Violation> {
    let mut findings = Vec::new();

    if policy.no_action_after_critical.enabled {
        check_no_action_after_critical(spec, policy, &mut findings);
    }
    if policy.require_permissions_for_high_risk.enabled {
        check_high_risk_permissions(spec, policy, &mut findings);
    }
    if policy.require_compensation_for_critical.enabled {
        check_critical_compensation(spec, policy, &mut findings);
    }
    if policy.no_cycles.enabled {
        if let Some(cycle) = find_cycle(spec) {
            findings.push(Violation {
                rule: "no_cycles".into(),
                severity: policy.no_cycles.severity,
                task_id: None,
                message: format!("dependency cycle: {}", cycle.join(" -> ")),
            });
        }
    }

    for rule in custom {
        if let Some(message) = (rule.check)(spec) {
            findings.push(Violation {
                rule: rule.name.clone(),
                severity: rule.severity,
                task_id: None,
                message,
            });
        }
    }

    findings
}

fn check_no_action_after_critical(
    spec: &WorkflowSpec,
    policy: &SafetyPolicy,
    findings: &mut Vec<Violation>,
) {
    for task in &spec.tasks {
        if task.risk_tier != RiskTier::Critical {
            continue;
        }
        let compensation_targets: BTreeSet<&str> = task
            .compensation
            .on_failure
            .iter()
            .chain(task.compensation.on_timeout.iter())
            .map(String::as_str)
            .collect();

        for dependent_id in spec.dependents_of(&task.id) {
            if compensation_targets.contains(dependent_id) {
                continue;
            }
            if policy.approved_critical_followers.contains(dependent_id) {
                continue;
            }
            let dependent_has_compensation = spec
                .task(dependent_id)
                .is_some_and(|d| d.compensation_action.is_some());
            if dependent_has_compensation {
                continue;
            }
            findings.push(Violation {
                rule: "no_action_after_critical".into(),
                severity: policy.no_action_after_critical.severity,
                task_id: Some(dependent_id.to_owned()),
                message: format!(
                    "depends on critical task {:?} without compensation or approval",
                    task.id
                ),
            });
        }
    }
}

fn check_high_risk_permissions(
    spec: &WorkflowSpec,
    policy: &SafetyPolicy,
    findings: &mut Vec<Violation>,
) {
    for task in &spec.tasks {
        if task.risk_tier >= RiskTier::High && task.required_permissions.is_empty() {
            findings.push(Violation {
                rule: "require_permissions_for_high_risk".into(),
                severity: policy.require_permissions_for_high_risk.severity,
                task_id: Some(task.id.clone()),
                message: format!(
                    "{} risk task declares no required permissions",
                    task.risk_tier
                ),
            });
        }
    }
}

fn check_critical_compensation(
    spec: &WorkflowSpec,
    policy: &SafetyPolicy,
    findings: &mut Vec<Violation>,
) {
    for task in &spec.tasks {
        if task.risk_tier == RiskTier::Critical
            && task.compensation.is_empty()
            && task.compensation_action.is_none()
        {
            findings.push(Violation {
                rule: "require_compensation_for_critical".into(),
                severity: policy.require_compensation_for_critical.severity,
                task_id: Some(task.id.clone()),
                message: "critical task declares no compensation".into(),
            });
        }
    }
}

// ---------------------------------------------------------------------------
// Cycle detection
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, PartialEq)]
enum Color {
    White,
    Gray,
    Black,
}

/// DFS with white/gray/black coloring. Returns the first cycle found as a
/// task-id path (closing edge included), or `None` for a DAG.
fn find_cycle(spec: &WorkflowSpec) -> Option<Vec<String>> {
    let ids: Vec<&str> = spec.tasks.iter().map(|t| t.id.as_str()).collect();
    let index: HashMap<&str, usize> = ids.iter().enumerate().map(|(i, id)| (*id, i)).collect();

    // Edge: task -> dependency (a back edge to a gray node closes a cycle).
    let mut adj: Vec<Vec<usize>> = vec![Vec::new(); ids.len()];
    for (task, deps) in &spec.dependencies {
        let from = index[task.as_str()];
        for dep in deps {
            adj[from].push(index[dep.as_str()]);
        }
    }

    let mut colors = vec![Color::White; ids.len()];
    let mut path: Vec<usize> = Vec::new();

    for start in 0..ids.len() {
        if colors[start] != Color::White {
            continue;
        }
        if let Some(cycle) = visit(start, &adj, &mut colors, &mut path) {
            return Some(cycle.into_iter().map(|i| ids[i].to_owned()).collect());
        }
    }

    None
}

fn visit(
    node: usize,
    adj: &[Vec<usize>],
    colors: &mut [Color],
    path: &mut Vec<usize>,
) -> Option<Vec<usize>> {
    colors[node] = Color::Gray;
    path.push(node);

    for &next in &adj[node] {
        match colors[next] {
            Color::Gray => {
                // Back edge: slice the current path from the repeated node.
                let start = path.iter().position(|&n| n == next).unwrap_or(0);
                let mut cycle: Vec<usize> = path[start..].to_vec();
                cycle.push(next);
                return Some(cycle);
            }
            Color::White => {
                if let Some(cycle) = visit(next, adj, colors, path) {
                    return Some(cycle);
                }
            }
            Color::Black => {}
        }
    }

    path.pop();
    colors[node] = Color::Black;
    None
}
