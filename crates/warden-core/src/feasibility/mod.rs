//! Pre-execution feasibility check.
//!
//! Answers "can this task run right now": the tool must be registered,
//! available, permitted, and within the task's risk budget; hard
//! constraints over the current world state must hold; the spec's
//! permission records and required inputs must be structurally sound.
//! Soft constraint violations lower the confidence score without
//! blocking.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::spec::{RiskTier, TaskKind, TaskSpec};
use crate::world::StateSnapshot;

// ---------------------------------------------------------------------------
// Tool registry
// ---------------------------------------------------------------------------

/// A tool known to the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub available: bool,
    /// Highest risk tier this tool is rated for.
    pub risk_level: RiskTier,
}

/// Registry of tools the executor can invoke.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, ToolDescriptor>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: ToolDescriptor) {
        self.tools.insert(tool.name.clone(), tool);
    }

    pub fn with_tool(mut self, tool: ToolDescriptor) -> Self {
        self.register(tool);
        self
    }

    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.get(name)
    }
}

// ---------------------------------------------------------------------------
// Constraints
// ---------------------------------------------------------------------------

/// Whether a violated constraint blocks execution or only lowers
/// confidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintSeverity {
    Hard,
    Soft,
}

/// A predicate over the current world state.
#[derive(Clone)]
pub struct Constraint {
    pub name: String,
    pub severity: ConstraintSeverity,
    /// Returns a violation message, or `None` when satisfied.
    pub check: Arc<dyn Fn(&StateSnapshot) -> Option<String> + Send + Sync>,
}

impl Constraint {
    pub fn hard(
        name: impl Into<String>,
        check: impl Fn(&StateSnapshot) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            severity: ConstraintSeverity::Hard,
            check: Arc::new(check),
        }
    }

    pub fn soft(
        name: impl Into<String>,
        check: impl Fn(&StateSnapshot) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            severity: ConstraintSeverity::Soft,
            check: Arc::new(check),
        }
    }
}

impl fmt::Debug for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Constraint")
            .field("name", &self.name)
            .field("severity", &self.severity)
            .finish_non_exhaustive()
    }
}

/// A recorded constraint violation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstraintViolation {
    pub constraint: String,
    pub severity: ConstraintSeverity,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Checker
// ---------------------------------------------------------------------------

/// Per-soft-violation confidence penalty.
const SOFT_VIOLATION_PENALTY: f64 = 0.15;

/// The feasibility verdict for one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeasibilityReport {
    pub feasible: bool,
    /// Blocking reasons; empty iff feasible.
    pub reasons: Vec<String>,
    pub confidence_score: f64,
    pub tool_capability_ok: bool,
    pub constraint_violations: Vec<ConstraintViolation>,
}

/// Pre-execution feasibility checker.
#[derive(Debug, Default)]
pub struct FeasibilityChecker {
    registry: ToolRegistry,
    constraints: Vec<Constraint>,
}

impl FeasibilityChecker {
    pub fn new(registry: ToolRegistry) -> Self {
        Self {
            registry,
            constraints: Vec::new(),
        }
    }

    pub fn with_constraint(mut self, constraint: Constraint) -> Self {
        self.constraints.push(constraint);
        self
    }

    /// Check whether a task can run against the given world state.
    pub fn check(&self, task: &TaskSpec, world: &StateSnapshot) -> FeasibilityReport {
        let mut reasons = Vec::new();
        let mut confidence: f64 = 1.0;

        // 1. Tool registry check.
        let tool_capability_ok = self.check_tool(task, &mut reasons);

        // 2. Constraint engine over the current world state.
        let mut constraint_violations = Vec::new();
        for constraint in &self.constraints {
            if let Some(message) = (constraint.check)(world) {
                match constraint.severity {
                    ConstraintSeverity::Hard => {
                        reasons.push(format!(
                            "hard constraint {:?} violated: {message}",
                            constraint.name
                        ));
                    }
                    ConstraintSeverity::Soft => {
                        confidence -= SOFT_VIOLATION_PENALTY;
                    }
                }
                constraint_violations.push(ConstraintViolation {
                    constraint: constraint.name.clone(),
                    severity: constraint.severity,
                    message,
                });
            }
        }

        // 3. Permission records must be structurally valid.
        for requirement in &task.required_permissions {
            if !requirement.is_well_formed() {
                reasons.push(format!(
                    "malformed permission requirement {:?}:{:?}",
                    requirement.action, requirement.resource
                ));
            }
        }

        // 4. Required inputs must be present and non-null.
        if let Some(key) = task.idempotency_key.as_deref() {
            if key.trim().is_empty() {
                reasons.push("idempotency key is empty".into());
            }
        }
        if let Some(action) = &task.compensation_action {
            if action.tool.trim().is_empty() {
                reasons.push("compensation action has no tool".into());
            }
            if action.args.is_null() {
                reasons.push("compensation action args are null".into());
            }
        }

        FeasibilityReport {
            feasible: reasons.is_empty(),
            reasons,
            confidence_score: confidence.clamp(0.0, 1.0),
            tool_capability_ok,
            constraint_violations,
        }
    }

    fn check_tool(&self, task: &TaskSpec, reasons: &mut Vec<String>) -> bool {
        let Some(tool_name) = task.tool_name.as_deref() else {
            if task.kind == TaskKind::Action {
                reasons.push("action task declares no tool".into());
                return false;
            }
            return true;
        };

        let Some(tool) = self.registry.get(tool_name) else {
            reasons.push(format!("tool {tool_name:?} is not registered"));
            return false;
        };

        let mut ok = true;
        if !tool.available {
            reasons.push(format!("tool {tool_name:?} is unavailable"));
            ok = false;
        }
        if !task.allowed_tools.is_empty() && !task.allowed_tools.iter().any(|t| t == tool_name) {
            reasons.push(format!("tool {tool_name:?} is not in the task's allowed tools"));
            ok = false;
        }
        if tool.risk_level > task.risk_tier {
            reasons.push(format!(
                "tool {tool_name:?} risk level {} exceeds task risk tier {}",
                tool.risk_level, task.risk_tier
            ));
            ok = false;
        }
        ok
    }
}
