//! Pre-execution policy gate.
//!
//! Evaluates a principal against a task's risk tier, required
//! permissions, and permitted tools. Denials never throw out of the
//! orchestrator: the decision object says what happened and whether an
//! out-of-band human approval could unblock it. Evaluation is
//! deterministic; the only mutation anywhere in the gate is approval-token
//! consumption (tokens are single-use).

pub mod approval;

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::capability::Telemetry;
use crate::spec::{ActionIntent, DataZone, PermissionRequirement, RiskTier, TaskSpec};

pub use approval::{ApprovalConfig, ApprovalError, ApprovalService};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A permission held by a principal.
///
/// `action`/`resource` match exactly or via the `"*"` wildcard. An absent
/// intent or data zone on the grant means the grant is unrestricted in
/// that dimension; present qualifiers cover any requirement at or below
/// their level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionGrant {
    pub action: String,
    pub resource: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<ActionIntent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_zone: Option<DataZone>,
}

impl PermissionGrant {
    /// Whether this grant satisfies a requirement.
    pub fn covers(&self, requirement: &PermissionRequirement) -> bool {
        let action_ok = self.action == "*" || self.action == requirement.action;
        let resource_ok = self.resource == "*" || self.resource == requirement.resource;
        if !action_ok || !resource_ok {
            return false;
        }

        let intent_ok = match (self.intent, requirement.intent) {
            (_, None) | (None, _) => true,
            (Some(granted), Some(required)) => granted >= required,
        };
        let zone_ok = match (self.data_zone, requirement.data_zone) {
            (_, None) | (None, _) => true,
            (Some(granted), Some(required)) => granted >= required,
        };

        intent_ok && zone_ok
    }
}

/// The identity a workflow executes as.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    #[serde(default)]
    pub permissions: Vec<PermissionGrant>,
    /// Approval token attached out-of-band for high-risk actions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_token: Option<String>,
}

impl Principal {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            permissions: Vec::new(),
            approval_token: None,
        }
    }

    pub fn with_permission(mut self, grant: PermissionGrant) -> Self {
        self.permissions.push(grant);
        self
    }

    pub fn with_approval_token(mut self, token: impl Into<String>) -> Self {
        self.approval_token = Some(token.into());
        self
    }
}

/// Outcome of one policy evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub allowed: bool,
    pub reason: String,
    pub requires_human_approval: bool,
    /// Opaque request id an out-of-band approver can turn into an
    /// approval record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_request: Option<String>,
}

impl PolicyDecision {
    fn allow(reason: impl Into<String>) -> Self {
        Self {
            allowed: true,
            reason: reason.into(),
            requires_human_approval: false,
            approval_request: None,
        }
    }

    fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
            requires_human_approval: false,
            approval_request: None,
        }
    }

    fn needs_approval(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
            requires_human_approval: true,
            approval_request: Some(Uuid::new_v4().to_string()),
        }
    }
}

/// Pre-execution policy evaluation capability.
#[async_trait]
pub trait PolicyEvaluator: Send + Sync {
    async fn evaluate(
        &self,
        principal: &Principal,
        task: &TaskSpec,
        workflow_id: &str,
    ) -> PolicyDecision;
}

// Compile-time assertion: PolicyEvaluator must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn PolicyEvaluator) {}
};

// ---------------------------------------------------------------------------
// Default gate
// ---------------------------------------------------------------------------

/// Risk-tiered policy gate.
///
/// Gate order: permitted tools, required permissions, then risk-tier
/// approval. CRITICAL tasks require a valid approval token
/// unconditionally; HIGH tasks require one unless the task id is listed
/// as pre-approved.
pub struct RiskPolicyGate {
    approvals: Arc<ApprovalService>,
    telemetry: Arc<dyn Telemetry>,
    pre_approved_high: BTreeSet<String>,
}

impl RiskPolicyGate {
    pub fn new(approvals: Arc<ApprovalService>, telemetry: Arc<dyn Telemetry>) -> Self {
        Self {
            approvals,
            telemetry,
            pre_approved_high: BTreeSet::new(),
        }
    }

    /// Exempt a HIGH-risk task id from the approval requirement.
    pub fn pre_approve_high(mut self, task_id: impl Into<String>) -> Self {
        self.pre_approved_high.insert(task_id.into());
        self
    }

    /// Access the approval service (to issue tokens out-of-band).
    pub fn approvals(&self) -> &Arc<ApprovalService> {
        &self.approvals
    }

    fn decide(&self, principal: &Principal, task: &TaskSpec) -> PolicyDecision {
        // 1. Tool allowlist.
        if let Some(tool) = task.tool_name.as_deref() {
            if !task.allowed_tools.is_empty()
                && !task.allowed_tools.iter().any(|t| t == tool)
            {
                return PolicyDecision::deny(format!(
                    "tool {tool:?} is not in the task's allowed tools"
                ));
            }
        }

        // 2. Required permissions.
        for requirement in &task.required_permissions {
            let satisfied = principal
                .permissions
                .iter()
                .any(|grant| grant.covers(requirement));
            if !satisfied {
                return PolicyDecision::deny(format!(
                    "principal {:?} lacks permission {}:{}",
                    principal.id, requirement.action, requirement.resource
                ));
            }
        }

        // 3. Risk-tier approval.
        if task.risk_tier >= RiskTier::High {
            let exempt = task.risk_tier == RiskTier::High
                && self.pre_approved_high.contains(&task.id);

            if !exempt {
                return match principal.approval_token.as_deref() {
                    Some(token) => {
                        match self.approvals.redeem(token, &task.id, &principal.id) {
                            Ok(()) => PolicyDecision::allow(format!(
                                "{} risk task approved by token",
                                task.risk_tier
                            )),
                            Err(e) => PolicyDecision::needs_approval(format!(
                                "{} risk task: approval token rejected ({e})",
                                task.risk_tier
                            )),
                        }
                    }
                    None => PolicyDecision::needs_approval(format!(
                        "{} risk task requires human approval",
                        task.risk_tier
                    )),
                };
            }
        }

        PolicyDecision::allow("all policy checks passed")
    }
}

#[async_trait]
impl PolicyEvaluator for RiskPolicyGate {
    async fn evaluate(
        &self,
        principal: &Principal,
        task: &TaskSpec,
        workflow_id: &str,
    ) -> PolicyDecision {
        let decision = self.decide(principal, task);
        self.telemetry
            .record_policy_decision(workflow_id, &task.id, &principal.id, &decision);
        decision
    }
}
