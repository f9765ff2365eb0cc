//! Deadlock and livelock mitigation.
//!
//! Three strategies: ABORT releases a victim's locks, REPLAN releases a
//! (cheaper) victim's locks and signals a replan, ESCALATE hands a
//! structured context to registered callbacks. Every mitigation emits
//! `mitigation_started` and `mitigation_completed`/`mitigation_failed`.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::events::{EventKind, EventLog};

use super::deadlock::DeadlockDetection;
use super::livelock::{LivelockDetection, LivelockDetector};
use super::{AgentDependency, COORDINATION_STREAM, LockManager};

/// Mitigation strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MitigationStrategy {
    Abort,
    Replan,
    Escalate,
}

impl fmt::Display for MitigationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Abort => "abort",
            Self::Replan => "replan",
            Self::Escalate => "escalate",
        })
    }
}

/// Structured context handed to escalation callbacks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationContext {
    /// "deadlock" or "livelock".
    pub kind: String,
    pub details: Value,
    pub suggested_actions: Vec<String>,
}

/// What a mitigation did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MitigationReport {
    pub strategy: MitigationStrategy,
    pub affected_agents: Vec<String>,
    pub released_locks: usize,
    pub replan_signaled: bool,
    pub escalated: bool,
}

type EscalationCallback = Arc<dyn Fn(&EscalationContext) + Send + Sync>;

/// Applies mitigation strategies against the lock manager and livelock
/// detector.
pub struct Mitigator {
    locks: Arc<LockManager>,
    livelocks: Arc<LivelockDetector>,
    events: Option<EventLog>,
    callbacks: Vec<EscalationCallback>,
}

impl Mitigator {
    pub fn new(
        locks: Arc<LockManager>,
        livelocks: Arc<LivelockDetector>,
        events: Option<EventLog>,
    ) -> Self {
        Self {
            locks,
            livelocks,
            events,
            callbacks: Vec::new(),
        }
    }

    /// Register a callback invoked on ESCALATE.
    pub fn on_escalation(mut self, callback: EscalationCallback) -> Self {
        self.callbacks.push(callback);
        self
    }

    /// Mitigate a detected deadlock.
    ///
    /// ABORT picks the cycle member holding the most resources (ties go
    /// to the lexicographically smallest agent id) and releases its
    /// locks. REPLAN picks the member holding the fewest and additionally
    /// signals a replan. ESCALATE invokes the registered callbacks.
    pub async fn mitigate_deadlock(
        &self,
        detection: &DeadlockDetection,
        strategy: MitigationStrategy,
    ) -> Result<MitigationReport> {
        self.emit(
            EventKind::MitigationStarted,
            json!({ "type": "deadlock", "strategy": strategy, "cycle": detection.cycle }),
        )
        .await;

        if detection.cycle.is_empty() {
            let report = self.fail("deadlock", strategy, "empty cycle").await;
            return report;
        }

        let report = match strategy {
            MitigationStrategy::Abort | MitigationStrategy::Replan => {
                let deps = self.locks.dependencies().await;
                let victim = match strategy {
                    MitigationStrategy::Abort => pick_most_held(&detection.cycle, &deps),
                    _ => pick_fewest_held(&detection.cycle, &deps),
                };
                let released = self.locks.release_all_for_agent(&victim).await;
                info!(
                    victim = %victim,
                    released = released.len(),
                    strategy = %strategy,
                    "deadlock mitigated"
                );
                MitigationReport {
                    strategy,
                    affected_agents: vec![victim],
                    released_locks: released.len(),
                    replan_signaled: strategy == MitigationStrategy::Replan,
                    escalated: false,
                }
            }
            MitigationStrategy::Escalate => {
                let context = EscalationContext {
                    kind: "deadlock".into(),
                    details: json!({
                        "cycle": detection.cycle,
                        "resources": detection.resources,
                    }),
                    suggested_actions: vec![
                        "abort one agent in the cycle".into(),
                        "replan the cheapest agent".into(),
                    ],
                };
                self.run_callbacks(&context);
                MitigationReport {
                    strategy,
                    affected_agents: detection.cycle.clone(),
                    released_locks: 0,
                    replan_signaled: false,
                    escalated: true,
                }
            }
        };

        self.emit(
            EventKind::MitigationCompleted,
            json!({
                "type": "deadlock",
                "strategy": strategy,
                "affected_agents": report.affected_agents,
                "released_locks": report.released_locks,
            }),
        )
        .await;

        Ok(report)
    }

    /// Mitigate a detected livelock.
    ///
    /// ABORT and REPLAN clear the participating agents' state histories;
    /// ESCALATE invokes the registered callbacks.
    pub async fn mitigate_livelock(
        &self,
        detection: &LivelockDetection,
        strategy: MitigationStrategy,
    ) -> Result<MitigationReport> {
        self.emit(
            EventKind::MitigationStarted,
            json!({
                "type": "livelock",
                "strategy": strategy,
                "agent": detection.agent_id,
            }),
        )
        .await;

        let report = match strategy {
            MitigationStrategy::Abort | MitigationStrategy::Replan => {
                self.livelocks.clear(&detection.agent_id);
                info!(
                    agent = %detection.agent_id,
                    strategy = %strategy,
                    "livelock mitigated, state history cleared"
                );
                MitigationReport {
                    strategy,
                    affected_agents: vec![detection.agent_id.clone()],
                    released_locks: 0,
                    replan_signaled: strategy == MitigationStrategy::Replan,
                    escalated: false,
                }
            }
            MitigationStrategy::Escalate => {
                let context = EscalationContext {
                    kind: "livelock".into(),
                    details: json!({
                        "agent": detection.agent_id,
                        "detection": detection.kind,
                    }),
                    suggested_actions: vec![
                        "clear the agent's state history".into(),
                        "replan the agent's goal".into(),
                    ],
                };
                self.run_callbacks(&context);
                MitigationReport {
                    strategy,
                    affected_agents: vec![detection.agent_id.clone()],
                    released_locks: 0,
                    replan_signaled: false,
                    escalated: true,
                }
            }
        };

        self.emit(
            EventKind::MitigationCompleted,
            json!({
                "type": "livelock",
                "strategy": strategy,
                "affected_agents": report.affected_agents,
            }),
        )
        .await;

        Ok(report)
    }

    fn run_callbacks(&self, context: &EscalationContext) {
        for callback in &self.callbacks {
            callback(context);
        }
    }

    async fn fail(
        &self,
        kind: &str,
        strategy: MitigationStrategy,
        reason: &str,
    ) -> Result<MitigationReport> {
        warn!(kind = kind, strategy = %strategy, reason = reason, "mitigation failed");
        self.emit(
            EventKind::MitigationFailed,
            json!({ "type": kind, "strategy": strategy, "reason": reason }),
        )
        .await;
        anyhow::bail!("{kind} mitigation ({strategy}) failed: {reason}")
    }

    async fn emit(&self, kind: EventKind, data: Value) {
        if let Some(events) = &self.events {
            if let Err(e) = events
                .append(kind, COORDINATION_STREAM, None, None, Some(data))
                .await
            {
                warn!(error = %e, "failed to append mitigation event");
            }
        }
    }
}

/// Cycle member holding the most resources; ties break toward the
/// lexicographically smallest agent id.
fn pick_most_held(cycle: &[String], deps: &HashMap<String, AgentDependency>) -> String {
    let mut sorted: Vec<&String> = cycle.iter().collect();
    sorted.sort_unstable();
    sorted
        .into_iter()
        .max_by_key(|agent| held_count(agent, deps))
        .cloned()
        .unwrap_or_default()
}

/// Cycle member holding the fewest resources; ties break toward the
/// lexicographically smallest agent id.
fn pick_fewest_held(cycle: &[String], deps: &HashMap<String, AgentDependency>) -> String {
    let mut sorted: Vec<&String> = cycle.iter().collect();
    sorted.sort_unstable();
    sorted
        .into_iter()
        .min_by_key(|agent| held_count(agent, deps))
        .cloned()
        .unwrap_or_default()
}

fn held_count(agent: &str, deps: &HashMap<String, AgentDependency>) -> usize {
    deps.get(agent).map(|d| d.held_resources.len()).unwrap_or(0)
}
