//! Append-only event log.
//!
//! Thin typed surface over the `events` table: every lifecycle transition
//! the kernel performs lands here as an [`EventKind`] plus a JSON body.
//! Reads are tenant-filtered inside the SQL.

use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::SqlitePool;

use warden_db::models::Event;
use warden_db::queries::events as event_db;

/// Every event type the kernel emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    WorkflowStarted,
    WorkflowCompleted,
    WorkflowFailed,
    TaskStarted,
    TaskCompleted,
    TaskFailed,
    TaskTimeout,
    TaskRetrying,
    StateSnapshot,
    StateUpdated,
    PolicyDecision,
    FeasibilityDecision,
    ValidationDecision,
    CompensationTriggered,
    CompensationCompleted,
    CompensationFailed,
    FaultInjected,
    LockAcquired,
    LockReleased,
    LockTimeout,
    DeadlockDetected,
    LivelockDetected,
    MitigationStarted,
    MitigationCompleted,
    MitigationFailed,
    RollbackPerformed,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WorkflowStarted => "workflow_started",
            Self::WorkflowCompleted => "workflow_completed",
            Self::WorkflowFailed => "workflow_failed",
            Self::TaskStarted => "task_started",
            Self::TaskCompleted => "task_completed",
            Self::TaskFailed => "task_failed",
            Self::TaskTimeout => "task_timeout",
            Self::TaskRetrying => "task_retrying",
            Self::StateSnapshot => "state_snapshot",
            Self::StateUpdated => "state_updated",
            Self::PolicyDecision => "policy_decision",
            Self::FeasibilityDecision => "feasibility_decision",
            Self::ValidationDecision => "validation_decision",
            Self::CompensationTriggered => "compensation_triggered",
            Self::CompensationCompleted => "compensation_completed",
            Self::CompensationFailed => "compensation_failed",
            Self::FaultInjected => "fault_injected",
            Self::LockAcquired => "lock_acquired",
            Self::LockReleased => "lock_released",
            Self::LockTimeout => "lock_timeout",
            Self::DeadlockDetected => "deadlock_detected",
            Self::LivelockDetected => "livelock_detected",
            Self::MitigationStarted => "mitigation_started",
            Self::MitigationCompleted => "mitigation_completed",
            Self::MitigationFailed => "mitigation_failed",
            Self::RollbackPerformed => "rollback_performed",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "workflow_started" => Ok(Self::WorkflowStarted),
            "workflow_completed" => Ok(Self::WorkflowCompleted),
            "workflow_failed" => Ok(Self::WorkflowFailed),
            "task_started" => Ok(Self::TaskStarted),
            "task_completed" => Ok(Self::TaskCompleted),
            "task_failed" => Ok(Self::TaskFailed),
            "task_timeout" => Ok(Self::TaskTimeout),
            "task_retrying" => Ok(Self::TaskRetrying),
            "state_snapshot" => Ok(Self::StateSnapshot),
            "state_updated" => Ok(Self::StateUpdated),
            "policy_decision" => Ok(Self::PolicyDecision),
            "feasibility_decision" => Ok(Self::FeasibilityDecision),
            "validation_decision" => Ok(Self::ValidationDecision),
            "compensation_triggered" => Ok(Self::CompensationTriggered),
            "compensation_completed" => Ok(Self::CompensationCompleted),
            "compensation_failed" => Ok(Self::CompensationFailed),
            "fault_injected" => Ok(Self::FaultInjected),
            "lock_acquired" => Ok(Self::LockAcquired),
            "lock_released" => Ok(Self::LockReleased),
            "lock_timeout" => Ok(Self::LockTimeout),
            "deadlock_detected" => Ok(Self::DeadlockDetected),
            "livelock_detected" => Ok(Self::LivelockDetected),
            "mitigation_started" => Ok(Self::MitigationStarted),
            "mitigation_completed" => Ok(Self::MitigationCompleted),
            "mitigation_failed" => Ok(Self::MitigationFailed),
            "rollback_performed" => Ok(Self::RollbackPerformed),
            other => Err(format!("invalid event kind: {other:?}")),
        }
    }
}

/// Append-only, tenant-filtered event log.
#[derive(Debug, Clone)]
pub struct EventLog {
    pool: SqlitePool,
}

impl EventLog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Append an event for a workflow. The append is atomic per stream;
    /// the returned event carries its assigned sequence number.
    pub async fn append(
        &self,
        kind: EventKind,
        workflow_id: &str,
        task_id: Option<&str>,
        tenant_id: Option<&str>,
        data: Option<Value>,
    ) -> Result<Event> {
        let new = event_db::NewEvent {
            workflow_id: workflow_id.to_owned(),
            task_id: task_id.map(str::to_owned),
            tenant_id: tenant_id.map(str::to_owned),
            event_type: kind.as_str().to_owned(),
            data,
            metadata: None,
        };
        event_db::insert_event(&self.pool, &new, Utc::now()).await
    }

    /// Events for one workflow in append order, optionally restricted to
    /// a tenant (untagged events are invisible to any tenant).
    pub async fn read(
        &self,
        workflow_id: &str,
        tenant_id: Option<&str>,
    ) -> Result<Vec<Event>> {
        event_db::list_events_for_workflow(&self.pool, workflow_id, tenant_id).await
    }

    /// All of a tenant's events across workflows, in append order.
    pub async fn read_by_tenant(&self, tenant_id: &str) -> Result<Vec<Event>> {
        event_db::list_events_by_tenant(&self.pool, tenant_id).await
    }

    /// A tenant's events recorded within `[from, to]`.
    pub async fn export(
        &self,
        tenant_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Event>> {
        event_db::list_events_in_window(&self.pool, tenant_id, from, to).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_kind_roundtrip() {
        for kind in [
            EventKind::WorkflowStarted,
            EventKind::TaskTimeout,
            EventKind::StateUpdated,
            EventKind::MitigationCompleted,
            EventKind::RollbackPerformed,
        ] {
            let parsed: EventKind = kind.as_str().parse().unwrap();
            assert_eq!(parsed, kind);
        }
        assert!("meteor_strike".parse::<EventKind>().is_err());
    }

    #[test]
    fn event_kind_serde_matches_as_str() {
        let json = serde_json::to_string(&EventKind::CompensationTriggered).unwrap();
        assert_eq!(json, "\"compensation_triggered\"");
    }
}
