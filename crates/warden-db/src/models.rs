use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use sqlx::types::Json;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Paused,
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Paused => "paused",
        };
        f.write_str(s)
    }
}

impl FromStr for WorkflowStatus {
    type Err = WorkflowStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "paused" => Ok(Self::Paused),
            other => Err(WorkflowStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`WorkflowStatus`] string.
#[derive(Debug, Clone)]
pub struct WorkflowStatusParseError(pub String);

impl fmt::Display for WorkflowStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid workflow status: {:?}", self.0)
    }
}

impl std::error::Error for WorkflowStatusParseError {}

// ---------------------------------------------------------------------------

/// Status of a task within a workflow.
///
/// `completed`, `failed`, and `timeout` are terminal. `retrying` marks a
/// failed attempt with retry budget left; the orchestrator moves it back to
/// `running` on the next attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Retrying,
    #[sqlx(rename = "timeout")]
    #[serde(rename = "timeout")]
    Timeout,
}

impl TaskStatus {
    /// Whether this status is terminal (write-once).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Timeout)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Retrying => "retrying",
            Self::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "retrying" => Ok(Self::Retrying),
            "timeout" => Ok(Self::Timeout),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

// ---------------------------------------------------------------------------

/// Lifecycle state of an outbox entry.
///
/// `dead_letter` is terminal; only `committed` entries carry a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OutboxState {
    Pending,
    Processing,
    Committed,
    Failed,
    DeadLetter,
}

impl fmt::Display for OutboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Committed => "committed",
            Self::Failed => "failed",
            Self::DeadLetter => "dead_letter",
        };
        f.write_str(s)
    }
}

impl FromStr for OutboxState {
    type Err = OutboxStateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "committed" => Ok(Self::Committed),
            "failed" => Ok(Self::Failed),
            "dead_letter" => Ok(Self::DeadLetter),
            other => Err(OutboxStateParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`OutboxState`] string.
#[derive(Debug, Clone)]
pub struct OutboxStateParseError(pub String);

impl fmt::Display for OutboxStateParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid outbox state: {:?}", self.0)
    }
}

impl std::error::Error for OutboxStateParseError {}

// ---------------------------------------------------------------------------
// Row models
// ---------------------------------------------------------------------------

/// A row in the `workflow_states` table.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Workflow {
    pub workflow_id: String,
    pub tenant_id: Option<String>,
    pub status: WorkflowStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A row in the `task_states` table.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Task {
    pub workflow_id: String,
    pub task_id: String,
    pub status: TaskStatus,
    pub attempt: i64,
    pub result: Option<Json<Value>>,
    pub error: Option<String>,
    pub timed_out: bool,
    pub metadata: Json<Value>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// A row in the `events` table.
///
/// `sequence` is the global append sequence; filtering by `workflow_id`
/// preserves per-workflow total order.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Event {
    pub sequence: i64,
    pub workflow_id: String,
    pub task_id: Option<String>,
    pub tenant_id: Option<String>,
    pub event_type: String,
    pub data: Option<Json<Value>>,
    pub metadata: Option<Json<Value>>,
    pub recorded_at: DateTime<Utc>,
}

/// A row in the `world_state` table.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct WorldEntry {
    pub key: String,
    pub value: Json<Value>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A row in the `world_snapshots` table.
///
/// `entries` holds the full keyed copy (`key -> {value, version}`) taken at
/// `taken_at`.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub entries: Json<Value>,
    pub taken_at: DateTime<Utc>,
}

/// A row in the `outbox_entries` table.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: String,
    pub workflow_id: String,
    pub task_id: String,
    pub tool_id: String,
    pub params: Json<Value>,
    pub idempotency_key: String,
    pub state: OutboxState,
    pub attempts: i64,
    pub max_attempts: i64,
    pub result: Option<Json<Value>>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_status_roundtrip() {
        for s in [
            "pending",
            "running",
            "completed",
            "failed",
            "retrying",
            "timeout",
        ] {
            let parsed: TaskStatus = s.parse().unwrap();
            assert_eq!(parsed.to_string(), s);
        }
    }

    #[test]
    fn task_status_rejects_unknown() {
        assert!("exploded".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Timeout.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(!TaskStatus::Retrying.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
    }

    #[test]
    fn workflow_status_roundtrip() {
        for s in ["pending", "running", "completed", "failed", "paused"] {
            let parsed: WorkflowStatus = s.parse().unwrap();
            assert_eq!(parsed.to_string(), s);
        }
    }

    #[test]
    fn outbox_state_roundtrip() {
        for s in ["pending", "processing", "committed", "failed", "dead_letter"] {
            let parsed: OutboxState = s.parse().unwrap();
            assert_eq!(parsed.to_string(), s);
        }
    }

    #[test]
    fn outbox_state_serde_uses_snake_case() {
        let json = serde_json::to_string(&OutboxState::DeadLetter).unwrap();
        assert_eq!(json, "\"dead_letter\"");
    }

    #[test]
    fn task_status_timeout_serde_rename() {
        let json = serde_json::to_string(&TaskStatus::Timeout).unwrap();
        assert_eq!(json, "\"timeout\"");
    }
}
