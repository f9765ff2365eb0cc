//! Exactly-once side-effect mediator.
//!
//! Every external effect is recorded as a durable intent before it runs.
//! The UNIQUE idempotency key plus the `pending/failed -> processing`
//! claim ensures the effect function never runs twice for a key that has
//! already committed; replays return the cached result. Exhausted entries
//! park in the dead-letter state, and [`OutboxService::reconcile`] repairs
//! entries orphaned by crashes.

use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use sqlx::SqlitePool;
use tracing::{info, warn};
use uuid::Uuid;

use warden_db::models::{OutboxEntry, OutboxState};
use warden_db::queries::outbox as outbox_db;

use crate::error::KernelError;

/// Default retry budget for outbox effects.
pub const DEFAULT_MAX_ATTEMPTS: i64 = 3;

/// Default threshold after which a `processing` entry is considered
/// orphaned by a crashed worker.
pub const DEFAULT_STALE_PROCESSING: Duration = Duration::from_secs(5 * 60);

/// Options for [`OutboxService::reconcile`].
#[derive(Debug, Clone)]
pub struct ReconcileOptions {
    /// Only entries newer than this take part in reconciliation.
    pub max_age: Duration,
    /// `processing` entries idle longer than this reset to `pending`.
    pub stale_processing_after: Duration,
    /// Reset `failed` entries with budget left back to `pending`.
    pub auto_retry: bool,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(24 * 60 * 60),
            stale_processing_after: DEFAULT_STALE_PROCESSING,
            auto_retry: false,
        }
    }
}

/// Counts of repair actions taken by one reconcile pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub stale_processing_reset: u64,
    pub failed_retried: u64,
}

/// Durable intent log with exactly-once execution per idempotency key.
#[derive(Debug, Clone)]
pub struct OutboxService {
    pool: SqlitePool,
}

impl OutboxService {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Execute an effect exactly once per idempotency key.
    ///
    /// 1. A key that already committed returns its cached result without
    ///    invoking `effect`; a dead-lettered key fails.
    /// 2. Otherwise the entry is inserted (if absent), claimed for
    ///    processing, and `effect` runs. Success commits the result;
    ///    failure records the error and, once attempts reach the budget,
    ///    parks the entry in the dead-letter state.
    #[allow(clippy::too_many_arguments)]
    pub async fn execute<F, Fut>(
        &self,
        workflow_id: &str,
        task_id: &str,
        tool_id: &str,
        params: Value,
        idempotency_key: &str,
        max_attempts: i64,
        effect: F,
    ) -> Result<Value, KernelError>
    where
        F: FnOnce(Value) -> Fut,
        Fut: Future<Output = anyhow::Result<Value>>,
    {
        let entry = self
            .claim(workflow_id, task_id, tool_id, &params, idempotency_key, max_attempts)
            .await?;

        let entry = match entry {
            Claimed::Cached(result) => return Ok(result),
            Claimed::Entry(entry) => entry,
        };

        match effect(params).await {
            Ok(result) => {
                outbox_db::mark_committed(&self.pool, &entry.id, &result, Utc::now()).await?;
                info!(
                    idempotency_key = %idempotency_key,
                    tool_id = %tool_id,
                    "outbox effect committed"
                );
                Ok(result)
            }
            Err(e) => {
                let message = e.to_string();
                outbox_db::mark_failed(&self.pool, &entry.id, &message, Utc::now()).await?;

                // attempts was incremented by the processing claim.
                if entry.attempts + 1 >= entry.max_attempts {
                    outbox_db::promote_dead_letter(&self.pool, &entry.id, Utc::now()).await?;
                    warn!(
                        idempotency_key = %idempotency_key,
                        tool_id = %tool_id,
                        attempts = entry.attempts + 1,
                        "outbox effect dead-lettered"
                    );
                }

                Err(KernelError::ToolExecution {
                    tool: tool_id.to_owned(),
                    message,
                })
            }
        }
    }

    /// Resolve the entry for a key and claim it for processing.
    async fn claim(
        &self,
        workflow_id: &str,
        task_id: &str,
        tool_id: &str,
        params: &Value,
        idempotency_key: &str,
        max_attempts: i64,
    ) -> Result<Claimed, KernelError> {
        let existing = outbox_db::get_by_idempotency_key(&self.pool, idempotency_key).await?;

        let entry = match existing {
            Some(entry) => self.check_reuse(entry, workflow_id, task_id, tool_id)?,
            None => {
                let new = outbox_db::NewOutboxEntry {
                    id: Uuid::new_v4().to_string(),
                    workflow_id: workflow_id.to_owned(),
                    task_id: task_id.to_owned(),
                    tool_id: tool_id.to_owned(),
                    params: params.clone(),
                    idempotency_key: idempotency_key.to_owned(),
                    max_attempts,
                };
                outbox_db::insert_pending(&self.pool, &new, Utc::now()).await?;
                // Re-read: either our insert or a concurrent winner's row.
                let entry = outbox_db::get_by_idempotency_key(&self.pool, idempotency_key)
                    .await?
                    .ok_or_else(|| KernelError::IdempotencyViolation {
                        key: idempotency_key.to_owned(),
                        reason: "entry vanished after insert".into(),
                    })?;
                self.check_reuse(entry, workflow_id, task_id, tool_id)?
            }
        };

        match entry.state {
            OutboxState::Committed => {
                let cached = entry.result.map(|j| j.0).unwrap_or(Value::Null);
                return Ok(Claimed::Cached(cached));
            }
            OutboxState::DeadLetter => {
                return Err(KernelError::ResourceExhausted {
                    resource: "outbox".into(),
                    message: format!(
                        "idempotency key {:?} is dead-lettered after {} attempt(s)",
                        idempotency_key, entry.attempts
                    ),
                });
            }
            OutboxState::Pending | OutboxState::Failed | OutboxState::Processing => {}
        }

        let rows = outbox_db::mark_processing(&self.pool, &entry.id, Utc::now()).await?;
        if rows == 0 {
            // Lost the claim. If the other worker committed, serve the
            // cached result; otherwise the effect is in flight.
            let current = outbox_db::get_by_idempotency_key(&self.pool, idempotency_key)
                .await?
                .ok_or_else(|| KernelError::IdempotencyViolation {
                    key: idempotency_key.to_owned(),
                    reason: "entry vanished during claim".into(),
                })?;
            if current.state == OutboxState::Committed {
                let cached = current.result.map(|j| j.0).unwrap_or(Value::Null);
                return Ok(Claimed::Cached(cached));
            }
            return Err(KernelError::ResourceExhausted {
                resource: "outbox".into(),
                message: format!(
                    "idempotency key {:?} is already in flight ({})",
                    idempotency_key, current.state
                ),
            });
        }

        Ok(Claimed::Entry(entry))
    }

    /// Reject a key reused with different coordinates.
    fn check_reuse(
        &self,
        entry: OutboxEntry,
        workflow_id: &str,
        task_id: &str,
        tool_id: &str,
    ) -> Result<OutboxEntry, KernelError> {
        if entry.workflow_id != workflow_id
            || entry.task_id != task_id
            || entry.tool_id != tool_id
        {
            return Err(KernelError::IdempotencyViolation {
                key: entry.idempotency_key.clone(),
                reason: format!(
                    "key bound to {}/{}/{} but reused for {}/{}/{}",
                    entry.workflow_id,
                    entry.task_id,
                    entry.tool_id,
                    workflow_id,
                    task_id,
                    tool_id
                ),
            });
        }
        Ok(entry)
    }

    /// Repair entries orphaned by crashes: stale `processing` entries
    /// reset to `pending`, and (optionally) `failed` entries with budget
    /// left retry.
    pub async fn reconcile(
        &self,
        options: &ReconcileOptions,
    ) -> Result<ReconcileReport, KernelError> {
        let now = Utc::now();
        let stale_cutoff = now
            - chrono::Duration::from_std(options.stale_processing_after)
                .unwrap_or(chrono::Duration::seconds(300));
        let min_created = now
            - chrono::Duration::from_std(options.max_age)
                .unwrap_or(chrono::Duration::days(1));

        let stale_processing_reset =
            outbox_db::reset_stale_processing(&self.pool, stale_cutoff, now).await?;

        let failed_retried = if options.auto_retry {
            outbox_db::retry_failed(&self.pool, min_created, now).await?
        } else {
            0
        };

        if stale_processing_reset > 0 || failed_retried > 0 {
            info!(
                stale_processing_reset,
                failed_retried, "outbox reconcile repaired entries"
            );
        }

        Ok(ReconcileReport {
            stale_processing_reset,
            failed_retried,
        })
    }

    /// Delete committed entries older than the retention horizon.
    pub async fn cleanup(&self, older_than: Duration) -> Result<u64, KernelError> {
        let horizon = Utc::now()
            - chrono::Duration::from_std(older_than).unwrap_or(chrono::Duration::days(7));
        Ok(outbox_db::delete_committed_before(&self.pool, horizon).await?)
    }

    /// Look up an entry by idempotency key.
    pub async fn get_by_idempotency_key(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<OutboxEntry>, KernelError> {
        Ok(outbox_db::get_by_idempotency_key(&self.pool, idempotency_key).await?)
    }

    /// Per-state entry counts.
    pub async fn stats(&self) -> Result<Vec<(OutboxState, i64)>, KernelError> {
        Ok(outbox_db::count_by_state(&self.pool).await?)
    }

    /// Whether any entry for the workflow is currently `processing`.
    pub async fn has_processing_for_workflow(
        &self,
        workflow_id: &str,
    ) -> Result<bool, KernelError> {
        Ok(outbox_db::has_processing_for_workflow(&self.pool, workflow_id).await?)
    }
}

enum Claimed {
    /// The key already committed; serve the cached result.
    Cached(Value),
    /// The entry as it was before the processing claim.
    Entry(OutboxEntry),
}
