//! Multi-agent coordination: resource locks, deadlock and livelock
//! detection, and mitigation.
//!
//! Locks honor a per-resource [`CoordinationPolicy`]. The manager tracks
//! which resources each agent holds and has requested; the wait-for graph
//! is rebuilt from that tracking on every detection pass, so there are no
//! persistent cyclic references between agents.

pub mod deadlock;
pub mod livelock;
pub mod mitigation;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::{EventKind, EventLog};

/// Stream id used for coordination events not tied to one workflow.
pub const COORDINATION_STREAM: &str = "coordination";

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Read or write access to a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockType {
    Read,
    Write,
}

impl fmt::Display for LockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Read => "read",
            Self::Write => "write",
        })
    }
}

/// How contention on a resource is resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum CoordinationPolicy {
    /// Any existing lock blocks.
    Exclusive,
    /// Read-read compatible up to `max_concurrent`; any write is
    /// exclusive.
    Shared { max_concurrent: usize },
    /// Contention resolved by a configured agent ordering; ties reject.
    Ordered { order: Vec<String> },
    /// Contention resolved by configured priorities (higher wins); ties
    /// reject.
    Priority { priorities: BTreeMap<String, i64> },
}

/// A granted lock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLock {
    pub resource_id: String,
    pub agent_id: String,
    pub workflow_id: String,
    pub lock_type: LockType,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// One agent's coordination footprint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentDependency {
    pub agent_id: String,
    pub held_resources: BTreeSet<String>,
    pub requested_resources: BTreeSet<String>,
    /// Agents holding resources this agent is waiting on. Rebuilt from
    /// held/requested tracking on every snapshot.
    pub waiting_for: BTreeSet<String>,
}

/// Lock acquisition failures.
#[derive(Debug, Error)]
pub enum LockError {
    /// The resource is held; the request was recorded as waiting.
    #[error("lock on {resource:?} denied for agent {agent:?}: {reason}")]
    Denied {
        resource: String,
        agent: String,
        reason: String,
    },

    /// Ordering/priority tie; the request is rejected outright and not
    /// recorded as waiting.
    #[error("lock on {resource:?} rejected for agent {agent:?}: {reason}")]
    Rejected {
        resource: String,
        agent: String,
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

struct ResourceState {
    policy: CoordinationPolicy,
    timeout: Option<Duration>,
    locks: Vec<ResourceLock>,
}

#[derive(Default)]
struct CoordState {
    resources: HashMap<String, ResourceState>,
    /// agent id -> resources requested but not yet granted.
    requested: HashMap<String, BTreeSet<String>>,
}

/// The resource lock manager.
pub struct LockManager {
    inner: Mutex<CoordState>,
    events: Option<EventLog>,
    default_timeout: Option<Duration>,
}

impl LockManager {
    pub fn new(events: Option<EventLog>) -> Self {
        Self {
            inner: Mutex::new(CoordState::default()),
            events,
            default_timeout: Some(Duration::from_secs(30)),
        }
    }

    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Register a resource with an explicit policy and lock timeout.
    pub async fn register_resource(
        &self,
        resource_id: &str,
        policy: CoordinationPolicy,
        timeout: Option<Duration>,
    ) {
        let mut state = self.inner.lock().await;
        state.resources.insert(
            resource_id.to_owned(),
            ResourceState {
                policy,
                timeout,
                locks: Vec::new(),
            },
        );
    }

    /// Acquire a lock on a resource.
    ///
    /// An unregistered resource is registered on first use with the
    /// EXCLUSIVE policy and the manager's default timeout. A denial under
    /// contention records the request so deadlock detection can see the
    /// wait edge.
    pub async fn acquire_lock(
        &self,
        resource_id: &str,
        agent_id: &str,
        workflow_id: &str,
        lock_type: LockType,
    ) -> Result<ResourceLock, LockError> {
        let now = Utc::now();
        let granted = {
            let mut state = self.inner.lock().await;
            let default_timeout = self.default_timeout;
            let resource = state
                .resources
                .entry(resource_id.to_owned())
                .or_insert_with(|| ResourceState {
                    policy: CoordinationPolicy::Exclusive,
                    timeout: default_timeout,
                    locks: Vec::new(),
                });

            resource.locks.retain(|l| !is_expired(l, now));

            match admit(resource, agent_id, lock_type) {
                Admission::Grant => {
                    let lock = ResourceLock {
                        resource_id: resource_id.to_owned(),
                        agent_id: agent_id.to_owned(),
                        workflow_id: workflow_id.to_owned(),
                        lock_type,
                        acquired_at: now,
                        expires_at: resource
                            .timeout
                            .and_then(|t| chrono::Duration::from_std(t).ok())
                            .map(|t| now + t),
                    };
                    resource.locks.push(lock.clone());
                    state
                        .requested
                        .entry(agent_id.to_owned())
                        .or_default()
                        .remove(resource_id);
                    Ok(lock)
                }
                Admission::Wait(reason) => {
                    state
                        .requested
                        .entry(agent_id.to_owned())
                        .or_default()
                        .insert(resource_id.to_owned());
                    Err(LockError::Denied {
                        resource: resource_id.to_owned(),
                        agent: agent_id.to_owned(),
                        reason,
                    })
                }
                Admission::Reject(reason) => Err(LockError::Rejected {
                    resource: resource_id.to_owned(),
                    agent: agent_id.to_owned(),
                    reason,
                }),
            }
        };

        match &granted {
            Ok(lock) => {
                debug!(
                    resource = %resource_id,
                    agent = %agent_id,
                    lock_type = %lock_type,
                    "lock acquired"
                );
                self.emit(
                    EventKind::LockAcquired,
                    &lock.workflow_id,
                    json!({
                        "resource_id": resource_id,
                        "agent_id": agent_id,
                        "lock_type": lock_type,
                    }),
                )
                .await;
            }
            Err(e) => {
                debug!(resource = %resource_id, agent = %agent_id, error = %e, "lock denied");
            }
        }

        granted
    }

    /// Release an agent's lock(s) on a resource. Returns how many locks
    /// were released.
    pub async fn release_lock(&self, resource_id: &str, agent_id: &str) -> usize {
        let released = {
            let mut state = self.inner.lock().await;
            match state.resources.get_mut(resource_id) {
                Some(resource) => {
                    let before = resource.locks.len();
                    let released: Vec<ResourceLock> = resource
                        .locks
                        .iter()
                        .filter(|l| l.agent_id == agent_id)
                        .cloned()
                        .collect();
                    resource.locks.retain(|l| l.agent_id != agent_id);
                    debug_assert_eq!(before - resource.locks.len(), released.len());
                    released
                }
                None => Vec::new(),
            }
        };

        for lock in &released {
            self.emit(
                EventKind::LockReleased,
                &lock.workflow_id,
                json!({
                    "resource_id": resource_id,
                    "agent_id": agent_id,
                }),
            )
            .await;
        }

        released.len()
    }

    /// Release every lock an agent holds. Returns the released locks.
    pub async fn release_all_for_agent(&self, agent_id: &str) -> Vec<ResourceLock> {
        let released = {
            let mut state = self.inner.lock().await;
            let mut released = Vec::new();
            for resource in state.resources.values_mut() {
                released.extend(
                    resource
                        .locks
                        .iter()
                        .filter(|l| l.agent_id == agent_id)
                        .cloned(),
                );
                resource.locks.retain(|l| l.agent_id != agent_id);
            }
            state.requested.remove(agent_id);
            released
        };

        for lock in &released {
            self.emit(
                EventKind::LockReleased,
                &lock.workflow_id,
                json!({
                    "resource_id": lock.resource_id,
                    "agent_id": agent_id,
                    "forced": true,
                }),
            )
            .await;
        }

        released
    }

    /// Drop a recorded wait (the agent gave up on the resource).
    pub async fn clear_request(&self, resource_id: &str, agent_id: &str) {
        let mut state = self.inner.lock().await;
        if let Some(requested) = state.requested.get_mut(agent_id) {
            requested.remove(resource_id);
        }
    }

    /// Release expired locks and emit `lock_timeout` for each.
    pub async fn sweep_expired(&self) -> Vec<ResourceLock> {
        let now = Utc::now();
        let expired = {
            let mut state = self.inner.lock().await;
            let mut expired = Vec::new();
            for resource in state.resources.values_mut() {
                expired.extend(resource.locks.iter().filter(|l| is_expired(l, now)).cloned());
                resource.locks.retain(|l| !is_expired(l, now));
            }
            expired
        };

        for lock in &expired {
            warn!(
                resource = %lock.resource_id,
                agent = %lock.agent_id,
                "lock expired, released by sweeper"
            );
            self.emit(
                EventKind::LockTimeout,
                &lock.workflow_id,
                json!({
                    "resource_id": lock.resource_id,
                    "agent_id": lock.agent_id,
                    "acquired_at": lock.acquired_at,
                }),
            )
            .await;
        }

        expired
    }

    /// Spawn a periodic sweeper task; cancel the token to stop it.
    pub fn spawn_sweeper(
        self: std::sync::Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let manager = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let expired = manager.sweep_expired().await;
                        if !expired.is_empty() {
                            info!(count = expired.len(), "sweeper released expired locks");
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        })
    }

    /// Snapshot of every agent's coordination footprint, with the
    /// wait-for edges rebuilt from current holders.
    pub async fn dependencies(&self) -> HashMap<String, AgentDependency> {
        let state = self.inner.lock().await;
        let now = Utc::now();

        let mut deps: HashMap<String, AgentDependency> = HashMap::new();
        // Holders.
        for (resource_id, resource) in &state.resources {
            for lock in resource.locks.iter().filter(|l| !is_expired(l, now)) {
                let dep = deps.entry(lock.agent_id.clone()).or_default();
                dep.agent_id = lock.agent_id.clone();
                dep.held_resources.insert(resource_id.clone());
            }
        }
        // Requesters and wait-for edges.
        for (agent_id, requested) in &state.requested {
            if requested.is_empty() {
                continue;
            }
            let holders_by_resource: Vec<(String, Vec<String>)> = requested
                .iter()
                .map(|resource_id| {
                    let holders = state
                        .resources
                        .get(resource_id)
                        .map(|r| {
                            r.locks
                                .iter()
                                .filter(|l| !is_expired(l, now) && l.agent_id != *agent_id)
                                .map(|l| l.agent_id.clone())
                                .collect()
                        })
                        .unwrap_or_default();
                    (resource_id.clone(), holders)
                })
                .collect();

            let dep = deps.entry(agent_id.clone()).or_default();
            dep.agent_id = agent_id.clone();
            for (resource_id, holders) in holders_by_resource {
                dep.requested_resources.insert(resource_id);
                dep.waiting_for.extend(holders);
            }
        }

        deps
    }

    /// Current locks on a resource (expired locks excluded).
    pub async fn locks_on(&self, resource_id: &str) -> Vec<ResourceLock> {
        let state = self.inner.lock().await;
        let now = Utc::now();
        state
            .resources
            .get(resource_id)
            .map(|r| {
                r.locks
                    .iter()
                    .filter(|l| !is_expired(l, now))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn emit(&self, kind: EventKind, workflow_id: &str, data: serde_json::Value) {
        if let Some(events) = &self.events {
            if let Err(e) = events.append(kind, workflow_id, None, None, Some(data)).await {
                warn!(error = %e, "failed to append coordination event");
            }
        }
    }
}

fn is_expired(lock: &ResourceLock, now: DateTime<Utc>) -> bool {
    lock.expires_at.is_some_and(|at| at <= now)
}

enum Admission {
    Grant,
    Wait(String),
    Reject(String),
}

/// Decide admission under the resource's policy.
fn admit(resource: &ResourceState, agent_id: &str, lock_type: LockType) -> Admission {
    if resource.locks.is_empty() {
        return Admission::Grant;
    }

    match &resource.policy {
        CoordinationPolicy::Exclusive => {
            Admission::Wait(format!(
                "exclusive resource held by {}",
                holders(resource).join(", ")
            ))
        }
        CoordinationPolicy::Shared { max_concurrent } => {
            let any_write = resource
                .locks
                .iter()
                .any(|l| l.lock_type == LockType::Write);
            if any_write {
                return Admission::Wait("shared resource held by a writer".into());
            }
            if lock_type == LockType::Write {
                return Admission::Wait("shared resource has active readers".into());
            }
            if resource.locks.len() >= *max_concurrent {
                return Admission::Wait(format!(
                    "shared resource at max concurrency ({max_concurrent})"
                ));
            }
            Admission::Grant
        }
        CoordinationPolicy::Ordered { order } => {
            let rank = |agent: &str| order.iter().position(|a| a == agent);
            let requester = rank(agent_id);
            let best_holder = resource
                .locks
                .iter()
                .filter_map(|l| rank(&l.agent_id))
                .min();
            match (requester, best_holder) {
                (Some(r), Some(h)) if r == h => {
                    Admission::Reject("ordering tie with current holder".into())
                }
                (None, _) => Admission::Reject("agent not in resource ordering".into()),
                _ => Admission::Wait(format!(
                    "ordered resource held by {}",
                    holders(resource).join(", ")
                )),
            }
        }
        CoordinationPolicy::Priority { priorities } => {
            let requester = priorities.get(agent_id).copied().unwrap_or(i64::MIN);
            let best_holder = resource
                .locks
                .iter()
                .map(|l| priorities.get(&l.agent_id).copied().unwrap_or(i64::MIN))
                .max()
                .unwrap_or(i64::MIN);
            if requester == best_holder {
                Admission::Reject("priority tie with current holder".into())
            } else {
                Admission::Wait(format!(
                    "priority resource held by {}",
                    holders(resource).join(", ")
                ))
            }
        }
    }
}

fn holders(resource: &ResourceState) -> Vec<String> {
    let mut agents: Vec<String> = resource
        .locks
        .iter()
        .map(|l| l.agent_id.clone())
        .collect();
    agents.sort_unstable();
    agents.dedup();
    agents
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn exclusive_lock_blocks_second_agent() {
        let manager = LockManager::new(None);
        manager
            .acquire_lock("r1", "alpha", "wf", LockType::Write)
            .await
            .unwrap();
        let err = manager
            .acquire_lock("r1", "beta", "wf", LockType::Read)
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Denied { .. }));
    }

    #[tokio::test]
    async fn shared_allows_readers_up_to_limit() {
        let manager = LockManager::new(None);
        manager
            .register_resource("r1", CoordinationPolicy::Shared { max_concurrent: 2 }, None)
            .await;

        manager
            .acquire_lock("r1", "a", "wf", LockType::Read)
            .await
            .unwrap();
        manager
            .acquire_lock("r1", "b", "wf", LockType::Read)
            .await
            .unwrap();
        let err = manager
            .acquire_lock("r1", "c", "wf", LockType::Read)
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Denied { .. }));
    }

    #[tokio::test]
    async fn shared_write_is_exclusive() {
        let manager = LockManager::new(None);
        manager
            .register_resource("r1", CoordinationPolicy::Shared { max_concurrent: 4 }, None)
            .await;

        manager
            .acquire_lock("r1", "a", "wf", LockType::Read)
            .await
            .unwrap();
        let err = manager
            .acquire_lock("r1", "b", "wf", LockType::Write)
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Denied { .. }));
    }

    #[tokio::test]
    async fn ordered_tie_rejects() {
        let manager = LockManager::new(None);
        manager
            .register_resource(
                "r1",
                CoordinationPolicy::Ordered {
                    order: vec!["a".into(), "a".into()],
                },
                None,
            )
            .await;
        manager
            .acquire_lock("r1", "a", "wf", LockType::Write)
            .await
            .unwrap();
        let err = manager
            .acquire_lock("r1", "a", "wf", LockType::Write)
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Rejected { .. }));
    }

    #[tokio::test]
    async fn priority_tie_rejects() {
        let manager = LockManager::new(None);
        let mut priorities = BTreeMap::new();
        priorities.insert("a".to_owned(), 5);
        priorities.insert("b".to_owned(), 5);
        manager
            .register_resource("r1", CoordinationPolicy::Priority { priorities }, None)
            .await;
        manager
            .acquire_lock("r1", "a", "wf", LockType::Write)
            .await
            .unwrap();
        let err = manager
            .acquire_lock("r1", "b", "wf", LockType::Write)
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Rejected { .. }));
    }

    #[tokio::test]
    async fn release_unblocks_resource() {
        let manager = LockManager::new(None);
        manager
            .acquire_lock("r1", "a", "wf", LockType::Write)
            .await
            .unwrap();
        assert_eq!(manager.release_lock("r1", "a").await, 1);
        manager
            .acquire_lock("r1", "b", "wf", LockType::Write)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn sweeper_releases_expired_locks() {
        let manager =
            LockManager::new(None).with_default_timeout(Some(Duration::from_millis(1)));
        manager
            .acquire_lock("r1", "a", "wf", LockType::Write)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let expired = manager.sweep_expired().await;
        assert_eq!(expired.len(), 1);
        assert!(manager.locks_on("r1").await.is_empty());
    }

    #[tokio::test]
    async fn spawned_sweeper_releases_expired_locks() {
        let manager = std::sync::Arc::new(
            LockManager::new(None).with_default_timeout(Some(Duration::from_millis(1))),
        );
        manager
            .acquire_lock("r1", "a", "wf", LockType::Write)
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let handle = std::sync::Arc::clone(&manager)
            .spawn_sweeper(Duration::from_millis(5), cancel.clone());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(manager.locks_on("r1").await.is_empty());

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn denied_request_appears_in_dependencies() {
        let manager = LockManager::new(None);
        manager
            .acquire_lock("r1", "a", "wf", LockType::Write)
            .await
            .unwrap();
        let _ = manager.acquire_lock("r1", "b", "wf", LockType::Write).await;

        let deps = manager.dependencies().await;
        let b = &deps["b"];
        assert!(b.requested_resources.contains("r1"));
        assert!(b.waiting_for.contains("a"));
        assert!(deps["a"].held_resources.contains("r1"));
    }
}
