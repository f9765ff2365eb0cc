//! Versioned world state with snapshots and diffs.
//!
//! A keyed store under optimistic concurrency: updates must present the
//! version they read, and the store rejects writes whose version has
//! moved. Snapshots are immutable full copies persisted by id; diffs are
//! deterministic per-key deltas in lexicographic key order.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::SqlitePool;
use uuid::Uuid;

use warden_db::models::WorldEntry;
use warden_db::queries::world as world_db;

use crate::error::KernelError;

/// One key's value and version inside a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub value: Value,
    pub version: i64,
}

/// An immutable copy of the world state at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub id: String,
    pub entries: BTreeMap<String, SnapshotEntry>,
    pub taken_at: DateTime<Utc>,
}

impl StateSnapshot {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key).map(|e| &e.value)
    }
}

/// The per-key operation a diff entry represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffOp {
    Create,
    Update,
    Delete,
}

/// One key's delta between two snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffEntry {
    pub key: String,
    pub before: Option<Value>,
    pub after: Option<Value>,
    pub op: DiffOp,
}

/// Ordered per-key delta between snapshot `a` (before) and `b` (after).
///
/// Deterministic: keys are visited in lexicographic order (both inputs
/// hold `BTreeMap`s), and unchanged keys are omitted.
pub fn diff(a: &StateSnapshot, b: &StateSnapshot) -> Vec<DiffEntry> {
    let mut entries = Vec::new();

    for (key, before) in &a.entries {
        match b.entries.get(key) {
            None => entries.push(DiffEntry {
                key: key.clone(),
                before: Some(before.value.clone()),
                after: None,
                op: DiffOp::Delete,
            }),
            Some(after) if after.value != before.value => entries.push(DiffEntry {
                key: key.clone(),
                before: Some(before.value.clone()),
                after: Some(after.value.clone()),
                op: DiffOp::Update,
            }),
            Some(_) => {}
        }
    }

    for (key, after) in &b.entries {
        if !a.entries.contains_key(key) {
            entries.push(DiffEntry {
                key: key.clone(),
                before: None,
                after: Some(after.value.clone()),
                op: DiffOp::Create,
            });
        }
    }

    entries.sort_by(|x, y| x.key.cmp(&y.key));
    entries
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// The versioned world state store.
#[derive(Debug, Clone)]
pub struct WorldStateStore {
    pool: SqlitePool,
}

impl WorldStateStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create a key at version 1. Fails with [`KernelError::Conflict`]
    /// when the key already exists.
    pub async fn create(&self, key: &str, value: Value) -> Result<WorldEntry, KernelError> {
        let created = world_db::insert_entry(&self.pool, key, &value, Utc::now()).await?;
        if !created {
            let current = world_db::get_entry(&self.pool, key).await?;
            return Err(KernelError::Conflict {
                key: key.to_owned(),
                expected: 0,
                actual: current.map(|e| e.version).unwrap_or_default(),
            });
        }
        self.must_get(key).await
    }

    /// Read a key.
    pub async fn read(&self, key: &str) -> Result<Option<WorldEntry>, KernelError> {
        Ok(world_db::get_entry(&self.pool, key).await?)
    }

    /// Update a key. When `expected_version` is supplied and the stored
    /// version differs, fails with [`KernelError::Conflict`].
    pub async fn update(
        &self,
        key: &str,
        value: Value,
        expected_version: Option<i64>,
    ) -> Result<WorldEntry, KernelError> {
        let rows =
            world_db::update_entry(&self.pool, key, &value, expected_version, Utc::now()).await?;
        if rows == 0 {
            return Err(self.conflict_for(key, expected_version).await?);
        }
        self.must_get(key).await
    }

    /// Delete a key, optionally guarded by an expected version.
    pub async fn delete(
        &self,
        key: &str,
        expected_version: Option<i64>,
    ) -> Result<(), KernelError> {
        let rows = world_db::delete_entry(&self.pool, key, expected_version).await?;
        if rows == 0 {
            return Err(self.conflict_for(key, expected_version).await?);
        }
        Ok(())
    }

    /// Build an unpersisted view of the full world state (for checks
    /// that need the current state but no durable snapshot).
    pub async fn peek(&self) -> Result<StateSnapshot, KernelError> {
        let entries = self.collect_entries().await?;
        Ok(StateSnapshot {
            id: Uuid::new_v4().to_string(),
            entries,
            taken_at: Utc::now(),
        })
    }

    async fn collect_entries(&self) -> Result<BTreeMap<String, SnapshotEntry>, KernelError> {
        let rows = world_db::list_entries(&self.pool).await?;
        Ok(rows
            .into_iter()
            .map(|e| {
                (
                    e.key,
                    SnapshotEntry {
                        value: e.value.0,
                        version: e.version,
                    },
                )
            })
            .collect())
    }

    /// Take a persisted, immutable snapshot of the full world state.
    pub async fn snapshot(&self) -> Result<StateSnapshot, KernelError> {
        let entries = self.collect_entries().await?;

        let snapshot = StateSnapshot {
            id: Uuid::new_v4().to_string(),
            entries,
            taken_at: Utc::now(),
        };

        let entries_json = serde_json::to_value(&snapshot.entries)
            .context("failed to serialize snapshot entries")?;
        world_db::insert_snapshot(&self.pool, &snapshot.id, &entries_json, snapshot.taken_at)
            .await?;

        Ok(snapshot)
    }

    /// Load a previously persisted snapshot.
    pub async fn load_snapshot(&self, id: &str) -> Result<StateSnapshot, KernelError> {
        let row = world_db::get_snapshot(&self.pool, id)
            .await?
            .ok_or_else(|| KernelError::SnapshotNotFound(id.to_owned()))?;

        let entries: BTreeMap<String, SnapshotEntry> = serde_json::from_value(row.entries.0)
            .context("failed to deserialize snapshot entries")?;

        Ok(StateSnapshot {
            id: row.id,
            entries,
            taken_at: row.taken_at,
        })
    }

    /// Restore the world state to a snapshot's contents.
    ///
    /// Keys created since the snapshot are deleted; every snapshot key is
    /// rewritten with a version strictly above both its snapshot version
    /// and the current version, preserving per-key monotonicity.
    pub async fn restore(&self, snapshot: &StateSnapshot) -> Result<(), KernelError> {
        let now = Utc::now();
        let current = world_db::list_entries(&self.pool).await?;

        for entry in &current {
            if !snapshot.entries.contains_key(&entry.key) {
                world_db::delete_entry(&self.pool, &entry.key, None).await?;
            }
        }

        let current_versions: BTreeMap<&str, i64> = current
            .iter()
            .map(|e| (e.key.as_str(), e.version))
            .collect();

        for (key, entry) in &snapshot.entries {
            let floor = current_versions.get(key.as_str()).copied().unwrap_or(0);
            let version = floor.max(entry.version) + 1;
            world_db::restore_entry(&self.pool, key, &entry.value, version, now).await?;
        }

        Ok(())
    }

    async fn must_get(&self, key: &str) -> Result<WorldEntry, KernelError> {
        world_db::get_entry(&self.pool, key)
            .await?
            .with_context(|| format!("world entry {key:?} disappeared mid-operation"))
            .map_err(KernelError::from)
    }

    async fn conflict_for(
        &self,
        key: &str,
        expected_version: Option<i64>,
    ) -> Result<KernelError, KernelError> {
        let current = world_db::get_entry(&self.pool, key).await?;
        Ok(KernelError::Conflict {
            key: key.to_owned(),
            expected: expected_version.unwrap_or_default(),
            actual: current.map(|e| e.version).unwrap_or_default(),
        })
    }
}
