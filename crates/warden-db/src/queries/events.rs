//! Database query functions for the append-only `events` table.
//!
//! Events are never updated or deleted. Tenant-scoped reads use strict
//! equality on `tenant_id`, so untagged events are invisible to every
//! tenant.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::SqlitePool;
use sqlx::types::Json;

use crate::models::Event;

/// Parameters for appending a new event row.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub workflow_id: String,
    pub task_id: Option<String>,
    pub tenant_id: Option<String>,
    pub event_type: String,
    pub data: Option<Value>,
    pub metadata: Option<Value>,
}

/// Append a new event. Returns the inserted row with its assigned
/// sequence number.
pub async fn insert_event(
    pool: &SqlitePool,
    new: &NewEvent,
    now: DateTime<Utc>,
) -> Result<Event> {
    let event = sqlx::query_as::<_, Event>(
        "INSERT INTO events (workflow_id, task_id, tenant_id, event_type, data, metadata, recorded_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?) \
         RETURNING *",
    )
    .bind(&new.workflow_id)
    .bind(&new.task_id)
    .bind(&new.tenant_id)
    .bind(&new.event_type)
    .bind(new.data.as_ref().map(Json))
    .bind(new.metadata.as_ref().map(Json))
    .bind(now)
    .fetch_one(pool)
    .await
    .with_context(|| {
        format!(
            "failed to insert event {} for workflow {}",
            new.event_type, new.workflow_id
        )
    })?;

    Ok(event)
}

/// Read all events for a workflow in append order.
///
/// When `tenant_id` is supplied, only events tagged with exactly that
/// tenant are returned.
pub async fn list_events_for_workflow(
    pool: &SqlitePool,
    workflow_id: &str,
    tenant_id: Option<&str>,
) -> Result<Vec<Event>> {
    let events = match tenant_id {
        Some(tenant) => {
            sqlx::query_as::<_, Event>(
                "SELECT * FROM events \
                 WHERE workflow_id = ? AND tenant_id = ? \
                 ORDER BY sequence ASC",
            )
            .bind(workflow_id)
            .bind(tenant)
            .fetch_all(pool)
            .await
        }
        None => {
            sqlx::query_as::<_, Event>(
                "SELECT * FROM events WHERE workflow_id = ? ORDER BY sequence ASC",
            )
            .bind(workflow_id)
            .fetch_all(pool)
            .await
        }
    }
    .with_context(|| format!("failed to list events for workflow {workflow_id}"))?;

    Ok(events)
}

/// Read all events for a tenant across workflows, in append order.
pub async fn list_events_by_tenant(pool: &SqlitePool, tenant_id: &str) -> Result<Vec<Event>> {
    let events = sqlx::query_as::<_, Event>(
        "SELECT * FROM events WHERE tenant_id = ? ORDER BY sequence ASC",
    )
    .bind(tenant_id)
    .fetch_all(pool)
    .await
    .with_context(|| format!("failed to list events for tenant {tenant_id}"))?;

    Ok(events)
}

/// Read a tenant's events recorded within `[from, to]`, in append order.
pub async fn list_events_in_window(
    pool: &SqlitePool,
    tenant_id: &str,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<Vec<Event>> {
    let events = sqlx::query_as::<_, Event>(
        "SELECT * FROM events \
         WHERE tenant_id = ? AND recorded_at >= ? AND recorded_at <= ? \
         ORDER BY sequence ASC",
    )
    .bind(tenant_id)
    .bind(from)
    .bind(to)
    .fetch_all(pool)
    .await
    .with_context(|| format!("failed to export events for tenant {tenant_id}"))?;

    Ok(events)
}
