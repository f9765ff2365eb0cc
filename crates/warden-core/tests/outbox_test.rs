//! Outbox integration: exactly-once execution, replay protection, dead
//! lettering, reconciliation, and cleanup.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use serde_json::{Value, json};

use warden_core::error::KernelError;
use warden_core::outbox::{OutboxService, ReconcileOptions};
use warden_db::models::OutboxState;
use warden_db::queries::outbox as outbox_db;
use warden_test_utils::create_test_db;

fn service(pool: &sqlx::SqlitePool) -> OutboxService {
    OutboxService::new(pool.clone())
}

async fn run_ok(
    outbox: &OutboxService,
    key: &str,
    counter: &Arc<AtomicU32>,
) -> Result<Value, KernelError> {
    let counter = Arc::clone(counter);
    outbox
        .execute(
            "wf-1",
            "t-1",
            "notify",
            json!({ "channel": "ops" }),
            key,
            3,
            move |_params| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(json!({ "delivered": true }))
            },
        )
        .await
}

#[tokio::test]
async fn effect_runs_exactly_once_per_key() {
    let (pool, _dir) = create_test_db().await;
    let outbox = service(&pool);
    let invocations = Arc::new(AtomicU32::new(0));

    let first = run_ok(&outbox, "key-1", &invocations).await.unwrap();
    let second = run_ok(&outbox, "key-1", &invocations).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(invocations.load(Ordering::SeqCst), 1, "fn must run once");

    let entry = outbox
        .get_by_idempotency_key("key-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.state, OutboxState::Committed);
    assert_eq!(entry.result.unwrap().0, json!({ "delivered": true }));
}

#[tokio::test]
async fn different_keys_run_independently() {
    let (pool, _dir) = create_test_db().await;
    let outbox = service(&pool);
    let invocations = Arc::new(AtomicU32::new(0));

    run_ok(&outbox, "key-a", &invocations).await.unwrap();
    run_ok(&outbox, "key-b", &invocations).await.unwrap();

    assert_eq!(invocations.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn failed_effect_records_error_and_retries_until_dead_letter() {
    let (pool, _dir) = create_test_db().await;
    let outbox = service(&pool);

    for attempt in 1..=2 {
        let err = outbox
            .execute(
                "wf-1",
                "t-1",
                "notify",
                json!({}),
                "key-dl",
                2,
                |_params| async move { anyhow::bail!("downstream unavailable") },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, KernelError::ToolExecution { .. }), "attempt {attempt}");
    }

    let entry = outbox
        .get_by_idempotency_key("key-dl")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.state, OutboxState::DeadLetter);
    assert_eq!(entry.attempts, 2);

    // A dead-lettered key refuses further execution.
    let err = outbox
        .execute("wf-1", "t-1", "notify", json!({}), "key-dl", 2, |_p| async {
            Ok(json!({}))
        })
        .await
        .unwrap_err();
    assert!(matches!(err, KernelError::ResourceExhausted { .. }));
}

#[tokio::test]
async fn key_reuse_with_different_coordinates_is_a_violation() {
    let (pool, _dir) = create_test_db().await;
    let outbox = service(&pool);
    let invocations = Arc::new(AtomicU32::new(0));

    run_ok(&outbox, "key-bound", &invocations).await.unwrap();

    let err = outbox
        .execute(
            "wf-other",
            "t-other",
            "notify",
            json!({}),
            "key-bound",
            3,
            |_p| async { Ok(json!({})) },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, KernelError::IdempotencyViolation { .. }));
}

#[tokio::test]
async fn reconcile_resets_stale_processing_entries() {
    let (pool, _dir) = create_test_db().await;
    let outbox = service(&pool);

    // An entry orphaned mid-processing (as after a crash).
    let new = outbox_db::NewOutboxEntry {
        id: "orphan-1".into(),
        workflow_id: "wf-1".into(),
        task_id: "t-1".into(),
        tool_id: "notify".into(),
        params: json!({}),
        idempotency_key: "key-orphan".into(),
        max_attempts: 3,
    };
    outbox_db::insert_pending(&pool, &new, chrono::Utc::now())
        .await
        .unwrap();
    outbox_db::mark_processing(&pool, "orphan-1", chrono::Utc::now())
        .await
        .unwrap();

    // A zero stale threshold treats every processing entry as orphaned.
    let report = outbox
        .reconcile(&ReconcileOptions {
            stale_processing_after: Duration::ZERO,
            ..ReconcileOptions::default()
        })
        .await
        .unwrap();
    assert_eq!(report.stale_processing_reset, 1);

    let entry = outbox
        .get_by_idempotency_key("key-orphan")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.state, OutboxState::Pending);
}

#[tokio::test]
async fn reconcile_auto_retries_failed_entries_with_budget() {
    let (pool, _dir) = create_test_db().await;
    let outbox = service(&pool);

    let _ = outbox
        .execute("wf-1", "t-1", "notify", json!({}), "key-retry", 3, |_p| async {
            anyhow::bail!("flaky downstream")
        })
        .await;

    let before = outbox
        .get_by_idempotency_key("key-retry")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(before.state, OutboxState::Failed);

    let report = outbox
        .reconcile(&ReconcileOptions {
            auto_retry: true,
            ..ReconcileOptions::default()
        })
        .await
        .unwrap();
    assert_eq!(report.failed_retried, 1);

    // The retried entry executes again and can commit.
    let invocations = Arc::new(AtomicU32::new(0));
    let result = run_ok(&outbox, "key-retry", &invocations).await.unwrap();
    assert_eq!(result, json!({ "delivered": true }));
}

#[tokio::test]
async fn cleanup_removes_committed_entries_past_horizon() {
    let (pool, _dir) = create_test_db().await;
    let outbox = service(&pool);
    let invocations = Arc::new(AtomicU32::new(0));

    run_ok(&outbox, "key-old", &invocations).await.unwrap();

    let removed = outbox.cleanup(Duration::ZERO).await.unwrap();
    assert_eq!(removed, 1);
    assert!(
        outbox
            .get_by_idempotency_key("key-old")
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn stats_count_entries_by_state() {
    let (pool, _dir) = create_test_db().await;
    let outbox = service(&pool);
    let invocations = Arc::new(AtomicU32::new(0));

    run_ok(&outbox, "key-s1", &invocations).await.unwrap();
    run_ok(&outbox, "key-s2", &invocations).await.unwrap();
    let _ = outbox
        .execute("wf-1", "t-1", "notify", json!({}), "key-s3", 3, |_p| async {
            anyhow::bail!("nope")
        })
        .await;

    let stats = outbox.stats().await.unwrap();
    let committed = stats
        .iter()
        .find(|(s, _)| *s == OutboxState::Committed)
        .map(|(_, n)| *n)
        .unwrap_or(0);
    let failed = stats
        .iter()
        .find(|(s, _)| *s == OutboxState::Failed)
        .map(|(_, n)| *n)
        .unwrap_or(0);
    assert_eq!(committed, 2);
    assert_eq!(failed, 1);
}

#[tokio::test]
async fn processing_entries_block_rollback_guard() {
    let (pool, _dir) = create_test_db().await;
    let outbox = service(&pool);

    let new = outbox_db::NewOutboxEntry {
        id: "inflight-1".into(),
        workflow_id: "wf-guard".into(),
        task_id: "t-1".into(),
        tool_id: "notify".into(),
        params: json!({}),
        idempotency_key: "key-inflight".into(),
        max_attempts: 3,
    };
    outbox_db::insert_pending(&pool, &new, chrono::Utc::now())
        .await
        .unwrap();
    outbox_db::mark_processing(&pool, "inflight-1", chrono::Utc::now())
        .await
        .unwrap();

    assert!(outbox.has_processing_for_workflow("wf-guard").await.unwrap());
    assert!(!outbox.has_processing_for_workflow("wf-other").await.unwrap());
}
