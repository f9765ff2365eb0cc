//! Coordination integration: the classic two-agent deadlock, detection,
//! mitigation, and the event trail.

use std::sync::Arc;

use warden_core::coordination::deadlock;
use warden_core::coordination::livelock::{LivelockConfig, LivelockDetector};
use warden_core::coordination::mitigation::{MitigationStrategy, Mitigator};
use warden_core::coordination::{CoordinationPolicy, LockManager, LockType};
use warden_core::events::EventLog;

use serde_json::json;
use warden_test_utils::create_test_db;

#[tokio::test]
async fn deadlock_detect_and_abort_mitigation() {
    let (pool, _dir) = create_test_db().await;
    let events = EventLog::new(pool.clone());
    let locks = Arc::new(LockManager::new(Some(events.clone())));
    let livelocks = Arc::new(LivelockDetector::new(LivelockConfig::default()));

    locks
        .register_resource("r1", CoordinationPolicy::Exclusive, None)
        .await;
    locks
        .register_resource("r2", CoordinationPolicy::Exclusive, None)
        .await;

    // alpha holds r1 and wants r2; beta holds r2 and wants r1.
    locks
        .acquire_lock("r1", "alpha", "wf-dl", LockType::Write)
        .await
        .unwrap();
    locks
        .acquire_lock("r2", "beta", "wf-dl", LockType::Write)
        .await
        .unwrap();
    locks
        .acquire_lock("r2", "alpha", "wf-dl", LockType::Write)
        .await
        .unwrap_err();
    locks
        .acquire_lock("r1", "beta", "wf-dl", LockType::Write)
        .await
        .unwrap_err();

    // Detection finds the two-agent cycle with both resources.
    let deps = locks.dependencies().await;
    let detection = deadlock::detect(&deps).expect("deadlock expected");
    let mut cycle = detection.cycle.clone();
    cycle.sort_unstable();
    assert_eq!(cycle, vec!["alpha", "beta"]);
    assert!(detection.resources.contains("r1"));
    assert!(detection.resources.contains("r2"));

    // Wait-for closure: each cycle member holds something its
    // predecessor waits on.
    for agent in &detection.cycle {
        assert!(!deps[agent].held_resources.is_empty());
        assert!(!deps[agent].waiting_for.is_empty());
    }

    // ABORT: both agents hold one resource, so the tie breaks to the
    // lexicographically smallest id.
    let mitigator = Mitigator::new(Arc::clone(&locks), livelocks, Some(events.clone()));
    let report = mitigator
        .mitigate_deadlock(&detection, MitigationStrategy::Abort)
        .await
        .unwrap();

    assert_eq!(report.affected_agents, vec!["alpha".to_owned()]);
    assert_eq!(report.released_locks, 1);
    assert!(locks.locks_on("r1").await.is_empty());

    // beta can now take r1.
    locks
        .acquire_lock("r1", "beta", "wf-dl", LockType::Write)
        .await
        .unwrap();

    // Event trail: mitigation started and completed with the victim.
    let coordination_events = events.read("coordination", None).await.unwrap();
    let started = coordination_events
        .iter()
        .any(|e| e.event_type == "mitigation_started");
    let completed = coordination_events.iter().find(|e| {
        e.event_type == "mitigation_completed"
            && e.data
                .as_ref()
                .is_some_and(|d| d.0["affected_agents"] == json!(["alpha"]))
    });
    assert!(started);
    assert!(completed.is_some(), "expected mitigation_completed with affected agents");

    // Lock lifecycle events were recorded against the workflow stream.
    let lock_events = events.read("wf-dl", None).await.unwrap();
    assert!(lock_events.iter().any(|e| e.event_type == "lock_acquired"));
    assert!(lock_events.iter().any(|e| e.event_type == "lock_released"));
}

#[tokio::test]
async fn replan_mitigation_picks_cheapest_agent() {
    let (pool, _dir) = create_test_db().await;
    let events = EventLog::new(pool.clone());
    let locks = Arc::new(LockManager::new(Some(events.clone())));
    let livelocks = Arc::new(LivelockDetector::new(LivelockConfig::default()));

    // alpha holds two resources, beta one; they deadlock on r1/r3.
    locks
        .acquire_lock("r1", "alpha", "wf-rp", LockType::Write)
        .await
        .unwrap();
    locks
        .acquire_lock("r2", "alpha", "wf-rp", LockType::Write)
        .await
        .unwrap();
    locks
        .acquire_lock("r3", "beta", "wf-rp", LockType::Write)
        .await
        .unwrap();
    locks
        .acquire_lock("r3", "alpha", "wf-rp", LockType::Write)
        .await
        .unwrap_err();
    locks
        .acquire_lock("r1", "beta", "wf-rp", LockType::Write)
        .await
        .unwrap_err();

    let detection = deadlock::detect(&locks.dependencies().await).expect("deadlock expected");
    let mitigator = Mitigator::new(Arc::clone(&locks), livelocks, Some(events));
    let report = mitigator
        .mitigate_deadlock(&detection, MitigationStrategy::Replan)
        .await
        .unwrap();

    // REPLAN sacrifices the agent holding the fewest resources.
    assert_eq!(report.affected_agents, vec!["beta".to_owned()]);
    assert!(report.replan_signaled);
    assert!(locks.locks_on("r3").await.is_empty());
    assert_eq!(locks.locks_on("r1").await.len(), 1);
}

#[tokio::test]
async fn livelock_detection_and_mitigation_round_trip() {
    let (pool, _dir) = create_test_db().await;
    let events = EventLog::new(pool.clone());
    let locks = Arc::new(LockManager::new(None));
    let livelocks = Arc::new(LivelockDetector::new(LivelockConfig::default()));

    // An agent ping-ponging between two states.
    for i in 0..10 {
        livelocks.record_state("stuck-agent", &json!({ "phase": i % 2 }));
    }
    let detection = livelocks.detect("stuck-agent").expect("livelock expected");
    assert_eq!(detection.agent_id, "stuck-agent");
    assert_eq!(detection.window.len(), 10);

    let mitigator = Mitigator::new(locks, Arc::clone(&livelocks), Some(events.clone()));
    let report = mitigator
        .mitigate_livelock(&detection, MitigationStrategy::Abort)
        .await
        .unwrap();

    assert_eq!(report.affected_agents, vec!["stuck-agent".to_owned()]);
    assert!(livelocks.detect("stuck-agent").is_none());

    let coordination_events = events.read("coordination", None).await.unwrap();
    assert!(
        coordination_events
            .iter()
            .any(|e| e.event_type == "mitigation_completed")
    );
}
