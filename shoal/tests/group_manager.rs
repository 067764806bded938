//! Behavior of the registry and the group manager primitives against the
//! in-memory store: idempotent indexing, claim ordering, cap enforcement,
//! delay gating, pause/resume, stats, conflict retries and recovery.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use shoal::{
    EventBus, GroupConfig, GroupManager, QueueError, Store, TaskId, TaskOptions, TaskRecord,
    TaskRegistry, TaskState,
};
use shoal_testkit::InMemoryStore;

fn record(id: &str, group: &str) -> TaskRecord {
    TaskRecord::new(
        TaskId::new(id),
        "noop",
        vec![],
        TaskOptions::default().with_group(group),
        Utc::now(),
    )
}

fn harness(cap: usize) -> (Arc<InMemoryStore>, Arc<EventBus>, GroupManager) {
    let store = Arc::new(InMemoryStore::new());
    let events = Arc::new(EventBus::new(store.clone(), 256));
    let group = GroupManager::new(
        store.clone(),
        events.clone(),
        "g",
        GroupConfig {
            concurrency_cap: cap,
            weight: 1,
        },
    );
    (store, events, group)
}

#[tokio::test]
async fn registry_rejects_duplicate_ids() {
    let store = Arc::new(InMemoryStore::new());
    let registry = TaskRegistry::new(store);
    let task = record("dup", "g");

    registry.insert(&task).await.unwrap();
    let err = registry.insert(&task).await.unwrap_err();
    assert!(matches!(err, QueueError::DuplicateId(id) if id.as_str() == "dup"));
}

#[tokio::test]
async fn registry_round_trips_and_lists_by_state() {
    let store = Arc::new(InMemoryStore::new());
    let registry = TaskRegistry::new(store);

    let mut a = record("a", "g");
    let b = record("b", "g");
    registry.insert(&a).await.unwrap();
    registry.insert(&b).await.unwrap();

    a.state = TaskState::Completed;
    a.attempts = 1;
    registry.update(&a).await.unwrap();

    let fetched = registry.get(&TaskId::new("a")).await.unwrap().unwrap();
    assert_eq!(fetched.state, TaskState::Completed);
    assert_eq!(fetched.attempts, 1);

    let completed = registry
        .list("default", Some(TaskState::Completed))
        .await
        .unwrap();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].id.as_str(), "a");

    let all = registry.list("default", None).await.unwrap();
    assert_eq!(all.len(), 2);
}

#[tokio::test]
async fn add_task_is_idempotent() {
    let (store, _events, group) = harness(1);
    let task = record("t1", "g");

    group.add_task(&task).await.unwrap();
    group.add_task(&task).await.unwrap();

    assert_eq!(store.scard("group:g:tasks").await.unwrap(), 1);
    assert_eq!(store.zcard("group:g:order").await.unwrap(), 1);
    let stats = group.get_stats().await.unwrap();
    assert_eq!(stats.total, 1);
}

#[tokio::test]
async fn claims_follow_arrival_order() {
    let (_store, _events, group) = harness(1);
    for id in ["a", "b", "c"] {
        group.add_task(&record(id, "g")).await.unwrap();
    }

    let mut order = Vec::new();
    for _ in 0..3 {
        let (id, queue) = group.claim_next().await.unwrap().unwrap();
        assert_eq!(queue, "default");
        group
            .complete_task(&id, TaskState::Completed, None)
            .await
            .unwrap();
        order.push(id.as_str().to_string());
    }
    assert_eq!(order, ["a", "b", "c"]);
    assert!(group.claim_next().await.unwrap().is_none());
}

#[tokio::test]
async fn concurrency_cap_bounds_claims() {
    let (store, _events, group) = harness(2);
    for id in ["a", "b", "c", "d"] {
        group.add_task(&record(id, "g")).await.unwrap();
    }

    let first = group.claim_next().await.unwrap();
    let second = group.claim_next().await.unwrap();
    assert!(first.is_some() && second.is_some());

    // Cap reached: no further claims until something completes.
    assert!(group.claim_next().await.unwrap().is_none());
    assert_eq!(store.scard("group:g:processing").await.unwrap(), 2);

    let (id, _) = first.unwrap();
    group
        .complete_task(&id, TaskState::Completed, None)
        .await
        .unwrap();
    assert!(group.claim_next().await.unwrap().is_some());
}

#[tokio::test]
async fn future_head_is_not_claimable() {
    let (_store, _events, group) = harness(1);
    let task = TaskRecord::new(
        TaskId::new("later"),
        "noop",
        vec![],
        TaskOptions::default()
            .with_group("g")
            .with_not_before(Utc::now() + ChronoDuration::seconds(60)),
        Utc::now(),
    );
    assert_eq!(task.state, TaskState::Delayed);
    group.add_task(&task).await.unwrap();

    assert!(group.claim_next().await.unwrap().is_none());
}

#[tokio::test]
async fn requeue_restores_claimability_and_delay_defers() {
    let (store, _events, group) = harness(1);
    group.add_task(&record("t", "g")).await.unwrap();

    let (id, _) = group.claim_next().await.unwrap().unwrap();
    group.requeue_task(&id, 0).await.unwrap();
    assert_eq!(store.scard("group:g:processing").await.unwrap(), 0);
    assert_eq!(
        store.hget("group:g:state", "t").await.unwrap().as_deref(),
        Some("waiting")
    );

    let (id, _) = group.claim_next().await.unwrap().unwrap();
    group.requeue_task(&id, 60_000).await.unwrap();
    assert_eq!(
        store.hget("group:g:state", "t").await.unwrap().as_deref(),
        Some("delayed")
    );
    // Deferred a minute out: present in order, but not claimable yet.
    assert_eq!(store.zcard("group:g:order").await.unwrap(), 1);
    assert!(group.claim_next().await.unwrap().is_none());
}

#[tokio::test]
async fn terminal_tasks_leave_both_indices() {
    let (store, _events, group) = harness(1);
    group.add_task(&record("t", "g")).await.unwrap();

    let (id, _) = group.claim_next().await.unwrap().unwrap();
    group
        .complete_task(&id, TaskState::Completed, None)
        .await
        .unwrap();

    assert_eq!(store.zcard("group:g:order").await.unwrap(), 0);
    assert_eq!(store.scard("group:g:processing").await.unwrap(), 0);
    assert_eq!(
        store.hget("group:g:state", "t").await.unwrap().as_deref(),
        Some("completed")
    );
    // Membership and state survive for observation.
    assert!(store.sismember("group:g:tasks", "t").await.unwrap());
}

#[tokio::test]
async fn pause_blocks_claims_and_resume_restores_them() {
    let (store, _events, group) = harness(2);
    group.add_task(&record("running", "g")).await.unwrap();
    group.add_task(&record("pending", "g")).await.unwrap();

    let (active_id, _) = group.claim_next().await.unwrap().unwrap();
    assert_eq!(active_id.as_str(), "running");

    let flipped = group.pause_all().await.unwrap();
    assert_eq!(flipped, 1);
    assert!(group.claim_next().await.unwrap().is_none());
    // The active task is untouched by a pause.
    assert_eq!(
        store.hget("group:g:state", "running").await.unwrap().as_deref(),
        Some("active")
    );
    // The cache is warm by now, so this exercises the incremental counter.
    let stats = group.get_stats().await.unwrap();
    assert_eq!(stats.paused, 1);
    assert_eq!(stats.active, 1);

    let resumed = group.resume_all().await.unwrap();
    assert_eq!(resumed, 1);
    let stats = group.get_stats().await.unwrap();
    assert_eq!(stats.paused, 0);
    let (id, _) = group.claim_next().await.unwrap().unwrap();
    assert_eq!(id.as_str(), "pending");
}

#[tokio::test]
async fn stats_track_transitions_and_refresh_recomputes() {
    let (store, _events, group) = harness(2);
    for id in ["a", "b", "c"] {
        group.add_task(&record(id, "g")).await.unwrap();
    }
    let (id, _) = group.claim_next().await.unwrap().unwrap();

    let stats = group.get_stats().await.unwrap();
    assert_eq!(stats.total, 3);
    assert_eq!(stats.active, 1);

    group
        .complete_task(&id, TaskState::Failed, Some("boom".into()))
        .await
        .unwrap();
    let stats = group.get_stats().await.unwrap();
    assert_eq!(stats.active, 0);
    assert_eq!(stats.failed, 1);

    // A trashed cache is rebuilt from the state map.
    store.del("group:g:stats").await.unwrap();
    let stats = group.get_stats().await.unwrap();
    assert_eq!(stats.total, 3);
    assert_eq!(stats.failed, 1);
}

#[tokio::test]
async fn claim_retries_through_conflicts_and_yields_on_exhaustion() {
    let (store, _events, group) = harness(1);
    group.add_task(&record("t", "g")).await.unwrap();

    // Two aborts, then the third attempt commits.
    store.force_conflicts(2);
    let claimed = group.claim_next().await.unwrap();
    assert!(claimed.is_some());
    group.requeue_task(&claimed.unwrap().0, 0).await.unwrap();

    // Aborts on every attempt: the claimer yields and the task stays put.
    store.force_conflicts(3);
    assert!(group.claim_next().await.unwrap().is_none());
    assert_eq!(store.zcard("group:g:order").await.unwrap(), 1);
    assert_eq!(store.scard("group:g:processing").await.unwrap(), 0);
}

#[tokio::test]
async fn recover_orphans_returns_processing_tasks_to_order() {
    let (store, _events, group) = harness(1);
    group.add_task(&record("t", "g")).await.unwrap();
    let (id, _) = group.claim_next().await.unwrap().unwrap();
    assert_eq!(store.scard("group:g:processing").await.unwrap(), 1);

    // Simulates a worker that died holding the claim.
    let recovered = group.recover_orphans().await.unwrap();
    assert_eq!(recovered, 1);
    assert_eq!(store.scard("group:g:processing").await.unwrap(), 0);
    assert_eq!(store.zcard("group:g:order").await.unwrap(), 1);

    let (again, _) = group.claim_next().await.unwrap().unwrap();
    assert_eq!(again, id);
}

#[tokio::test]
async fn discard_pending_drops_a_waiting_task() {
    let (store, _events, group) = harness(1);
    group.add_task(&record("t", "g")).await.unwrap();

    assert!(group.discard_pending(&TaskId::new("t")).await.unwrap());
    assert_eq!(store.zcard("group:g:order").await.unwrap(), 0);
    assert_eq!(
        store.hget("group:g:state", "t").await.unwrap().as_deref(),
        Some("failed")
    );
    // A second discard finds nothing pending.
    assert!(!group.discard_pending(&TaskId::new("t")).await.unwrap());
}
