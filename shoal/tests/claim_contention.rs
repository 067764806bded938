//! Claim safety under real concurrency: many slots racing for one task,
//! and sustained claim/complete churn with no tasks lost or duplicated.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use shoal::{
    EventBus, GroupConfig, GroupManager, Store, TaskId, TaskOptions, TaskRecord, TaskState,
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

fn group_on(store: Arc<InMemoryStore>, cap: usize) -> Arc<GroupManager> {
    let events = Arc::new(EventBus::new(store.clone(), 4096));
    Arc::new(GroupManager::new(
        store,
        events,
        "g",
        GroupConfig {
            concurrency_cap: cap,
            weight: 1,
        },
    ))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn fifty_claimers_one_task_exactly_one_wins() {
    let store = Arc::new(InMemoryStore::new());
    let group = group_on(store, 1);
    group.add_task(&record("contested", "g")).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..50 {
        let group = Arc::clone(&group);
        handles.push(tokio::spawn(async move { group.claim_next().await.unwrap() }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap().is_some() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1, "expected exactly one successful claim");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn churn_loses_no_tasks_and_duplicates_none() {
    let store = Arc::new(InMemoryStore::new());
    let group = group_on(store.clone(), 3);

    let total = 60;
    for i in 0..total {
        group.add_task(&record(&format!("t{i}"), "g")).await.unwrap();
    }

    let mut workers = Vec::new();
    for _ in 0..6 {
        let group = Arc::clone(&group);
        workers.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            loop {
                match group.claim_next().await.unwrap() {
                    Some((id, _queue)) => {
                        group
                            .complete_task(&id, TaskState::Completed, None)
                            .await
                            .unwrap();
                        claimed.push(id.as_str().to_string());
                    }
                    None => {
                        // Empty or momentarily saturated; stop once drained.
                        let stats = group.get_stats().await.unwrap();
                        if stats.completed as usize >= total {
                            break;
                        }
                        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                    }
                }
            }
            claimed
        }));
    }

    let mut seen = HashSet::new();
    let mut executed = 0;
    for worker in workers {
        for id in worker.await.unwrap() {
            executed += 1;
            assert!(seen.insert(id), "a task was claimed twice");
        }
    }
    assert_eq!(executed, total, "some tasks were never executed");

    // Terminal tasks sit in neither index.
    assert_eq!(store.zcard("group:g:order").await.unwrap(), 0);
    assert_eq!(store.scard("group:g:processing").await.unwrap(), 0);
    let stats = group.get_stats().await.unwrap();
    assert_eq!(stats.completed as usize, total);
    assert_eq!(stats.active, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn processing_never_exceeds_the_cap() {
    let store = Arc::new(InMemoryStore::new());
    let cap = 2;
    let group = group_on(store.clone(), cap);
    for i in 0..10 {
        group.add_task(&record(&format!("t{i}"), "g")).await.unwrap();
    }

    // Saturate: with nothing completing, claims stop at the cap.
    let mut claimed = Vec::new();
    while let Some((id, _)) = group.claim_next().await.unwrap() {
        claimed.push(id);
    }
    assert_eq!(claimed.len(), cap);
    assert_eq!(store.scard("group:g:processing").await.unwrap(), cap);

    // Racing claimers cannot push past the cap either.
    let mut handles = Vec::new();
    for _ in 0..20 {
        let group = Arc::clone(&group);
        handles.push(tokio::spawn(async move { group.claim_next().await.unwrap() }));
    }
    for handle in handles {
        assert!(handle.await.unwrap().is_none());
    }
    assert_eq!(store.scard("group:g:processing").await.unwrap(), cap);
}
