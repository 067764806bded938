//! Micro-benchmarks for the hot group primitives over the in-memory store:
//! index, claim, complete.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use criterion::{criterion_group, criterion_main, Criterion};
use tokio::runtime::Runtime;

use shoal::{EventBus, GroupConfig, GroupManager, TaskId, TaskOptions, TaskRecord, TaskState};
use shoal_testkit::InMemoryStore;

fn bench_group_ops(c: &mut Criterion) {
    let rt = Runtime::new().expect("tokio runtime");
    let store = Arc::new(InMemoryStore::new());
    let events = Arc::new(EventBus::new(store.clone(), 4096));
    let group = Arc::new(GroupManager::new(
        store,
        events,
        "bench",
        GroupConfig {
            concurrency_cap: 64,
            weight: 1,
        },
    ));
    let counter = AtomicU64::new(0);

    c.bench_function("add_task", |b| {
        b.to_async(&rt).iter(|| {
            let group = Arc::clone(&group);
            let n = counter.fetch_add(1, Ordering::Relaxed);
            async move {
                let record = TaskRecord::new(
                    TaskId::new(format!("add-{n}")),
                    "noop",
                    vec![],
                    TaskOptions::default().with_group("bench"),
                    Utc::now(),
                );
                group.add_task(&record).await.expect("add");
            }
        })
    });

    c.bench_function("claim_and_complete", |b| {
        b.to_async(&rt).iter(|| {
            let group = Arc::clone(&group);
            let n = counter.fetch_add(1, Ordering::Relaxed);
            async move {
                let record = TaskRecord::new(
                    TaskId::new(format!("cycle-{n}")),
                    "noop",
                    vec![],
                    TaskOptions::default().with_group("bench"),
                    Utc::now(),
                );
                group.add_task(&record).await.expect("add");
                if let Some((id, _queue)) = group.claim_next().await.expect("claim") {
                    group
                        .complete_task(&id, TaskState::Completed, None)
                        .await
                        .expect("complete");
                }
            }
        })
    });
}

criterion_group!(benches, bench_group_ops);
criterion_main!(benches);
