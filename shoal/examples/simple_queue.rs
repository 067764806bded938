//! Basic enqueue/claim/complete against the group primitives, without the
//! engine. Uses the in-memory store; point `RedisStore::connect` at a real
//! server for the networked equivalent.
//!
//! Run with: cargo run --example simple_queue

use std::sync::Arc;

use chrono::Utc;
use shoal::{EventBus, GroupConfig, GroupManager, TaskId, TaskOptions, TaskRecord, TaskState};
use shoal_testkit::InMemoryStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let store = Arc::new(InMemoryStore::new());
    let events = Arc::new(EventBus::new(store.clone(), 256));
    let group = GroupManager::new(
        store,
        events.clone(),
        "reports",
        GroupConfig {
            concurrency_cap: 1,
            weight: 1,
        },
    );

    // Watch the lifecycle go by.
    let mut bus = events.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = bus.recv().await {
            println!(
                "event: {:<14} task={} state={:?}",
                event.kind.as_str(),
                event.task_id,
                event.state
            );
        }
    });

    for name in ["monthly", "quarterly", "annual"] {
        let record = TaskRecord::new(
            TaskId::new(name),
            "render_report",
            name.as_bytes().to_vec(),
            TaskOptions::default().with_group("reports"),
            Utc::now(),
        );
        group.add_task(&record).await?;
        println!("enqueued {name}");
    }

    // Claim and complete in arrival order; the cap of 1 serializes the
    // group even with many claimers.
    while let Some((id, queue)) = group.claim_next().await? {
        println!("claimed {id} (queue {queue})");
        group
            .complete_task(&id, TaskState::Completed, None)
            .await?;
    }

    let stats = group.get_stats().await?;
    println!(
        "done: total={} completed={} failed={}",
        stats.total, stats.completed, stats.failed
    );
    Ok(())
}
