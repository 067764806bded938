//! A full engine: registered handlers, two groups under the round-robin
//! policy, and an event subscriber printing every transition.
//!
//! Run with: cargo run --example runtime_basic

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use shoal::{
    EngineBuilder, EngineConfig, ExecutionStatus, HandlerRegistry, QueueConfig, SubmitRequest,
    TaskContext, TaskHandler, TaskOptions,
};
use shoal_testkit::InMemoryStore;

struct Greet;

#[async_trait]
impl TaskHandler for Greet {
    async fn handle(&self, payload: &[u8], ctx: &TaskContext) -> ExecutionStatus {
        let who = String::from_utf8_lossy(payload);
        ctx.report_progress(serde_json::json!({ "step": "greeting" }))
            .await;
        println!("[attempt {}] hello, {who}!", ctx.attempt());
        ExecutionStatus::Success
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let handlers = Arc::new(HandlerRegistry::new());
    handlers.register("greet", Arc::new(Greet)).await;

    let config = EngineConfig::default()
        .with_queues(vec![QueueConfig::new("default")])
        .with_concurrency(2)
        .with_polling_interval_ms(50);
    let engine = EngineBuilder::new(config)
        .with_store(Arc::new(InMemoryStore::new()))
        .with_handlers(handlers)
        .build()?;

    let mut events = engine.events().subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            println!(
                "event: {:<14} task={} group={:?}",
                event.kind.as_str(),
                event.task_id,
                event.group
            );
        }
    });

    engine.clone().start().await?;

    for (who, group) in [
        ("alice", "east"),
        ("bob", "west"),
        ("carol", "east"),
        ("dave", "west"),
    ] {
        engine
            .enqueue(
                SubmitRequest::new("greet", who.as_bytes().to_vec())
                    .with_options(TaskOptions::default().with_group(group)),
            )
            .await?;
    }

    tokio::time::sleep(Duration::from_secs(1)).await;
    engine.shutdown().await?;
    Ok(())
}
