//! Retry semantics end to end: exponential backoff between attempts,
//! terminal failure on budget exhaustion, timeout accounting, and the
//! monotone attempt counter.

use std::sync::Arc;
use std::time::Duration;

use shoal::{
    Engine, EngineBuilder, EngineConfig, EventKind, HandlerRegistry, QueueConfig, SubmitRequest,
    TaskEvent, TaskHandler, TaskOptions, TaskState,
};
use shoal_testkit::{AlwaysFailHandler, FlakyHandler, InMemoryStore, SleepingHandler};
use tokio::sync::broadcast;

fn fast_config() -> EngineConfig {
    EngineConfig::default()
        .with_queues(vec![QueueConfig::new("default")])
        .with_concurrency(1)
        .with_polling_interval_ms(20)
}

async fn build_engine(
    config: EngineConfig,
    handlers: Vec<(&str, Arc<dyn TaskHandler>)>,
) -> Arc<Engine> {
    let store = Arc::new(InMemoryStore::new());
    let registry = Arc::new(HandlerRegistry::new());
    for (name, handler) in handlers {
        registry.register(name, handler).await;
    }
    EngineBuilder::new(config)
        .with_store(store)
        .with_handlers(registry)
        .build()
        .expect("engine build failed")
}

async fn collect_events(
    rx: &mut broadcast::Receiver<TaskEvent>,
    kind: EventKind,
    count: usize,
    deadline: Duration,
) -> Vec<TaskEvent> {
    let mut collected = Vec::new();
    let end = tokio::time::Instant::now() + deadline;
    while collected.len() < count {
        let remaining = end.duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Ok(event)) => {
                if event.kind == kind {
                    collected.push(event);
                }
            }
            Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
            Ok(Err(broadcast::error::RecvError::Closed)) => break,
            Err(_) => break,
        }
    }
    collected
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failing_twice_then_succeeding_backs_off_exponentially() {
    let handler = FlakyHandler::failing(2);
    let engine = build_engine(fast_config(), vec![("flaky", Arc::new(handler.clone()))]).await;
    let mut events = engine.events().subscribe();

    let id = engine
        .enqueue(SubmitRequest::new("flaky", vec![]).with_options(
            TaskOptions::default()
                .with_group("g")
                .with_max_retries(3)
                .with_retry_delay_ms(50),
        ))
        .await
        .unwrap();
    engine.clone().start().await.unwrap();

    let completed = collect_events(
        &mut events,
        EventKind::TaskCompleted,
        1,
        Duration::from_secs(15),
    )
    .await;
    engine.shutdown().await.unwrap();
    assert_eq!(completed.len(), 1);

    let record = engine.task(&id).await.unwrap().unwrap();
    assert_eq!(record.state, TaskState::Completed);
    assert_eq!(record.attempts, 3);
    assert!(record.last_error.is_none());

    // Gaps of at least base, then double the base.
    let times = handler.attempt_times();
    assert_eq!(times.len(), 3);
    let first_gap = times[1].duration_since(times[0]);
    let second_gap = times[2].duration_since(times[1]);
    assert!(first_gap >= Duration::from_millis(50), "first gap {first_gap:?}");
    assert!(second_gap >= Duration::from_millis(100), "second gap {second_gap:?}");
    assert!(second_gap < Duration::from_secs(5), "second gap {second_gap:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exhausting_retries_fails_terminally_with_one_failure_event() {
    let handler = AlwaysFailHandler::new("boom");
    let engine = build_engine(fast_config(), vec![("doomed", Arc::new(handler.clone()))]).await;
    let mut events = engine.events().subscribe();

    let id = engine
        .enqueue(SubmitRequest::new("doomed", vec![]).with_options(
            TaskOptions::default()
                .with_group("g")
                .with_max_retries(2)
                .with_retry_delay_ms(10),
        ))
        .await
        .unwrap();
    engine.clone().start().await.unwrap();

    let failed = collect_events(
        &mut events,
        EventKind::TaskFailed,
        1,
        Duration::from_secs(15),
    )
    .await;
    assert_eq!(failed.len(), 1);

    // Settle, then confirm no second task_failed ever arrives.
    let extra = collect_events(
        &mut events,
        EventKind::TaskFailed,
        1,
        Duration::from_millis(400),
    )
    .await;
    engine.shutdown().await.unwrap();
    assert!(extra.is_empty(), "task_failed was emitted more than once");

    let record = engine.task(&id).await.unwrap().unwrap();
    assert_eq!(record.state, TaskState::Failed);
    assert_eq!(record.attempts, 3);
    assert_eq!(record.last_error.as_deref(), Some("boom"));
    assert_eq!(handler.call_count(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn retry_events_carry_monotone_attempt_numbers() {
    let handler = AlwaysFailHandler::new("boom");
    let engine = build_engine(fast_config(), vec![("doomed", Arc::new(handler))]).await;
    let mut events = engine.events().subscribe();

    engine
        .enqueue(SubmitRequest::new("doomed", vec![]).with_options(
            TaskOptions::default()
                .with_group("g")
                .with_max_retries(2)
                .with_retry_delay_ms(10),
        ))
        .await
        .unwrap();
    engine.clone().start().await.unwrap();

    let retries = collect_events(
        &mut events,
        EventKind::RetryAttempt,
        2,
        Duration::from_secs(15),
    )
    .await;
    engine.shutdown().await.unwrap();

    let attempts: Vec<u64> = retries
        .iter()
        .filter_map(|e| e.data.as_ref())
        .filter_map(|d| d.get("attempt"))
        .filter_map(|a| a.as_u64())
        .collect();
    assert_eq!(attempts, [1, 2]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn timeouts_count_as_failures_and_are_tagged() {
    let handler = SleepingHandler::new(Duration::from_secs(30));
    let engine = build_engine(fast_config(), vec![("slow", Arc::new(handler))]).await;
    let mut events = engine.events().subscribe();

    let id = engine
        .enqueue(SubmitRequest::new("slow", vec![]).with_options(
            TaskOptions::default()
                .with_group("g")
                .with_max_retries(1)
                .with_retry_delay_ms(10)
                .with_timeout_ms(100),
        ))
        .await
        .unwrap();
    engine.clone().start().await.unwrap();

    let retries = collect_events(
        &mut events,
        EventKind::RetryAttempt,
        1,
        Duration::from_secs(15),
    )
    .await;
    assert_eq!(retries.len(), 1);
    let data = retries[0].data.as_ref().unwrap();
    assert_eq!(data.get("timed_out").and_then(|v| v.as_bool()), Some(true));

    let failed = collect_events(
        &mut events,
        EventKind::TaskFailed,
        1,
        Duration::from_secs(15),
    )
    .await;
    engine.shutdown().await.unwrap();
    assert_eq!(failed.len(), 1);

    let record = engine.task(&id).await.unwrap().unwrap();
    assert_eq!(record.state, TaskState::Failed);
    assert_eq!(record.attempts, 2);
    assert!(record
        .last_error
        .as_deref()
        .unwrap_or_default()
        .contains("timed out"));
}
