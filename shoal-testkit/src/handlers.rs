use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use shoal::{ExecutionStatus, TaskContext, TaskHandler, TaskId};

/// One observed handler execution.
#[derive(Clone, Debug)]
pub struct ExecutionRecord {
    pub task_id: TaskId,
    pub attempt: u32,
    pub started_at: Instant,
}

/// Succeeds always, recording every execution in order. Optionally holds
/// each execution for a fixed delay to keep tasks visibly in flight.
#[derive(Clone, Default)]
pub struct RecordingHandler {
    log: Arc<Mutex<Vec<ExecutionRecord>>>,
    delay: Option<Duration>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            log: Arc::new(Mutex::new(Vec::new())),
            delay: Some(delay),
        }
    }

    pub fn executions(&self) -> Vec<ExecutionRecord> {
        self.log.lock().clone()
    }

    /// Task ids in execution order.
    pub fn executed_ids(&self) -> Vec<TaskId> {
        self.log.lock().iter().map(|r| r.task_id.clone()).collect()
    }

    pub fn execution_count(&self) -> usize {
        self.log.lock().len()
    }
}

#[async_trait]
impl TaskHandler for RecordingHandler {
    async fn handle(&self, _payload: &[u8], ctx: &TaskContext) -> ExecutionStatus {
        self.log.lock().push(ExecutionRecord {
            task_id: ctx.task_id().clone(),
            attempt: ctx.attempt(),
            started_at: Instant::now(),
        });
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        ExecutionStatus::Success
    }
}

/// Fails the first `fail_times` executions, then succeeds, recording the
/// start of every attempt so tests can assert backoff gaps.
#[derive(Clone)]
pub struct FlakyHandler {
    fail_times: u32,
    calls: Arc<AtomicU32>,
    attempts: Arc<Mutex<Vec<Instant>>>,
}

impl FlakyHandler {
    pub fn failing(fail_times: u32) -> Self {
        Self {
            fail_times,
            calls: Arc::new(AtomicU32::new(0)),
            attempts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn attempt_times(&self) -> Vec<Instant> {
        self.attempts.lock().clone()
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskHandler for FlakyHandler {
    async fn handle(&self, _payload: &[u8], _ctx: &TaskContext) -> ExecutionStatus {
        self.attempts.lock().push(Instant::now());
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.fail_times {
            ExecutionStatus::failure(format!("scripted failure {}", call + 1))
        } else {
            ExecutionStatus::Success
        }
    }
}

/// Fails every execution with a fixed message.
#[derive(Clone)]
pub struct AlwaysFailHandler {
    error: String,
    calls: Arc<AtomicU32>,
}

impl AlwaysFailHandler {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskHandler for AlwaysFailHandler {
    async fn handle(&self, _payload: &[u8], _ctx: &TaskContext) -> ExecutionStatus {
        self.calls.fetch_add(1, Ordering::SeqCst);
        ExecutionStatus::failure(self.error.clone())
    }
}

/// Sleeps for a fixed duration, then succeeds. Used to keep a task in
/// flight across a shutdown.
#[derive(Clone)]
pub struct SleepingHandler {
    duration: Duration,
    started: Arc<AtomicBool>,
}

impl SleepingHandler {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            started: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Whether an execution has begun.
    pub fn has_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskHandler for SleepingHandler {
    async fn handle(&self, _payload: &[u8], _ctx: &TaskContext) -> ExecutionStatus {
        self.started.store(true, Ordering::SeqCst);
        tokio::time::sleep(self.duration).await;
        ExecutionStatus::Success
    }
}
