use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Notify, RwLock};

use crate::events::{EventBus, EventKind, TaskEvent};
use crate::task::TaskId;

/// Result of one handler execution.
///
/// Failures are values, not panics: whether a failure leads to a retry or a
/// terminal state is the worker pool's decision, based on the task's
/// attempt count and retry budget.
#[derive(Clone, Debug)]
pub enum ExecutionStatus {
    Success,
    Failure { error: String },
}

impl ExecutionStatus {
    /// Convenience constructor for a failure.
    pub fn failure(error: impl Into<String>) -> Self {
        ExecutionStatus::Failure {
            error: error.into(),
        }
    }
}

/// Cancellation signal handed to a running task.
///
/// Fires on per-task timeout, pool shutdown, or admin cancellation.
/// Cooperative: handlers observe it at their own suspension points.
#[derive(Clone, Debug)]
pub struct CancelToken {
    inner: Arc<CancelTokenInner>,
}

#[derive(Debug)]
struct CancelTokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CancelTokenInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Wait until cancelled.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.inner.notify.notified().await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-execution context passed to a handler.
pub struct TaskContext {
    task_id: TaskId,
    group: Option<String>,
    /// 1-based number of this execution.
    attempt: u32,
    cancel: CancelToken,
    events: Arc<EventBus>,
}

impl TaskContext {
    pub fn new(
        task_id: TaskId,
        group: Option<String>,
        attempt: u32,
        cancel: CancelToken,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            task_id,
            group,
            attempt,
            cancel,
            events,
        }
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Cancellation signal for this execution.
    pub fn cancellation(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Publish a `progress_update` event on behalf of the running task.
    pub async fn report_progress(&self, data: serde_json::Value) {
        let mut event =
            TaskEvent::new(EventKind::ProgressUpdate, self.task_id.clone()).with_data(data);
        event.group = self.group.clone();
        self.events.publish(event).await;
    }
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("task_id", &self.task_id)
            .field("attempt", &self.attempt)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

/// A unit of application code invocable by method name.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, payload: &[u8], ctx: &TaskContext) -> ExecutionStatus;
}

/// Explicit name → handler mapping.
///
/// Registration is a plain call made during engine assembly; the core only
/// ever looks handlers up by the task's `method` string.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn TaskHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under a method name, replacing any previous
    /// registration for that name.
    pub async fn register(&self, method: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        self.handlers.write().await.insert(method.into(), handler);
    }

    pub async fn resolve(&self, method: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.read().await.get(method).cloned()
    }

    pub async fn method_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self
            .handlers
            .try_read()
            .map(|h| h.len())
            .unwrap_or_default();
        f.debug_struct("HandlerRegistry")
            .field("handler_count", &count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    struct Echo;

    #[async_trait]
    impl TaskHandler for Echo {
        async fn handle(&self, payload: &[u8], _ctx: &TaskContext) -> ExecutionStatus {
            if payload.is_empty() {
                ExecutionStatus::failure("empty payload")
            } else {
                ExecutionStatus::Success
            }
        }
    }

    #[tokio::test]
    async fn registry_resolves_by_name() {
        let registry = HandlerRegistry::new();
        registry.register("echo", Arc::new(Echo)).await;

        assert!(registry.resolve("echo").await.is_some());
        assert!(registry.resolve("unknown").await.is_none());
        assert_eq!(registry.method_names().await, vec!["echo".to_string()]);
    }

    #[tokio::test]
    async fn cancel_token_wakes_waiters() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();

        timeout(Duration::from_secs(1), handle)
            .await
            .expect("waiter did not observe cancellation")
            .unwrap();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_token_returns_immediately() {
        let token = CancelToken::new();
        token.cancel();
        timeout(Duration::from_millis(100), token.cancelled())
            .await
            .expect("cancelled() hung on an already-cancelled token");
    }
}
