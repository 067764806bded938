use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::config::EngineConfig;
use crate::error::QueueError;
use crate::events::{EventBus, EventKind, TaskEvent};
use crate::group::{GroupConfig, GroupManager, GroupStats, QueueSnapshot, GROUPS_KEY};
use crate::handler::{CancelToken, ExecutionStatus, HandlerRegistry, TaskContext};
use crate::registry::TaskRegistry;
use crate::retry::{compute_retry_delay, is_final_attempt};
use crate::scheduler::GroupScheduler;
use crate::store::Store;
use crate::task::{SubmitRequest, TaskId, TaskRecord, TaskState};
use crate::telemetry;

/// Grace given to workers to requeue their tasks after the drain window
/// elapses and in-flight executions are force-cancelled.
const FORCED_DRAIN_GRACE: Duration = Duration::from_secs(5);

/// How one handler execution ended, before retry accounting.
#[derive(Debug)]
enum ExecOutcome {
    Success,
    Failure(String),
    TimedOut(u64),
    Cancelled,
}

/// The task queue engine.
///
/// An explicit value owning every component; nothing is process-global.
/// Producers call [`Engine::enqueue`], operators call the admin methods,
/// and [`Engine::start`] spawns the per-queue worker pools that claim and
/// execute tasks until [`Engine::shutdown`].
pub struct Engine {
    config: EngineConfig,
    store: Arc<dyn Store>,
    registry: TaskRegistry,
    handlers: Arc<HandlerRegistry>,
    events: Arc<EventBus>,
    scheduler: GroupScheduler,
    shutdown: CancelToken,
    worker_handles: Mutex<Vec<JoinHandle<()>>>,
    inflight: Mutex<HashMap<TaskId, CancelToken>>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn Store>,
        handlers: Arc<HandlerRegistry>,
    ) -> Self {
        let events = Arc::new(EventBus::new(store.clone(), config.event_capacity));
        let registry = TaskRegistry::new(store.clone());
        let scheduler = GroupScheduler::new(config.policy);
        Self {
            config,
            store,
            registry,
            handlers,
            events,
            scheduler,
            shutdown: CancelToken::new(),
            worker_handles: Mutex::new(Vec::new()),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn events(&self) -> Arc<EventBus> {
        Arc::clone(&self.events)
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn store(&self) -> Arc<dyn Store> {
        Arc::clone(&self.store)
    }

    /// Group manager for the given group name, configured per the engine's
    /// cap and weight settings. Synthetic per-queue groups inherit the
    /// queue's concurrency as their cap and the queue's priority as their
    /// weight.
    pub fn group(&self, name: &str) -> GroupManager {
        GroupManager::new(
            Arc::clone(&self.store),
            Arc::clone(&self.events),
            name,
            self.group_config(name),
        )
    }

    fn group_config(&self, name: &str) -> GroupConfig {
        if let Some(queue) = name.strip_prefix("queue:") {
            let weight = self
                .config
                .queues
                .iter()
                .find(|q| q.name == queue)
                .map(|q| q.priority.max(1))
                .unwrap_or(1);
            GroupConfig {
                concurrency_cap: self.config.concurrency.max(1),
                weight,
            }
        } else {
            GroupConfig {
                concurrency_cap: self.config.group_concurrency_cap,
                weight: self.config.group_weights.get(name).copied().unwrap_or(1),
            }
        }
    }

    /// Submit one task. Returns its id, or [`QueueError::DuplicateId`]
    /// when a supplied id already exists.
    pub async fn enqueue(&self, request: SubmitRequest) -> Result<TaskId, QueueError> {
        let now = Utc::now();
        let id = request
            .options
            .id
            .clone()
            .unwrap_or_else(TaskId::generate);
        let mut options = request.options;
        options.id = Some(id.clone());
        let record = TaskRecord::new(id.clone(), request.method, request.payload, options, now);
        let group_name = record.effective_group();
        let span = telemetry::task_submit_span(id.as_str(), &group_name);

        async {
            self.registry.insert(&record).await?;
            self.group(&group_name).add_task(&record).await?;
            let mut added = TaskEvent::new(EventKind::TaskAdded, id.clone())
                .with_group(group_name.clone())
                .with_state(record.state);
            added.data = Some(serde_json::json!({ "queue": record.queue }));
            self.events.publish(added).await;
            Ok(id.clone())
        }
        .instrument(span)
        .await
    }

    /// Submit several tasks, returning their ids in submission order.
    pub async fn enqueue_batch(
        &self,
        requests: Vec<SubmitRequest>,
    ) -> Result<Vec<TaskId>, QueueError> {
        let mut ids = Vec::with_capacity(requests.len());
        for request in requests {
            ids.push(self.enqueue(request).await?);
        }
        Ok(ids)
    }

    /// Fetch a task record for observation.
    pub async fn task(&self, id: &TaskId) -> Result<Option<TaskRecord>, QueueError> {
        self.registry.get(id).await
    }

    /// Pause every pending task in a group. Active tasks are untouched.
    pub async fn pause_group(&self, name: &str) -> Result<u64, QueueError> {
        self.group(name).pause_all().await
    }

    /// Resume a paused group.
    pub async fn resume_group(&self, name: &str) -> Result<u64, QueueError> {
        self.group(name).resume_all().await
    }

    /// Cached counters for a group.
    pub async fn group_stats(&self, name: &str) -> Result<GroupStats, QueueError> {
        self.group(name).get_stats().await
    }

    /// Stats for every group known to this deployment.
    pub async fn snapshot(&self) -> Result<QueueSnapshot, QueueError> {
        let mut groups = HashMap::new();
        for name in self.store.smembers(GROUPS_KEY).await? {
            let stats = self.group(&name).get_stats().await?;
            groups.insert(name, stats);
        }
        Ok(QueueSnapshot {
            sampled_at: Utc::now(),
            groups,
        })
    }

    /// Cancel a task. An active task is signalled and finalizes as a
    /// non-retrying failure; a pending task is dropped from its group's
    /// order index. Returns whether anything was cancelled.
    pub async fn cancel_task(&self, id: &TaskId) -> Result<bool, QueueError> {
        if let Some(token) = self.inflight.lock().await.get(id) {
            token.cancel();
            return Ok(true);
        }
        let Some(mut record) = self.registry.get(id).await? else {
            return Ok(false);
        };
        if record.state.is_terminal() || record.state == TaskState::Active {
            return Ok(false);
        }
        let group_name = record.effective_group();
        let discarded = self.group(&group_name).discard_pending(id).await?;
        if discarded {
            record.state = TaskState::Failed;
            record.last_error = Some("cancelled".to_string());
            record.updated_at = Utc::now();
            self.registry.update(&record).await?;
        }
        Ok(discarded)
    }

    /// Validate configuration, recover tasks orphaned by crashed workers,
    /// and spawn the per-queue worker pools. Call on a cloned handle:
    /// `engine.clone().start().await`.
    pub async fn start(self: Arc<Self>) -> anyhow::Result<()> {
        self.config.validate()?;

        for name in self.store.smembers(GROUPS_KEY).await? {
            let recovered = self.group(&name).recover_orphans().await?;
            if recovered > 0 {
                tracing::info!(group = %name, recovered, "recovered orphaned tasks");
            }
        }

        let mut handles = self.worker_handles.lock().await;
        for queue in &self.config.queues {
            for slot in 0..self.config.concurrency {
                let slot_id = format!("{}-w{}", queue.name, slot);
                let queue_name = queue.name.clone();
                let engine = Arc::clone(&self);
                handles.push(tokio::spawn(async move {
                    engine.worker_loop(queue_name, slot_id).await;
                }));
            }
        }
        tracing::info!(
            queues = self.config.queues.len(),
            slots_per_queue = self.config.concurrency,
            policy = self.config.policy.as_str(),
            "engine started"
        );
        Ok(())
    }

    /// Gracefully shut down: stop claiming, drain in-flight work up to the
    /// configured window, then cancel whatever is still running so the
    /// workers requeue it as waiting and exit. At-least-once semantics are
    /// preserved either way.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        tracing::info!("initiating graceful engine shutdown");
        self.shutdown.cancel();

        let handles = {
            let mut guard = self.worker_handles.lock().await;
            std::mem::take(&mut *guard)
        };
        let mut drain = futures::future::join_all(handles);
        let window = Duration::from_millis(self.config.shutdown_timeout_ms);

        tokio::select! {
            results = &mut drain => {
                for result in results {
                    if let Err(err) = result {
                        tracing::warn!("worker task failed during shutdown: {err:?}");
                    }
                }
            }
            _ = tokio::time::sleep(window) => {
                tracing::warn!("drain window elapsed, cancelling in-flight tasks");
                let tokens: Vec<CancelToken> =
                    self.inflight.lock().await.values().cloned().collect();
                for token in tokens {
                    token.cancel();
                }
                if tokio::time::timeout(FORCED_DRAIN_GRACE, &mut drain).await.is_err() {
                    tracing::error!("workers did not exit within the forced-drain grace");
                }
            }
        }

        tracing::info!("engine shutdown complete");
        Ok(())
    }

    async fn worker_loop(self: Arc<Self>, queue: String, slot_id: String) {
        loop {
            if self.shutdown.is_cancelled() {
                tracing::info!(slot = %slot_id, "worker shutting down");
                break;
            }
            match self.poll_once(&queue, &slot_id).await {
                Ok(true) => {}
                Ok(false) => self.idle_sleep().await,
                Err(err) => {
                    tracing::warn!(slot = %slot_id, "worker poll error: {err}");
                    self.idle_sleep().await;
                }
            }
        }
    }

    async fn idle_sleep(&self) {
        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            _ = tokio::time::sleep(Duration::from_millis(self.config.polling_interval_ms)) => {}
        }
    }

    /// One pass of the slot loop: snapshot groups whose due head targets
    /// this queue, let the scheduler pick one, claim, execute, finalize.
    /// Returns whether a task was executed.
    async fn poll_once(&self, queue: &str, slot_id: &str) -> Result<bool, QueueError> {
        if self.shutdown.is_cancelled() {
            return Ok(false);
        }
        let now_ms = self.store.server_time_ms().await?;
        let mut names = self.store.smembers(GROUPS_KEY).await?;
        names.sort();
        let mut views = Vec::with_capacity(names.len());
        for name in names {
            let view = self.group(&name).view(now_ms).await?;
            if view.head_queue.as_deref() == Some(queue) {
                views.push(view);
            }
        }

        let Some(group_name) = self.scheduler.select(&views).await else {
            return Ok(false);
        };
        let group = self.group(&group_name);
        let claimed = {
            let span = telemetry::task_claim_span(&group_name, slot_id);
            group.claim_next().instrument(span).await?
        };
        let Some((task_id, _queue)) = claimed else {
            return Ok(false);
        };
        self.execute_claimed(&group, task_id).await?;
        Ok(true)
    }

    async fn execute_claimed(
        &self,
        group: &GroupManager,
        task_id: TaskId,
    ) -> Result<(), QueueError> {
        let Some(mut record) = self.registry.get(&task_id).await? else {
            tracing::error!(task = %task_id, "claimed task has no registry record");
            group
                .complete_task(&task_id, TaskState::Failed, Some("task record missing".into()))
                .await?;
            return Ok(());
        };

        let attempt = record.attempts + 1;
        record.state = TaskState::Active;
        record.updated_at = Utc::now();
        self.registry.update(&record).await?;

        let cancel = CancelToken::new();
        self.inflight
            .lock()
            .await
            .insert(task_id.clone(), cancel.clone());

        let outcome = self.run_handler(&record, attempt, &cancel).await;
        self.inflight.lock().await.remove(&task_id);
        self.finalize(group, record, attempt, outcome).await
    }

    async fn run_handler(
        &self,
        record: &TaskRecord,
        attempt: u32,
        cancel: &CancelToken,
    ) -> ExecOutcome {
        let Some(handler) = self.handlers.resolve(&record.method).await else {
            return ExecOutcome::Failure(format!(
                "no handler registered for method {}",
                record.method
            ));
        };
        let ctx = TaskContext::new(
            record.id.clone(),
            Some(record.effective_group()),
            attempt,
            cancel.clone(),
            Arc::clone(&self.events),
        );
        let span = telemetry::task_dispatch_span(record.id.as_str(), &record.method, attempt);

        let guarded = async {
            tokio::select! {
                status = handler.handle(&record.payload, &ctx) => match status {
                    ExecutionStatus::Success => ExecOutcome::Success,
                    ExecutionStatus::Failure { error } => ExecOutcome::Failure(error),
                },
                _ = cancel.cancelled() => ExecOutcome::Cancelled,
            }
        }
        .instrument(span);

        match record.options.timeout_ms {
            Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), guarded).await {
                Ok(outcome) => outcome,
                Err(_) => ExecOutcome::TimedOut(ms),
            },
            None => guarded.await,
        }
    }

    async fn finalize(
        &self,
        group: &GroupManager,
        mut record: TaskRecord,
        attempt: u32,
        outcome: ExecOutcome,
    ) -> Result<(), QueueError> {
        let task_id = record.id.clone();
        let span = telemetry::task_finalize_span(
            task_id.as_str(),
            match &outcome {
                ExecOutcome::Success => "success",
                ExecOutcome::Failure(_) => "failure",
                ExecOutcome::TimedOut(_) => "timeout",
                ExecOutcome::Cancelled => "cancelled",
            },
        );

        async {
            match outcome {
                ExecOutcome::Success => {
                    record.attempts = attempt;
                    record.state = TaskState::Completed;
                    record.last_error = None;
                    record.updated_at = Utc::now();
                    group
                        .complete_task(&task_id, TaskState::Completed, None)
                        .await?;
                    self.registry.update(&record).await?;
                    Ok(())
                }
                ExecOutcome::Cancelled if self.shutdown.is_cancelled() => {
                    // Shutdown drain: the interrupted execution does not
                    // count against the retry budget; another worker picks
                    // the task up.
                    record.state = TaskState::Waiting;
                    record.updated_at = Utc::now();
                    group.requeue_task(&task_id, 0).await?;
                    self.registry.update(&record).await?;
                    Ok(())
                }
                ExecOutcome::Cancelled => {
                    record.attempts = attempt;
                    record.state = TaskState::Failed;
                    record.last_error = Some("cancelled".to_string());
                    record.updated_at = Utc::now();
                    group
                        .complete_task(&task_id, TaskState::Failed, Some("cancelled".into()))
                        .await?;
                    self.registry.update(&record).await?;
                    Ok(())
                }
                ExecOutcome::Failure(error) => {
                    self.record_failure(group, record, attempt, error, false)
                        .await
                }
                ExecOutcome::TimedOut(ms) => {
                    self.record_failure(
                        group,
                        record,
                        attempt,
                        format!("timed out after {ms} ms"),
                        true,
                    )
                    .await
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Apply retry accounting for a failed or timed-out execution: requeue
    /// with backoff while the retry budget lasts, finalize as failed when
    /// it is exhausted.
    async fn record_failure(
        &self,
        group: &GroupManager,
        mut record: TaskRecord,
        attempt: u32,
        error: String,
        timed_out: bool,
    ) -> Result<(), QueueError> {
        let task_id = record.id.clone();
        record.attempts = attempt;
        record.last_error = Some(error.clone());
        record.updated_at = Utc::now();

        if is_final_attempt(attempt, record.options.max_retries) {
            record.state = TaskState::Failed;
            group
                .complete_task(&task_id, TaskState::Failed, Some(error))
                .await?;
            self.registry.update(&record).await?;
        } else {
            let delay = compute_retry_delay(
                attempt,
                record.options.retry_delay_ms,
                self.config.max_backoff_ms,
            );
            let delay_ms = delay.as_millis() as u64;
            record.state = if delay_ms > 0 {
                TaskState::Delayed
            } else {
                TaskState::Waiting
            };
            group.requeue_task(&task_id, delay_ms).await?;
            self.registry.update(&record).await?;
            self.events
                .publish(
                    TaskEvent::new(EventKind::RetryAttempt, task_id)
                        .with_group(group.name().to_string())
                        .with_data(serde_json::json!({
                            "attempt": attempt,
                            "delay_ms": delay_ms,
                            "error": error,
                            "timed_out": timed_out,
                        })),
                )
                .await;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let worker_count = self
            .worker_handles
            .try_lock()
            .map(|handles| handles.len())
            .unwrap_or_default();
        f.debug_struct("Engine")
            .field("policy", &self.config.policy)
            .field("queues", &self.config.queues.len())
            .field("workers", &worker_count)
            .field("shutdown", &self.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}
