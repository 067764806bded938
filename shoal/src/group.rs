//! Group manager: the passive owner of per-group indices in the store.
//!
//! Each group keeps a membership set, an arrival-ordered index, a set of
//! tasks currently executing, a per-task state map, and cached aggregate
//! counters, under the keyspace `group:{name}:*`. All mutation goes through
//! the atomic primitives here; the claim primitive in particular hands out
//! each task to exactly one caller under concurrent claimers, using the
//! store's optimistic transactions.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::QueueError;
use crate::events::{EventBus, EventKind, TaskEvent};
use crate::retry::{claim_backoff, CLAIM_ATTEMPTS};
use crate::scheduler::GroupView;
use crate::store::{Store, StoreOp, TxCondition, TxOutcome};
use crate::task::{TaskId, TaskOptions, TaskRecord, TaskState};

/// Global set of group names known to this deployment.
pub const GROUPS_KEY: &str = "groups";

/// Tuning for one group.
#[derive(Clone, Copy, Debug)]
pub struct GroupConfig {
    /// Maximum number of tasks this group may have executing at once.
    pub concurrency_cap: usize,
    /// Weight used by the priority dispatch policy.
    pub weight: u32,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            concurrency_cap: 1,
            weight: 1,
        }
    }
}

/// Cached aggregate counters for a group.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct GroupStats {
    pub total: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub paused: u64,
}

/// Point-in-time stats across every known group, for dashboards and
/// diagnostics.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueSnapshot {
    /// When the snapshot was taken.
    pub sampled_at: chrono::DateTime<chrono::Utc>,
    /// Per-group counters, keyed by group name.
    pub groups: HashMap<String, GroupStats>,
}

impl QueueSnapshot {
    /// Tasks known across all groups.
    pub fn total_tasks(&self) -> u64 {
        self.groups.values().map(|s| s.total).sum()
    }

    /// Tasks executing right now across all groups.
    pub fn total_active(&self) -> u64 {
        self.groups.values().map(|s| s.active).sum()
    }
}

/// Arrival score: server time in milliseconds plus a sub-millisecond
/// fraction from the adapter's monotonic counter, so that concurrent
/// submissions within one millisecond keep a deterministic order. Steps of
/// 1/1024 ms stay representable in an f64 at current epoch magnitudes; the
/// fraction never reaches one half.
fn arrival_score(now_ms: i64, sequence: u64) -> f64 {
    now_ms as f64 + (sequence & 0x1ff) as f64 / 1024.0
}

/// Highest score considered due at `now_ms`. Sits halfway into the current
/// millisecond: above every arrival fraction, below every future score.
fn due_limit(now_ms: i64) -> f64 {
    now_ms as f64 + 0.5
}

/// Cached-stats field a state contributes to, if any. Waiting and delayed
/// tasks count only toward `total`.
fn stats_counter(state: TaskState) -> Option<&'static str> {
    match state {
        TaskState::Active => Some("active"),
        TaskState::Completed => Some("completed"),
        TaskState::Failed => Some("failed"),
        TaskState::Paused => Some("paused"),
        _ => None,
    }
}

pub struct GroupManager {
    store: Arc<dyn Store>,
    events: Arc<EventBus>,
    name: String,
    config: GroupConfig,
}

impl GroupManager {
    pub fn new(
        store: Arc<dyn Store>,
        events: Arc<EventBus>,
        name: impl Into<String>,
        config: GroupConfig,
    ) -> Self {
        Self {
            store,
            events,
            name: name.into(),
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> GroupConfig {
        self.config
    }

    fn key(&self, suffix: &str) -> String {
        format!("group:{}:{suffix}", self.name)
    }

    fn membership_key(&self) -> String {
        self.key("tasks")
    }

    fn order_key(&self) -> String {
        self.key("order")
    }

    fn processing_key(&self) -> String {
        self.key("processing")
    }

    fn state_key(&self) -> String {
        self.key("state")
    }

    fn options_key(&self) -> String {
        self.key("options")
    }

    fn data_key(&self) -> String {
        self.key("data")
    }

    fn method_key(&self) -> String {
        self.key("method")
    }

    fn stats_key(&self) -> String {
        self.key("stats")
    }

    /// Index a task into this group. Idempotent: adding an id that is
    /// already a member leaves membership and order untouched.
    pub async fn add_task(&self, record: &TaskRecord) -> Result<(), QueueError> {
        let id = record.id.as_str();
        if self.store.sismember(&self.membership_key(), id).await? {
            return Ok(());
        }

        let now_ms = self.store.server_time_ms().await?;
        let due_ms = record
            .options
            .not_before
            .map(|when| when.timestamp_millis())
            .filter(|ms| *ms > now_ms)
            .unwrap_or(now_ms);
        let score = arrival_score(due_ms, self.store.next_sequence());

        let ops = vec![
            StoreOp::SAdd {
                key: GROUPS_KEY.to_string(),
                member: self.name.clone(),
            },
            StoreOp::SAdd {
                key: self.membership_key(),
                member: id.to_string(),
            },
            StoreOp::ZAdd {
                key: self.order_key(),
                member: id.to_string(),
                score,
            },
            StoreOp::HSet {
                key: self.state_key(),
                field: id.to_string(),
                value: record.state.as_str().to_string(),
            },
            StoreOp::HSet {
                key: self.options_key(),
                field: id.to_string(),
                value: serde_json::to_string(&record.options)?,
            },
            StoreOp::HSet {
                key: self.data_key(),
                field: id.to_string(),
                value: serde_json::to_string(&record.payload)?,
            },
            StoreOp::HSet {
                key: self.method_key(),
                field: id.to_string(),
                value: record.method.clone(),
            },
            StoreOp::HIncrBy {
                key: self.stats_key(),
                field: "total".to_string(),
                delta: 1,
            },
        ];
        self.store.atomic(ops).await?;

        self.events
            .publish(
                TaskEvent::new(EventKind::GroupChange, record.id.clone())
                    .with_group(self.name.clone())
                    .with_data(serde_json::json!({ "op": "add" })),
            )
            .await;
        self.events
            .publish(TaskEvent::status_change(
                record.id.clone(),
                Some(self.name.clone()),
                record.state,
            ))
            .await;
        Ok(())
    }

    /// Claim the next due task, atomically moving it from `order` to
    /// `processing` and marking it active.
    ///
    /// Under concurrent callers each id is handed to exactly one claimer:
    /// the head identity and the concurrency cap are both re-checked inside
    /// the optimistic transaction, so a raced claim aborts and retries with
    /// exponential backoff (three attempts, then `None` — the caller
    /// re-polls).
    ///
    /// Returns the claimed task's id and target queue.
    pub async fn claim_next(&self) -> Result<Option<(TaskId, String)>, QueueError> {
        for attempt in 0..CLAIM_ATTEMPTS {
            let now_ms = self.store.server_time_ms().await?;
            let Some((member, score)) = self.store.zhead(&self.order_key()).await? else {
                return Ok(None);
            };
            if score > due_limit(now_ms) {
                // Head not yet due; the group presents as empty.
                return Ok(None);
            }
            let state = self
                .store
                .hget(&self.state_key(), &member)
                .await?
                .map(|s| TaskState::from_wire(&s))
                .unwrap_or(TaskState::Unknown);
            if !state.is_claimable() {
                return Ok(None);
            }
            if self.store.scard(&self.processing_key()).await? >= self.config.concurrency_cap {
                return Ok(None);
            }
            let queue = match self.store.hget(&self.options_key(), &member).await? {
                Some(encoded) => serde_json::from_str::<TaskOptions>(&encoded)?.queue,
                None => {
                    tracing::warn!(group = %self.name, task = %member, "head has no options entry");
                    return Ok(None);
                }
            };

            let outcome = self
                .store
                .run_optimistic(
                    &[self.order_key(), self.processing_key()],
                    &[
                        TxCondition::ZsetHeadIs {
                            key: self.order_key(),
                            member: member.clone(),
                            max_score: due_limit(now_ms),
                        },
                        TxCondition::SetCardBelow {
                            key: self.processing_key(),
                            bound: self.config.concurrency_cap,
                        },
                    ],
                    vec![
                        StoreOp::ZRem {
                            key: self.order_key(),
                            member: member.clone(),
                        },
                        StoreOp::SAdd {
                            key: self.processing_key(),
                            member: member.clone(),
                        },
                        StoreOp::HSet {
                            key: self.state_key(),
                            field: member.clone(),
                            value: TaskState::Active.as_str().to_string(),
                        },
                        StoreOp::HIncrBy {
                            key: self.stats_key(),
                            field: "active".to_string(),
                            delta: 1,
                        },
                    ],
                )
                .await?;

            match outcome {
                TxOutcome::Committed => {
                    let id = TaskId::new(member);
                    self.events
                        .publish(TaskEvent::status_change(
                            id.clone(),
                            Some(self.name.clone()),
                            TaskState::Active,
                        ))
                        .await;
                    return Ok(Some((id, queue)));
                }
                TxOutcome::ConditionFailed | TxOutcome::Conflict => {
                    tracing::trace!(
                        group = %self.name,
                        attempt,
                        ?outcome,
                        "claim raced, backing off"
                    );
                    tokio::time::sleep(claim_backoff(attempt)).await;
                }
            }
        }
        Ok(None)
    }

    /// Finalize an executing task. `outcome` must be a terminal state. The
    /// id leaves `processing` and is never re-inserted into `order`.
    pub async fn complete_task(
        &self,
        id: &TaskId,
        outcome: TaskState,
        error: Option<String>,
    ) -> Result<(), QueueError> {
        debug_assert!(outcome.is_terminal());
        let counter = match outcome {
            TaskState::Completed => "completed",
            _ => "failed",
        };
        let ops = vec![
            StoreOp::SRem {
                key: self.processing_key(),
                member: id.to_string(),
            },
            StoreOp::HSet {
                key: self.state_key(),
                field: id.to_string(),
                value: outcome.as_str().to_string(),
            },
            StoreOp::HDel {
                key: self.options_key(),
                field: id.to_string(),
            },
            StoreOp::HDel {
                key: self.data_key(),
                field: id.to_string(),
            },
            StoreOp::HDel {
                key: self.method_key(),
                field: id.to_string(),
            },
            StoreOp::HIncrBy {
                key: self.stats_key(),
                field: "active".to_string(),
                delta: -1,
            },
            StoreOp::HIncrBy {
                key: self.stats_key(),
                field: counter.to_string(),
                delta: 1,
            },
        ];
        self.store.atomic(ops).await?;

        self.events
            .publish(TaskEvent::status_change(
                id.clone(),
                Some(self.name.clone()),
                outcome,
            ))
            .await;
        let kind = match outcome {
            TaskState::Completed => EventKind::TaskCompleted,
            _ => EventKind::TaskFailed,
        };
        let mut terminal = TaskEvent::new(kind, id.clone())
            .with_group(self.name.clone())
            .with_state(outcome);
        if let Some(error) = error {
            terminal = terminal.with_data(serde_json::json!({ "error": error }));
        }
        self.events.publish(terminal).await;
        Ok(())
    }

    /// Return an executing task to the order index, optionally delayed.
    /// Used by the retry machine and by shutdown draining.
    pub async fn requeue_task(&self, id: &TaskId, delay_ms: u64) -> Result<(), QueueError> {
        let now_ms = self.store.server_time_ms().await?;
        let score = arrival_score(now_ms + delay_ms as i64, self.store.next_sequence());
        let state = if delay_ms > 0 {
            TaskState::Delayed
        } else {
            TaskState::Waiting
        };
        let ops = vec![
            StoreOp::SRem {
                key: self.processing_key(),
                member: id.to_string(),
            },
            StoreOp::ZAdd {
                key: self.order_key(),
                member: id.to_string(),
                score,
            },
            StoreOp::HSet {
                key: self.state_key(),
                field: id.to_string(),
                value: state.as_str().to_string(),
            },
            StoreOp::HIncrBy {
                key: self.stats_key(),
                field: "active".to_string(),
                delta: -1,
            },
        ];
        self.store.atomic(ops).await?;

        self.events
            .publish(TaskEvent::status_change(
                id.clone(),
                Some(self.name.clone()),
                state,
            ))
            .await;
        Ok(())
    }

    /// Drop a pending (non-active, non-terminal) task from the order index
    /// and mark it failed. Used by admin cancellation. Returns whether the
    /// task was pending here.
    pub async fn discard_pending(&self, id: &TaskId) -> Result<bool, QueueError> {
        if self
            .store
            .zscore(&self.order_key(), id.as_str())
            .await?
            .is_none()
        {
            return Ok(false);
        }
        let ops = vec![
            StoreOp::ZRem {
                key: self.order_key(),
                member: id.to_string(),
            },
            StoreOp::HSet {
                key: self.state_key(),
                field: id.to_string(),
                value: TaskState::Failed.as_str().to_string(),
            },
            StoreOp::HDel {
                key: self.options_key(),
                field: id.to_string(),
            },
            StoreOp::HDel {
                key: self.data_key(),
                field: id.to_string(),
            },
            StoreOp::HDel {
                key: self.method_key(),
                field: id.to_string(),
            },
            StoreOp::HIncrBy {
                key: self.stats_key(),
                field: "failed".to_string(),
                delta: 1,
            },
        ];
        self.store.atomic(ops).await?;

        self.events
            .publish(TaskEvent::status_change(
                id.clone(),
                Some(self.name.clone()),
                TaskState::Failed,
            ))
            .await;
        self.events
            .publish(
                TaskEvent::new(EventKind::TaskFailed, id.clone())
                    .with_group(self.name.clone())
                    .with_state(TaskState::Failed)
                    .with_data(serde_json::json!({ "cancelled": true })),
            )
            .await;
        Ok(true)
    }

    /// Pause every waiting or delayed task. Active tasks are untouched and
    /// complete normally; the order index keeps its scores.
    pub async fn pause_all(&self) -> Result<u64, QueueError> {
        self.flip_states(&[TaskState::Waiting, TaskState::Delayed], |_| {
            TaskState::Paused
        })
        .await
    }

    /// Resume every paused task, restoring `Delayed` for entries whose
    /// order score is still in the future and `Waiting` otherwise.
    pub async fn resume_all(&self) -> Result<u64, QueueError> {
        let now_ms = self.store.server_time_ms().await?;
        let order_key = self.order_key();
        let mut due = HashMap::new();
        for (id, state) in self.store.hgetall(&self.state_key()).await? {
            if TaskState::from_wire(&state) == TaskState::Paused {
                let score = self.store.zscore(&order_key, &id).await?;
                due.insert(id, score.map(|s| s <= due_limit(now_ms)).unwrap_or(true));
            }
        }
        self.flip_states(&[TaskState::Paused], |id| {
            if due.get(id).copied().unwrap_or(true) {
                TaskState::Waiting
            } else {
                TaskState::Delayed
            }
        })
        .await
    }

    async fn flip_states(
        &self,
        from: &[TaskState],
        to: impl Fn(&str) -> TaskState,
    ) -> Result<u64, QueueError> {
        let entries = self.store.hgetall(&self.state_key()).await?;
        let mut ops = Vec::new();
        let mut transitions = Vec::new();
        let mut counter_deltas: HashMap<&'static str, i64> = HashMap::new();
        for (id, state) in entries {
            let current = TaskState::from_wire(&state);
            if !from.contains(&current) {
                continue;
            }
            let next = to(&id);
            ops.push(StoreOp::HSet {
                key: self.state_key(),
                field: id.clone(),
                value: next.as_str().to_string(),
            });
            if let Some(field) = stats_counter(current) {
                *counter_deltas.entry(field).or_insert(0) -= 1;
            }
            if let Some(field) = stats_counter(next) {
                *counter_deltas.entry(field).or_insert(0) += 1;
            }
            transitions.push((id, next));
        }
        if ops.is_empty() {
            return Ok(0);
        }
        for (field, delta) in counter_deltas {
            if delta != 0 {
                ops.push(StoreOp::HIncrBy {
                    key: self.stats_key(),
                    field: field.to_string(),
                    delta,
                });
            }
        }
        let count = transitions.len() as u64;
        self.store.atomic(ops).await?;
        for (id, next) in transitions {
            self.events
                .publish(TaskEvent::status_change(
                    TaskId::new(id),
                    Some(self.name.clone()),
                    next,
                ))
                .await;
        }
        self.events
            .publish(
                TaskEvent::new(EventKind::GroupChange, TaskId::new("*"))
                    .with_group(self.name.clone())
                    .with_data(serde_json::json!({ "op": "bulk_state_change" })),
            )
            .await;
        Ok(count)
    }

    /// Read the cached counters, recomputing them from the state map when
    /// the cache is cold.
    pub async fn get_stats(&self) -> Result<GroupStats, QueueError> {
        let cached = self.store.hgetall(&self.stats_key()).await?;
        if cached.is_empty() {
            return self.refresh_stats().await;
        }
        let field = |name: &str| -> u64 {
            cached
                .get(name)
                .and_then(|v| v.parse::<i64>().ok())
                .map(|v| v.max(0) as u64)
                .unwrap_or(0)
        };
        Ok(GroupStats {
            total: field("total"),
            active: field("active"),
            completed: field("completed"),
            failed: field("failed"),
            paused: field("paused"),
        })
    }

    /// Recompute the counters from the per-task state map and write them
    /// back as the new cache.
    pub async fn refresh_stats(&self) -> Result<GroupStats, QueueError> {
        let states = self.store.hgetall(&self.state_key()).await?;
        let mut stats = GroupStats::default();
        for state in states.values() {
            stats.total += 1;
            match TaskState::from_wire(state) {
                TaskState::Active => stats.active += 1,
                TaskState::Completed => stats.completed += 1,
                TaskState::Failed => stats.failed += 1,
                TaskState::Paused => stats.paused += 1,
                _ => {}
            }
        }
        let ops = [
            ("total", stats.total),
            ("active", stats.active),
            ("completed", stats.completed),
            ("failed", stats.failed),
            ("paused", stats.paused),
        ]
        .into_iter()
        .map(|(field, value)| StoreOp::HSet {
            key: self.stats_key(),
            field: field.to_string(),
            value: value.to_string(),
        })
        .collect();
        self.store.atomic(ops).await?;
        Ok(stats)
    }

    /// Cheap snapshot for the dispatcher: head dueness, in-flight count,
    /// cap and weight, plus the head's target queue.
    pub async fn view(&self, now_ms: i64) -> Result<GroupView, QueueError> {
        let head = self.store.zhead(&self.order_key()).await?;
        let processing = self.store.scard(&self.processing_key()).await?;
        let (head_score, head_due, head_queue) = match head {
            None => (None, false, None),
            Some((member, score)) => {
                let due = score <= due_limit(now_ms);
                let claimable = due
                    && self
                        .store
                        .hget(&self.state_key(), &member)
                        .await?
                        .map(|s| TaskState::from_wire(&s).is_claimable())
                        .unwrap_or(false);
                let queue = if claimable {
                    match self.store.hget(&self.options_key(), &member).await? {
                        Some(encoded) => serde_json::from_str::<TaskOptions>(&encoded)
                            .ok()
                            .map(|o| o.queue),
                        None => None,
                    }
                } else {
                    None
                };
                (Some(score), claimable && queue.is_some(), queue)
            }
        };
        Ok(GroupView {
            name: self.name.clone(),
            head_score,
            head_due,
            head_queue,
            processing,
            cap: self.config.concurrency_cap,
            weight: self.config.weight,
        })
    }

    /// Return every id stranded in `processing` to the order index. Called
    /// on engine startup to recover tasks owned by crashed workers.
    pub async fn recover_orphans(&self) -> Result<u64, QueueError> {
        let orphans = self.store.smembers(&self.processing_key()).await?;
        let count = orphans.len() as u64;
        for id in orphans {
            let id = TaskId::new(id);
            self.requeue_task(&id, 0).await?;
            tracing::info!(group = %self.name, task = %id, "recovered orphaned task");
        }
        Ok(count)
    }
}

impl std::fmt::Debug for GroupManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupManager")
            .field("name", &self.name)
            .field("cap", &self.config.concurrency_cap)
            .field("weight", &self.config.weight)
            .finish()
    }
}
