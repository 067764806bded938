use std::fmt::Display;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a task.
///
/// Producers may supply their own ids (duplicates are rejected at submit
/// time); ids generated by the engine use UUID v7 for time-ordered
/// uniqueness.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Create a task id from an arbitrary string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh time-ordered task id.
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// Get the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Lifecycle states of a task.
///
/// The lowercase names are part of the wire contract: they are the strings
/// written to the per-group state map and carried in events.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    /// Ready to be claimed by a worker.
    Waiting,
    /// Claimed and currently executing on exactly one worker slot.
    Active,
    /// Finished successfully (terminal).
    Completed,
    /// Failed after exhausting retries, or cancelled (terminal).
    Failed,
    /// Scheduled for a future point in time; not yet claimable.
    Delayed,
    /// Administratively paused; stays indexed but is not claimable.
    Paused,
    /// State could not be determined (e.g. an unrecognized wire string).
    Unknown,
}

impl TaskState {
    /// Wire name of this state.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Waiting => "waiting",
            TaskState::Active => "active",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Delayed => "delayed",
            TaskState::Paused => "paused",
            TaskState::Unknown => "unknown",
        }
    }

    /// Parse a wire name. Unrecognized strings map to [`TaskState::Unknown`]
    /// rather than an error so that readers tolerate foreign writers.
    pub fn from_wire(s: &str) -> Self {
        match s {
            "waiting" => TaskState::Waiting,
            "active" => TaskState::Active,
            "completed" => TaskState::Completed,
            "failed" => TaskState::Failed,
            "delayed" => TaskState::Delayed,
            "paused" => TaskState::Paused,
            _ => TaskState::Unknown,
        }
    }

    /// Whether this state admits no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }

    /// Whether a task in this state may be claimed once its score is due.
    pub fn is_claimable(&self) -> bool {
        matches!(self, TaskState::Waiting | TaskState::Delayed)
    }
}

impl Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(TaskState::from_wire(s))
    }
}

/// Priority levels for task scheduling.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum TaskPriority {
    Low = 0,
    Normal = 1,
    High = 2,
    /// Highest priority.
    Critical = 3,
}

impl Default for TaskPriority {
    fn default() -> Self {
        TaskPriority::Normal
    }
}

/// Options attached to a task at submit time.
///
/// Persisted verbatim in the owning group's options map so that claimers
/// can recover the target queue and retry policy without a registry read.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskOptions {
    /// Custom task id; generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<TaskId>,
    /// Logical queue the task belongs to.
    pub queue: String,
    /// Group for ordering and fairness; ungrouped tasks run under a
    /// synthetic per-queue group.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// Scheduling priority.
    #[serde(default)]
    pub priority: TaskPriority,
    /// Number of retries after the first attempt.
    #[serde(default)]
    pub max_retries: u32,
    /// Base delay for exponential retry backoff, in milliseconds.
    #[serde(default)]
    pub retry_delay_ms: u64,
    /// Earliest point in time the task may run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,
    /// Per-attempt execution timeout, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            id: None,
            queue: "default".to_string(),
            group: None,
            priority: TaskPriority::Normal,
            max_retries: 0,
            retry_delay_ms: 0,
            not_before: None,
            timeout_ms: None,
        }
    }
}

impl TaskOptions {
    /// Set a custom task id.
    pub fn with_id(mut self, id: impl Into<TaskId>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set the target queue.
    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    /// Set the group.
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the retry budget.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the base retry delay in milliseconds.
    pub fn with_retry_delay_ms(mut self, delay_ms: u64) -> Self {
        self.retry_delay_ms = delay_ms;
        self
    }

    /// Defer the task until the given instant.
    pub fn with_not_before(mut self, when: DateTime<Utc>) -> Self {
        self.not_before = Some(when);
        self
    }

    /// Set a per-attempt execution timeout in milliseconds.
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

/// Full task record as persisted under `task:{id}`.
///
/// The JSON form round-trips losslessly, payload bytes included.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub queue: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// Handler name resolved at execution time.
    pub method: String,
    /// Opaque application payload.
    #[serde(default)]
    pub payload: Vec<u8>,
    pub options: TaskOptions,
    pub state: TaskState,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl TaskRecord {
    /// Build a fresh record in its initial state.
    ///
    /// The initial state is `Waiting`, or `Delayed` when `not_before` lies
    /// in the future relative to `now`.
    pub fn new(
        id: TaskId,
        method: impl Into<String>,
        payload: Vec<u8>,
        options: TaskOptions,
        now: DateTime<Utc>,
    ) -> Self {
        let state = match options.not_before {
            Some(when) if when > now => TaskState::Delayed,
            _ => TaskState::Waiting,
        };
        Self {
            id,
            queue: options.queue.clone(),
            group: options.group.clone(),
            method: method.into(),
            payload,
            options,
            state,
            attempts: 0,
            created_at: now,
            updated_at: now,
            last_error: None,
        }
    }

    /// The effective group name: the explicit group, or the synthetic
    /// per-queue group for ungrouped tasks.
    pub fn effective_group(&self) -> String {
        match &self.group {
            Some(g) => g.clone(),
            None => synthetic_group(&self.queue),
        }
    }
}

/// A submission handed to the engine's enqueue API.
#[derive(Clone, Debug)]
pub struct SubmitRequest {
    /// Handler name to invoke.
    pub method: String,
    /// Opaque payload bytes.
    pub payload: Vec<u8>,
    pub options: TaskOptions,
}

impl SubmitRequest {
    pub fn new(method: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            method: method.into(),
            payload,
            options: TaskOptions::default(),
        }
    }

    pub fn with_options(mut self, options: TaskOptions) -> Self {
        self.options = options;
        self
    }
}

/// Name of the synthetic group that carries ungrouped tasks of a queue.
///
/// Using one code path for grouped and ungrouped work keeps the claim
/// primitive uniform; the synthetic group's cap equals the queue's worker
/// concurrency.
pub fn synthetic_group(queue: &str) -> String {
    format!("queue:{queue}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_wire_names_round_trip() {
        let states = [
            TaskState::Waiting,
            TaskState::Active,
            TaskState::Completed,
            TaskState::Failed,
            TaskState::Delayed,
            TaskState::Paused,
            TaskState::Unknown,
        ];
        for state in states {
            assert_eq!(TaskState::from_wire(state.as_str()), state);
            let json = serde_json::to_string(&state).unwrap();
            assert_eq!(json, format!("\"{}\"", state.as_str()));
            let back: TaskState = serde_json::from_str(&json).unwrap();
            assert_eq!(back, state);
        }
    }

    #[test]
    fn unrecognized_state_parses_to_unknown() {
        assert_eq!(TaskState::from_wire("exploded"), TaskState::Unknown);
        assert_eq!("exploded".parse::<TaskState>().unwrap(), TaskState::Unknown);
    }

    #[test]
    fn terminal_and_claimable_classification() {
        assert!(TaskState::Completed.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(!TaskState::Active.is_terminal());
        assert!(TaskState::Waiting.is_claimable());
        assert!(TaskState::Delayed.is_claimable());
        assert!(!TaskState::Paused.is_claimable());
        assert!(!TaskState::Active.is_claimable());
    }

    #[test]
    fn record_initial_state_honors_not_before() {
        let now = Utc::now();
        let due_later = TaskOptions::default().with_not_before(now + chrono::Duration::seconds(60));
        let record = TaskRecord::new(TaskId::generate(), "noop", vec![], due_later, now);
        assert_eq!(record.state, TaskState::Delayed);

        let due_now = TaskOptions::default();
        let record = TaskRecord::new(TaskId::generate(), "noop", vec![], due_now, now);
        assert_eq!(record.state, TaskState::Waiting);
        assert_eq!(record.attempts, 0);
    }

    #[test]
    fn record_json_round_trips_payload() {
        let now = Utc::now();
        let options = TaskOptions::default()
            .with_group("reports")
            .with_priority(TaskPriority::Critical)
            .with_max_retries(3);
        let record = TaskRecord::new(
            TaskId::new("t-1"),
            "render",
            vec![0, 159, 146, 150],
            options,
            now,
        );
        let json = serde_json::to_string(&record).unwrap();
        let back: TaskRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, record.id);
        assert_eq!(back.payload, record.payload);
        assert_eq!(back.options.priority, TaskPriority::Critical);
        assert_eq!(back.effective_group(), "reports");
    }

    #[test]
    fn ungrouped_task_gets_synthetic_group() {
        let now = Utc::now();
        let record = TaskRecord::new(
            TaskId::new("t-2"),
            "noop",
            vec![],
            TaskOptions::default().with_queue("mail"),
            now,
        );
        assert_eq!(record.effective_group(), "queue:mail");
    }
}
