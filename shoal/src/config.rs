use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::QueueError;
use crate::scheduler::DispatchPolicy;

/// Connection parameters for the shared store.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store connection URL (e.g. `redis://localhost:6379`).
    pub url: String,
    /// Upper bound on connection establishment, in milliseconds.
    pub connect_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            connect_timeout_ms: 5_000,
        }
    }
}

/// One queue this worker process consumes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueConfig {
    pub name: String,
    /// Weight of the queue's synthetic group under the priority policy.
    pub priority: u32,
}

impl QueueConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            priority: 1,
        }
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }
}

/// Engine configuration. An explicit value threaded through construction;
/// nothing here is process-global.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineConfig {
    pub store: StoreConfig,
    /// Queues consumed by this process.
    pub queues: Vec<QueueConfig>,
    /// Worker slots per queue.
    pub concurrency: usize,
    /// Inter-group dispatch policy.
    pub policy: DispatchPolicy,
    /// Idle poll cadence, in milliseconds.
    pub polling_interval_ms: u64,
    /// Graceful drain window on shutdown, in milliseconds.
    pub shutdown_timeout_ms: u64,
    /// Default per-group concurrency cap.
    pub group_concurrency_cap: usize,
    /// Cap applied to exponential retry backoff, in milliseconds.
    pub max_backoff_ms: u64,
    /// Per-group weight overrides for the priority policy.
    #[serde(default)]
    pub group_weights: HashMap<String, u32>,
    /// Buffer size of the in-process event fan-out.
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            queues: vec![QueueConfig::new("default")],
            concurrency: 4,
            policy: DispatchPolicy::default(),
            polling_interval_ms: 250,
            shutdown_timeout_ms: 30_000,
            group_concurrency_cap: 1,
            max_backoff_ms: 30_000,
            group_weights: HashMap::new(),
            event_capacity: 1_024,
        }
    }
}

impl EngineConfig {
    pub fn with_store_url(mut self, url: impl Into<String>) -> Self {
        self.store.url = url.into();
        self
    }

    pub fn with_queues(mut self, queues: Vec<QueueConfig>) -> Self {
        self.queues = queues;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_policy(mut self, policy: DispatchPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_polling_interval_ms(mut self, ms: u64) -> Self {
        self.polling_interval_ms = ms;
        self
    }

    pub fn with_shutdown_timeout_ms(mut self, ms: u64) -> Self {
        self.shutdown_timeout_ms = ms;
        self
    }

    pub fn with_group_concurrency_cap(mut self, cap: usize) -> Self {
        self.group_concurrency_cap = cap;
        self
    }

    pub fn with_group_weight(mut self, group: impl Into<String>, weight: u32) -> Self {
        self.group_weights.insert(group.into(), weight);
        self
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.queues.is_empty() {
            return Err(QueueError::FatalConfig(
                "at least one queue must be configured".into(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for queue in &self.queues {
            if queue.name.is_empty() {
                return Err(QueueError::FatalConfig("queue names must not be empty".into()));
            }
            if !seen.insert(queue.name.as_str()) {
                return Err(QueueError::FatalConfig(format!(
                    "duplicate queue name: {}",
                    queue.name
                )));
            }
        }
        if self.concurrency == 0 {
            return Err(QueueError::FatalConfig(
                "concurrency must be at least 1".into(),
            ));
        }
        if self.group_concurrency_cap == 0 {
            return Err(QueueError::FatalConfig(
                "group_concurrency_cap must be at least 1".into(),
            ));
        }
        if self.polling_interval_ms == 0 {
            return Err(QueueError::FatalConfig(
                "polling_interval_ms must be positive".into(),
            ));
        }
        if self.store.url.is_empty() {
            return Err(QueueError::FatalConfig("store url must not be empty".into()));
        }
        if let Some((group, _)) = self.group_weights.iter().find(|(_, w)| **w == 0) {
            return Err(QueueError::FatalConfig(format!(
                "group weight for {group} must be positive"
            )));
        }
        Ok(())
    }
}
