use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::QueueError;
use crate::store::{PubSubMessage, Store};
use crate::task::{TaskId, TaskState};

/// Lifecycle event kinds. The snake_case names are stable wire identifiers;
/// each kind is published on the store channel `events:{kind}`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    StatusChange,
    TaskAdded,
    TaskCompleted,
    TaskFailed,
    GroupChange,
    ProgressUpdate,
    RetryAttempt,
}

impl EventKind {
    /// All event kinds, in wire order.
    pub const ALL: [EventKind; 7] = [
        EventKind::StatusChange,
        EventKind::TaskAdded,
        EventKind::TaskCompleted,
        EventKind::TaskFailed,
        EventKind::GroupChange,
        EventKind::ProgressUpdate,
        EventKind::RetryAttempt,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::StatusChange => "status_change",
            EventKind::TaskAdded => "task_added",
            EventKind::TaskCompleted => "task_completed",
            EventKind::TaskFailed => "task_failed",
            EventKind::GroupChange => "group_change",
            EventKind::ProgressUpdate => "progress_update",
            EventKind::RetryAttempt => "retry_attempt",
        }
    }

    /// Store pub/sub channel this kind is published on.
    pub fn channel(&self) -> String {
        format!("events:{}", self.as_str())
    }
}

/// A lifecycle event as delivered to observers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskEvent {
    pub kind: EventKind,
    pub task_id: TaskId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<TaskState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl TaskEvent {
    pub fn new(kind: EventKind, task_id: TaskId) -> Self {
        Self {
            kind,
            task_id,
            group: None,
            state: None,
            data: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn with_state(mut self, state: TaskState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Shorthand for a state-transition event.
    pub fn status_change(task_id: TaskId, group: Option<String>, state: TaskState) -> Self {
        let mut event = Self::new(EventKind::StatusChange, task_id).with_state(state);
        event.group = group;
        event
    }
}

/// Fan-out event bus layered over the store's publish/subscribe.
///
/// Every published event goes to the wire channel for its kind and to an
/// in-process broadcast channel for local observers (workers, tests).
/// Delivery is best-effort on both paths: a lagging local subscriber drops
/// old events, and remote subscribers reconcile from the registry when they
/// need exactness.
pub struct EventBus {
    store: Arc<dyn Store>,
    local: broadcast::Sender<TaskEvent>,
    capacity: usize,
}

impl EventBus {
    pub fn new(store: Arc<dyn Store>, capacity: usize) -> Self {
        let (local, _) = broadcast::channel(capacity);
        Self {
            store,
            local,
            capacity,
        }
    }

    /// Publish an event. Local delivery never blocks; a store-side publish
    /// failure is logged and swallowed, since observers must tolerate
    /// missed events anyway.
    pub async fn publish(&self, event: TaskEvent) {
        match serde_json::to_string(&event) {
            Ok(encoded) => {
                if let Err(err) = self.store.publish(&event.kind.channel(), &encoded).await {
                    tracing::warn!(kind = event.kind.as_str(), "event publish failed: {err}");
                }
            }
            Err(err) => {
                tracing::warn!(kind = event.kind.as_str(), "event encode failed: {err}");
            }
        }
        let _ = self.local.send(event);
    }

    /// Subscribe to the in-process stream of all events.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.local.subscribe()
    }

    /// Subscribe to the wire channels of the given kinds (all kinds when
    /// empty), as another process observing this deployment would.
    pub async fn subscribe_remote(
        &self,
        kinds: &[EventKind],
    ) -> Result<broadcast::Receiver<PubSubMessage>, QueueError> {
        let channels: Vec<String> = if kinds.is_empty() {
            EventKind::ALL.iter().map(|k| k.channel()).collect()
        } else {
            kinds.iter().map(|k| k.channel()).collect()
        };
        Ok(self.store.subscribe(&channels).await?)
    }

    pub fn subscriber_count(&self) -> usize {
        self.local.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.local.receiver_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_kind_wire_names_are_stable() {
        let expected = [
            "status_change",
            "task_added",
            "task_completed",
            "task_failed",
            "group_change",
            "progress_update",
            "retry_attempt",
        ];
        for (kind, name) in EventKind::ALL.iter().zip(expected) {
            assert_eq!(kind.as_str(), name);
            assert_eq!(kind.channel(), format!("events:{name}"));
            let json = serde_json::to_string(kind).unwrap();
            assert_eq!(json, format!("\"{name}\""));
        }
    }

    #[test]
    fn event_json_omits_absent_fields() {
        let event = TaskEvent::new(EventKind::TaskAdded, TaskId::new("t-1"));
        let json = serde_json::to_string(&event).unwrap();
        assert!(!json.contains("group"));
        assert!(!json.contains("\"state\""));
        assert!(!json.contains("data"));

        let event = TaskEvent::status_change(
            TaskId::new("t-1"),
            Some("reports".into()),
            TaskState::Active,
        );
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"group\":\"reports\""));
        assert!(json.contains("\"state\":\"active\""));
        let back: TaskEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.state, Some(TaskState::Active));
    }
}
