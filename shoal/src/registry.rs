use std::sync::Arc;

use crate::error::QueueError;
use crate::store::Store;
use crate::task::{TaskId, TaskRecord, TaskState};

/// Key under which a task record is persisted.
pub fn task_key(id: &TaskId) -> String {
    format!("task:{id}")
}

/// Registry of full task records, keyed by `task:{id}`.
///
/// The registry stores records verbatim and never interprets `state`; the
/// group manager and worker runtime own the state machine. Records of
/// terminal tasks are retained here for observation even after the group
/// indices drop them.
#[derive(Clone)]
pub struct TaskRegistry {
    store: Arc<dyn Store>,
}

impl TaskRegistry {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Insert a new record. Fails with [`QueueError::DuplicateId`] when the
    /// id already exists.
    pub async fn insert(&self, record: &TaskRecord) -> Result<(), QueueError> {
        let encoded = serde_json::to_string(record)?;
        let created = self.store.set_nx(&task_key(&record.id), &encoded).await?;
        if !created {
            return Err(QueueError::DuplicateId(record.id.clone()));
        }
        Ok(())
    }

    /// Fetch a record by id alone.
    pub async fn get(&self, id: &TaskId) -> Result<Option<TaskRecord>, QueueError> {
        match self.store.get(&task_key(id)).await? {
            Some(encoded) => Ok(Some(serde_json::from_str(&encoded)?)),
            None => Ok(None),
        }
    }

    /// Replace a record wholesale. Last writer wins; serialization of
    /// writers for a given id is the claim machinery's concern, not the
    /// registry's.
    pub async fn update(&self, record: &TaskRecord) -> Result<(), QueueError> {
        let encoded = serde_json::to_string(record)?;
        self.store.set(&task_key(&record.id), &encoded).await?;
        Ok(())
    }

    /// Enumerate records for a queue, optionally filtered by state.
    ///
    /// Scan-based; intended for dashboards and diagnostics only.
    pub async fn list(
        &self,
        queue: &str,
        state: Option<TaskState>,
    ) -> Result<Vec<TaskRecord>, QueueError> {
        let mut records = Vec::new();
        for key in self.store.scan_keys("task:*").await? {
            let Some(encoded) = self.store.get(&key).await? else {
                continue;
            };
            let record: TaskRecord = match serde_json::from_str(&encoded) {
                Ok(record) => record,
                Err(err) => {
                    tracing::warn!(key = %key, "skipping undecodable task record: {err}");
                    continue;
                }
            };
            if record.queue != queue {
                continue;
            }
            if let Some(wanted) = state {
                if record.state != wanted {
                    continue;
                }
            }
            records.push(record);
        }
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry").finish_non_exhaustive()
    }
}
