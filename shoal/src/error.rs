use std::time::Duration;

use thiserror::Error;

use crate::store::StoreError;
use crate::task::TaskId;

/// Errors surfaced by the queue core.
///
/// Store and conflict errors are recovered locally where possible (claim
/// retries, re-polls); handler and timeout errors feed the retry machine
/// and never escape a worker slot. Only `FatalConfig` aborts startup.
#[derive(Debug, Error)]
pub enum QueueError {
    /// A network-level store failure; retryable at the call site.
    #[error("transient store error: {0}")]
    TransientStore(#[from] StoreError),

    /// An optimistic transaction aborted after exhausting its retries.
    #[error("optimistic transaction conflict")]
    Conflict,

    /// A submission reused an existing task id.
    #[error("duplicate task id: {0}")]
    DuplicateId(TaskId),

    /// A handler reported failure; fed into retry accounting.
    #[error("handler failure: {0}")]
    Handler(String),

    /// A handler exceeded its per-attempt timeout.
    #[error("task timed out after {0:?}")]
    Timeout(Duration),

    /// A record or event failed to encode or decode.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The engine configuration is unusable; refuse to start.
    #[error("invalid configuration: {0}")]
    FatalConfig(String),
}
