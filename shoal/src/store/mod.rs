//! Store adapter: a thin abstraction over the shared key/value data store.
//!
//! The trait covers exactly the primitives the queue core needs — string,
//! hash, set and sorted-set CRUD, unconditional atomic batches, optimistic
//! (watch/check/commit) transactions, publish/subscribe, and an
//! authoritative server clock. The adapter is stateless beyond its
//! connections; any network-level error surfaces to the caller, who decides
//! whether to retry.

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

mod redis;

pub use self::redis::RedisStore;

/// Errors raised by a store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Failed to establish a connection.
    #[error("store connection failed: {0}")]
    ConnectionFailed(String),

    /// A command failed at the network or protocol level.
    #[error("store operation failed: {0}")]
    Operation(String),

    /// A stored value failed to decode.
    #[error("store serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<::redis::RedisError> for StoreError {
    fn from(err: ::redis::RedisError) -> Self {
        StoreError::Operation(err.to_string())
    }
}

/// A single mutation inside an atomic batch.
///
/// Batches are applied all-or-nothing: the Redis backend queues them in a
/// `MULTI`/`EXEC` pipeline, the in-memory test backend applies them under
/// one lock.
#[derive(Clone, Debug)]
pub enum StoreOp {
    Set { key: String, value: String },
    Del { key: String },
    HSet { key: String, field: String, value: String },
    HDel { key: String, field: String },
    HIncrBy { key: String, field: String, delta: i64 },
    SAdd { key: String, member: String },
    SRem { key: String, member: String },
    ZAdd { key: String, member: String, score: f64 },
    ZRem { key: String, member: String },
}

/// A precondition re-checked inside an optimistic transaction, after the
/// watch is in place and before the batch commits.
#[derive(Clone, Debug)]
pub enum TxCondition {
    /// The sorted set's lowest-score member must be `member` with a score
    /// no greater than `max_score`.
    ZsetHeadIs {
        key: String,
        member: String,
        max_score: f64,
    },
    /// The set's cardinality must be strictly below `bound`.
    SetCardBelow { key: String, bound: usize },
}

/// Result of an optimistic transaction attempt.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TxOutcome {
    /// All conditions held and the batch committed.
    Committed,
    /// A condition no longer held; the batch was not attempted.
    ConditionFailed,
    /// A watched key changed between the watch and the commit.
    Conflict,
}

/// A message delivered from a pub/sub channel.
#[derive(Clone, Debug)]
pub struct PubSubMessage {
    pub channel: String,
    pub payload: String,
}

/// Backend-agnostic store operations.
///
/// Implemented by [`RedisStore`] for production and by the testkit's
/// in-memory store for tests and examples.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    /// Set only if the key does not exist; returns whether the write won.
    async fn set_nx(&self, key: &str, value: &str) -> Result<bool, StoreError>;
    async fn del(&self, key: &str) -> Result<(), StoreError>;
    /// Enumerate keys matching a glob pattern. Observability only; not
    /// part of any hot path.
    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, StoreError>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError>;
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError>;
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;
    async fn hdel(&self, key: &str, field: &str) -> Result<(), StoreError>;

    async fn sadd(&self, key: &str, member: &str) -> Result<bool, StoreError>;
    async fn srem(&self, key: &str, member: &str) -> Result<bool, StoreError>;
    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError>;
    async fn scard(&self, key: &str) -> Result<usize, StoreError>;
    async fn sismember(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError>;
    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError>;
    /// The lowest-score member and its score.
    async fn zhead(&self, key: &str) -> Result<Option<(String, f64)>, StoreError>;
    async fn zcard(&self, key: &str) -> Result<usize, StoreError>;
    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>, StoreError>;

    /// Apply a batch of mutations atomically, unconditionally.
    async fn atomic(&self, ops: Vec<StoreOp>) -> Result<(), StoreError>;

    /// Watch `watch` keys, re-check `conditions`, then commit `ops`.
    ///
    /// Returns [`TxOutcome::Conflict`] when a watched key changed under the
    /// transaction; callers retry with backoff and eventually yield.
    async fn run_optimistic(
        &self,
        watch: &[String],
        conditions: &[TxCondition],
        ops: Vec<StoreOp>,
    ) -> Result<TxOutcome, StoreError>;

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError>;

    /// Subscribe to the given channels. An empty slice subscribes to every
    /// channel the backend carries.
    async fn subscribe(
        &self,
        channels: &[String],
    ) -> Result<broadcast::Receiver<PubSubMessage>, StoreError>;

    /// Authoritative wall-clock time in milliseconds, read from the store
    /// so that all processes score arrivals against the same clock.
    async fn server_time_ms(&self) -> Result<i64, StoreError>;

    /// Process-local monotonic counter used to break arrival-time ties.
    fn next_sequence(&self) -> u64;
}
