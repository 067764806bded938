//! Redis-backed implementation of the [`Store`] trait.
//!
//! Plain commands go through a [`ConnectionManager`], which reconnects
//! automatically. Optimistic transactions need `WATCH`, which binds state
//! to a single connection, so each transaction runs on a dedicated async
//! connection: `WATCH` the keys, re-check the conditions on that same
//! connection, then `MULTI`/`EXEC` the batch. A nil `EXEC` reply means a
//! watched key changed and surfaces as [`TxOutcome::Conflict`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::broadcast;

use super::{PubSubMessage, Store, StoreError, StoreOp, TxCondition, TxOutcome};

/// Capacity of the broadcast channel behind each subscription.
const SUBSCRIBE_BUFFER: usize = 1024;

pub struct RedisStore {
    client: redis::Client,
    conn: ConnectionManager,
    sequence: AtomicU64,
}

impl RedisStore {
    /// Connect to Redis at the given URL (e.g. `redis://localhost:6379`).
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;
        Ok(Self {
            client,
            conn,
            sequence: AtomicU64::new(0),
        })
    }

    /// Connect with an upper bound on connection establishment time.
    pub async fn connect_with_timeout(
        url: &str,
        timeout: Duration,
    ) -> Result<Self, StoreError> {
        tokio::time::timeout(timeout, Self::connect(url))
            .await
            .map_err(|_| {
                StoreError::ConnectionFailed(format!(
                    "connect to {url} timed out after {timeout:?}"
                ))
            })?
    }

    fn apply_op(pipe: &mut redis::Pipeline, op: &StoreOp) {
        match op {
            StoreOp::Set { key, value } => {
                pipe.set(key, value);
            }
            StoreOp::Del { key } => {
                pipe.del(key);
            }
            StoreOp::HSet { key, field, value } => {
                pipe.hset(key, field, value);
            }
            StoreOp::HDel { key, field } => {
                pipe.hdel(key, field);
            }
            StoreOp::HIncrBy { key, field, delta } => {
                pipe.cmd("HINCRBY").arg(key).arg(field).arg(*delta);
            }
            StoreOp::SAdd { key, member } => {
                pipe.sadd(key, member);
            }
            StoreOp::SRem { key, member } => {
                pipe.srem(key, member);
            }
            StoreOp::ZAdd { key, member, score } => {
                pipe.zadd(key, member, *score);
            }
            StoreOp::ZRem { key, member } => {
                pipe.zrem(key, member);
            }
        }
    }

    async fn check_condition(
        conn: &mut redis::aio::Connection,
        condition: &TxCondition,
    ) -> Result<bool, StoreError> {
        match condition {
            TxCondition::ZsetHeadIs {
                key,
                member,
                max_score,
            } => {
                let head: Vec<(String, f64)> = redis::cmd("ZRANGE")
                    .arg(key)
                    .arg(0)
                    .arg(0)
                    .arg("WITHSCORES")
                    .query_async(conn)
                    .await?;
                Ok(head
                    .first()
                    .map(|(m, s)| m == member && *s <= *max_score)
                    .unwrap_or(false))
            }
            TxCondition::SetCardBelow { key, bound } => {
                let card: usize = redis::cmd("SCARD").arg(key).query_async(conn).await?;
                Ok(card < *bound)
            }
        }
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(key, value).await?;
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.set_nx(key, value).await?)
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(200)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(keys)
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.hget(key, field).await?)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.hset::<_, _, _, ()>(key, field, value).await?;
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.hgetall(key).await?)
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.hdel::<_, _, ()>(key, field).await?;
        Ok(())
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.sadd(key, member).await?)
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.srem(key, member).await?)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.smembers(key).await?)
    }

    async fn scard(&self, key: &str) -> Result<usize, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.scard(key).await?)
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.sismember(key, member).await?)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.zadd::<_, _, _, ()>(key, member, score).await?;
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.zrem(key, member).await?)
    }

    async fn zhead(&self, key: &str) -> Result<Option<(String, f64)>, StoreError> {
        let mut conn = self.conn.clone();
        let head: Vec<(String, f64)> = conn.zrange_withscores(key, 0, 0).await?;
        Ok(head.into_iter().next())
    }

    async fn zcard(&self, key: &str) -> Result<usize, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.zcard(key).await?)
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.zscore(key, member).await?)
    }

    async fn atomic(&self, ops: Vec<StoreOp>) -> Result<(), StoreError> {
        if ops.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in &ops {
            Self::apply_op(&mut pipe, op);
        }
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn run_optimistic(
        &self,
        watch: &[String],
        conditions: &[TxCondition],
        ops: Vec<StoreOp>,
    ) -> Result<TxOutcome, StoreError> {
        let mut conn = self
            .client
            .get_async_connection()
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        if !watch.is_empty() {
            let mut watch_cmd = redis::cmd("WATCH");
            for key in watch {
                watch_cmd.arg(key);
            }
            watch_cmd.query_async::<_, ()>(&mut conn).await?;
        }

        for condition in conditions {
            if !Self::check_condition(&mut conn, condition).await? {
                redis::cmd("UNWATCH").query_async::<_, ()>(&mut conn).await?;
                return Ok(TxOutcome::ConditionFailed);
            }
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in &ops {
            Self::apply_op(&mut pipe, op);
        }
        // A nil EXEC reply (None) means the watch fired.
        let result: Option<Vec<redis::Value>> = pipe.query_async(&mut conn).await?;
        Ok(match result {
            Some(_) => TxOutcome::Committed,
            None => TxOutcome::Conflict,
        })
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.publish::<_, _, ()>(channel, payload).await?;
        Ok(())
    }

    async fn subscribe(
        &self,
        channels: &[String],
    ) -> Result<broadcast::Receiver<PubSubMessage>, StoreError> {
        let conn = self
            .client
            .get_async_connection()
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;
        let mut pubsub = conn.into_pubsub();
        if channels.is_empty() {
            pubsub.psubscribe("*").await?;
        } else {
            for channel in channels {
                pubsub.subscribe(channel).await?;
            }
        }

        let (tx, rx) = broadcast::channel(SUBSCRIBE_BUFFER);
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let channel = msg.get_channel_name().to_string();
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(err) => {
                        tracing::warn!("dropping undecodable pubsub payload: {err}");
                        continue;
                    }
                };
                // All receivers gone: stop pumping.
                if tx.send(PubSubMessage { channel, payload }).is_err() {
                    break;
                }
            }
        });

        Ok(rx)
    }

    async fn server_time_ms(&self) -> Result<i64, StoreError> {
        let mut conn = self.conn.clone();
        let (secs, micros): (i64, i64) = redis::cmd("TIME").query_async(&mut conn).await?;
        Ok(secs * 1000 + micros / 1000)
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("sequence", &self.sequence.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
