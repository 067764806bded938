use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use shoal::{PubSubMessage, Store, StoreError, StoreOp, TxCondition, TxOutcome};

const PUBSUB_BUFFER: usize = 4096;

#[derive(Default)]
struct Inner {
    strings: HashMap<String, String>,
    hashes: HashMap<String, HashMap<String, String>>,
    sets: HashMap<String, HashSet<String>>,
    zsets: HashMap<String, HashMap<String, f64>>,
}

impl Inner {
    fn zhead(&self, key: &str) -> Option<(String, f64)> {
        let zset = self.zsets.get(key)?;
        zset.iter()
            .min_by(|(ma, sa), (mb, sb)| {
                sa.partial_cmp(sb)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| ma.cmp(mb))
            })
            .map(|(member, score)| (member.clone(), *score))
    }

    fn apply(&mut self, op: &StoreOp) {
        match op {
            StoreOp::Set { key, value } => {
                self.strings.insert(key.clone(), value.clone());
            }
            StoreOp::Del { key } => {
                self.strings.remove(key);
                self.hashes.remove(key);
                self.sets.remove(key);
                self.zsets.remove(key);
            }
            StoreOp::HSet { key, field, value } => {
                self.hashes
                    .entry(key.clone())
                    .or_default()
                    .insert(field.clone(), value.clone());
            }
            StoreOp::HDel { key, field } => {
                if let Some(hash) = self.hashes.get_mut(key) {
                    hash.remove(field);
                }
            }
            StoreOp::HIncrBy { key, field, delta } => {
                let hash = self.hashes.entry(key.clone()).or_default();
                let current = hash
                    .get(field)
                    .and_then(|v| v.parse::<i64>().ok())
                    .unwrap_or(0);
                hash.insert(field.clone(), (current + delta).to_string());
            }
            StoreOp::SAdd { key, member } => {
                self.sets.entry(key.clone()).or_default().insert(member.clone());
            }
            StoreOp::SRem { key, member } => {
                if let Some(set) = self.sets.get_mut(key) {
                    set.remove(member);
                }
            }
            StoreOp::ZAdd { key, member, score } => {
                self.zsets
                    .entry(key.clone())
                    .or_default()
                    .insert(member.clone(), *score);
            }
            StoreOp::ZRem { key, member } => {
                if let Some(zset) = self.zsets.get_mut(key) {
                    zset.remove(member);
                }
            }
        }
    }

    fn check(&self, condition: &TxCondition) -> bool {
        match condition {
            TxCondition::ZsetHeadIs {
                key,
                member,
                max_score,
            } => self
                .zhead(key)
                .map(|(m, s)| m == *member && s <= *max_score)
                .unwrap_or(false),
            TxCondition::SetCardBelow { key, bound } => {
                self.sets.get(key).map(|s| s.len()).unwrap_or(0) < *bound
            }
        }
    }
}

/// Minimal glob matching: `*` matches any run of characters.
fn glob_match(pattern: &str, candidate: &str) -> bool {
    let segments: Vec<&str> = pattern.split('*').collect();
    if segments.len() == 1 {
        return pattern == candidate;
    }
    let mut rest = candidate;
    for (i, segment) in segments.iter().enumerate() {
        if segment.is_empty() {
            continue;
        }
        if i == 0 {
            match rest.strip_prefix(segment) {
                Some(r) => rest = r,
                None => return false,
            }
        } else if i == segments.len() - 1 {
            return rest.ends_with(segment);
        } else {
            match rest.find(segment) {
                Some(pos) => rest = &rest[pos + segment.len()..],
                None => return false,
            }
        }
    }
    true
}

/// In-memory store with the same observable semantics as the Redis
/// backend: atomic batches, optimistic transactions (serialized under one
/// lock, so conditions decide the outcome), and broadcast-based pub/sub.
///
/// `force_conflicts` injects transaction aborts to exercise claim retry
/// paths that real contention rarely produces on demand.
pub struct InMemoryStore {
    inner: Mutex<Inner>,
    sequence: AtomicU64,
    forced_conflicts: AtomicUsize,
    pubsub: broadcast::Sender<PubSubMessage>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        let (pubsub, _) = broadcast::channel(PUBSUB_BUFFER);
        Self {
            inner: Mutex::new(Inner::default()),
            sequence: AtomicU64::new(0),
            forced_conflicts: AtomicUsize::new(0),
            pubsub,
        }
    }

    /// Make the next `count` optimistic transactions abort with
    /// [`TxOutcome::Conflict`].
    pub fn force_conflicts(&self, count: usize) {
        self.forced_conflicts.store(count, Ordering::SeqCst);
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.inner.lock().strings.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.inner
            .lock()
            .strings
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        if inner.strings.contains_key(key) {
            return Ok(false);
        }
        inner.strings.insert(key.to_string(), value.to_string());
        Ok(true)
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.strings.remove(key);
        inner.hashes.remove(key);
        inner.sets.remove(key);
        inner.zsets.remove(key);
        Ok(())
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.lock();
        let mut keys: Vec<String> = inner
            .strings
            .keys()
            .chain(inner.hashes.keys())
            .chain(inner.sets.keys())
            .chain(inner.zsets.keys())
            .filter(|k| glob_match(pattern, k))
            .cloned()
            .collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .inner
            .lock()
            .hashes
            .get(key)
            .and_then(|h| h.get(field))
            .cloned())
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        self.inner
            .lock()
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        Ok(self.inner.lock().hashes.get(key).cloned().unwrap_or_default())
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<(), StoreError> {
        if let Some(hash) = self.inner.lock().hashes.get_mut(key) {
            hash.remove(field);
        }
        Ok(())
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        Ok(self
            .inner
            .lock()
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string()))
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        Ok(self
            .inner
            .lock()
            .sets
            .get_mut(key)
            .map(|s| s.remove(member))
            .unwrap_or(false))
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .inner
            .lock()
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn scard(&self, key: &str) -> Result<usize, StoreError> {
        Ok(self.inner.lock().sets.get(key).map(|s| s.len()).unwrap_or(0))
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        Ok(self
            .inner
            .lock()
            .sets
            .get(key)
            .map(|s| s.contains(member))
            .unwrap_or(false))
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError> {
        self.inner
            .lock()
            .zsets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        Ok(self
            .inner
            .lock()
            .zsets
            .get_mut(key)
            .map(|z| z.remove(member).is_some())
            .unwrap_or(false))
    }

    async fn zhead(&self, key: &str) -> Result<Option<(String, f64)>, StoreError> {
        Ok(self.inner.lock().zhead(key))
    }

    async fn zcard(&self, key: &str) -> Result<usize, StoreError> {
        Ok(self.inner.lock().zsets.get(key).map(|z| z.len()).unwrap_or(0))
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>, StoreError> {
        Ok(self
            .inner
            .lock()
            .zsets
            .get(key)
            .and_then(|z| z.get(member))
            .copied())
    }

    async fn atomic(&self, ops: Vec<StoreOp>) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        for op in &ops {
            inner.apply(op);
        }
        Ok(())
    }

    async fn run_optimistic(
        &self,
        _watch: &[String],
        conditions: &[TxCondition],
        ops: Vec<StoreOp>,
    ) -> Result<TxOutcome, StoreError> {
        // Scripted aborts let tests exercise the conflict-retry path; real
        // watch conflicts cannot occur here because the lock serializes
        // every transaction.
        let forced = self
            .forced_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if forced {
            return Ok(TxOutcome::Conflict);
        }

        let mut inner = self.inner.lock();
        for condition in conditions {
            if !inner.check(condition) {
                return Ok(TxOutcome::ConditionFailed);
            }
        }
        for op in &ops {
            inner.apply(op);
        }
        Ok(TxOutcome::Committed)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError> {
        let _ = self.pubsub.send(PubSubMessage {
            channel: channel.to_string(),
            payload: payload.to_string(),
        });
        Ok(())
    }

    async fn subscribe(
        &self,
        channels: &[String],
    ) -> Result<broadcast::Receiver<PubSubMessage>, StoreError> {
        let mut upstream = self.pubsub.subscribe();
        let (tx, rx) = broadcast::channel(PUBSUB_BUFFER);
        let wanted: Vec<String> = channels.to_vec();
        tokio::spawn(async move {
            loop {
                match upstream.recv().await {
                    Ok(msg) => {
                        if wanted.is_empty() || wanted.iter().any(|c| *c == msg.channel) {
                            if tx.send(msg).is_err() {
                                break;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(rx)
    }

    async fn server_time_ms(&self) -> Result<i64, StoreError> {
        Ok(Utc::now().timestamp_millis())
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }
}

impl std::fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("InMemoryStore")
            .field("strings", &inner.strings.len())
            .field("hashes", &inner.hashes.len())
            .field("sets", &inner.sets.len())
            .field("zsets", &inner.zsets.len())
            .finish()
    }
}
