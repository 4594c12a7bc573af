//! In-process store backend: ordered maps and deques under one mutex.
//!
//! Satisfies the same contract as [`super::RedisStore`] for single-node
//! deployments and tests. Atomicity of the multi-key operations comes from
//! holding the lock across the whole composite. Not durable; state is lost
//! on restart, which matches the system's stated non-goal.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;

use super::keys;
use super::{EnqueueOutcome, NewPosition, RankSnapshot, Store, TouchOutcome};
use crate::error::{StoreError, StoreResult};
use crate::position::{Priority, PositionStatus};

/// Total-order wrapper so f64 scores can live in a `BTreeSet`.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Score(f64);

impl Eq for Score {}

impl PartialOrd for Score {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Score {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0)
    }
}

#[derive(Debug, Default)]
struct Zset {
    scores: HashMap<String, f64>,
    ordered: BTreeSet<(Score, String)>,
}

impl Zset {
    /// Insert or update; returns true when the member was new.
    fn insert(&mut self, member: &str, score: f64) -> bool {
        let fresh = match self.scores.insert(member.to_string(), score) {
            Some(old) => {
                self.ordered.remove(&(Score(old), member.to_string()));
                false
            }
            None => true,
        };
        self.ordered.insert((Score(score), member.to_string()));
        fresh
    }

    fn remove(&mut self, member: &str) -> bool {
        match self.scores.remove(member) {
            Some(score) => {
                self.ordered.remove(&(Score(score), member.to_string()));
                true
            }
            None => false,
        }
    }

    fn rank(&self, member: &str) -> Option<u64> {
        let score = *self.scores.get(member)?;
        let position = self
            .ordered
            .iter()
            .take_while(|(s, m)| (*s, m.as_str()) < (Score(score), member))
            .count();
        Some(position as u64)
    }

    fn len(&self) -> u64 {
        self.scores.len() as u64
    }

    fn has_score(&self, score: f64) -> bool {
        self.ordered
            .range((Score(score), String::new())..)
            .next()
            .is_some_and(|(s, _)| s.0 == score)
    }

    fn range(&self, min: f64, max: f64, limit: usize) -> Vec<String> {
        self.ordered
            .iter()
            .filter(|(s, _)| s.0 >= min && s.0 <= max)
            .take(limit)
            .map(|(_, m)| m.clone())
            .collect()
    }

    fn remove_below(&mut self, max_score: f64) -> u64 {
        let doomed: Vec<String> = self
            .ordered
            .iter()
            .take_while(|(s, _)| s.0 <= max_score)
            .map(|(_, m)| m.clone())
            .collect();
        for member in &doomed {
            self.remove(member);
        }
        doomed.len() as u64
    }
}

#[derive(Default)]
struct Inner {
    strings: HashMap<String, String>,
    hashes: HashMap<String, HashMap<String, String>>,
    lists: HashMap<String, VecDeque<String>>,
    zsets: HashMap<String, Zset>,
    deadlines: HashMap<String, Instant>,
}

impl Inner {
    /// Drop the key everywhere if its TTL has elapsed.
    fn purge(&mut self, key: &str) {
        if self
            .deadlines
            .get(key)
            .is_some_and(|deadline| *deadline <= Instant::now())
        {
            self.drop_key(key);
        }
    }

    fn drop_key(&mut self, key: &str) {
        self.deadlines.remove(key);
        self.strings.remove(key);
        self.hashes.remove(key);
        self.lists.remove(key);
        self.zsets.remove(key);
    }

    fn exists(&self, key: &str) -> bool {
        self.strings.contains_key(key)
            || self.hashes.contains_key(key)
            || self.lists.contains_key(key)
            || self.zsets.contains_key(key)
    }

    fn set_deadline(&mut self, key: &str, ttl: Duration) {
        self.deadlines.insert(key.to_string(), Instant::now() + ttl);
    }

    fn zset(&mut self, key: &str) -> &mut Zset {
        self.zsets.entry(key.to_string()).or_default()
    }

    fn list(&mut self, key: &str) -> &mut VecDeque<String> {
        self.lists.entry(key.to_string()).or_default()
    }

    fn list_remove(&mut self, key: &str, member: &str) -> bool {
        let Some(list) = self.lists.get_mut(key) else {
            return false;
        };
        match list.iter().position(|m| m == member) {
            Some(idx) => {
                list.remove(idx);
                true
            }
            None => false,
        }
    }

    fn hash_field(&mut self, key: &str, field: &str) -> Option<String> {
        self.purge(key);
        self.hashes.get(key).and_then(|h| h.get(field)).cloned()
    }

    /// Cross-priority rank: whole backlogs of higher priorities precede any
    /// position at this level, then FIFO index within the level.
    fn cross_rank(&mut self, queue: &str, priority: Priority, id: &str) -> u64 {
        let mut rank: u64 = 0;
        for higher in priority.higher() {
            rank += self
                .lists
                .get(&keys::priority_list(queue, higher.as_u8()))
                .map_or(0, |l| l.len() as u64);
        }
        if let Some(list) = self.lists.get(&keys::priority_list(queue, priority.as_u8())) {
            if let Some(idx) = list.iter().position(|m| m == id) {
                rank += idx as u64;
            }
        }
        rank
    }

    fn epoch_f64() -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64()
    }
}

/// Mutex-guarded in-memory implementation of [`Store`].
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StoreResult<std::sync::MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Fatal("memory store lock poisoned".into()))
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn ping(&self) -> StoreResult<()> {
        self.lock().map(|_| ())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut inner = self.lock()?;
        inner.purge(key);
        Ok(inner.strings.get(key).cloned())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        let mut inner = self.lock()?;
        inner.strings.insert(key.to_string(), value.to_string());
        inner.set_deadline(key, ttl);
        Ok(())
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
    ) -> StoreResult<bool> {
        let mut inner = self.lock()?;
        inner.purge(key);
        let current = inner.strings.get(key).map(String::as_str);
        if current == expected {
            inner.strings.insert(key.to_string(), new.to_string());
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn increment(&self, key: &str, delta: i64) -> StoreResult<i64> {
        let mut inner = self.lock()?;
        inner.purge(key);
        let current = inner
            .strings
            .get(key)
            .map(|v| v.parse::<i64>())
            .transpose()
            .map_err(|e| StoreError::Conflict(format!("non-numeric counter {key}: {e}")))?
            .unwrap_or(0);
        let next = current + delta;
        inner.strings.insert(key.to_string(), next.to_string());
        Ok(next)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let mut inner = self.lock()?;
        inner.purge(key);
        if inner.exists(key) {
            inner.set_deadline(key, ttl);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let mut inner = self.lock()?;
        inner.purge(key);
        let existed = inner.exists(key);
        inner.drop_key(key);
        Ok(existed)
    }

    async fn add_ordered(&self, key: &str, member: &str, score: f64) -> StoreResult<bool> {
        let mut inner = self.lock()?;
        inner.purge(key);
        Ok(inner.zset(key).insert(member, score))
    }

    async fn remove_ordered(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut inner = self.lock()?;
        inner.purge(key);
        Ok(inner.zset(key).remove(member))
    }

    async fn remove_ordered_below(&self, key: &str, max_score: f64) -> StoreResult<u64> {
        let mut inner = self.lock()?;
        inner.purge(key);
        Ok(inner.zset(key).remove_below(max_score))
    }

    async fn rank(&self, key: &str, member: &str) -> StoreResult<Option<u64>> {
        let mut inner = self.lock()?;
        inner.purge(key);
        Ok(inner.zsets.get(key).and_then(|z| z.rank(member)))
    }

    async fn length(&self, key: &str) -> StoreResult<u64> {
        let mut inner = self.lock()?;
        inner.purge(key);
        Ok(inner.zsets.get(key).map_or(0, Zset::len))
    }

    async fn range_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: usize,
    ) -> StoreResult<Vec<String>> {
        let mut inner = self.lock()?;
        inner.purge(key);
        Ok(inner
            .zsets
            .get(key)
            .map_or_else(Vec::new, |z| z.range(min, max, limit)))
    }

    async fn left_push(&self, key: &str, member: &str) -> StoreResult<u64> {
        let mut inner = self.lock()?;
        let list = inner.list(key);
        list.push_front(member.to_string());
        Ok(list.len() as u64)
    }

    async fn right_push(&self, key: &str, member: &str) -> StoreResult<u64> {
        let mut inner = self.lock()?;
        let list = inner.list(key);
        list.push_back(member.to_string());
        Ok(list.len() as u64)
    }

    async fn left_pop(&self, key: &str) -> StoreResult<Option<String>> {
        let mut inner = self.lock()?;
        Ok(inner.lists.get_mut(key).and_then(VecDeque::pop_front))
    }

    async fn list_len(&self, key: &str) -> StoreResult<u64> {
        let inner = self.lock()?;
        Ok(inner.lists.get(key).map_or(0, |l| l.len() as u64))
    }

    async fn hash_set(&self, key: &str, fields: &[(&str, String)]) -> StoreResult<()> {
        let mut inner = self.lock()?;
        inner.purge(key);
        let hash = inner.hashes.entry(key.to_string()).or_default();
        for (field, value) in fields {
            hash.insert(field.to_string(), value.clone());
        }
        Ok(())
    }

    async fn hash_get(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        let mut inner = self.lock()?;
        Ok(inner.hash_field(key, field))
    }

    async fn hash_get_all(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let mut inner = self.lock()?;
        inner.purge(key);
        Ok(inner.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn hash_increment(&self, key: &str, field: &str, delta: i64) -> StoreResult<i64> {
        let mut inner = self.lock()?;
        inner.purge(key);
        let hash = inner.hashes.entry(key.to_string()).or_default();
        let current = hash
            .get(field)
            .map(|v| v.parse::<i64>())
            .transpose()
            .map_err(|e| StoreError::Conflict(format!("non-numeric field {key}.{field}: {e}")))?
            .unwrap_or(0);
        let next = current + delta;
        hash.insert(field.to_string(), next.to_string());
        Ok(next)
    }

    async fn enqueue_position(&self, new: &NewPosition) -> StoreResult<EnqueueOutcome> {
        let mut inner = self.lock()?;
        let queue = new.queue_id.as_str();

        let Some(cfg) = inner.hashes.get(&keys::queue_cfg(queue)).cloned() else {
            return Ok(EnqueueOutcome::Unavailable { state: None });
        };
        let state = cfg.get("status").cloned().unwrap_or_default();
        if state != "active" {
            return Ok(EnqueueOutcome::Unavailable { state: Some(state) });
        }

        // Fingerprint idempotency: an existing waiting position is returned
        // untouched.
        let fp_key = keys::fingerprint(queue, &new.fingerprint);
        inner.purge(&fp_key);
        if let Some(existing) = inner.strings.get(&fp_key).cloned() {
            let meta_key = keys::position(&existing);
            inner.purge(&meta_key);
            let status = inner.hash_field(&meta_key, "status");
            if status.as_deref() == Some("waiting") {
                let priority = inner
                    .hash_field(&meta_key, "priority")
                    .and_then(|p| p.parse::<u8>().ok())
                    .and_then(|p| Priority::try_from(p).ok())
                    .unwrap_or(Priority::Normal);
                let rank = inner.cross_rank(queue, priority, &existing);
                let queue_length = inner.zset(&keys::rank(queue)).len();
                return Ok(EnqueueOutcome::Existing {
                    position_id: existing,
                    rank,
                    queue_length,
                });
            }
        }

        let max_size: u64 = cfg.get("max_size").and_then(|v| v.parse().ok()).unwrap_or(0);
        let queue_length = inner.zset(&keys::rank(queue)).len();
        if max_size > 0 && queue_length >= max_size {
            return Ok(EnqueueOutcome::Full { max_size });
        }

        // Monotonic score: bump by 1µs until unique so ordering is strict.
        let rank_key = keys::rank(queue);
        let mut score = new.now_us as f64;
        while inner.zset(&rank_key).has_score(score) {
            score += 1.0;
        }

        let timeout: u64 = cfg
            .get("heartbeat_timeout_s")
            .and_then(|v| v.parse().ok())
            .unwrap_or(60);
        let grace: u64 = cfg
            .get("grace_period_s")
            .and_then(|v| v.parse().ok())
            .unwrap_or(30);
        let ttl = Duration::from_secs(timeout + grace);

        let id = new.position_id.clone();
        inner
            .list(&keys::priority_list(queue, new.priority.as_u8()))
            .push_back(id.clone());
        inner.zset(&rank_key).insert(&id, score);
        inner.zset(&keys::liveness(queue)).insert(&id, new.now_s as f64);

        let meta_key = keys::position(&id);
        let mut meta: HashMap<String, String> = HashMap::from([
            ("queue_id".to_string(), queue.to_string()),
            ("priority".to_string(), new.priority.as_u8().to_string()),
            ("status".to_string(), "waiting".to_string()),
            ("enqueued_at_us".to_string(), (score as u64).to_string()),
            ("heartbeat_at_s".to_string(), new.now_s.to_string()),
            ("fingerprint".to_string(), new.fingerprint.clone()),
            ("ttl_s".to_string(), (timeout + grace).to_string()),
            ("grace_s".to_string(), grace.to_string()),
        ]);
        if let Some(ref ua) = new.ua_hash {
            meta.insert("ua_hash".to_string(), ua.clone());
        }
        if let Some(ref data) = new.metadata {
            meta.insert("metadata".to_string(), data.clone());
        }
        inner.hashes.insert(meta_key.clone(), meta);
        inner.set_deadline(&meta_key, ttl);

        inner.strings.insert(fp_key.clone(), id.clone());
        inner.set_deadline(&fp_key, ttl);

        let rank = inner.cross_rank(queue, new.priority, &id);
        let queue_length = inner.zset(&rank_key).len();
        Ok(EnqueueOutcome::Created {
            position_id: id,
            rank,
            queue_length,
        })
    }

    async fn dequeue_position(&self, queue_id: &str, now_s: u64) -> StoreResult<Option<String>> {
        let mut inner = self.lock()?;
        for priority in Priority::ADMISSION_ORDER {
            let list_key = keys::priority_list(queue_id, priority.as_u8());
            let Some(id) = inner.lists.get_mut(&list_key).and_then(VecDeque::pop_front) else {
                continue;
            };

            inner.zset(&keys::rank(queue_id)).remove(&id);
            inner.zset(&keys::liveness(queue_id)).remove(&id);

            let meta_key = keys::position(&id);
            inner.purge(&meta_key);
            if let Some(meta) = inner.hashes.get_mut(&meta_key) {
                let fingerprint = meta.get("fingerprint").cloned();
                let grace: u64 = meta
                    .get("grace_s")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(30);
                meta.insert("status".to_string(), "admitted".to_string());
                meta.insert("admitted_at_s".to_string(), now_s.to_string());
                inner.set_deadline(&meta_key, Duration::from_secs(grace));
                if let Some(fph) = fingerprint {
                    let fp_key = keys::fingerprint(queue_id, &fph);
                    inner.drop_key(&fp_key);
                }
            }
            return Ok(Some(id));
        }
        Ok(None)
    }

    async fn touch_position(&self, position_id: &str, now_s: u64) -> StoreResult<TouchOutcome> {
        let mut inner = self.lock()?;
        let meta_key = keys::position(position_id);
        inner.purge(&meta_key);
        let Some(meta) = inner.hashes.get(&meta_key).cloned() else {
            return Ok(TouchOutcome::Missing);
        };
        let queue_id = meta.get("queue_id").cloned().unwrap_or_default();
        match meta.get("status").map(String::as_str) {
            Some("waiting") => {
                let ttl: u64 = meta.get("ttl_s").and_then(|v| v.parse().ok()).unwrap_or(90);
                if let Some(hash) = inner.hashes.get_mut(&meta_key) {
                    hash.insert("heartbeat_at_s".to_string(), now_s.to_string());
                }
                inner
                    .zset(&keys::liveness(&queue_id))
                    .insert(position_id, now_s as f64);
                inner.set_deadline(&meta_key, Duration::from_secs(ttl));
                if let Some(fph) = meta.get("fingerprint") {
                    let fp_key = keys::fingerprint(&queue_id, fph);
                    if inner.exists(&fp_key) {
                        inner.set_deadline(&fp_key, Duration::from_secs(ttl));
                    }
                }
                Ok(TouchOutcome::Waiting { queue_id })
            }
            Some("admitted") => Ok(TouchOutcome::Admitted {
                queue_id,
                session_id: meta.get("session_id").cloned(),
            }),
            Some("cancelled") => Ok(TouchOutcome::Cancelled),
            _ => Ok(TouchOutcome::Expired),
        }
    }

    async fn cancel_position(&self, position_id: &str) -> StoreResult<Option<String>> {
        let mut inner = self.lock()?;
        let meta_key = keys::position(position_id);
        inner.purge(&meta_key);
        let Some(meta) = inner.hashes.get(&meta_key).cloned() else {
            return Ok(None);
        };
        if meta.get("status").map(String::as_str) != Some("waiting") {
            return Ok(None);
        }
        let queue_id = meta.get("queue_id").cloned().unwrap_or_default();
        let priority: u8 = meta
            .get("priority")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let grace: u64 = meta
            .get("grace_s")
            .and_then(|v| v.parse().ok())
            .unwrap_or(30);

        inner.list_remove(&keys::priority_list(&queue_id, priority), position_id);
        inner.zset(&keys::rank(&queue_id)).remove(position_id);
        inner.zset(&keys::liveness(&queue_id)).remove(position_id);
        if let Some(fph) = meta.get("fingerprint") {
            let fp_key = keys::fingerprint(&queue_id, fph);
            inner.drop_key(&fp_key);
        }
        if let Some(hash) = inner.hashes.get_mut(&meta_key) {
            hash.insert("status".to_string(), "cancelled".to_string());
        }
        inner.set_deadline(&meta_key, Duration::from_secs(grace));
        Ok(Some(queue_id))
    }

    async fn expire_position(
        &self,
        queue_id: &str,
        position_id: &str,
        cutoff_s: u64,
        now_s: u64,
    ) -> StoreResult<bool> {
        let mut inner = self.lock()?;
        let live_key = keys::liveness(queue_id);

        // A heartbeat that lands after the reaper's range read moves the
        // score past the cutoff; the re-check makes the heartbeat win.
        let score = inner.zsets.get(&live_key).and_then(|z| z.scores.get(position_id).copied());
        match score {
            Some(s) if s <= cutoff_s as f64 => {}
            _ => return Ok(false),
        }
        inner.zset(&live_key).remove(position_id);

        let meta_key = keys::position(position_id);
        inner.purge(&meta_key);
        let meta = inner.hashes.get(&meta_key).cloned().unwrap_or_default();
        let priority: u8 = meta
            .get("priority")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let grace: u64 = meta
            .get("grace_s")
            .and_then(|v| v.parse().ok())
            .unwrap_or(30);

        inner.list_remove(&keys::priority_list(queue_id, priority), position_id);
        inner.zset(&keys::rank(queue_id)).remove(position_id);
        if let Some(hash) = inner.hashes.get_mut(&meta_key) {
            hash.insert("status".to_string(), "expired".to_string());
            hash.insert("expired_at_s".to_string(), now_s.to_string());
            hash.insert("expire_reason".to_string(), "heartbeat-timeout".to_string());
            inner.set_deadline(&meta_key, Duration::from_secs(grace));
        }
        Ok(true)
    }

    async fn position_rank(&self, position_id: &str) -> StoreResult<Option<RankSnapshot>> {
        let mut inner = self.lock()?;
        let meta_key = keys::position(position_id);
        inner.purge(&meta_key);
        let Some(meta) = inner.hashes.get(&meta_key).cloned() else {
            return Ok(None);
        };
        let queue_id = meta.get("queue_id").cloned().unwrap_or_default();
        let priority = meta
            .get("priority")
            .and_then(|v| v.parse::<u8>().ok())
            .and_then(|p| Priority::try_from(p).ok())
            .unwrap_or(Priority::Normal);
        let status = meta
            .get("status")
            .and_then(|s| PositionStatus::parse(s))
            .unwrap_or(PositionStatus::Expired);
        let queue_length = inner.zset(&keys::rank(&queue_id)).len();
        let rank = if status == PositionStatus::Waiting {
            inner.cross_rank(&queue_id, priority, position_id)
        } else {
            0
        };
        Ok(Some(RankSnapshot {
            queue_id,
            priority,
            status,
            rank,
            queue_length,
        }))
    }

    async fn try_admit(&self, queue_id: &str, rate: f64, capacity: f64) -> StoreResult<bool> {
        let mut inner = self.lock()?;
        let now = Inner::epoch_f64();
        let bucket_key = keys::bucket(queue_id);
        let bucket = inner.hashes.get(&bucket_key);
        let tokens = bucket
            .and_then(|b| b.get("tokens"))
            .and_then(|v| v.parse::<f64>().ok())
            .unwrap_or(capacity);
        let refilled_at = bucket
            .and_then(|b| b.get("refilled_at"))
            .and_then(|v| v.parse::<f64>().ok())
            .unwrap_or(now);

        let refill = ((now - refilled_at).max(0.0) * rate).floor();
        let tokens = (tokens + refill).min(capacity);
        if tokens >= 1.0 {
            // Persist only on consume; a failed attempt leaves the bucket
            // untouched so fractional accrual keeps building.
            let hash = inner.hashes.entry(bucket_key).or_default();
            hash.insert("tokens".to_string(), (tokens - 1.0).to_string());
            hash.insert("refilled_at".to_string(), now.to_string());
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn return_token(&self, queue_id: &str, capacity: f64) -> StoreResult<()> {
        let mut inner = self.lock()?;
        let now = Inner::epoch_f64();
        let bucket_key = keys::bucket(queue_id);
        let hash = inner.hashes.entry(bucket_key).or_default();
        let tokens = hash
            .get("tokens")
            .and_then(|v| v.parse::<f64>().ok())
            .unwrap_or(capacity);
        hash.insert("tokens".to_string(), (tokens + 1.0).min(capacity).to_string());
        hash.entry("refilled_at".to_string())
            .or_insert_with(|| now.to_string());
        Ok(())
    }
}
