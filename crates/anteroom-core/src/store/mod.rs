pub mod keys;
mod memory;
mod redis;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreResult;
use crate::position::{Priority, PositionStatus};

pub use memory::MemoryStore;
pub use redis::RedisStore;

/// Inputs of the atomic enqueue operation. Queue limits and state are read
/// from the descriptor hash inside the operation itself, never pre-checked
/// by the caller: the operation is the serialisation point.
#[derive(Debug, Clone)]
pub struct NewPosition {
    pub queue_id: String,
    /// Pre-minted id, used only when the fingerprint has no live position.
    pub position_id: String,
    pub priority: Priority,
    pub fingerprint: String,
    pub ua_hash: Option<String>,
    /// Opaque caller-supplied JSON.
    pub metadata: Option<String>,
    pub now_us: u64,
    pub now_s: u64,
}

/// Result of the atomic enqueue operation.
#[derive(Debug, Clone, PartialEq)]
pub enum EnqueueOutcome {
    /// A fresh position was created.
    Created {
        position_id: String,
        rank: u64,
        queue_length: u64,
    },
    /// The fingerprint already holds a waiting position; nothing changed.
    Existing {
        position_id: String,
        rank: u64,
        queue_length: u64,
    },
    /// The queue descriptor is missing or its state is not `active`.
    Unavailable { state: Option<String> },
    /// max-size reached.
    Full { max_size: u64 },
}

/// Result of the atomic heartbeat operation.
#[derive(Debug, Clone, PartialEq)]
pub enum TouchOutcome {
    /// Liveness refreshed; the position is still waiting.
    Waiting { queue_id: String },
    /// The position was admitted; the client should pick up its session.
    Admitted {
        queue_id: String,
        session_id: Option<String>,
    },
    Expired,
    Cancelled,
    /// Metadata already gone (TTL elapsed).
    Missing,
}

/// Point-in-time rank view of a position.
#[derive(Debug, Clone, PartialEq)]
pub struct RankSnapshot {
    pub queue_id: String,
    pub priority: Priority,
    pub status: PositionStatus,
    /// Count of positions strictly preceding this one under cross-priority
    /// ordering. 0 = head of queue. Meaningful only while `status` is
    /// `waiting`.
    pub rank: u64,
    pub queue_length: u64,
}

/// Atomic primitives over the shared store, plus the named multi-key atomic
/// operations the core depends on.
///
/// Two implementations exist: [`RedisStore`] (server-side Lua, one round
/// trip per atomic operation) and [`MemoryStore`] (one mutex held across
/// each composite). The named operations are the substitution seam: the
/// cross-key invariants hold only because each executes atomically.
///
/// All operations are subject to the adapter's internal deadline, and
/// transient failures are retried internally with bounded backoff before
/// surfacing. Cancellation is by future drop.
#[async_trait]
pub trait Store: Send + Sync {
    // --- Primitives ---

    /// Connectivity probe for health checks.
    async fn ping(&self) -> StoreResult<()>;

    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Set a string value with a TTL.
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()>;

    /// Atomic compare-and-set. `expected = None` means "set only if absent".
    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
    ) -> StoreResult<bool>;

    /// Atomic counter increment; creates the key at `delta` when absent.
    async fn increment(&self, key: &str, delta: i64) -> StoreResult<i64>;

    /// Apply a TTL to an existing key. Returns false when the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool>;

    async fn delete(&self, key: &str) -> StoreResult<bool>;

    /// Idempotent ordered-set add. Returns true when the member was new.
    async fn add_ordered(&self, key: &str, member: &str, score: f64) -> StoreResult<bool>;

    /// Absent-safe ordered-set remove. Returns true when the member existed.
    async fn remove_ordered(&self, key: &str, member: &str) -> StoreResult<bool>;

    /// Remove every member with score <= `max_score`; returns the count.
    async fn remove_ordered_below(&self, key: &str, max_score: f64) -> StoreResult<u64>;

    /// 0-indexed rank by ascending score, or `None` when not present.
    async fn rank(&self, key: &str, member: &str) -> StoreResult<Option<u64>>;

    /// Ordered-set cardinality.
    async fn length(&self, key: &str) -> StoreResult<u64>;

    /// Members with `min <= score <= max` in ascending score order, capped
    /// at `limit`.
    async fn range_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: usize,
    ) -> StoreResult<Vec<String>>;

    async fn left_push(&self, key: &str, member: &str) -> StoreResult<u64>;
    async fn right_push(&self, key: &str, member: &str) -> StoreResult<u64>;
    async fn left_pop(&self, key: &str) -> StoreResult<Option<String>>;
    async fn list_len(&self, key: &str) -> StoreResult<u64>;

    async fn hash_set(&self, key: &str, fields: &[(&str, String)]) -> StoreResult<()>;
    async fn hash_get(&self, key: &str, field: &str) -> StoreResult<Option<String>>;
    async fn hash_get_all(&self, key: &str) -> StoreResult<HashMap<String, String>>;
    async fn hash_increment(&self, key: &str, field: &str, delta: i64) -> StoreResult<i64>;

    // --- Multi-key atomic operations ---

    /// Steps 1-11 of the enqueue contract in one atomic unit: descriptor
    /// state and max-size checks, fingerprint idempotency, score minting
    /// with +1 collision bumps, and insertion into the priority list, rank
    /// set, liveness index, metadata hash, and fingerprint map.
    async fn enqueue_position(&self, new: &NewPosition) -> StoreResult<EnqueueOutcome>;

    /// Pop the highest-priority head position, remove it from the rank set,
    /// liveness index, and fingerprint map, and mark it admitted. Returns
    /// `None` when all four priority lists are empty.
    async fn dequeue_position(&self, queue_id: &str, now_s: u64) -> StoreResult<Option<String>>;

    /// Refresh liveness and TTLs for a waiting position; report the current
    /// lifecycle state otherwise.
    async fn touch_position(&self, position_id: &str, now_s: u64) -> StoreResult<TouchOutcome>;

    /// Remove a waiting position from all indexes and mark it cancelled,
    /// retaining metadata for the grace window. Returns the queue id when
    /// the cancellation actually happened.
    async fn cancel_position(&self, position_id: &str) -> StoreResult<Option<String>>;

    /// Reaper step: expire one stale position. Re-checks the liveness score
    /// against `cutoff_s` inside the atomic unit so a concurrent heartbeat
    /// wins cleanly; returns true only for the caller that actually removed
    /// the liveness entry, and that caller owns the expiry event.
    async fn expire_position(
        &self,
        queue_id: &str,
        position_id: &str,
        cutoff_s: u64,
        now_s: u64,
    ) -> StoreResult<bool>;

    /// Rank lookup: `Σ length(priority > p)` + index within the position's
    /// own priority list. `None` when the metadata is gone.
    async fn position_rank(&self, position_id: &str) -> StoreResult<Option<RankSnapshot>>;

    /// Lazy-refill token bucket consume. The clock is the store's own; the
    /// bucket starts full and persists state only on successful consume.
    async fn try_admit(&self, queue_id: &str, rate: f64, capacity: f64) -> StoreResult<bool>;

    /// Roll back one admission token after a dequeue that found the queue
    /// empty, clamped at capacity.
    async fn return_token(&self, queue_id: &str, capacity: f64) -> StoreResult<()>;
}
