//! Key naming for the shared store.
//!
//! Every key is namespaced under `wr:`. Queue-scoped structures embed the
//! queue name; position and session metadata are keyed by id alone so any
//! holder of an id can resolve it without knowing the queue. The same names
//! are embedded in the Redis-side scripts; change them in both places.

/// Registry of known queues: ordered-set, member = queue name,
/// score = created-at (seconds).
pub fn registry() -> String {
    "wr:queues".to_string()
}

/// Queue descriptor hash.
pub fn queue_cfg(queue: &str) -> String {
    format!("wr:q:{queue}:cfg")
}

/// FIFO list of waiting position ids for one priority level.
pub fn priority_list(queue: &str, priority: u8) -> String {
    format!("wr:q:{queue}:prio:{priority}")
}

/// Queue-wide rank ordered-set: position id -> enqueue score (µs).
pub fn rank(queue: &str) -> String {
    format!("wr:q:{queue}:rank")
}

/// Liveness index: position id -> last-heartbeat (seconds).
pub fn liveness(queue: &str) -> String {
    format!("wr:q:{queue}:live")
}

/// Fingerprint -> position id, TTL-bound to the position's own TTL.
pub fn fingerprint(queue: &str, fph: &str) -> String {
    format!("wr:q:{queue}:fp:{fph}")
}

/// Active sessions per queue: ordered-set, session id -> expires-at (seconds).
pub fn sessions(queue: &str) -> String {
    format!("wr:q:{queue}:sessions")
}

/// Admission bucket hash: `tokens`, `refilled_at`.
pub fn bucket(queue: &str) -> String {
    format!("wr:q:{queue}:bucket")
}

/// Position metadata hash.
pub fn position(id: &str) -> String {
    format!("wr:pos:{id}")
}

/// Active-session record hash.
pub fn session(id: &str) -> String {
    format!("wr:sess:{id}")
}

/// Revocation index entry, TTL-bound to the credential's remaining lifetime.
pub fn revocation(jti: &str) -> String {
    format!("wr:revoked:{jti}")
}

/// Gateway rate-limit window counter for one fingerprint.
pub fn rate_limit(fph: &str) -> String {
    format!("wr:rl:{fph}")
}
