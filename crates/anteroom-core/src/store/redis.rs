//! Redis-protocol store backend.
//!
//! Every multi-key atomic operation is a server-side Lua script executed in
//! one round trip; a client-side pipeline cannot preserve the cross-key
//! invariants under concurrent reapers. Scripts address position metadata
//! by id-derived key names, which assumes a single (non-cluster) store
//! node, the deployment model of this system.
//!
//! Transient failures (IO, timeouts, dropped connections) are retried here
//! with bounded backoff; callers only ever see them after the budget is
//! spent. Every call runs under the adapter deadline.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, FromRedisValue, Script};
use tracing::{debug, warn};

use super::keys;
use super::{EnqueueOutcome, NewPosition, RankSnapshot, Store, TouchOutcome};
use crate::error::{StoreError, StoreResult};
use crate::position::{Priority, PositionStatus};

/// Per-call deadline. Admission ticks and request handlers budget around it.
const DEFAULT_DEADLINE: Duration = Duration::from_millis(500);
/// Transient failures: attempts and first backoff step (doubles per retry,
/// so the whole budget is roughly 25 + 50 + 100 ≈ 250 ms of waiting).
const MAX_ATTEMPTS: u32 = 3;
const RETRY_BASE: Duration = Duration::from_millis(25);

/// Atomic enqueue. KEYS: cfg, rank, live, fingerprint, prio0..prio3.
/// ARGV: id, priority, now_us, now_s, fingerprint, ua_hash, metadata, queue.
const ENQUEUE_SCRIPT: &str = r#"
local state = redis.call('HGET', KEYS[1], 'status')
if not state then return {'unavailable', '', 0, 0} end
if state ~= 'active' then return {'unavailable', state, 0, 0} end

local existing = redis.call('GET', KEYS[4])
if existing then
  local meta = 'wr:pos:' .. existing
  if redis.call('HGET', meta, 'status') == 'waiting' then
    local prio = tonumber(redis.call('HGET', meta, 'priority')) or 0
    local rank = 0
    for p = 3, prio + 1, -1 do
      rank = rank + redis.call('LLEN', KEYS[5 + p])
    end
    local idx = redis.call('LPOS', KEYS[5 + prio], existing)
    if idx then rank = rank + idx end
    return {'existing', existing, rank, redis.call('ZCARD', KEYS[2])}
  end
end

local max_size = tonumber(redis.call('HGET', KEYS[1], 'max_size')) or 0
local len = redis.call('ZCARD', KEYS[2])
if max_size > 0 and len >= max_size then
  return {'full', tostring(max_size), 0, 0}
end

local score = tonumber(ARGV[3])
while redis.call('ZCOUNT', KEYS[2], score, score) > 0 do
  score = score + 1
end

local timeout = tonumber(redis.call('HGET', KEYS[1], 'heartbeat_timeout_s')) or 60
local grace = tonumber(redis.call('HGET', KEYS[1], 'grace_period_s')) or 30
local ttl_ms = (timeout + grace) * 1000

local id = ARGV[1]
local prio = tonumber(ARGV[2])
redis.call('RPUSH', KEYS[5 + prio], id)
redis.call('ZADD', KEYS[2], score, id)
redis.call('ZADD', KEYS[3], tonumber(ARGV[4]), id)

local meta = 'wr:pos:' .. id
redis.call('HSET', meta,
  'queue_id', ARGV[8],
  'priority', ARGV[2],
  'status', 'waiting',
  'enqueued_at_us', string.format('%.0f', score),
  'heartbeat_at_s', ARGV[4],
  'fingerprint', ARGV[5],
  'ttl_s', tostring(timeout + grace),
  'grace_s', tostring(grace))
if ARGV[6] ~= '' then redis.call('HSET', meta, 'ua_hash', ARGV[6]) end
if ARGV[7] ~= '' then redis.call('HSET', meta, 'metadata', ARGV[7]) end
redis.call('PEXPIRE', meta, ttl_ms)
redis.call('SET', KEYS[4], id, 'PX', ttl_ms)

local rank = 0
for p = 3, prio + 1, -1 do
  rank = rank + redis.call('LLEN', KEYS[5 + p])
end
rank = rank + redis.call('LLEN', KEYS[5 + prio]) - 1
return {'created', id, rank, redis.call('ZCARD', KEYS[2])}
"#;

/// Atomic dequeue, priorities 3 -> 0. KEYS: rank, live, prio3..prio0.
/// ARGV: now_s, fingerprint key prefix.
const DEQUEUE_SCRIPT: &str = r#"
for i = 3, 6 do
  local id = redis.call('LPOP', KEYS[i])
  if id then
    redis.call('ZREM', KEYS[1], id)
    redis.call('ZREM', KEYS[2], id)
    local meta = 'wr:pos:' .. id
    if redis.call('EXISTS', meta) == 1 then
      local fph = redis.call('HGET', meta, 'fingerprint')
      if fph then redis.call('DEL', ARGV[2] .. fph) end
      local grace = tonumber(redis.call('HGET', meta, 'grace_s')) or 30
      redis.call('HSET', meta, 'status', 'admitted', 'admitted_at_s', ARGV[1])
      redis.call('PEXPIRE', meta, grace * 1000)
    end
    return id
  end
end
return false
"#;

/// Atomic heartbeat. KEYS: position metadata. ARGV: now_s, position id.
const TOUCH_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then return {'missing', '', ''} end
local status = redis.call('HGET', KEYS[1], 'status')
local q = redis.call('HGET', KEYS[1], 'queue_id') or ''
if status == 'waiting' then
  local ttl = tonumber(redis.call('HGET', KEYS[1], 'ttl_s')) or 90
  redis.call('HSET', KEYS[1], 'heartbeat_at_s', ARGV[1])
  redis.call('ZADD', 'wr:q:' .. q .. ':live', tonumber(ARGV[1]), ARGV[2])
  redis.call('PEXPIRE', KEYS[1], ttl * 1000)
  local fph = redis.call('HGET', KEYS[1], 'fingerprint')
  if fph then redis.call('PEXPIRE', 'wr:q:' .. q .. ':fp:' .. fph, ttl * 1000) end
  return {'waiting', q, ''}
elseif status == 'admitted' then
  return {'admitted', q, redis.call('HGET', KEYS[1], 'session_id') or ''}
elseif status == 'cancelled' then
  return {'cancelled', q, ''}
else
  return {'expired', q, ''}
end
"#;

/// Atomic cancel. KEYS: position metadata. ARGV: position id.
const CANCEL_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then return false end
if redis.call('HGET', KEYS[1], 'status') ~= 'waiting' then return false end
local q = redis.call('HGET', KEYS[1], 'queue_id')
local prio = redis.call('HGET', KEYS[1], 'priority') or '0'
local grace = tonumber(redis.call('HGET', KEYS[1], 'grace_s')) or 30
redis.call('LREM', 'wr:q:' .. q .. ':prio:' .. prio, 1, ARGV[1])
redis.call('ZREM', 'wr:q:' .. q .. ':rank', ARGV[1])
redis.call('ZREM', 'wr:q:' .. q .. ':live', ARGV[1])
local fph = redis.call('HGET', KEYS[1], 'fingerprint')
if fph then redis.call('DEL', 'wr:q:' .. q .. ':fp:' .. fph) end
redis.call('HSET', KEYS[1], 'status', 'cancelled')
redis.call('PEXPIRE', KEYS[1], grace * 1000)
return q
"#;

/// Reaper expiry. The score re-check against the cutoff makes a racing
/// heartbeat win; only the caller whose ZREM lands owns the expiry event.
/// KEYS: live, rank, position metadata.
/// ARGV: position id, cutoff_s, now_s, priority-list key prefix.
const EXPIRE_SCRIPT: &str = r#"
local score = redis.call('ZSCORE', KEYS[1], ARGV[1])
if not score or tonumber(score) > tonumber(ARGV[2]) then return 0 end
redis.call('ZREM', KEYS[1], ARGV[1])
local prio = redis.call('HGET', KEYS[3], 'priority') or '0'
local grace = tonumber(redis.call('HGET', KEYS[3], 'grace_s')) or 30
redis.call('LREM', ARGV[4] .. prio, 1, ARGV[1])
redis.call('ZREM', KEYS[2], ARGV[1])
if redis.call('EXISTS', KEYS[3]) == 1 then
  redis.call('HSET', KEYS[3], 'status', 'expired', 'expired_at_s', ARGV[3],
    'expire_reason', 'heartbeat-timeout')
  redis.call('PEXPIRE', KEYS[3], grace * 1000)
end
return 1
"#;

/// Rank lookup: whole backlogs of higher priorities, then the FIFO index
/// within the position's own level. KEYS: position metadata. ARGV: id.
const RANK_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then return false end
local q = redis.call('HGET', KEYS[1], 'queue_id') or ''
local status = redis.call('HGET', KEYS[1], 'status') or 'expired'
local prio = tonumber(redis.call('HGET', KEYS[1], 'priority')) or 0
local len = redis.call('ZCARD', 'wr:q:' .. q .. ':rank')
local rank = 0
if status == 'waiting' then
  for p = 3, prio + 1, -1 do
    rank = rank + redis.call('LLEN', 'wr:q:' .. q .. ':prio:' .. p)
  end
  local idx = redis.call('LPOS', 'wr:q:' .. q .. ':prio:' .. prio, ARGV[1])
  if idx then rank = rank + idx end
end
return {status, q, prio, rank, len}
"#;

/// Lazy-refill token bucket. `now` comes from the store's own clock so
/// distributed callers share one time base. State persists only on consume,
/// which keeps fractional accrual for rates below one.
/// KEYS: bucket. ARGV: rate, capacity.
const TRY_ADMIT_SCRIPT: &str = r#"
local t = redis.call('TIME')
local now = tonumber(t[1]) + tonumber(t[2]) / 1000000
local rate = tonumber(ARGV[1])
local cap = tonumber(ARGV[2])
local tokens = tonumber(redis.call('HGET', KEYS[1], 'tokens')) or cap
local last = tonumber(redis.call('HGET', KEYS[1], 'refilled_at')) or now
local refill = math.floor(math.max(0, now - last) * rate)
tokens = math.min(cap, tokens + refill)
if tokens >= 1 then
  redis.call('HSET', KEYS[1], 'tokens', tostring(tokens - 1),
    'refilled_at', string.format('%.6f', now))
  return 1
end
return 0
"#;

/// Admission rollback, clamped at capacity. KEYS: bucket. ARGV: capacity.
const RETURN_TOKEN_SCRIPT: &str = r#"
local cap = tonumber(ARGV[1])
local tokens = tonumber(redis.call('HGET', KEYS[1], 'tokens')) or cap
redis.call('HSET', KEYS[1], 'tokens', tostring(math.min(cap, tokens + 1)))
if not redis.call('HGET', KEYS[1], 'refilled_at') then
  local t = redis.call('TIME')
  redis.call('HSET', KEYS[1], 'refilled_at',
    string.format('%.6f', tonumber(t[1]) + tonumber(t[2]) / 1000000))
end
return 1
"#;

/// Compare-and-set. ARGV: has_expected flag, expected, new.
const CAS_SCRIPT: &str = r#"
local cur = redis.call('GET', KEYS[1])
if ARGV[1] == '0' then
  if cur then return 0 end
elseif cur ~= ARGV[2] then
  return 0
end
redis.call('SET', KEYS[1], ARGV[3])
return 1
"#;

struct Scripts {
    enqueue: Script,
    dequeue: Script,
    touch: Script,
    cancel: Script,
    expire: Script,
    rank: Script,
    try_admit: Script,
    return_token: Script,
    cas: Script,
}

impl Scripts {
    fn new() -> Self {
        Self {
            enqueue: Script::new(ENQUEUE_SCRIPT),
            dequeue: Script::new(DEQUEUE_SCRIPT),
            touch: Script::new(TOUCH_SCRIPT),
            cancel: Script::new(CANCEL_SCRIPT),
            expire: Script::new(EXPIRE_SCRIPT),
            rank: Script::new(RANK_SCRIPT),
            try_admit: Script::new(TRY_ADMIT_SCRIPT),
            return_token: Script::new(RETURN_TOKEN_SCRIPT),
            cas: Script::new(CAS_SCRIPT),
        }
    }
}

/// Redis-backed implementation of [`Store`].
pub struct RedisStore {
    conn: ConnectionManager,
    scripts: Scripts,
    deadline: Duration,
}

impl RedisStore {
    /// Connect with the default per-call deadline.
    pub async fn connect(url: &str) -> StoreResult<Self> {
        Self::connect_with_deadline(url, DEFAULT_DEADLINE).await
    }

    pub async fn connect_with_deadline(url: &str, deadline: Duration) -> StoreResult<Self> {
        let client =
            Client::open(url).map_err(|e| StoreError::Fatal(format!("store url: {e}")))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::Transient(format!("store connect: {e}")))?;
        Ok(Self {
            conn,
            scripts: Scripts::new(),
            deadline,
        })
    }

    async fn run_cmd<T: FromRedisValue>(&self, cmd: &redis::Cmd) -> StoreResult<T> {
        let mut delay = RETRY_BASE;
        for attempt in 1..=MAX_ATTEMPTS {
            let mut conn = self.conn.clone();
            let outcome: Result<Result<T, redis::RedisError>, _> =
                tokio::time::timeout(self.deadline, cmd.query_async(&mut conn)).await;
            match outcome {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(err)) if is_transient(&err) && attempt < MAX_ATTEMPTS => {
                    debug!(%err, attempt, "transient store error, retrying");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Ok(Err(err)) => return Err(classify(err)),
                Err(_) if attempt < MAX_ATTEMPTS => {
                    debug!(attempt, "store call exceeded deadline, retrying");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(_) => {
                    return Err(StoreError::Transient(format!(
                        "store call exceeded {:?} deadline",
                        self.deadline
                    )))
                }
            }
        }
        unreachable!("retry loop returns on final attempt")
    }

    async fn run_script<T: FromRedisValue>(
        &self,
        invocation: &redis::ScriptInvocation<'_>,
    ) -> StoreResult<T> {
        let mut delay = RETRY_BASE;
        for attempt in 1..=MAX_ATTEMPTS {
            let mut conn = self.conn.clone();
            let outcome: Result<Result<T, redis::RedisError>, _> =
                tokio::time::timeout(self.deadline, invocation.invoke_async(&mut conn)).await;
            match outcome {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(err)) if is_transient(&err) && attempt < MAX_ATTEMPTS => {
                    debug!(%err, attempt, "transient script error, retrying");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Ok(Err(err)) => return Err(classify(err)),
                Err(_) if attempt < MAX_ATTEMPTS => {
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(_) => {
                    return Err(StoreError::Transient(format!(
                        "script exceeded {:?} deadline",
                        self.deadline
                    )))
                }
            }
        }
        unreachable!("retry loop returns on final attempt")
    }
}

fn is_transient(err: &redis::RedisError) -> bool {
    err.is_io_error()
        || err.is_timeout()
        || err.is_connection_dropped()
        || matches!(
            err.kind(),
            redis::ErrorKind::TryAgain | redis::ErrorKind::BusyLoadingError
        )
}

fn classify(err: redis::RedisError) -> StoreError {
    if is_transient(&err) {
        StoreError::Transient(err.to_string())
    } else {
        StoreError::Fatal(err.to_string())
    }
}

fn fmt_score(score: f64) -> String {
    if score == f64::NEG_INFINITY {
        "-inf".to_string()
    } else if score == f64::INFINITY {
        "+inf".to_string()
    } else {
        score.to_string()
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn ping(&self) -> StoreResult<()> {
        let _: String = self.run_cmd(&redis::cmd("PING")).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.run_cmd(redis::cmd("GET").arg(key)).await
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        self.run_cmd::<()>(
            redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("PX")
                .arg(ttl.as_millis() as u64),
        )
        .await
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
    ) -> StoreResult<bool> {
        let mut invocation = self.scripts.cas.prepare_invoke();
        invocation
            .key(key)
            .arg(if expected.is_some() { "1" } else { "0" })
            .arg(expected.unwrap_or(""))
            .arg(new);
        let swapped: i64 = self.run_script(&invocation).await?;
        Ok(swapped == 1)
    }

    async fn increment(&self, key: &str, delta: i64) -> StoreResult<i64> {
        self.run_cmd(redis::cmd("INCRBY").arg(key).arg(delta)).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        self.run_cmd(
            redis::cmd("PEXPIRE")
                .arg(key)
                .arg(ttl.as_millis() as u64),
        )
        .await
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let removed: i64 = self.run_cmd(redis::cmd("DEL").arg(key)).await?;
        Ok(removed > 0)
    }

    async fn add_ordered(&self, key: &str, member: &str, score: f64) -> StoreResult<bool> {
        let added: i64 = self
            .run_cmd(redis::cmd("ZADD").arg(key).arg(score).arg(member))
            .await?;
        Ok(added == 1)
    }

    async fn remove_ordered(&self, key: &str, member: &str) -> StoreResult<bool> {
        let removed: i64 = self.run_cmd(redis::cmd("ZREM").arg(key).arg(member)).await?;
        Ok(removed == 1)
    }

    async fn remove_ordered_below(&self, key: &str, max_score: f64) -> StoreResult<u64> {
        self.run_cmd(
            redis::cmd("ZREMRANGEBYSCORE")
                .arg(key)
                .arg("-inf")
                .arg(fmt_score(max_score)),
        )
        .await
    }

    async fn rank(&self, key: &str, member: &str) -> StoreResult<Option<u64>> {
        let rank: Option<i64> = self
            .run_cmd(redis::cmd("ZRANK").arg(key).arg(member))
            .await?;
        Ok(rank.map(|r| r as u64))
    }

    async fn length(&self, key: &str) -> StoreResult<u64> {
        self.run_cmd(redis::cmd("ZCARD").arg(key)).await
    }

    async fn range_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: usize,
    ) -> StoreResult<Vec<String>> {
        self.run_cmd(
            redis::cmd("ZRANGEBYSCORE")
                .arg(key)
                .arg(fmt_score(min))
                .arg(fmt_score(max))
                .arg("LIMIT")
                .arg(0)
                .arg(limit as u64),
        )
        .await
    }

    async fn left_push(&self, key: &str, member: &str) -> StoreResult<u64> {
        self.run_cmd(redis::cmd("LPUSH").arg(key).arg(member)).await
    }

    async fn right_push(&self, key: &str, member: &str) -> StoreResult<u64> {
        self.run_cmd(redis::cmd("RPUSH").arg(key).arg(member)).await
    }

    async fn left_pop(&self, key: &str) -> StoreResult<Option<String>> {
        self.run_cmd(redis::cmd("LPOP").arg(key)).await
    }

    async fn list_len(&self, key: &str) -> StoreResult<u64> {
        self.run_cmd(redis::cmd("LLEN").arg(key)).await
    }

    async fn hash_set(&self, key: &str, fields: &[(&str, String)]) -> StoreResult<()> {
        let mut cmd = redis::cmd("HSET");
        cmd.arg(key);
        for (field, value) in fields {
            cmd.arg(*field).arg(value);
        }
        self.run_cmd::<()>(&cmd).await
    }

    async fn hash_get(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        self.run_cmd(redis::cmd("HGET").arg(key).arg(field)).await
    }

    async fn hash_get_all(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        self.run_cmd(redis::cmd("HGETALL").arg(key)).await
    }

    async fn hash_increment(&self, key: &str, field: &str, delta: i64) -> StoreResult<i64> {
        self.run_cmd(redis::cmd("HINCRBY").arg(key).arg(field).arg(delta))
            .await
    }

    async fn enqueue_position(&self, new: &NewPosition) -> StoreResult<EnqueueOutcome> {
        let queue = new.queue_id.as_str();
        let mut invocation = self.scripts.enqueue.prepare_invoke();
        invocation
            .key(keys::queue_cfg(queue))
            .key(keys::rank(queue))
            .key(keys::liveness(queue))
            .key(keys::fingerprint(queue, &new.fingerprint))
            .key(keys::priority_list(queue, 0))
            .key(keys::priority_list(queue, 1))
            .key(keys::priority_list(queue, 2))
            .key(keys::priority_list(queue, 3))
            .arg(&new.position_id)
            .arg(new.priority.as_u8())
            .arg(new.now_us)
            .arg(new.now_s)
            .arg(&new.fingerprint)
            .arg(new.ua_hash.as_deref().unwrap_or(""))
            .arg(new.metadata.as_deref().unwrap_or(""))
            .arg(queue);

        let (flag, detail, rank, length): (String, String, i64, i64) =
            self.run_script(&invocation).await?;
        let outcome = match flag.as_str() {
            "created" => EnqueueOutcome::Created {
                position_id: detail,
                rank: rank.max(0) as u64,
                queue_length: length.max(0) as u64,
            },
            "existing" => EnqueueOutcome::Existing {
                position_id: detail,
                rank: rank.max(0) as u64,
                queue_length: length.max(0) as u64,
            },
            "full" => EnqueueOutcome::Full {
                max_size: detail.parse().unwrap_or(0),
            },
            "unavailable" => EnqueueOutcome::Unavailable {
                state: if detail.is_empty() { None } else { Some(detail) },
            },
            other => {
                warn!(flag = %other, "enqueue script returned unknown flag");
                return Err(StoreError::Fatal(format!("enqueue flag: {other}")));
            }
        };
        Ok(outcome)
    }

    async fn dequeue_position(&self, queue_id: &str, now_s: u64) -> StoreResult<Option<String>> {
        let mut invocation = self.scripts.dequeue.prepare_invoke();
        invocation
            .key(keys::rank(queue_id))
            .key(keys::liveness(queue_id))
            .key(keys::priority_list(queue_id, 3))
            .key(keys::priority_list(queue_id, 2))
            .key(keys::priority_list(queue_id, 1))
            .key(keys::priority_list(queue_id, 0))
            .arg(now_s)
            .arg(format!("wr:q:{queue_id}:fp:"));
        self.run_script(&invocation).await
    }

    async fn touch_position(&self, position_id: &str, now_s: u64) -> StoreResult<TouchOutcome> {
        let mut invocation = self.scripts.touch.prepare_invoke();
        invocation
            .key(keys::position(position_id))
            .arg(now_s)
            .arg(position_id);
        let (status, queue_id, session_id): (String, String, String) =
            self.run_script(&invocation).await?;
        Ok(match status.as_str() {
            "waiting" => TouchOutcome::Waiting { queue_id },
            "admitted" => TouchOutcome::Admitted {
                queue_id,
                session_id: if session_id.is_empty() {
                    None
                } else {
                    Some(session_id)
                },
            },
            "cancelled" => TouchOutcome::Cancelled,
            "missing" => TouchOutcome::Missing,
            _ => TouchOutcome::Expired,
        })
    }

    async fn cancel_position(&self, position_id: &str) -> StoreResult<Option<String>> {
        let mut invocation = self.scripts.cancel.prepare_invoke();
        invocation.key(keys::position(position_id)).arg(position_id);
        self.run_script(&invocation).await
    }

    async fn expire_position(
        &self,
        queue_id: &str,
        position_id: &str,
        cutoff_s: u64,
        now_s: u64,
    ) -> StoreResult<bool> {
        let mut invocation = self.scripts.expire.prepare_invoke();
        invocation
            .key(keys::liveness(queue_id))
            .key(keys::rank(queue_id))
            .key(keys::position(position_id))
            .arg(position_id)
            .arg(cutoff_s)
            .arg(now_s)
            .arg(format!("wr:q:{queue_id}:prio:"));
        let removed: i64 = self.run_script(&invocation).await?;
        Ok(removed == 1)
    }

    async fn position_rank(&self, position_id: &str) -> StoreResult<Option<RankSnapshot>> {
        let mut invocation = self.scripts.rank.prepare_invoke();
        invocation.key(keys::position(position_id)).arg(position_id);
        let row: Option<(String, String, i64, i64, i64)> = self.run_script(&invocation).await?;
        Ok(row.map(|(status, queue_id, priority, rank, length)| RankSnapshot {
            queue_id,
            priority: Priority::try_from(priority.clamp(0, 3) as u8)
                .unwrap_or(Priority::Normal),
            status: PositionStatus::parse(&status).unwrap_or(PositionStatus::Expired),
            rank: rank.max(0) as u64,
            queue_length: length.max(0) as u64,
        }))
    }

    async fn try_admit(&self, queue_id: &str, rate: f64, capacity: f64) -> StoreResult<bool> {
        let mut invocation = self.scripts.try_admit.prepare_invoke();
        invocation
            .key(keys::bucket(queue_id))
            .arg(rate)
            .arg(capacity);
        let admitted: i64 = self.run_script(&invocation).await?;
        Ok(admitted == 1)
    }

    async fn return_token(&self, queue_id: &str, capacity: f64) -> StoreResult<()> {
        let mut invocation = self.scripts.return_token.prepare_invoke();
        invocation.key(keys::bucket(queue_id)).arg(capacity);
        let _: i64 = self.run_script(&invocation).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_formatting_handles_infinities() {
        assert_eq!(fmt_score(f64::NEG_INFINITY), "-inf");
        assert_eq!(fmt_score(f64::INFINITY), "+inf");
        assert_eq!(fmt_score(42.0), "42");
    }

    #[test]
    fn scripts_compile_to_nonempty_sources() {
        // Guard against accidental truncation of the embedded sources.
        for script in [
            ENQUEUE_SCRIPT,
            DEQUEUE_SCRIPT,
            TOUCH_SCRIPT,
            CANCEL_SCRIPT,
            EXPIRE_SCRIPT,
            RANK_SCRIPT,
            TRY_ADMIT_SCRIPT,
            RETURN_TOKEN_SCRIPT,
            CAS_SCRIPT,
        ] {
            assert!(script.contains("redis.call"));
        }
    }

    #[test]
    fn bucket_scripts_read_the_store_clock() {
        // The single-clock rule: `now` must come from the server, never the
        // caller.
        assert!(TRY_ADMIT_SCRIPT.contains("redis.call('TIME')"));
        assert!(!TRY_ADMIT_SCRIPT.contains("ARGV[3]"));
    }
}
