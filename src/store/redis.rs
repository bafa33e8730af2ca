//! Redis store backend.
//!
//! The whole evaluation runs as one server-side Lua script, so every
//! concurrent request against the same key triple serializes inside Redis
//! and no partial update is ever observable. [`redis::Script`] invokes by
//! SHA after the first load, and the connection manager keeps one long-lived
//! multiplexed connection per process.
//!
//! The script reads the server's own clock (`TIME`); client clocks never
//! enter the arithmetic, which is what keeps a multi-instance fleet
//! consistent.

use super::{RateStore, StoreRequest, StoreResult};
use crate::error::StoreError;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;

// KEYS: 1 bucket, 2 block, 3 violations.
// ARGV: 1 capacity, 2 window secs, 3 cost, 4 violation window secs,
//       5 penalty count, 6.. penalty seconds.
// Reply: { allowed, blocked, remaining (string, keeps float precision),
//          retry_after, reset_after, violations }.
const EVALUATE_SCRIPT: &str = r#"
local block_ttl = redis.call('PTTL', KEYS[2])
if block_ttl > 0 then
  return {0, 1, '-1', math.ceil(block_ttl / 1000), 0, 0}
end

local time = redis.call('TIME')
local now = tonumber(time[1]) + tonumber(time[2]) / 1000000

local capacity = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local cost = tonumber(ARGV[3])
local violation_window = tonumber(ARGV[4])
local penalty_count = tonumber(ARGV[5])

local state = redis.call('HMGET', KEYS[1], 'tokens', 'ts')
local tokens = tonumber(state[1])
local ts = tonumber(state[2])
if tokens == nil then tokens = capacity end
if ts == nil then ts = now end

local delta = now - ts
if delta < 0 then delta = 0 end
local rate = capacity / window
local filled = tokens + delta * rate
if filled > capacity then filled = capacity end

local allowed = filled >= cost
local remaining
if allowed then
  remaining = filled - cost
else
  remaining = filled
end

redis.call('HSET', KEYS[1], 'tokens', tostring(remaining), 'ts', tostring(now))
local bucket_ttl = math.ceil(2 * window)
if bucket_ttl < 1 then bucket_ttl = 1 end
redis.call('EXPIRE', KEYS[1], bucket_ttl)

local reset_after = 0
if rate > 0 then
  reset_after = math.ceil((capacity - remaining) / rate)
end

if allowed then
  return {1, 0, tostring(remaining), 0, reset_after, 0}
end

local violations = 0
if penalty_count > 0 or violation_window > 0 then
  violations = redis.call('INCR', KEYS[3])
  if violation_window > 0 then
    redis.call('EXPIRE', KEYS[3], violation_window)
  end
end

local penalty = 0
if penalty_count > 0 then
  local index = violations
  if index > penalty_count then index = penalty_count end
  penalty = tonumber(ARGV[5 + index])
end

local blocked = 0
if penalty > 0 then
  redis.call('SETEX', KEYS[2], penalty, '1')
  blocked = 1
end

local retry_after
if penalty > 0 then
  retry_after = penalty
elseif rate > 0 then
  retry_after = math.ceil((cost - remaining) / rate)
else
  retry_after = window
end

return {0, blocked, tostring(remaining), retry_after, reset_after, violations}
"#;

/// [`RateStore`] over a shared Redis instance.
#[derive(Clone)]
pub struct RedisStore {
    script: Script,
    connection: ConnectionManager,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").field("connection", &"<ConnectionManager>").finish()
    }
}

impl RedisStore {
    /// Connect to `url` (e.g. `redis://127.0.0.1:6379`).
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client =
            redis::Client::open(url).map_err(|e| StoreError::Transport(e.to_string()))?;
        let connection = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        Ok(Self::with_connection(connection))
    }

    /// Wrap an existing connection manager.
    pub fn with_connection(connection: ConnectionManager) -> Self {
        Self { script: Script::new(EVALUATE_SCRIPT), connection }
    }
}

#[async_trait]
impl RateStore for RedisStore {
    async fn evaluate(&self, request: &StoreRequest) -> Result<StoreResult, StoreError> {
        let mut invocation = self.script.prepare_invoke();
        invocation
            .key(&request.bucket_key)
            .key(&request.block_key)
            .key(&request.violation_key)
            .arg(request.capacity)
            .arg(request.window_secs)
            .arg(request.cost)
            .arg(request.violation_window_secs())
            .arg(request.penalties_secs().len());
        for penalty in request.penalties_secs() {
            invocation.arg(*penalty);
        }

        let mut connection = self.connection.clone();
        let reply: Vec<redis::Value> = invocation
            .invoke_async(&mut connection)
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;

        parse_reply(&reply)
    }
}

fn parse_reply(reply: &[redis::Value]) -> Result<StoreResult, StoreError> {
    if reply.len() < 6 {
        return Err(StoreError::Protocol(format!(
            "expected 6 reply fields, got {}",
            reply.len()
        )));
    }
    Ok(StoreResult {
        allowed: field::<i64>(&reply[0], "allowed")? != 0,
        blocked: field::<i64>(&reply[1], "blocked")? != 0,
        remaining_tokens: field::<f64>(&reply[2], "remaining")?,
        retry_after_secs: unsigned(field::<i64>(&reply[3], "retry_after")?),
        reset_after_secs: unsigned(field::<i64>(&reply[4], "reset_after")?),
        violations: unsigned(field::<i64>(&reply[5], "violations")?),
    })
}

fn field<T: redis::FromRedisValue>(value: &redis::Value, name: &str) -> Result<T, StoreError> {
    redis::from_redis_value(value)
        .map_err(|e| StoreError::Protocol(format!("non-numeric `{name}` field: {e}")))
}

fn unsigned(value: i64) -> u64 {
    value.max(0) as u64
}
