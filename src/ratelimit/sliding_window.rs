//! Sliding window admission algorithm.
//!
//! Tracks the timestamp of every admitted unit in a sorted set scored by
//! time. A check first purges entries older than `now - window` (on every
//! call, admitted or not, so the set stays bounded), then admits if the
//! remaining entries plus `cost` fit under the rate. This closes the
//! boundary-burst hole of the fixed window at the price of one set entry per
//! admitted unit.

use std::sync::Arc;

use async_trait::async_trait;

use crate::store::{RedisStore, ScriptHandle, StoreError};

use super::algorithm::{Decision, RateLimitAlgorithm, ScriptReply};
use super::rules::Rule;

/// KEYS[1] = sorted-set key; ARGV = {rate, window, cost}.
/// Members are `"{ts}:{i}"` with a per-invocation counter `i`, since the
/// set rejects duplicate members. On denial the oldest surviving entry
/// dates the retry hint.
const SCRIPT: &str = r#"
local rate = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local cost = tonumber(ARGV[3])
local time = redis.call('TIME')
local now = tonumber(time[1]) + tonumber(time[2]) / 1000000
local cutoff = now - window

redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', cutoff)
local used = redis.call('ZCARD', KEYS[1])

if used + cost <= rate then
  for i = 0, cost - 1 do
    redis.call('ZADD', KEYS[1], now, tostring(now) .. ':' .. i)
  end
  redis.call('EXPIRE', KEYS[1], 2 * window)
  return {1, rate - (used + cost), 0, tostring(now + window)}
end

local reset_at = now + window
local oldest = redis.call('ZRANGE', KEYS[1], 0, 0, 'WITHSCORES')
if oldest[2] then
  reset_at = tonumber(oldest[2]) + window
end
redis.call('EXPIRE', KEYS[1], 2 * window)
local retry_after_ms = math.ceil((reset_at - now) * 1000)
return {0, math.max(0, rate - used), retry_after_ms, tostring(reset_at)}
"#;

pub struct SlidingWindowLimiter {
    store: Arc<RedisStore>,
    script: ScriptHandle,
}

impl SlidingWindowLimiter {
    pub fn new(store: Arc<RedisStore>) -> Self {
        Self {
            store,
            script: ScriptHandle::new(SCRIPT),
        }
    }

    fn set_key(client_id: &str, limit_key: &str) -> String {
        format!("rl:sw:{client_id}:{limit_key}")
    }
}

#[async_trait]
impl RateLimitAlgorithm for SlidingWindowLimiter {
    async fn check(
        &self,
        client_id: &str,
        limit_key: &str,
        cost: u64,
        rule: &Rule,
    ) -> Result<Decision, StoreError> {
        let key = Self::set_key(client_id, limit_key);
        let reply: ScriptReply = self
            .store
            .eval_script(
                &self.script,
                &[&key],
                &[
                    rule.rate.to_string(),
                    rule.window.to_string(),
                    cost.to_string(),
                ],
            )
            .await?;
        Decision::from_script_reply(reply)
    }

    async fn register(&self) -> Result<(), StoreError> {
        self.store.register_script(&self.script).await
    }
}
