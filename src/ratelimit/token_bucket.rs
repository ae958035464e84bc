//! Token bucket admission algorithm.
//!
//! Each `(client_id, limit_key)` pair owns a bucket holding up to `rate`
//! tokens that refill continuously at `rate / window` tokens per second.
//! A check consumes `cost` tokens if enough are present. The whole
//! read-refill-consume cycle runs inside one script so replicas cannot
//! interleave, and `now` comes from the store's own clock to keep refill
//! math immune to replica clock skew.

use std::sync::Arc;

use async_trait::async_trait;

use crate::store::{RedisStore, ScriptHandle, StoreError};

use super::algorithm::{Decision, RateLimitAlgorithm, ScriptReply};
use super::rules::Rule;

/// KEYS[1] = bucket key; ARGV = {capacity, window, cost}.
/// State is a hash of `tokens` and `ts` (last refill, seconds). The key
/// expires after two idle windows.
const SCRIPT: &str = r#"
local capacity = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local cost = tonumber(ARGV[3])
local time = redis.call('TIME')
local now = tonumber(time[1]) + tonumber(time[2]) / 1000000
local refill_rate = capacity / window

local state = redis.call('HMGET', KEYS[1], 'tokens', 'ts')
local tokens = capacity
if state[1] then
  local elapsed = math.max(0, now - tonumber(state[2]))
  tokens = math.min(capacity, tonumber(state[1]) + elapsed * refill_rate)
end

local allowed = 0
local retry_after_ms = 0
local reset_at
if tokens >= cost then
  allowed = 1
  tokens = tokens - cost
  reset_at = now + (capacity - tokens) / refill_rate
else
  retry_after_ms = math.ceil((cost - tokens) / refill_rate * 1000)
  reset_at = now + (cost - tokens) / refill_rate
end

redis.call('HSET', KEYS[1], 'tokens', tokens, 'ts', now)
redis.call('EXPIRE', KEYS[1], 2 * window)
return {allowed, math.floor(tokens), retry_after_ms, tostring(reset_at)}
"#;

pub struct TokenBucketLimiter {
    store: Arc<RedisStore>,
    script: ScriptHandle,
}

impl TokenBucketLimiter {
    pub fn new(store: Arc<RedisStore>) -> Self {
        Self {
            store,
            script: ScriptHandle::new(SCRIPT),
        }
    }

    fn bucket_key(client_id: &str, limit_key: &str) -> String {
        format!("rl:tb:{client_id}:{limit_key}")
    }
}

#[async_trait]
impl RateLimitAlgorithm for TokenBucketLimiter {
    async fn check(
        &self,
        client_id: &str,
        limit_key: &str,
        cost: u64,
        rule: &Rule,
    ) -> Result<Decision, StoreError> {
        let key = Self::bucket_key(client_id, limit_key);
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_key_layout() {
        assert_eq!(
            TokenBucketLimiter::bucket_key("client_a", "login"),
            "rl:tb:client_a:login"
        );
    }
}
