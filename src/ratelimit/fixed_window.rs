//! Fixed window admission algorithm.
//!
//! Requests are counted in aligned windows of `window` seconds; the counter
//! key embeds the window index and expires with the window. Rejections hand
//! their units back, so a burst of denials cannot consume quota. Up to
//! `2 * rate` requests can pass in a span straddling a window boundary; that
//! is inherent to the algorithm, not a defect. The window index is computed
//! from the store's clock inside the script, so all replicas agree on the
//! boundary.

use std::sync::Arc;

use async_trait::async_trait;

use crate::store::{RedisStore, ScriptHandle, StoreError};

use super::algorithm::{Decision, RateLimitAlgorithm, ScriptReply};
use super::rules::Rule;

/// KEYS[1] = counter key prefix; ARGV = {rate, window, cost}.
/// The full key is `prefix:{floor(now / window)}`.
const SCRIPT: &str = r#"
local rate = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local cost = tonumber(ARGV[3])
local time = redis.call('TIME')
local now = tonumber(time[1]) + tonumber(time[2]) / 1000000
local index = math.floor(now / window)
local key = KEYS[1] .. ':' .. index
local reset_at = (index + 1) * window

local count = redis.call('INCRBY', key, cost)
if count == cost then
  redis.call('EXPIRE', key, window)
end

if count <= rate then
  return {1, rate - count, 0, tostring(reset_at)}
end

redis.call('DECRBY', key, cost)
local used = count - cost
local remaining = math.max(0, rate - used)
local retry_after_ms = math.ceil((reset_at - now) * 1000)
return {0, remaining, retry_after_ms, tostring(reset_at)}
"#;

pub struct FixedWindowLimiter {
    store: Arc<RedisStore>,
    script: ScriptHandle,
}

impl FixedWindowLimiter {
    pub fn new(store: Arc<RedisStore>) -> Self {
        Self {
            store,
            script: ScriptHandle::new(SCRIPT),
        }
    }

    fn counter_key_prefix(client_id: &str, limit_key: &str) -> String {
        format!("rl:fw:{client_id}:{limit_key}")
    }
}

#[async_trait]
impl RateLimitAlgorithm for FixedWindowLimiter {
    async fn check(
        &self,
        client_id: &str,
        limit_key: &str,
        cost: u64,
        rule: &Rule,
    ) -> Result<Decision, StoreError> {
        let prefix = Self::counter_key_prefix(client_id, limit_key);
        let reply: ScriptReply = self
            .store
            .eval_script(
                &self.script,
                &[&prefix],
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
    fn test_counter_key_prefix_layout() {
        assert_eq!(
            FixedWindowLimiter::counter_key_prefix("client_b", "global"),
            "rl:fw:client_b:global"
        );
    }
}
