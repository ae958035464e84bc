//! Admission algorithm contract.
//!
//! The three algorithms are interchangeable behind [`RateLimitAlgorithm`]:
//! each decides one check by running a single atomic script against the
//! backing store, so concurrent replicas serialise on the store rather than
//! racing separate read and write calls.

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::AlgorithmKind;
use crate::store::{RedisStore, StoreError};

use super::fixed_window::FixedWindowLimiter;
use super::rules::Rule;
use super::sliding_window::SlidingWindowLimiter;
use super::token_bucket::TokenBucketLimiter;

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
    pub allowed: bool,
    /// Quota units left in the current window
    pub remaining: u64,
    /// Milliseconds to wait before retrying; 0 when allowed
    pub retry_after_ms: u64,
    /// Seconds since epoch at which the limit resets (store server clock)
    pub reset_at: f64,
}

/// Wire shape of every algorithm script reply:
/// `{allowed, remaining, retry_after_ms, tostring(reset_at)}`. The reset
/// timestamp travels as a string because the store truncates script numbers
/// to integers.
pub(super) type ScriptReply = (i64, i64, i64, String);

impl Decision {
    pub(super) fn from_script_reply(reply: ScriptReply) -> Result<Self, StoreError> {
        let (allowed, remaining, retry_after_ms, reset_at) = reply;
        let reset_at = reset_at.parse::<f64>().map_err(|_| {
            StoreError::Protocol(format!("bad reset_at in script reply: {reset_at:?}"))
        })?;
        Ok(Self {
            allowed: allowed == 1,
            remaining: remaining.max(0) as u64,
            retry_after_ms: retry_after_ms.max(0) as u64,
            reset_at,
        })
    }
}

/// Trait for admission algorithm implementations.
///
/// Implementations must perform the whole read-modify-write in one script
/// invocation and must propagate [`StoreError`] untouched; the check
/// coordinator is the sole place that converts store failures into a
/// fail-open or fail-closed outcome.
#[async_trait]
pub trait RateLimitAlgorithm: Send + Sync {
    /// Decide whether a request costing `cost` units is admitted.
    async fn check(
        &self,
        client_id: &str,
        limit_key: &str,
        cost: u64,
        rule: &Rule,
    ) -> Result<Decision, StoreError>;

    /// Register the algorithm's script with the store.
    ///
    /// Called once at startup; safe to skip since the script is also loaded
    /// on first use.
    async fn register(&self) -> Result<(), StoreError>;
}

/// Build the configured algorithm on top of `store`.
pub fn build_algorithm(kind: AlgorithmKind, store: Arc<RedisStore>) -> Arc<dyn RateLimitAlgorithm> {
    match kind {
        AlgorithmKind::TokenBucket => Arc::new(TokenBucketLimiter::new(store)),
        AlgorithmKind::FixedWindow => Arc::new(FixedWindowLimiter::new(store)),
        AlgorithmKind::SlidingWindow => Arc::new(SlidingWindowLimiter::new(store)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decision_from_script_reply() {
        let decision =
            Decision::from_script_reply((1, 4, 0, "1000.5".to_string())).unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 4);
        assert_eq!(decision.retry_after_ms, 0);
        assert!((decision.reset_at - 1000.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_decision_denied_reply() {
        let decision =
            Decision::from_script_reply((0, 0, 2000, "1002".to_string())).unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.retry_after_ms, 2000);
    }

    #[test]
    fn test_decision_rejects_malformed_reset() {
        let result = Decision::from_script_reply((1, 1, 0, "soon".to_string()));
        assert!(matches!(result, Err(StoreError::Protocol(_))));
    }
}
