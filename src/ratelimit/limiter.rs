//! Check coordinator.
//!
//! Orchestrates a single admission check: validate, resolve the rule,
//! invoke the configured algorithm through the circuit breaker, and apply
//! the fail-mode policy when the store is unreachable. This is the only
//! place store and breaker failures are caught; everything below propagates
//! them untouched.

use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::config::FailMode;
use crate::error::{LimiterError, Result};
use crate::store::{BreakerError, CircuitBreaker, StoreError};
use crate::telemetry::Metrics;

use super::algorithm::{Decision, RateLimitAlgorithm};
use super::rules::{Rule, RuleResolver};

/// A request to check whether a call should be admitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckRequest {
    /// Unique client identifier
    pub client_id: String,
    /// Endpoint or resource name
    #[serde(default = "default_limit_key")]
    pub limit_key: String,
    /// Quota units this request consumes if admitted
    #[serde(default = "default_cost")]
    pub cost: u64,
}

fn default_limit_key() -> String {
    "global".to_string()
}

fn default_cost() -> u64 {
    1
}

/// Outcome of a rate limit check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResponse {
    /// Whether the request is allowed
    pub allowed: bool,
    /// Quota units remaining in the current window
    pub remaining: u64,
    /// Milliseconds to wait before retrying; 0 when allowed
    pub retry_after_ms: u64,
    /// Rate of the rule that was applied
    pub limit: u64,
    /// Window of the rule that was applied, in seconds
    pub window: u64,
    /// Seconds since epoch at which the limit resets
    pub reset_at: f64,
}

/// The core rate limiter: resolves rules and runs admission checks.
///
/// Thread-safe; shared across request handlers behind an [`Arc`].
pub struct RateLimiter {
    algorithm: Arc<dyn RateLimitAlgorithm>,
    resolver: Arc<RuleResolver>,
    breaker: Arc<CircuitBreaker>,
    fail_mode: FailMode,
    metrics: Arc<Metrics>,
}

impl RateLimiter {
    pub fn new(
        algorithm: Arc<dyn RateLimitAlgorithm>,
        resolver: Arc<RuleResolver>,
        breaker: Arc<CircuitBreaker>,
        fail_mode: FailMode,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            algorithm,
            resolver,
            breaker,
            fail_mode,
            metrics,
        }
    }

    /// Check whether the request should be admitted.
    pub async fn check(&self, req: &CheckRequest) -> Result<CheckResponse> {
        let started = Instant::now();
        let result = self.check_inner(req).await;
        self.metrics
            .observe_check_duration(started.elapsed().as_secs_f64());
        result
    }

    async fn check_inner(&self, req: &CheckRequest) -> Result<CheckResponse> {
        if req.client_id.is_empty() {
            return Err(LimiterError::BadRequest(
                "client_id must not be empty".to_string(),
            ));
        }
        if req.cost == 0 {
            return Err(LimiterError::BadRequest("cost must be positive".to_string()));
        }

        let rule = self.resolver.resolve(&req.client_id, &req.limit_key);
        if req.cost > rule.rate {
            return Err(LimiterError::BadRequest(format!(
                "cost {} exceeds the limit of {} and can never be admitted",
                req.cost, rule.rate
            )));
        }

        let outcome = self
            .breaker
            .call(|| {
                self.algorithm
                    .check(&req.client_id, &req.limit_key, req.cost, &rule)
            })
            .await;

        match outcome {
            Ok(decision) => {
                if decision.allowed {
                    self.metrics.record_allowed(&req.client_id, &req.limit_key);
                } else {
                    debug!(
                        client_id = %req.client_id,
                        limit_key = %req.limit_key,
                        retry_after_ms = decision.retry_after_ms,
                        "rate limit exceeded"
                    );
                    self.metrics.record_blocked(&req.client_id, &req.limit_key);
                }
                Ok(Self::respond(decision, &rule))
            }
            Err(err) => self.handle_store_failure(req, &rule, err),
        }
    }

    fn respond(decision: Decision, rule: &Rule) -> CheckResponse {
        CheckResponse {
            allowed: decision.allowed,
            remaining: decision.remaining,
            retry_after_ms: decision.retry_after_ms,
            limit: rule.rate,
            window: rule.window,
            reset_at: decision.reset_at,
        }
    }

    /// Apply the fail-mode policy after a store or breaker failure.
    fn handle_store_failure(
        &self,
        req: &CheckRequest,
        rule: &Rule,
        err: BreakerError<StoreError>,
    ) -> Result<CheckResponse> {
        let operation = if err.is_open() { "breaker_open" } else { "check" };
        self.metrics.record_store_error(operation);

        match self.fail_mode {
            FailMode::Open => {
                warn!(
                    client_id = %req.client_id,
                    error = %err,
                    "store unavailable; failing open"
                );
                self.metrics.record_allowed(&req.client_id, &req.limit_key);
                Ok(CheckResponse {
                    allowed: true,
                    remaining: rule.rate,
                    retry_after_ms: 0,
                    limit: rule.rate,
                    window: rule.window,
                    reset_at: unix_now() + rule.window as f64,
                })
            }
            FailMode::Closed => {
                error!(
                    client_id = %req.client_id,
                    error = %err,
                    "store unavailable; failing closed"
                );
                Err(LimiterError::ServiceUnavailable)
            }
        }
    }
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs_f64()
}
