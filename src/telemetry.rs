//! Prometheus metrics for the admission path.
//!
//! The coordinator and breaker only see the hook methods here; the exporter
//! is whatever serves the registry. Handing a throwaway registry to
//! [`Metrics::new`] turns every hook into a no-op.

use prometheus::{Histogram, HistogramOpts, IntCounterVec, Opts, Registry};

use crate::store::BreakerState;

/// Telemetry hooks for the check path. All methods are infallible.
pub struct Metrics {
    allowed: IntCounterVec,
    blocked: IntCounterVec,
    store_errors: IntCounterVec,
    check_duration: Histogram,
    breaker_transitions: IntCounterVec,
}

impl Metrics {
    /// Create the collectors and register them with `registry`.
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let allowed = IntCounterVec::new(
            Opts::new("ratelimiter_allowed_total", "Total allowed requests"),
            &["client_id", "limit_key"],
        )?;
        let blocked = IntCounterVec::new(
            Opts::new("ratelimiter_blocked_total", "Total blocked requests"),
            &["client_id", "limit_key"],
        )?;
        let store_errors = IntCounterVec::new(
            Opts::new(
                "ratelimiter_store_errors_total",
                "Total backing store errors",
            ),
            &["operation"],
        )?;
        let check_duration = Histogram::with_opts(
            HistogramOpts::new(
                "ratelimiter_check_duration_seconds",
                "Rate limit check duration",
            )
            .buckets(vec![
                0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
            ]),
        )?;
        let breaker_transitions = IntCounterVec::new(
            Opts::new(
                "ratelimiter_circuit_transitions_total",
                "Circuit breaker state transitions",
            ),
            &["state"],
        )?;

        registry.register(Box::new(allowed.clone()))?;
        registry.register(Box::new(blocked.clone()))?;
        registry.register(Box::new(store_errors.clone()))?;
        registry.register(Box::new(check_duration.clone()))?;
        registry.register(Box::new(breaker_transitions.clone()))?;

        Ok(Self {
            allowed,
            blocked,
            store_errors,
            check_duration,
            breaker_transitions,
        })
    }

    pub fn record_allowed(&self, client_id: &str, limit_key: &str) {
        self.allowed.with_label_values(&[client_id, limit_key]).inc();
    }

    pub fn record_blocked(&self, client_id: &str, limit_key: &str) {
        self.blocked.with_label_values(&[client_id, limit_key]).inc();
    }

    pub fn record_store_error(&self, operation: &str) {
        self.store_errors.with_label_values(&[operation]).inc();
    }

    pub fn observe_check_duration(&self, seconds: f64) {
        self.check_duration.observe(seconds);
    }

    pub fn record_breaker_transition(&self, state: BreakerState) {
        self.breaker_transitions
            .with_label_values(&[state.as_str()])
            .inc();
    }
}
