//! Circuit breaker for backing store calls.
//!
//! Protects against cascading failures by failing fast when the store is
//! down instead of paying the timeout on every check. The breaker is a
//! process-lifetime singleton per store; all state lives behind one mutex
//! with short critical sections, and no lock is held across the wrapped
//! store call.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{error, info, warn};

/// Clock abstraction so breaker timing can be driven in tests.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now_millis(&self) -> u64;
}

/// Monotonic clock backed by `Instant::now()`.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    start: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Clock for MonotonicClock {
    fn now_millis(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Normal operation
    Closed,
    /// Failing; calls are rejected without touching the store
    Open,
    /// Testing whether the store recovered
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Error returned by [`CircuitBreaker::call`].
#[derive(Error, Debug)]
pub enum BreakerError<E: std::error::Error> {
    /// The circuit is open; the call was rejected without touching the store.
    #[error("circuit breaker is open; retry in {retry_in_secs}s")]
    Open {
        failure_count: u32,
        retry_in_secs: u64,
    },

    /// The call went through and failed with the wrapped error.
    #[error(transparent)]
    Inner(E),
}

impl<E: std::error::Error> BreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open { .. })
    }
}

/// Observable breaker state for the diagnostics endpoint.
#[derive(Debug, Clone, Copy)]
pub struct BreakerStatus {
    pub state: BreakerState,
    pub failure_count: u32,
    pub seconds_until_retry: u64,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at_millis: u64,
    probe_in_flight: bool,
}

type TransitionHook = Arc<dyn Fn(BreakerState) + Send + Sync>;

/// Three-state circuit breaker wrapping every backing store call.
pub struct CircuitBreaker {
    failure_threshold: u32,
    cooldown: Duration,
    inner: Mutex<BreakerInner>,
    clock: Arc<dyn Clock>,
    on_transition: Option<TransitionHook>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_threshold,
            cooldown,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at_millis: 0,
                probe_in_flight: false,
            }),
            clock: Arc::new(MonotonicClock::default()),
            on_transition: None,
        }
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Install a hook invoked on every state transition. Used to feed the
    /// circuit-state-change telemetry counter; the hook must be infallible.
    pub fn with_transition_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(BreakerState) + Send + Sync + 'static,
    {
        self.on_transition = Some(Arc::new(hook));
        self
    }

    /// Execute `op` under breaker protection.
    ///
    /// CLOSED executes and records the outcome. OPEN rejects immediately
    /// with [`BreakerError::Open`] until the cooldown elapses, then admits a
    /// single probe (HALF_OPEN); concurrent callers during the probe are
    /// rejected. The probe outcome decides between CLOSED and a fresh OPEN.
    pub async fn call<T, E, F, Fut>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        E: std::error::Error,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let probe = self.try_acquire()?;
        let result = op().await;
        match &result {
            Ok(_) => self.on_success(probe),
            Err(_) => self.on_failure(probe),
        }
        result.map_err(BreakerError::Inner)
    }

    /// Current observable state.
    pub fn status(&self) -> BreakerStatus {
        let inner = self.inner.lock();
        let seconds_until_retry = match inner.state {
            BreakerState::Open => {
                let elapsed = self.clock.now_millis().saturating_sub(inner.opened_at_millis);
                (self.cooldown.as_millis() as u64).saturating_sub(elapsed) / 1000
            }
            _ => 0,
        };
        BreakerStatus {
            state: inner.state,
            failure_count: inner.consecutive_failures,
            seconds_until_retry,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    /// Decide whether a call may proceed; returns whether it is the probe.
    fn try_acquire<E: std::error::Error>(&self) -> Result<bool, BreakerError<E>> {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => Ok(false),
            BreakerState::Open => {
                let elapsed = self.clock.now_millis().saturating_sub(inner.opened_at_millis);
                let cooldown_millis = self.cooldown.as_millis() as u64;
                if elapsed >= cooldown_millis {
                    inner.state = BreakerState::HalfOpen;
                    inner.probe_in_flight = true;
                    drop(inner);
                    info!("circuit breaker entering half-open");
                    self.notify(BreakerState::HalfOpen);
                    Ok(true)
                } else {
                    Err(BreakerError::Open {
                        failure_count: inner.consecutive_failures,
                        retry_in_secs: cooldown_millis.saturating_sub(elapsed) / 1000,
                    })
                }
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(BreakerError::Open {
                        failure_count: inner.consecutive_failures,
                        retry_in_secs: 0,
                    })
                } else {
                    inner.probe_in_flight = true;
                    Ok(true)
                }
            }
        }
    }

    fn on_success(&self, probe: bool) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        if probe {
            inner.probe_in_flight = false;
            if inner.state == BreakerState::HalfOpen {
                inner.state = BreakerState::Closed;
                inner.opened_at_millis = 0;
                drop(inner);
                info!("circuit breaker closed; store recovered");
                self.notify(BreakerState::Closed);
            }
        }
    }

    fn on_failure(&self, probe: bool) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures += 1;
        let failures = inner.consecutive_failures;
        if probe {
            inner.probe_in_flight = false;
            inner.state = BreakerState::Open;
            inner.opened_at_millis = self.clock.now_millis();
            drop(inner);
            warn!("circuit breaker probe failed; reopening");
            self.notify(BreakerState::Open);
        } else if inner.state == BreakerState::Closed && failures >= self.failure_threshold {
            inner.state = BreakerState::Open;
            inner.opened_at_millis = self.clock.now_millis();
            drop(inner);
            error!(
                failures,
                threshold = self.failure_threshold,
                "circuit breaker open"
            );
            self.notify(BreakerState::Open);
        }
    }

    fn notify(&self, state: BreakerState) {
        if let Some(hook) = &self.on_transition {
            hook(state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreError;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    #[derive(Debug, Clone)]
    struct ManualClock {
        now: Arc<AtomicU64>,
    }

    impl ManualClock {
        fn new() -> Self {
            Self {
                now: Arc::new(AtomicU64::new(0)),
            }
        }

        fn advance(&self, millis: u64) {
            self.now.fetch_add(millis, Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now_millis(&self) -> u64 {
            self.now.load(Ordering::SeqCst)
        }
    }

    fn store_error() -> StoreError {
        StoreError::Connection("connection refused".to_string())
    }

    #[tokio::test]
    async fn test_starts_closed_and_passes_calls_through() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        let result: Result<u32, _> = breaker.call(|| async { Ok::<_, StoreError>(42) }).await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_opens_after_threshold_failures() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let calls = calls.clone();
            let _ = breaker
                .call(|| async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(store_error())
                })
                .await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(breaker.state(), BreakerState::Open);

        // The next call must be rejected without executing.
        let calls_clone = calls.clone();
        let result = breaker
            .call(|| async move {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                Ok::<_, StoreError>(())
            })
            .await;
        assert!(result.unwrap_err().is_open());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_success_resets_failure_count_in_closed() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(60));

        for _ in 0..2 {
            let _ = breaker.call(|| async { Err::<(), _>(store_error()) }).await;
        }
        let _ = breaker.call(|| async { Ok::<_, StoreError>(()) }).await;

        // Two more failures must not open the circuit after the reset.
        for _ in 0..2 {
            let result = breaker.call(|| async { Err::<(), _>(store_error()) }).await;
            assert!(!result.unwrap_err().is_open());
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_probe_after_cooldown_closes_on_success() {
        let clock = ManualClock::new();
        let breaker =
            CircuitBreaker::new(1, Duration::from_secs(60)).with_clock(clock.clone());

        let _ = breaker.call(|| async { Err::<(), _>(store_error()) }).await;
        assert_eq!(breaker.state(), BreakerState::Open);

        // Still inside the cooldown window.
        let result = breaker.call(|| async { Ok::<_, StoreError>(()) }).await;
        assert!(result.unwrap_err().is_open());

        clock.advance(60_000);

        // Probe is admitted and its success closes the circuit.
        let result = breaker.call(|| async { Ok::<_, StoreError>(7) }).await;
        assert_eq!(result.unwrap(), 7);
        let status = breaker.status();
        assert_eq!(status.state, BreakerState::Closed);
        assert_eq!(status.failure_count, 0);
    }

    #[tokio::test]
    async fn test_probe_failure_reopens_and_resets_cooldown() {
        let clock = ManualClock::new();
        let breaker =
            CircuitBreaker::new(1, Duration::from_secs(60)).with_clock(clock.clone());

        let _ = breaker.call(|| async { Err::<(), _>(store_error()) }).await;
        clock.advance(60_000);
        let _ = breaker.call(|| async { Err::<(), _>(store_error()) }).await;
        assert_eq!(breaker.state(), BreakerState::Open);

        // The cooldown restarted at the probe failure.
        clock.advance(30_000);
        let result = breaker.call(|| async { Ok::<_, StoreError>(()) }).await;
        assert!(result.unwrap_err().is_open());

        clock.advance(30_000);
        let result = breaker.call(|| async { Ok::<_, StoreError>(()) }).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_half_open_admits_single_probe() {
        let clock = ManualClock::new();
        let breaker = Arc::new(
            CircuitBreaker::new(1, Duration::from_secs(60)).with_clock(clock.clone()),
        );

        let _ = breaker.call(|| async { Err::<(), _>(store_error()) }).await;
        clock.advance(60_000);

        // Hold the probe in flight while a second caller arrives.
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let (started_tx, started_rx) = tokio::sync::oneshot::channel::<()>();
        let probe_breaker = breaker.clone();
        let probe = tokio::spawn(async move {
            probe_breaker
                .call(|| async move {
                    let _ = started_tx.send(());
                    let _ = release_rx.await;
                    Ok::<_, StoreError>(())
                })
                .await
        });

        started_rx.await.unwrap();
        let result = breaker.call(|| async { Ok::<_, StoreError>(()) }).await;
        assert!(result.unwrap_err().is_open());

        release_tx.send(()).unwrap();
        assert!(probe.await.unwrap().is_ok());
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_status_reports_time_until_retry() {
        let clock = ManualClock::new();
        let breaker =
            CircuitBreaker::new(1, Duration::from_secs(60)).with_clock(clock.clone());

        let status = breaker.status();
        assert_eq!(status.state, BreakerState::Closed);
        assert_eq!(status.seconds_until_retry, 0);

        let _ = breaker.call(|| async { Err::<(), _>(store_error()) }).await;
        assert_eq!(breaker.status().seconds_until_retry, 60);

        clock.advance(25_000);
        assert_eq!(breaker.status().seconds_until_retry, 35);
    }

    #[tokio::test]
    async fn test_transition_hook_observes_state_changes() {
        let clock = ManualClock::new();
        let transitions = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen = transitions.clone();
        let breaker = CircuitBreaker::new(1, Duration::from_secs(60))
            .with_clock(clock.clone())
            .with_transition_hook(move |state| seen.lock().push(state));

        let _ = breaker.call(|| async { Err::<(), _>(store_error()) }).await;
        clock.advance(60_000);
        let _ = breaker.call(|| async { Ok::<_, StoreError>(()) }).await;

        assert_eq!(
            *transitions.lock(),
            vec![
                BreakerState::Open,
                BreakerState::HalfOpen,
                BreakerState::Closed
            ]
        );
    }
}
