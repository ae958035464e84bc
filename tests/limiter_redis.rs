//! Integration tests for the admission algorithms against a live Redis.
//!
//! Tests marked `#[ignore]` need a Redis reachable at 127.0.0.1:6379
//! (`cargo test -- --ignored`). Each test uses a unique client id so runs
//! never share state. The fail-mode tests at the bottom need no Redis; they
//! point the store at a closed port on purpose.

use std::sync::Arc;
use std::time::Duration;

use sluice::config::{FailMode, StoreConfig};
use sluice::error::LimiterError;
use sluice::ratelimit::{
    CheckRequest, FixedWindowLimiter, RateLimitAlgorithm, RateLimiter, Rule, RuleResolver,
    SlidingWindowLimiter, TokenBucketLimiter,
};
use sluice::store::{BreakerState, CircuitBreaker, RedisStore};
use sluice::telemetry::Metrics;
use uuid::Uuid;

fn live_store() -> Arc<RedisStore> {
    let config = StoreConfig {
        host: "127.0.0.1".to_string(),
        port: 6379,
        db: 0,
        timeout_ms: 1000,
    };
    Arc::new(RedisStore::new(&config).expect("pool construction"))
}

fn unique_client() -> String {
    format!("test-{}", Uuid::new_v4())
}

/// Sleep until `now % window` falls inside `[min, max)`.
async fn align_to_window_offset(window: u64, min: f64, max: f64) {
    loop {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs_f64();
        let offset = now % window as f64;
        if offset >= min && offset < max {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
#[ignore]
async fn token_bucket_burst_then_refill() {
    let limiter = TokenBucketLimiter::new(live_store());
    let client = unique_client();
    let rule = Rule { rate: 5, window: 10 };

    for i in 1..=5 {
        let decision = limiter.check(&client, "global", 1, &rule).await.unwrap();
        assert!(decision.allowed, "burst request {i} should be admitted");
        assert_eq!(decision.remaining, 5 - i);
        assert_eq!(decision.retry_after_ms, 0);
    }

    // Bucket is empty: one token refills every 2 seconds.
    let decision = limiter.check(&client, "global", 1, &rule).await.unwrap();
    assert!(!decision.allowed);
    assert_eq!(decision.remaining, 0);
    assert!(
        (1800..=2200).contains(&decision.retry_after_ms),
        "retry_after_ms was {}",
        decision.retry_after_ms
    );

    tokio::time::sleep(Duration::from_millis(2100)).await;
    let decision = limiter.check(&client, "global", 1, &rule).await.unwrap();
    assert!(decision.allowed, "one token should have refilled");
    assert_eq!(decision.remaining, 0);
}

#[tokio::test]
#[ignore]
async fn token_bucket_high_cost_consumes_multiple_tokens() {
    let limiter = TokenBucketLimiter::new(live_store());
    let client = unique_client();
    let rule = Rule { rate: 10, window: 60 };

    let decision = limiter.check(&client, "global", 5, &rule).await.unwrap();
    assert!(decision.allowed);
    assert_eq!(decision.remaining, 5);

    let decision = limiter.check(&client, "global", 6, &rule).await.unwrap();
    assert!(!decision.allowed, "6 tokens must not fit in a bucket of 5");
    assert!(decision.retry_after_ms > 0);
}

#[tokio::test]
#[ignore]
async fn fixed_window_admits_bursts_across_the_boundary() {
    let limiter = FixedWindowLimiter::new(live_store());
    let client = unique_client();
    let rule = Rule { rate: 3, window: 2 };

    // Land shortly before a window boundary.
    align_to_window_offset(rule.window, 1.4, 1.7).await;
    for _ in 0..3 {
        let decision = limiter.check(&client, "global", 1, &rule).await.unwrap();
        assert!(decision.allowed);
    }

    // Cross the boundary: the fresh window admits another full burst.
    tokio::time::sleep(Duration::from_millis(700)).await;
    for _ in 0..3 {
        let decision = limiter.check(&client, "global", 1, &rule).await.unwrap();
        assert!(decision.allowed, "new window should reset the counter");
    }
}

#[tokio::test]
#[ignore]
async fn fixed_window_rejections_do_not_consume_quota() {
    let limiter = FixedWindowLimiter::new(live_store());
    let client = unique_client();
    let rule = Rule { rate: 3, window: 10 };

    // Start just inside a window so the test never straddles a boundary.
    align_to_window_offset(rule.window, 0.2, 5.0).await;

    for _ in 0..2 {
        assert!(limiter.check(&client, "global", 1, &rule).await.unwrap().allowed);
    }

    // Two more units do not fit (2 + 2 > 3)...
    let decision = limiter.check(&client, "global", 2, &rule).await.unwrap();
    assert!(!decision.allowed);
    assert_eq!(decision.remaining, 1);
    assert!(decision.retry_after_ms > 0);

    // ...but the rejection handed its units back, so one unit still fits.
    let decision = limiter.check(&client, "global", 1, &rule).await.unwrap();
    assert!(decision.allowed);
    assert_eq!(decision.remaining, 0);
}

#[tokio::test]
#[ignore]
async fn sliding_window_denies_boundary_burst() {
    let limiter = SlidingWindowLimiter::new(live_store());
    let client = unique_client();
    let rule = Rule { rate: 3, window: 2 };

    align_to_window_offset(rule.window, 1.4, 1.7).await;
    for i in 1..=3 {
        let decision = limiter.check(&client, "global", 1, &rule).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, (3 - i) as u64);
    }

    // Crossing the aligned boundary does not help: the three admissions are
    // still inside the sliding window.
    tokio::time::sleep(Duration::from_millis(700)).await;
    let decision = limiter.check(&client, "global", 1, &rule).await.unwrap();
    assert!(!decision.allowed);
    assert!(decision.retry_after_ms > 0);

    // Once the oldest admission ages out, capacity returns.
    tokio::time::sleep(Duration::from_millis(2100)).await;
    let decision = limiter.check(&client, "global", 1, &rule).await.unwrap();
    assert!(decision.allowed);
}

#[tokio::test]
#[ignore]
async fn store_primitives_round_trip() {
    let config = StoreConfig {
        host: "127.0.0.1".to_string(),
        port: 6379,
        db: 0,
        timeout_ms: 1000,
    };
    let store = RedisStore::connect(&config).await.unwrap();
    let key = format!("test:primitives:{}", Uuid::new_v4());

    store.ping().await.unwrap();

    store.set(&key, "value", Duration::from_secs(30)).await.unwrap();
    assert_eq!(store.get(&key).await.unwrap().as_deref(), Some("value"));
    store.delete(&key).await.unwrap();
    assert_eq!(store.get(&key).await.unwrap(), None);

    let zkey = format!("{key}:z");
    store.zadd(&zkey, 1.0, "a").await.unwrap();
    store.zadd(&zkey, 2.0, "b").await.unwrap();
    store.zadd(&zkey, 3.0, "c").await.unwrap();
    assert_eq!(store.zcard(&zkey).await.unwrap(), 3);
    assert_eq!(
        store.zrange_by_score(&zkey, 1.5, 3.5).await.unwrap(),
        vec!["b".to_string(), "c".to_string()]
    );
    assert_eq!(store.zremrangebyscore(&zkey, 0.0, 1.5).await.unwrap(), 1);
    assert_eq!(store.zcard(&zkey).await.unwrap(), 2);
    assert!(store.expire(&zkey, Duration::from_secs(30)).await.unwrap());
    store.delete(&zkey).await.unwrap();
}

// --- fail-mode behaviour; no Redis needed -------------------------------

fn unreachable_store() -> Arc<RedisStore> {
    // Nothing listens on port 1; calls fail within the deadline.
    let config = StoreConfig {
        host: "127.0.0.1".to_string(),
        port: 1,
        db: 0,
        timeout_ms: 100,
    };
    Arc::new(RedisStore::new(&config).expect("pool construction"))
}

fn limiter_against_dead_store(fail_mode: FailMode, threshold: u32) -> (RateLimiter, Arc<CircuitBreaker>) {
    let store = unreachable_store();
    let breaker = Arc::new(CircuitBreaker::new(threshold, Duration::from_secs(60)));
    let limiter = RateLimiter::new(
        Arc::new(TokenBucketLimiter::new(store)),
        Arc::new(RuleResolver::default()),
        breaker.clone(),
        fail_mode,
        Arc::new(Metrics::new(&prometheus::Registry::new()).unwrap()),
    );
    (limiter, breaker)
}

fn check_request(client_id: &str) -> CheckRequest {
    CheckRequest {
        client_id: client_id.to_string(),
        limit_key: "global".to_string(),
        cost: 1,
    }
}

#[tokio::test]
async fn fail_open_admits_while_store_is_down_and_breaker_trips() {
    let (limiter, breaker) = limiter_against_dead_store(FailMode::Open, 3);
    let client = unique_client();

    for _ in 0..3 {
        let response = limiter.check(&check_request(&client)).await.unwrap();
        assert!(response.allowed);
        assert_eq!(response.remaining, 100);
        assert_eq!(response.retry_after_ms, 0);
    }

    // Three consecutive failures tripped the breaker; subsequent checks are
    // still admitted but no longer touch the store.
    assert_eq!(breaker.state(), BreakerState::Open);
    let response = limiter.check(&check_request(&client)).await.unwrap();
    assert!(response.allowed);
}

#[tokio::test]
async fn fail_closed_surfaces_service_unavailable() {
    let (limiter, _breaker) = limiter_against_dead_store(FailMode::Closed, 3);
    let client = unique_client();

    let result = limiter.check(&check_request(&client)).await;
    assert!(matches!(result, Err(LimiterError::ServiceUnavailable)));
}
