//! Backing store access and resilience.

mod breaker;
mod redis;

pub use breaker::{
    BreakerError, BreakerState, BreakerStatus, CircuitBreaker, Clock, MonotonicClock,
};
pub use redis::{RedisStore, ScriptHandle, StoreError};
