//! Sluice - Distributed Rate Limiting Service
//!
//! This crate implements a distributed rate limiting service. Admission
//! state is shared across service replicas through a Redis backing store;
//! every state mutation runs as a single atomic server-side script, and a
//! circuit breaker keeps the service responsive when the store misbehaves.

pub mod http;
pub mod ratelimit;
pub mod config;
pub mod error;
pub mod store;
pub mod telemetry;
