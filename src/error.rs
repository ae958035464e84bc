//! Error types for the Sluice service.

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for Sluice operations.
#[derive(Error, Debug)]
pub enum LimiterError {
    /// The check request failed validation before any store interaction.
    #[error("invalid request: {0}")]
    BadRequest(String),

    /// A backing store interaction failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The store is unreachable and the service runs with fail-mode closed.
    #[error("rate limiter temporarily unavailable")]
    ServiceUnavailable,

    /// Configuration-related errors
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Should not be reachable; surfaced as 500 and worth an alert.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type alias for Sluice operations.
pub type Result<T> = std::result::Result<T, LimiterError>;
