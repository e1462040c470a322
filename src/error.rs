//! Error types for the Quotagate engine.

use thiserror::Error;

/// Main error type for Quotagate operations.
///
/// Only `Config`, `InvalidPolicy` and `Io` are allowed to surface to a
/// caller, and only while the engine is being built. Everything else is
/// folded into a [`crate::ratelimit::Decision`] on the request path.
#[derive(Error, Debug)]
pub enum QuotaError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A policy row failed validation
    #[error("Invalid policy '{name}': {reason}")]
    InvalidPolicy { name: String, reason: String },

    /// No policy matched and no default was configured
    #[error("No policy found for endpoint '{endpoint}'")]
    PolicyNotFound { endpoint: String },

    /// The wait queue for a scope is at capacity
    #[error("Queue full for {scope} (capacity {capacity})")]
    QueueFull { scope: String, capacity: usize },

    /// A counter violated its invariants and was reset
    #[error("Counter state for {key} was corrupt: {detail}")]
    CounterCorruption { key: String, detail: String },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for QuotaError {
    fn from(err: config::ConfigError) -> Self {
        QuotaError::Config(err.to_string())
    }
}

/// Result type alias for Quotagate operations.
pub type Result<T> = std::result::Result<T, QuotaError>;
