//! Error types for Tollgate.

use std::time::Duration;

use thiserror::Error;

/// Main error type for Tollgate operations.
///
/// Every variant returned from a limiter call means the request was not
/// admitted. Whether the caller then denies or lets it through is the
/// adapter's decision.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// The counter store could not be reached or rejected the command
    #[error("Counter store unavailable: {0}")]
    StoreUnavailable(String),

    /// A stored counter could not be parsed as a non-negative integer
    #[error("Malformed counter value for key {key}: {value:?}")]
    MalformedCounterValue { key: String, value: String },

    /// A store call did not finish before its deadline
    #[error("Counter store call timed out after {0:?}")]
    Timeout(Duration),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TollgateError {
    /// Whether this error came from talking to the counter store rather than
    /// from local configuration.
    pub fn is_store_failure(&self) -> bool {
        matches!(
            self,
            TollgateError::StoreUnavailable(_)
                | TollgateError::MalformedCounterValue { .. }
                | TollgateError::Timeout(_)
        )
    }
}

impl From<redis::RedisError> for TollgateError {
    fn from(err: redis::RedisError) -> Self {
        TollgateError::StoreUnavailable(err.to_string())
    }
}

impl From<config::ConfigError> for TollgateError {
    fn from(err: config::ConfigError) -> Self {
        TollgateError::Config(err.to_string())
    }
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;
