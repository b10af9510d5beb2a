//! Error types for the Ratewarden service.

use std::time::Duration;

use thiserror::Error;

/// Main error type for Ratewarden operations.
#[derive(Error, Debug)]
pub enum WardenError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A policy name that is not present in the registry
    #[error("Unknown rate limit policy: {0}")]
    UnknownPolicy(String),

    /// A policy whose parameters break the capacity/window/block invariant
    #[error("Invalid policy {name}: {reason}")]
    InvalidPolicy {
        /// Name of the offending policy
        name: String,
        /// What is wrong with it
        reason: String,
    },

    /// Window store errors that could not be recovered by falling back
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failures inside the operational tooling (benchmarks, monitor)
    #[error("Tooling error: {0}")]
    Tooling(String),
}

impl From<config::ConfigError> for WardenError {
    fn from(err: config::ConfigError) -> Self {
        WardenError::Config(err.to_string())
    }
}

/// Errors raised by a window store backend.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The backend could not be reached.
    #[error("connection to {backend} failed: {message}")]
    Connection {
        /// Backend name
        backend: &'static str,
        /// Underlying failure
        message: String,
    },

    /// The backend did not answer within the command timeout.
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        /// Store operation that timed out
        operation: &'static str,
        /// Configured timeout
        after: Duration,
    },

    /// The backend answered with an error.
    #[error("{operation} failed: {source}")]
    Command {
        /// Store operation that failed
        operation: &'static str,
        /// Redis error
        #[source]
        source: redis::RedisError,
    },
}

/// Result type alias for Ratewarden operations.
pub type Result<T> = std::result::Result<T, WardenError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_message() {
        let err = StoreError::Timeout {
            operation: "increment",
            after: Duration::from_millis(250),
        };
        assert_eq!(err.to_string(), "increment timed out after 250ms");
    }

    #[test]
    fn test_store_error_converts() {
        let err: WardenError = StoreError::Connection {
            backend: "redis",
            message: "refused".to_string(),
        }
        .into();
        assert!(matches!(err, WardenError::Store(_)));
        assert_eq!(err.to_string(), "Store error: connection to redis failed: refused");
    }
}
