//! Error types for Stateline
//!
//! This module defines the main error type used throughout Stateline and the
//! producer fault domain, which distinguishes fatal fenced-producer errors
//! from transient faults that the publisher recovers from.

use thiserror::Error;

mod producer;

pub use producer::ProducerError;

/// Result type alias for Stateline operations
pub type Result<T> = std::result::Result<T, StatelineError>;

/// Main error type for Stateline
#[derive(Error, Debug)]
pub enum StatelineError {
    #[error("producer error: {0}")]
    Producer(#[from] ProducerError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid publish request: {0}")]
    InvalidRequest(String),

    #[error("{operation} timed out after {timeout_ms}ms")]
    AskTimeout {
        operation: &'static str,
        timeout_ms: u64,
    },

    #[error("publisher terminated")]
    Terminated,

    #[error("lag query failed: {0}")]
    LagQuery(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StatelineError {
    /// Check whether this error was caused by a fenced producer.
    pub fn is_fenced(&self) -> bool {
        matches!(self, StatelineError::Producer(e) if e.is_fenced())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fenced_classification() {
        let err = StatelineError::from(ProducerError::fenced("zombie producer"));
        assert!(err.is_fenced());

        let err = StatelineError::from(ProducerError::illegal_state("no txn open"));
        assert!(!err.is_fenced());

        assert!(!StatelineError::Terminated.is_fenced());
    }

    #[test]
    fn test_display_includes_operation() {
        let err = StatelineError::AskTimeout {
            operation: "publish",
            timeout_ms: 5000,
        };
        assert_eq!(err.to_string(), "publish timed out after 5000ms");
    }
}
