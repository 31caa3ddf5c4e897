//! Producer fault domain
//!
//! Faults raised by a transactional producer fall into two classes: fenced
//! errors, which are permanent for a given transactional identity, and
//! everything else, which the publisher treats as recoverable.

use thiserror::Error;

/// Structured producer error domain
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProducerError {
    /// The transactional identity has been claimed by a newer instance.
    /// Permanent for this producer; the owning publisher must terminate.
    #[error("producer fenced: {0}")]
    Fenced(String),

    /// The producer was in the wrong state for the requested operation
    /// (e.g. commit without an open transaction). Recoverable by
    /// re-initializing the producer.
    #[error("illegal producer state: {0}")]
    IllegalState(String),

    /// The broker rejected the producer's credentials or transactional id.
    #[error("authorization failed: {0}")]
    Authorization(String),

    /// Transport-level failure talking to the broker.
    #[error("transport error: {0}")]
    Transport(String),

    /// The broker rejected an individual record.
    #[error("record rejected on {topic}/{partition}: {reason}")]
    RecordRejected {
        topic: String,
        partition: i32,
        reason: String,
    },
}

impl ProducerError {
    pub fn fenced(detail: impl Into<String>) -> Self {
        Self::Fenced(detail.into())
    }

    pub fn illegal_state(detail: impl Into<String>) -> Self {
        Self::IllegalState(detail.into())
    }

    pub fn authorization(detail: impl Into<String>) -> Self {
        Self::Authorization(detail.into())
    }

    pub fn transport(detail: impl Into<String>) -> Self {
        Self::Transport(detail.into())
    }

    pub fn record_rejected(
        topic: impl Into<String>,
        partition: i32,
        reason: impl Into<String>,
    ) -> Self {
        Self::RecordRejected {
            topic: topic.into(),
            partition,
            reason: reason.into(),
        }
    }

    /// Fenced errors are terminal for the producer identity.
    pub fn is_fenced(&self) -> bool {
        matches!(self, ProducerError::Fenced(_))
    }

    /// Anything that is not a fence is recoverable by rebuilding the producer.
    pub fn is_transient(&self) -> bool {
        !self.is_fenced()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fenced_is_not_transient() {
        assert!(ProducerError::fenced("epoch 3 > 2").is_fenced());
        assert!(!ProducerError::fenced("epoch 3 > 2").is_transient());
    }

    #[test]
    fn test_other_kinds_are_transient() {
        assert!(ProducerError::illegal_state("x").is_transient());
        assert!(ProducerError::authorization("x").is_transient());
        assert!(ProducerError::transport("x").is_transient());
        assert!(ProducerError::record_rejected("t", 0, "too large").is_transient());
    }

    #[test]
    fn test_display() {
        let err = ProducerError::record_rejected("state", 3, "message too large");
        assert_eq!(
            err.to_string(),
            "record rejected on state/3: message too large"
        );
    }
}
