//! Publisher health and statistics
//!
//! Health is a coarse up/down signal answered by the state machine; detailed
//! counters are kept in lock-free atomics shared between the state machine,
//! the lag poller and the facade.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Health of a partition publisher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    /// The state machine is alive and processing messages
    Up,
    /// The state machine is unreachable or terminated
    Down,
}

impl HealthStatus {
    pub fn is_up(&self) -> bool {
        matches!(self, HealthStatus::Up)
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Up => write!(f, "UP"),
            Self::Down => write!(f, "DOWN"),
        }
    }
}

/// Snapshot of publisher counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PublisherStats {
    /// Transactions committed
    pub batches_committed: u64,
    /// Records written across all committed transactions
    pub records_published: u64,
    /// Publish requests that received a failure reply
    pub publish_failures: u64,
    /// Producer rebuilds after transient faults
    pub recoveries: u64,
    /// `init_transactions` attempts, successful or not
    pub init_attempts: u64,
    /// Failed KTable lag polls
    pub lag_poll_errors: u64,
    /// Wall-clock timestamp of the last committed flush (milliseconds)
    pub last_flush_timestamp_ms: u64,
}

pub(crate) struct PublisherStatsInner {
    batches_committed: AtomicU64,
    records_published: AtomicU64,
    publish_failures: AtomicU64,
    recoveries: AtomicU64,
    init_attempts: AtomicU64,
    lag_poll_errors: AtomicU64,
    last_flush_timestamp_ms: AtomicU64,
}

impl PublisherStatsInner {
    pub(crate) fn new() -> Self {
        Self {
            batches_committed: AtomicU64::new(0),
            records_published: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            recoveries: AtomicU64::new(0),
            init_attempts: AtomicU64::new(0),
            lag_poll_errors: AtomicU64::new(0),
            last_flush_timestamp_ms: AtomicU64::new(0),
        }
    }

    pub(crate) fn record_commit(&self, records: u64) {
        self.batches_committed.fetch_add(1, Ordering::Relaxed);
        self.records_published.fetch_add(records, Ordering::Relaxed);
        self.last_flush_timestamp_ms.store(
            chrono::Utc::now().timestamp_millis() as u64,
            Ordering::Relaxed,
        );
    }

    pub(crate) fn record_publish_failures(&self, count: u64) {
        self.publish_failures.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_recovery(&self) {
        self.recoveries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_init_attempt(&self) {
        self.init_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_lag_poll_error(&self) {
        self.lag_poll_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> PublisherStats {
        PublisherStats {
            batches_committed: self.batches_committed.load(Ordering::Relaxed),
            records_published: self.records_published.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            recoveries: self.recoveries.load(Ordering::Relaxed),
            init_attempts: self.init_attempts.load(Ordering::Relaxed),
            lag_poll_errors: self.lag_poll_errors.load(Ordering::Relaxed),
            last_flush_timestamp_ms: self.last_flush_timestamp_ms.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_display() {
        assert_eq!(HealthStatus::Up.to_string(), "UP");
        assert_eq!(HealthStatus::Down.to_string(), "DOWN");
        assert!(HealthStatus::Up.is_up());
        assert!(!HealthStatus::Down.is_up());
    }

    #[test]
    fn test_snapshot_reflects_counters() {
        let inner = PublisherStatsInner::new();
        inner.record_commit(4);
        inner.record_commit(2);
        inner.record_publish_failures(3);
        inner.record_recovery();
        inner.record_init_attempt();
        inner.record_lag_poll_error();

        let stats = inner.snapshot();
        assert_eq!(stats.batches_committed, 2);
        assert_eq!(stats.records_published, 6);
        assert_eq!(stats.publish_failures, 3);
        assert_eq!(stats.recoveries, 1);
        assert_eq!(stats.init_attempts, 1);
        assert_eq!(stats.lag_poll_errors, 1);
        assert!(stats.last_flush_timestamp_ms > 0);
    }

    #[test]
    fn test_stats_serialization() {
        let inner = PublisherStatsInner::new();
        inner.record_commit(1);

        let json = serde_json::to_string(&inner.snapshot()).unwrap();
        let parsed: PublisherStats = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.batches_committed, 1);
        assert_eq!(parsed.records_published, 1);
    }
}
