//! KTable lag tracking
//!
//! Downstream consumers materialize the state topic into a local key/value
//! store. This module provides the lag snapshot types, the contract for
//! querying a store's lag, and a periodic poller that feeds the owned
//! partition's progress to the publisher state machine.

use crate::error::Result;
use crate::publisher::LagFeed;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Current and end offsets for one partition of a state store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LagOffsets {
    /// Offset the local store has materialized up to
    pub current_offset: i64,
    /// Log end offset of the backing partition
    pub end_offset: i64,
}

/// One lag poll result: store name to per-partition offsets
pub type LagSnapshot = HashMap<String, HashMap<i32, LagOffsets>>;

/// Contract for querying state-store lag.
///
/// The publisher only consumes snapshots; it does not drive materialization.
#[async_trait]
pub trait LagSource: Send + Sync {
    async fn query_lag(&self) -> Result<LagSnapshot>;
}

/// Materialization progress of the owned partition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KTableProgress {
    /// State topic backing the store
    pub topic: String,
    /// Partition index
    pub partition: i32,
    /// Offset the local store has materialized up to
    pub current_offset: i64,
    /// Log end offset of the partition
    pub end_offset: i64,
}

impl KTableProgress {
    /// Records not yet materialized by the local store.
    pub fn lag(&self) -> i64 {
        (self.end_offset - self.current_offset).max(0)
    }

    /// Whether the local store has materialized the given offset.
    pub fn covers(&self, offset: i64) -> bool {
        self.current_offset >= offset
    }
}

/// Periodic poller feeding lag snapshots to a publisher.
///
/// A failed poll keeps the previous snapshot: nothing is sent, an error
/// counter is incremented and the publisher stays in its current state.
pub struct LagPoller;

impl LagPoller {
    /// Spawn the poll loop. The first poll happens one interval after spawn.
    pub fn spawn(
        source: Arc<dyn LagSource>,
        store_name: impl Into<String>,
        feed: LagFeed,
        interval: Duration,
    ) -> LagPollerHandle {
        let store_name = store_name.into();
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut tick = tokio::time::interval_at(start, interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        Self::poll_once(&*source, &store_name, &feed).await;
                    }
                    _ = shutdown_rx.recv() => {
                        debug!(store = %store_name, "lag poller shutting down");
                        break;
                    }
                }
            }
        });

        LagPollerHandle { shutdown_tx }
    }

    async fn poll_once(source: &dyn LagSource, store_name: &str, feed: &LagFeed) {
        let target = feed.target().clone();
        match source.query_lag().await {
            Ok(snapshot) => {
                let offsets = snapshot
                    .get(store_name)
                    .and_then(|partitions| partitions.get(&target.partition));
                match offsets {
                    Some(offsets) => {
                        let progress = KTableProgress {
                            topic: target.topic,
                            partition: target.partition,
                            current_offset: offsets.current_offset,
                            end_offset: offsets.end_offset,
                        };
                        if !feed.update(progress) {
                            debug!(store = %store_name, "publisher gone, dropping lag update");
                        }
                    }
                    None => {
                        debug!(
                            store = %store_name,
                            partition = target.partition,
                            "no lag entry for owned partition"
                        );
                    }
                }
            }
            Err(e) => {
                feed.record_poll_error();
                warn!(
                    store = %store_name,
                    error = %e,
                    "lag query failed, keeping previous snapshot"
                );
            }
        }
    }
}

/// Handle for stopping a spawned [`LagPoller`]
pub struct LagPollerHandle {
    shutdown_tx: mpsc::Sender<()>,
}

impl LagPollerHandle {
    /// Stop the poll loop. Idempotent.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.try_send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StatelineError;
    use crate::record::TopicPartition;

    #[test]
    fn test_progress_lag() {
        let progress = KTableProgress {
            topic: "aggregate-state".to_string(),
            partition: 0,
            current_offset: 40,
            end_offset: 100,
        };
        assert_eq!(progress.lag(), 60);
        assert!(progress.covers(40));
        assert!(!progress.covers(41));
    }

    #[test]
    fn test_progress_lag_never_negative() {
        let progress = KTableProgress {
            topic: "aggregate-state".to_string(),
            partition: 0,
            current_offset: 10,
            end_offset: 10,
        };
        assert_eq!(progress.lag(), 0);
    }

    struct ScriptedLagSource {
        snapshot: LagSnapshot,
        fail_first: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl LagSource for ScriptedLagSource {
        async fn query_lag(&self) -> Result<LagSnapshot> {
            if self.fail_first.swap(false, std::sync::atomic::Ordering::SeqCst) {
                return Err(StatelineError::LagQuery("store closed".to_string()));
            }
            Ok(self.snapshot.clone())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_poller_feeds_owned_partition() {
        let mut partitions = HashMap::new();
        partitions.insert(
            2,
            LagOffsets {
                current_offset: 5,
                end_offset: 9,
            },
        );
        // An entry for another partition that must be ignored.
        partitions.insert(
            3,
            LagOffsets {
                current_offset: 0,
                end_offset: 100,
            },
        );
        let mut snapshot = HashMap::new();
        snapshot.insert("account-store".to_string(), partitions);

        let source = Arc::new(ScriptedLagSource {
            snapshot,
            fail_first: std::sync::atomic::AtomicBool::new(true),
        });

        let (feed, mut rx, stats) =
            LagFeed::for_tests(TopicPartition::new("aggregate-state", 2));
        let poller = LagPoller::spawn(
            source,
            "account-store",
            feed,
            Duration::from_millis(100),
        );

        // First poll fails: counted, nothing delivered.
        // Second poll delivers the owned partition's offsets.
        let progress = match rx.recv().await.unwrap() {
            crate::publisher::PublisherCommand::ProgressUpdate(progress) => progress,
            _ => panic!("expected a progress update"),
        };
        assert_eq!(progress.partition, 2);
        assert_eq!(progress.current_offset, 5);
        assert_eq!(progress.end_offset, 9);
        assert_eq!(stats.snapshot().lag_poll_errors, 1);

        poller.stop();
    }
}
