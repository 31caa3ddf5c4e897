//! Publisher facade
//!
//! The caller-facing handle for one partition publisher. Operations are
//! request/reply over the state machine's mailbox with a configured ask
//! timeout; all inputs and outputs are values, never references into the
//! state machine's state.

use crate::config::PublisherConfig;
use crate::error::{Result, StatelineError};
use crate::health::{HealthStatus, PublisherStats, PublisherStatsInner};
use crate::ktable::{KTableProgress, LagPoller, LagPollerHandle, LagSource};
use crate::producer::ProducerProvider;
use crate::publisher::actor::{PublisherActor, PublisherCommand};
use crate::record::{PublishRequest, RecordAck, TopicPartition};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use uuid::Uuid;

/// The topic-partition and aggregate a publisher is responsible for
#[derive(Debug, Clone)]
pub struct PartitionAssignment {
    /// State topic the snapshots are written to
    pub state_topic: String,
    /// Owned partition of the state topic
    pub partition: i32,
    /// Topic the domain events are written to
    pub events_topic: String,
    /// Name of the aggregate type, used for logging
    pub aggregate_name: String,
}

impl PartitionAssignment {
    pub fn new(
        state_topic: impl Into<String>,
        partition: i32,
        events_topic: impl Into<String>,
        aggregate_name: impl Into<String>,
    ) -> Self {
        Self {
            state_topic: state_topic.into(),
            partition,
            events_topic: events_topic.into(),
            aggregate_name: aggregate_name.into(),
        }
    }

    pub fn state_topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.state_topic.clone(), self.partition)
    }
}

/// Successful publish reply
#[derive(Debug, Clone)]
pub struct PublishSuccess {
    /// Correlation id echoed from the request envelope
    pub correlation_id: Uuid,
    /// Ack for the state record, always on the owned partition
    pub state_ack: RecordAck,
    /// Acks for the event records, in event order
    pub event_acks: Vec<RecordAck>,
}

/// Handle for feeding KTable progress to a publisher.
///
/// Obtained from [`Publisher::lag_feed`]; consumed by [`LagPoller`] or by
/// custom lag plumbing.
#[derive(Clone)]
pub struct LagFeed {
    tx: mpsc::UnboundedSender<PublisherCommand>,
    target: TopicPartition,
    stats: Arc<PublisherStatsInner>,
}

impl LagFeed {
    /// Deliver a progress snapshot. Returns `false` once the publisher is
    /// gone.
    pub fn update(&self, progress: KTableProgress) -> bool {
        self.tx
            .send(PublisherCommand::ProgressUpdate(progress))
            .is_ok()
    }

    /// The state topic-partition this feed is for.
    pub fn target(&self) -> &TopicPartition {
        &self.target
    }

    pub(crate) fn record_poll_error(&self) {
        self.stats.record_lag_poll_error();
    }

    #[cfg(test)]
    pub(crate) fn for_tests(
        target: TopicPartition,
    ) -> (
        Self,
        mpsc::UnboundedReceiver<PublisherCommand>,
        Arc<PublisherStatsInner>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let stats = Arc::new(PublisherStatsInner::new());
        (
            Self {
                tx,
                target,
                stats: stats.clone(),
            },
            rx,
            stats,
        )
    }
}

/// Caller-facing handle for one partition publisher
#[derive(Clone)]
pub struct Publisher {
    tx: mpsc::UnboundedSender<PublisherCommand>,
    assignment: PartitionAssignment,
    config: PublisherConfig,
    stats: Arc<PublisherStatsInner>,
    terminated_rx: watch::Receiver<bool>,
}

impl Publisher {
    /// Validate the configuration and spawn the state machine for the given
    /// partition assignment.
    pub fn spawn(
        assignment: PartitionAssignment,
        config: PublisherConfig,
        provider: impl ProducerProvider,
    ) -> Result<Self> {
        config.validate()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let stats = Arc::new(PublisherStatsInner::new());
        let (terminated_tx, terminated_rx) = watch::channel(false);
        let actor = PublisherActor::new(
            assignment.clone(),
            config.clone(),
            Box::new(provider),
            stats.clone(),
            terminated_tx,
        );
        tokio::spawn(actor.run(rx));
        Ok(Self {
            tx,
            assignment,
            config,
            stats,
            terminated_rx,
        })
    }

    /// Atomically publish an aggregate's state snapshot and events.
    ///
    /// Resolves once the enclosing transaction commits or fails; times out
    /// with [`StatelineError::AskTimeout`] after the configured ask timeout.
    /// A timeout does not cancel broker work already in flight.
    pub async fn publish(&self, request: PublishRequest) -> Result<PublishSuccess> {
        let correlation_id = Uuid::new_v4();
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(PublisherCommand::Publish {
                request,
                reply,
                correlation_id,
            })
            .map_err(|_| StatelineError::Terminated)?;
        self.ask("publish", rx).await?
    }

    /// Whether the aggregate's latest committed write is visible in the
    /// local state store. Pends until the store catches up, until `ttl`
    /// elapses (resolving `false`), or until the ask timeout fires.
    pub async fn is_aggregate_state_current(
        &self,
        aggregate_id: impl Into<String>,
        ttl: Duration,
    ) -> Result<bool> {
        let correlation_id = Uuid::new_v4();
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(PublisherCommand::IsStateCurrent {
                aggregate_id: aggregate_id.into(),
                deadline: Instant::now() + ttl,
                reply,
                correlation_id,
            })
            .map_err(|_| StatelineError::Terminated)?;
        self.ask("is_aggregate_state_current", rx).await
    }

    async fn ask<T>(&self, operation: &'static str, rx: oneshot::Receiver<T>) -> Result<T> {
        match tokio::time::timeout(self.config.ask_timeout(), rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(StatelineError::Terminated),
            Err(_) => Err(StatelineError::AskTimeout {
                operation,
                timeout_ms: self.config.ask_timeout_ms,
            }),
        }
    }

    /// Probe the state machine. Any failure to reach it yields
    /// [`HealthStatus::Down`] rather than an error.
    pub async fn health_check(&self) -> HealthStatus {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(PublisherCommand::HealthCheck { reply })
            .is_err()
        {
            return HealthStatus::Down;
        }
        match tokio::time::timeout(self.config.ask_timeout(), rx).await {
            Ok(Ok(status)) => status,
            _ => HealthStatus::Down,
        }
    }

    /// Request a graceful stop. Best-effort and idempotent.
    pub fn terminate(&self) {
        let _ = self.tx.send(PublisherCommand::Terminate);
    }

    /// Resolves once the state machine has stopped, whether by `terminate`,
    /// fencing, or mailbox closure.
    pub async fn terminated(&self) {
        let mut rx = self.terminated_rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Snapshot of the publisher's counters.
    pub fn stats(&self) -> PublisherStats {
        self.stats.snapshot()
    }

    pub fn assignment(&self) -> &PartitionAssignment {
        &self.assignment
    }

    /// Handle for delivering KTable progress to this publisher.
    pub fn lag_feed(&self) -> LagFeed {
        LagFeed {
            tx: self.tx.clone(),
            target: self.assignment.state_topic_partition(),
            stats: self.stats.clone(),
        }
    }

    /// Spawn a [`LagPoller`] feeding this publisher at the configured
    /// cadence.
    pub fn spawn_lag_poller(
        &self,
        source: Arc<dyn LagSource>,
        store_name: impl Into<String>,
    ) -> LagPollerHandle {
        LagPoller::spawn(
            source,
            store_name,
            self.lag_feed(),
            self.config.lag_poll_interval(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProducerError;
    use crate::producer::{AckFuture, RecordToSend, TransactionalProducer};
    use crate::record::MessageToPublish;
    use crate::testing::MockLog;
    use async_trait::async_trait;

    fn assignment() -> PartitionAssignment {
        PartitionAssignment::new("aggregate-state", 1, "aggregate-events", "account")
    }

    fn fast_config() -> PublisherConfig {
        PublisherConfig {
            flush_interval_ms: 20,
            ask_timeout_ms: 1_000,
            init_backoff_initial_ms: 10,
            ..Default::default()
        }
    }

    fn request(aggregate_id: &str) -> PublishRequest {
        PublishRequest::new(
            aggregate_id,
            MessageToPublish::new(aggregate_id, "snapshot"),
            vec![MessageToPublish::new(aggregate_id, "event")],
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_round_trip() {
        let log = MockLog::new();
        let publisher = Publisher::spawn(assignment(), fast_config(), log.provider()).unwrap();

        let success = publisher.publish(request("acct-1")).await.unwrap();
        assert_eq!(success.state_ack.partition, 1);
        assert_eq!(success.event_acks.len(), 1);
        assert_eq!(publisher.stats().batches_committed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_down_after_terminate() {
        let log = MockLog::new();
        let publisher = Publisher::spawn(assignment(), fast_config(), log.provider()).unwrap();

        assert_eq!(publisher.health_check().await, HealthStatus::Up);

        publisher.terminate();
        publisher.terminated().await;
        assert_eq!(publisher.health_check().await, HealthStatus::Down);
        // Idempotent.
        publisher.terminate();
    }

    /// Producer whose init never completes, for exercising ask timeouts.
    struct StuckProducer;

    #[async_trait]
    impl TransactionalProducer for StuckProducer {
        async fn init_transactions(&mut self) -> std::result::Result<(), ProducerError> {
            tokio::time::sleep(Duration::from_secs(86_400)).await;
            Ok(())
        }
        fn begin(&mut self) -> std::result::Result<(), ProducerError> {
            Ok(())
        }
        fn put_records(&mut self, _records: Vec<RecordToSend>) -> Vec<AckFuture> {
            Vec::new()
        }
        async fn commit(&mut self) -> std::result::Result<(), ProducerError> {
            Ok(())
        }
        fn abort(&mut self) -> std::result::Result<(), ProducerError> {
            Ok(())
        }
        fn close(&mut self) {}
    }

    #[tokio::test(start_paused = true)]
    async fn test_ask_timeout_while_stashed() {
        let provider = || Box::new(StuckProducer) as Box<dyn TransactionalProducer>;
        let publisher = Publisher::spawn(assignment(), fast_config(), provider).unwrap();

        let err = publisher.publish(request("acct-1")).await.unwrap_err();
        assert!(matches!(
            err,
            StatelineError::AskTimeout {
                operation: "publish",
                ..
            }
        ));

        let err = publisher
            .is_aggregate_state_current("acct-1", Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(matches!(err, StatelineError::AskTimeout { .. }));
    }
}
