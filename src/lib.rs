#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

//! # Stateline
//!
//! Stateline is the per-partition transactional publishing core for CQRS and
//! event-sourcing engines layered on a Kafka-like log. For each assigned
//! partition of the aggregate-state topic, one publisher owns a
//! transactional producer identity and atomically writes the updated state
//! snapshot of each aggregate together with the domain events that produced
//! it. It also consumes state-store lag snapshots, so callers can ask
//! whether an aggregate's latest committed write is already visible in the
//! downstream key/value view.
//!
//! ## Features
//!
//! - **Atomic state + events**: one transaction per flush covers every
//!   state snapshot and every event in the batch
//! - **Single-writer per partition**: a mailbox-driven state machine owns
//!   the producer identity; no internal locking
//! - **Fault taxonomy**: transient producer faults recover by rebuilding the
//!   producer with pending work preserved; fenced producers terminate
//! - **Readiness joins**: `is_aggregate_state_current` pends until the
//!   local store catches up to the aggregate's committed offset or a
//!   deadline expires
//! - **Testable contracts**: the producer and lag sources are traits, with
//!   scripted in-memory doubles in [`testing`]
//!
//! ## Quick Start
//!
//! ```no_run
//! use stateline::testing::MockLog;
//! use stateline::{
//!     MessageToPublish, PartitionAssignment, Publisher, PublisherConfig, PublishRequest,
//! };
//!
//! #[tokio::main]
//! async fn main() -> stateline::Result<()> {
//!     let assignment =
//!         PartitionAssignment::new("account-state", 0, "account-events", "account");
//!     let log = MockLog::new();
//!     let publisher = Publisher::spawn(assignment, PublisherConfig::default(), log.provider())?;
//!
//!     let request = PublishRequest::new(
//!         "acct-1",
//!         MessageToPublish::new("acct-1", "state-bytes"),
//!         vec![MessageToPublish::new("acct-1", "event-bytes")],
//!     )?;
//!     let success = publisher.publish(request).await?;
//!     println!("state record at offset {}", success.state_ack.offset);
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`producer`]: the transactional producer contract consumed by the core
//! - [`publisher`]: state value, state machine and caller facade
//! - [`ktable`]: lag snapshot types and the periodic lag poller
//! - [`config`]: publisher tuning knobs
//! - [`health`]: health probe and counters
//! - [`testing`]: in-memory doubles for both external contracts

pub mod config;
pub mod error;
pub mod health;
pub mod ktable;
pub mod producer;
pub mod publisher;
pub mod record;
pub mod testing;

pub use config::PublisherConfig;
pub use error::{ProducerError, Result, StatelineError};
pub use health::{HealthStatus, PublisherStats};
pub use ktable::{KTableProgress, LagOffsets, LagPoller, LagPollerHandle, LagSnapshot, LagSource};
pub use producer::{AckFuture, ProducerProvider, RecordToSend, TransactionalProducer};
pub use publisher::{LagFeed, PartitionAssignment, PublishSuccess, Publisher};
pub use record::{MessageToPublish, PublishRequest, RecordAck, RecordHeader, TopicPartition};
