//! Per-partition transactional publisher
//!
//! For each assigned partition of the state topic, exactly one publisher
//! owns a transactional producer identity and atomically writes the updated
//! state snapshot of each aggregate plus the resulting domain events. It
//! also tracks how far the downstream state store has materialized the
//! partition, so callers can ask whether an aggregate's latest committed
//! write is visible for reads.
//!
//! The module splits into three pieces:
//!
//! - [`state`]: the pure data structure tracking in-flight records, pending
//!   work and transaction timing
//! - [`actor`]: the single-writer state machine driving
//!   initialization, flushing and recovery
//! - [`handle`]: the caller-facing facade translating request/reply into
//!   futures with timeouts

mod actor;
mod handle;
mod state;

pub(crate) use actor::PublisherCommand;

pub use handle::{LagFeed, PartitionAssignment, Publisher, PublishSuccess};
