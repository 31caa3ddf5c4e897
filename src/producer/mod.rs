//! Transactional producer contract
//!
//! A thin contract over the underlying log client's transactional producer.
//! Transaction boundary calls (`begin`, `abort`) are synchronous; network
//! calls (`init_transactions`, `put_records` acks, `commit`) are
//! asynchronous. `put_records` returns one future per input record and the
//! futures resolve in input order, so a batch failure can be pinpointed
//! without per-record correlation.

use crate::error::ProducerError;
use crate::record::{RecordAck, RecordHeader};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::future::BoxFuture;

/// A physical record handed to the producer
#[derive(Debug, Clone)]
pub struct RecordToSend {
    /// Destination topic
    pub topic: String,
    /// Destination partition; `None` lets the broker's partitioner decide
    pub partition: Option<i32>,
    /// Record key
    pub key: String,
    /// Record value
    pub value: Bytes,
    /// Record headers, passed through untouched
    pub headers: Vec<RecordHeader>,
    /// Aggregate the record belongs to; echoed on the acknowledgement
    pub aggregate_id: Option<String>,
}

/// One pending acknowledgement per record sent
pub type AckFuture = BoxFuture<'static, Result<RecordAck, ProducerError>>;

/// Contract over the underlying log client's transactional producer.
///
/// Exactly one publisher owns a producer identity at a time. A
/// [`ProducerError::Fenced`] from any operation means another instance has
/// claimed the identity; the owner must close and terminate.
#[async_trait]
pub trait TransactionalProducer: Send {
    /// Acquire the transactional identity. May fail with authorization,
    /// illegal-state or transport errors; all are retryable.
    async fn init_transactions(&mut self) -> Result<(), ProducerError>;

    /// Open a transaction. Synchronous.
    fn begin(&mut self) -> Result<(), ProducerError>;

    /// Queue records into the open transaction, returning one ack future per
    /// input record, in input order.
    fn put_records(&mut self, records: Vec<RecordToSend>) -> Vec<AckFuture>;

    /// Commit the open transaction.
    async fn commit(&mut self) -> Result<(), ProducerError>;

    /// Abort the open transaction. Synchronous.
    fn abort(&mut self) -> Result<(), ProducerError>;

    /// Release the transactional identity. Idempotent.
    fn close(&mut self);
}

/// Builds producers for a publisher.
///
/// The publisher closes and rebuilds its producer when recovering from a
/// transient fault, so it holds a provider rather than a single instance.
pub trait ProducerProvider: Send + 'static {
    fn create(&self) -> Box<dyn TransactionalProducer>;
}

impl<F> ProducerProvider for F
where
    F: Fn() -> Box<dyn TransactionalProducer> + Send + 'static,
{
    fn create(&self) -> Box<dyn TransactionalProducer> {
        (self)()
    }
}
