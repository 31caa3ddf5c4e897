//! Testing utilities
//!
//! In-memory doubles for the producer and lag contracts: a mock log that
//! records every producer call and can be scripted to fail specific
//! operations, and a scripted lag source. Used by this crate's own tests and
//! usable by downstream crates testing publisher wiring.

use crate::error::{ProducerError, Result, StatelineError};
use crate::ktable::{LagOffsets, LagSnapshot, LagSource};
use crate::producer::{AckFuture, ProducerProvider, RecordToSend, TransactionalProducer};
use crate::record::RecordAck;
use async_trait::async_trait;
use futures_util::FutureExt;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// A producer call observed by the mock log
#[derive(Debug, Clone)]
pub enum MockCall {
    InitTransactions,
    Begin,
    PutRecords(Vec<RecordToSend>),
    Commit,
    Abort,
    Close,
}

#[derive(Default)]
struct MockLogInner {
    calls: Vec<MockCall>,
    init_errors: VecDeque<ProducerError>,
    begin_errors: VecDeque<ProducerError>,
    commit_errors: VecDeque<ProducerError>,
    abort_errors: VecDeque<ProducerError>,
    record_failure: Option<(usize, ProducerError)>,
    commit_delay: Option<std::time::Duration>,
    next_offsets: HashMap<(String, i32), i64>,
    producers_created: usize,
}

/// In-memory transactional log shared by every producer a test creates.
///
/// Scripted failures are consumed in order: each `fail_*` entry applies to
/// one call of that operation, after which the operation succeeds again.
/// Offsets are assigned monotonically per topic-partition across producer
/// rebuilds, matching a broker's view of one logical session.
#[derive(Clone, Default)]
pub struct MockLog {
    inner: Arc<Mutex<MockLogInner>>,
}

impl MockLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue errors for successive `init_transactions` calls.
    pub fn fail_init(&self, errors: impl IntoIterator<Item = ProducerError>) {
        self.inner.lock().init_errors.extend(errors);
    }

    /// Queue errors for successive `begin` calls.
    pub fn fail_begin(&self, errors: impl IntoIterator<Item = ProducerError>) {
        self.inner.lock().begin_errors.extend(errors);
    }

    /// Queue errors for successive `commit` calls.
    pub fn fail_commit(&self, errors: impl IntoIterator<Item = ProducerError>) {
        self.inner.lock().commit_errors.extend(errors);
    }

    /// Queue errors for successive `abort` calls.
    pub fn fail_abort(&self, errors: impl IntoIterator<Item = ProducerError>) {
        self.inner.lock().abort_errors.extend(errors);
    }

    /// Fail the record at `index` in the next `put_records` call; the other
    /// records in that call still ack.
    pub fn fail_record(&self, index: usize, error: ProducerError) {
        self.inner.lock().record_failure = Some((index, error));
    }

    /// Make every `commit` take this long before resolving.
    pub fn set_commit_delay(&self, delay: std::time::Duration) {
        self.inner.lock().commit_delay = Some(delay);
    }

    /// Pin the next offset assigned on a topic-partition.
    pub fn set_next_offset(&self, topic: impl Into<String>, partition: i32, offset: i64) {
        self.inner
            .lock()
            .next_offsets
            .insert((topic.into(), partition), offset);
    }

    /// Provider handing out producers backed by this log.
    pub fn provider(&self) -> impl ProducerProvider {
        let inner = self.inner.clone();
        move || {
            inner.lock().producers_created += 1;
            Box::new(MockProducer {
                inner: inner.clone(),
            }) as Box<dyn TransactionalProducer>
        }
    }

    pub fn producers_created(&self) -> usize {
        self.inner.lock().producers_created
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.inner.lock().calls.clone()
    }

    pub fn init_calls(&self) -> usize {
        self.count(|c| matches!(c, MockCall::InitTransactions))
    }

    pub fn begin_calls(&self) -> usize {
        self.count(|c| matches!(c, MockCall::Begin))
    }

    pub fn commit_calls(&self) -> usize {
        self.count(|c| matches!(c, MockCall::Commit))
    }

    pub fn abort_calls(&self) -> usize {
        self.count(|c| matches!(c, MockCall::Abort))
    }

    pub fn close_calls(&self) -> usize {
        self.count(|c| matches!(c, MockCall::Close))
    }

    /// The record batches passed to `put_records`, in call order.
    pub fn put_records_calls(&self) -> Vec<Vec<RecordToSend>> {
        self.inner
            .lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                MockCall::PutRecords(records) => Some(records.clone()),
                _ => None,
            })
            .collect()
    }

    fn count(&self, predicate: impl Fn(&MockCall) -> bool) -> usize {
        self.inner.lock().calls.iter().filter(|c| predicate(c)).count()
    }
}

struct MockProducer {
    inner: Arc<Mutex<MockLogInner>>,
}

#[async_trait]
impl TransactionalProducer for MockProducer {
    async fn init_transactions(&mut self) -> std::result::Result<(), ProducerError> {
        let mut inner = self.inner.lock();
        inner.calls.push(MockCall::InitTransactions);
        match inner.init_errors.pop_front() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn begin(&mut self) -> std::result::Result<(), ProducerError> {
        let mut inner = self.inner.lock();
        inner.calls.push(MockCall::Begin);
        match inner.begin_errors.pop_front() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn put_records(&mut self, records: Vec<RecordToSend>) -> Vec<AckFuture> {
        let mut inner = self.inner.lock();
        inner.calls.push(MockCall::PutRecords(records.clone()));
        let failure = inner.record_failure.take();

        let mut acks = Vec::with_capacity(records.len());
        for (index, record) in records.into_iter().enumerate() {
            let result = match &failure {
                Some((failed_index, error)) if *failed_index == index => Err(error.clone()),
                _ => {
                    let partition = record.partition.unwrap_or(0);
                    let slot = (record.topic.clone(), partition);
                    let offset = inner.next_offsets.get(&slot).copied().unwrap_or(0);
                    inner.next_offsets.insert(slot, offset + 1);
                    Ok(RecordAck {
                        aggregate_id: record.aggregate_id,
                        topic: record.topic,
                        partition,
                        offset,
                    })
                }
            };
            acks.push(futures_util::future::ready(result).boxed());
        }
        acks
    }

    async fn commit(&mut self) -> std::result::Result<(), ProducerError> {
        let (delay, error) = {
            let mut inner = self.inner.lock();
            inner.calls.push(MockCall::Commit);
            (inner.commit_delay, inner.commit_errors.pop_front())
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn abort(&mut self) -> std::result::Result<(), ProducerError> {
        let mut inner = self.inner.lock();
        inner.calls.push(MockCall::Abort);
        match inner.abort_errors.pop_front() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn close(&mut self) {
        self.inner.lock().calls.push(MockCall::Close);
    }
}

/// Scripted lag source.
///
/// Snapshots are served in order; the final snapshot repeats forever. An
/// empty script makes every poll fail.
#[derive(Clone, Default)]
pub struct MockLagSource {
    snapshots: Arc<Mutex<VecDeque<LagSnapshot>>>,
}

impl MockLagSource {
    pub fn new(snapshots: impl IntoIterator<Item = LagSnapshot>) -> Self {
        Self {
            snapshots: Arc::new(Mutex::new(snapshots.into_iter().collect())),
        }
    }

    /// Append a snapshot to the script.
    pub fn push(&self, snapshot: LagSnapshot) {
        self.snapshots.lock().push_back(snapshot);
    }
}

#[async_trait]
impl LagSource for MockLagSource {
    async fn query_lag(&self) -> Result<LagSnapshot> {
        let mut snapshots = self.snapshots.lock();
        if snapshots.len() > 1 {
            match snapshots.pop_front() {
                Some(snapshot) => Ok(snapshot),
                None => Err(StatelineError::LagQuery("no snapshot scripted".to_string())),
            }
        } else {
            snapshots
                .front()
                .cloned()
                .ok_or_else(|| StatelineError::LagQuery("no snapshot scripted".to_string()))
        }
    }
}

/// Build a one-store, one-partition lag snapshot.
pub fn lag_snapshot(
    store_name: &str,
    partition: i32,
    current_offset: i64,
    end_offset: i64,
) -> LagSnapshot {
    let mut partitions = HashMap::new();
    partitions.insert(
        partition,
        LagOffsets {
            current_offset,
            end_offset,
        },
    );
    let mut snapshot = HashMap::new();
    snapshot.insert(store_name.to_string(), partitions);
    snapshot
}
