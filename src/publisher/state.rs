//! Publisher state
//!
//! The pure data structure behind a partition publisher: the in-flight index
//! joining committed state records to KTable progress, the pending-write
//! FIFO, the pending readiness queries and transaction timing. All mutation
//! flows through typed transitions; the state machine owns the only
//! reference.

use crate::error::Result;
use crate::ktable::KTableProgress;
use crate::publisher::PublishSuccess;
use crate::record::{PublishRequest, RecordAck};
use std::collections::{HashMap, VecDeque};
use tokio::sync::oneshot;
use tokio::time::Instant;
use uuid::Uuid;

/// A publish request waiting to be drained into a transaction
pub(crate) struct PendingWrite {
    pub sender: oneshot::Sender<Result<PublishSuccess>>,
    pub request: PublishRequest,
    pub correlation_id: Uuid,
}

/// A readiness query waiting for KTable catch-up or expiration
pub(crate) struct PendingInit {
    pub sender: oneshot::Sender<bool>,
    pub aggregate_id: String,
    pub deadline: Instant,
    pub correlation_id: Uuid,
}

/// A resolved readiness query to be delivered by the state machine
pub(crate) struct InitDecision {
    pub sender: oneshot::Sender<bool>,
    pub decision: bool,
    pub aggregate_id: String,
    pub correlation_id: Uuid,
}

/// State owned by one partition publisher
#[derive(Default)]
pub(crate) struct PublisherState {
    /// Most recent committed-but-not-yet-materialized state ack per aggregate
    in_flight: HashMap<String, RecordAck>,
    /// Highest state-topic offset acked without an aggregate id
    keyless_high_water: Option<i64>,
    /// Publish requests not yet drained into a transaction, in arrival order
    pending_writes: VecDeque<PendingWrite>,
    /// Readiness queries awaiting catch-up or expiration, in arrival order
    pending_inits: Vec<PendingInit>,
    /// Set exactly while a transaction is open
    transaction_started_at: Option<Instant>,
}

impl PublisherState {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Record broker acks for committed state records.
    ///
    /// For each ack carrying an aggregate id, the aggregate's entry is
    /// replaced only if the new offset is strictly greater. Acks without an
    /// aggregate id only advance the partition high-water offset.
    pub(crate) fn add_in_flight(&mut self, acks: impl IntoIterator<Item = RecordAck>) {
        for ack in acks {
            match &ack.aggregate_id {
                Some(aggregate_id) => match self.in_flight.get(aggregate_id) {
                    Some(existing) if existing.offset >= ack.offset => {}
                    _ => {
                        self.in_flight.insert(aggregate_id.clone(), ack);
                    }
                },
                None => {
                    self.keyless_high_water =
                        Some(self.keyless_high_water.unwrap_or(-1).max(ack.offset));
                }
            }
        }
    }

    /// Current in-flight ack for an aggregate, if any.
    pub(crate) fn in_flight_for(&self, aggregate_id: &str) -> Option<&RecordAck> {
        self.in_flight.get(aggregate_id)
    }

    pub(crate) fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    #[allow(dead_code)]
    pub(crate) fn keyless_high_water(&self) -> Option<i64> {
        self.keyless_high_water
    }

    pub(crate) fn add_pending_write(&mut self, write: PendingWrite) {
        self.pending_writes.push_back(write);
    }

    /// Drain pending writes from the front until the batch would exceed
    /// `max_records` physical records. At least one write is drained when
    /// any are pending.
    pub(crate) fn flush_writes(&mut self, max_records: usize) -> Vec<PendingWrite> {
        let mut batch = Vec::new();
        let mut records = 0usize;
        loop {
            let count = match self.pending_writes.front() {
                Some(write) => write.request.record_count(),
                None => break,
            };
            if !batch.is_empty() && records + count > max_records {
                break;
            }
            if let Some(write) = self.pending_writes.pop_front() {
                records += count;
                batch.push(write);
            }
        }
        batch
    }

    /// Put a drained batch back at the front of the FIFO, preserving order.
    /// Used when a flush fails before any record was sent.
    pub(crate) fn requeue_writes(&mut self, batch: Vec<PendingWrite>) {
        for write in batch.into_iter().rev() {
            self.pending_writes.push_front(write);
        }
    }

    pub(crate) fn pending_write_count(&self) -> usize {
        self.pending_writes.len()
    }

    /// Register a readiness query. Duplicates by aggregate id are permitted;
    /// each sender gets its own reply.
    pub(crate) fn add_pending_init(&mut self, init: PendingInit) {
        self.pending_inits.push(init);
    }

    pub(crate) fn pending_init_count(&self) -> usize {
        self.pending_inits.len()
    }

    /// Join a KTable progress snapshot against the pending readiness queries.
    ///
    /// Queries are evaluated in insertion order against a single `now`:
    /// an aggregate that is not in-flight is already visible (`true`), an
    /// in-flight ack covered by the snapshot resolves `true` and retires its
    /// index entry, an expired query resolves `false`, anything else stays
    /// pending. Index entries covered by the snapshot are retired even when
    /// no query asked about them.
    pub(crate) fn processed_up_to(
        &mut self,
        progress: &KTableProgress,
        now: Instant,
    ) -> Vec<InitDecision> {
        let mut decisions = Vec::new();
        let mut still_pending = Vec::new();

        for init in self.pending_inits.drain(..) {
            match self.in_flight.get(&init.aggregate_id) {
                None => decisions.push(InitDecision {
                    sender: init.sender,
                    decision: true,
                    aggregate_id: init.aggregate_id,
                    correlation_id: init.correlation_id,
                }),
                Some(ack) if progress.covers(ack.offset) => {
                    self.in_flight.remove(&init.aggregate_id);
                    decisions.push(InitDecision {
                        sender: init.sender,
                        decision: true,
                        aggregate_id: init.aggregate_id,
                        correlation_id: init.correlation_id,
                    });
                }
                Some(_) if now >= init.deadline => decisions.push(InitDecision {
                    sender: init.sender,
                    decision: false,
                    aggregate_id: init.aggregate_id,
                    correlation_id: init.correlation_id,
                }),
                Some(_) => still_pending.push(init),
            }
        }
        self.pending_inits = still_pending;

        self.in_flight
            .retain(|_, ack| !progress.covers(ack.offset));

        decisions
    }

    pub(crate) fn begin_transaction(&mut self, now: Instant) {
        self.transaction_started_at = Some(now);
    }

    pub(crate) fn clear_transaction(&mut self) {
        self.transaction_started_at = None;
    }

    pub(crate) fn transaction_open(&self) -> bool {
        self.transaction_started_at.is_some()
    }

    /// Milliseconds since the open transaction started, or zero when no
    /// transaction is open.
    pub(crate) fn transaction_elapsed_ms(&self, now: Instant) -> u64 {
        match self.transaction_started_at {
            Some(started_at) => now.saturating_duration_since(started_at).as_millis() as u64,
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::MessageToPublish;
    use std::time::Duration;

    fn ack(aggregate_id: Option<&str>, offset: i64) -> RecordAck {
        RecordAck {
            aggregate_id: aggregate_id.map(str::to_string),
            topic: "aggregate-state".to_string(),
            partition: 1,
            offset,
        }
    }

    fn progress(current_offset: i64, end_offset: i64) -> KTableProgress {
        KTableProgress {
            topic: "aggregate-state".to_string(),
            partition: 1,
            current_offset,
            end_offset,
        }
    }

    fn write(aggregate_id: &str) -> (PendingWrite, oneshot::Receiver<Result<PublishSuccess>>) {
        let (tx, rx) = oneshot::channel();
        let state = MessageToPublish::new(aggregate_id, "snapshot");
        let request = PublishRequest::new(aggregate_id, state, vec![]).unwrap();
        (
            PendingWrite {
                sender: tx,
                request,
                correlation_id: Uuid::new_v4(),
            },
            rx,
        )
    }

    fn init(
        aggregate_id: &str,
        deadline: Instant,
    ) -> (PendingInit, oneshot::Receiver<bool>) {
        let (tx, rx) = oneshot::channel();
        (
            PendingInit {
                sender: tx,
                aggregate_id: aggregate_id.to_string(),
                deadline,
                correlation_id: Uuid::new_v4(),
            },
            rx,
        )
    }

    #[test]
    fn test_in_flight_keeps_newest_offset_only() {
        let mut state = PublisherState::new();
        state.add_in_flight(vec![ack(Some("a"), 5)]);
        state.add_in_flight(vec![ack(Some("a"), 9)]);
        state.add_in_flight(vec![ack(Some("a"), 7)]);

        assert_eq!(state.in_flight_len(), 1);
        assert_eq!(state.in_flight_for("a").unwrap().offset, 9);
    }

    #[test]
    fn test_in_flight_equal_offset_not_replaced() {
        let mut state = PublisherState::new();
        state.add_in_flight(vec![ack(Some("a"), 5)]);
        state.add_in_flight(vec![ack(Some("a"), 5)]);
        assert_eq!(state.in_flight_for("a").unwrap().offset, 5);
    }

    #[test]
    fn test_keyless_acks_advance_high_water_only() {
        let mut state = PublisherState::new();
        state.add_in_flight(vec![ack(None, 3), ack(None, 8), ack(None, 6)]);
        assert_eq!(state.in_flight_len(), 0);
        assert_eq!(state.keyless_high_water(), Some(8));
    }

    #[test]
    fn test_flush_writes_drains_fifo() {
        let mut state = PublisherState::new();
        let (w1, _rx1) = write("a");
        let (w2, _rx2) = write("b");
        state.add_pending_write(w1);
        state.add_pending_write(w2);

        let batch = state.flush_writes(1024);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].request.aggregate_id, "a");
        assert_eq!(batch[1].request.aggregate_id, "b");
        assert_eq!(state.pending_write_count(), 0);
    }

    #[test]
    fn test_flush_writes_respects_record_cap() {
        let mut state = PublisherState::new();
        for id in ["a", "b", "c"] {
            let (tx, _rx) = oneshot::channel();
            let events = vec![
                MessageToPublish::new(id, "e1"),
                MessageToPublish::new(id, "e2"),
                MessageToPublish::new(id, "e3"),
            ];
            let request =
                PublishRequest::new(id, MessageToPublish::new(id, "s"), events).unwrap();
            state.add_pending_write(PendingWrite {
                sender: tx,
                request,
                correlation_id: Uuid::new_v4(),
            });
            drop(_rx);
        }

        // Each request is 4 records; a cap of 8 drains exactly two.
        let batch = state.flush_writes(8);
        assert_eq!(batch.len(), 2);
        assert_eq!(state.pending_write_count(), 1);
    }

    #[test]
    fn test_flush_writes_always_drains_one() {
        let mut state = PublisherState::new();
        let (tx, _rx) = oneshot::channel();
        let events = vec![
            MessageToPublish::new("a", "e1"),
            MessageToPublish::new("a", "e2"),
        ];
        let request =
            PublishRequest::new("a", MessageToPublish::new("a", "s"), events).unwrap();
        state.add_pending_write(PendingWrite {
            sender: tx,
            request,
            correlation_id: Uuid::new_v4(),
        });

        let batch = state.flush_writes(1);
        assert_eq!(batch.len(), 1);
        assert_eq!(state.pending_write_count(), 0);
    }

    #[test]
    fn test_requeue_preserves_order() {
        let mut state = PublisherState::new();
        let (w1, _rx1) = write("a");
        let (w2, _rx2) = write("b");
        let (w3, _rx3) = write("c");
        state.add_pending_write(w1);
        state.add_pending_write(w2);
        state.add_pending_write(w3);

        let batch = state.flush_writes(2);
        assert_eq!(batch.len(), 2);
        state.requeue_writes(batch);

        let drained = state.flush_writes(1024);
        let order: Vec<&str> = drained
            .iter()
            .map(|w| w.request.aggregate_id.as_str())
            .collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_processed_up_to_not_in_flight_is_true() {
        let mut state = PublisherState::new();
        let now = Instant::now();
        let (p, _rx) = init("a", now + Duration::from_secs(10));
        state.add_pending_init(p);

        let decisions = state.processed_up_to(&progress(0, 0), now);
        assert_eq!(decisions.len(), 1);
        assert!(decisions[0].decision);
        assert_eq!(state.pending_init_count(), 0);
    }

    #[test]
    fn test_processed_up_to_covered_resolves_and_retires() {
        let mut state = PublisherState::new();
        state.add_in_flight(vec![ack(Some("a"), 7)]);
        let now = Instant::now();
        let (p, _rx) = init("a", now + Duration::from_secs(10));
        state.add_pending_init(p);

        let decisions = state.processed_up_to(&progress(7, 7), now);
        assert_eq!(decisions.len(), 1);
        assert!(decisions[0].decision);
        assert!(state.in_flight_for("a").is_none());
    }

    #[test]
    fn test_processed_up_to_expired_is_false() {
        let mut state = PublisherState::new();
        state.add_in_flight(vec![ack(Some("a"), 7)]);
        let now = Instant::now();
        let (p, _rx) = init("a", now - Duration::from_millis(1));
        state.add_pending_init(p);

        let decisions = state.processed_up_to(&progress(2, 7), now);
        assert_eq!(decisions.len(), 1);
        assert!(!decisions[0].decision);
        // The in-flight entry survives; only the query expired.
        assert!(state.in_flight_for("a").is_some());
    }

    #[test]
    fn test_processed_up_to_behind_stays_pending() {
        let mut state = PublisherState::new();
        state.add_in_flight(vec![ack(Some("a"), 7)]);
        let now = Instant::now();
        let (p, _rx) = init("a", now + Duration::from_secs(10));
        state.add_pending_init(p);

        let decisions = state.processed_up_to(&progress(2, 7), now);
        assert!(decisions.is_empty());
        assert_eq!(state.pending_init_count(), 1);
    }

    #[test]
    fn test_processed_up_to_duplicate_queries_each_answered() {
        let mut state = PublisherState::new();
        state.add_in_flight(vec![ack(Some("a"), 7)]);
        let now = Instant::now();
        let (p1, _rx1) = init("a", now + Duration::from_secs(10));
        let (p2, _rx2) = init("a", now + Duration::from_secs(10));
        state.add_pending_init(p1);
        state.add_pending_init(p2);

        // The first query retires the entry, the second sees it gone.
        let decisions = state.processed_up_to(&progress(7, 7), now);
        assert_eq!(decisions.len(), 2);
        assert!(decisions.iter().all(|d| d.decision));
    }

    #[test]
    fn test_processed_up_to_prunes_unqueried_entries() {
        let mut state = PublisherState::new();
        state.add_in_flight(vec![ack(Some("a"), 3), ack(Some("b"), 9)]);

        let decisions = state.processed_up_to(&progress(5, 9), Instant::now());
        assert!(decisions.is_empty());
        assert!(state.in_flight_for("a").is_none());
        assert_eq!(state.in_flight_for("b").unwrap().offset, 9);
    }

    #[test]
    fn test_round_trip_progress_covering_all() {
        let mut state = PublisherState::new();
        state.add_in_flight(vec![ack(Some("a"), 3), ack(Some("b"), 5)]);
        let now = Instant::now();
        let (p1, _rx1) = init("a", now + Duration::from_secs(10));
        let (p2, _rx2) = init("b", now + Duration::from_secs(10));
        state.add_pending_init(p1);
        state.add_pending_init(p2);

        let decisions = state.processed_up_to(&progress(5, 5), now);
        assert_eq!(decisions.len(), 2);
        assert!(decisions.iter().all(|d| d.decision));
        assert_eq!(state.in_flight_len(), 0);
        assert_eq!(state.pending_init_count(), 0);
    }

    #[test]
    fn test_transaction_timing() {
        let mut state = PublisherState::new();
        let now = Instant::now();
        assert!(!state.transaction_open());
        assert_eq!(state.transaction_elapsed_ms(now), 0);

        state.begin_transaction(now);
        assert!(state.transaction_open());
        assert_eq!(
            state.transaction_elapsed_ms(now + Duration::from_millis(120)),
            120
        );

        state.clear_transaction();
        assert!(!state.transaction_open());
        assert_eq!(state.transaction_elapsed_ms(now + Duration::from_secs(1)), 0);
    }
}
