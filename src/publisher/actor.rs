//! Publisher state machine
//!
//! The single-writer actor owning one partition's transactional producer
//! identity. Messages arrive through an unbounded mailbox and are processed
//! one at a time; while a handler awaits the producer, the mailbox keeps
//! accepting but does not process. Publish requests and readiness queries
//! that arrive before the transactional identity is acquired are stashed and
//! drained once initialization completes.

use crate::config::PublisherConfig;
use crate::error::{ProducerError, Result, StatelineError};
use crate::health::{HealthStatus, PublisherStatsInner};
use crate::ktable::KTableProgress;
use crate::producer::{ProducerProvider, RecordToSend, TransactionalProducer};
use crate::publisher::state::{InitDecision, PendingInit, PendingWrite, PublisherState};
use crate::publisher::{PartitionAssignment, PublishSuccess};
use crate::record::RecordAck;
use futures_util::future::join_all;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Messages accepted by the publisher mailbox
pub(crate) enum PublisherCommand {
    Publish {
        request: crate::record::PublishRequest,
        reply: oneshot::Sender<Result<PublishSuccess>>,
        correlation_id: Uuid,
    },
    IsStateCurrent {
        aggregate_id: String,
        deadline: Instant,
        reply: oneshot::Sender<bool>,
        correlation_id: Uuid,
    },
    ProgressUpdate(KTableProgress),
    HealthCheck {
        reply: oneshot::Sender<HealthStatus>,
    },
    Terminate,
}

/// Lifecycle of a partition publisher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PublisherPhase {
    /// Acquiring the transactional identity; publish traffic is stashed
    Uninitialized,
    /// Identity acquired, no transaction open
    Ready,
    /// A transaction is open and being flushed
    Publishing,
    /// Rebuilding the producer after a transient fault
    Recovering,
    /// The producer identity was claimed by a newer instance. Terminal.
    Fenced,
}

impl std::fmt::Display for PublisherPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::Ready => write!(f, "ready"),
            Self::Publishing => write!(f, "publishing"),
            Self::Recovering => write!(f, "recovering"),
            Self::Fenced => write!(f, "fenced"),
        }
    }
}

/// Whether the actor keeps running after a handler
#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// Outcome of one flush attempt
enum FlushOutcome {
    /// Nothing to do, or the batch committed / failed terminally for its
    /// senders; stay in `Ready`
    Stay,
    /// Transient fault: rebuild the producer and re-initialize
    Recover,
    /// Fenced: terminate
    Fenced,
}

pub(crate) struct PublisherActor {
    assignment: PartitionAssignment,
    config: PublisherConfig,
    producer: Box<dyn TransactionalProducer>,
    provider: Box<dyn ProducerProvider>,
    state: PublisherState,
    stash: Vec<PublisherCommand>,
    phase: PublisherPhase,
    stats: Arc<PublisherStatsInner>,
    terminated_tx: watch::Sender<bool>,
}

type Mailbox = mpsc::UnboundedReceiver<PublisherCommand>;

impl PublisherActor {
    pub(crate) fn new(
        assignment: PartitionAssignment,
        config: PublisherConfig,
        provider: Box<dyn ProducerProvider>,
        stats: Arc<PublisherStatsInner>,
        terminated_tx: watch::Sender<bool>,
    ) -> Self {
        let producer = provider.create();
        Self {
            assignment,
            config,
            producer,
            provider,
            state: PublisherState::new(),
            stash: Vec::new(),
            phase: PublisherPhase::Uninitialized,
            stats,
            terminated_tx,
        }
    }

    pub(crate) async fn run(mut self, mut rx: Mailbox) {
        info!(
            state_topic = %self.assignment.state_topic,
            partition = self.assignment.partition,
            aggregate = %self.assignment.aggregate_name,
            "partition publisher starting"
        );

        loop {
            let flow = match self.phase {
                PublisherPhase::Uninitialized => self.run_uninitialized(&mut rx).await,
                PublisherPhase::Ready => self.run_ready(&mut rx).await,
                _ => Flow::Stop,
            };
            if flow == Flow::Stop {
                break;
            }
        }

        self.shutdown(&mut rx);
    }

    /// Acquire the transactional identity, retrying forever with capped
    /// exponential backoff. Control messages are processed during backoff
    /// windows; publish traffic is stashed.
    async fn run_uninitialized(&mut self, rx: &mut Mailbox) -> Flow {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            self.stats.record_init_attempt();
            match self.producer.init_transactions().await {
                Ok(()) => {
                    info!(
                        partition = self.assignment.partition,
                        attempt, "transactional identity acquired"
                    );
                    self.phase = PublisherPhase::Ready;
                    self.drain_stash();
                    return Flow::Continue;
                }
                Err(e) => {
                    let delay = self.config.init_backoff_delay(attempt);
                    warn!(
                        partition = self.assignment.partition,
                        attempt,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "init_transactions failed, retrying"
                    );
                    let deadline = Instant::now() + delay;
                    loop {
                        tokio::select! {
                            _ = tokio::time::sleep_until(deadline) => break,
                            maybe = rx.recv() => match maybe {
                                None => return Flow::Stop,
                                Some(cmd) => {
                                    if self.handle_while_uninitialized(cmd) == Flow::Stop {
                                        return Flow::Stop;
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    fn handle_while_uninitialized(&mut self, cmd: PublisherCommand) -> Flow {
        match cmd {
            PublisherCommand::Publish { .. } | PublisherCommand::IsStateCurrent { .. } => {
                self.stash.push(cmd);
                Flow::Continue
            }
            PublisherCommand::ProgressUpdate(progress) => {
                self.apply_progress(progress);
                Flow::Continue
            }
            PublisherCommand::HealthCheck { reply } => {
                let _ = reply.send(HealthStatus::Up);
                Flow::Continue
            }
            PublisherCommand::Terminate => Flow::Stop,
        }
    }

    /// Move stashed traffic into the state: publishes join the pending-write
    /// FIFO in arrival order, readiness queries become pending inits and are
    /// settled by the next progress update.
    fn drain_stash(&mut self) {
        let stashed = std::mem::take(&mut self.stash);
        if stashed.is_empty() {
            return;
        }
        debug!(
            partition = self.assignment.partition,
            count = stashed.len(),
            "draining stashed messages"
        );
        for cmd in stashed {
            match cmd {
                PublisherCommand::Publish {
                    request,
                    reply,
                    correlation_id,
                } => self.state.add_pending_write(PendingWrite {
                    sender: reply,
                    request,
                    correlation_id,
                }),
                PublisherCommand::IsStateCurrent {
                    aggregate_id,
                    deadline,
                    reply,
                    correlation_id,
                } => self.state.add_pending_init(PendingInit {
                    sender: reply,
                    aggregate_id,
                    deadline,
                    correlation_id,
                }),
                _ => {}
            }
        }
    }

    async fn run_ready(&mut self, rx: &mut Mailbox) -> Flow {
        let interval = self.config.flush_interval();
        let mut flush = tokio::time::interval_at(Instant::now() + interval, interval);
        flush.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                maybe = rx.recv() => match maybe {
                    None => return Flow::Stop,
                    Some(cmd) => {
                        if self.handle_ready(cmd) == Flow::Stop {
                            return Flow::Stop;
                        }
                    }
                },
                _ = flush.tick() => {
                    match self.flush_messages().await {
                        FlushOutcome::Stay => {}
                        FlushOutcome::Recover => {
                            self.recover();
                            return Flow::Continue;
                        }
                        FlushOutcome::Fenced => {
                            self.phase = PublisherPhase::Fenced;
                            return Flow::Continue;
                        }
                    }
                }
            }
        }
    }

    fn handle_ready(&mut self, cmd: PublisherCommand) -> Flow {
        match cmd {
            PublisherCommand::Publish {
                request,
                reply,
                correlation_id,
            } => {
                debug!(
                    partition = self.assignment.partition,
                    aggregate_id = %request.aggregate_id,
                    correlation_id = %correlation_id,
                    events = request.events.len(),
                    "queueing publish request"
                );
                self.state.add_pending_write(PendingWrite {
                    sender: reply,
                    request,
                    correlation_id,
                });
                Flow::Continue
            }
            PublisherCommand::IsStateCurrent {
                aggregate_id,
                deadline,
                reply,
                correlation_id,
            } => {
                if self.state.in_flight_for(&aggregate_id).is_none() {
                    let _ = reply.send(true);
                } else {
                    self.state.add_pending_init(PendingInit {
                        sender: reply,
                        aggregate_id,
                        deadline,
                        correlation_id,
                    });
                }
                Flow::Continue
            }
            PublisherCommand::ProgressUpdate(progress) => {
                self.apply_progress(progress);
                Flow::Continue
            }
            PublisherCommand::HealthCheck { reply } => {
                let _ = reply.send(HealthStatus::Up);
                Flow::Continue
            }
            PublisherCommand::Terminate => {
                info!(
                    partition = self.assignment.partition,
                    "terminate requested"
                );
                Flow::Stop
            }
        }
    }

    /// Join a lag snapshot for the owned partition against pending readiness
    /// queries. Snapshots for other topic-partitions are ignored.
    fn apply_progress(&mut self, progress: KTableProgress) {
        if progress.topic != self.assignment.state_topic
            || progress.partition != self.assignment.partition
        {
            return;
        }
        let decisions = self.state.processed_up_to(&progress, Instant::now());
        debug!(
            partition = self.assignment.partition,
            current_offset = progress.current_offset,
            lag = progress.lag(),
            resolved = decisions.len(),
            in_flight = self.state.in_flight_len(),
            pending_inits = self.state.pending_init_count(),
            "applied progress snapshot"
        );
        for InitDecision {
            sender,
            decision,
            aggregate_id,
            correlation_id,
        } in decisions
        {
            debug!(
                partition = self.assignment.partition,
                aggregate_id = %aggregate_id,
                correlation_id = %correlation_id,
                decision,
                "readiness query resolved"
            );
            let _ = sender.send(decision);
        }
    }

    /// Drain pending writes into one transaction: begin, put one record per
    /// event plus the pinned state record per request, await all acks,
    /// commit. Requests arriving while the transaction is open stay queued
    /// for the next flush.
    async fn flush_messages(&mut self) -> FlushOutcome {
        if self.state.transaction_open() || self.state.pending_write_count() == 0 {
            return FlushOutcome::Stay;
        }

        let batch = self.state.flush_writes(self.config.transaction_max_records);
        self.phase = PublisherPhase::Publishing;
        let started_at = Instant::now();
        self.state.begin_transaction(started_at);

        if let Err(e) = self.producer.begin() {
            self.state.clear_transaction();
            self.phase = PublisherPhase::Ready;
            if e.is_fenced() {
                error!(partition = self.assignment.partition, error = %e, "fenced on begin");
                self.fail_batch(batch, &e);
                return FlushOutcome::Fenced;
            }
            warn!(partition = self.assignment.partition, error = %e, "begin failed");
            self.state.requeue_writes(batch);
            return FlushOutcome::Recover;
        }

        let (records, spans) = self.build_records(&batch);
        let record_count = records.len();
        debug!(
            partition = self.assignment.partition,
            requests = batch.len(),
            records = record_count,
            "publishing batch"
        );

        let results = join_all(self.producer.put_records(records)).await;

        if let Some(cause) = first_error(&results) {
            let fenced = results
                .iter()
                .filter_map(|r| r.as_ref().err())
                .any(ProducerError::is_fenced);
            self.state.clear_transaction();
            self.phase = PublisherPhase::Ready;
            if fenced {
                error!(partition = self.assignment.partition, error = %cause, "fenced on put_records");
                self.fail_batch(batch, &cause);
                return FlushOutcome::Fenced;
            }
            warn!(
                partition = self.assignment.partition,
                error = %cause,
                "record ack failed, aborting batch"
            );
            if let Err(abort_err) = self.producer.abort() {
                if abort_err.is_fenced() {
                    self.fail_batch(batch, &cause);
                    return FlushOutcome::Fenced;
                }
                warn!(partition = self.assignment.partition, error = %abort_err, "abort failed");
            }
            self.fail_batch(batch, &cause);
            return FlushOutcome::Stay;
        }

        match self.producer.commit().await {
            Ok(()) => {
                let elapsed_ms = self.state.transaction_elapsed_ms(Instant::now());
                let acks: Vec<RecordAck> = results
                    .into_iter()
                    .filter_map(std::result::Result::ok)
                    .collect();
                self.reply_success(batch, &acks, &spans);
                let state_acks: Vec<RecordAck> = acks
                    .into_iter()
                    .filter(|ack| ack.topic == self.assignment.state_topic)
                    .collect();
                self.state.add_in_flight(state_acks);
                self.state.clear_transaction();
                self.phase = PublisherPhase::Ready;
                self.stats.record_commit(record_count as u64);
                debug!(
                    partition = self.assignment.partition,
                    records = record_count,
                    elapsed_ms,
                    "transaction committed"
                );
                FlushOutcome::Stay
            }
            Err(e) => {
                self.state.clear_transaction();
                self.phase = PublisherPhase::Ready;
                if e.is_fenced() {
                    error!(partition = self.assignment.partition, error = %e, "fenced on commit");
                    self.fail_batch(batch, &e);
                    return FlushOutcome::Fenced;
                }
                warn!(partition = self.assignment.partition, error = %e, "commit failed, aborting");
                if let Err(abort_err) = self.producer.abort() {
                    if abort_err.is_fenced() {
                        self.fail_batch(batch, &e);
                        return FlushOutcome::Fenced;
                    }
                    warn!(partition = self.assignment.partition, error = %abort_err, "abort failed");
                }
                self.fail_batch(batch, &e);
                FlushOutcome::Recover
            }
        }
    }

    /// Expand a batch into the physical record list: for each request, one
    /// record per event on the events topic (partition left to the broker),
    /// then the state record pinned to the owned partition. Returns the
    /// records and, per request, the index range it occupies.
    fn build_records(&self, batch: &[PendingWrite]) -> (Vec<RecordToSend>, Vec<(usize, usize)>) {
        let mut records = Vec::new();
        let mut spans = Vec::with_capacity(batch.len());
        for write in batch {
            let start = records.len();
            for event in &write.request.events {
                records.push(RecordToSend {
                    topic: self.assignment.events_topic.clone(),
                    partition: None,
                    key: event.key.clone(),
                    value: event.value.clone(),
                    headers: event.headers.clone(),
                    aggregate_id: None,
                });
            }
            records.push(RecordToSend {
                topic: self.assignment.state_topic.clone(),
                partition: Some(self.assignment.partition),
                key: write.request.state.key.clone(),
                value: write.request.state.value.clone(),
                headers: write.request.state.headers.clone(),
                aggregate_id: Some(write.request.aggregate_id.clone()),
            });
            spans.push((start, records.len() - start));
        }
        (records, spans)
    }

    fn reply_success(&self, batch: Vec<PendingWrite>, acks: &[RecordAck], spans: &[(usize, usize)]) {
        for (write, &(start, len)) in batch.into_iter().zip(spans.iter()) {
            let state_ack = acks[start + len - 1].clone();
            let event_acks = acks[start..start + len - 1].to_vec();
            let _ = write.sender.send(Ok(PublishSuccess {
                correlation_id: write.correlation_id,
                state_ack,
                event_acks,
            }));
        }
    }

    fn fail_batch(&self, batch: Vec<PendingWrite>, cause: &ProducerError) {
        self.stats.record_publish_failures(batch.len() as u64);
        for write in batch {
            debug!(
                partition = self.assignment.partition,
                aggregate_id = %write.request.aggregate_id,
                correlation_id = %write.correlation_id,
                "publish failed"
            );
            let _ = write
                .sender
                .send(Err(StatelineError::Producer(cause.clone())));
        }
    }

    /// Close and rebuild the producer after a transient fault, then go back
    /// through initialization. Pending writes and pending inits survive.
    fn recover(&mut self) {
        self.phase = PublisherPhase::Recovering;
        self.stats.record_recovery();
        warn!(
            partition = self.assignment.partition,
            pending_writes = self.state.pending_write_count(),
            "rebuilding producer"
        );
        self.producer.close();
        self.producer = self.provider.create();
        self.phase = PublisherPhase::Uninitialized;
    }

    fn shutdown(&mut self, rx: &mut Mailbox) {
        info!(
            partition = self.assignment.partition,
            phase = %self.phase,
            "partition publisher stopping"
        );
        self.producer.close();
        rx.close();
        // Dropping the state here drops every unanswered reply channel, so
        // pending callers observe termination.
        self.state = PublisherState::new();
        let _ = self.terminated_tx.send(true);
    }
}

fn first_error(results: &[std::result::Result<RecordAck, ProducerError>]) -> Option<ProducerError> {
    results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .next()
        .cloned()
}
