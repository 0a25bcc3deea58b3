//! The root operator that ships a fragment's output to other workers.
//!
//! A [`Producer`] pulls batches from its child, splits each with its
//! partition function and queues the pieces per output channel. Each
//! pull cycle then drains as much of every queue as the channels
//! accept. Channel `i` is destination `i` of the partition function;
//! channels are ordered worker-major, operator-minor.
//!
//! What happens when a destination stops accepting writes depends on
//! the [`FtMode`]:
//!
//! * `NONE`: the rejected write fails the fragment.
//! * `ABANDON`: the channel is skipped, its queue is kept until
//!   cleanup.
//! * `REJOIN`: as `ABANDON`, and every batch is first recorded in the
//!   channel's backup buffer so it can be replayed to a rejoined
//!   worker. The producer does not finish while any queue is
//!   non-empty.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arrow::datatypes::SchemaRef;
use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry::KeyValue;
use tracing::instrument;

use crate::batch::TupleBatch;
use crate::channel::{
    availability_queue, AvailabilityNotifier, AvailabilityQueue, AvailabilitySender,
    ChannelFactory, ChannelState, ExchangePairId, OutputChannel, StreamChannelId, WorkerId,
    WriteRejected,
};
use crate::config::{ExchangeConfig, ExecutionMode, FtMode};
use crate::errors::{tracked_bad_request, ExchangeError, ExchangeResult, ExchangeResultExt};
use crate::operator::Operator;
use crate::partition::PartitionFunction;
use crate::streaming_state::StreamingState;
use crate::with_timer;

mod variants;

/// Which flavor of producer this is. Used in logs and metric labels.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ProducerKind {
    GenericShuffle,
    Collect,
    LocalMultiway,
    Broadcast,
    EosController,
    HyperShuffle,
}

impl ProducerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::GenericShuffle => "generic_shuffle",
            Self::Collect => "collect",
            Self::LocalMultiway => "local_multiway",
            Self::Broadcast => "broadcast",
            Self::EosController => "eos_controller",
            Self::HyperShuffle => "hyper_shuffle",
        }
    }
}

impl fmt::Display for ProducerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A queued batch and whether the backup buffer has already seen it.
#[derive(Debug)]
struct PendingBatch {
    batch: TupleBatch,
    backed_up: bool,
}

impl PendingBatch {
    fn new(batch: TupleBatch) -> Self {
        Self {
            batch,
            backed_up: false,
        }
    }
}

enum WriteOutcome {
    Written,
    /// The write was abandoned; the batch is handed back.
    NotWritten(TupleBatch),
    Rejected(WriteRejected),
}

struct ProducerMetrics {
    tuples_written: Counter<u64>,
    batches_written: Counter<u64>,
    write_rejections: Counter<u64>,
    partition_histogram: Histogram<f64>,
    labels: Vec<KeyValue>,
}

impl ProducerMetrics {
    fn new(kind: ProducerKind, this_worker: WorkerId) -> Self {
        let meter = opentelemetry::global::meter("shuffle_exchange");
        let tuples_written = meter
            .u64_counter("tuples_written")
            .with_description("number of tuples this producer handed to its channels")
            .init();
        let batches_written = meter
            .u64_counter("batches_written")
            .with_description("number of batches this producer handed to its channels")
            .init();
        let write_rejections = meter
            .u64_counter("write_rejections")
            .with_description("number of writes refused by a channel")
            .init();
        let partition_histogram = meter
            .f64_histogram("partition_batch_duration_seconds")
            .with_description("time to split one input batch across destinations in seconds")
            .init();
        let labels = vec![
            KeyValue::new("producer", kind.as_str()),
            KeyValue::new("worker_id", this_worker.to_string()),
        ];
        Self {
            tuples_written,
            batches_written,
            write_rejections,
            partition_histogram,
            labels,
        }
    }
}

/// State that only exists once the producer is running.
struct Running {
    config: ExchangeConfig,
    this_worker: WorkerId,
    channels: Vec<Option<Box<dyn OutputChannel>>>,
    states: Vec<ChannelState>,
    pending: Vec<VecDeque<PendingBatch>>,
    backups: Vec<Box<dyn StreamingState>>,
    events_tx: AvailabilitySender,
    events: AvailabilityQueue,
    metrics: ProducerMetrics,
}

pub struct Producer {
    kind: ProducerKind,
    child: Box<dyn Operator>,
    /// `None` only for the EOS controller, which ships no data.
    partition: Option<PartitionFunction>,
    operator_ids: Vec<ExchangePairId>,
    destination_workers: Vec<WorkerId>,
    output_ids: Vec<StreamChannelId>,
    running: Option<Running>,
    interrupted: Arc<AtomicBool>,
    num_tuples_written: u64,
    eos: bool,
    eoi: bool,
}

impl fmt::Debug for Producer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Producer")
            .field("kind", &self.kind)
            .field("output_ids", &self.output_ids)
            .field("num_tuples_written", &self.num_tuples_written)
            .field("eos", &self.eos)
            .field("eoi", &self.eoi)
            .finish()
    }
}

impl Producer {
    /// Shared constructor of the variants in [`variants`].
    ///
    /// The partition function, if any, must already be bound to
    /// exactly one destination per channel.
    fn new(
        kind: ProducerKind,
        child: Box<dyn Operator>,
        operator_ids: Vec<ExchangePairId>,
        destination_workers: Vec<WorkerId>,
        partition: Option<PartitionFunction>,
    ) -> ExchangeResult<Self> {
        if operator_ids.is_empty() || destination_workers.is_empty() {
            return Err(tracked_bad_request(&format!(
                "{kind} producer needs at least one operator id and one worker, got {} and {}",
                operator_ids.len(),
                destination_workers.len()
            )));
        }
        let num_channels = operator_ids.len() * destination_workers.len();
        if let Some(pf) = &partition {
            let num_destinations = pf.num_destinations().reraise("building producer")?;
            if num_destinations != num_channels {
                return Err(tracked_bad_request(&format!(
                    "{} partition function has {num_destinations} destinations but {kind} producer has {num_channels} channels",
                    pf.kind()
                )));
            }
        }

        // Worker-major, operator-minor.
        let output_ids = destination_workers
            .iter()
            .flat_map(|&worker| {
                operator_ids
                    .iter()
                    .map(move |&op| StreamChannelId::new(op, worker))
            })
            .collect();

        Ok(Self {
            kind,
            child,
            partition,
            operator_ids,
            destination_workers,
            output_ids,
            running: None,
            interrupted: Arc::new(AtomicBool::new(false)),
            num_tuples_written: 0,
            eos: false,
            eoi: false,
        })
    }

    /// Open every channel and get ready to pull.
    ///
    /// Destinations given as [`WorkerId::SELF`] are bound to
    /// `this_worker` here.
    #[instrument(name = "producer_init", skip_all, fields(kind = %self.kind, worker = %this_worker))]
    pub fn init(
        &mut self,
        this_worker: WorkerId,
        config: ExchangeConfig,
        factory: &mut dyn ChannelFactory,
    ) -> ExchangeResult<()> {
        if self.running.is_some() {
            return Err(ExchangeError::Internal(format!(
                "{} producer initialized twice",
                self.kind
            )));
        }
        for id in &mut self.output_ids {
            id.worker_id = id.worker_id.resolve(this_worker);
        }

        let num_channels = self.output_ids.len();
        let (events_tx, events) = availability_queue(config.availability_queue_depth);
        let mut running = Running {
            this_worker,
            channels: Vec::with_capacity(num_channels),
            states: vec![ChannelState::Uninitialized; num_channels],
            pending: (0..num_channels).map(|_| VecDeque::new()).collect(),
            backups: (0..num_channels)
                .map(|_| config.backup_buffer.build())
                .collect(),
            events_tx,
            events,
            metrics: ProducerMetrics::new(self.kind, this_worker),
            config,
        };
        for (i, id) in self.output_ids.iter().enumerate() {
            let notifier = AvailabilityNotifier::new(i, running.events_tx.clone());
            let channel = factory
                .start_stream(i, *id, notifier)
                .reraise(&format!("opening channel {i} to {id}"))?;
            running.channels.push(Some(channel));
            running.states[i] = ChannelState::Open;
        }
        tracing::info!(
            "{} producer started {num_channels} channels, ft mode {:?}, {:?}",
            self.kind,
            running.config.ft_mode,
            running.config.execution_mode
        );
        self.running = Some(running);
        Ok(())
    }

    fn running(&self) -> ExchangeResult<&Running> {
        self.running
            .as_ref()
            .ok_or_else(|| ExchangeError::Internal(format!("{} producer not initialized", self.kind)))
    }

    fn running_mut(&mut self) -> ExchangeResult<&mut Running> {
        let kind = self.kind;
        self.running
            .as_mut()
            .ok_or_else(|| ExchangeError::Internal(format!("{kind} producer not initialized")))
    }

    pub fn kind(&self) -> ProducerKind {
        self.kind
    }

    pub fn partition_function(&self) -> Option<&PartitionFunction> {
        self.partition.as_ref()
    }

    pub fn operator_ids(&self) -> &[ExchangePairId] {
        &self.operator_ids
    }

    pub fn destination_workers(&self) -> &[WorkerId] {
        &self.destination_workers
    }

    pub fn num_channels(&self) -> usize {
        self.output_ids.len()
    }

    /// Destination of each channel, by channel index.
    pub fn output_channel_ids(&self) -> &[StreamChannelId] {
        &self.output_ids
    }

    pub fn channel_state(&self, channel: usize) -> Option<ChannelState> {
        match &self.running {
            Some(running) => running.states.get(channel).copied(),
            None => (channel < self.num_channels()).then_some(ChannelState::Uninitialized),
        }
    }

    pub fn channel_indices_of_worker(&self, worker: WorkerId) -> Vec<usize> {
        self.output_ids
            .iter()
            .enumerate()
            .filter(|(_, id)| id.worker_id == worker)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn num_pending_batches(&self, channel: usize) -> usize {
        self.running
            .as_ref()
            .and_then(|running| running.pending.get(channel))
            .map_or(0, VecDeque::len)
    }

    /// Tuples queued but not yet handed to a channel.
    pub fn num_pending_tuples(&self) -> usize {
        self.running.as_ref().map_or(0, |running| {
            running
                .pending
                .iter()
                .flatten()
                .map(|entry| entry.batch.num_tuples())
                .sum()
        })
    }

    /// Tuples held by the backup buffers for replay.
    pub fn num_tuples_in_buffers(&self) -> usize {
        self.running.as_ref().map_or(0, |running| {
            running.backups.iter().map(|state| state.num_tuples()).sum()
        })
    }

    pub fn num_tuples_written(&self) -> u64 {
        self.num_tuples_written
    }

    /// Setting this flag abandons any write waiting for a channel in
    /// blocking mode. The flag stays set.
    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        self.interrupted.clone()
    }

    fn ft_mode(&self) -> FtMode {
        self.running
            .as_ref()
            .map_or(FtMode::None, |running| running.config.ft_mode)
    }

    fn uses_backup_buffer(&self) -> bool {
        self.ft_mode() == FtMode::Rejoin && self.kind != ProducerKind::LocalMultiway
    }

    fn set_state(&mut self, channel: usize, available: bool) -> ExchangeResult<()> {
        apply_availability(&mut self.running_mut()?.states, channel, available);
        Ok(())
    }

    /// Enable or disable every channel to `worker`. Called by the
    /// failure detector when a worker dies or comes back.
    pub fn update_channel_availability(
        &mut self,
        worker: WorkerId,
        enable: bool,
    ) -> ExchangeResult<()> {
        for channel in self.channel_indices_of_worker(worker) {
            self.set_state(channel, enable)?;
        }
        Ok(())
    }

    fn process_availability_events(&mut self) -> ExchangeResult<()> {
        let running = self.running_mut()?;
        for event in running.events.drain() {
            apply_availability(&mut running.states, event.channel, event.available);
        }
        Ok(())
    }

    /// Hand one batch to channel `channel`, waiting for it to become
    /// writable in blocking mode.
    fn write_message(&mut self, channel: usize, batch: TupleBatch) -> ExchangeResult<WriteOutcome> {
        let tolerant = self.ft_mode().tolerates_failures();
        let id = self.output_ids[channel];
        let kind = self.kind;
        let Some(running) = self.running.as_mut() else {
            return Err(ExchangeError::Internal(format!("{kind} producer not initialized")));
        };
        if running.config.execution_mode == ExecutionMode::Blocking {
            let max_sleep = running.config.max_backoff_ms;
            let mut sleep_time: u64 = 1;
            loop {
                let writable = running.channels[channel]
                    .as_ref()
                    .map_or(false, |ch| ch.is_writable());
                if writable {
                    break;
                }
                if self.interrupted.load(Ordering::Acquire) {
                    tracing::debug!("interrupted waiting on channel {channel}");
                    return Ok(WriteOutcome::NotWritten(batch));
                }
                std::thread::sleep(Duration::from_millis((sleep_time - 1).min(max_sleep)));
                sleep_time = sleep_time.saturating_mul(2);

                if tolerant {
                    // A worker declared dead while we wait would
                    // otherwise keep us here forever.
                    for event in running.events.drain() {
                        apply_availability(&mut running.states, event.channel, event.available);
                    }
                    if running.states[channel] == ChannelState::Unavailable {
                        return Ok(WriteOutcome::NotWritten(batch));
                    }
                }
            }
        }

        let channel_handle = running.channels[channel]
            .as_mut()
            .ok_or_else(|| ExchangeError::Internal(format!("channel {channel} not started")))?;
        let num_tuples = batch.num_tuples();
        match channel_handle.write(batch) {
            Ok(()) => {
                let metrics = &running.metrics;
                metrics.tuples_written.add(num_tuples as u64, &metrics.labels);
                metrics.batches_written.add(1, &metrics.labels);
                self.num_tuples_written += num_tuples as u64;
                tracing::trace!("wrote {num_tuples} tuples to {id}");
                Ok(WriteOutcome::Written)
            }
            Err(rejected) => {
                let metrics = &running.metrics;
                metrics.write_rejections.add(1, &metrics.labels);
                Ok(WriteOutcome::Rejected(rejected))
            }
        }
    }

    /// Send as much of channel `channel`'s queue as it accepts.
    fn drain_channel(&mut self, channel: usize) -> ExchangeResult<()> {
        let tolerant = self.ft_mode().tolerates_failures();
        let use_backup = self.uses_backup_buffer();
        loop {
            let running = self.running_mut()?;
            match running.states[channel] {
                ChannelState::Unavailable if tolerant => break,
                ChannelState::Released | ChannelState::Uninitialized => break,
                _ => {}
            }
            let Some(PendingBatch { batch, backed_up }) = running.pending[channel].pop_front()
            else {
                break;
            };

            let batch = if use_backup && !backed_up && !batch.is_eoi() {
                match running.backups[channel].update(batch)? {
                    Some(batch) => batch,
                    None => {
                        tracing::trace!("backup buffer withheld a batch for channel {channel}");
                        continue;
                    }
                }
            } else {
                batch
            };
            // Markers never enter the backup buffer, so a marker put
            // back in the queue still counts as untried on rejoin.
            let backed_up = backed_up || (use_backup && !batch.is_eoi());

            match self.write_message(channel, batch)? {
                WriteOutcome::Written => {}
                WriteOutcome::NotWritten(batch) => {
                    self.running_mut()?.pending[channel].push_front(PendingBatch { batch, backed_up });
                    break;
                }
                WriteOutcome::Rejected(WriteRejected { batch, reason }) => {
                    let id = self.output_ids[channel];
                    if !tolerant {
                        return Err(ExchangeError::Transport { channel: id, reason });
                    }
                    tracing::warn!("write to {id} rejected ({reason}), marking channel {channel} unavailable");
                    let running = self.running_mut()?;
                    running.pending[channel].push_front(PendingBatch { batch, backed_up });
                    running.states[channel] = ChannelState::Unavailable;
                    break;
                }
            }
        }
        Ok(())
    }

    fn drain_all(&mut self) -> ExchangeResult<()> {
        for channel in 0..self.num_channels() {
            self.drain_channel(channel)?;
        }
        Ok(())
    }

    /// Queue one piece per channel, then drain.
    fn distribute(&mut self, parts: Vec<TupleBatch>) -> ExchangeResult<()> {
        let running = self.running_mut()?;
        for (queue, part) in running.pending.iter_mut().zip(parts) {
            if part.is_empty() && !part.is_eoi() {
                continue;
            }
            queue.push_back(PendingBatch::new(part));
        }
        self.drain_all()
    }

    fn consume_tuples(&mut self, batch: &TupleBatch) -> ExchangeResult<()> {
        let Some(pf) = &self.partition else {
            tracing::warn!(
                "{} producer dropping {} data tuples",
                self.kind,
                batch.num_tuples()
            );
            return self.drain_all();
        };
        let metrics = &self.running()?.metrics;
        let parts = with_timer!(metrics.partition_histogram, metrics.labels, batch.partition(pf))?;
        self.distribute(parts)
    }

    /// The child finished an iteration: every channel gets an EOI
    /// marker, whatever the partition function.
    fn child_eoi(&mut self) -> ExchangeResult<()> {
        tracing::debug!("{} producer forwarding end of iteration", self.kind);
        let marker = TupleBatch::eoi(self.child.schema());
        self.distribute(vec![marker; self.num_channels()])
    }

    /// The child is exhausted: flush, then release every channel with
    /// nothing left to send.
    fn child_eos(&mut self) -> ExchangeResult<()> {
        self.drain_all()?;
        for channel in 0..self.num_channels() {
            self.release_if_drained(channel)?;
        }
        Ok(())
    }

    fn release_if_drained(&mut self, channel: usize) -> ExchangeResult<()> {
        let tolerant = self.ft_mode().tolerates_failures();
        let id = self.output_ids[channel];
        let running = self.running_mut()?;
        let releasable = match running.states[channel] {
            ChannelState::Open => true,
            // Without fault tolerance an unavailable channel is still
            // written to, so it is also ended.
            ChannelState::Unavailable => !tolerant,
            ChannelState::Released | ChannelState::Uninitialized => false,
        };
        if releasable && running.pending[channel].is_empty() {
            if let Some(ch) = running.channels[channel].as_mut() {
                ch.release();
            }
            running.states[channel] = ChannelState::Released;
            tracing::debug!("released channel {channel} to {id}");
        }
        Ok(())
    }

    fn any_pending(&self) -> bool {
        self.running
            .as_ref()
            .map_or(false, |running| running.pending.iter().any(|q| !q.is_empty()))
    }

    fn check_eos_and_eoi(&mut self) {
        if self.child.eoi() {
            self.eoi = true;
            self.child.set_eoi(false);
        } else if self.child.eos() {
            if self.ft_mode() == FtMode::Rejoin && self.any_pending() {
                // Revisit once the unavailable channels come back.
                return;
            }
            self.set_eos();
        }
    }

    fn set_eos(&mut self) {
        if self.eos {
            return;
        }
        self.eos = true;
        let pending = self.num_pending_tuples();
        if pending > 0 {
            tracing::warn!(
                "{} producer finished with {pending} tuples still queued for unavailable channels",
                self.kind
            );
        }
        tracing::info!(
            "{} producer reached end of stream after writing {} tuples",
            self.kind,
            self.num_tuples_written
        );
    }

    /// One pull cycle. Returns the child batch consumed, if any.
    pub fn next_ready(&mut self) -> ExchangeResult<Option<TupleBatch>> {
        self.running()?;
        if self.eos {
            return Ok(None);
        }
        self.process_availability_events()?;

        let batch = if self.child.eos() {
            None
        } else {
            self.child.next_ready()?
        };
        match &batch {
            Some(batch) => self.consume_tuples(batch)?,
            None if self.child.eoi() => self.child_eoi()?,
            None if self.child.eos() => self.child_eos()?,
            None => self.drain_all()?,
        }
        self.check_eos_and_eoi();
        Ok(batch)
    }

    /// Replace the channels to a worker that came back after a
    /// failure, and replay everything its backup buffers hold ahead
    /// of what was never tried.
    #[instrument(name = "producer_rejoin", skip_all, fields(kind = %self.kind, worker = %worker))]
    pub fn rejoin_worker(
        &mut self,
        worker: WorkerId,
        factory: &mut dyn ChannelFactory,
    ) -> ExchangeResult<()> {
        if self.ft_mode() != FtMode::Rejoin {
            return Err(tracked_bad_request(&format!(
                "worker {worker} cannot rejoin a producer running in {:?} mode",
                self.ft_mode()
            )));
        }
        if self.eos {
            return Err(ExchangeError::Internal(format!(
                "worker {worker} rejoined after the {} producer finished",
                self.kind
            )));
        }

        let channels = self.channel_indices_of_worker(worker);
        for &channel in &channels {
            let id = self.output_ids[channel];
            let running = self.running_mut()?;
            let notifier = AvailabilityNotifier::new(channel, running.events_tx.clone());
            let stream = factory
                .start_stream(channel, id, notifier)
                .reraise(&format!("reopening channel {channel} to {id}"))?;
            // The old stream is dead; dropping it is all that is left.
            running.channels[channel] = Some(stream);

            let untried: Vec<_> = running.pending[channel]
                .drain(..)
                .filter(|entry| !entry.backed_up)
                .collect();
            let replay = running.backups[channel].export();
            tracing::info!(
                "replaying {} batches to {id}, then {} queued",
                replay.len(),
                untried.len()
            );
            running.pending[channel] = replay
                .into_iter()
                .map(|batch| PendingBatch {
                    batch,
                    backed_up: true,
                })
                .chain(untried)
                .collect();
            running.states[channel] = ChannelState::Open;
        }

        for &channel in &channels {
            self.drain_channel(channel)?;
            if self.child.eos() {
                self.release_if_drained(channel)?;
            }
        }
        Ok(())
    }

    /// Release every channel still held, whatever is left to send.
    #[instrument(name = "producer_cleanup", skip_all, fields(kind = %self.kind))]
    pub fn cleanup(&mut self) {
        let Some(running) = self.running.as_mut() else {
            return;
        };
        for (i, id) in self.output_ids.iter().enumerate() {
            let dropped = running.pending[i].len();
            if dropped > 0 {
                tracing::warn!("dropping {dropped} batches never delivered to {id}");
            }
            running.pending[i].clear();
            if running.states[i] != ChannelState::Released {
                if let Some(ch) = running.channels[i].as_mut() {
                    ch.release();
                }
                running.states[i] = ChannelState::Released;
            }
            running.backups[i].clear();
        }
        tracing::debug!("{} producer on worker {} cleaned up", self.kind, running.this_worker);
    }
}

/// Move a channel between open and unavailable. Channels not yet
/// started or already released stay as they are.
fn apply_availability(states: &mut [ChannelState], channel: usize, available: bool) {
    let Some(state) = states.get_mut(channel) else {
        tracing::warn!("availability change for unknown channel {channel}");
        return;
    };
    let next = if available {
        ChannelState::Open
    } else {
        ChannelState::Unavailable
    };
    match *state {
        ChannelState::Released | ChannelState::Uninitialized => {}
        current if current != next => {
            *state = next;
            if available {
                tracing::info!("channel {channel} available again");
            } else {
                tracing::warn!("channel {channel} unavailable");
            }
        }
        _ => {}
    }
}

impl Operator for Producer {
    fn schema(&self) -> SchemaRef {
        self.child.schema()
    }

    fn next_ready(&mut self) -> ExchangeResult<Option<TupleBatch>> {
        Producer::next_ready(self)
    }

    fn eos(&self) -> bool {
        self.eos
    }

    fn eoi(&self) -> bool {
        self.eoi
    }

    fn set_eoi(&mut self, eoi: bool) {
        self.eoi = eoi;
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! A scripted channel that records what it was asked to do.

    use std::sync::{Arc, Mutex};

    use super::*;

    #[derive(Debug, Default)]
    pub(crate) struct Recorded {
        pub(crate) batches: Vec<TupleBatch>,
        pub(crate) releases: usize,
        pub(crate) rejections: usize,
        pub(crate) writable: bool,
        pub(crate) reject: bool,
    }

    impl Recorded {
        pub(crate) fn data_tuples(&self) -> Vec<usize> {
            self.batches
                .iter()
                .filter(|b| !b.is_eoi())
                .map(TupleBatch::num_tuples)
                .collect()
        }

        pub(crate) fn num_eoi(&self) -> usize {
            self.batches.iter().filter(|b| b.is_eoi()).count()
        }
    }

    pub(crate) type Record = Arc<Mutex<Recorded>>;

    pub(crate) struct RecordingChannel {
        id: StreamChannelId,
        record: Record,
    }

    impl OutputChannel for RecordingChannel {
        fn id(&self) -> StreamChannelId {
            self.id
        }

        fn is_writable(&self) -> bool {
            self.record.lock().unwrap().writable
        }

        fn write(&mut self, batch: TupleBatch) -> Result<(), WriteRejected> {
            let mut record = self.record.lock().unwrap();
            if record.reject {
                record.rejections += 1;
                return Err(WriteRejected {
                    batch,
                    reason: "scripted rejection".into(),
                });
            }
            record.batches.push(batch);
            Ok(())
        }

        fn release(&mut self) {
            self.record.lock().unwrap().releases += 1;
        }
    }

    /// Hands out recording channels and keeps their records and
    /// notifiers by channel index.
    #[derive(Default)]
    pub(crate) struct RecordingFactory {
        pub(crate) records: Vec<Record>,
        pub(crate) notifiers: Vec<AvailabilityNotifier>,
        pub(crate) ids: Vec<StreamChannelId>,
    }

    impl RecordingFactory {
        pub(crate) fn record(&self, channel: usize) -> std::sync::MutexGuard<'_, Recorded> {
            self.records[channel].lock().unwrap()
        }

        /// Script channel `channel` to refuse writes (or stop
        /// refusing) and report it through its notifier.
        pub(crate) fn set_available(&self, channel: usize, available: bool) {
            {
                let mut record = self.record(channel);
                record.reject = !available;
                record.writable = available;
            }
            self.notifiers[channel].notify(available);
        }
    }

    impl ChannelFactory for RecordingFactory {
        fn start_stream(
            &mut self,
            index: usize,
            id: StreamChannelId,
            notifier: AvailabilityNotifier,
        ) -> ExchangeResult<Box<dyn OutputChannel>> {
            let record = Arc::new(Mutex::new(Recorded {
                writable: true,
                ..Default::default()
            }));
            if index < self.records.len() {
                self.records[index] = record.clone();
                self.notifiers[index] = notifier;
                self.ids[index] = id;
            } else {
                self.records.push(record.clone());
                self.notifiers.push(notifier);
                self.ids.push(id);
            }
            Ok(Box::new(RecordingChannel { id, record }))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Instant;

    use super::testing::RecordingFactory;
    use super::*;
    use crate::batch::testing::{int_schema, seq_batch};
    use crate::channel::{LocalReceiver, LocalTransport, StreamMessage};
    use crate::operator::BatchSource;
    use crate::streaming_state::BackupBufferConfig;

    fn source(sizes: &[i32]) -> Box<dyn Operator> {
        Box::new(BatchSource::new(
            int_schema(1),
            sizes.iter().map(|n| seq_batch(*n)).collect::<Vec<_>>(),
        ))
    }

    fn workers(ids: &[u32]) -> Vec<WorkerId> {
        ids.iter().copied().map(WorkerId).collect()
    }

    fn run_to_eos(producer: &mut Producer, max_cycles: usize) {
        for _ in 0..max_cycles {
            if producer.eos() {
                return;
            }
            producer.next_ready().unwrap();
        }
    }

    /// Tuples received and whether the stream ended.
    fn received(rx: &mut LocalReceiver) -> (usize, bool) {
        let mut tuples = 0;
        let mut saw_eos = false;
        for msg in rx.drain() {
            match msg {
                StreamMessage::Batch(batch) => tuples += batch.num_tuples(),
                StreamMessage::Eos => saw_eos = true,
            }
        }
        (tuples, saw_eos)
    }

    fn round_robin(n: usize) -> PartitionFunction {
        PartitionFunction::round_robin(Some(n)).unwrap()
    }

    #[test]
    fn eos_after_three_batches_releases_every_channel() {
        let mut producer = Producer::generic_shuffle(
            source(&[4, 5, 6]),
            vec![ExchangePairId(1)],
            workers(&[1, 2]),
            PartitionFunction::broadcast(Some(2)).unwrap(),
        )
        .unwrap();
        let mut factory = RecordingFactory::default();
        producer
            .init(WorkerId(1), ExchangeConfig::default(), &mut factory)
            .unwrap();

        run_to_eos(&mut producer, 10);

        assert!(producer.eos());
        for channel in 0..2 {
            let record = factory.record(channel);
            assert_eq!(record.data_tuples(), vec![4, 5, 6]);
            assert_eq!(record.releases, 1);
            assert_eq!(producer.channel_state(channel), Some(ChannelState::Released));
        }
        assert_eq!(producer.num_tuples_written(), 2 * 15);
    }

    #[test]
    fn total_tuples_written_is_sum_of_batches() {
        let mut producer = Producer::generic_shuffle(
            source(&[3, 7, 2]),
            vec![ExchangePairId(1)],
            workers(&[1, 2, 3]),
            PartitionFunction::hash(None, vec![0]).unwrap(),
        )
        .unwrap();
        let mut factory = RecordingFactory::default();
        producer
            .init(WorkerId(1), ExchangeConfig::default(), &mut factory)
            .unwrap();
        run_to_eos(&mut producer, 10);

        assert!(producer.eos());
        assert_eq!(producer.num_tuples_written(), 12);
        let delivered: usize = (0..3)
            .map(|c| factory.record(c).data_tuples().iter().sum::<usize>())
            .sum();
        assert_eq!(delivered, 12);
        for channel in 0..3 {
            assert_eq!(factory.record(channel).releases, 1);
        }
    }

    #[test]
    fn rejoin_keeps_batches_for_unavailable_channel() {
        let mut producer = Producer::generic_shuffle(
            source(&[2, 2, 2]),
            vec![ExchangePairId(1)],
            workers(&[1, 2]),
            PartitionFunction::broadcast(Some(2)).unwrap(),
        )
        .unwrap();
        let mut factory = RecordingFactory::default();
        let config = ExchangeConfig::default().with_ft_mode(FtMode::Rejoin);
        producer.init(WorkerId(1), config, &mut factory).unwrap();

        producer.next_ready().unwrap();
        assert_eq!(factory.record(0).data_tuples(), vec![2]);

        factory.set_available(0, false);
        for _ in 0..5 {
            producer.next_ready().unwrap();
        }
        assert_eq!(producer.channel_state(0), Some(ChannelState::Unavailable));
        assert_eq!(producer.num_pending_batches(0), 2);
        assert_eq!(factory.record(0).data_tuples(), vec![2]);
        assert_eq!(factory.record(1).data_tuples(), vec![2, 2, 2]);
        assert_eq!(factory.record(1).releases, 1);
        assert_eq!(factory.record(0).releases, 0);
        assert!(!producer.eos());
        // Everything sent or attempted is in the backup buffers.
        assert_eq!(producer.num_tuples_in_buffers(), 2 + 6);

        factory.set_available(0, true);
        run_to_eos(&mut producer, 5);

        assert!(producer.eos());
        assert_eq!(producer.num_pending_batches(0), 0);
        assert_eq!(factory.record(0).data_tuples(), vec![2, 2, 2]);
        assert_eq!(factory.record(0).releases, 1);
        // Nothing was backed up twice.
        assert_eq!(producer.num_tuples_in_buffers(), 12);
    }

    #[test]
    fn update_channel_availability_skips_worker() {
        let mut producer = Producer::generic_shuffle(
            source(&[3, 3]),
            vec![ExchangePairId(1), ExchangePairId(2)],
            workers(&[1, 2]),
            PartitionFunction::broadcast(Some(4)).unwrap(),
        )
        .unwrap();
        let mut factory = RecordingFactory::default();
        let config = ExchangeConfig::default().with_ft_mode(FtMode::Rejoin);
        producer.init(WorkerId(1), config, &mut factory).unwrap();

        assert_eq!(producer.channel_indices_of_worker(WorkerId(2)), vec![2, 3]);
        producer
            .update_channel_availability(WorkerId(2), false)
            .unwrap();
        producer.next_ready().unwrap();
        assert_eq!(factory.record(0).data_tuples(), vec![3]);
        assert!(factory.record(2).batches.is_empty());
        assert_eq!(producer.num_pending_batches(2), 1);

        producer
            .update_channel_availability(WorkerId(2), true)
            .unwrap();
        run_to_eos(&mut producer, 5);
        assert_eq!(factory.record(3).data_tuples(), vec![3, 3]);
    }

    #[test]
    fn abandon_finishes_without_unavailable_channel() {
        let mut producer = Producer::generic_shuffle(
            source(&[1, 1, 1]),
            vec![ExchangePairId(1)],
            workers(&[1, 2]),
            PartitionFunction::broadcast(Some(2)).unwrap(),
        )
        .unwrap();
        let mut factory = RecordingFactory::default();
        let config = ExchangeConfig::default().with_ft_mode(FtMode::Abandon);
        producer.init(WorkerId(1), config, &mut factory).unwrap();

        factory.set_available(1, false);
        run_to_eos(&mut producer, 10);

        assert!(producer.eos());
        assert_eq!(factory.record(0).data_tuples(), vec![1, 1, 1]);
        assert!(factory.record(1).batches.is_empty());
        assert_eq!(factory.record(1).releases, 0);
        assert_eq!(producer.num_pending_batches(1), 3);
        // ABANDON keeps no backup.
        assert_eq!(producer.num_tuples_in_buffers(), 0);

        producer.cleanup();
        assert_eq!(factory.record(1).releases, 1);
        assert_eq!(producer.num_pending_batches(1), 0);
        assert_eq!(producer.channel_state(1), Some(ChannelState::Released));
    }

    #[test]
    fn rejected_write_without_fault_tolerance_is_fatal() {
        let mut producer = Producer::generic_shuffle(
            source(&[2]),
            vec![ExchangePairId(1)],
            workers(&[1, 2]),
            round_robin(2),
        )
        .unwrap();
        let mut factory = RecordingFactory::default();
        producer
            .init(WorkerId(1), ExchangeConfig::default(), &mut factory)
            .unwrap();
        factory.record(1).reject = true;

        let err = producer.next_ready().unwrap_err();
        assert!(matches!(
            err,
            ExchangeError::Transport {
                channel: StreamChannelId {
                    worker_id: WorkerId(2),
                    ..
                },
                ..
            }
        ));
        assert!(!err.is_bad_request());
    }

    #[test]
    fn eoi_goes_to_every_channel_and_iteration_continues() {
        let child = BatchSource::new(int_schema(1), vec![seq_batch(2)])
            .then_iteration(vec![seq_batch(3)]);
        let mut producer = Producer::generic_shuffle(
            Box::new(child),
            vec![ExchangePairId(1)],
            workers(&[1, 2, 3]),
            PartitionFunction::hash(Some(3), vec![0]).unwrap(),
        )
        .unwrap();
        let mut factory = RecordingFactory::default();
        producer
            .init(WorkerId(1), ExchangeConfig::default(), &mut factory)
            .unwrap();

        producer.next_ready().unwrap();
        producer.next_ready().unwrap();
        assert!(producer.eoi());
        for channel in 0..3 {
            assert_eq!(factory.record(channel).num_eoi(), 1);
        }
        producer.set_eoi(false);

        run_to_eos(&mut producer, 10);
        assert!(producer.eos());
        assert_eq!(producer.num_tuples_written(), 5);
        for channel in 0..3 {
            let record = factory.record(channel);
            assert_eq!(record.num_eoi(), 1);
            // The marker sits between the two iterations' data.
            let eoi_pos = record.batches.iter().position(TupleBatch::is_eoi).unwrap();
            assert!(record.batches[..eoi_pos].iter().all(|b| !b.is_eoi()));
        }
    }

    #[test]
    fn eoi_is_not_backed_up_under_rejoin() {
        let child = BatchSource::new(int_schema(1), vec![seq_batch(2)]).with_final_eoi();
        let mut producer = Producer::broadcast(
            Box::new(child),
            ExchangePairId(1),
            workers(&[1, 2]),
        )
        .unwrap();
        let mut factory = RecordingFactory::default();
        let config = ExchangeConfig::default().with_ft_mode(FtMode::Rejoin);
        producer.init(WorkerId(1), config, &mut factory).unwrap();

        run_to_eos(&mut producer, 10);
        assert_eq!(factory.record(0).num_eoi(), 1);
        assert_eq!(producer.num_tuples_in_buffers(), 4);
    }

    #[test]
    fn rejoined_worker_gets_replay() {
        let mut producer = Producer::generic_shuffle(
            source(&[2, 3, 4]),
            vec![ExchangePairId(1)],
            workers(&[1, 2]),
            PartitionFunction::broadcast(Some(2)).unwrap(),
        )
        .unwrap();
        let mut factory = RecordingFactory::default();
        let config = ExchangeConfig::default().with_ft_mode(FtMode::Rejoin);
        producer.init(WorkerId(1), config, &mut factory).unwrap();

        producer.next_ready().unwrap();
        factory.set_available(1, false);
        producer.next_ready().unwrap();
        producer.next_ready().unwrap();
        assert_eq!(factory.record(1).data_tuples(), vec![2]);
        assert_eq!(producer.num_pending_batches(1), 2);

        producer.rejoin_worker(WorkerId(2), &mut factory).unwrap();
        // The new stream gets everything in order.
        assert_eq!(factory.record(1).data_tuples(), vec![2, 3, 4]);
        assert_eq!(producer.num_pending_batches(1), 0);

        run_to_eos(&mut producer, 5);
        assert!(producer.eos());
        assert_eq!(factory.record(1).releases, 1);
    }

    #[test]
    fn rejected_eoi_is_delivered_after_rejoin() {
        let child = BatchSource::new(int_schema(1), vec![seq_batch(2)])
            .then_iteration(vec![seq_batch(3)]);
        let mut producer =
            Producer::broadcast(Box::new(child), ExchangePairId(1), workers(&[1, 2])).unwrap();
        let mut factory = RecordingFactory::default();
        let config = ExchangeConfig::default().with_ft_mode(FtMode::Rejoin);
        producer.init(WorkerId(1), config, &mut factory).unwrap();

        producer.next_ready().unwrap();
        factory.record(1).reject = true;
        producer.next_ready().unwrap();
        assert!(producer.eoi());
        assert_eq!(producer.channel_state(1), Some(ChannelState::Unavailable));
        producer.set_eoi(false);
        producer.next_ready().unwrap();
        assert_eq!(producer.num_pending_batches(1), 2);

        producer.rejoin_worker(WorkerId(2), &mut factory).unwrap();
        {
            let record = factory.record(1);
            assert_eq!(record.data_tuples(), vec![2, 3]);
            assert_eq!(record.num_eoi(), 1);
            assert!(record.batches[1].is_eoi());
        }

        run_to_eos(&mut producer, 5);
        assert!(producer.eos());
        assert_eq!(factory.record(0).num_eoi(), 1);
        assert_eq!(factory.record(1).num_eoi(), 1);
        assert_eq!(factory.record(1).releases, 1);
    }

    #[test]
    fn rejoin_requires_rejoin_mode() {
        let mut producer = Producer::collect(source(&[1]), ExchangePairId(1), WorkerId(1)).unwrap();
        let mut factory = RecordingFactory::default();
        producer
            .init(WorkerId(1), ExchangeConfig::default(), &mut factory)
            .unwrap();
        assert!(producer
            .rejoin_worker(WorkerId(1), &mut factory)
            .unwrap_err()
            .is_bad_request());
    }

    #[test]
    fn dup_elim_backup_withholds_repeats() {
        let rows = vec![seq_batch(3), seq_batch(3), seq_batch(4)];
        let mut producer = Producer::collect(
            Box::new(BatchSource::new(int_schema(1), rows)),
            ExchangePairId(1),
            WorkerId(2),
        )
        .unwrap();
        let mut factory = RecordingFactory::default();
        let config = ExchangeConfig::default()
            .with_ft_mode(FtMode::Rejoin)
            .with_backup_buffer(BackupBufferConfig::DupElim);
        producer.init(WorkerId(1), config, &mut factory).unwrap();

        run_to_eos(&mut producer, 10);
        assert!(producer.eos());
        assert_eq!(factory.record(0).data_tuples(), vec![3, 1]);
        assert_eq!(producer.num_tuples_written(), 4);
    }

    #[test]
    fn blocking_write_waits_for_writable() {
        let mut producer = Producer::collect(source(&[5]), ExchangePairId(1), WorkerId(2)).unwrap();
        let mut factory = RecordingFactory::default();
        let config = ExchangeConfig::default().with_execution_mode(ExecutionMode::Blocking);
        producer.init(WorkerId(1), config, &mut factory).unwrap();

        factory.record(0).writable = false;
        let record = factory.records[0].clone();
        let flip = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            record.lock().unwrap().writable = true;
        });
        producer.next_ready().unwrap();
        flip.join().unwrap();
        assert_eq!(factory.record(0).data_tuples(), vec![5]);
    }

    #[test]
    fn blocking_backoff_is_capped() {
        let mut producer = Producer::collect(source(&[5]), ExchangePairId(1), WorkerId(2)).unwrap();
        let mut factory = RecordingFactory::default();
        let mut config = ExchangeConfig::default().with_execution_mode(ExecutionMode::Blocking);
        config.max_backoff_ms = 2;
        producer.init(WorkerId(1), config, &mut factory).unwrap();

        factory.record(0).writable = false;
        let record = factory.records[0].clone();
        let flip = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(300));
            record.lock().unwrap().writable = true;
            Instant::now()
        });
        producer.next_ready().unwrap();
        let written = Instant::now();
        let flipped = flip.join().unwrap();

        assert_eq!(factory.record(0).data_tuples(), vec![5]);
        // Uncapped doubling would not look again until about 511ms.
        assert!(written.saturating_duration_since(flipped) < Duration::from_millis(100));
    }

    #[test]
    fn interrupted_blocking_write_keeps_batch() {
        let mut producer = Producer::collect(source(&[5]), ExchangePairId(1), WorkerId(2)).unwrap();
        let mut factory = RecordingFactory::default();
        let config = ExchangeConfig::default().with_execution_mode(ExecutionMode::Blocking);
        producer.init(WorkerId(1), config, &mut factory).unwrap();

        factory.record(0).writable = false;
        producer.interrupt_handle().store(true, Ordering::Release);
        producer.next_ready().unwrap();

        assert!(factory.record(0).batches.is_empty());
        assert_eq!(producer.num_pending_batches(0), 1);
        assert_eq!(producer.num_tuples_written(), 0);
    }

    #[test]
    fn empty_pieces_are_not_queued() {
        let child = BatchSource::new(int_schema(1), vec![seq_batch(1)]);
        let mut producer = Producer::generic_shuffle(
            Box::new(child),
            vec![ExchangePairId(1)],
            workers(&[1, 2, 3]),
            round_robin(3),
        )
        .unwrap();
        let mut factory = RecordingFactory::default();
        producer
            .init(WorkerId(1), ExchangeConfig::default(), &mut factory)
            .unwrap();
        run_to_eos(&mut producer, 5);
        assert_eq!(factory.record(0).data_tuples(), vec![1]);
        assert!(factory.record(1).batches.is_empty());
        assert!(factory.record(2).batches.is_empty());
    }

    #[test]
    fn runs_over_local_transport() {
        let mut producer = Producer::generic_shuffle(
            source(&[10, 10]),
            vec![ExchangePairId(9)],
            vec![WorkerId::SELF, WorkerId(2)],
            round_robin(2),
        )
        .unwrap();
        let mut transport = LocalTransport::new(16);
        producer
            .init(WorkerId(1), ExchangeConfig::default(), &mut transport)
            .unwrap();
        assert_eq!(producer.output_channel_ids()[0].worker_id, WorkerId(1));
        run_to_eos(&mut producer, 10);

        for worker in [1, 2] {
            let id = StreamChannelId::new(ExchangePairId(9), WorkerId(worker));
            let mut rx = transport.take_receiver(&id).unwrap();
            assert_eq!(received(&mut rx), (10, true));
        }
    }

    #[test]
    fn full_local_stream_is_back_pressure_under_rejoin() {
        let mut producer =
            Producer::collect(source(&[1, 1, 1]), ExchangePairId(4), WorkerId(2)).unwrap();
        let mut transport = LocalTransport::new(1);
        let config = ExchangeConfig::default().with_ft_mode(FtMode::Rejoin);
        producer.init(WorkerId(1), config, &mut transport).unwrap();
        let id = StreamChannelId::new(ExchangePairId(4), WorkerId(2));
        let mut rx = transport.take_receiver(&id).unwrap();

        // The consumer reads nothing until the producer is done.
        run_to_eos(&mut producer, 5);
        assert!(producer.eos());
        assert_eq!(producer.channel_state(0), Some(ChannelState::Released));
        assert_eq!(producer.num_pending_batches(0), 0);
        assert_eq!(received(&mut rx), (3, true));
    }

    #[test]
    fn full_local_stream_is_not_fatal_without_fault_tolerance() {
        let mut producer =
            Producer::collect(source(&[1, 1, 1]), ExchangePairId(4), WorkerId(2)).unwrap();
        let mut transport = LocalTransport::new(1);
        producer
            .init(WorkerId(1), ExchangeConfig::default(), &mut transport)
            .unwrap();
        let id = StreamChannelId::new(ExchangePairId(4), WorkerId(2));
        let mut rx = transport.take_receiver(&id).unwrap();

        for _ in 0..5 {
            producer.next_ready().unwrap();
        }
        assert!(producer.eos());
        assert_eq!(producer.num_tuples_written(), 3);
        assert_eq!(received(&mut rx), (3, true));
    }

    #[test]
    fn blocking_write_waits_for_local_consumer() {
        let mut producer =
            Producer::collect(source(&[2, 2, 2, 2]), ExchangePairId(4), WorkerId(2)).unwrap();
        let mut transport = LocalTransport::new(1);
        let config = ExchangeConfig::default().with_execution_mode(ExecutionMode::Blocking);
        producer.init(WorkerId(1), config, &mut transport).unwrap();
        let id = StreamChannelId::new(ExchangePairId(4), WorkerId(2));
        let mut rx = transport.take_receiver(&id).unwrap();

        let consumer = std::thread::spawn(move || {
            let mut tuples = 0;
            let deadline = Instant::now() + Duration::from_secs(10);
            while Instant::now() < deadline {
                match rx.try_recv() {
                    Some(StreamMessage::Batch(batch)) => tuples += batch.num_tuples(),
                    Some(StreamMessage::Eos) => return (tuples, true),
                    None => std::thread::sleep(Duration::from_millis(1)),
                }
            }
            (tuples, false)
        });
        run_to_eos(&mut producer, 10);
        assert!(producer.eos());
        assert_eq!(consumer.join().unwrap(), (8, true));
    }

    #[test]
    fn transport_disconnect_under_rejoin_holds_eos() {
        let mut producer = Producer::broadcast(source(&[1, 1]), ExchangePairId(3), workers(&[1, 2]))
            .unwrap();
        let mut transport = LocalTransport::new(16);
        let config = ExchangeConfig::default().with_ft_mode(FtMode::Rejoin);
        producer.init(WorkerId(1), config, &mut transport).unwrap();

        transport.disconnect_worker(WorkerId(2));
        run_to_eos(&mut producer, 6);
        assert!(!producer.eos());
        assert_eq!(producer.channel_state(1), Some(ChannelState::Unavailable));

        transport.reconnect_worker(WorkerId(2));
        run_to_eos(&mut producer, 6);
        assert!(producer.eos());
    }

    #[test]
    fn next_ready_before_init_is_an_error() {
        let mut producer = Producer::collect(source(&[1]), ExchangePairId(1), WorkerId(1)).unwrap();
        assert_eq!(producer.channel_state(0), Some(ChannelState::Uninitialized));
        assert!(producer.next_ready().is_err());
    }
}
