//! Output channels a producer writes to.
//!
//! The transport itself lives outside this crate. A producer only
//! needs to open one ordered stream per destination, ask whether it
//! can currently take a write, write, and release it. Availability
//! changes flow back as [`AvailabilityEvent`]s on a bounded queue that
//! the producer drains between pull cycles. Events that do not fit are
//! coalesced to the latest state per channel, never dropped.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::batch::TupleBatch;
use crate::errors::ExchangeResult;

pub mod local;

pub use local::{LocalChannel, LocalReceiver, LocalTransport, StreamMessage};

/// Identifies the consumer operator on the other end of an exchange.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExchangePairId(pub u64);

impl fmt::Display for ExchangePairId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Worker identifier.
///
/// Real workers are numbered from 1. [`WorkerId::SELF`] is a
/// placeholder meaning "the worker running this producer".
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub u32);

impl WorkerId {
    pub const SELF: WorkerId = WorkerId(0);

    /// Replace [`WorkerId::SELF`] with `this_worker`.
    pub fn resolve(self, this_worker: WorkerId) -> WorkerId {
        if self == Self::SELF {
            this_worker
        } else {
            self
        }
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A single destination: one operator on one worker.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamChannelId {
    pub operator_id: ExchangePairId,
    pub worker_id: WorkerId,
}

impl StreamChannelId {
    pub fn new(operator_id: ExchangePairId, worker_id: WorkerId) -> Self {
        Self {
            operator_id,
            worker_id,
        }
    }
}

impl fmt::Display for StreamChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op {} on worker {}", self.operator_id, self.worker_id)
    }
}

/// A write the transport would not accept. Hands the batch back so
/// the caller can keep it queued.
#[derive(Debug)]
pub struct WriteRejected {
    pub batch: TupleBatch,
    pub reason: String,
}

/// One ordered logical stream to a destination.
pub trait OutputChannel: Send {
    fn id(&self) -> StreamChannelId;

    /// Can a write be submitted right now without blocking?
    fn is_writable(&self) -> bool;

    /// Submit a batch. Does not wait for delivery.
    fn write(&mut self, batch: TupleBatch) -> Result<(), WriteRejected>;

    /// No more data will follow on this stream.
    fn release(&mut self);
}

/// Opens streams for a producer.
pub trait ChannelFactory {
    /// Open the stream for channel `index` of a producer. The
    /// transport reports availability changes of that stream through
    /// `notifier`.
    fn start_stream(
        &mut self,
        index: usize,
        id: StreamChannelId,
        notifier: AvailabilityNotifier,
    ) -> ExchangeResult<Box<dyn OutputChannel>>;
}

/// A channel became available or unavailable.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct AvailabilityEvent {
    pub channel: usize,
    pub available: bool,
}

/// Latest state of channels whose event did not fit in the queue.
type Overflow = Arc<Mutex<BTreeMap<usize, bool>>>;

fn lock_overflow(overflow: &Overflow) -> MutexGuard<'_, BTreeMap<usize, bool>> {
    overflow.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Posting half of a producer's availability queue.
#[derive(Debug, Clone)]
pub(crate) struct AvailabilitySender {
    sender: mpsc::Sender<AvailabilityEvent>,
    overflow: Overflow,
}

/// Receiving half of a producer's availability queue.
///
/// Events for a channel that arrive while the queue is full are
/// coalesced: only the latest state of that channel is kept, and every
/// later event for it updates that state until the producer drains.
#[derive(Debug)]
pub(crate) struct AvailabilityQueue {
    receiver: mpsc::Receiver<AvailabilityEvent>,
    overflow: Overflow,
}

impl AvailabilityQueue {
    /// Everything posted since the last drain, oldest first.
    pub(crate) fn drain(&mut self) -> Vec<AvailabilityEvent> {
        // Held while reading the queue so no notifier can slip an
        // event in between the queue and the overflow.
        let mut overflow = lock_overflow(&self.overflow);
        let mut events = Vec::new();
        while let Ok(event) = self.receiver.try_recv() {
            events.push(event);
        }
        events.extend(
            std::mem::take(&mut *overflow)
                .into_iter()
                .map(|(channel, available)| AvailabilityEvent { channel, available }),
        );
        events
    }
}

/// Handed to the transport so it can report availability changes
/// for one channel.
///
/// Posting never blocks; it is safe to call from a transport callback.
#[derive(Debug, Clone)]
pub struct AvailabilityNotifier {
    channel: usize,
    sender: AvailabilitySender,
}

impl AvailabilityNotifier {
    pub(crate) fn new(channel: usize, sender: AvailabilitySender) -> Self {
        Self { channel, sender }
    }

    pub fn channel(&self) -> usize {
        self.channel
    }

    pub fn notify(&self, available: bool) {
        let mut overflow = lock_overflow(&self.sender.overflow);
        // Once a channel has spilled, its later events must not
        // overtake the spilled state through the queue.
        if let Some(latest) = overflow.get_mut(&self.channel) {
            *latest = available;
            return;
        }
        let event = AvailabilityEvent {
            channel: self.channel,
            available,
        };
        match self.sender.sender.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                tracing::debug!("availability queue full, coalescing {event:?}");
                overflow.insert(event.channel, event.available);
            }
            Err(TrySendError::Closed(event)) => {
                tracing::debug!("producer gone, ignoring {event:?}");
            }
        }
    }
}

pub(crate) fn availability_queue(depth: usize) -> (AvailabilitySender, AvailabilityQueue) {
    // Tokio panics on a zero bound.
    let (sender, receiver) = mpsc::channel(depth.max(1));
    let overflow = Overflow::default();
    (
        AvailabilitySender {
            sender,
            overflow: overflow.clone(),
        },
        AvailabilityQueue { receiver, overflow },
    )
}

/// Lifecycle of one output channel inside a producer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ChannelState {
    Uninitialized,
    Open,
    Unavailable,
    Released,
}

impl ChannelState {
    pub fn is_open(self) -> bool {
        self == Self::Open
    }

    pub fn is_released(self) -> bool {
        self == Self::Released
    }
}

#[test]
fn self_worker_resolves_to_this_worker() {
    assert_eq!(WorkerId::SELF.resolve(WorkerId(4)), WorkerId(4));
    assert_eq!(WorkerId(2).resolve(WorkerId(4)), WorkerId(2));
}

#[test]
fn full_queue_keeps_latest_state_per_channel() {
    let (tx, mut rx) = availability_queue(1);
    let first = AvailabilityNotifier::new(3, tx.clone());
    let second = AvailabilityNotifier::new(5, tx);
    first.notify(false);
    // The queue is full from here on.
    first.notify(true);
    second.notify(false);
    first.notify(false);
    first.notify(true);

    assert_eq!(
        rx.drain(),
        vec![
            AvailabilityEvent {
                channel: 3,
                available: false
            },
            AvailabilityEvent {
                channel: 3,
                available: true
            },
            AvailabilityEvent {
                channel: 5,
                available: false
            },
        ]
    );
    assert!(rx.drain().is_empty());

    // A drained queue takes events through the channel again.
    second.notify(true);
    assert_eq!(
        rx.drain(),
        vec![AvailabilityEvent {
            channel: 5,
            available: true
        }]
    );
}

#[test]
fn channel_id_serializes_camel_case() {
    let id = StreamChannelId::new(ExchangePairId(7), WorkerId(2));
    let json = serde_json::to_string(&id).unwrap();
    assert_eq!(json, r#"{"operatorId":7,"workerId":2}"#);
    assert_eq!(id.to_string(), "op 7 on worker 2");
}
