//! In-process transport.
//!
//! Every stream is a bounded tokio mpsc queue. A message that does not
//! fit waits, in order, in the stream's overflow queue, which the
//! consumer reads once the bounded queue is empty. A full stream is
//! back-pressure, not a failure: the channel reports itself not
//! writable, but only a disconnected worker or a departed consumer
//! rejects a write. Consumers pick up the receiving end by
//! [`StreamChannelId`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;

use super::{
    AvailabilityNotifier, ChannelFactory, OutputChannel, StreamChannelId, WorkerId, WriteRejected,
};
use crate::batch::TupleBatch;
use crate::errors::{ExchangeError, ExchangeResult};

/// What a consumer sees on a local stream.
#[derive(Debug, Clone)]
pub enum StreamMessage {
    Batch(TupleBatch),
    /// The producer released the stream.
    Eos,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panic while holding one of these locks leaves only plain
    // collections behind, so keep going.
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Messages that did not fit in a stream's bounded queue. Everything
/// in it is newer than everything in the queue.
type Overflow = Arc<Mutex<VecDeque<StreamMessage>>>;

/// Consumer end of a local stream.
pub struct LocalReceiver {
    receiver: mpsc::Receiver<StreamMessage>,
    overflow: Overflow,
}

impl LocalReceiver {
    /// The next message, if one is ready.
    pub fn try_recv(&mut self) -> Option<StreamMessage> {
        let mut overflow = lock(&self.overflow);
        match self.receiver.try_recv() {
            Ok(msg) => Some(msg),
            Err(_) => overflow.pop_front(),
        }
    }

    /// Every message ready right now, in order.
    pub fn drain(&mut self) -> Vec<StreamMessage> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

struct TransportState {
    capacity: usize,
    receivers: HashMap<StreamChannelId, LocalReceiver>,
    disconnected: HashSet<WorkerId>,
    notifiers: HashMap<WorkerId, Vec<AvailabilityNotifier>>,
}

/// Shared handle to the in-process transport. Clones see the same
/// streams.
#[derive(Clone)]
pub struct LocalTransport {
    state: Arc<Mutex<TransportState>>,
}

impl LocalTransport {
    /// `capacity` bounds every stream's queue.
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(TransportState {
                capacity: capacity.max(1),
                receivers: HashMap::new(),
                disconnected: HashSet::new(),
                notifiers: HashMap::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TransportState> {
        lock(&self.state)
    }

    /// Take the consumer end of a stream. Returns `None` if it was
    /// never opened or was already taken.
    pub fn take_receiver(&self, id: &StreamChannelId) -> Option<LocalReceiver> {
        self.lock().receivers.remove(id)
    }

    /// Simulate the death of a worker: every write to it is rejected
    /// and its producers are told it is unavailable.
    pub fn disconnect_worker(&self, worker: WorkerId) {
        let notifiers = {
            let mut state = self.lock();
            state.disconnected.insert(worker);
            state.notifiers.get(&worker).cloned().unwrap_or_default()
        };
        tracing::info!("local transport disconnected worker {worker}");
        for notifier in notifiers {
            notifier.notify(false);
        }
    }

    /// Undo [`LocalTransport::disconnect_worker`] on the existing
    /// streams.
    pub fn reconnect_worker(&self, worker: WorkerId) {
        let notifiers = {
            let mut state = self.lock();
            state.disconnected.remove(&worker);
            state.notifiers.get(&worker).cloned().unwrap_or_default()
        };
        tracing::info!("local transport reconnected worker {worker}");
        for notifier in notifiers {
            notifier.notify(true);
        }
    }

    pub fn is_disconnected(&self, worker: WorkerId) -> bool {
        self.lock().disconnected.contains(&worker)
    }
}

impl ChannelFactory for LocalTransport {
    fn start_stream(
        &mut self,
        index: usize,
        id: StreamChannelId,
        notifier: AvailabilityNotifier,
    ) -> ExchangeResult<Box<dyn OutputChannel>> {
        let mut state = self.lock();
        if id.worker_id == WorkerId::SELF {
            return Err(ExchangeError::Internal(format!(
                "channel {index} to {id} was not resolved to a real worker"
            )));
        }
        let (sender, receiver) = mpsc::channel(state.capacity);
        let overflow = Overflow::default();
        let receiver = LocalReceiver {
            receiver,
            overflow: overflow.clone(),
        };
        if state.receivers.insert(id, receiver).is_some() {
            tracing::debug!("replacing unclaimed receiver for {id}");
        }
        // A freshly started stream on a rejoined worker is usable.
        state.disconnected.remove(&id.worker_id);
        let notifiers = state.notifiers.entry(id.worker_id).or_default();
        notifiers.retain(|n| n.channel() != index);
        notifiers.push(notifier);
        drop(state);

        tracing::debug!("local stream {index} opened to {id}");
        Ok(Box::new(LocalChannel {
            id,
            sender: Some(sender),
            overflow,
            transport: self.clone(),
        }))
    }
}

/// Producer end of a local stream.
pub struct LocalChannel {
    id: StreamChannelId,
    sender: Option<mpsc::Sender<StreamMessage>>,
    overflow: Overflow,
    transport: LocalTransport,
}

impl LocalChannel {
    /// Hand a message to the stream, spilling to the overflow queue
    /// when the bounded queue is full.
    fn enqueue(sender: &mpsc::Sender<StreamMessage>, overflow: &Overflow, msg: StreamMessage) {
        let mut overflow = lock(overflow);
        while !overflow.is_empty() {
            let Ok(permit) = sender.try_reserve() else {
                break;
            };
            if let Some(spilled) = overflow.pop_front() {
                permit.send(spilled);
            }
        }
        if overflow.is_empty() {
            if let Ok(permit) = sender.try_reserve() {
                permit.send(msg);
                return;
            }
        }
        overflow.push_back(msg);
    }
}

impl OutputChannel for LocalChannel {
    fn id(&self) -> StreamChannelId {
        self.id
    }

    fn is_writable(&self) -> bool {
        match &self.sender {
            Some(sender) => {
                !self.transport.is_disconnected(self.id.worker_id)
                    && !sender.is_closed()
                    && lock(&self.overflow).is_empty()
                    && sender.capacity() > 0
            }
            None => false,
        }
    }

    fn write(&mut self, batch: TupleBatch) -> Result<(), WriteRejected> {
        let Some(sender) = &self.sender else {
            return Err(WriteRejected {
                batch,
                reason: "stream already released".into(),
            });
        };
        if self.transport.is_disconnected(self.id.worker_id) {
            return Err(WriteRejected {
                batch,
                reason: format!("worker {} is disconnected", self.id.worker_id),
            });
        }
        if sender.is_closed() {
            return Err(WriteRejected {
                batch,
                reason: "consumer hung up".into(),
            });
        }
        Self::enqueue(sender, &self.overflow, StreamMessage::Batch(batch));
        Ok(())
    }

    fn release(&mut self) {
        if let Some(sender) = self.sender.take() {
            Self::enqueue(&sender, &self.overflow, StreamMessage::Eos);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::testing::seq_batch;
    use crate::channel::{availability_queue, AvailabilityEvent, ExchangePairId};

    fn channel_id(worker: u32) -> StreamChannelId {
        StreamChannelId::new(ExchangePairId(1), WorkerId(worker))
    }

    fn open(transport: &mut LocalTransport, index: usize, worker: u32) -> Box<dyn OutputChannel> {
        let (tx, _rx) = availability_queue(4);
        transport
            .start_stream(index, channel_id(worker), AvailabilityNotifier::new(index, tx))
            .unwrap()
    }

    /// Tuple counts of the batches, with `-1` for end of stream.
    fn sizes(messages: Vec<StreamMessage>) -> Vec<i64> {
        messages
            .into_iter()
            .map(|msg| match msg {
                StreamMessage::Batch(tb) => tb.num_tuples() as i64,
                StreamMessage::Eos => -1,
            })
            .collect()
    }

    #[test]
    fn writes_reach_the_receiver_in_order() {
        let mut transport = LocalTransport::new(8);
        let mut ch = open(&mut transport, 0, 1);
        let mut receiver = transport.take_receiver(&channel_id(1)).unwrap();

        ch.write(seq_batch(2)).unwrap();
        ch.write(seq_batch(3)).unwrap();
        ch.release();

        assert_eq!(sizes(receiver.drain()), vec![2, 3, -1]);
    }

    #[test]
    fn full_queue_spills_in_order_instead_of_rejecting() {
        let mut transport = LocalTransport::new(1);
        let mut ch = open(&mut transport, 0, 1);
        let mut receiver = transport.take_receiver(&channel_id(1)).unwrap();

        ch.write(seq_batch(1)).unwrap();
        assert!(!ch.is_writable());
        ch.write(seq_batch(5)).unwrap();
        ch.write(seq_batch(2)).unwrap();

        assert_eq!(sizes(receiver.try_recv().into_iter().collect()), vec![1]);
        // Spilled messages still hold the stream back.
        assert!(!ch.is_writable());
        assert_eq!(sizes(receiver.drain()), vec![5, 2]);
        assert!(ch.is_writable());

        ch.write(seq_batch(4)).unwrap();
        assert_eq!(sizes(receiver.drain()), vec![4]);
    }

    #[test]
    fn release_on_full_queue_still_delivers_eos() {
        let mut transport = LocalTransport::new(1);
        let mut ch = open(&mut transport, 0, 1);
        let mut receiver = transport.take_receiver(&channel_id(1)).unwrap();

        ch.write(seq_batch(3)).unwrap();
        ch.release();
        assert!(!ch.is_writable());
        assert_eq!(sizes(receiver.drain()), vec![3, -1]);
        assert!(receiver.try_recv().is_none());
    }

    #[test]
    fn hung_up_consumer_rejects_and_returns_batch() {
        let mut transport = LocalTransport::new(4);
        let mut ch = open(&mut transport, 0, 1);
        drop(transport.take_receiver(&channel_id(1)));

        assert!(!ch.is_writable());
        let rejected = ch.write(seq_batch(5)).unwrap_err();
        assert_eq!(rejected.batch.num_tuples(), 5);
        assert_eq!(rejected.reason, "consumer hung up");
    }

    #[test]
    fn disconnect_rejects_and_notifies() {
        let mut transport = LocalTransport::new(4);
        let (tx, mut rx) = availability_queue(4);
        let mut ch = transport
            .start_stream(2, channel_id(3), AvailabilityNotifier::new(2, tx))
            .unwrap();
        let _receiver = transport.take_receiver(&channel_id(3)).unwrap();

        transport.disconnect_worker(WorkerId(3));
        assert!(!ch.is_writable());
        assert!(ch.write(seq_batch(1)).is_err());
        assert_eq!(
            rx.drain(),
            vec![AvailabilityEvent {
                channel: 2,
                available: false
            }]
        );

        transport.reconnect_worker(WorkerId(3));
        assert!(ch.is_writable());
        assert_eq!(
            rx.drain(),
            vec![AvailabilityEvent {
                channel: 2,
                available: true
            }]
        );
    }

    #[test]
    fn unresolved_self_worker_is_refused() {
        let mut transport = LocalTransport::new(4);
        let (tx, _rx) = availability_queue(4);
        let res = transport.start_stream(
            0,
            StreamChannelId::new(ExchangePairId(1), WorkerId::SELF),
            AvailabilityNotifier::new(0, tx),
        );
        assert!(res.is_err());
    }
}
