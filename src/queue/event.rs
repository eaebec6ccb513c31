//! Event/spike queue
//!
//! Bounded SPSC queue of shared, timestamped messages. When full, new
//! messages are dropped; the oldest queued messages are never evicted.

use std::sync::Arc;

use tracing::warn;

use super::{QueueError, SlotRing};
use crate::common::metrics::{AtomicCounters, CounterSnapshot};

/// A queued message: payload plus the sample number it belongs to and a
/// free-form integer (e.g. the source channel index)
#[derive(Debug, Clone, PartialEq)]
pub struct EventMessage<T> {
    pub payload: T,
    pub timestamp: i64,
    pub extra: i32,
}

impl<T> EventMessage<T> {
    pub fn new(payload: T, timestamp: i64, extra: i32) -> Self {
        Self {
            payload,
            timestamp,
            extra,
        }
    }
}

/// Messages are shared between the queue and whoever drains it
pub type EventMessagePtr<T> = Arc<EventMessage<T>>;

#[derive(Debug)]
struct EventShared<T> {
    ring: SlotRing<Option<EventMessagePtr<T>>>,
    counters: AtomicCounters,
}

/// Owned event queue; `split` it to use it across threads
#[derive(Debug)]
pub struct EventQueue<T> {
    shared: EventShared<T>,
}

impl<T: Send + Sync> EventQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            shared: EventShared {
                ring: SlotRing::new(capacity),
                counters: AtomicCounters::new(),
            },
        }
    }

    pub fn capacity(&self) -> usize {
        self.shared.ring.fifo().capacity()
    }

    /// Change capacity, discarding queued messages
    pub fn resize(&mut self, capacity: usize) {
        self.shared.ring.set_capacity(capacity);
    }

    /// Discard queued messages and counters
    pub fn reset(&mut self) {
        self.shared.ring.reset();
        self.shared.counters.reset();
    }

    pub fn split(self) -> (EventSender<T>, EventReceiver<T>) {
        let shared = Arc::new(self.shared);
        (
            EventSender {
                shared: Arc::clone(&shared),
            },
            EventReceiver { shared },
        )
    }

    pub fn rejoin(sender: EventSender<T>, receiver: EventReceiver<T>) -> Result<Self, QueueError> {
        if !Arc::ptr_eq(&sender.shared, &receiver.shared) {
            return Err(QueueError::MismatchedHandles);
        }
        drop(sender);
        Arc::try_unwrap(receiver.shared)
            .map(|shared| Self { shared })
            .map_err(|_| QueueError::StillShared)
    }
}

/// Producer handle
#[derive(Debug)]
pub struct EventSender<T> {
    shared: Arc<EventShared<T>>,
}

impl<T: Send + Sync> EventSender<T> {
    /// Queue one message. Returns `false` (and logs) if the queue is full.
    pub fn add_event(&mut self, payload: T, timestamp: i64, extra: i32) -> bool {
        self.add_message(Arc::new(EventMessage::new(payload, timestamp, extra)))
    }

    /// Queue an already shared message
    pub fn add_message(&mut self, message: EventMessagePtr<T>) -> bool {
        let mut message = Some(message);
        // SAFETY: single producer, exclusive through `&mut self`.
        let spans = unsafe { self.shared.ring.push_with(1, |_| message.take()) };
        if spans.is_empty() {
            self.shared.counters.add_dropped(1);
            warn!(
                capacity = self.shared.ring.fifo().capacity(),
                "Event queue full, dropping message"
            );
            return false;
        }
        self.shared.counters.add_written(1);
        true
    }

    pub fn num_ready(&self) -> usize {
        self.shared.ring.fifo().num_ready()
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.shared.counters.snapshot()
    }
}

/// Consumer handle
#[derive(Debug)]
pub struct EventReceiver<T> {
    shared: Arc<EventShared<T>>,
}

impl<T: Send + Sync> EventReceiver<T> {
    /// Move up to `max` queued messages (`None` = all) into `out`, oldest
    /// first. Returns the number moved.
    pub fn get_events(&mut self, out: &mut Vec<EventMessagePtr<T>>, max: Option<usize>) -> usize {
        let fifo = self.shared.ring.fifo();
        let ready = fifo.num_ready();
        let spans = fifo.prepare_to_read(max.map_or(ready, |max| ready.min(max)));

        let indices = (spans.start1..spans.start1 + spans.size1)
            .chain(spans.start2..spans.start2 + spans.size2);
        for index in indices {
            // SAFETY: single consumer; `index` lies in a reserved ready span.
            if let Some(message) = unsafe { self.shared.ring.take(index) } {
                out.push(message);
            }
        }

        fifo.finished_read(spans.total());
        self.shared.counters.add_read(spans.total() as u64);
        spans.total()
    }

    pub fn num_ready(&self) -> usize {
        self.shared.ring.fifo().num_ready()
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.shared.counters.snapshot()
    }
}
