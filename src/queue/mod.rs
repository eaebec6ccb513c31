//! Lock-free queues between the acquisition thread and the record thread
//!
//! Architecture:
//! - `RingBuffer`: SPSC cursor arithmetic, no data
//! - `DataQueue`: per-channel continuous samples + block sample-number table
//! - `EventQueue<T>`: Arc-shared timestamped messages (events, spikes)
//!
//! Each queue is configured while owned, then `split()` into a producer
//! handle for the acquisition thread and a consumer handle for the record
//! thread. `rejoin()` recovers the owned queue once a recording ends so it
//! can be reconfigured.

pub mod data;
pub mod event;
pub mod fifo;

pub use data::{DataQueue, DataRead, DataReader, DataWriter};
pub use event::{EventMessage, EventMessagePtr, EventQueue, EventReceiver, EventSender};
pub use fifo::{FifoSpans, RingBuffer};

use std::cell::UnsafeCell;

use thiserror::Error;

/// Queue errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum QueueError {
    #[error("Producer and consumer handles belong to different queues")]
    MismatchedHandles,

    #[error("Queue is still shared with another owner")]
    StillShared,
}

/// A FIFO together with the storage it indexes.
///
/// Producer-side methods must only be called by the single producer and
/// consumer-side methods by the single consumer. The public handle types
/// guarantee this by requiring `&mut self`.
#[derive(Debug)]
pub(crate) struct SlotRing<T> {
    fifo: RingBuffer,
    slots: Box<[UnsafeCell<T>]>,
}

// SAFETY: slots are only accessed through spans handed out by `fifo`.
// The producer writes only into free spans, the consumer reads only ready
// spans, and the Release/Acquire cursor updates order the slot accesses.
// The queue handles enforce a single producer and a single consumer.
unsafe impl<T: Send> Sync for SlotRing<T> {}

impl<T: Default> SlotRing<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            fifo: RingBuffer::new(capacity),
            slots: (0..capacity).map(|_| UnsafeCell::new(T::default())).collect(),
        }
    }

    /// Reallocate storage; discards all contents
    pub(crate) fn set_capacity(&mut self, capacity: usize) {
        self.fifo.set_capacity(capacity);
        self.slots = (0..capacity).map(|_| UnsafeCell::new(T::default())).collect();
    }

    pub(crate) fn reset(&mut self) {
        self.fifo.reset();
        for slot in self.slots.iter_mut() {
            *slot.get_mut() = T::default();
        }
    }
}

impl<T> SlotRing<T> {
    #[inline]
    pub(crate) fn fifo(&self) -> &RingBuffer {
        &self.fifo
    }

    #[inline]
    fn base(&self) -> *mut T {
        UnsafeCell::raw_get(self.slots.as_ptr())
    }

    /// Reserve up to `n` slots, fill them from `value(i)` and publish them.
    ///
    /// Returns the spans actually written; fewer than `n` slots when the
    /// ring is full.
    ///
    /// # Safety
    /// Only the single producer may call this.
    pub(crate) unsafe fn push_with(&self, n: usize, mut value: impl FnMut(usize) -> T) -> FifoSpans {
        let spans = self.fifo.prepare_to_write(n);
        let base = self.base();
        for i in 0..spans.size1 {
            *base.add(spans.start1 + i) = value(i);
        }
        for i in 0..spans.size2 {
            *base.add(spans.start2 + i) = value(spans.size1 + i);
        }
        self.fifo.finished_write(spans.total());
        spans
    }

    /// Borrow `len` slots starting at `start`.
    ///
    /// # Safety
    /// Only the single consumer may call this, for a span obtained from
    /// `prepare_to_read` and not yet released with `finished_read`.
    pub(crate) unsafe fn span(&self, start: usize, len: usize) -> &[T] {
        if len == 0 {
            return &[];
        }
        std::slice::from_raw_parts(self.base().add(start) as *const T, len)
    }

    /// Move the value out of one ready slot, leaving the default behind.
    ///
    /// # Safety
    /// Same contract as `span`.
    pub(crate) unsafe fn take(&self, index: usize) -> T
    where
        T: Default,
    {
        std::mem::take(&mut *self.base().add(index))
    }
}
