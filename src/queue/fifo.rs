//! Single-producer/single-consumer index arithmetic over a circular region.
//!
//! `RingBuffer` never touches data. It hands out one or two spans
//! (`FifoSpans`) of a fixed-capacity region; the caller copies into or out
//! of its own storage and then commits with `finished_write` /
//! `finished_read`.
//!
//! At most one writer and one reader may be active at a time. The queues
//! built on top enforce that by splitting into a producer handle and a
//! consumer handle that each require `&mut self`.

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

/// Up to two contiguous spans of a circular region.
///
/// The second span is non-empty only when the region wraps past the end
/// of the buffer, in which case it always starts at index 0.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FifoSpans {
    pub start1: usize,
    pub size1: usize,
    pub start2: usize,
    pub size2: usize,
}

impl FifoSpans {
    /// Total number of slots covered by both spans
    #[inline]
    pub fn total(&self) -> usize {
        self.size1 + self.size2
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

/// FIFO cursor pair over a region of `capacity` slots.
///
/// The cursors count every slot ever written or read; the slot index is
/// the cursor modulo capacity. At 64 bits the counters do not wrap in
/// practice.
#[derive(Debug)]
pub struct RingBuffer {
    capacity: usize,
    write_pos: CachePadded<AtomicUsize>,
    read_pos: CachePadded<AtomicUsize>,
}

impl RingBuffer {
    /// Create an empty FIFO with room for `capacity` slots
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            write_pos: CachePadded::new(AtomicUsize::new(0)),
            read_pos: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of slots written but not yet read
    #[inline]
    pub fn num_ready(&self) -> usize {
        let read = self.read_pos.load(Ordering::Acquire);
        let write = self.write_pos.load(Ordering::Acquire);
        write.wrapping_sub(read)
    }

    /// Number of slots a writer could reserve right now
    #[inline]
    pub fn free_space(&self) -> usize {
        self.capacity - self.num_ready()
    }

    /// Fraction of the region currently holding unread data (0..=1)
    pub fn fill_fraction(&self) -> f32 {
        if self.capacity == 0 {
            return 0.0;
        }
        self.num_ready() as f32 / self.capacity as f32
    }

    /// Reserve up to `n` slots for writing.
    ///
    /// If less than `n` slots are free the returned spans cover only the
    /// free space; nothing blocks.
    pub fn prepare_to_write(&self, n: usize) -> FifoSpans {
        let write = self.write_pos.load(Ordering::Relaxed);
        let read = self.read_pos.load(Ordering::Acquire);
        let free = self.capacity - write.wrapping_sub(read);
        self.spans_at(write, n.min(free))
    }

    /// Publish `n` previously reserved slots to the reader
    pub fn finished_write(&self, n: usize) {
        let write = self.write_pos.load(Ordering::Relaxed);
        let read = self.read_pos.load(Ordering::Acquire);
        let free = self.capacity - write.wrapping_sub(read);
        debug_assert!(n <= free, "finished_write past reserved space");
        self.write_pos
            .store(write.wrapping_add(n.min(free)), Ordering::Release);
    }

    /// Reserve up to `n` ready slots for reading
    pub fn prepare_to_read(&self, n: usize) -> FifoSpans {
        let read = self.read_pos.load(Ordering::Relaxed);
        let write = self.write_pos.load(Ordering::Acquire);
        let ready = write.wrapping_sub(read);
        self.spans_at(read, n.min(ready))
    }

    /// Release `n` read slots back to the writer
    pub fn finished_read(&self, n: usize) {
        let read = self.read_pos.load(Ordering::Relaxed);
        let write = self.write_pos.load(Ordering::Acquire);
        let ready = write.wrapping_sub(read);
        debug_assert!(n <= ready, "finished_read past ready data");
        self.read_pos
            .store(read.wrapping_add(n.min(ready)), Ordering::Release);
    }

    /// Discard all unread data
    pub fn reset(&mut self) {
        *self.write_pos.get_mut() = 0;
        *self.read_pos.get_mut() = 0;
    }

    /// Change the capacity; also discards all unread data
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;
        self.reset();
    }

    fn spans_at(&self, pos: usize, n: usize) -> FifoSpans {
        if self.capacity == 0 || n == 0 {
            return FifoSpans::default();
        }
        let start = pos % self.capacity;
        let size1 = n.min(self.capacity - start);
        FifoSpans {
            start1: start,
            size1,
            start2: 0,
            size2: n - size1,
        }
    }
}
