//! Continuous-data queue
//!
//! One circular sample buffer per recorded channel, sized
//! `block_size * num_blocks` samples. Alongside the samples, each channel
//! keeps a table with one sample number per write-block, recorded by the
//! producer whenever a write crosses a block boundary. The consumer uses
//! that table to reconstruct the absolute sample number of the first
//! sample of every read span.
//!
//! An optional set of timestamp streams carries one synchronized `f64`
//! timestamp per sample for cross-clock alignment.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use tracing::warn;

use super::{FifoSpans, QueueError, SlotRing};
use crate::common::metrics::{AtomicCounters, CounterSnapshot};

/// Sample storage and block sample-number table for one channel
#[derive(Debug)]
struct ChannelRing {
    samples: SlotRing<f32>,
    block_sample_numbers: Box<[AtomicI64]>,
}

impl ChannelRing {
    fn new(block_size: usize, num_blocks: usize) -> Self {
        Self {
            samples: SlotRing::new(block_size * num_blocks),
            block_sample_numbers: (0..num_blocks).map(|_| AtomicI64::new(0)).collect(),
        }
    }
}

#[derive(Debug)]
struct DataShared {
    block_size: usize,
    num_blocks: usize,
    channels: Vec<ChannelRing>,
    timestamp_streams: Vec<SlotRing<f64>>,
    /// Per timestamp stream: the channel whose reads bound the stream's reads
    timestamp_anchors: Vec<usize>,
    read_in_progress: AtomicBool,
    counters: AtomicCounters,
}

impl DataShared {
    fn capacity(&self) -> usize {
        self.block_size * self.num_blocks
    }
}

/// Continuous-data queue, owned form.
///
/// Structural changes (`set_channels`, `set_timestamp_streams`, `resize`)
/// are only possible on the owned queue, i.e. while no producer or
/// consumer handle exists.
#[derive(Debug)]
pub struct DataQueue {
    shared: DataShared,
}

impl DataQueue {
    /// Create a queue with no channels.
    ///
    /// `block_size` is the write-block granularity of the sample-number
    /// table; each channel holds `block_size * num_blocks` samples.
    pub fn new(block_size: usize, num_blocks: usize) -> Self {
        assert!(block_size > 0, "block_size must be positive");
        assert!(num_blocks > 0, "num_blocks must be positive");
        Self {
            shared: DataShared {
                block_size,
                num_blocks,
                channels: Vec::new(),
                timestamp_streams: Vec::new(),
                timestamp_anchors: Vec::new(),
                read_in_progress: AtomicBool::new(false),
                counters: AtomicCounters::new(),
            },
        }
    }

    pub fn block_size(&self) -> usize {
        self.shared.block_size
    }

    pub fn num_blocks(&self) -> usize {
        self.shared.num_blocks
    }

    /// Samples each channel can hold
    pub fn capacity(&self) -> usize {
        self.shared.capacity()
    }

    pub fn num_channels(&self) -> usize {
        self.shared.channels.len()
    }

    pub fn num_timestamp_streams(&self) -> usize {
        self.shared.timestamp_streams.len()
    }

    /// Reallocate for `n` channels, discarding all buffered data
    pub fn set_channels(&mut self, n: usize) {
        let (block_size, num_blocks) = (self.shared.block_size, self.shared.num_blocks);
        self.shared.channels = (0..n)
            .map(|_| ChannelRing::new(block_size, num_blocks))
            .collect();
    }

    /// Reallocate for one synchronized timestamp stream per entry of
    /// `anchors`.
    ///
    /// `anchors[i]` is the channel stream `i` belongs to: every read takes
    /// exactly as many timestamps from stream `i` as samples from that
    /// channel, so the producer must queue a block's timestamps before the
    /// anchor channel's samples.
    pub fn set_timestamp_streams(&mut self, anchors: &[usize]) {
        let capacity = self.shared.capacity();
        self.shared.timestamp_streams = anchors.iter().map(|_| SlotRing::new(capacity)).collect();
        self.shared.timestamp_anchors = anchors.to_vec();
    }

    /// Change the number of blocks per channel, discarding all buffered data
    pub fn resize(&mut self, num_blocks: usize) {
        assert!(num_blocks > 0, "num_blocks must be positive");
        self.shared.num_blocks = num_blocks;
        let capacity = self.shared.capacity();
        for channel in &mut self.shared.channels {
            channel.samples.set_capacity(capacity);
            channel.block_sample_numbers =
                (0..num_blocks).map(|_| AtomicI64::new(0)).collect();
        }
        for stream in &mut self.shared.timestamp_streams {
            stream.set_capacity(capacity);
        }
    }

    /// Discard buffered data and counters, keeping the layout
    pub fn clear(&mut self) {
        for channel in &mut self.shared.channels {
            channel.samples.reset();
            for slot in channel.block_sample_numbers.iter_mut() {
                *slot.get_mut() = 0;
            }
        }
        for stream in &mut self.shared.timestamp_streams {
            stream.reset();
        }
        self.shared.counters.reset();
    }

    /// Split into the acquisition-side writer and the record-side reader
    pub fn split(self) -> (DataWriter, DataReader) {
        let num_channels = self.shared.channels.len();
        let shared = Arc::new(self.shared);
        (
            DataWriter {
                shared: Arc::clone(&shared),
            },
            DataReader {
                shared,
                last_sample_numbers: vec![0; num_channels],
            },
        )
    }

    /// Recover the owned queue from its two handles
    pub fn rejoin(writer: DataWriter, reader: DataReader) -> Result<Self, QueueError> {
        if !Arc::ptr_eq(&writer.shared, &reader.shared) {
            return Err(QueueError::MismatchedHandles);
        }
        drop(writer);
        Arc::try_unwrap(reader.shared)
            .map(|shared| Self { shared })
            .map_err(|_| QueueError::StillShared)
    }
}

/// Producer handle, used only by the acquisition thread
#[derive(Debug)]
pub struct DataWriter {
    shared: Arc<DataShared>,
}

impl DataWriter {
    pub fn num_channels(&self) -> usize {
        self.shared.channels.len()
    }

    pub fn block_size(&self) -> usize {
        self.shared.block_size
    }

    /// Queue `samples` for `dest_channel`; `sample_number` is the absolute
    /// sample number of `samples[0]`.
    ///
    /// Never blocks. Samples that do not fit are dropped and logged. Returns
    /// the channel's fill fraction after the write as a backpressure signal.
    pub fn write_channel(&mut self, samples: &[f32], dest_channel: usize, sample_number: i64) -> f32 {
        let shared = &*self.shared;
        let Some(channel) = shared.channels.get(dest_channel) else {
            warn!(dest_channel, "write to unknown data queue channel");
            return 0.0;
        };

        // The block table must be filled before the samples are published,
        // so the reader never sees a boundary without its sample number.
        let spans = channel.samples.fifo().prepare_to_write(samples.len());
        self.fill_sample_numbers(dest_channel, spans.start1, spans.size1, sample_number);
        if spans.size2 > 0 {
            self.fill_sample_numbers(
                dest_channel,
                spans.start2,
                spans.size2,
                sample_number + spans.size1 as i64,
            );
        }

        // SAFETY: `DataWriter` is the only producer and `&mut self` keeps
        // this call exclusive. Free space only grows between the two
        // reservations, so the same spans are written.
        let written = unsafe { channel.samples.push_with(spans.total(), |i| samples[i]) };
        debug_assert_eq!(written, spans);
        shared.counters.add_written(spans.total() as u64);

        if spans.total() < samples.len() {
            let lost = samples.len() - spans.total();
            shared.counters.add_dropped(lost as u64);
            warn!(
                channel = dest_channel,
                size1 = spans.size1,
                size2 = spans.size2,
                requested = samples.len(),
                lost,
                "Recording data queue overflow"
            );
        }

        channel.samples.fifo().fill_fraction()
    }

    /// Queue `n_samples` synchronized timestamps `start + i * step` for
    /// timestamp stream `stream`. Same overflow policy as `write_channel`.
    pub fn write_synchronized_timestamps(
        &mut self,
        start: f64,
        step: f64,
        stream: usize,
        n_samples: usize,
    ) -> f32 {
        let Some(ring) = self.shared.timestamp_streams.get(stream) else {
            warn!(stream, "write to unknown timestamp stream");
            return 0.0;
        };

        // SAFETY: single producer, exclusive through `&mut self`.
        let spans = unsafe { ring.push_with(n_samples, |i| start + i as f64 * step) };
        if spans.total() < n_samples {
            warn!(
                stream,
                requested = n_samples,
                written = spans.total(),
                "Synchronized timestamp queue overflow"
            );
        }
        ring.fifo().fill_fraction()
    }

    /// Samples `channel` can accept without dropping
    pub fn free_space(&self, channel: usize) -> usize {
        self.shared
            .channels
            .get(channel)
            .map_or(0, |c| c.samples.fifo().free_space())
    }

    /// True while the record thread holds an open read
    pub fn is_read_in_progress(&self) -> bool {
        self.shared.read_in_progress.load(Ordering::Acquire)
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.shared.counters.snapshot()
    }

    /// Record the sample number of every block boundary inside
    /// `[index, index + size)`.
    fn fill_sample_numbers(&self, channel: usize, index: usize, size: usize, sample_number: i64) {
        let block_size = self.shared.block_size;
        let num_blocks = self.shared.num_blocks;
        let table = &self.shared.channels[channel].block_sample_numbers;

        let block_mod = index % block_size;
        let first_boundary = if block_mod == 0 {
            index
        } else {
            index + (block_size - block_mod)
        };

        let end = index + size;
        let mut boundary = first_boundary;
        while boundary < end {
            let block = (boundary / block_size) % num_blocks;
            table[block].store(sample_number + (boundary - index) as i64, Ordering::Relaxed);
            boundary += block_size;
        }
    }
}

/// Consumer handle, used only by the record thread
#[derive(Debug)]
pub struct DataReader {
    shared: Arc<DataShared>,
    last_sample_numbers: Vec<i64>,
}

impl DataReader {
    pub fn num_channels(&self) -> usize {
        self.shared.channels.len()
    }

    pub fn num_timestamp_streams(&self) -> usize {
        self.shared.timestamp_streams.len()
    }

    pub fn block_size(&self) -> usize {
        self.shared.block_size
    }

    /// Samples ready to read on `channel`
    pub fn num_ready(&self, channel: usize) -> usize {
        self.shared
            .channels
            .get(channel)
            .map_or(0, |c| c.samples.fifo().num_ready())
    }

    /// Sample numbers recorded for write-block `block`, one per channel
    pub fn block_sample_numbers(&self, block: usize) -> Vec<i64> {
        self.shared
            .channels
            .iter()
            .map(|c| {
                c.block_sample_numbers
                    .get(block)
                    .map_or(0, |v| v.load(Ordering::Acquire))
            })
            .collect()
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.shared.counters.snapshot()
    }

    /// Open a read of up to `max_samples` per channel (`None` = all ready).
    ///
    /// The returned guard borrows the buffered samples; dropping it
    /// releases them back to the producer.
    pub fn start_read(&mut self, max_samples: Option<usize>) -> DataRead<'_> {
        let shared = Arc::clone(&self.shared);
        shared.read_in_progress.store(true, Ordering::Release);

        let block_size = shared.block_size;
        let num_blocks = shared.num_blocks;
        let mut channels = Vec::with_capacity(shared.channels.len());

        for (chan, ring) in shared.channels.iter().enumerate() {
            let ready = ring.samples.fifo().num_ready();
            let to_read = max_samples.map_or(ready, |max| ready.min(max));
            let spans = ring.samples.fifo().prepare_to_read(to_read);

            let block_mod = spans.start1 % block_size;
            let block_diff = if block_mod == 0 { 0 } else { block_size - block_mod };

            // If a block boundary falls inside the span its recorded sample
            // number anchors the first sample; otherwise continue from the
            // end of the previous read.
            let sample_number = if block_diff < spans.total() {
                let block = ((spans.start1 + block_diff) / block_size) % num_blocks;
                ring.block_sample_numbers[block].load(Ordering::Acquire) - block_diff as i64
            } else {
                self.last_sample_numbers[chan]
            };

            self.last_sample_numbers[chan] = sample_number + spans.total() as i64;
            channels.push(ChannelRead {
                spans,
                sample_number,
            });
        }

        let timestamps = shared
            .timestamp_streams
            .iter()
            .zip(&shared.timestamp_anchors)
            .map(|(ring, &anchor)| {
                let samples = channels.get(anchor).map_or(0, |c| c.spans.total());
                let ready = ring.fifo().num_ready();
                if ready < samples {
                    warn!(anchor, ready, samples, "Synchronized timestamps behind samples");
                }
                ring.fifo().prepare_to_read(ready.min(samples))
            })
            .collect();

        DataRead {
            shared,
            channels,
            timestamps,
            _reader: std::marker::PhantomData,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ChannelRead {
    spans: FifoSpans,
    sample_number: i64,
}

/// An open read on a `DataQueue`.
///
/// Holds the spans reserved for every channel and timestamp stream.
/// Dropping it (or calling `stop_read`) finishes the read.
#[derive(Debug)]
pub struct DataRead<'a> {
    shared: Arc<DataShared>,
    channels: Vec<ChannelRead>,
    timestamps: Vec<FifoSpans>,
    _reader: std::marker::PhantomData<&'a mut DataReader>,
}

impl DataRead<'_> {
    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    /// Reserved spans for `channel`
    pub fn spans(&self, channel: usize) -> FifoSpans {
        self.channels[channel].spans
    }

    /// Number of samples read from `channel`
    pub fn samples_read(&self, channel: usize) -> usize {
        self.channels[channel].spans.total()
    }

    /// Absolute sample number of the first sample read from `channel`
    pub fn sample_number(&self, channel: usize) -> i64 {
        self.channels[channel].sample_number
    }

    /// First sample number of every channel
    pub fn sample_numbers(&self) -> Vec<i64> {
        self.channels.iter().map(|c| c.sample_number).collect()
    }

    /// The read samples of `channel`, as the two wrap spans
    pub fn channel_data(&self, channel: usize) -> (&[f32], &[f32]) {
        let spans = self.channels[channel].spans;
        let ring = &self.shared.channels[channel].samples;
        // SAFETY: the spans were reserved by `prepare_to_read` on the single
        // consumer and are only released when this guard drops.
        unsafe {
            (
                ring.span(spans.start1, spans.size1),
                ring.span(spans.start2, spans.size2),
            )
        }
    }

    /// The read synchronized timestamps of `stream`, as two wrap spans
    pub fn timestamp_data(&self, stream: usize) -> (&[f64], &[f64]) {
        let Some(spans) = self.timestamps.get(stream).copied() else {
            return (&[], &[]);
        };
        let ring = &self.shared.timestamp_streams[stream];
        // SAFETY: as in `channel_data`.
        unsafe {
            (
                ring.span(spans.start1, spans.size1),
                ring.span(spans.start2, spans.size2),
            )
        }
    }

    /// Finish the read, releasing all spans to the producer
    pub fn stop_read(self) {}
}

impl Drop for DataRead<'_> {
    fn drop(&mut self) {
        let mut total = 0u64;
        for (ring, read) in self.shared.channels.iter().zip(&self.channels) {
            ring.samples.fifo().finished_read(read.spans.total());
            total += read.spans.total() as u64;
        }
        for (ring, spans) in self.shared.timestamp_streams.iter().zip(&self.timestamps) {
            ring.fifo().finished_read(spans.total());
        }
        self.shared.counters.add_read(total);
        self.shared.read_in_progress.store(false, Ordering::Release);
    }
}
