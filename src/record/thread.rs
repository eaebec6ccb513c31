//! Background record thread
//!
//! Drains the data/event/spike queues into the record engines.
//!
//! ```text
//! WaitingForFirstBlock ──▶ Opening ──▶ Writing ──▶ Draining ──▶ Closed
//!          │                                                     ▲
//!          └──────────────── stop before first block ────────────┘
//! ```
//!
//! The first-block wait is a condition variable wait with a bounded
//! timeout, re-checking the stop flag on every wakeup. The writing loop
//! waits `poll_interval` between passes that found nothing to write. A
//! final unbounded pass on stop drains everything left in the queues.

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use super::engine::RecordEngine;
use super::layout::RecordingLayout;
use super::packet::{EventMsg, EventPacket, EventPayload, SpikeMsg, SpikeRecord};
use super::RecordError;
use crate::queue::{DataReader, EventMessagePtr, EventReceiver};

/// Samples per channel drained in one normal pass
pub const BLOCK_MAX_WRITE_SAMPLES: usize = 4096;
/// Events drained in one normal pass
pub const BLOCK_MAX_WRITE_EVENTS: usize = 50_000;
/// Spikes drained in one normal pass
pub const BLOCK_MAX_WRITE_SPIKES: usize = 50_000;

/// Engines shared between the record node and its record thread
pub type SharedEngines = Arc<Mutex<Vec<Box<dyn RecordEngine>>>>;

/// Record thread state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordThreadState {
    WaitingForFirstBlock = 0,
    Opening = 1,
    Writing = 2,
    Draining = 3,
    Closed = 4,
}

impl RecordThreadState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::WaitingForFirstBlock,
            1 => Self::Opening,
            2 => Self::Writing,
            3 => Self::Draining,
            _ => Self::Closed,
        }
    }
}

impl fmt::Display for RecordThreadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::WaitingForFirstBlock => "WaitingForFirstBlock",
            Self::Opening => "Opening",
            Self::Writing => "Writing",
            Self::Draining => "Draining",
            Self::Closed => "Closed",
        };
        write!(f, "{s}")
    }
}

/// Record thread configuration
#[derive(Debug, Clone)]
pub struct RecordThreadConfig {
    pub root: PathBuf,
    pub experiment: u32,
    pub recording: u32,
    pub layout: Arc<RecordingLayout>,
    /// Per-pass limits; `None` = unbounded
    pub max_write_samples: Option<usize>,
    pub max_write_events: Option<usize>,
    pub max_write_spikes: Option<usize>,
    /// Wait between passes that wrote nothing
    pub poll_interval: Duration,
    /// Bound on each wait for the first block before re-checking stop
    pub first_block_wait: Duration,
}

impl RecordThreadConfig {
    pub fn new(root: impl Into<PathBuf>, experiment: u32, recording: u32, layout: Arc<RecordingLayout>) -> Self {
        Self {
            root: root.into(),
            experiment,
            recording,
            layout,
            max_write_samples: Some(BLOCK_MAX_WRITE_SAMPLES),
            max_write_events: Some(BLOCK_MAX_WRITE_EVENTS),
            max_write_spikes: Some(BLOCK_MAX_WRITE_SPIKES),
            poll_interval: Duration::from_millis(10),
            first_block_wait: Duration::from_millis(100),
        }
    }
}

/// Consumer ends of the three queues
#[derive(Debug)]
pub struct RecordQueues {
    pub data: DataReader,
    pub events: EventReceiver<EventPacket>,
    pub spikes: EventReceiver<SpikeRecord>,
}

/// Lock-free statistics
#[derive(Debug, Default)]
struct AtomicStats {
    passes: AtomicU64,
    samples_written: AtomicU64,
    events_written: AtomicU64,
    spikes_written: AtomicU64,
    sync_messages: AtomicU64,
    write_errors: AtomicU64,
}

impl AtomicStats {
    fn snapshot(&self) -> RecordThreadStats {
        RecordThreadStats {
            passes: self.passes.load(Ordering::Relaxed),
            samples_written: self.samples_written.load(Ordering::Relaxed),
            events_written: self.events_written.load(Ordering::Relaxed),
            spikes_written: self.spikes_written.load(Ordering::Relaxed),
            sync_messages: self.sync_messages.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
        }
    }
}

/// Statistics of one recording
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecordThreadStats {
    pub passes: u64,
    /// Samples handed to the engines, summed over channels
    pub samples_written: u64,
    pub events_written: u64,
    pub spikes_written: u64,
    pub sync_messages: u64,
    pub write_errors: u64,
}

#[derive(Debug)]
struct Shared {
    state: AtomicU8,
    stop: AtomicBool,
    clean_exit: AtomicBool,
    first_block: Mutex<bool>,
    wakeup: Condvar,
    stats: AtomicStats,
}

impl Shared {
    fn set_state(&self, state: RecordThreadState) {
        self.state.store(state as u8, Ordering::Release);
        debug!(state = %state, "Record thread state");
    }

    fn should_stop(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }
}

/// Handle to a running record thread
pub struct RecordThread {
    shared: Arc<Shared>,
    engines: SharedEngines,
    handle: Option<JoinHandle<RecordQueues>>,
}

impl RecordThread {
    /// Start the thread. It waits for `set_first_block` before opening
    /// any file.
    pub fn spawn(
        config: RecordThreadConfig,
        engines: SharedEngines,
        queues: RecordQueues,
    ) -> Result<Self, RecordError> {
        let shared = Arc::new(Shared {
            state: AtomicU8::new(RecordThreadState::WaitingForFirstBlock as u8),
            stop: AtomicBool::new(false),
            clean_exit: AtomicBool::new(true),
            first_block: Mutex::new(false),
            wakeup: Condvar::new(),
            stats: AtomicStats::default(),
        });

        let worker = Worker {
            shared: Arc::clone(&shared),
            engines: Arc::clone(&engines),
            config,
            queues,
            fts: Vec::new(),
            events: Vec::new(),
            spikes: Vec::new(),
        };
        let handle = std::thread::Builder::new()
            .name("Record Thread".into())
            .spawn(move || worker.run())?;

        Ok(Self {
            shared,
            engines,
            handle: Some(handle),
        })
    }

    /// Signal that the first data block has been queued
    pub fn set_first_block(&self) {
        *self.shared.first_block.lock() = true;
        self.shared.wakeup.notify_all();
    }

    /// Ask the thread to drain and close; returns immediately
    pub fn signal_stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
        let _guard = self.shared.first_block.lock();
        self.shared.wakeup.notify_all();
    }

    pub fn state(&self) -> RecordThreadState {
        RecordThreadState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    pub fn stats(&self) -> RecordThreadStats {
        self.shared.stats.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop, wait for the final drain and get the queue ends back along
    /// with the final statistics
    pub fn stop(mut self) -> Result<(RecordQueues, RecordThreadStats), RecordError> {
        self.signal_stop();
        let Some(handle) = self.handle.take() else {
            return Err(RecordError::InvalidState("record thread already joined".into()));
        };
        match handle.join() {
            Ok(queues) => Ok((queues, self.stats())),
            Err(_) => {
                error!("Record thread panicked");
                self.force_close_files();
                Err(RecordError::InvalidState("record thread panicked".into()))
            }
        }
    }

    /// Close the engines' files if the thread died without doing so
    pub fn force_close_files(&self) {
        if self.is_running() || self.shared.clean_exit.load(Ordering::Acquire) {
            return;
        }
        warn!("Force closing recording files");
        for engine in self.engines.lock().iter_mut() {
            if let Err(e) = engine.close_files() {
                error!(engine = engine.engine_id(), error = %e, "Force close failed");
            }
        }
        self.shared.clean_exit.store(true, Ordering::Release);
        self.shared.set_state(RecordThreadState::Closed);
    }
}

impl Drop for RecordThread {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.signal_stop();
            if handle.join().is_err() {
                error!("Record thread panicked");
            }
            self.force_close_files();
        }
    }
}

impl fmt::Debug for RecordThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordThread")
            .field("state", &self.state())
            .field("running", &self.is_running())
            .finish()
    }
}

/// Per-pass limits
#[derive(Debug, Clone, Copy)]
struct PassLimits {
    samples: Option<usize>,
    events: Option<usize>,
    spikes: Option<usize>,
}

/// State owned by the thread itself
struct Worker {
    shared: Arc<Shared>,
    engines: SharedEngines,
    config: RecordThreadConfig,
    queues: RecordQueues,
    /// Synchronized timestamps of the current pass, per timestamp stream
    fts: Vec<Vec<f64>>,
    events: Vec<EventMessagePtr<EventPacket>>,
    spikes: Vec<EventMessagePtr<SpikeRecord>>,
}

impl Worker {
    fn run(mut self) -> RecordQueues {
        if !self.wait_for_first_block() {
            info!("Record thread stopped before the first block");
            self.shared.set_state(RecordThreadState::Closed);
            return self.queues;
        }

        self.shared.set_state(RecordThreadState::Opening);
        self.shared.clean_exit.store(false, Ordering::Release);
        self.open_files();

        self.shared.set_state(RecordThreadState::Writing);
        let limits = PassLimits {
            samples: self.config.max_write_samples,
            events: self.config.max_write_events,
            spikes: self.config.max_write_spikes,
        };
        while !self.shared.should_stop() {
            if self.write_pass(limits, false) == 0 {
                let mut guard = self.shared.first_block.lock();
                if !self.shared.should_stop() {
                    self.shared.wakeup.wait_for(&mut guard, self.config.poll_interval);
                }
            }
        }

        self.shared.set_state(RecordThreadState::Draining);
        let unbounded = PassLimits {
            samples: None,
            events: None,
            spikes: None,
        };
        self.write_pass(unbounded, true);

        for engine in self.engines.lock().iter_mut() {
            if let Err(e) = engine.close_files() {
                error!(engine = engine.engine_id(), error = %e, "Failed to close files");
            }
        }
        self.shared.clean_exit.store(true, Ordering::Release);
        *self.shared.first_block.lock() = false;
        self.shared.set_state(RecordThreadState::Closed);

        let stats = self.shared.stats.snapshot();
        info!(
            samples = stats.samples_written,
            events = stats.events_written,
            spikes = stats.spikes_written,
            passes = stats.passes,
            "Record thread finished"
        );
        self.queues
    }

    /// Returns false if stopped before the first block arrived
    fn wait_for_first_block(&self) -> bool {
        let mut received = self.shared.first_block.lock();
        while !*received {
            if self.shared.should_stop() {
                return false;
            }
            self.shared
                .wakeup
                .wait_for(&mut received, self.config.first_block_wait);
        }
        true
    }

    fn open_files(&mut self) {
        let origin = self.queues.data.block_sample_numbers(0);
        let cfg = &self.config;
        for engine in self.engines.lock().iter_mut() {
            engine.update_timestamps(&origin, None);
            if let Err(e) = engine.open_files(&cfg.root, cfg.experiment, cfg.recording) {
                error!(engine = engine.engine_id(), error = %e, "Failed to open recording files");
            }
        }
        info!(
            root = %cfg.root.display(),
            experiment = cfg.experiment,
            recording = cfg.recording,
            "Recording files opened"
        );
    }

    /// One drain pass; returns the number of samples, events and spikes
    /// handed to the engines
    fn write_pass(&mut self, limits: PassLimits, last_block: bool) -> usize {
        let engines = Arc::clone(&self.engines);
        let mut engines = engines.lock();
        let stats = &self.shared.stats;
        let layout = Arc::clone(&self.config.layout);
        let mut written = 0usize;
        let mut errors = 0u64;

        let n_streams = self.queues.data.num_timestamp_streams();
        let read = self.queues.data.start_read(limits.samples);
        let mut timestamps = read.sample_numbers();
        for engine in engines.iter_mut() {
            engine.update_timestamps(&timestamps, None);
            engine.start_channel_block(last_block);
        }

        self.fts.resize_with(n_streams, Vec::new);
        for (stream, buf) in self.fts.iter_mut().enumerate() {
            let (a, b) = read.timestamp_data(stream);
            buf.clear();
            buf.extend_from_slice(a);
            buf.extend_from_slice(b);
        }

        let n_channels = read.num_channels().min(layout.num_recorded_channels());
        for chan in 0..n_channels {
            let (first, second) = read.channel_data(chan);
            if first.is_empty() {
                continue;
            }
            let real = layout.real_channel(chan);
            let fts = self.fts.get(layout.stream_of(chan)).map(Vec::as_slice);
            let (fts1, fts2) = split_synchronized(fts, first.len(), second.len());

            for engine in engines.iter_mut() {
                errors += write_span(engine.as_mut(), chan, real, first, fts1);
            }
            if !second.is_empty() {
                timestamps[chan] += first.len() as i64;
                for engine in engines.iter_mut() {
                    engine.update_timestamps(&timestamps, Some(chan));
                    errors += write_span(engine.as_mut(), chan, real, second, fts2);
                }
            }
            written += first.len() + second.len();
        }
        drop(read);
        stats.samples_written.fetch_add(written as u64, Ordering::Relaxed);

        for engine in engines.iter_mut() {
            engine.end_channel_block(last_block);
        }

        self.events.clear();
        let n_events = self.queues.events.get_events(&mut self.events, limits.events);
        for event in &self.events {
            errors += route_event(&mut engines, event, stats);
        }
        self.events.clear();

        self.spikes.clear();
        let n_spikes = self.queues.spikes.get_events(&mut self.spikes, limits.spikes);
        for spike in &self.spikes {
            errors += write_spike(&mut engines, spike);
        }
        self.spikes.clear();
        stats.spikes_written.fetch_add(n_spikes as u64, Ordering::Relaxed);

        if errors > 0 {
            stats.write_errors.fetch_add(errors, Ordering::Relaxed);
        }
        stats.passes.fetch_add(1, Ordering::Relaxed);
        written + n_events + n_spikes
    }
}

/// Cut the synchronized timestamps of a pass into the two data spans.
///
/// Returns `None` for a span whose timestamps are not fully available.
fn split_synchronized(fts: Option<&[f64]>, size1: usize, size2: usize) -> (Option<&[f64]>, Option<&[f64]>) {
    match fts {
        Some(ts) if ts.len() >= size1 + size2 => (Some(&ts[..size1]), Some(&ts[size1..size1 + size2])),
        Some(ts) if ts.len() >= size1 => (Some(&ts[..size1]), None),
        _ => (None, None),
    }
}

fn write_span(
    engine: &mut dyn RecordEngine,
    chan: usize,
    real: usize,
    data: &[f32],
    fts: Option<&[f64]>,
) -> u64 {
    let result = match fts {
        Some(ts) => engine.write_continuous_data(chan, real, data, ts),
        None => engine.write_data(chan, real, data),
    };
    match result {
        Ok(()) => 0,
        Err(e) => {
            warn!(engine = engine.engine_id(), channel = chan, error = %e, "Continuous write failed");
            1
        }
    }
}

fn route_event(engines: &mut [Box<dyn RecordEngine>], event: &EventMsg, stats: &AtomicStats) -> u64 {
    let mut errors = 0;
    for engine in engines.iter_mut() {
        let result = match &event.payload.payload {
            EventPayload::Sync {
                stream_id,
                sample_rate,
                text,
            } => engine.write_timestamp_sync_text(*stream_id, event.timestamp, *sample_rate, text),
            _ => engine.write_event(event.extra as usize, event),
        };
        if let Err(e) = result {
            warn!(engine = engine.engine_id(), channel = event.extra, error = %e, "Event write failed");
            errors += 1;
        }
    }
    if event.payload.is_system() {
        stats.sync_messages.fetch_add(1, Ordering::Relaxed);
    } else {
        stats.events_written.fetch_add(1, Ordering::Relaxed);
    }
    errors
}

fn write_spike(engines: &mut [Box<dyn RecordEngine>], spike: &SpikeMsg) -> u64 {
    let mut errors = 0;
    for engine in engines.iter_mut() {
        if let Err(e) = engine.write_spike(spike.extra as usize, spike) {
            warn!(engine = engine.engine_id(), electrode = spike.extra, error = %e, "Spike write failed");
            errors += 1;
        }
    }
    errors
}
