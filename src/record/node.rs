//! Record node: the acquisition-side owner of a recording
//!
//! Owns the queue triple, the synchronizer and the engines. While idle
//! the queues are held whole so they can be reconfigured; while
//! recording they are split between the node (producer ends) and the
//! record thread (consumer ends) and rejoined on stop.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::engine::{EngineRegistry, RecordEngine};
use super::layout::{EventChannelKind, RecordingLayout};
use super::packet::{EventMsgQueue, EventPacket, SpikeMsgQueue, SpikeRecord};
use super::thread::{RecordQueues, RecordThread, RecordThreadConfig, RecordThreadStats, SharedEngines};
use super::{recording_dir, RecordError};
use crate::common::metrics::CounterSnapshot;
use crate::config::{Config, SyncConfig};
use crate::queue::{DataQueue, DataWriter, EventQueue, EventSender};
use crate::sync::{SyncTimer, Synchronizer};

/// Record node settings
#[derive(Debug, Clone)]
pub struct RecordNodeSettings {
    pub root: PathBuf,
    /// Engine ids; each records the same data
    pub engines: Vec<String>,
    /// Parameters applied to every engine that declares them
    pub engine_parameters: BTreeMap<String, String>,
    pub block_size: usize,
    pub num_blocks: usize,
    pub event_capacity: usize,
    pub spike_capacity: usize,
    pub poll_interval: Duration,
    /// Record synchronized timestamps next to sample numbers
    pub synchronized_timestamps: bool,
    /// TTL line carrying sync pulses, per stream id; line 0 if absent
    pub sync_lines: BTreeMap<u16, u8>,
    pub sync: SyncConfig,
}

impl Default for RecordNodeSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl RecordNodeSettings {
    pub fn from_config(config: &Config) -> Self {
        let rec = &config.recording;
        Self {
            root: rec.root.clone(),
            engines: vec![rec.engine.clone()],
            engine_parameters: rec.engine_parameters.clone(),
            block_size: rec.block_size,
            num_blocks: rec.num_blocks,
            event_capacity: rec.event_capacity,
            spike_capacity: rec.spike_capacity,
            poll_interval: rec.poll_interval(),
            synchronized_timestamps: true,
            sync_lines: config.streams.iter().map(|s| (s.id, s.sync_line)).collect(),
            sync: config.sync.clone(),
        }
    }
}

/// TTL transition seen by the acquisition
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TtlEvent {
    pub line: u8,
    pub state: bool,
    pub sample_number: i64,
    /// State of all lines after the transition
    pub word: u64,
}

/// Spike detected on spike channel `channel`
#[derive(Debug, Clone, PartialEq)]
pub struct SpikeEvent {
    pub channel: usize,
    pub sample_number: i64,
    pub record: SpikeRecord,
}

/// One acquisition callback's worth of data from one stream
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataBlock {
    pub stream_id: u16,
    pub first_sample_number: i64,
    /// One buffer per continuous channel of the stream
    pub samples: Vec<Vec<f32>>,
    pub ttl: Vec<TtlEvent>,
    pub spikes: Vec<SpikeEvent>,
}

/// Where a stream's data goes in the queues
#[derive(Debug, Clone)]
struct StreamRoute {
    id: u16,
    name: String,
    sample_rate: f64,
    /// `(write channel, index within the stream's buffers)`
    channels: Vec<(usize, usize)>,
    ttl_channel: Option<usize>,
    start_text_pending: bool,
}

enum Queues {
    Idle {
        data: DataQueue,
        events: EventMsgQueue,
        spikes: SpikeMsgQueue,
    },
    Recording {
        data: DataWriter,
        events: EventSender<EventPacket>,
        spikes: EventSender<SpikeRecord>,
        thread: RecordThread,
        first_block_pending: bool,
    },
    /// Between states, or after a lost record thread
    Detached,
}

/// Drives acquisition, synchronization and recording
pub struct RecordNode {
    settings: RecordNodeSettings,
    layout: Arc<RecordingLayout>,
    routes: Vec<StreamRoute>,
    registry: EngineRegistry,
    engines: SharedEngines,
    synchronizer: Arc<Synchronizer>,
    sync_timer: Option<SyncTimer>,
    queues: Queues,
    experiment: u32,
    recording: u32,
    acquiring: bool,
    last_stats: Option<RecordThreadStats>,
}

impl RecordNode {
    pub fn new(settings: RecordNodeSettings, layout: RecordingLayout) -> Result<Self, RecordError> {
        Self::with_registry(settings, layout, EngineRegistry::with_builtin())
    }

    /// Node with a custom engine registry
    pub fn with_registry(
        settings: RecordNodeSettings,
        layout: RecordingLayout,
        mut registry: EngineRegistry,
    ) -> Result<Self, RecordError> {
        layout.validate().map_err(RecordError::InvalidLayout)?;
        if settings.block_size == 0 || settings.num_blocks == 0 {
            return Err(RecordError::InvalidState("queue dimensions must be positive".into()));
        }
        for id in &settings.engines {
            if registry.get(id).is_none() {
                return Err(RecordError::UnknownEngine(id.clone()));
            }
            for (name, value) in &settings.engine_parameters {
                let declared = registry
                    .get(id)
                    .is_some_and(|m| m.parameters().iter().any(|p| &p.name == name));
                if declared {
                    registry.set_parameter(id, name, value)?;
                }
            }
        }

        let routes = build_routes(&layout);
        let synchronizer = Arc::new(Synchronizer::new(&settings.sync));
        let queues = Queues::Idle {
            data: DataQueue::new(settings.block_size, settings.num_blocks),
            events: EventQueue::new(settings.event_capacity),
            spikes: EventQueue::new(settings.spike_capacity),
        };

        Ok(Self {
            settings,
            layout: Arc::new(layout),
            routes,
            registry,
            engines: Arc::new(Mutex::new(Vec::new())),
            synchronizer,
            sync_timer: None,
            queues,
            experiment: 0,
            recording: 0,
            acquiring: false,
            last_stats: None,
        })
    }

    pub fn layout(&self) -> &Arc<RecordingLayout> {
        &self.layout
    }

    pub fn synchronizer(&self) -> &Arc<Synchronizer> {
        &self.synchronizer
    }

    pub fn registry_mut(&mut self) -> &mut EngineRegistry {
        &mut self.registry
    }

    pub fn experiment_number(&self) -> u32 {
        self.experiment
    }

    pub fn recording_number(&self) -> u32 {
        self.recording
    }

    pub fn is_acquiring(&self) -> bool {
        self.acquiring
    }

    pub fn is_recording(&self) -> bool {
        matches!(self.queues, Queues::Recording { .. })
    }

    /// Directory of the current (or last) recording
    pub fn recording_dir(&self) -> Option<PathBuf> {
        (self.recording > 0).then(|| recording_dir(&self.settings.root, self.experiment, self.recording))
    }

    /// Producer-side counters of the data queue while recording
    pub fn data_counters(&self) -> Option<CounterSnapshot> {
        match &self.queues {
            Queues::Recording { data, .. } => Some(data.counters()),
            _ => None,
        }
    }

    /// Statistics of the last finished recording
    pub fn last_stats(&self) -> Option<RecordThreadStats> {
        self.last_stats
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Register the streams with the synchronizer, start its timer and open
    /// a new experiment
    pub fn start_acquisition(&mut self) -> Result<(), RecordError> {
        if self.acquiring {
            return Err(RecordError::InvalidState("acquisition already running".into()));
        }

        self.synchronizer.prepare_for_update();
        for stream in &self.layout.streams {
            self.synchronizer.add_data_stream(stream.id, stream.sample_rate);
        }
        self.synchronizer.finished_update();
        for (&id, &line) in &self.settings.sync_lines {
            if self.synchronizer.sync_line(id).is_ok_and(|current| current != line) {
                self.synchronizer.set_sync_line(id, line)?;
            }
        }
        self.synchronizer.start_acquisition();
        self.sync_timer = Some(SyncTimer::start(Arc::clone(&self.synchronizer))?);

        self.experiment = next_experiment(&self.settings.root, self.experiment);
        self.recording = 0;
        self.acquiring = true;
        info!(experiment = self.experiment, "Acquisition started");
        Ok(())
    }

    /// Start writing `<root>/experiment<N>/recording<M+1>`
    pub fn start_recording(&mut self) -> Result<(), RecordError> {
        if !self.acquiring {
            return Err(RecordError::InvalidState("acquisition not running".into()));
        }
        let Queues::Idle { .. } = self.queues else {
            return Err(RecordError::InvalidState("already recording".into()));
        };

        let mut engines: Vec<Box<dyn RecordEngine>> = Vec::with_capacity(self.settings.engines.len());
        for id in &self.settings.engines {
            let mut engine = self.registry.instantiate(id)?;
            engine.configure(Arc::clone(&self.layout));
            engines.push(engine);
        }
        *self.engines.lock() = engines;

        let Queues::Idle {
            mut data,
            mut events,
            mut spikes,
        } = std::mem::replace(&mut self.queues, Queues::Detached)
        else {
            return Err(RecordError::InvalidState("queues detached".into()));
        };
        data.set_channels(self.layout.num_recorded_channels());
        // Each stream's timestamps travel with its first recorded channel
        let anchors: Vec<usize> = if self.settings.synchronized_timestamps {
            self.routes
                .iter()
                .map(|r| r.channels.first().map_or(usize::MAX, |&(write, _)| write))
                .collect()
        } else {
            Vec::new()
        };
        data.set_timestamp_streams(&anchors);
        data.clear();
        events.reset();
        spikes.reset();

        let (data_tx, data_rx) = data.split();
        let (event_tx, event_rx) = events.split();
        let (spike_tx, spike_rx) = spikes.split();

        self.recording += 1;
        let mut config = RecordThreadConfig::new(
            self.settings.root.clone(),
            self.experiment,
            self.recording,
            Arc::clone(&self.layout),
        );
        config.poll_interval = self.settings.poll_interval;

        let thread = RecordThread::spawn(
            config,
            Arc::clone(&self.engines),
            RecordQueues {
                data: data_rx,
                events: event_rx,
                spikes: spike_rx,
            },
        )?;
        for route in &mut self.routes {
            route.start_text_pending = true;
        }
        self.queues = Queues::Recording {
            data: data_tx,
            events: event_tx,
            spikes: spike_tx,
            thread,
            first_block_pending: true,
        };
        info!(
            experiment = self.experiment,
            recording = self.recording,
            "Recording started"
        );
        Ok(())
    }

    /// Queue one block of acquired data.
    ///
    /// TTL events always reach the synchronizer; data reaches the queues
    /// only while recording. Queue overruns are logged and counted, never
    /// returned as errors.
    pub fn process_block(&mut self, block: &DataBlock) -> Result<(), RecordError> {
        if !self.acquiring {
            return Err(RecordError::InvalidState("acquisition not running".into()));
        }
        let stream_index = self
            .layout
            .stream_index(block.stream_id)
            .ok_or(RecordError::ChannelOutOfRange {
                kind: "stream",
                index: block.stream_id as usize,
            })?;

        for ttl in &block.ttl {
            self.synchronizer
                .add_event(block.stream_id, ttl.line, ttl.sample_number, ttl.state);
        }

        let Queues::Recording {
            data,
            events,
            spikes,
            thread,
            first_block_pending,
        } = &mut self.queues
        else {
            return Ok(());
        };
        let route = &mut self.routes[stream_index];

        if route.start_text_pending {
            route.start_text_pending = false;
            let text = format!(
                "Start Time for {} ({}) - {} @ {} Hz: {}",
                self.layout.streams[stream_index].source_node_name,
                self.layout.streams[stream_index].source_node_id,
                route.name,
                route.sample_rate,
                block.first_sample_number
            );
            events.add_event(
                EventPacket::sync(route.id, route.sample_rate as f32, text),
                block.first_sample_number,
                -1,
            );
        }

        let n_samples = route
            .channels
            .first()
            .and_then(|&(_, local)| block.samples.get(local))
            .map_or(0, Vec::len);

        // Timestamps go first: the reader takes as many as it finds
        // samples on the stream's first channel.
        if self.settings.synchronized_timestamps && n_samples > 0 {
            let (start, step) = match (
                self.synchronizer
                    .convert_sample_number_to_timestamp(route.id, block.first_sample_number),
                self.synchronizer.actual_sample_rate(route.id),
            ) {
                (Ok(start), Ok(Some(rate))) => (start, 1.0 / rate),
                _ => (-1.0, 0.0),
            };
            data.write_synchronized_timestamps(start, step, stream_index, n_samples);
        }

        for &(write, local) in &route.channels {
            let Some(samples) = block.samples.get(local) else {
                warn!(stream = block.stream_id, channel = local, "Block is missing a channel");
                continue;
            };
            data.write_channel(samples, write, block.first_sample_number);
        }

        if let Some(ttl_channel) = route.ttl_channel {
            for ttl in &block.ttl {
                events.add_event(
                    EventPacket::ttl(ttl.line, ttl.state, ttl.word),
                    ttl.sample_number,
                    ttl_channel as i32,
                );
            }
        }

        for spike in &block.spikes {
            if spike.channel >= self.layout.spikes.len() {
                debug!(channel = spike.channel, "Spike on unknown spike channel");
                continue;
            }
            spikes.add_event(spike.record.clone(), spike.sample_number, spike.channel as i32);
        }

        if *first_block_pending && n_samples > 0 {
            *first_block_pending = false;
            thread.set_first_block();
        }
        Ok(())
    }

    /// Queue a free-form text event on event channel `channel`
    pub fn add_text_event(&mut self, channel: usize, sample_number: i64, text: &str) -> bool {
        let is_text = self
            .layout
            .events
            .get(channel)
            .is_some_and(|c| matches!(c.kind, EventChannelKind::Text { .. }));
        match &mut self.queues {
            Queues::Recording { events, .. } if is_text => {
                events.add_event(EventPacket::text(text), sample_number, channel as i32)
            }
            _ => false,
        }
    }

    /// Drain the queues, close the files and get the queues back
    pub fn stop_recording(&mut self) -> Result<RecordThreadStats, RecordError> {
        let Queues::Recording {
            data,
            events,
            spikes,
            thread,
            ..
        } = std::mem::replace(&mut self.queues, Queues::Detached)
        else {
            return Err(RecordError::InvalidState("not recording".into()));
        };

        let result = thread.stop().and_then(|(queues, stats)| {
            let data = DataQueue::rejoin(data, queues.data)?;
            let events = EventQueue::rejoin(events, queues.events)?;
            let spikes = EventQueue::rejoin(spikes, queues.spikes)?;
            Ok((Queues::Idle { data, events, spikes }, stats))
        });
        self.engines.lock().clear();

        let stats = match result {
            Ok((queues, stats)) => {
                self.queues = queues;
                stats
            }
            Err(e) => {
                error!(error = %e, "Record thread lost, rebuilding queues");
                self.queues = self.fresh_queues();
                return Err(e);
            }
        };

        self.last_stats = Some(stats);
        info!(
            experiment = self.experiment,
            recording = self.recording,
            samples = stats.samples_written,
            events = stats.events_written,
            spikes = stats.spikes_written,
            write_errors = stats.write_errors,
            "Recording stopped"
        );
        Ok(stats)
    }

    /// Stop recording if needed, then the synchronizer and its timer
    pub fn stop_acquisition(&mut self) -> Result<(), RecordError> {
        if !self.acquiring {
            return Ok(());
        }
        let result = if self.is_recording() {
            self.stop_recording().map(|_| ())
        } else {
            Ok(())
        };
        self.synchronizer.stop_acquisition();
        if let Some(timer) = self.sync_timer.take() {
            timer.stop();
        }
        self.acquiring = false;
        info!(experiment = self.experiment, "Acquisition stopped");
        result
    }

    fn fresh_queues(&self) -> Queues {
        Queues::Idle {
            data: DataQueue::new(self.settings.block_size, self.settings.num_blocks),
            events: EventQueue::new(self.settings.event_capacity),
            spikes: EventQueue::new(self.settings.spike_capacity),
        }
    }
}

impl std::fmt::Debug for RecordNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordNode")
            .field("root", &self.settings.root)
            .field("experiment", &self.experiment)
            .field("recording", &self.recording)
            .field("acquiring", &self.acquiring)
            .field("recording_active", &self.is_recording())
            .finish()
    }
}

impl Drop for RecordNode {
    fn drop(&mut self) {
        if let Err(e) = self.stop_acquisition() {
            error!(error = %e, "Failed to stop acquisition on drop");
        }
    }
}

fn build_routes(layout: &RecordingLayout) -> Vec<StreamRoute> {
    let mut routes: Vec<StreamRoute> = layout
        .streams
        .iter()
        .enumerate()
        .map(|(index, stream)| StreamRoute {
            id: stream.id,
            name: stream.name.clone(),
            sample_rate: stream.sample_rate,
            channels: Vec::new(),
            ttl_channel: layout
                .events
                .iter()
                .position(|c| c.stream == index && matches!(c.kind, EventChannelKind::Ttl { .. })),
            start_text_pending: false,
        })
        .collect();

    // Position of each real channel within its stream's buffers
    let mut local = vec![0usize; layout.continuous.len()];
    let mut next = vec![0usize; layout.streams.len()];
    for (real, channel) in layout.continuous.iter().enumerate() {
        local[real] = next[channel.stream];
        next[channel.stream] += 1;
    }
    for (write, &real) in layout.recorded.iter().enumerate() {
        let stream = layout.continuous[real].stream;
        routes[stream].channels.push((write, local[real]));
    }
    routes
}

/// First experiment number after `current` whose folder does not exist yet
fn next_experiment(root: &Path, current: u32) -> u32 {
    let mut n = current + 1;
    while root.join(format!("experiment{n}")).exists() {
        n += 1;
    }
    n
}
