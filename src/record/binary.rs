//! Binary record engine (`RAWBINARY`)
//!
//! Directory structure of one recording:
//! ```text
//! recording<M>/
//! ├── structure.oebin                 JSON description of everything below
//! ├── sync_messages.txt
//! ├── continuous/<stream>/
//! │   ├── continuous.dat              interleaved i16, all channels of the stream
//! │   ├── timestamps.npy              i64 sample numbers
//! │   └── synchronized_timestamps.npy f64 seconds (synchronized streams only)
//! ├── events/<stream>/<NAME>_<n>/
//! │   ├── channel_states.npy | text.npy | data_array.npy
//! │   ├── timestamps.npy
//! │   ├── channels.npy
//! │   ├── full_words.npy              TTL only, optional
//! │   └── metadata.npy                optional
//! └── spikes/<stream>/spike_group_<n>/
//!     ├── spike_waveforms.npy
//!     ├── spike_times.npy
//!     ├── spike_electrode_indices.npy
//!     ├── spike_clusters.npy
//!     └── metadata.npy                optional
//! ```

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::engine::{ChannelTimestamps, EngineManager, EngineParameter, RecordEngine};
use super::layout::{EventChannel, EventChannelKind, MetadataField, RecordingLayout};
use super::packet::{EventMsg, EventPayload, SpikeMsg};
use super::{recording_dir, scale_to_i16, RecordError};
use crate::format::{BaseType, FormatError, NpyFile, NpyType, SequentialBlockFile};

pub const ENGINE_ID: &str = "RAWBINARY";

/// Samples per in-memory block of the continuous files
pub const SAMPLES_PER_BLOCK: usize = 4096;

/// Parameter 0
pub const PARAM_SAVE_TTL_WORDS: &str = "Record TTL full words";

/// Open a file, logging and returning `None` on failure so the recording
/// carries on without it
fn open_logged<T>(what: &str, path: &Path, result: Result<T, FormatError>) -> Option<T> {
    match result {
        Ok(file) => Some(file),
        Err(e) => {
            error!(file = what, path = %path.display(), error = %e, "Failed to create file");
            None
        }
    }
}

/// NPY files of one event channel or spike group
#[derive(Debug)]
struct EventRecording {
    main: NpyFile,
    timestamps: NpyFile,
    channels: NpyFile,
    extra: Option<NpyFile>,
    metadata: Option<NpyFile>,
    metadata_size: usize,
}

impl EventRecording {
    fn increase_counts(&mut self) -> Result<(), FormatError> {
        self.main.increase_record_count(1)?;
        self.timestamps.increase_record_count(1)?;
        self.channels.increase_record_count(1)?;
        if let Some(extra) = &mut self.extra {
            extra.increase_record_count(1)?;
        }
        if let Some(metadata) = &mut self.metadata {
            metadata.increase_record_count(1)?;
        }
        Ok(())
    }

    fn write_metadata(&mut self, raw: &[u8]) -> Result<(), FormatError> {
        if let Some(file) = &mut self.metadata {
            file.write_data(&fit_bytes(raw, self.metadata_size))?;
        }
        Ok(())
    }

    fn close(self) -> Result<(), FormatError> {
        self.main.close()?;
        self.timestamps.close()?;
        self.channels.close()?;
        if let Some(extra) = self.extra {
            extra.close()?;
        }
        if let Some(metadata) = self.metadata {
            metadata.close()?;
        }
        Ok(())
    }
}

/// Truncate or zero-pad `raw` to exactly `len` bytes
fn fit_bytes(raw: &[u8], len: usize) -> Vec<u8> {
    let mut out = raw[..raw.len().min(len)].to_vec();
    out.resize(len, 0);
    out
}

/// Files of one continuous stream
#[derive(Debug)]
struct ContinuousFiles {
    data: Option<SequentialBlockFile>,
    timestamps: Option<NpyFile>,
    synchronized: Option<NpyFile>,
}

// structure.oebin

#[derive(Debug, Serialize)]
struct Oebin {
    #[serde(rename = "GUI version")]
    version: String,
    continuous: Vec<OebinContinuous>,
    events: Vec<OebinEvents>,
    spikes: Vec<OebinSpikes>,
}

#[derive(Debug, Serialize)]
struct OebinChannel {
    channel_name: String,
    description: String,
    bit_volts: f32,
    units: String,
    source_processor_index: usize,
    recorded_processor_index: usize,
}

#[derive(Debug, Serialize)]
struct OebinContinuous {
    folder_name: String,
    sample_rate: f64,
    source_processor_name: String,
    source_processor_id: u16,
    stream_name: String,
    num_channels: usize,
    channels: Vec<OebinChannel>,
}

#[derive(Debug, Serialize)]
struct OebinMetadata {
    name: String,
    description: String,
    #[serde(rename = "type")]
    kind: &'static str,
    length: usize,
}

#[derive(Debug, Serialize)]
struct OebinEvents {
    folder_name: String,
    channel_name: String,
    description: String,
    sample_rate: f64,
    #[serde(rename = "type")]
    kind: &'static str,
    num_channels: usize,
    source_processor: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    event_metadata: Vec<OebinMetadata>,
}

#[derive(Debug, Serialize)]
struct OebinSpikeChannel {
    channel_name: String,
    description: String,
}

#[derive(Debug, Serialize)]
struct OebinSpikes {
    folder_name: String,
    sample_rate: f64,
    source_processor: String,
    num_channels: usize,
    pre_peak_samples: usize,
    post_peak_samples: usize,
    channels: Vec<OebinSpikeChannel>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    event_metadata: Vec<OebinMetadata>,
}

fn oebin_metadata(fields: &[MetadataField]) -> Vec<OebinMetadata> {
    fields
        .iter()
        .map(|f| OebinMetadata {
            name: f.name.clone(),
            description: f.description.clone(),
            kind: f.base.json_name(),
            length: f.length,
        })
        .collect()
}

fn create_metadata_file(fields: &[MetadataField], path: &Path) -> Option<NpyFile> {
    if fields.is_empty() {
        return None;
    }
    let types: Vec<NpyType> = fields.iter().map(MetadataField::npy_type).collect();
    open_logged("metadata", path, NpyFile::create(path, &types))
}

/// Binary engine state
#[derive(Debug)]
pub struct BinaryRecording {
    layout: Arc<RecordingLayout>,
    timestamps: ChannelTimestamps,
    save_ttl_words: bool,

    /// Per recorded stream group
    continuous: Vec<ContinuousFiles>,
    /// Per write channel: index into `continuous`
    file_index: Vec<usize>,
    /// Per write channel: channel index within its stream file
    channel_index: Vec<usize>,
    /// Per stream file: sample number of its first recorded sample, set by
    /// the first write that reaches the file
    start_ts: Vec<Option<i64>>,

    /// Per event channel
    event_files: Vec<Option<EventRecording>>,
    spike_files: Vec<Option<EventRecording>>,
    /// Per spike channel: spike group index
    spike_file_index: Vec<usize>,
    /// Per spike channel: 1-based electrode index within its group
    spike_channel_index: Vec<u16>,

    sync_text: Option<BufWriter<File>>,
    recording_dir: Option<PathBuf>,

    int_buffer: Vec<i16>,
    ts_buffer: Vec<i64>,
}

impl Default for BinaryRecording {
    fn default() -> Self {
        Self::new()
    }
}

impl BinaryRecording {
    pub fn new() -> Self {
        Self {
            layout: Arc::new(RecordingLayout::default()),
            timestamps: ChannelTimestamps::default(),
            save_ttl_words: true,
            continuous: Vec::new(),
            file_index: Vec::new(),
            channel_index: Vec::new(),
            start_ts: Vec::new(),
            event_files: Vec::new(),
            spike_files: Vec::new(),
            spike_file_index: Vec::new(),
            spike_channel_index: Vec::new(),
            sync_text: None,
            recording_dir: None,
            int_buffer: Vec::new(),
            ts_buffer: Vec::new(),
        }
    }

    /// Registry entry for this engine
    pub fn manager() -> EngineManager {
        EngineManager::new(ENGINE_ID, "Binary", || Box::new(BinaryRecording::new()))
            .with_parameter(EngineParameter::new_bool(0, PARAM_SAVE_TTL_WORDS, true))
    }

    /// Directory of the currently open recording
    pub fn recording_dir(&self) -> Option<&Path> {
        self.recording_dir.as_deref()
    }

    fn open_continuous(&mut self, base: &Path) -> Vec<OebinContinuous> {
        let layout = Arc::clone(&self.layout);
        let n = layout.num_recorded_channels();
        self.file_index = vec![0; n];
        self.channel_index = vec![0; n];

        // Group write channels by stream, in order of first appearance.
        let mut stream_groups: Vec<usize> = Vec::new();
        let mut json: Vec<OebinContinuous> = Vec::new();
        for write in 0..n {
            let real = layout.real_channel(write);
            let channel = layout.channel(real);
            let group = match stream_groups.iter().position(|&s| s == channel.stream) {
                Some(g) => g,
                None => {
                    let stream = &layout.streams[channel.stream];
                    stream_groups.push(channel.stream);
                    json.push(OebinContinuous {
                        folder_name: format!("{}/", stream.folder_name()),
                        sample_rate: stream.sample_rate,
                        source_processor_name: stream.source_node_name.clone(),
                        source_processor_id: stream.source_node_id,
                        stream_name: stream.name.clone(),
                        num_channels: 0,
                        channels: Vec::new(),
                    });
                    stream_groups.len() - 1
                }
            };
            let entry = &mut json[group];
            self.file_index[write] = group;
            self.channel_index[write] = entry.channels.len();
            entry.channels.push(OebinChannel {
                channel_name: channel.name.clone(),
                description: channel.description.clone(),
                bit_volts: channel.bit_volts,
                units: channel.units.clone(),
                source_processor_index: real,
                recorded_processor_index: write,
            });
            entry.num_channels = entry.channels.len();
        }

        self.continuous = stream_groups
            .iter()
            .zip(&json)
            .map(|(&stream, entry)| {
                let dir = base.join("continuous").join(layout.streams[stream].folder_name());
                if let Err(e) = fs::create_dir_all(&dir) {
                    error!(path = %dir.display(), error = %e, "Failed to create continuous folder");
                }
                let dat = dir.join("continuous.dat");
                let ts = dir.join("timestamps.npy");
                let sts = dir.join("synchronized_timestamps.npy");
                ContinuousFiles {
                    data: open_logged(
                        "continuous",
                        &dat,
                        SequentialBlockFile::create(&dat, entry.num_channels, SAMPLES_PER_BLOCK),
                    ),
                    timestamps: open_logged(
                        "timestamps",
                        &ts,
                        NpyFile::create(&ts, &[NpyType::new(BaseType::I64, 1)]),
                    ),
                    synchronized: open_logged(
                        "synchronized timestamps",
                        &sts,
                        NpyFile::create(&sts, &[NpyType::new(BaseType::F64, 1)]),
                    ),
                }
            })
            .collect();

        self.start_ts = vec![None; self.continuous.len()];
        json
    }

    fn open_events(&mut self, base: &Path) -> Vec<OebinEvents> {
        let layout = Arc::clone(&self.layout);
        let mut json = Vec::with_capacity(layout.events.len());
        self.event_files = Vec::with_capacity(layout.events.len());

        for (index, channel) in layout.events.iter().enumerate() {
            let stream = &layout.streams[channel.stream];
            let (prefix, data_name, npy_type, kind) = match &channel.kind {
                EventChannelKind::Ttl { .. } => {
                    ("TTL", "channel_states", NpyType::new(BaseType::I16, 1), "int16")
                }
                EventChannelKind::Text { max_length } => (
                    "TEXT_group",
                    "text",
                    NpyType::new(BaseType::Char, *max_length),
                    "string",
                ),
                EventChannelKind::Binary { base, length } => (
                    "BINARY_group",
                    "data_array",
                    NpyType::new((*base).into(), *length),
                    base.json_name(),
                ),
            };
            let folder = format!("{}/{}_{}", stream.folder_name(), prefix, index + 1);
            let dir = base.join("events").join(&folder);
            if let Err(e) = fs::create_dir_all(&dir) {
                error!(path = %dir.display(), error = %e, "Failed to create event folder");
            }

            let recording = self.open_event_recording(&dir, channel, data_name, npy_type);
            self.event_files.push(recording);
            json.push(OebinEvents {
                folder_name: format!("{folder}/"),
                channel_name: channel.name.clone(),
                description: channel.description.clone(),
                sample_rate: stream.sample_rate,
                kind,
                num_channels: match channel.kind {
                    EventChannelKind::Ttl { num_lines } => num_lines,
                    _ => 1,
                },
                source_processor: stream.source_node_name.clone(),
                event_metadata: oebin_metadata(&channel.metadata),
            });
        }
        json
    }

    fn open_event_recording(
        &self,
        dir: &Path,
        channel: &EventChannel,
        data_name: &str,
        npy_type: NpyType,
    ) -> Option<EventRecording> {
        let main_path = dir.join(format!("{data_name}.npy"));
        let ts_path = dir.join("timestamps.npy");
        let ch_path = dir.join("channels.npy");
        let main = open_logged(data_name, &main_path, NpyFile::create(&main_path, &[npy_type]))?;
        let timestamps = open_logged(
            "timestamps",
            &ts_path,
            NpyFile::create(&ts_path, &[NpyType::new(BaseType::I64, 1)]),
        )?;
        let channels = open_logged(
            "channels",
            &ch_path,
            NpyFile::create(&ch_path, &[NpyType::new(BaseType::U16, 1)]),
        )?;

        let extra = match channel.kind {
            EventChannelKind::Ttl { .. } if self.save_ttl_words => {
                let path = dir.join("full_words.npy");
                open_logged(
                    "full_words",
                    &path,
                    NpyFile::create(&path, &[NpyType::new(BaseType::U8, channel.data_size())]),
                )
            }
            _ => None,
        };

        Some(EventRecording {
            main,
            timestamps,
            channels,
            extra,
            metadata: create_metadata_file(&channel.metadata, &dir.join("metadata.npy")),
            metadata_size: channel.metadata_size(),
        })
    }

    fn open_spikes(&mut self, base: &Path) -> Vec<OebinSpikes> {
        let layout = Arc::clone(&self.layout);
        let n = layout.spikes.len();
        self.spike_file_index = vec![0; n];
        self.spike_channel_index = vec![0; n];
        self.spike_files = Vec::new();

        let mut groups: Vec<usize> = Vec::new();
        let mut json: Vec<OebinSpikes> = Vec::new();
        let mut group_count: HashMap<usize, usize> = HashMap::new();

        for (index, channel) in layout.spikes.iter().enumerate() {
            let entry = OebinSpikeChannel {
                channel_name: channel.name.clone(),
                description: channel.description.clone(),
            };

            if let Some(group) = groups
                .iter()
                .position(|&g| layout.spikes[g].same_group(channel))
            {
                let members = &mut json[group].channels;
                members.push(entry);
                self.spike_file_index[index] = group;
                self.spike_channel_index[index] = members.len() as u16;
                continue;
            }

            let stream = &layout.streams[channel.stream];
            let number = group_count.entry(channel.stream).or_insert(0);
            *number += 1;
            let folder = format!("{}/spike_group_{}", stream.folder_name(), number);
            let dir = base.join("spikes").join(&folder);
            if let Err(e) = fs::create_dir_all(&dir) {
                error!(path = %dir.display(), error = %e, "Failed to create spike folder");
            }

            let waveforms = dir.join("spike_waveforms.npy");
            let times = dir.join("spike_times.npy");
            let electrodes = dir.join("spike_electrode_indices.npy");
            let clusters = dir.join("spike_clusters.npy");
            let recording = (|| {
                Some(EventRecording {
                    main: open_logged(
                        "spike_waveforms",
                        &waveforms,
                        NpyFile::create_with_dim(
                            &waveforms,
                            NpyType::new(BaseType::I16, channel.total_samples()),
                            channel.num_channels,
                        ),
                    )?,
                    timestamps: open_logged(
                        "spike_times",
                        &times,
                        NpyFile::create(&times, &[NpyType::new(BaseType::I64, 1)]),
                    )?,
                    channels: open_logged(
                        "spike_electrode_indices",
                        &electrodes,
                        NpyFile::create(&electrodes, &[NpyType::new(BaseType::U16, 1)]),
                    )?,
                    extra: Some(open_logged(
                        "spike_clusters",
                        &clusters,
                        NpyFile::create(&clusters, &[NpyType::new(BaseType::U16, 1)]),
                    )?),
                    metadata: create_metadata_file(&channel.metadata, &dir.join("metadata.npy")),
                    metadata_size: channel.metadata.iter().map(MetadataField::byte_size).sum(),
                })
            })();

            groups.push(index);
            self.spike_files.push(recording);
            self.spike_file_index[index] = groups.len() - 1;
            self.spike_channel_index[index] = 1;
            json.push(OebinSpikes {
                folder_name: format!("{folder}/"),
                sample_rate: stream.sample_rate,
                source_processor: stream.source_node_name.clone(),
                num_channels: channel.num_channels,
                pre_peak_samples: channel.pre_peak_samples,
                post_peak_samples: channel.post_peak_samples,
                channels: vec![entry],
                event_metadata: oebin_metadata(&channel.metadata),
            });
        }
        json
    }
}

impl RecordEngine for BinaryRecording {
    fn engine_id(&self) -> &str {
        ENGINE_ID
    }

    fn set_parameter(&mut self, parameter: &EngineParameter) {
        if parameter.id == 0 {
            if let Some(value) = parameter.as_bool() {
                self.save_ttl_words = value;
            }
        }
    }

    fn configure(&mut self, layout: Arc<RecordingLayout>) {
        self.layout = layout;
        self.reset_channels();
    }

    fn reset_channels(&mut self) {
        self.continuous.clear();
        self.file_index.clear();
        self.channel_index.clear();
        self.start_ts.clear();
        self.event_files.clear();
        self.spike_files.clear();
        self.spike_file_index.clear();
        self.spike_channel_index.clear();
        self.sync_text = None;
        self.recording_dir = None;
    }

    fn open_files(&mut self, root: &Path, experiment: u32, recording: u32) -> Result<(), RecordError> {
        let base = recording_dir(root, experiment, recording);
        fs::create_dir_all(&base)?;

        let continuous = self.open_continuous(&base);
        let events = self.open_events(&base);
        let spikes = self.open_spikes(&base);

        let sync_path = base.join("sync_messages.txt");
        self.sync_text = match File::create(&sync_path) {
            Ok(file) => Some(BufWriter::new(file)),
            Err(e) => {
                error!(path = %sync_path.display(), error = %e, "Failed to create sync text file");
                None
            }
        };

        let oebin = Oebin {
            version: env!("CARGO_PKG_VERSION").to_string(),
            continuous,
            events,
            spikes,
        };
        let mut writer = BufWriter::new(File::create(base.join("structure.oebin"))?);
        serde_json::to_writer_pretty(&mut writer, &oebin)?;
        writer.flush()?;

        info!(
            path = %base.display(),
            streams = self.continuous.len(),
            event_channels = self.event_files.len(),
            spike_groups = self.spike_files.len(),
            "Binary recording opened"
        );
        self.recording_dir = Some(base);
        Ok(())
    }

    fn close_files(&mut self) -> Result<(), RecordError> {
        let mut first_error: Option<RecordError> = None;
        let mut keep = |result: Result<(), FormatError>| {
            if let Err(e) = result {
                warn!(error = %e, "Error while closing recording file");
                first_error.get_or_insert(e.into());
            }
        };

        for files in self.continuous.drain(..) {
            if let Some(data) = files.data {
                keep(data.close());
            }
            if let Some(ts) = files.timestamps {
                keep(ts.close());
            }
            if let Some(sts) = files.synchronized {
                keep(sts.close());
            }
        }
        for rec in self.event_files.drain(..).chain(self.spike_files.drain(..)).flatten() {
            keep(rec.close());
        }
        if let Some(mut sync) = self.sync_text.take() {
            keep(sync.flush().map_err(FormatError::from));
        }

        debug!(path = ?self.recording_dir, "Binary recording closed");
        self.reset_channels();
        first_error.map_or(Ok(()), Err)
    }

    fn write_data(&mut self, write_channel: usize, real_channel: usize, data: &[f32]) -> Result<(), RecordError> {
        self.write_continuous_data(write_channel, real_channel, data, &[])
    }

    fn write_continuous_data(
        &mut self,
        write_channel: usize,
        real_channel: usize,
        data: &[f32],
        synchronized: &[f64],
    ) -> Result<(), RecordError> {
        if data.is_empty() {
            return Ok(());
        }
        let (Some(&file_index), Some(&channel_index)) = (
            self.file_index.get(write_channel),
            self.channel_index.get(write_channel),
        ) else {
            return Err(RecordError::ChannelOutOfRange {
                kind: "continuous",
                index: write_channel,
            });
        };

        let Some(bit_volts) = self.layout.continuous.get(real_channel).map(|c| c.bit_volts) else {
            return Err(RecordError::ChannelOutOfRange {
                kind: "continuous",
                index: real_channel,
            });
        };
        scale_to_i16(data, bit_volts, &mut self.int_buffer);

        let base_ts = self.timestamps.get(write_channel);
        let position = base_ts - *self.start_ts[file_index].get_or_insert(base_ts);
        let files = &mut self.continuous[file_index];

        if let Some(dat) = &mut files.data {
            if position < 0 {
                warn!(write_channel, position, "Sample number precedes recording start");
            } else if !dat.write_channel(position as u64, channel_index, &self.int_buffer)? {
                warn!(write_channel, position, "Continuous block already flushed");
            }
        }

        // One timestamp series per stream, written alongside its first channel.
        if channel_index == 0 {
            if let Some(ts) = &mut files.timestamps {
                self.ts_buffer.clear();
                self.ts_buffer.extend((0..data.len() as i64).map(|i| base_ts + i));
                ts.write_values(&self.ts_buffer)?;
                ts.increase_record_count(data.len() as u64)?;
            }
            if !synchronized.is_empty() {
                if let Some(sts) = &mut files.synchronized {
                    sts.write_values(synchronized)?;
                    sts.increase_record_count(synchronized.len() as u64)?;
                }
            }
        }
        Ok(())
    }

    fn write_event(&mut self, index: usize, event: &EventMsg) -> Result<(), RecordError> {
        let Some(channel) = self.layout.events.get(index) else {
            return Err(RecordError::ChannelOutOfRange { kind: "event", index });
        };
        let data_size = channel.data_size();
        let Some(Some(rec)) = self.event_files.get_mut(index) else {
            return Ok(());
        };

        rec.timestamps.write_values(&[event.timestamp])?;
        let packet = &event.payload;
        match &packet.payload {
            EventPayload::Ttl { line, state, word } => {
                let line = *line as i16 + 1;
                rec.channels.write_values(&[line as u16])?;
                rec.main.write_values(&[if *state { line } else { -line }])?;
                if let Some(words) = &mut rec.extra {
                    words.write_data(&fit_bytes(&word.to_le_bytes(), data_size))?;
                }
            }
            EventPayload::Text(text) => {
                rec.channels.write_values(&[1u16])?;
                rec.main.write_data(&fit_bytes(text.as_bytes(), data_size))?;
            }
            EventPayload::Binary(bytes) => {
                rec.channels.write_values(&[1u16])?;
                rec.main.write_data(&fit_bytes(bytes, data_size))?;
            }
            EventPayload::Sync { .. } => {
                warn!(index, "System message routed to an event channel, ignored");
                return Ok(());
            }
        }
        rec.write_metadata(&packet.metadata)?;
        rec.increase_counts()?;
        Ok(())
    }

    fn write_spike(&mut self, index: usize, spike: &SpikeMsg) -> Result<(), RecordError> {
        let Some(channel) = self.layout.spikes.get(index) else {
            return Err(RecordError::ChannelOutOfRange { kind: "spike", index });
        };
        let total = channel.total_samples() * channel.num_channels;
        let bit_volts = channel.bit_volts;
        let (Some(&group), Some(&electrode)) = (
            self.spike_file_index.get(index),
            self.spike_channel_index.get(index),
        ) else {
            return Ok(());
        };
        let Some(Some(rec)) = self.spike_files.get_mut(group) else {
            return Ok(());
        };

        let record = &spike.payload;
        let mut waveform = record.waveform.clone();
        if waveform.len() != total {
            warn!(index, expected = total, got = waveform.len(), "Spike waveform size mismatch");
            waveform.resize(total, 0.0);
        }
        scale_to_i16(&waveform, bit_volts, &mut self.int_buffer);

        rec.main.write_values(&self.int_buffer)?;
        rec.timestamps.write_values(&[spike.timestamp])?;
        rec.channels.write_values(&[electrode])?;
        if let Some(clusters) = &mut rec.extra {
            clusters.write_values(&[record.sorted_id])?;
        }
        rec.write_metadata(&record.metadata)?;
        rec.increase_counts()?;
        Ok(())
    }

    fn write_timestamp_sync_text(
        &mut self,
        _stream_id: u16,
        _sample_number: i64,
        _sample_rate: f32,
        text: &str,
    ) -> Result<(), RecordError> {
        let Some(file) = &mut self.sync_text else {
            return Ok(());
        };
        writeln!(file, "{text}")?;
        Ok(())
    }

    fn timestamps(&self) -> &ChannelTimestamps {
        &self.timestamps
    }

    fn timestamps_mut(&mut self) -> &mut ChannelTimestamps {
        &mut self.timestamps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::npy::read_npy;
    use crate::queue::EventMessage;
    use crate::record::layout::{ContinuousChannel, MetadataType, SpikeChannel, StreamInfo};
    use crate::record::packet::{EventPacket, SpikeRecord};
    use tempfile::tempdir;

    fn layout() -> Arc<RecordingLayout> {
        let stream = StreamInfo {
            id: 0,
            name: "example_data".into(),
            source_node_id: 100,
            source_node_name: "Emulator".into(),
            sample_rate: 1000.0,
        };
        let channel = |name: &str| ContinuousChannel {
            name: name.into(),
            description: String::new(),
            stream: 0,
            bit_volts: 0.5,
            units: "uV".into(),
        };
        let ttl = EventChannel {
            name: "TTL Input".into(),
            description: String::new(),
            stream: 0,
            kind: EventChannelKind::Ttl { num_lines: 8 },
            metadata: vec![],
        };
        let text = EventChannel {
            name: "Messages".into(),
            kind: EventChannelKind::Text { max_length: 15 },
            ..ttl.clone()
        };
        let electrode = |name: &str| SpikeChannel {
            name: name.into(),
            description: String::new(),
            stream: 0,
            num_channels: 1,
            pre_peak_samples: 2,
            post_peak_samples: 2,
            bit_volts: 0.5,
            metadata: vec![MetadataField {
                name: "amp".into(),
                description: String::new(),
                base: MetadataType::Float,
                length: 1,
            }],
        };
        Arc::new(RecordingLayout::record_all(
            vec![stream],
            vec![channel("CH1"), channel("CH2")],
            vec![ttl, text],
            vec![electrode("SE1"), electrode("SE2")],
        ))
    }

    fn open(root: &Path) -> BinaryRecording {
        let mut engine = BinaryRecording::new();
        engine.configure(layout());
        engine.update_timestamps(&[1000, 1000], None);
        engine.open_files(root, 1, 1).unwrap();
        engine
    }

    #[test]
    fn test_continuous_files() {
        let dir = tempdir().unwrap();
        let mut engine = open(dir.path());

        engine.write_data(0, 0, &[0.5, 1.0, 1.5]).unwrap();
        engine.write_data(1, 1, &[-0.5, -1.0, -1.5]).unwrap();
        engine.update_timestamps(&[1003, 1003], None);
        engine.write_continuous_data(0, 0, &[2.0], &[0.004]).unwrap();
        engine.write_continuous_data(1, 1, &[-2.0], &[0.004]).unwrap();
        engine.close_files().unwrap();

        let base = recording_dir(dir.path(), 1, 1).join("continuous/Emulator-100.example_data");
        let raw = fs::read(base.join("continuous.dat")).unwrap();
        let samples: Vec<i16> = raw
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        assert_eq!(samples, vec![1, -1, 2, -2, 3, -3, 4, -4]);

        let (header, ts) = read_npy::<i64>(base.join("timestamps.npy"), "<i8").unwrap();
        assert_eq!(header.shape, vec![4]);
        assert_eq!(ts, vec![1000, 1001, 1002, 1003]);

        let (_, sts) = read_npy::<f64>(base.join("synchronized_timestamps.npy"), "<f8").unwrap();
        assert_eq!(sts, vec![0.004]);
    }

    #[test]
    fn test_each_stream_starts_at_its_first_write() {
        let dir = tempdir().unwrap();
        let streams: Vec<StreamInfo> = ["a", "b"]
            .iter()
            .enumerate()
            .map(|(i, name)| StreamInfo {
                id: i as u16,
                name: (*name).into(),
                source_node_id: 100,
                source_node_name: "Emulator".into(),
                sample_rate: 1000.0,
            })
            .collect();
        let channels = (0..2)
            .map(|stream| ContinuousChannel {
                name: format!("CH{}", stream + 1),
                description: String::new(),
                stream,
                bit_volts: 1.0,
                units: "uV".into(),
            })
            .collect();
        let mut engine = BinaryRecording::new();
        engine.configure(Arc::new(RecordingLayout::record_all(streams, channels, vec![], vec![])));
        // Stream b has not delivered anything when the files open.
        engine.update_timestamps(&[1000, 0], None);
        engine.open_files(dir.path(), 1, 1).unwrap();

        engine.write_data(0, 0, &[1.0, 2.0]).unwrap();
        engine.update_timestamps(&[1002, 50_000], None);
        engine.write_data(0, 0, &[3.0]).unwrap();
        engine.write_data(1, 1, &[7.0, 8.0]).unwrap();
        engine.close_files().unwrap();

        let base = recording_dir(dir.path(), 1, 1).join("continuous");
        let a = fs::read(base.join("Emulator-100.a/continuous.dat")).unwrap();
        assert_eq!(a.len(), 3 * 2);
        let b = fs::read(base.join("Emulator-100.b/continuous.dat")).unwrap();
        let samples: Vec<i16> = b.chunks_exact(2).map(|c| i16::from_le_bytes([c[0], c[1]])).collect();
        assert_eq!(samples, vec![7, 8]);
        let (_, ts) = read_npy::<i64>(base.join("Emulator-100.b/timestamps.npy"), "<i8").unwrap();
        assert_eq!(ts, vec![50_000, 50_001]);
    }

    #[test]
    fn test_ttl_and_text_events() {
        let dir = tempdir().unwrap();
        let mut engine = open(dir.path());

        let on = EventMessage::new(EventPacket::ttl(2, true, 0b100), 1010, 0);
        let off = EventMessage::new(EventPacket::ttl(2, false, 0), 1020, 0);
        engine.write_event(0, &on).unwrap();
        engine.write_event(0, &off).unwrap();
        engine
            .write_event(1, &EventMessage::new(EventPacket::text("hello"), 1030, 1))
            .unwrap();
        engine.close_files().unwrap();

        let base = recording_dir(dir.path(), 1, 1).join("events/Emulator-100.example_data");
        let ttl = base.join("TTL_1");
        let (_, states) = read_npy::<i16>(ttl.join("channel_states.npy"), "<i2").unwrap();
        assert_eq!(states, vec![3, -3]);
        let (_, ts) = read_npy::<i64>(ttl.join("timestamps.npy"), "<i8").unwrap();
        assert_eq!(ts, vec![1010, 1020]);
        let (_, chans) = read_npy::<u16>(ttl.join("channels.npy"), "<u2").unwrap();
        assert_eq!(chans, vec![3, 3]);
        let (header, words) = read_npy::<u8>(ttl.join("full_words.npy"), "|u1").unwrap();
        assert_eq!(header.shape, vec![2]);
        assert_eq!(words, vec![4, 0]);

        let mut file = File::open(base.join("TEXT_group_2/text.npy")).unwrap();
        let header = crate::format::NpyHeader::read_from(&mut file).unwrap();
        assert_eq!(header.descr, "|S16");
        assert_eq!(header.shape, vec![1]);
    }

    #[test]
    fn test_ttl_words_disabled() {
        let dir = tempdir().unwrap();
        let mut engine = BinaryRecording::new();
        let mut param = EngineParameter::new_bool(0, PARAM_SAVE_TTL_WORDS, true);
        param.set_from_str("false").unwrap();
        engine.set_parameter(&param);
        engine.configure(layout());
        engine.update_timestamps(&[0, 0], None);
        engine.open_files(dir.path(), 1, 1).unwrap();
        engine.close_files().unwrap();

        let ttl = recording_dir(dir.path(), 1, 1).join("events/Emulator-100.example_data/TTL_1");
        assert!(ttl.join("channel_states.npy").exists());
        assert!(!ttl.join("full_words.npy").exists());
    }

    #[test]
    fn test_identical_electrodes_share_group() {
        let dir = tempdir().unwrap();
        let mut engine = open(dir.path());

        let spike = |sorted| {
            SpikeRecord::new(vec![0.5, 1.0, -1.0, 0.0], sorted).with_metadata(2.5f32.to_le_bytes().to_vec())
        };
        engine.write_spike(0, &EventMessage::new(spike(1), 1100, 0)).unwrap();
        engine.write_spike(1, &EventMessage::new(spike(2), 1200, 1)).unwrap();
        engine.close_files().unwrap();

        let group = recording_dir(dir.path(), 1, 1).join("spikes/Emulator-100.example_data/spike_group_1");
        assert!(!group.with_file_name("spike_group_2").exists());

        let (header, waveforms) = read_npy::<i16>(group.join("spike_waveforms.npy"), "<i2").unwrap();
        assert_eq!(header.shape, vec![2, 4]);
        assert_eq!(waveforms, vec![1, 2, -2, 0, 1, 2, -2, 0]);
        let (_, electrodes) = read_npy::<u16>(group.join("spike_electrode_indices.npy"), "<u2").unwrap();
        assert_eq!(electrodes, vec![1, 2]);
        let (_, clusters) = read_npy::<u16>(group.join("spike_clusters.npy"), "<u2").unwrap();
        assert_eq!(clusters, vec![1, 2]);
        assert!(group.join("metadata.npy").exists());
    }

    #[test]
    fn test_structure_and_sync_text() {
        let dir = tempdir().unwrap();
        let mut engine = open(dir.path());
        engine
            .write_timestamp_sync_text(0, 1000, 1000.0, "Start Time for Emulator (100) - example_data @ 1000 Hz: 1000")
            .unwrap();
        engine.close_files().unwrap();

        let base = recording_dir(dir.path(), 1, 1);
        let sync = fs::read_to_string(base.join("sync_messages.txt")).unwrap();
        assert!(sync.starts_with("Start Time for Emulator"));

        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(base.join("structure.oebin")).unwrap()).unwrap();
        assert_eq!(json["continuous"][0]["num_channels"], 2);
        assert_eq!(json["continuous"][0]["folder_name"], "Emulator-100.example_data/");
        assert_eq!(json["events"].as_array().unwrap().len(), 2);
        assert_eq!(json["spikes"][0]["channels"].as_array().unwrap().len(), 2);
    }
}
