//! Configuration module for the recorder
//!
//! Loaded from TOML. Every field has a default, so an empty file is a
//! valid configuration recording one emulated stream.
//!
//! # Example
//! ```ignore
//! let config = Config::load("recorder.toml")?;
//! let layout = config.layout();
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::record::{ContinuousChannel, EventChannel, EventChannelKind, RecordingLayout, SpikeChannel, StreamInfo};

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

impl ConfigError {
    fn invalid(field: &str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub recording: RecordingConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default = "default_streams")]
    pub streams: Vec<StreamConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            recording: RecordingConfig::default(),
            sync: SyncConfig::default(),
            streams: default_streams(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Load configuration from a TOML string (useful for testing)
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let rec = &self.recording;
        if rec.block_size == 0 {
            return Err(ConfigError::invalid("recording.block_size", "must be positive"));
        }
        if rec.num_blocks == 0 {
            return Err(ConfigError::invalid("recording.num_blocks", "must be positive"));
        }
        if rec.event_capacity == 0 || rec.spike_capacity == 0 {
            return Err(ConfigError::invalid("recording", "queue capacities must be positive"));
        }
        if !(self.sync.sample_rate_tolerance > 0.0) {
            return Err(ConfigError::invalid("sync.sample_rate_tolerance", "must be positive"));
        }
        if self.streams.is_empty() {
            return Err(ConfigError::invalid("streams", "at least one stream is required"));
        }

        let mut ids = HashSet::new();
        for s in &self.streams {
            if !ids.insert(s.id) {
                return Err(ConfigError::invalid("streams.id", format!("duplicate stream id {}", s.id)));
            }
            if !(s.sample_rate > 0.0) {
                return Err(ConfigError::invalid("streams.sample_rate", format!("stream {} rate must be positive", s.id)));
            }
            if s.ttl_lines == 0 || s.sync_line >= s.ttl_lines {
                return Err(ConfigError::invalid(
                    "streams.sync_line",
                    format!("stream {} sync line {} outside {} TTL lines", s.id, s.sync_line, s.ttl_lines),
                ));
            }
        }
        if let Some(main) = self.sync.main_stream {
            if !ids.contains(&main) {
                return Err(ConfigError::invalid("sync.main_stream", format!("unknown stream {main}")));
            }
        }
        Ok(())
    }

    /// Recording layout of every configured stream: all continuous
    /// channels, one TTL channel per stream and one single-electrode spike
    /// channel per stream that emits spikes
    pub fn layout(&self) -> RecordingLayout {
        let mut streams = Vec::with_capacity(self.streams.len());
        let mut continuous = Vec::new();
        let mut events = Vec::new();
        let mut spikes = Vec::new();

        for (index, s) in self.streams.iter().enumerate() {
            streams.push(StreamInfo {
                id: s.id,
                name: s.name.clone(),
                source_node_id: self.recording.source_node_id,
                source_node_name: self.recording.source_node_name.clone(),
                sample_rate: s.sample_rate,
            });
            continuous.extend((0..s.channels).map(|ch| ContinuousChannel {
                name: format!("CH{}", ch + 1),
                description: format!("{} continuous channel {}", s.name, ch + 1),
                stream: index,
                bit_volts: s.bit_volts,
                units: "uV".to_string(),
            }));
            events.push(EventChannel {
                name: format!("{} TTL", s.name),
                description: format!("TTL lines of {}", s.name),
                stream: index,
                kind: EventChannelKind::Ttl {
                    num_lines: s.ttl_lines as usize,
                },
                metadata: Vec::new(),
            });
            if s.spike_rate_hz > 0.0 {
                spikes.push(SpikeChannel {
                    name: format!("{} electrode", s.name),
                    description: format!("Single electrode on {}", s.name),
                    stream: index,
                    num_channels: 1,
                    pre_peak_samples: 8,
                    post_peak_samples: 32,
                    bit_volts: s.bit_volts,
                    metadata: Vec::new(),
                });
            }
        }
        RecordingLayout::record_all(streams, continuous, events, spikes)
    }
}

// =============================================================================
// Recording
// =============================================================================

/// Where and how to record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingConfig {
    /// Root folder; recordings go to `<root>/experiment<N>/recording<M>`
    #[serde(default = "default_root")]
    pub root: PathBuf,

    /// Record engine id
    #[serde(default = "default_engine")]
    pub engine: String,

    /// Samples per DataQueue block
    #[serde(default = "default_block_size")]
    pub block_size: usize,

    /// DataQueue blocks per channel
    #[serde(default = "default_num_blocks")]
    pub num_blocks: usize,

    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    #[serde(default = "default_spike_capacity")]
    pub spike_capacity: usize,

    /// Record thread wait between empty passes
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_source_node_id")]
    pub source_node_id: u16,

    #[serde(default = "default_source_node_name")]
    pub source_node_name: String,

    /// Engine parameters by name, as text
    #[serde(default)]
    pub engine_parameters: BTreeMap<String, String>,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            engine: default_engine(),
            block_size: default_block_size(),
            num_blocks: default_num_blocks(),
            event_capacity: default_event_capacity(),
            spike_capacity: default_spike_capacity(),
            poll_interval_ms: default_poll_interval_ms(),
            source_node_id: default_source_node_id(),
            source_node_name: default_source_node_name(),
            engine_parameters: BTreeMap::new(),
        }
    }
}

impl RecordingConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn default_root() -> PathBuf {
    PathBuf::from("./data")
}

fn default_engine() -> String {
    crate::record::binary::ENGINE_ID.to_string()
}

fn default_block_size() -> usize {
    1024
}

fn default_num_blocks() -> usize {
    300
}

fn default_event_capacity() -> usize {
    200_000
}

fn default_spike_capacity() -> usize {
    200_000
}

fn default_poll_interval_ms() -> u64 {
    10
}

fn default_source_node_id() -> u16 {
    100
}

fn default_source_node_name() -> String {
    "Emulator".to_string()
}

// =============================================================================
// Synchronization
// =============================================================================

/// Synchronizer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Sync window length after the first pulse of a window
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    /// Relative sample-rate change accepted without a clock reset
    #[serde(default = "default_sample_rate_tolerance")]
    pub sample_rate_tolerance: f64,

    /// Main stream id; the first registered stream if unset
    #[serde(default)]
    pub main_stream: Option<u16>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            window_ms: default_window_ms(),
            sample_rate_tolerance: default_sample_rate_tolerance(),
            main_stream: None,
        }
    }
}

impl SyncConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

fn default_window_ms() -> u64 {
    50
}

fn default_sample_rate_tolerance() -> f64 {
    0.01
}

// =============================================================================
// Streams
// =============================================================================

/// One data stream (emulated hardware sub-device)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    pub id: u16,

    #[serde(default = "default_stream_name")]
    pub name: String,

    /// Nominal sample rate in Hz
    #[serde(default = "default_sample_rate")]
    pub sample_rate: f64,

    #[serde(default = "default_channels")]
    pub channels: usize,

    /// Microvolts per ADC count
    #[serde(default = "default_bit_volts")]
    pub bit_volts: f32,

    #[serde(default = "default_ttl_lines")]
    pub ttl_lines: u8,

    /// TTL line carrying the sync pulses
    #[serde(default)]
    pub sync_line: u8,

    /// Emulator clock error in parts per million
    #[serde(default)]
    pub clock_skew_ppm: f64,

    /// Emulator spike rate; 0 disables spikes
    #[serde(default)]
    pub spike_rate_hz: f64,
}

impl StreamConfig {
    pub fn new(id: u16, name: &str, sample_rate: f64, channels: usize) -> Self {
        Self {
            id,
            name: name.to_string(),
            sample_rate,
            channels,
            bit_volts: default_bit_volts(),
            ttl_lines: default_ttl_lines(),
            sync_line: 0,
            clock_skew_ppm: 0.0,
            spike_rate_hz: 0.0,
        }
    }
}

fn default_streams() -> Vec<StreamConfig> {
    vec![StreamConfig::new(0, &default_stream_name(), default_sample_rate(), default_channels())]
}

fn default_stream_name() -> String {
    "example_data".to_string()
}

fn default_sample_rate() -> f64 {
    30_000.0
}

fn default_channels() -> usize {
    8
}

fn default_bit_volts() -> f32 {
    0.195
}

fn default_ttl_lines() -> u8 {
    8
}

// =============================================================================
// Tests
// =============================================================================
