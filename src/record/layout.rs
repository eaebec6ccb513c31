//! Recording layout: the streams and channels handed to the record engines
//!
//! Continuous channels are addressed two ways: the *real* channel index
//! into `continuous`, and the *write* channel index (position in
//! `recorded`), which is also the DataQueue channel index.

use serde::{Deserialize, Serialize};

use crate::format::{BaseType, NpyType};

/// One independently clocked data stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub id: u16,
    pub name: String,
    pub source_node_id: u16,
    pub source_node_name: String,
    pub sample_rate: f64,
}

impl StreamInfo {
    /// Folder name used for this stream's files
    pub fn folder_name(&self) -> String {
        format!("{}-{}.{}", self.source_node_name, self.source_node_id, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContinuousChannel {
    pub name: String,
    pub description: String,
    /// Index into `RecordingLayout::streams`
    pub stream: usize,
    /// Microvolts per least significant bit
    pub bit_volts: f32,
    pub units: String,
}

/// Name, type and length of one metadata field attached to each event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataField {
    pub name: String,
    pub description: String,
    pub base: MetadataType,
    pub length: usize,
}

impl MetadataField {
    pub fn npy_type(&self) -> NpyType {
        NpyType::named(self.name.clone(), self.base.into(), self.length)
    }

    /// Bytes one value of this field occupies
    pub fn byte_size(&self) -> usize {
        match self.base {
            MetadataType::Char => self.length + 1,
            other => other.element_size() * self.length,
        }
    }
}

/// Serializable mirror of `BaseType`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetadataType {
    Char,
    Int8,
    Uint8,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Int64,
    Uint64,
    Float,
    Double,
}

impl MetadataType {
    pub fn element_size(self) -> usize {
        match self {
            MetadataType::Char | MetadataType::Int8 | MetadataType::Uint8 => 1,
            MetadataType::Int16 | MetadataType::Uint16 => 2,
            MetadataType::Int32 | MetadataType::Uint32 | MetadataType::Float => 4,
            MetadataType::Int64 | MetadataType::Uint64 | MetadataType::Double => 8,
        }
    }

    /// Type name used in `structure.oebin`
    pub fn json_name(self) -> &'static str {
        match self {
            MetadataType::Char => "string",
            MetadataType::Int8 => "int8",
            MetadataType::Uint8 => "uint8",
            MetadataType::Int16 => "int16",
            MetadataType::Uint16 => "uint16",
            MetadataType::Int32 => "int32",
            MetadataType::Uint32 => "uint32",
            MetadataType::Int64 => "int64",
            MetadataType::Uint64 => "uint64",
            MetadataType::Float => "float",
            MetadataType::Double => "double",
        }
    }
}

impl From<MetadataType> for BaseType {
    fn from(t: MetadataType) -> Self {
        match t {
            MetadataType::Char => BaseType::Char,
            MetadataType::Int8 => BaseType::I8,
            MetadataType::Uint8 => BaseType::U8,
            MetadataType::Int16 => BaseType::I16,
            MetadataType::Uint16 => BaseType::U16,
            MetadataType::Int32 => BaseType::I32,
            MetadataType::Uint32 => BaseType::U32,
            MetadataType::Int64 => BaseType::I64,
            MetadataType::Uint64 => BaseType::U64,
            MetadataType::Float => BaseType::F32,
            MetadataType::Double => BaseType::F64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum EventChannelKind {
    /// TTL lines `0..num_lines`
    Ttl { num_lines: usize },
    /// Text up to `max_length` bytes
    Text { max_length: usize },
    /// Fixed-size binary arrays
    Binary { base: MetadataType, length: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventChannel {
    pub name: String,
    pub description: String,
    pub stream: usize,
    pub kind: EventChannelKind,
    #[serde(default)]
    pub metadata: Vec<MetadataField>,
}

impl EventChannel {
    /// Bytes of the payload as stored per event: the TTL word, the
    /// null-terminated text, or the binary array
    pub fn data_size(&self) -> usize {
        match &self.kind {
            EventChannelKind::Ttl { num_lines } => num_lines.div_ceil(8).max(1),
            EventChannelKind::Text { max_length } => max_length + 1,
            EventChannelKind::Binary { base, length } => base.element_size() * length,
        }
    }

    pub fn metadata_size(&self) -> usize {
        self.metadata.iter().map(MetadataField::byte_size).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpikeChannel {
    pub name: String,
    pub description: String,
    pub stream: usize,
    /// Electrode channels per spike (1 = single, 4 = tetrode, ...)
    pub num_channels: usize,
    pub pre_peak_samples: usize,
    pub post_peak_samples: usize,
    pub bit_volts: f32,
    #[serde(default)]
    pub metadata: Vec<MetadataField>,
}

impl SpikeChannel {
    /// Samples per electrode channel
    pub fn total_samples(&self) -> usize {
        self.pre_peak_samples + self.post_peak_samples
    }

    /// Two spike channels of the same stream with the same shape share a
    /// spike group on disk
    pub fn same_group(&self, other: &SpikeChannel) -> bool {
        self.stream == other.stream
            && self.num_channels == other.num_channels
            && self.pre_peak_samples == other.pre_peak_samples
            && self.post_peak_samples == other.post_peak_samples
            && self.bit_volts == other.bit_volts
            && self.metadata == other.metadata
    }
}

/// Everything an engine needs to lay out its files
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordingLayout {
    pub streams: Vec<StreamInfo>,
    pub continuous: Vec<ContinuousChannel>,
    /// Real channel index of each write channel
    pub recorded: Vec<usize>,
    pub events: Vec<EventChannel>,
    pub spikes: Vec<SpikeChannel>,
}

impl RecordingLayout {
    /// Layout recording every continuous channel
    pub fn record_all(
        streams: Vec<StreamInfo>,
        continuous: Vec<ContinuousChannel>,
        events: Vec<EventChannel>,
        spikes: Vec<SpikeChannel>,
    ) -> Self {
        let recorded = (0..continuous.len()).collect();
        Self {
            streams,
            continuous,
            recorded,
            events,
            spikes,
        }
    }

    pub fn num_recorded_channels(&self) -> usize {
        self.recorded.len()
    }

    pub fn real_channel(&self, write_channel: usize) -> usize {
        self.recorded[write_channel]
    }

    pub fn channel(&self, real_channel: usize) -> &ContinuousChannel {
        &self.continuous[real_channel]
    }

    /// Stream index of a write channel
    pub fn stream_of(&self, write_channel: usize) -> usize {
        self.continuous[self.recorded[write_channel]].stream
    }

    /// Stream index by stream id
    pub fn stream_index(&self, stream_id: u16) -> Option<usize> {
        self.streams.iter().position(|s| s.id == stream_id)
    }

    /// Check that every index points at an existing entry
    pub fn validate(&self) -> Result<(), String> {
        for (w, &real) in self.recorded.iter().enumerate() {
            if real >= self.continuous.len() {
                return Err(format!("write channel {w} maps to missing channel {real}"));
            }
        }
        let streams = self.streams.len();
        let bad_stream = self
            .continuous
            .iter()
            .map(|c| (c.name.as_str(), c.stream))
            .chain(self.events.iter().map(|c| (c.name.as_str(), c.stream)))
            .chain(self.spikes.iter().map(|c| (c.name.as_str(), c.stream)))
            .find(|(_, s)| *s >= streams);
        if let Some((name, stream)) = bad_stream {
            return Err(format!("channel '{name}' refers to missing stream {stream}"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(id: u16) -> StreamInfo {
        StreamInfo {
            id,
            name: format!("stream{id}"),
            source_node_id: 100,
            source_node_name: "Emulator".into(),
            sample_rate: 30000.0,
        }
    }

    fn channel(name: &str, stream: usize) -> ContinuousChannel {
        ContinuousChannel {
            name: name.into(),
            description: String::new(),
            stream,
            bit_volts: 0.195,
            units: "uV".into(),
        }
    }

    #[test]
    fn test_channel_mapping() {
        let layout = RecordingLayout {
            streams: vec![stream(0), stream(1)],
            continuous: vec![channel("CH1", 0), channel("CH2", 0), channel("CH3", 1)],
            recorded: vec![0, 2],
            events: vec![],
            spikes: vec![],
        };
        assert_eq!(layout.num_recorded_channels(), 2);
        assert_eq!(layout.real_channel(1), 2);
        assert_eq!(layout.stream_of(1), 1);
        assert_eq!(layout.stream_index(1), Some(1));
        assert!(layout.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_missing_stream() {
        let layout = RecordingLayout::record_all(vec![stream(0)], vec![channel("CH1", 3)], vec![], vec![]);
        assert!(layout.validate().unwrap_err().contains("CH1"));
    }

    #[test]
    fn test_event_data_sizes() {
        let ttl = EventChannel {
            name: "TTL".into(),
            description: String::new(),
            stream: 0,
            kind: EventChannelKind::Ttl { num_lines: 16 },
            metadata: vec![],
        };
        assert_eq!(ttl.data_size(), 2);

        let text = EventChannel {
            kind: EventChannelKind::Text { max_length: 32 },
            ..ttl.clone()
        };
        assert_eq!(text.data_size(), 33);

        let binary = EventChannel {
            kind: EventChannelKind::Binary {
                base: MetadataType::Float,
                length: 3,
            },
            metadata: vec![MetadataField {
                name: "gain".into(),
                description: String::new(),
                base: MetadataType::Double,
                length: 2,
            }],
            ..ttl
        };
        assert_eq!(binary.data_size(), 12);
        assert_eq!(binary.metadata_size(), 16);
    }
}
