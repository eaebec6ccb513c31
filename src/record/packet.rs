//! Payloads carried by the event and spike queues

use crate::queue::{EventMessage, EventQueue};

/// What an event carries
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    /// TTL transition on `line`; `word` holds the state of all lines after
    /// the transition (bit n = line n)
    Ttl { line: u8, state: bool, word: u64 },
    /// Free-form text message
    Text(String),
    /// Fixed-size binary blob
    Binary(Vec<u8>),
    /// System message announcing a stream's time origin
    Sync {
        stream_id: u16,
        sample_rate: f32,
        text: String,
    },
}

/// One event as queued by the acquisition side.
///
/// The queue's `extra` field holds the event channel index within the
/// recording layout; the queue's `timestamp` is the sample number.
#[derive(Debug, Clone, PartialEq)]
pub struct EventPacket {
    pub payload: EventPayload,
    /// Raw per-event metadata, laid out as the channel's metadata fields
    pub metadata: Vec<u8>,
}

impl EventPacket {
    pub fn ttl(line: u8, state: bool, word: u64) -> Self {
        Self {
            payload: EventPayload::Ttl { line, state, word },
            metadata: Vec::new(),
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self {
            payload: EventPayload::Text(text.into()),
            metadata: Vec::new(),
        }
    }

    pub fn sync(stream_id: u16, sample_rate: f32, text: impl Into<String>) -> Self {
        Self {
            payload: EventPayload::Sync {
                stream_id,
                sample_rate,
                text: text.into(),
            },
            metadata: Vec::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: Vec<u8>) -> Self {
        self.metadata = metadata;
        self
    }

    /// System messages go to the sync-text sink rather than an event channel
    pub fn is_system(&self) -> bool {
        matches!(self.payload, EventPayload::Sync { .. })
    }
}

/// One detected spike: waveforms for every electrode channel, channel-major
#[derive(Debug, Clone, PartialEq)]
pub struct SpikeRecord {
    pub waveform: Vec<f32>,
    pub sorted_id: u16,
    pub metadata: Vec<u8>,
}

impl SpikeRecord {
    pub fn new(waveform: Vec<f32>, sorted_id: u16) -> Self {
        Self {
            waveform,
            sorted_id,
            metadata: Vec::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: Vec<u8>) -> Self {
        self.metadata = metadata;
        self
    }
}

pub type EventMsgQueue = EventQueue<EventPacket>;
pub type SpikeMsgQueue = EventQueue<SpikeRecord>;
pub type EventMsg = EventMessage<EventPacket>;
pub type SpikeMsg = EventMessage<SpikeRecord>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_classification() {
        assert!(EventPacket::sync(1, 30000.0, "start").is_system());
        assert!(!EventPacket::ttl(0, true, 1).is_system());
        assert!(!EventPacket::text("hello").is_system());
    }
}
