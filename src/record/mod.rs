//! Recording: engines, the record thread and the node that drives them
//!
//! Architecture:
//! ```text
//! acquisition thread                      record thread
//! ──────────────────                      ─────────────
//! RecordNode::process_block
//!   ├─ DataWriter  ──── DataQueue ──────▶ DataReader  ─┐
//!   ├─ EventSender ──── EventQueue ─────▶ EventReceiver├─▶ RecordEngine(s) ─▶ disk
//!   └─ SpikeSender ──── SpikeQueue ─────▶ SpikeReceiver┘
//! ```

pub mod binary;
pub mod engine;
pub mod layout;
pub mod node;
pub mod packet;
pub mod thread;

pub use binary::BinaryRecording;
pub use engine::{
    ChannelTimestamps, EngineFactory, EngineManager, EngineParameter, EngineRegistry, ParameterValue,
    RecordEngine,
};
pub use layout::{
    ContinuousChannel, EventChannel, EventChannelKind, MetadataField, MetadataType, RecordingLayout,
    SpikeChannel, StreamInfo,
};
pub use node::{DataBlock, RecordNode, RecordNodeSettings, SpikeEvent, TtlEvent};
pub use packet::{EventMsg, EventMsgQueue, EventPacket, EventPayload, SpikeMsg, SpikeMsgQueue, SpikeRecord};
pub use thread::{RecordQueues, RecordThread, RecordThreadConfig, RecordThreadState, RecordThreadStats, SharedEngines};

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::format::FormatError;
use crate::queue::QueueError;
use crate::sync::SyncError;

/// Record engine / record thread errors
#[derive(Error, Debug)]
pub enum RecordError {
    #[error("Format error: {0}")]
    Format(#[from] FormatError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Unknown record engine '{0}'")]
    UnknownEngine(String),

    #[error("Engine '{engine}' has no parameter '{name}'")]
    UnknownParameter { engine: String, name: String },

    #[error("Invalid value '{value}' for parameter '{name}'")]
    InvalidParameter { name: String, value: String },

    #[error("Invalid recording layout: {0}")]
    InvalidLayout(String),

    #[error("{kind} channel {index} out of range")]
    ChannelOutOfRange { kind: &'static str, index: usize },

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

/// `<root>/experiment<N>/recording<M>`
pub fn recording_dir(root: &Path, experiment: u32, recording: u32) -> PathBuf {
    root.join(format!("experiment{experiment}"))
        .join(format!("recording{recording}"))
}

/// Convert scaled samples back to raw ADC counts
pub(crate) fn scale_to_i16(data: &[f32], bit_volts: f32, out: &mut Vec<i16>) {
    out.clear();
    let factor = if bit_volts > 0.0 { 1.0 / bit_volts } else { 1.0 };
    out.extend(data.iter().map(|&v| {
        let scaled = (v * factor).round();
        scaled.clamp(i16::MIN as f32, i16::MAX as f32) as i16
    }));
}
