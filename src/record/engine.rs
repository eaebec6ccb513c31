//! Record engine contract, engine parameters and the engine registry

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::layout::RecordingLayout;
use super::packet::{EventMsg, SpikeMsg};
use super::RecordError;

/// Sample number of the next sample to be written, per write channel
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelTimestamps {
    values: Vec<i64>,
}

impl ChannelTimestamps {
    /// Replace all values, or only `channel`'s when given
    pub fn update(&mut self, timestamps: &[i64], channel: Option<usize>) {
        match channel {
            None => {
                self.values.clear();
                self.values.extend_from_slice(timestamps);
            }
            Some(ch) => {
                if let (Some(slot), Some(&ts)) = (self.values.get_mut(ch), timestamps.get(ch)) {
                    *slot = ts;
                }
            }
        }
    }

    pub fn get(&self, channel: usize) -> i64 {
        self.values.get(channel).copied().unwrap_or(0)
    }

    pub fn as_slice(&self) -> &[i64] {
        &self.values
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }
}

/// One on-disk format.
///
/// All methods are called from the record thread only. Write methods
/// report failures but the caller keeps going; an engine whose file failed
/// to open simply skips writes to it.
pub trait RecordEngine: Send {
    /// Registry id, e.g. `RAWBINARY`
    fn engine_id(&self) -> &str;

    /// Apply one engine-specific parameter
    fn set_parameter(&mut self, _parameter: &EngineParameter) {}

    /// Hand the engine the channels it will record
    fn configure(&mut self, layout: Arc<RecordingLayout>);

    /// Drop any per-recording channel/file mapping
    fn reset_channels(&mut self) {}

    fn open_files(&mut self, root: &Path, experiment: u32, recording: u32) -> Result<(), RecordError>;

    fn close_files(&mut self) -> Result<(), RecordError>;

    /// Called before the continuous data of one record pass
    fn start_channel_block(&mut self, _last_block: bool) {}

    /// Called after the continuous data of one record pass
    fn end_channel_block(&mut self, _last_block: bool) {}

    /// Write samples of one write channel starting at
    /// `timestamps().get(write_channel)`
    fn write_data(&mut self, write_channel: usize, real_channel: usize, data: &[f32]) -> Result<(), RecordError>;

    /// Write samples together with their synchronized timestamps
    fn write_continuous_data(
        &mut self,
        write_channel: usize,
        real_channel: usize,
        data: &[f32],
        _synchronized: &[f64],
    ) -> Result<(), RecordError> {
        self.write_data(write_channel, real_channel, data)
    }

    /// Write one event of event channel `index`
    fn write_event(&mut self, index: usize, event: &EventMsg) -> Result<(), RecordError>;

    /// Write one spike of spike channel `index`
    fn write_spike(&mut self, index: usize, spike: &SpikeMsg) -> Result<(), RecordError>;

    /// Write a stream's sync/system message
    fn write_timestamp_sync_text(
        &mut self,
        stream_id: u16,
        sample_number: i64,
        sample_rate: f32,
        text: &str,
    ) -> Result<(), RecordError>;

    fn timestamps(&self) -> &ChannelTimestamps;

    fn timestamps_mut(&mut self) -> &mut ChannelTimestamps;

    fn update_timestamps(&mut self, timestamps: &[i64], channel: Option<usize>) {
        self.timestamps_mut().update(timestamps, channel);
    }
}

/// Value of an engine parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ParameterValue {
    Bool { value: bool },
    Int { value: i64, min: i64, max: i64 },
    Float { value: f64, min: f64, max: f64 },
    Str { value: String },
    Multi { options: Vec<String>, selected: usize },
}

/// An engine-specific tunable
#[derive(Debug, Clone, PartialEq)]
pub struct EngineParameter {
    pub id: usize,
    pub name: String,
    pub value: ParameterValue,
    default: ParameterValue,
}

impl EngineParameter {
    fn new(id: usize, name: &str, value: ParameterValue) -> Self {
        Self {
            id,
            name: name.to_string(),
            default: value.clone(),
            value,
        }
    }

    pub fn new_bool(id: usize, name: &str, default: bool) -> Self {
        Self::new(id, name, ParameterValue::Bool { value: default })
    }

    pub fn new_int(id: usize, name: &str, default: i64, min: i64, max: i64) -> Self {
        Self::new(id, name, ParameterValue::Int { value: default, min, max })
    }

    pub fn new_float(id: usize, name: &str, default: f64, min: f64, max: f64) -> Self {
        Self::new(id, name, ParameterValue::Float { value: default, min, max })
    }

    pub fn new_str(id: usize, name: &str, default: &str) -> Self {
        Self::new(
            id,
            name,
            ParameterValue::Str {
                value: default.to_string(),
            },
        )
    }

    pub fn new_multi(id: usize, name: &str, options: &[&str], default: usize) -> Self {
        Self::new(
            id,
            name,
            ParameterValue::Multi {
                options: options.iter().map(|s| s.to_string()).collect(),
                selected: default,
            },
        )
    }

    pub fn restore_default(&mut self) {
        self.value = self.default.clone();
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self.value {
            ParameterValue::Bool { value } => Some(value),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self.value {
            ParameterValue::Int { value, .. } => Some(value),
            ParameterValue::Multi { selected, .. } => Some(selected as i64),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self.value {
            ParameterValue::Float { value, .. } => Some(value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match &self.value {
            ParameterValue::Str { value } => Some(value),
            ParameterValue::Multi { options, selected } => options.get(*selected).map(String::as_str),
            _ => None,
        }
    }

    /// Parse and apply a textual value (from config or CLI).
    ///
    /// Numbers are clamped to the parameter range.
    pub fn set_from_str(&mut self, text: &str) -> Result<(), RecordError> {
        let invalid = || RecordError::InvalidParameter {
            name: self.name.clone(),
            value: text.to_string(),
        };
        let text = text.trim();
        match &mut self.value {
            ParameterValue::Bool { value } => {
                *value = match text.to_ascii_lowercase().as_str() {
                    "true" | "1" | "yes" | "on" => true,
                    "false" | "0" | "no" | "off" => false,
                    _ => return Err(invalid()),
                };
            }
            ParameterValue::Int { value, min, max } => {
                let v: i64 = text.parse().map_err(|_| invalid())?;
                *value = v.clamp(*min, *max);
            }
            ParameterValue::Float { value, min, max } => {
                let v: f64 = text.parse().map_err(|_| invalid())?;
                if !v.is_finite() {
                    return Err(invalid());
                }
                *value = v.clamp(*min, *max);
            }
            ParameterValue::Str { value } => *value = text.to_string(),
            ParameterValue::Multi { options, selected } => {
                *selected = options.iter().position(|o| o == text).ok_or_else(invalid)?;
            }
        }
        Ok(())
    }
}

pub type EngineFactory = fn() -> Box<dyn RecordEngine>;

/// Registry entry: a format id, its factory and its declared parameters
#[derive(Debug, Clone)]
pub struct EngineManager {
    pub id: String,
    pub name: String,
    factory: EngineFactory,
    parameters: Vec<EngineParameter>,
}

impl EngineManager {
    pub fn new(id: &str, name: &str, factory: EngineFactory) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            factory,
            parameters: Vec::new(),
        }
    }

    pub fn with_parameter(mut self, parameter: EngineParameter) -> Self {
        self.parameters.push(parameter);
        self
    }

    pub fn parameters(&self) -> &[EngineParameter] {
        &self.parameters
    }

    pub fn parameter_mut(&mut self, name: &str) -> Option<&mut EngineParameter> {
        self.parameters.iter_mut().find(|p| p.name == name)
    }

    /// Create an engine with every declared parameter applied
    pub fn instantiate(&self) -> Box<dyn RecordEngine> {
        let mut engine = (self.factory)();
        for parameter in &self.parameters {
            engine.set_parameter(parameter);
        }
        engine
    }
}

/// Map from format id to engine manager
#[derive(Debug, Clone, Default)]
pub struct EngineRegistry {
    managers: BTreeMap<String, EngineManager>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in engines
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(super::binary::BinaryRecording::manager());
        registry
    }

    pub fn register(&mut self, manager: EngineManager) {
        self.managers.insert(manager.id.clone(), manager);
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.managers.keys().map(String::as_str)
    }

    pub fn get(&self, id: &str) -> Option<&EngineManager> {
        self.managers.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut EngineManager> {
        self.managers.get_mut(id)
    }

    /// Set a parameter of engine `id` from text
    pub fn set_parameter(&mut self, id: &str, name: &str, value: &str) -> Result<(), RecordError> {
        let manager = self
            .managers
            .get_mut(id)
            .ok_or_else(|| RecordError::UnknownEngine(id.to_string()))?;
        let parameter = manager
            .parameter_mut(name)
            .ok_or_else(|| RecordError::UnknownParameter {
                engine: id.to_string(),
                name: name.to_string(),
            })?;
        parameter.set_from_str(value)
    }

    pub fn instantiate(&self, id: &str) -> Result<Box<dyn RecordEngine>, RecordError> {
        self.managers
            .get(id)
            .map(EngineManager::instantiate)
            .ok_or_else(|| RecordError::UnknownEngine(id.to_string()))
    }
}
