//! Emulated acquisition source
//!
//! Produces one `DataBlock` per stream per tick: sine + Gaussian noise on
//! every continuous channel, a shared sync pulse train on each stream's
//! sync line, and occasional spikes. Each stream runs on its own clock,
//! off by `clock_skew_ppm` from nominal, so the synchronizer has real
//! drift to estimate.

use std::f64::consts::TAU;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use thiserror::Error;
use tracing::debug;

use crate::config::{Config, StreamConfig};
use crate::record::node::{DataBlock, SpikeEvent, TtlEvent};
use crate::record::SpikeRecord;

/// Emulator errors
#[derive(Error, Debug)]
pub enum EmulatorError {
    #[error("Invalid emulator setting: {0}")]
    InvalidSetting(String),
}

/// Signal shape and timing
#[derive(Debug, Clone)]
pub struct EmulatorConfig {
    /// Wall-clock span of one block
    pub block_duration: Duration,
    /// Sync pulse period in seconds
    pub sync_period: f64,
    /// Sync pulse width in seconds
    pub sync_pulse_width: f64,
    /// Sine amplitude in microvolts
    pub amplitude_uv: f64,
    pub sine_hz: f64,
    /// Noise standard deviation in microvolts
    pub noise_uv: f64,
    /// Fixed seed for reproducible data
    pub seed: Option<u64>,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            block_duration: Duration::from_millis(10),
            sync_period: 1.0,
            sync_pulse_width: 0.01,
            amplitude_uv: 100.0,
            sine_hz: 8.0,
            noise_uv: 10.0,
            seed: None,
        }
    }
}

#[derive(Debug)]
struct StreamState {
    config: StreamConfig,
    /// True sample rate including the clock skew
    actual_rate: f64,
    spike_channel: Option<usize>,
    next_sample: i64,
    ttl_word: u64,
}

impl StreamState {
    /// Index of the first sample at or after true time `t`
    fn sample_at(&self, t: f64) -> i64 {
        (t * self.actual_rate + 1e-9).floor() as i64
    }
}

/// Multi-stream synthetic data generator
#[derive(Debug)]
pub struct Emulator {
    config: EmulatorConfig,
    streams: Vec<StreamState>,
    rng: StdRng,
    noise: Normal<f64>,
    /// Blocks emitted so far
    blocks: u64,
}

impl Emulator {
    pub fn new(config: &Config, emulator: EmulatorConfig) -> Result<Self, EmulatorError> {
        if emulator.block_duration.is_zero() {
            return Err(EmulatorError::InvalidSetting("block duration must be positive".into()));
        }
        if !(emulator.sync_pulse_width > 0.0 && emulator.sync_pulse_width < emulator.sync_period) {
            return Err(EmulatorError::InvalidSetting(
                "sync pulse width must be positive and shorter than the period".into(),
            ));
        }
        let noise = Normal::new(0.0, emulator.noise_uv)
            .map_err(|e| EmulatorError::InvalidSetting(format!("noise: {e}")))?;

        let mut spike_channels = 0;
        let streams = config
            .streams
            .iter()
            .map(|s| {
                let spike_channel = (s.spike_rate_hz > 0.0).then(|| {
                    spike_channels += 1;
                    spike_channels - 1
                });
                StreamState {
                    config: s.clone(),
                    actual_rate: s.sample_rate * (1.0 + s.clock_skew_ppm * 1e-6),
                    spike_channel,
                    next_sample: 0,
                    ttl_word: 0,
                }
            })
            .collect();

        let rng = match emulator.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self {
            config: emulator,
            streams,
            rng,
            noise,
            blocks: 0,
        })
    }

    /// Emulated time covered so far
    pub fn elapsed(&self) -> Duration {
        self.config.block_duration * self.blocks as u32
    }

    fn time_at(&self, block: u64) -> f64 {
        block as f64 * self.config.block_duration.as_secs_f64()
    }

    pub fn block_duration(&self) -> Duration {
        self.config.block_duration
    }

    /// Advance by one block duration and return every stream's block
    pub fn next_blocks(&mut self) -> Vec<DataBlock> {
        let start_time = self.time_at(self.blocks);
        let end_time = self.time_at(self.blocks + 1);
        let mut blocks = Vec::with_capacity(self.streams.len());
        for index in 0..self.streams.len() {
            blocks.push(self.stream_block(index, start_time, end_time));
        }
        self.blocks += 1;
        blocks
    }

    fn stream_block(&mut self, index: usize, start_time: f64, end_time: f64) -> DataBlock {
        let cfg = &self.config;
        let stream = &mut self.streams[index];
        let first = stream.next_sample;
        let end = stream.sample_at(end_time);
        let n = (end - first).max(0) as usize;

        let samples = (0..stream.config.channels)
            .map(|ch| {
                let phase = ch as f64 * TAU / stream.config.channels.max(1) as f64;
                (0..n)
                    .map(|i| {
                        let t = (first + i as i64) as f64 / stream.config.sample_rate;
                        let v = cfg.amplitude_uv * (TAU * cfg.sine_hz * t + phase).sin()
                            + self.noise.sample(&mut self.rng);
                        v as f32
                    })
                    .collect()
            })
            .collect();

        // Sync edges whose true time falls inside this block
        let mut ttl = Vec::new();
        let line = stream.config.sync_line;
        let first_pulse = (start_time / cfg.sync_period).floor() as i64;
        let last_pulse = (end_time / cfg.sync_period).ceil() as i64;
        for k in first_pulse.max(0)..=last_pulse {
            let rise_t = k as f64 * cfg.sync_period;
            for (t, state) in [(rise_t, true), (rise_t + cfg.sync_pulse_width, false)] {
                let sample = stream.sample_at(t);
                if sample >= first && sample < end {
                    if state {
                        stream.ttl_word |= 1 << line;
                    } else {
                        stream.ttl_word &= !(1 << line);
                    }
                    ttl.push(TtlEvent {
                        line,
                        state,
                        sample_number: sample,
                        word: stream.ttl_word,
                    });
                }
            }
        }
        ttl.sort_by_key(|e| e.sample_number);

        let mut spikes = Vec::new();
        if let Some(channel) = stream.spike_channel {
            let p = (stream.config.spike_rate_hz * cfg.block_duration.as_secs_f64()).min(1.0);
            if n > 0 && self.rng.gen_bool(p) {
                let sample_number = first + self.rng.gen_range(0..n) as i64;
                spikes.push(SpikeEvent {
                    channel,
                    sample_number,
                    record: SpikeRecord::new(spike_waveform(-4.0 * cfg.amplitude_uv), 0),
                });
            }
        }

        stream.next_sample = end.max(first);
        if !ttl.is_empty() {
            debug!(stream = stream.config.id, edges = ttl.len(), "Sync edges emitted");
        }
        DataBlock {
            stream_id: stream.config.id,
            first_sample_number: first,
            samples,
            ttl,
            spikes,
        }
    }
}

/// Biphasic spike: 8 samples before the trough, 32 after
fn spike_waveform(peak_uv: f64) -> Vec<f32> {
    (0..40)
        .map(|i| {
            let x = (i as f64 - 8.0) / 3.0;
            let trough = peak_uv * (-x * x).exp();
            let rebound = -0.3 * peak_uv * (-((x - 3.0) * (x - 3.0)) / 4.0).exp();
            (trough + rebound) as f32
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(skew_ppm: f64) -> Config {
        let mut a = StreamConfig::new(0, "main", 1000.0, 2);
        a.spike_rate_hz = 1000.0;
        let mut b = StreamConfig::new(1, "skewed", 2000.0, 1);
        b.clock_skew_ppm = skew_ppm;
        b.sync_line = 2;
        Config {
            streams: vec![a, b],
            ..Config::default()
        }
    }

    fn seeded() -> EmulatorConfig {
        EmulatorConfig {
            seed: Some(7),
            ..EmulatorConfig::default()
        }
    }

    #[test]
    fn blocks_are_contiguous() {
        let mut emu = Emulator::new(&config(0.0), seeded()).unwrap();
        let mut next = [0i64; 2];
        for _ in 0..50 {
            for (i, block) in emu.next_blocks().into_iter().enumerate() {
                assert_eq!(block.first_sample_number, next[i]);
                let n = block.samples[0].len() as i64;
                assert!(block.samples.iter().all(|c| c.len() as i64 == n));
                next[i] += n;
            }
        }
        assert_eq!(next, [500, 1000]);
        assert!((emu.elapsed().as_secs_f64() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn sync_pulses_follow_skewed_clock() {
        let mut emu = Emulator::new(&config(500.0), seeded()).unwrap();
        let mut edges: Vec<Vec<TtlEvent>> = vec![Vec::new(), Vec::new()];
        for _ in 0..150 {
            for (i, block) in emu.next_blocks().into_iter().enumerate() {
                edges[i].extend(block.ttl);
            }
        }
        let rising: Vec<i64> = edges[1].iter().filter(|e| e.state).map(|e| e.sample_number).collect();
        assert_eq!(rising, vec![0, 2001]);
        assert!(edges[1].iter().all(|e| e.line == 2));
        assert_eq!(edges[1][0].word, 0b100);
        assert_eq!(edges[1][1].word, 0);

        let main_rising: Vec<i64> = edges[0].iter().filter(|e| e.state).map(|e| e.sample_number).collect();
        assert_eq!(main_rising, vec![0, 1000]);
    }

    #[test]
    fn spikes_use_spike_channel_index() {
        let mut emu = Emulator::new(&config(0.0), seeded()).unwrap();
        let blocks = emu.next_blocks();
        assert_eq!(blocks[0].spikes.len(), 1);
        assert_eq!(blocks[0].spikes[0].channel, 0);
        assert_eq!(blocks[0].spikes[0].record.waveform.len(), 40);
        assert!(blocks[1].spikes.is_empty());
    }

    #[test]
    fn rejects_bad_pulse_width() {
        let bad = EmulatorConfig {
            sync_pulse_width: 2.0,
            ..EmulatorConfig::default()
        };
        assert!(Emulator::new(&config(0.0), bad).is_err());
    }
}
