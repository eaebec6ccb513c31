//! Recorder binary - records emulated acquisition to disk
//!
//! Usage:
//!   cargo run --bin recorder                              # Defaults, 5 s
//!   cargo run --bin recorder -- --config rig.toml -d 30   # Config file
//!   cargo run --bin recorder -- -o ./data -n 3 --fast     # Three recordings

use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use ephys_recorder::common::cli::RecorderArgs;
use ephys_recorder::common::init_tracing;
use ephys_recorder::common::metrics::format_bytes;
use ephys_recorder::common::PipelineResult;
use ephys_recorder::config::Config;
use ephys_recorder::emulator::{Emulator, EmulatorConfig};
use ephys_recorder::record::{RecordNode, RecordNodeSettings};
use tracing::{info, warn};

/// Interval between queue rate reports
const REPORT_INTERVAL: Duration = Duration::from_secs(1);

fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = RecorderArgs::parse();

    let mut config = match &args.common.config_file {
        Some(path) => Config::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(dir) = args.output_dir {
        config.recording.root = dir;
    }
    if let Some(engine) = args.engine {
        config.recording.engine = engine;
    }
    config.validate()?;

    let layout = config.layout();
    let settings = RecordNodeSettings::from_config(&config);
    let mut node = RecordNode::new(settings, layout)?;
    let mut emulator = Emulator::new(
        &config,
        EmulatorConfig {
            seed: args.seed,
            ..EmulatorConfig::default()
        },
    )?;

    info!(
        streams = config.streams.len(),
        engine = %config.recording.engine,
        root = %config.recording.root.display(),
        "Starting acquisition"
    );
    node.start_acquisition()?;

    let result = record_all(&mut node, &mut emulator, args.duration, args.recordings, args.fast);
    node.stop_acquisition()?;
    result?;

    info!(
        experiment = node.experiment_number(),
        recordings = node.recording_number(),
        "Done"
    );
    Ok(())
}

fn record_all(
    node: &mut RecordNode,
    emulator: &mut Emulator,
    duration: f64,
    recordings: u32,
    fast: bool,
) -> PipelineResult<()> {
    let span = Duration::from_secs_f64(duration.max(0.0));
    for _ in 0..recordings {
        node.start_recording()?;
        let dir = node.recording_dir();
        let started = Instant::now();
        let mut last_report = (started, node.data_counters().unwrap_or_default());
        let base = emulator.elapsed();
        let target = base + span;
        while emulator.elapsed() < target {
            for block in emulator.next_blocks() {
                node.process_block(&block)?;
            }
            if last_report.0.elapsed() >= REPORT_INTERVAL {
                if let Some(now) = node.data_counters() {
                    let rate = now.rate_from(&last_report.1, last_report.0.elapsed().as_secs_f64());
                    info!(
                        drain = %rate.format_read_rate(),
                        pending = now.pending(),
                        dropped = now.dropped,
                        "Data queue"
                    );
                    if rate.dropped_rate > 0.0 {
                        warn!(dropped_per_sec = rate.dropped_rate, "Record thread is falling behind");
                    }
                    last_report = (Instant::now(), now);
                }
            }
            if !fast {
                let due = started + (emulator.elapsed() - base);
                if let Some(wait) = due.checked_duration_since(Instant::now()) {
                    thread::sleep(wait);
                }
            }
        }
        let stats = node.stop_recording()?;
        let size = dir.as_deref().map_or(0, dir_size);
        info!(
            size = %format_bytes(size),
            dir = ?dir,
            passes = stats.passes,
            samples = stats.samples_written,
            events = stats.events_written,
            spikes = stats.spikes_written,
            sync_messages = stats.sync_messages,
            errors = stats.write_errors,
            "Recording finished"
        );
    }
    Ok(())
}

/// Total size of the files below `dir`
fn dir_size(dir: &std::path::Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    entries
        .flatten()
        .map(|e| match e.metadata() {
            Ok(m) if m.is_dir() => dir_size(&e.path()),
            Ok(m) => m.len(),
            Err(_) => 0,
        })
        .sum()
}
