//! Synchronization end to end: the emulator runs two streams whose clocks
//! disagree by 500 ppm; the record node feeds their sync pulses to the
//! synchronizer and records synchronized timestamps.
//!
//! Sync windows are closed by hand after each pulse so the test does not
//! depend on wall-clock timing.

use ephys_recorder::config::{Config, StreamConfig, SyncConfig};
use ephys_recorder::emulator::{Emulator, EmulatorConfig};
use ephys_recorder::format::read_npy;
use ephys_recorder::record::{RecordNode, RecordNodeSettings};
use ephys_recorder::sync::SyncStatus;
use tempfile::TempDir;

fn config(root: &std::path::Path) -> Config {
    let main = StreamConfig::new(0, "main", 1000.0, 2);
    let mut skewed = StreamConfig::new(1, "skewed", 2000.0, 1);
    skewed.clock_skew_ppm = 500.0;
    skewed.sync_line = 3;
    let mut config = Config {
        streams: vec![main, skewed],
        sync: SyncConfig {
            window_ms: 60_000,
            ..SyncConfig::default()
        },
        ..Config::default()
    };
    config.recording.root = root.to_path_buf();
    config.recording.poll_interval_ms = 1;
    config
}

#[test]
fn test_skewed_stream_is_synchronized_and_recorded() {
    let tmp = TempDir::new().unwrap();
    let config = config(tmp.path());
    let mut emulator = Emulator::new(
        &config,
        EmulatorConfig {
            seed: Some(3),
            ..EmulatorConfig::default()
        },
    )
    .unwrap();
    let mut node = RecordNode::new(RecordNodeSettings::from_config(&config), config.layout()).unwrap();
    node.start_acquisition().unwrap();
    node.start_recording().unwrap();
    let sync = node.synchronizer().clone();

    assert_eq!(sync.main_stream(), Some(0));
    assert_eq!(sync.status(1), SyncStatus::Syncing);

    // 2.5 s: pulses at 0, 1 and 2 s
    for _ in 0..250 {
        let blocks = emulator.next_blocks();
        let pulse = blocks.iter().any(|b| b.ttl.iter().any(|e| e.state));
        for block in &blocks {
            node.process_block(block).unwrap();
        }
        if pulse {
            sync.close_sync_window();
        }
    }

    assert_eq!(sync.status(0), SyncStatus::Synced);
    assert_eq!(sync.status(1), SyncStatus::Synced);
    let rate = sync.actual_sample_rate(1).unwrap().unwrap();
    assert!((rate - 2001.0).abs() < 1e-9, "rate {rate}");
    assert!((sync.accuracy(1).unwrap() - 1.0).abs() < 1e-6);
    assert_eq!(sync.accuracy(0).unwrap(), 0.0);
    assert!((sync.convert_sample_number_to_timestamp(1, 4002).unwrap() - 2.0).abs() < 1e-12);
    assert_eq!(sync.convert_timestamp_to_sample_number(1, 2.0).unwrap(), 4002);
    assert_eq!(sync.start_time(1).unwrap(), 0.0);

    let pulses = sync.pulses(1).unwrap();
    assert_eq!(pulses.len(), 3);
    assert_eq!(pulses[0].local_sample_number, 4002);
    // The first pulse only sets the origin
    assert!(pulses[2].global_timestamp.is_none());
    assert!((pulses[0].global_timestamp.unwrap() - 2.0).abs() < 1e-12);
    assert_eq!(pulses[0].matching_pulse_index, Some(0));

    node.stop_recording().unwrap();
    node.stop_acquisition().unwrap();
    assert_eq!(sync.status(1), SyncStatus::Off);

    let dir = node
        .recording_dir()
        .unwrap()
        .join("continuous/Emulator-100.skewed");
    let (header, sts) = read_npy::<f64>(dir.join("synchronized_timestamps.npy"), "<f8").unwrap();
    assert_eq!(header.record_count(), 5002);
    // The block carrying the 1 s pulse is written before its window closes
    assert_eq!(sts[0], -1.0);
    assert_eq!(sts[2020], -1.0);
    assert!((sts[2021] - 2021.0 / 2001.0).abs() < 1e-9);
    assert!((sts[5001] - 5001.0 / 2001.0).abs() < 1e-9);

    let (_, main_sts) = read_npy::<f64>(
        node.recording_dir()
            .unwrap()
            .join("continuous/Emulator-100.main/synchronized_timestamps.npy"),
        "<f8",
    )
    .unwrap();
    assert_eq!(main_sts.len(), 2500);
    assert!((main_sts[2499] - 2.499).abs() < 1e-9);
}

#[test]
fn test_stream_without_pulses_stays_unsynchronized() {
    let tmp = TempDir::new().unwrap();
    let config = config(tmp.path());
    let mut node = RecordNode::new(RecordNodeSettings::from_config(&config), config.layout()).unwrap();
    node.start_acquisition().unwrap();
    let sync = node.synchronizer().clone();
    assert_eq!(sync.sync_line(1).unwrap(), 3);

    // Only the main stream's pulses arrive
    sync.add_event(0, 0, 0, true);
    sync.close_sync_window();
    sync.add_event(0, 0, 1000, true);
    sync.close_sync_window();

    assert_eq!(sync.status(0), SyncStatus::Synced);
    assert_eq!(sync.status(1), SyncStatus::Syncing);
    assert!(sync.convert_sample_number_to_timestamp(1, 10).is_err());
    node.stop_acquisition().unwrap();
}
