//! End-to-end tests: RecordNode → queues → record thread → binary files
//!
//! Data is pushed in phases that exceed the ring capacity in total, with a
//! wait for the record thread to drain between phases, so every channel
//! buffer wraps at least once.

use std::fs;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use ephys_recorder::config::{Config, StreamConfig};
use ephys_recorder::emulator::{Emulator, EmulatorConfig};
use ephys_recorder::format::{read_npy, NpyHeader};
use ephys_recorder::record::{DataBlock, RecordNode, RecordNodeSettings, TtlEvent};
use tempfile::TempDir;

fn config(root: &Path, block_size: usize, num_blocks: usize) -> Config {
    let mut config = Config {
        streams: vec![StreamConfig::new(7, "probe", 30000.0, 2)],
        ..Config::default()
    };
    config.recording.root = root.to_path_buf();
    config.recording.block_size = block_size;
    config.recording.num_blocks = num_blocks;
    config.recording.poll_interval_ms = 1;
    config
}

fn node(config: &Config) -> RecordNode {
    RecordNode::new(RecordNodeSettings::from_config(config), config.layout()).unwrap()
}

/// Wait until the record thread has drained everything written so far
fn wait_drained(node: &RecordNode) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while node.data_counters().unwrap().pending() > 0 {
        assert!(Instant::now() < deadline, "record thread did not drain");
        thread::sleep(Duration::from_millis(2));
    }
}

fn ramp_block(first: i64, n: usize) -> DataBlock {
    stream_block(7, first, n)
}

fn stream_block(stream_id: u16, first: i64, n: usize) -> DataBlock {
    DataBlock {
        stream_id,
        first_sample_number: first,
        samples: vec![
            (0..n).map(|i| ((first + i as i64) % 1000) as f32).collect(),
            (0..n).map(|i| -(((first + i as i64) % 1000) as f32)).collect(),
        ],
        ..DataBlock::default()
    }
}

/// Stored value of a microvolt sample at 0.195 uV per bit
fn scaled(v: f32) -> i16 {
    (v * (1.0 / 0.195f32)).round() as i16
}

fn read_i16(path: &Path) -> Vec<i16> {
    fs::read(path)
        .unwrap()
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect()
}

#[test]
fn test_small_recording_is_complete() {
    let tmp = TempDir::new().unwrap();
    let mut config = config(tmp.path(), 1024, 4);
    config.recording.poll_interval_ms = 10;
    let mut node = node(&config);
    node.start_acquisition().unwrap();
    node.start_recording().unwrap();

    for i in 0..30 {
        node.process_block(&ramp_block(i * 100, 100)).unwrap();
        thread::sleep(Duration::from_millis(1));
    }
    let stats = node.stop_recording().unwrap();
    node.stop_acquisition().unwrap();

    assert_eq!(stats.samples_written, 6000);
    assert_eq!(stats.write_errors, 0);

    let dir = node.recording_dir().unwrap().join("continuous/Emulator-100.probe");
    let (header, ts) = read_npy::<i64>(dir.join("timestamps.npy"), "<i8").unwrap();
    assert_eq!(header.record_count(), 3000);
    assert_eq!(ts.first(), Some(&0));
    assert_eq!(ts.last(), Some(&2999));

    let values = read_i16(&dir.join("continuous.dat"));
    assert_eq!(values.len(), 6000);
    assert_eq!(values[2 * 10], scaled(10.0));
    assert_eq!(values[2 * 10 + 1], scaled(-10.0));
}

#[test]
fn test_ring_wraps_across_phases() {
    let tmp = TempDir::new().unwrap();
    // 4096 samples per channel ring
    let config = config(tmp.path(), 1024, 4);
    let mut node = node(&config);
    node.start_acquisition().unwrap();
    node.start_recording().unwrap();

    let mut next = 0i64;
    for _phase in 0..5 {
        for _ in 0..3 {
            node.process_block(&ramp_block(next, 1000)).unwrap();
            next += 1000;
        }
        wait_drained(&node);
    }
    assert_eq!(node.data_counters().unwrap().dropped, 0);
    let stats = node.stop_recording().unwrap();
    node.stop_acquisition().unwrap();

    assert_eq!(stats.samples_written, 2 * 15_000);
    let dir = node.recording_dir().unwrap().join("continuous/Emulator-100.probe");
    let (_, ts) = read_npy::<i64>(dir.join("timestamps.npy"), "<i8").unwrap();
    assert_eq!(ts, (0..15_000).collect::<Vec<i64>>());
    let values = read_i16(&dir.join("continuous.dat"));
    assert_eq!(values.len(), 30_000);
    for s in [0usize, 4095, 4096, 9999, 14_999] {
        let expected = scaled((s % 1000) as f32);
        assert_eq!(values[2 * s], expected, "sample {s}");
        assert_eq!(values[2 * s + 1], -expected, "sample {s}");
    }
}

#[test]
fn test_ttl_events_and_structure_written() {
    let tmp = TempDir::new().unwrap();
    let config = config(tmp.path(), 256, 8);
    let mut node = node(&config);
    node.start_acquisition().unwrap();
    node.start_recording().unwrap();

    let mut block = ramp_block(0, 200);
    block.ttl = vec![
        TtlEvent {
            line: 1,
            state: true,
            sample_number: 20,
            word: 0b10,
        },
        TtlEvent {
            line: 1,
            state: false,
            sample_number: 120,
            word: 0,
        },
    ];
    node.process_block(&block).unwrap();
    let stats = node.stop_recording().unwrap();
    node.stop_acquisition().unwrap();
    assert_eq!(stats.events_written, 2);
    assert_eq!(stats.sync_messages, 1);

    let rec = node.recording_dir().unwrap();
    let ttl = rec.join("events/Emulator-100.probe/TTL_1");
    let (_, states) = read_npy::<i16>(ttl.join("channel_states.npy"), "<i2").unwrap();
    assert_eq!(states, vec![2, -2]);
    let (_, ts) = read_npy::<i64>(ttl.join("timestamps.npy"), "<i8").unwrap();
    assert_eq!(ts, vec![20, 120]);

    let oebin: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(rec.join("structure.oebin")).unwrap()).unwrap();
    assert_eq!(oebin["continuous"][0]["num_channels"], 2);
    assert_eq!(oebin["continuous"][0]["folder_name"], "Emulator-100.probe/");
}

#[test]
fn test_emulated_session_with_two_recordings() {
    let tmp = TempDir::new().unwrap();
    let mut config = config(tmp.path(), 1024, 16);
    config.streams[0].spike_rate_hz = 20.0;
    let mut emulator = Emulator::new(
        &config,
        EmulatorConfig {
            seed: Some(11),
            ..EmulatorConfig::default()
        },
    )
    .unwrap();
    let mut node = node(&config);
    node.start_acquisition().unwrap();

    let mut totals = Vec::new();
    for _ in 0..2 {
        node.start_recording().unwrap();
        for _ in 0..20 {
            for block in emulator.next_blocks() {
                node.process_block(&block).unwrap();
            }
        }
        totals.push(node.stop_recording().unwrap());
    }
    node.stop_acquisition().unwrap();

    // 20 blocks of 10 ms at 30 kHz, two channels
    assert!(totals.iter().all(|s| s.samples_written == 2 * 6000));

    let exp = tmp.path().join("experiment1");
    for (n, first) in [(1, 0i64), (2, 6000)] {
        let path = exp.join(format!("recording{n}/continuous/Emulator-100.probe/timestamps.npy"));
        let mut file = fs::File::open(&path).unwrap();
        let header = NpyHeader::read_from(&mut file).unwrap();
        assert_eq!(header.record_count(), 6000);
        let (_, ts) = read_npy::<i64>(&path, "<i8").unwrap();
        assert_eq!(ts[0], first);
    }
    assert!(exp.join("recording2/spikes/Emulator-100.probe/spike_group_1").is_dir());
}

#[test]
fn test_timestamp_files_stay_aligned_with_tiny_blocks() {
    let tmp = TempDir::new().unwrap();
    // 1024 samples per channel ring, fed 3 samples at a time while the
    // record thread reads concurrently
    let config = config(tmp.path(), 64, 16);
    let mut node = node(&config);
    node.start_acquisition().unwrap();

    let mut next = 0i64;
    for _ in 0..2 {
        node.start_recording().unwrap();
        for _round in 0..20 {
            for _ in 0..100 {
                node.process_block(&ramp_block(next, 3)).unwrap();
                next += 3;
            }
            wait_drained(&node);
        }
        assert_eq!(node.data_counters().unwrap().dropped, 0);
        node.stop_recording().unwrap();

        let dir = node.recording_dir().unwrap().join("continuous/Emulator-100.probe");
        let (_, ts) = read_npy::<i64>(dir.join("timestamps.npy"), "<i8").unwrap();
        let (_, sts) = read_npy::<f64>(dir.join("synchronized_timestamps.npy"), "<f8").unwrap();
        assert_eq!(ts.len(), 6000);
        assert_eq!(sts.len(), ts.len());
        assert_eq!(read_i16(&dir.join("continuous.dat")).len(), 2 * 6000);
    }
    node.stop_acquisition().unwrap();
}

#[test]
fn test_late_stream_starts_at_its_first_sample() {
    let tmp = TempDir::new().unwrap();
    let mut config = config(tmp.path(), 1024, 4);
    config.streams = vec![
        StreamConfig::new(7, "a", 30000.0, 2),
        StreamConfig::new(8, "b", 30000.0, 2),
    ];
    let mut node = node(&config);
    node.start_acquisition().unwrap();
    node.start_recording().unwrap();

    node.process_block(&stream_block(7, 50_000, 100)).unwrap();
    // Files are open before stream b delivers anything
    thread::sleep(Duration::from_millis(100));
    node.process_block(&stream_block(8, 50_000, 100)).unwrap();
    wait_drained(&node);
    node.stop_recording().unwrap();
    node.stop_acquisition().unwrap();

    let continuous = node.recording_dir().unwrap().join("continuous");
    for stream in ["Emulator-100.a", "Emulator-100.b"] {
        let dir = continuous.join(stream);
        let len = fs::metadata(dir.join("continuous.dat")).unwrap().len();
        assert_eq!(len, 2 * 2 * 100, "{stream}");
        let (_, ts) = read_npy::<i64>(dir.join("timestamps.npy"), "<i8").unwrap();
        assert_eq!(ts.first(), Some(&50_000), "{stream}");
        assert_eq!(ts.len(), 100, "{stream}");
    }
}
