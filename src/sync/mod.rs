//! Multi-stream clock synchronization
//!
//! Every stream designates one TTL line as its sync line; a shared pulse
//! train is wired to all of them. Pulses that arrive within one sync
//! window (opened by the first rising edge, closed `window_ms` later by
//! the [`SyncTimer`]) are paired with the main stream's clock:
//!
//! ```text
//! main:    ──┐___┌──────────────────┐___┌───  main time t0, t1, ...
//! stream:  ───┐___┌──────────────────┐___┌──  sample s0, s1, ...
//!            [window]               [window]
//!
//! rate = (s1 - s0) / (t1 - t0)      time(s) = t0 + (s - s0) / rate
//! ```
//!
//! All methods take `&self`; stream state sits behind one short-held lock
//! since TTL events may arrive from several acquisition callbacks.

pub mod stream;

pub use stream::{SyncPulse, SyncStream, MAX_PULSES};

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;

/// Synchronizer errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    #[error("Unknown stream {0}")]
    UnknownStream(u16),

    #[error("Stream {0} is not synchronized")]
    NotSynchronized(u16),
}

/// Synchronization status shown per stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// Acquisition stopped or stream unknown
    Off,
    /// Has a sync line but no clock estimate yet
    Syncing,
    Synced,
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncStatus::Off => write!(f, "OFF"),
            SyncStatus::Syncing => write!(f, "SYNCING"),
            SyncStatus::Synced => write!(f, "SYNCED"),
        }
    }
}

#[derive(Debug)]
struct Inner {
    streams: BTreeMap<u16, SyncStream>,
    main_stream: Option<u16>,
    previous_main_stream: Option<u16>,
    window_deadline: Option<Instant>,
    window: u64,
    first_main_sync: bool,
    acquisition_active: bool,
    timer_stop: bool,
}

impl Inner {
    fn stream(&self, id: u16) -> Result<&SyncStream, SyncError> {
        self.streams.get(&id).ok_or(SyncError::UnknownStream(id))
    }

    fn reset(&mut self) {
        self.window_deadline = None;
        self.first_main_sync = true;
        for stream in self.streams.values_mut() {
            stream.reset();
        }
    }

    fn set_main(&mut self, id: Option<u16>) {
        self.main_stream = id;
        for (key, stream) in self.streams.iter_mut() {
            stream.is_main = Some(*key) == id;
        }
    }

    fn close_window(&mut self) {
        self.window_deadline = None;
        let window = self.window;
        let main_pulse = self
            .main_stream
            .and_then(|id| self.streams.get(&id))
            .and_then(|main| main.pulse_index_in_window(window));
        for stream in self.streams.values_mut() {
            stream.close_sync_window(window, main_pulse);
        }
        self.window += 1;
    }
}

/// Clock synchronizer shared by the record node and the sync timer
#[derive(Debug)]
pub struct Synchronizer {
    inner: Mutex<Inner>,
    wakeup: Condvar,
    window_length: Duration,
    tolerance: f64,
    configured_main: Option<u16>,
}

impl Synchronizer {
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                streams: BTreeMap::new(),
                main_stream: None,
                previous_main_stream: None,
                window_deadline: None,
                window: 0,
                first_main_sync: true,
                acquisition_active: false,
                timer_stop: false,
            }),
            wakeup: Condvar::new(),
            window_length: config.window(),
            tolerance: config.sample_rate_tolerance,
            configured_main: config.main_stream,
        }
    }

    pub fn window_length(&self) -> Duration {
        self.window_length
    }

    // =========================================================================
    // Topology
    // =========================================================================

    /// Mark every stream inactive ahead of re-registration
    pub fn prepare_for_update(&self) {
        let mut inner = self.inner.lock();
        inner.previous_main_stream = inner.main_stream;
        for stream in inner.streams.values_mut() {
            stream.is_active = false;
        }
    }

    /// Register a stream, or reactivate it if already known
    pub fn add_data_stream(&self, id: u16, expected_sample_rate: f64) {
        let mut inner = self.inner.lock();
        match inner.streams.get_mut(&id) {
            Some(stream) => {
                stream.is_active = true;
                if stream.expected_sample_rate != expected_sample_rate {
                    stream.expected_sample_rate = expected_sample_rate;
                    stream.reset();
                }
            }
            None => {
                debug!(stream = id, rate = expected_sample_rate, "Sync stream added");
                inner
                    .streams
                    .insert(id, SyncStream::new(id, expected_sample_rate, self.tolerance));
            }
        }
        if inner.main_stream.is_none() {
            inner.main_stream = Some(id);
        }
    }

    /// Drop streams that were not re-registered and elect a main stream
    pub fn finished_update(&self) {
        let mut inner = self.inner.lock();
        inner.streams.retain(|id, stream| {
            if !stream.is_active {
                debug!(stream = *id, "Sync stream removed");
            }
            stream.is_active
        });

        let candidates = [self.configured_main, inner.previous_main_stream, inner.main_stream];
        let main = candidates
            .into_iter()
            .flatten()
            .find(|id| inner.streams.contains_key(id))
            .or_else(|| inner.streams.keys().next().copied());
        if main != inner.main_stream {
            info!(main_stream = ?main, "Main sync stream selected");
        }
        inner.set_main(main);
    }

    pub fn set_main_stream(&self, id: u16) -> Result<(), SyncError> {
        let mut inner = self.inner.lock();
        inner.stream(id)?;
        inner.set_main(Some(id));
        inner.reset();
        Ok(())
    }

    pub fn main_stream(&self) -> Option<u16> {
        self.inner.lock().main_stream
    }

    pub fn is_main_stream(&self, id: u16) -> bool {
        self.inner.lock().main_stream == Some(id)
    }

    /// Changing a stream's sync line restarts its clock estimate; changing
    /// the main stream's restarts every stream
    pub fn set_sync_line(&self, id: u16, line: u8) -> Result<(), SyncError> {
        let mut inner = self.inner.lock();
        let is_main = inner.main_stream == Some(id);
        let stream = inner.streams.get_mut(&id).ok_or(SyncError::UnknownStream(id))?;
        stream.sync_line = line;
        if is_main {
            inner.reset();
        } else {
            stream.reset();
        }
        Ok(())
    }

    pub fn sync_line(&self, id: u16) -> Result<u8, SyncError> {
        Ok(self.inner.lock().stream(id)?.sync_line)
    }

    pub fn stream_ids(&self) -> Vec<u16> {
        self.inner.lock().streams.keys().copied().collect()
    }

    // =========================================================================
    // Acquisition
    // =========================================================================

    pub fn reset(&self) {
        self.inner.lock().reset();
    }

    pub fn start_acquisition(&self) {
        let mut inner = self.inner.lock();
        inner.reset();
        inner.acquisition_active = true;
    }

    pub fn stop_acquisition(&self) {
        let mut inner = self.inner.lock();
        inner.acquisition_active = false;
        inner.window_deadline = None;
    }

    /// Feed one TTL transition. Events on other lines than the stream's
    /// sync line are ignored.
    pub fn add_event(&self, id: u16, line: u8, sample_number: i64, state: bool) {
        let mut inner = self.inner.lock();
        let Some(stream) = inner.streams.get_mut(&id) else {
            return;
        };
        if stream.sync_line != line {
            return;
        }
        if !state {
            stream.add_falling_edge(sample_number);
            return;
        }

        if inner.window_deadline.is_none() {
            inner.window_deadline = Some(Instant::now() + self.window_length);
            self.wakeup.notify_all();
        }
        let window = inner.window;
        let now_millis = chrono::Utc::now().timestamp_millis();

        let Some(stream) = inner.streams.get_mut(&id) else {
            return;
        };
        stream.add_rising_edge(sample_number, now_millis, window);

        if inner.main_stream != Some(id) {
            return;
        }
        let main_time = if inner.first_main_sync {
            inner.first_main_sync = false;
            0.0
        } else {
            let main = inner.stream(id).map(|s| (s.origin(), s.expected_sample_rate));
            match main {
                Ok((Some((start, _)), rate)) => (sample_number - start) as f64 / rate,
                _ => {
                    // The first main window was discarded; start over
                    0.0
                }
            }
        };
        for stream in inner.streams.values_mut() {
            stream.set_main_time(main_time);
        }
    }

    /// Close the open sync window and fold it into every stream's clock
    pub fn close_sync_window(&self) {
        let mut inner = self.inner.lock();
        inner.close_window();
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn is_stream_synced(&self, id: u16) -> bool {
        self.inner
            .lock()
            .stream(id)
            .is_ok_and(SyncStream::is_synchronized)
    }

    pub fn status(&self, id: u16) -> SyncStatus {
        let inner = self.inner.lock();
        if !inner.acquisition_active {
            return SyncStatus::Off;
        }
        match inner.stream(id) {
            Ok(s) if s.is_synchronized() => SyncStatus::Synced,
            Ok(_) => SyncStatus::Syncing,
            Err(_) => SyncStatus::Off,
        }
    }

    /// Global time (seconds) of the stream's sample 0
    pub fn start_time(&self, id: u16) -> Result<f64, SyncError> {
        let inner = self.inner.lock();
        inner
            .stream(id)?
            .global_start_time()
            .ok_or(SyncError::NotSynchronized(id))
    }

    /// Seconds since the stream's last sync pulse arrived; `None` before
    /// the first pulse
    pub fn last_sync_event(&self, id: u16) -> Result<Option<f64>, SyncError> {
        let inner = self.inner.lock();
        let now = chrono::Utc::now().timestamp_millis();
        Ok(inner
            .stream(id)?
            .latest_pulse()
            .map(|p| (now - p.computer_time_millis) as f64 / 1000.0))
    }

    /// Clock error of the last folded pulse in milliseconds; 0 for the main
    /// stream and for unsynchronized streams
    pub fn accuracy(&self, id: u16) -> Result<f64, SyncError> {
        Ok(self.inner.lock().stream(id)?.accuracy_ms())
    }

    pub fn actual_sample_rate(&self, id: u16) -> Result<Option<f64>, SyncError> {
        Ok(self.inner.lock().stream(id)?.actual_sample_rate())
    }

    /// Origin `(sample, time)` of the stream's clock model
    pub fn origin(&self, id: u16) -> Result<Option<(i64, f64)>, SyncError> {
        Ok(self.inner.lock().stream(id)?.origin())
    }

    /// Recent pulses, newest first
    pub fn pulses(&self, id: u16) -> Result<Vec<SyncPulse>, SyncError> {
        Ok(self.inner.lock().stream(id)?.pulses().cloned().collect())
    }

    pub fn convert_sample_number_to_timestamp(&self, id: u16, sample_number: i64) -> Result<f64, SyncError> {
        self.inner
            .lock()
            .stream(id)?
            .sample_to_time(sample_number)
            .ok_or(SyncError::NotSynchronized(id))
    }

    pub fn convert_timestamp_to_sample_number(&self, id: u16, timestamp: f64) -> Result<i64, SyncError> {
        self.inner
            .lock()
            .stream(id)?
            .time_to_sample(timestamp)
            .ok_or(SyncError::NotSynchronized(id))
    }
}

/// Timer thread closing each sync window once its length has elapsed
pub struct SyncTimer {
    synchronizer: Arc<Synchronizer>,
    handle: Option<JoinHandle<()>>,
}

impl SyncTimer {
    pub fn start(synchronizer: Arc<Synchronizer>) -> std::io::Result<Self> {
        synchronizer.inner.lock().timer_stop = false;
        let sync = Arc::clone(&synchronizer);
        let handle = std::thread::Builder::new()
            .name("Sync Timer".into())
            .spawn(move || Self::run(&sync))?;
        Ok(Self {
            synchronizer,
            handle: Some(handle),
        })
    }

    fn run(sync: &Synchronizer) {
        let mut inner = sync.inner.lock();
        while !inner.timer_stop {
            match inner.window_deadline {
                Some(deadline) if Instant::now() >= deadline => inner.close_window(),
                Some(deadline) => {
                    sync.wakeup.wait_until(&mut inner, deadline);
                }
                None => {
                    sync.wakeup.wait(&mut inner);
                }
            }
        }
        debug!("Sync timer stopped");
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.synchronizer.inner.lock().timer_stop = true;
            self.synchronizer.wakeup.notify_all();
            if handle.join().is_err() {
                warn!("Sync timer thread panicked");
            }
        }
    }
}

impl Drop for SyncTimer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for SyncTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncTimer")
            .field("running", &self.handle.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sync_with(streams: &[(u16, f64)]) -> Synchronizer {
        let sync = Synchronizer::new(&SyncConfig::default());
        sync.prepare_for_update();
        for &(id, rate) in streams {
            sync.add_data_stream(id, rate);
        }
        sync.finished_update();
        sync.start_acquisition();
        sync
    }

    /// One pulse on every listed stream within the same window
    fn pulse(sync: &Synchronizer, samples: &[(u16, i64)]) {
        for &(id, sample) in samples {
            sync.add_event(id, 0, sample, true);
        }
        for &(id, sample) in samples {
            sync.add_event(id, 0, sample + 10, false);
        }
        sync.close_sync_window();
    }

    #[test]
    fn test_first_stream_becomes_main() {
        let sync = sync_with(&[(3, 30000.0), (1, 2500.0)]);
        assert_eq!(sync.main_stream(), Some(3));
        sync.set_main_stream(1).unwrap();
        assert!(sync.is_main_stream(1));
        assert!(!sync.is_main_stream(3));
        assert_eq!(sync.set_main_stream(9), Err(SyncError::UnknownStream(9)));
    }

    #[test]
    fn test_configured_main_stream_wins() {
        let sync = Synchronizer::new(&SyncConfig {
            main_stream: Some(7),
            ..SyncConfig::default()
        });
        sync.prepare_for_update();
        sync.add_data_stream(2, 1000.0);
        sync.add_data_stream(7, 1000.0);
        sync.finished_update();
        assert_eq!(sync.main_stream(), Some(7));
    }

    #[test]
    fn test_two_pulses_synchronize() {
        let sync = sync_with(&[(0, 1000.0), (1, 2000.0)]);
        assert_eq!(sync.status(1), SyncStatus::Syncing);

        pulse(&sync, &[(0, 500), (1, 100)]);
        assert!(!sync.is_stream_synced(1));
        assert_eq!(
            sync.convert_sample_number_to_timestamp(1, 100),
            Err(SyncError::NotSynchronized(1))
        );

        pulse(&sync, &[(0, 1500), (1, 2104)]);
        assert!(sync.is_stream_synced(0));
        assert!(sync.is_stream_synced(1));
        assert_eq!(sync.status(1), SyncStatus::Synced);
        assert_eq!(sync.actual_sample_rate(1).unwrap(), Some(2004.0));

        let t = sync.convert_sample_number_to_timestamp(1, 1102).unwrap();
        assert!((t - 0.5).abs() < 1e-9);
        assert_eq!(sync.convert_timestamp_to_sample_number(1, t).unwrap(), 1102);
        assert_eq!(sync.accuracy(0).unwrap(), 0.0);
        assert!(sync.accuracy(1).unwrap() > 0.0);
    }

    #[test]
    fn test_rate_jump_resets_origin() {
        let sync = sync_with(&[(0, 1000.0), (1, 1000.0)]);
        pulse(&sync, &[(0, 0), (1, 0)]);
        pulse(&sync, &[(0, 1000), (1, 1000)]);
        assert!(sync.is_stream_synced(1));

        pulse(&sync, &[(0, 2000), (1, 2100)]);
        assert!(!sync.is_stream_synced(1));
        assert_eq!(sync.origin(1).unwrap(), Some((2100, 2.0)));
        assert_eq!(sync.actual_sample_rate(1).unwrap(), Some(1000.0));

        pulse(&sync, &[(0, 3000), (1, 3100)]);
        assert!(sync.is_stream_synced(1));
    }

    #[test]
    fn test_double_event_invalidates_window() {
        let sync = sync_with(&[(0, 1000.0), (1, 1000.0)]);
        pulse(&sync, &[(0, 0), (1, 0)]);
        // stream 1 pulses twice inside one window
        pulse(&sync, &[(0, 1000), (1, 1000), (1, 1005)]);
        assert!(sync.is_stream_synced(0));
        assert!(!sync.is_stream_synced(1));
    }

    #[test]
    fn test_other_lines_ignored() {
        let sync = sync_with(&[(0, 1000.0)]);
        sync.add_event(0, 3, 100, true);
        assert!(sync.pulses(0).unwrap().is_empty());
        sync.set_sync_line(0, 3).unwrap();
        sync.add_event(0, 3, 100, true);
        assert_eq!(sync.pulses(0).unwrap().len(), 1);
        assert_eq!(sync.sync_line(0).unwrap(), 3);
    }

    #[test]
    fn test_pulses_link_to_main() {
        let sync = sync_with(&[(0, 1000.0), (1, 1000.0)]);
        pulse(&sync, &[(0, 0), (1, 0)]);
        pulse(&sync, &[(0, 1000), (1, 1000)]);
        let pulses = sync.pulses(1).unwrap();
        assert_eq!(pulses[0].matching_pulse_index, Some(0));
        assert_eq!(pulses[0].global_timestamp, Some(1.0));
        assert!(pulses[0].complete);
        assert!(sync.last_sync_event(1).unwrap().is_some());
    }

    #[test]
    fn test_topology_update_drops_missing_streams() {
        let sync = sync_with(&[(0, 1000.0), (1, 1000.0)]);
        sync.prepare_for_update();
        sync.add_data_stream(1, 1000.0);
        sync.finished_update();
        assert_eq!(sync.stream_ids(), vec![1]);
        assert_eq!(sync.main_stream(), Some(1));
    }

    #[test]
    fn test_status_off_when_stopped() {
        let sync = sync_with(&[(0, 1000.0)]);
        sync.stop_acquisition();
        assert_eq!(sync.status(0), SyncStatus::Off);
        assert_eq!(sync.status(42), SyncStatus::Off);
    }

    #[test]
    fn test_timer_closes_window() {
        let sync = Arc::new(Synchronizer::new(&SyncConfig {
            window_ms: 5,
            ..SyncConfig::default()
        }));
        sync.prepare_for_update();
        sync.add_data_stream(0, 1000.0);
        sync.finished_update();
        sync.start_acquisition();
        let timer = SyncTimer::start(Arc::clone(&sync)).unwrap();

        for sample in [0, 1000] {
            sync.add_event(0, 0, sample, true);
            let deadline = Instant::now() + Duration::from_secs(2);
            while sync.inner.lock().window_deadline.is_some() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(1));
            }
        }
        timer.stop();
        assert!(sync.is_stream_synced(0));
    }
}
