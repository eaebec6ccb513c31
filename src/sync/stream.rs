//! Per-stream clock model

use std::collections::VecDeque;

use tracing::debug;

/// Pulses kept per stream, newest first
pub const MAX_PULSES: usize = 10;

/// One sync-line pulse seen on a stream
#[derive(Debug, Clone, PartialEq)]
pub struct SyncPulse {
    pub local_sample_number: i64,
    /// `local_sample_number / expected_sample_rate`
    pub local_timestamp: f64,
    /// Wall clock at arrival, Unix millis
    pub computer_time_millis: i64,
    /// Seconds between rising and falling edge; 0 until complete
    pub duration: f64,
    /// Seconds since the previous pulse's rising edge; 0 for the first
    pub interval: f64,
    pub complete: bool,
    /// Index into the main stream's pulses of the pulse that shared this
    /// pulse's sync window
    pub matching_pulse_index: Option<usize>,
    /// Global time of the rising edge, once the stream is synchronized
    pub global_timestamp: Option<f64>,
    window: u64,
}

/// What a stream saw of one value during the open sync window
#[derive(Debug, Clone, Copy, PartialEq, Default)]
enum WindowSlot<T> {
    #[default]
    Empty,
    Value(T),
    /// More than one value arrived; the window is discarded
    Conflict,
}

impl<T: Copy> WindowSlot<T> {
    fn offer(&mut self, value: T) {
        *self = match *self {
            Self::Empty => Self::Value(value),
            _ => Self::Conflict,
        };
    }

    fn value(&self) -> Option<T> {
        match self {
            Self::Value(v) => Some(*v),
            _ => None,
        }
    }
}

/// Clock model of one data stream
#[derive(Debug, Clone)]
pub struct SyncStream {
    pub id: u16,
    pub expected_sample_rate: f64,
    pub sync_line: u8,
    pub(crate) is_active: bool,
    pub(crate) is_main: bool,

    actual_sample_rate: Option<f64>,
    start_sample: Option<i64>,
    start_time: f64,
    last_sample: Option<i64>,
    is_synchronized: bool,
    tolerance: f64,

    window_sample: WindowSlot<i64>,
    window_main_time: WindowSlot<f64>,
    pulses: VecDeque<SyncPulse>,
}

impl SyncStream {
    pub fn new(id: u16, expected_sample_rate: f64, tolerance: f64) -> Self {
        Self {
            id,
            expected_sample_rate,
            sync_line: 0,
            is_active: true,
            is_main: false,
            actual_sample_rate: None,
            start_sample: None,
            start_time: 0.0,
            last_sample: None,
            is_synchronized: false,
            tolerance,
            window_sample: WindowSlot::Empty,
            window_main_time: WindowSlot::Empty,
            pulses: VecDeque::with_capacity(MAX_PULSES + 1),
        }
    }

    /// Forget the clock estimate and all pulses
    pub fn reset(&mut self) {
        self.actual_sample_rate = None;
        self.start_sample = None;
        self.start_time = 0.0;
        self.last_sample = None;
        self.is_synchronized = false;
        self.window_sample = WindowSlot::Empty;
        self.window_main_time = WindowSlot::Empty;
        self.pulses.clear();
    }

    pub fn is_synchronized(&self) -> bool {
        self.is_synchronized
    }

    pub fn is_main(&self) -> bool {
        self.is_main
    }

    pub fn actual_sample_rate(&self) -> Option<f64> {
        self.actual_sample_rate
    }

    /// Origin of the clock model: `(sample, global time)`
    pub fn origin(&self) -> Option<(i64, f64)> {
        self.start_sample.map(|s| (s, self.start_time))
    }

    pub fn pulses(&self) -> impl Iterator<Item = &SyncPulse> {
        self.pulses.iter()
    }

    pub fn latest_pulse(&self) -> Option<&SyncPulse> {
        self.pulses.front()
    }

    /// Rising edge on the sync line
    pub(crate) fn add_rising_edge(&mut self, sample_number: i64, computer_time_millis: i64, window: u64) {
        self.window_sample.offer(sample_number);

        let local_timestamp = sample_number as f64 / self.expected_sample_rate;
        let interval = self
            .pulses
            .front()
            .map_or(0.0, |prev| local_timestamp - prev.local_timestamp);
        self.pulses.push_front(SyncPulse {
            local_sample_number: sample_number,
            local_timestamp,
            computer_time_millis,
            duration: 0.0,
            interval,
            complete: false,
            matching_pulse_index: None,
            global_timestamp: None,
            window,
        });
        self.pulses.truncate(MAX_PULSES);
    }

    /// Falling edge on the sync line completes the latest pulse
    pub(crate) fn add_falling_edge(&mut self, sample_number: i64) {
        let rate = self.expected_sample_rate;
        if let Some(pulse) = self.pulses.front_mut() {
            if !pulse.complete {
                pulse.duration = sample_number as f64 / rate - pulse.local_timestamp;
                pulse.complete = true;
            }
        }
    }

    pub(crate) fn set_main_time(&mut self, main_time: f64) {
        self.window_main_time.offer(main_time);
    }

    /// Fold the window's sample/main-time pair into the clock model.
    ///
    /// `main_pulse` is the index of the main stream's pulse from the same
    /// window.
    pub(crate) fn close_sync_window(&mut self, window: u64, main_pulse: Option<usize>) {
        let sample = self.window_sample.value();
        let main_time = self.window_main_time.value();
        if self.window_sample == WindowSlot::Conflict || self.window_main_time == WindowSlot::Conflict {
            debug!(stream = self.id, "Multiple sync events in one window, discarded");
        }

        if let (Some(sample), Some(main_time)) = (sample, main_time) {
            self.fold(sample, main_time);
            let global = self.sample_to_time(sample);
            if let Some(pulse) = self.pulses.iter_mut().find(|p| p.window == window) {
                pulse.matching_pulse_index = main_pulse;
                pulse.global_timestamp = global;
            }
        }

        self.window_sample = WindowSlot::Empty;
        self.window_main_time = WindowSlot::Empty;
    }

    fn fold(&mut self, sample: i64, main_time: f64) {
        let Some(start_sample) = self.start_sample else {
            self.start_sample = Some(sample);
            self.start_time = main_time;
            return;
        };

        self.last_sample = Some(sample);
        let elapsed = main_time - self.start_time;
        if elapsed <= 0.0 {
            debug!(stream = self.id, "Sync window without elapsed main time");
            return;
        }
        let rate = (sample - start_sample) as f64 / elapsed;

        match self.actual_sample_rate {
            None => {
                self.actual_sample_rate = Some(rate);
                self.is_synchronized = true;
                debug!(stream = self.id, rate, "Sample rate estimated");
            }
            Some(current) if ((rate - current) / current).abs() < self.tolerance => {
                self.actual_sample_rate = Some(rate);
                self.is_synchronized = true;
            }
            Some(current) => {
                debug!(
                    stream = self.id,
                    estimate = current,
                    measured = rate,
                    "Sample rate jump, restarting clock estimate"
                );
                self.start_sample = Some(sample);
                self.start_time = main_time;
                self.is_synchronized = false;
            }
        }
    }

    /// Global time of `sample`, if synchronized
    pub fn sample_to_time(&self, sample: i64) -> Option<f64> {
        if !self.is_synchronized {
            return None;
        }
        let (start, rate) = (self.start_sample?, self.actual_sample_rate?);
        Some((sample - start) as f64 / rate + self.start_time)
    }

    /// Sample number at global time `t`, if synchronized
    pub fn time_to_sample(&self, t: f64) -> Option<i64> {
        if !self.is_synchronized {
            return None;
        }
        let (start, rate) = (self.start_sample?, self.actual_sample_rate?);
        Some(((t - self.start_time) * rate).round() as i64 + start)
    }

    /// Global time of sample 0
    pub fn global_start_time(&self) -> Option<f64> {
        self.sample_to_time(0)
    }

    /// Milliseconds between the expected-rate and actual-rate global times
    /// of the last folded pulse
    pub fn accuracy_ms(&self) -> f64 {
        if !self.is_synchronized || self.is_main {
            return 0.0;
        }
        match (self.start_sample, self.last_sample, self.actual_sample_rate) {
            (Some(start), Some(last), Some(actual)) => {
                let n = (last - start) as f64;
                (n / self.expected_sample_rate - n / actual) * 1000.0
            }
            _ => 0.0,
        }
    }

    /// Window id of the latest pulse
    pub(crate) fn latest_window(&self) -> Option<u64> {
        self.pulses.front().map(|p| p.window)
    }

    pub(crate) fn pulse_index_in_window(&self, window: u64) -> Option<usize> {
        self.pulses.iter().position(|p| p.window == window)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_slot_conflict() {
        let mut slot = WindowSlot::Empty;
        slot.offer(5i64);
        assert_eq!(slot.value(), Some(5));
        slot.offer(6);
        assert_eq!(slot, WindowSlot::Conflict);
        slot.offer(7);
        assert_eq!(slot.value(), None);
    }

    #[test]
    fn test_pulse_ring_newest_first_and_bounded() {
        let mut s = SyncStream::new(0, 1000.0, 0.01);
        for i in 0..15 {
            s.add_rising_edge(i * 1000, 0, i as u64);
            s.add_falling_edge(i * 1000 + 10);
        }
        let pulses: Vec<_> = s.pulses().collect();
        assert_eq!(pulses.len(), MAX_PULSES);
        assert_eq!(pulses[0].local_sample_number, 14_000);
        assert!((pulses[0].duration - 0.01).abs() < 1e-9);
        assert!((pulses[0].interval - 1.0).abs() < 1e-9);
        assert!(pulses.iter().all(|p| p.complete));
    }

    #[test]
    fn test_fold_seeds_then_tracks() {
        let mut s = SyncStream::new(1, 1000.0, 0.01);
        s.fold(100, 0.0);
        assert!(!s.is_synchronized());
        assert_eq!(s.origin(), Some((100, 0.0)));

        s.fold(1102, 1.0);
        assert!(s.is_synchronized());
        assert_eq!(s.actual_sample_rate(), Some(1002.0));
        assert!((s.accuracy_ms() - (1.002 - 1.0) * 1000.0).abs() < 1e-6);

        s.fold(2104, 2.0);
        assert_eq!(s.actual_sample_rate(), Some(1002.0));
        assert_eq!(s.origin(), Some((100, 0.0)));
    }

    #[test]
    fn test_conversions_require_sync() {
        let mut s = SyncStream::new(1, 1000.0, 0.01);
        assert_eq!(s.sample_to_time(10), None);
        s.fold(0, 0.0);
        s.fold(2000, 1.0);
        assert_eq!(s.sample_to_time(3000), Some(1.5));
        assert_eq!(s.time_to_sample(1.5), Some(3000));
        assert_eq!(s.global_start_time(), Some(0.0));
    }
}
