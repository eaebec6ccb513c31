//! Lock-free counters shared by the recording queues
//!
//! # Design Principles (KISS)
//! - Atomic counters on the hot path (the acquisition thread never locks)
//! - Simple snapshot mechanism for reporting
//! - One counter set per queue; the record thread keeps its own stats

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters tracked by every queue
///
/// - Written: items accepted by the producer side
/// - Read: items handed to the consumer side
/// - Dropped: items lost because the queue was full
/// - Overruns: producer calls that lost at least one item
///
/// All operations use Relaxed ordering. Statistics are eventually
/// consistent, which is acceptable for monitoring.
#[derive(Debug)]
pub struct AtomicCounters {
    /// Items accepted into the queue
    pub written: AtomicU64,
    /// Items drained from the queue
    pub read: AtomicU64,
    /// Items lost to overrun
    pub dropped: AtomicU64,
    /// Number of producer calls that hit a full queue
    pub overruns: AtomicU64,
}

impl AtomicCounters {
    /// Create new zeroed counters
    pub fn new() -> Self {
        Self {
            written: AtomicU64::new(0),
            read: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            overruns: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn add_written(&self, n: u64) {
        self.written.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_read(&self, n: u64) {
        self.read.fetch_add(n, Ordering::Relaxed);
    }

    /// Record an overrun that lost `n` items
    #[inline]
    pub fn add_dropped(&self, n: u64) {
        self.dropped.fetch_add(n, Ordering::Relaxed);
        self.overruns.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a snapshot of current values
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            written: self.written.load(Ordering::Relaxed),
            read: self.read.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            overruns: self.overruns.load(Ordering::Relaxed),
        }
    }

    /// Reset all counters to zero
    pub fn reset(&self) {
        self.written.store(0, Ordering::Relaxed);
        self.read.store(0, Ordering::Relaxed);
        self.dropped.store(0, Ordering::Relaxed);
        self.overruns.store(0, Ordering::Relaxed);
    }
}

impl Default for AtomicCounters {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of counter values at a point in time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub written: u64,
    pub read: u64,
    pub dropped: u64,
    pub overruns: u64,
}

impl CounterSnapshot {
    /// Items written but not yet drained
    pub fn pending(&self) -> u64 {
        self.written.saturating_sub(self.read)
    }

    /// Calculate rates between two snapshots given elapsed seconds
    pub fn rate_from(&self, prev: &CounterSnapshot, elapsed_secs: f64) -> RateSnapshot {
        if elapsed_secs <= 0.0 {
            return RateSnapshot::default();
        }

        RateSnapshot {
            written_rate: (self.written.saturating_sub(prev.written)) as f64 / elapsed_secs,
            read_rate: (self.read.saturating_sub(prev.read)) as f64 / elapsed_secs,
            dropped_rate: (self.dropped.saturating_sub(prev.dropped)) as f64 / elapsed_secs,
        }
    }
}

/// Rate calculations from counter snapshots
#[derive(Debug, Clone, Copy, Default)]
pub struct RateSnapshot {
    /// Items written per second
    pub written_rate: f64,
    /// Items drained per second
    pub read_rate: f64,
    /// Items dropped per second
    pub dropped_rate: f64,
}

impl RateSnapshot {
    /// Format the drain rate as a human-readable string (K/s, M/s)
    pub fn format_read_rate(&self) -> String {
        if self.read_rate >= 1_000_000.0 {
            format!("{:.2} M/s", self.read_rate / 1_000_000.0)
        } else if self.read_rate >= 1_000.0 {
            format!("{:.2} K/s", self.read_rate / 1_000.0)
        } else {
            format!("{:.0} /s", self.read_rate)
        }
    }
}

/// Format a byte count as a human-readable string (KB, MB, GB)
pub fn format_bytes(bytes: u64) -> String {
    let bytes = bytes as f64;
    if bytes >= 1_000_000_000.0 {
        format!("{:.2} GB", bytes / 1_000_000_000.0)
    } else if bytes >= 1_000_000.0 {
        format!("{:.2} MB", bytes / 1_000_000.0)
    } else if bytes >= 1_000.0 {
        format!("{:.2} KB", bytes / 1_000.0)
    } else {
        format!("{:.0} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atomic_counters_new() {
        let counters = AtomicCounters::new();
        assert_eq!(counters.snapshot(), CounterSnapshot::default());
    }

    #[test]
    fn test_add_dropped_counts_overrun() {
        let counters = AtomicCounters::new();
        counters.add_written(10);
        counters.add_dropped(3);
        counters.add_dropped(2);

        let snap = counters.snapshot();
        assert_eq!(snap.written, 10);
        assert_eq!(snap.dropped, 5);
        assert_eq!(snap.overruns, 2);
    }

    #[test]
    fn test_pending_and_reset() {
        let counters = AtomicCounters::new();
        counters.add_written(100);
        counters.add_read(60);
        assert_eq!(counters.snapshot().pending(), 40);

        counters.reset();
        assert_eq!(counters.snapshot().pending(), 0);
    }

    #[test]
    fn test_rate_calculation() {
        let prev = CounterSnapshot {
            written: 100,
            read: 90,
            dropped: 1,
            overruns: 1,
        };
        let current = CounterSnapshot {
            written: 300,
            read: 290,
            dropped: 1,
            overruns: 1,
        };

        let rate = current.rate_from(&prev, 2.0);
        assert_eq!(rate.written_rate, 100.0);
        assert_eq!(rate.read_rate, 100.0);
        assert_eq!(rate.dropped_rate, 0.0);
    }

    #[test]
    fn test_rate_zero_elapsed() {
        let current = CounterSnapshot {
            written: 100,
            ..Default::default()
        };
        let rate = current.rate_from(&CounterSnapshot::default(), 0.0);
        assert_eq!(rate.written_rate, 0.0);
    }

    #[test]
    fn test_format_helpers() {
        let rate = RateSnapshot {
            read_rate: 1500.0,
            ..Default::default()
        };
        assert_eq!(rate.format_read_rate(), "1.50 K/s");
        assert_eq!(format_bytes(500), "500 B");
        assert_eq!(format_bytes(1_500_000), "1.50 MB");
    }
}
