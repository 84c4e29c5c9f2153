//! Frames-per-second accounting
//!
//! Counts processed frames against the monotonic clock and yields one sample
//! per full elapsed second.

use std::time::{Duration, Instant};

/// Length of one sampling window
pub const SAMPLE_WINDOW: Duration = Duration::from_secs(1);

/// Rolling frame counter for the capture loop
#[derive(Debug)]
pub struct ThroughputMeter {
    /// Frames counted in the current window
    frames: u64,
    /// Start of the current window
    window_start: Instant,
}

impl ThroughputMeter {
    pub fn new(now: Instant) -> Self {
        Self {
            frames: 0,
            window_start: now,
        }
    }

    /// Count one processed frame
    ///
    /// Returns the frames-per-second figure when at least a full window has
    /// elapsed, and starts a new window.
    pub fn record(&mut self, now: Instant) -> Option<f64> {
        self.frames += 1;

        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed < SAMPLE_WINDOW {
            return None;
        }

        let fps = self.frames as f64 / elapsed.as_secs_f64();
        self.frames = 0;
        self.window_start = now;
        Some(fps)
    }

    /// Frames counted since the last sample
    #[cfg(test)]
    pub(crate) fn pending(&self) -> u64 {
        self.frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_sample_inside_window() {
        let start = Instant::now();
        let mut meter = ThroughputMeter::new(start);
        for i in 1..=10 {
            assert_eq!(meter.record(start + Duration::from_millis(i * 90)), None);
        }
        assert_eq!(meter.pending(), 10);
    }

    #[test]
    fn test_sample_after_full_second_and_reset() {
        let start = Instant::now();
        let mut meter = ThroughputMeter::new(start);
        for i in 1..30 {
            assert!(meter.record(start + Duration::from_millis(i * 33)).is_none());
        }
        let fps = meter.record(start + Duration::from_millis(1000)).unwrap();
        assert!((fps - 30.0).abs() < 1e-9);
        assert_eq!(meter.pending(), 0);

        // Next window starts at the sample point
        assert!(meter.record(start + Duration::from_millis(1500)).is_none());
        let fps = meter.record(start + Duration::from_millis(2500)).unwrap();
        assert!((fps - 2.0 / 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_slow_cycles_divide_by_elapsed_time() {
        let start = Instant::now();
        let mut meter = ThroughputMeter::new(start);
        let fps = meter.record(start + Duration::from_secs(2)).unwrap();
        assert!((fps - 0.5).abs() < 1e-9);
    }
}
