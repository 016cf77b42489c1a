//! Transfer speed accounting.

use std::time::{Duration, Instant};

/// Shortest window the instantaneous rate is computed over.
pub const INSTANT_WINDOW: Duration = Duration::from_millis(500);

/// Point-in-time transfer report handed to observers.
#[derive(Debug, Clone, Copy)]
pub struct Progress {
    /// Bytes sent so far.
    pub transferred: u64,
    /// Bytes the transfer will move in total.
    pub total: u64,
    /// Overall progress, 0 to 100. The upload owns the first 95
    /// points; the merge claims the rest.
    pub percent: f64,
    /// Throughput over the most recent window, bytes per second.
    pub instant_bps: f64,
    /// Lifetime average, bytes per second.
    pub average_bps: f64,
}

/// Receives progress reports during an upload.
pub trait ProgressObserver: Send + Sync {
    /// Called after every slice, and once more when the upload
    /// finalizes.
    fn progress(&self, progress: Progress);
}

/// Sliding-window speed meter.
#[derive(Debug)]
pub struct SpeedMeter {
    started: Instant,
    window_started: Instant,
    window_bytes: u64,
    transferred: u64,
    instant_bps: f64,
}

impl Default for SpeedMeter {
    fn default() -> Self {
        Self::new()
    }
}

impl SpeedMeter {
    /// Start the clock.
    #[must_use]
    pub fn new() -> Self {
        let now = Instant::now();

        Self {
            started: now,
            window_started: now,
            window_bytes: 0,
            transferred: 0,
            instant_bps: 0.0,
        }
    }

    /// Account for `n` transferred bytes. The instantaneous rate rolls
    /// over once the current window is at least [`INSTANT_WINDOW`] old.
    pub fn record(&mut self, n: u64) {
        self.transferred += n;
        self.window_bytes += n;

        let elapsed = self.window_started.elapsed();

        if elapsed >= INSTANT_WINDOW {
            #[allow(clippy::cast_precision_loss)]
            {
                self.instant_bps = self.window_bytes as f64 / elapsed.as_secs_f64();
            }

            self.window_started = Instant::now();
            self.window_bytes = 0;
        }
    }

    /// Bytes recorded so far.
    #[must_use]
    pub fn transferred(&self) -> u64 {
        self.transferred
    }

    /// Throughput over the most recent closed window.
    #[must_use]
    pub fn instant_bps(&self) -> f64 {
        self.instant_bps
    }

    /// Lifetime average throughput.
    #[must_use]
    pub fn average_bps(&self) -> f64 {
        let elapsed = self.started.elapsed().as_secs_f64();

        if elapsed == 0.0 {
            return 0.0;
        }

        #[allow(clippy::cast_precision_loss)]
        {
            self.transferred as f64 / elapsed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rates_become_positive_after_a_window() {
        let mut meter = SpeedMeter::new();

        meter.record(1000);
        std::thread::sleep(INSTANT_WINDOW + Duration::from_millis(50));
        meter.record(1000);

        assert_eq!(meter.transferred(), 2000);
        assert!(meter.instant_bps() > 0.0);
        assert!(meter.average_bps() > 0.0);
    }

    #[test]
    fn short_windows_do_not_roll() {
        let mut meter = SpeedMeter::new();

        meter.record(1000);

        assert_eq!(meter.instant_bps(), 0.0, "window has not closed yet");
    }
}
