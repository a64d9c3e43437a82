//! Adaptive rate correction for the capture loop.
//!
//! The pacer keeps the aggregate observed frame rate over a trailing
//! window close to the configured target by biasing the next inter-frame
//! sleep with the window's accumulated drift. Scheduling jitter within a
//! cycle is absorbed instead of compounding.

use std::collections::VecDeque;
use std::time::Duration;

/// Floor for the computed sleep interval. When the pipeline falls so far
/// behind that the corrected rate goes non-positive, the pacer sleeps
/// this long instead of dividing by zero or sleeping a negative time.
pub const MIN_SLEEP: Duration = Duration::from_millis(1);

/// Default moving-window size, in cycles.
pub const DEFAULT_WINDOW: usize = 100;

pub struct RatePacer {
    target_rate: f64,
    window: usize,
    /// Last `window + 1` cycle timestamps, giving `window` intervals.
    stamps: VecDeque<f64>,
}

impl RatePacer {
    pub fn new(target_rate: f64, window: usize) -> Self {
        Self {
            target_rate,
            window,
            stamps: VecDeque::with_capacity(window + 1),
        }
    }

    /// Record the completion instant of a capture cycle (epoch seconds).
    pub fn observe(&mut self, instant: f64) {
        self.stamps.push_back(instant);
        while self.stamps.len() > self.window + 1 {
            self.stamps.pop_front();
        }
    }

    /// Sleep interval before the next capture cycle.
    ///
    /// During warm-up (fewer than `window` observed intervals) this is the
    /// ideal `1 / target`. Afterwards the actual elapsed time over the
    /// window is compared to the ideal `window / target` and the next
    /// sleep is biased by the drift spread over the window:
    ///
    /// `next = 1 / target + (ideal - actual) / window`
    ///
    /// A window that ran slow shortens the next sleep, a window that ran
    /// fast lengthens it, and the aggregate window rate reconverges to
    /// target.
    pub fn next_interval(&self) -> Duration {
        let ideal_interval = 1.0 / self.target_rate;
        if self.stamps.len() <= self.window {
            return clamp(ideal_interval);
        }

        let newest = *self.stamps.back().unwrap();
        let oldest = *self.stamps.front().unwrap();
        let actual = newest - oldest;
        let ideal = self.window as f64 / self.target_rate;

        let next = ideal_interval + (ideal - actual) / self.window as f64;
        if next <= 0.0 {
            // Catastrophically behind; the guard keeps us from sleeping
            // negative time or deriving a non-positive rate.
            return MIN_SLEEP;
        }
        clamp(next)
    }

    pub fn target_rate(&self) -> f64 {
        self.target_rate
    }
}

fn clamp(seconds: f64) -> Duration {
    let min = MIN_SLEEP.as_secs_f64();
    Duration::from_secs_f64(seconds.max(min))
}
