//! Interval-based progress reporting.
//!
//! The reader and applicator loops report progress every `--progress-window`
//! records. The window is rounded up to a power of two so the check on the
//! hot path is a mask test, matching the behavior of the report period knob.

use std::time::Instant;

use log::info;

use crate::logging::format_count;

/// Reports progress every time the record count crosses a window boundary.
pub struct ProgressReporter {
    /// Mask derived from the window size (a power of two).
    mask: u64,
    /// Label prefix for log lines.
    message: &'static str,
    /// Total records expected, when known (used for the fraction column).
    total: Option<u64>,
    /// Records seen so far.
    count: u64,
    /// Whether reporting is enabled at all.
    enabled: bool,
    start: Instant,
    window_start: Instant,
}

impl ProgressReporter {
    /// Creates a reporter logging every `window` records (rounded up to a
    /// power of two). A disabled reporter only counts.
    #[must_use]
    pub fn new(message: &'static str, window: u64, enabled: bool) -> Self {
        let now = Instant::now();
        Self {
            mask: window.max(1).next_power_of_two() - 1,
            message,
            total: None,
            count: 0,
            enabled,
            start: now,
            window_start: now,
        }
    }

    /// Sets the expected total record count.
    #[must_use]
    pub fn with_total(mut self, total: u64) -> Self {
        self.total = Some(total);
        self
    }

    /// Counts one record, logging when a window boundary is crossed.
    pub fn tick(&mut self) {
        self.count += 1;
        if self.enabled && (self.count & self.mask) == 0 {
            let elapsed = self.window_start.elapsed().as_secs_f64();
            match self.total {
                #[allow(clippy::cast_precision_loss)]
                Some(total) if total > 0 => info!(
                    "{} {} ({:.4}) window {:.2}s total {:.2}s",
                    self.message,
                    format_count(self.count),
                    self.count as f64 / total as f64,
                    elapsed,
                    self.start.elapsed().as_secs_f64(),
                ),
                _ => info!(
                    "{} {} window {:.2}s total {:.2}s",
                    self.message,
                    format_count(self.count),
                    elapsed,
                    self.start.elapsed().as_secs_f64(),
                ),
            }
            self.window_start = Instant::now();
        }
    }

    /// Logs the final count.
    pub fn finish(&self) {
        if self.enabled {
            info!(
                "{} {} (complete) in {:.2}s",
                self.message,
                format_count(self.count),
                self.start.elapsed().as_secs_f64()
            );
        }
    }

    /// Records seen so far.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.count
    }
}
