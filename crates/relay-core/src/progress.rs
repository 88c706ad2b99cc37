//! Transfer progress tracking.
//!
//! Speed comes from a sliding window of samples covering roughly the last
//! three seconds, so the number the UI shows reflects current throughput
//! rather than the whole-run average. Samples closer together than 100 ms
//! are coalesced.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Sliding window length for the speed estimate
const SPEED_WINDOW: Duration = Duration::from_secs(3);

/// Samples closer than this are merged into the newest one
const SAMPLE_COALESCE: Duration = Duration::from_millis(100);

/// Byte counters plus a windowed speed estimate for one session.
pub struct ProgressTracker {
    bytes_total: u64,
    bytes_transferred: u64,
    samples: VecDeque<(Instant, u64)>,
}

impl ProgressTracker {
    /// Create a tracker for a transfer of `bytes_total` plaintext bytes.
    #[must_use]
    pub fn new(bytes_total: u64) -> Self {
        let mut samples = VecDeque::new();
        samples.push_back((Instant::now(), 0));
        Self {
            bytes_total,
            bytes_transferred: 0,
            samples,
        }
    }

    /// Record `bytes` more plaintext moved.
    pub fn record(&mut self, bytes: u64) {
        self.bytes_transferred += bytes;
        let now = Instant::now();

        match self.samples.back_mut() {
            Some((at, total)) if now.duration_since(*at) < SAMPLE_COALESCE => {
                *total = self.bytes_transferred;
            }
            _ => self.samples.push_back((now, self.bytes_transferred)),
        }

        while let Some((at, _)) = self.samples.front() {
            if now.duration_since(*at) > SPEED_WINDOW && self.samples.len() > 1 {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Bytes moved so far.
    #[must_use]
    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }

    /// Total plaintext bytes in the transfer.
    #[must_use]
    pub fn bytes_total(&self) -> u64 {
        self.bytes_total
    }

    /// Windowed throughput in bytes per second.
    #[must_use]
    pub fn speed_bps(&self) -> f64 {
        let (Some((first_at, first_bytes)), Some((last_at, last_bytes))) =
            (self.samples.front(), self.samples.back())
        else {
            return 0.0;
        };

        let elapsed = last_at.duration_since(*first_at).as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        (last_bytes - first_bytes) as f64 / elapsed
    }

    /// Estimated seconds remaining; zero when done or speed is unknown.
    #[must_use]
    pub fn eta_s(&self) -> f64 {
        let speed = self.speed_bps();
        if speed <= 0.0 || self.bytes_transferred >= self.bytes_total {
            return 0.0;
        }
        ((self.bytes_total - self.bytes_transferred) as f64 / speed).max(0.0)
    }

    /// Whole-transfer completion percentage.
    #[must_use]
    pub fn percent(&self) -> f64 {
        if self.bytes_total == 0 {
            return 100.0;
        }
        (self.bytes_transferred as f64 / self.bytes_total as f64) * 100.0
    }
}
