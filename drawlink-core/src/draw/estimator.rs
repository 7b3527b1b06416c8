//! Link estimator.
//!
//! Fed by the transmission pipeline: bytes per batch as they are written,
//! and one round-trip sample per drained response. Reports throughput over
//! a rolling window and a smoothed round-trip time.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Rolling-window throughput and smoothed RTT for one wire channel.
#[derive(Debug)]
pub struct LinkEstimator {
    /// `(when, bytes)` for every batch written inside the window.
    batches: VecDeque<(Instant, u64)>,
    window: Duration,
    window_bytes: u64,
    /// Smoothed round trip in microseconds; 0 until the first sample.
    srtt_us: u64,
    total_bytes: u64,
    total_batches: u64,
}

impl LinkEstimator {
    /// An estimator averaging over the last second.
    pub fn new() -> Self {
        Self::with_window(Duration::from_secs(1))
    }

    pub fn with_window(window: Duration) -> Self {
        Self {
            batches: VecDeque::with_capacity(128),
            window,
            window_bytes: 0,
            srtt_us: 0,
            total_bytes: 0,
            total_batches: 0,
        }
    }

    /// Account for a batch of `bytes` written now.
    pub fn record_batch(&mut self, bytes: usize) {
        self.record_batch_at(Instant::now(), bytes);
    }

    pub fn record_batch_at(&mut self, when: Instant, bytes: usize) {
        let bytes = bytes as u64;
        self.batches.push_back((when, bytes));
        self.window_bytes += bytes;
        self.total_bytes += bytes;
        self.total_batches += 1;
        while let Some(&(at, len)) = self.batches.front() {
            if when.saturating_duration_since(at) <= self.window {
                break;
            }
            self.batches.pop_front();
            self.window_bytes -= len;
        }
    }

    /// Fold one round-trip sample into the average (gain 1/8).
    pub fn record_rtt(&mut self, rtt: Duration) {
        let sample = rtt.as_micros().min(u64::MAX as u128) as u64;
        self.srtt_us = if self.srtt_us == 0 {
            sample.max(1)
        } else {
            (self.srtt_us * 7 + sample) / 8
        };
    }

    /// Bytes per second over the window.
    pub fn throughput(&self) -> u64 {
        let (Some((first, _)), Some((last, _))) = (self.batches.front(), self.batches.back()) else {
            return 0;
        };
        let span = last.saturating_duration_since(*first).max(Duration::from_millis(1));
        (self.window_bytes as f64 / span.as_secs_f64()) as u64
    }

    /// Smoothed round trip, zero before the first response.
    pub fn rtt(&self) -> Duration {
        Duration::from_micros(self.srtt_us)
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn total_batches(&self) -> u64 {
        self.total_batches
    }
}

impl Default for LinkEstimator {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ────────────────────────────────────────────────────────
