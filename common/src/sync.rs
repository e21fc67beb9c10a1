//! Clock-synchronization math for the SyncPing/SyncPong exchange.
//!
//! The controller stamps a ping with its monotonic send time; the device
//! stamps receive and send times into the pong.  From the four timestamps
//! the controller derives round-trip time and an estimated offset between
//! the two clocks, assuming symmetric transit.  Samples with an implausibly
//! large RTT are discarded, and only the minimum-RTT sample within a recent
//! window is trusted; minimum RTT best approximates symmetric transit.

use std::collections::VecDeque;
use std::time::Instant;

/// Monotonic millisecond clock, owned explicitly by whoever needs it
/// rather than living in process-global state.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    start: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Milliseconds since this clock was created.
    pub fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

/// One completed ping/pong exchange.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncSample {
    pub rtt_ms: f64,
    pub offset_ms: f64,
}

/// Derive a sample from the four exchange timestamps (all in ms).
///
/// Server processing time (`server_send - server_receive`) is excluded from
/// the RTT; the offset assumes the remaining transit is symmetric.
pub fn compute_sample(
    client_send: u64,
    server_receive: u64,
    server_send: u64,
    client_receive: u64,
) -> SyncSample {
    let total = client_receive.saturating_sub(client_send) as f64;
    let processing = server_send.saturating_sub(server_receive) as f64;
    let rtt_ms = (total - processing).max(0.0);
    let offset_ms = server_receive as f64 - client_send as f64 - rtt_ms / 2.0;
    SyncSample { rtt_ms, offset_ms }
}

/// Sliding-window offset estimator with outlier rejection.
#[derive(Debug)]
pub struct OffsetEstimator {
    window: VecDeque<SyncSample>,
    capacity: usize,
    rtt_limit_ms: f64,
}

impl OffsetEstimator {
    pub fn new(capacity: usize, rtt_limit_ms: f64) -> Self {
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity,
            rtt_limit_ms,
        }
    }

    /// Feed a sample.  Returns `false` when the sample was rejected as an
    /// RTT outlier (rejection is silent by design, never user-surfaced).
    pub fn add_sample(&mut self, sample: SyncSample) -> bool {
        if sample.rtt_ms > self.rtt_limit_ms {
            return false;
        }
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(sample);
        true
    }

    /// Offset of the minimum-RTT sample in the window, if any.
    pub fn offset_ms(&self) -> Option<f64> {
        self.best_sample().map(|s| s.offset_ms)
    }

    /// RTT of the best (minimum-RTT) sample in the window.
    pub fn best_rtt_ms(&self) -> Option<f64> {
        self.best_sample().map(|s| s.rtt_ms)
    }

    pub fn sample_count(&self) -> usize {
        self.window.len()
    }

    fn best_sample(&self) -> Option<&SyncSample> {
        self.window
            .iter()
            .min_by(|a, b| a.rtt_ms.total_cmp(&b.rtt_ms))
    }
}

// ─── tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_sample_symmetric_channel() {
        // 20 ms each way, server clock 500 ms ahead, 1 ms processing.
        let sample = compute_sample(1000, 1520, 1521, 1041);
        assert_eq!(sample.rtt_ms, 40.0);
        assert_eq!(sample.offset_ms, 500.0);
    }

    #[test]
    fn test_estimator_converges_on_fixed_latency_channel() {
        // Constant 20 ms one-way latency, true offset +500 ms, with some
        // asymmetric jitter mixed in.  Min-RTT selection should land within
        // ±5 ms of the true offset.
        let mut est = OffsetEstimator::new(30, 250.0);
        let jitter = [13_u64, 2, 27, 0, 9, 4, 31, 1, 16, 5];
        let mut t = 10_000u64;
        for j in jitter {
            let send = t;
            let srv_recv = send + 20 + j + 500;
            let srv_send = srv_recv + 1;
            let recv = send + 20 + j + 20 + 1; // return leg stays 20 ms
            assert!(est.add_sample(compute_sample(send, srv_recv, srv_send, recv)));
            t += 1000;
        }
        let offset = est.offset_ms().unwrap();
        assert!(
            (offset - 500.0).abs() <= 5.0,
            "offset {offset} not within ±5 ms of 500"
        );
    }

    #[test]
    fn test_rtt_outliers_are_rejected() {
        let mut est = OffsetEstimator::new(10, 250.0);
        assert!(est.add_sample(compute_sample(0, 520, 521, 41)));
        // A 600 ms round trip exceeds the sanity bound.
        assert!(!est.add_sample(compute_sample(0, 800, 801, 601)));
        assert_eq!(est.sample_count(), 1);
    }

    #[test]
    fn test_window_is_bounded() {
        let mut est = OffsetEstimator::new(3, 250.0);
        for i in 0..10u64 {
            est.add_sample(compute_sample(i * 1000, i * 1000 + 20, i * 1000 + 21, i * 1000 + 41));
        }
        assert_eq!(est.sample_count(), 3);
    }
}
