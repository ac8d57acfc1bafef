//! Passive network quality estimation from chunk arrivals.

use std::collections::VecDeque;
use std::time::Instant;

/// Latency samples kept for the rolling window
const LATENCY_WINDOW: usize = 20;
/// Delivery ratio treated as lossless
const NOMINAL_DELIVERY_RATIO: f64 = 0.8;
/// Ceiling on the reported loss estimate
const MAX_PACKET_LOSS_PCT: f64 = 20.0;

/// Snapshot of current network conditions.
#[derive(Clone, Debug, Default, serde::Serialize)]
pub struct NetworkStats {
    pub average_latency_ms: f64,
    pub jitter_ms: f64,
    pub packet_loss_pct: f64,
    pub buffer_depth: usize,
    pub queued_chunks: usize,
}

pub struct NetworkQualityEstimator {
    latencies: VecDeque<f64>,
    last_arrival: Option<Instant>,
    sent: u64,
    received: u64,
}

impl NetworkQualityEstimator {
    pub fn new() -> Self {
        Self {
            latencies: VecDeque::with_capacity(LATENCY_WINDOW),
            last_arrival: None,
            sent: 0,
            received: 0,
        }
    }

    /// Record an inbound chunk; the gap since the previous arrival is the
    /// latency sample.
    pub fn record_arrival(&mut self, at: Instant) {
        if let Some(last) = self.last_arrival {
            let gap_ms = at.duration_since(last).as_secs_f64() * 1000.0;
            self.observe_latency_ms(gap_ms);
        }
        self.last_arrival = Some(at);
        self.received += 1;
    }

    /// Push one latency sample into the rolling window.
    pub fn observe_latency_ms(&mut self, ms: f64) {
        if self.latencies.len() == LATENCY_WINDOW {
            self.latencies.pop_front();
        }
        self.latencies.push_back(ms);
    }

    /// Record an outbound frame the server is expected to answer.
    pub fn record_sent(&mut self) {
        self.sent += 1;
    }

    /// Mean inter-arrival latency over the window.
    pub fn average_latency_ms(&self) -> f64 {
        if self.latencies.is_empty() {
            return 0.0;
        }
        self.latencies.iter().sum::<f64>() / self.latencies.len() as f64
    }

    /// Jitter as the population standard deviation of the latency window.
    pub fn jitter_ms(&self) -> f64 {
        if self.latencies.is_empty() {
            return 0.0;
        }
        let mean = self.average_latency_ms();
        let variance = self
            .latencies
            .iter()
            .map(|l| (l - mean).powi(2))
            .sum::<f64>()
            / self.latencies.len() as f64;
        variance.sqrt()
    }

    /// Loss estimate from the expected/received ratio, capped. The server
    /// is not expected to answer every frame, so the ratio is judged
    /// against a nominal delivery ratio rather than 1.0.
    pub fn packet_loss_pct(&self) -> f64 {
        if self.sent == 0 {
            return 0.0;
        }
        let ratio = self.received as f64 / self.sent as f64;
        if ratio >= NOMINAL_DELIVERY_RATIO {
            return 0.0;
        }
        let loss = (NOMINAL_DELIVERY_RATIO - ratio) / NOMINAL_DELIVERY_RATIO * 100.0;
        loss.min(MAX_PACKET_LOSS_PCT)
    }

    pub fn snapshot(&self, buffer_depth: usize, queued_chunks: usize) -> NetworkStats {
        NetworkStats {
            average_latency_ms: self.average_latency_ms(),
            jitter_ms: self.jitter_ms(),
            packet_loss_pct: self.packet_loss_pct(),
            buffer_depth,
            queued_chunks,
        }
    }

    /// Drop counters at the start of a fresh measurement interval.
    pub fn reset_interval(&mut self) {
        self.sent = 0;
        self.received = 0;
    }

    pub fn reset(&mut self) {
        self.latencies.clear();
        self.last_arrival = None;
        self.sent = 0;
        self.received = 0;
    }
}

impl Default for NetworkQualityEstimator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn with_latencies(samples: &[f64]) -> NetworkQualityEstimator {
        let mut est = NetworkQualityEstimator::new();
        for &s in samples {
            est.observe_latency_ms(s);
        }
        est
    }

    #[test]
    fn test_empty_window_reports_zero() {
        let est = NetworkQualityEstimator::new();
        assert_eq!(est.average_latency_ms(), 0.0);
        assert_eq!(est.jitter_ms(), 0.0);
        assert_eq!(est.packet_loss_pct(), 0.0);
    }

    #[test]
    fn test_mean_and_population_stddev() {
        let est = with_latencies(&[40.0, 45.0, 42.0, 140.0, 48.0]);
        assert!((est.average_latency_ms() - 63.0).abs() < 1e-9);
        // Population variance 1489.6, stddev ~38.6
        assert!((est.jitter_ms() - 1489.6f64.sqrt()).abs() < 1e-9);
    }

    #[test]
    fn test_steady_arrivals_have_zero_jitter() {
        let est = with_latencies(&[50.0; 10]);
        assert_eq!(est.average_latency_ms(), 50.0);
        assert_eq!(est.jitter_ms(), 0.0);
    }

    #[test]
    fn test_window_caps_at_twenty() {
        let mut est = NetworkQualityEstimator::new();
        for i in 0..30 {
            est.observe_latency_ms(i as f64);
        }
        // Only samples 10..30 remain
        assert!((est.average_latency_ms() - 19.5).abs() < 1e-9);
    }

    #[test]
    fn test_arrival_gap_becomes_latency_sample() {
        let mut est = NetworkQualityEstimator::new();
        let t0 = Instant::now();
        est.record_arrival(t0);
        assert_eq!(est.average_latency_ms(), 0.0);

        est.record_arrival(t0 + Duration::from_millis(40));
        assert!((est.average_latency_ms() - 40.0).abs() < 0.5);
    }

    #[test]
    fn test_loss_estimate_capped() {
        let mut est = NetworkQualityEstimator::new();
        for _ in 0..100 {
            est.record_sent();
        }
        // Nothing received: raw estimate would be 100%
        assert_eq!(est.packet_loss_pct(), 20.0);
    }

    #[test]
    fn test_interval_reset_unsticks_loss_estimate() {
        let mut est = NetworkQualityEstimator::new();

        // A long listening stretch: many frames out, nothing back
        for _ in 0..200 {
            est.record_sent();
        }
        assert_eq!(est.packet_loss_pct(), 20.0);

        // New interval with a healthy exchange must not inherit the
        // lifetime ratio
        est.reset_interval();
        let t = Instant::now();
        for i in 0..5u64 {
            est.record_sent();
            est.record_arrival(t + Duration::from_millis(i * 10));
        }
        assert_eq!(est.packet_loss_pct(), 0.0);
        // Latency window survives the interval reset
        assert!(est.average_latency_ms() > 0.0);
    }

    #[test]
    fn test_healthy_ratio_reports_no_loss() {
        let mut est = NetworkQualityEstimator::new();
        let t = Instant::now();
        for i in 0..10u64 {
            est.record_sent();
            if i < 9 {
                est.record_arrival(t + Duration::from_millis(i * 10));
            }
        }
        assert_eq!(est.packet_loss_pct(), 0.0);
    }
}
