//! Congestion control and pacing.
//!
//! Implements the Timely RTT-gradient rate controller and a simple pacer
//! that turns its rate into per-packet transmit times.

use crate::config::TimelyConfig;

/// Timely congestion control state.
///
/// Timely is an RTT-based congestion control algorithm that adjusts the
/// sending rate based on observed RTT variations.
///
/// Reference: Timely: RTT-based Congestion Control for the Datacenter (SIGCOMM 2015)
#[derive(Debug, Clone)]
pub struct Timely {
    config: TimelyConfig,
    /// Current sending rate in bytes/sec.
    rate: f64,
    /// Previous RTT sample in microseconds.
    prev_rtt: f64,
    /// EWMA of RTT differences.
    avg_rtt_diff: f64,
    /// Consecutive updates with a non-positive gradient.
    neg_gradient_count: usize,
    last_update_time: f64,
}

impl Timely {
    /// Create a new controller. The rate starts at the configured maximum.
    pub fn new(config: TimelyConfig) -> Self {
        Self {
            rate: config.max_rate,
            prev_rtt: 0.0,
            avg_rtt_diff: 0.0,
            neg_gradient_count: 0,
            last_update_time: 0.0,
            config,
        }
    }

    /// Get the current sending rate in bytes/sec.
    #[inline]
    pub fn rate(&self) -> f64 {
        self.rate
    }

    #[inline]
    pub fn prev_rtt(&self) -> f64 {
        self.prev_rtt
    }

    #[inline]
    pub fn avg_rtt_diff(&self) -> f64 {
        self.avg_rtt_diff
    }

    #[inline]
    pub fn neg_gradient_count(&self) -> usize {
        self.neg_gradient_count
    }

    #[inline]
    pub fn last_update_time(&self) -> f64 {
        self.last_update_time
    }

    pub fn config(&self) -> &TimelyConfig {
        &self.config
    }

    /// Feed one RTT sample (µs) taken at `cur_time` (µs).
    ///
    /// Non-finite samples are ignored.
    pub fn update_rate(&mut self, sample_rtt: f64, cur_time: f64) {
        if !sample_rtt.is_finite() {
            return;
        }
        let c = &self.config;

        let rtt_diff = sample_rtt - self.prev_rtt;
        self.avg_rtt_diff = (1.0 - c.ewma_alpha) * self.avg_rtt_diff + c.ewma_alpha * rtt_diff;
        let normalized_gradient = self.avg_rtt_diff / c.min_rtt_us;

        let new_rate = if sample_rtt < c.t_low_us {
            self.rate + c.add_rate
        } else if sample_rtt > c.t_high_us {
            self.rate * (1.0 - c.decrease_factor * (1.0 - c.t_high_us / sample_rtt))
        } else if normalized_gradient <= 0.0 {
            self.neg_gradient_count += 1;
            let step = if self.neg_gradient_count >= c.hai_thresh {
                c.hai_multiplier * c.add_rate
            } else {
                c.add_rate
            };
            self.rate + step
        } else {
            self.neg_gradient_count = 0;
            self.rate * (1.0 - normalized_gradient.min(1.0) * c.decrease_factor)
        };

        self.rate = new_rate.clamp(c.min_rate, c.max_rate);
        self.prev_rtt = sample_rtt;
        self.last_update_time = cur_time;
    }
}

/// Spaces packets so a session does not exceed its Timely rate.
#[derive(Debug, Clone, Default)]
pub struct Pacer {
    /// Earliest time (µs) the next packet may leave.
    next_tx_us: f64,
}

impl Pacer {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn is_ready(&self, now_us: f64) -> bool {
        now_us >= self.next_tx_us
    }

    #[inline]
    pub fn next_tx_us(&self) -> f64 {
        self.next_tx_us
    }

    /// Account for `bytes` leaving at `now_us` under `rate` bytes/sec.
    pub fn on_send(&mut self, bytes: usize, rate: f64, now_us: f64) {
        let start = self.next_tx_us.max(now_us);
        self.next_tx_us = start + bytes as f64 / rate * 1e6;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timely() -> Timely {
        Timely::new(TimelyConfig::default())
    }

    #[test]
    fn test_starts_at_max_rate() {
        let t = timely();
        assert_eq!(t.rate(), TimelyConfig::default().max_rate);
    }

    #[test]
    fn test_low_rtt_increases_up_to_max() {
        let config = TimelyConfig::default();
        let mut t = timely();

        t.update_rate(200.0, 1.0);
        let reduced = t.rate();
        t.update_rate(10.0, 2.0);
        assert_eq!(t.rate(), (reduced + config.add_rate).min(config.max_rate));

        for i in 0..10_000 {
            t.update_rate(10.0, i as f64);
        }
        assert_eq!(t.rate(), config.max_rate);
    }

    #[test]
    fn test_high_rtt_decreases() {
        let config = TimelyConfig::default();
        let mut t = timely();

        t.update_rate(2000.0, 1.0);
        let expected = config.max_rate * (1.0 - 0.8 * (1.0 - 1000.0 / 2000.0));
        assert!((t.rate() - expected).abs() < 1.0);
        assert_eq!(t.prev_rtt(), 2000.0);
        assert_eq!(t.last_update_time(), 1.0);
    }

    #[test]
    fn test_sustained_congestion_hits_min_rate() {
        let config = TimelyConfig::default();
        let mut t = timely();

        for i in 0..1000 {
            t.update_rate(1_000_000.0, i as f64);
        }
        assert_eq!(t.rate(), config.min_rate);
    }

    #[test]
    fn test_rising_gradient_decreases() {
        let mut t = timely();
        t.update_rate(100.0, 0.0);
        let before = t.rate();
        t.update_rate(400.0, 1.0);
        assert!(t.rate() < before);
        assert_eq!(t.neg_gradient_count(), 0);
    }

    #[test]
    fn test_hyperactive_increase() {
        let config = TimelyConfig {
            max_rate: 1e12,
            ..TimelyConfig::default()
        };
        let mut t = Timely::new(config);
        // Drive the rate below max, then settle the gradient negative.
        for i in 0..50 {
            t.update_rate(900.0 - i as f64, i as f64);
        }
        t.update_rate(2000.0, 100.0);
        let mut prev = t.rate();
        let mut steps = Vec::new();
        for i in 0..(config.hai_thresh + 2) {
            t.update_rate(100.0, 200.0 + i as f64);
            steps.push(t.rate() - prev);
            prev = t.rate();
        }
        assert!(t.neg_gradient_count() >= config.hai_thresh);
        let last = steps[steps.len() - 1];
        assert!((last - config.hai_multiplier * config.add_rate).abs() < 1.0);
    }

    #[test]
    fn test_ignores_non_finite() {
        let mut t = timely();
        t.update_rate(f64::NAN, 1.0);
        t.update_rate(f64::INFINITY, 2.0);
        assert_eq!(t.rate(), TimelyConfig::default().max_rate);
        assert_eq!(t.last_update_time(), 0.0);
    }

    #[test]
    fn test_pacer_spacing() {
        let mut p = Pacer::new();
        assert!(p.is_ready(0.0));

        // 1000 bytes at 1 MB/s takes 1000 µs.
        p.on_send(1000, 1e6, 10.0);
        assert_eq!(p.next_tx_us(), 1010.0);
        assert!(!p.is_ready(500.0));
        assert!(p.is_ready(1010.0));

        // Back-to-back sends queue behind each other.
        p.on_send(1000, 1e6, 10.0);
        assert_eq!(p.next_tx_us(), 2010.0);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn rate_stays_within_bounds(samples in prop::collection::vec(0.0f64..1e7, 1..200)) {
                let config = TimelyConfig::default();
                let mut t = Timely::new(config);
                for (i, rtt) in samples.into_iter().enumerate() {
                    t.update_rate(rtt, i as f64);
                    prop_assert!(t.rate() >= config.min_rate);
                    prop_assert!(t.rate() <= config.max_rate);
                }
            }
        }
    }
}
