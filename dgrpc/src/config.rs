//! Configuration types for the datapath.
//!
//! All tunables are carried by value into the engine and its controllers,
//! so independently tuned instances can coexist in one process.

use crate::error::{Error, Result};
use crate::packet::MAX_PKT_NUM;

/// Constants of the Timely rate controller.
///
/// Units: microseconds for time, bytes/sec for rates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimelyConfig {
    /// EWMA weight of a new RTT gradient sample.
    pub ewma_alpha: f64,
    /// Baseline RTT used to normalize the gradient.
    pub min_rtt_us: f64,
    /// Below this RTT the rate always increases additively.
    pub t_low_us: f64,
    /// Above this RTT the rate always decreases multiplicatively.
    pub t_high_us: f64,
    pub decrease_factor: f64,
    /// Consecutive non-positive gradients before hyperactive increase.
    pub hai_thresh: usize,
    /// Multiple of `add_rate` applied in hyperactive increase.
    pub hai_multiplier: f64,
    pub max_rate: f64,
    pub min_rate: f64,
    pub add_rate: f64,
}

impl Default for TimelyConfig {
    fn default() -> Self {
        Self {
            ewma_alpha: 0.02,
            min_rtt_us: 2.0,
            t_low_us: 50.0,
            t_high_us: 1000.0,
            decrease_factor: 0.8,
            hai_thresh: 5,
            hai_multiplier: 5.0,
            // 5 GB/s (40 Gbps) down to an arbitrary 5 MB/s floor
            max_rate: 5.0 * 1000.0 * 1000.0 * 1000.0,
            min_rate: 5.0 * 1000.0 * 1000.0,
            add_rate: 5.0 * 1000.0 * 1000.0,
        }
    }
}

/// RPC engine configuration.
#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// Request window size (number of slots per session).
    /// Default: 8
    pub req_window: usize,
    /// Session credits (request packets in flight per session).
    /// Default: 8
    pub session_credits: usize,
    /// Maximum number of sessions.
    /// Default: 256
    pub max_sessions: usize,
    /// Enable Timely congestion control and rate pacing.
    /// Default: false
    pub enable_cc: bool,
    /// Maximum packets drained from the transport per event-loop pass.
    /// Default: 32
    pub rx_batch: usize,
    /// Largest message a buffer may be allocated for.
    /// Default: 8 MiB
    pub max_msg_size: usize,
    /// Timely constants, used when `enable_cc` is set.
    pub timely: TimelyConfig,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            req_window: 8,
            session_credits: 8,
            max_sessions: 256,
            enable_cc: false,
            rx_batch: 32,
            max_msg_size: 8 * 1024 * 1024,
            timely: TimelyConfig::default(),
        }
    }
}

impl RpcConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the request window size.
    pub fn with_req_window(mut self, req_window: usize) -> Self {
        self.req_window = req_window;
        self
    }

    /// Set the session credits.
    pub fn with_session_credits(mut self, session_credits: usize) -> Self {
        self.session_credits = session_credits;
        self
    }

    /// Set the maximum number of sessions.
    pub fn with_max_sessions(mut self, max_sessions: usize) -> Self {
        self.max_sessions = max_sessions;
        self
    }

    /// Enable or disable Timely congestion control.
    pub fn with_cc(mut self, enable_cc: bool) -> Self {
        self.enable_cc = enable_cc;
        self
    }

    /// Set the receive batch size.
    pub fn with_rx_batch(mut self, rx_batch: usize) -> Self {
        self.rx_batch = rx_batch;
        self
    }

    /// Set the maximum message size.
    pub fn with_max_msg_size(mut self, max_msg_size: usize) -> Self {
        self.max_msg_size = max_msg_size;
        self
    }

    /// Replace the Timely constants.
    pub fn with_timely(mut self, timely: TimelyConfig) -> Self {
        self.timely = timely;
        self
    }

    /// Check the configuration for values the datapath cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.req_window == 0 {
            return Err(Error::InvalidConfig("req_window cannot be 0".into()));
        }
        if self.session_credits == 0 || self.session_credits > MAX_PKT_NUM as usize {
            return Err(Error::InvalidConfig(format!(
                "session_credits must be in 1..={}, got {}",
                MAX_PKT_NUM, self.session_credits
            )));
        }
        if self.max_sessions == 0 || self.max_sessions > u16::MAX as usize {
            return Err(Error::InvalidConfig(format!(
                "max_sessions must be in 1..={}, got {}",
                u16::MAX,
                self.max_sessions
            )));
        }
        if self.rx_batch == 0 {
            return Err(Error::InvalidConfig("rx_batch cannot be 0".into()));
        }
        let t = &self.timely;
        if !(t.min_rate > 0.0 && t.min_rate <= t.max_rate) {
            return Err(Error::InvalidConfig(format!(
                "timely rate bounds are inconsistent: [{}, {}]",
                t.min_rate, t.max_rate
            )));
        }
        if !(t.t_low_us < t.t_high_us) || t.min_rtt_us <= 0.0 {
            return Err(Error::InvalidConfig(
                "timely thresholds require 0 < min_rtt and t_low < t_high".into(),
            ));
        }
        Ok(())
    }
}
