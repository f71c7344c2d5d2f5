//! Retry delays for transient store failures
//!
//! The delay for attempt `n` (0-based) is `initial × multiplier^n`, capped at
//! `max`. With jitter enabled the result is drawn uniformly from
//! `[delay/2, delay]` so competing consumers do not retry in lockstep.

use std::time::Duration;

use rand::Rng;

use crate::config::BackoffConfig;

/// Capped exponential backoff
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from(&BackoffConfig::default())
    }
}

impl From<&BackoffConfig> for Backoff {
    fn from(config: &BackoffConfig) -> Self {
        Self {
            initial: Duration::from_millis(config.initial_ms),
            max: Duration::from_millis(config.max_ms),
            multiplier: config.multiplier,
            jitter: config.jitter,
        }
    }
}

impl Backoff {
    /// Delay before retry number `attempt`
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if !self.jitter {
            return base;
        }

        let ms = base.as_millis() as u64;
        let half = ms / 2;
        if half == 0 {
            return base;
        }
        Duration::from_millis(half + rand::rng().random_range(0..=ms - half))
    }

    fn base_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.min(i32::MAX as u32) as i32;
        let secs = self.initial.as_secs_f64() * self.multiplier.powi(exp);
        if !secs.is_finite() || secs < 0.0 || secs > self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}
