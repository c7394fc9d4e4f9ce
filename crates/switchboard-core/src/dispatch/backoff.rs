//! Exponential backoff between same-provider retries.

use std::time::Duration;

use switchboard_types::config::BackoffConfig;

#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    base: Duration,
    max: Duration,
    jitter_ratio: f64,
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration, jitter_ratio: f64) -> Self {
        Self {
            base,
            max: max.max(base),
            jitter_ratio: jitter_ratio.clamp(0.0, 1.0),
        }
    }

    pub fn from_config(config: &BackoffConfig) -> Self {
        Self::new(
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
            config.jitter_ratio,
        )
    }

    /// Delay before retry number `retry` (0 for the first retry).
    ///
    /// `base * 2^retry`, capped at the maximum, plus up to `jitter_ratio` of
    /// itself. A provider-supplied Retry-After is a lower bound.
    pub fn delay(&self, retry: u32, retry_after: Option<Duration>) -> Duration {
        let exp = self
            .base
            .checked_mul(1u32.checked_shl(retry).unwrap_or(u32::MAX))
            .unwrap_or(self.max)
            .min(self.max);
        let jitter = if self.jitter_ratio > 0.0 {
            exp.mul_f64(self.jitter_ratio * rand::random::<f64>())
        } else {
            Duration::ZERO
        };
        let delay = exp + jitter;
        match retry_after {
            Some(hint) => delay.max(hint),
            None => delay,
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&BackoffConfig::default())
    }
}
