//! Retry timing for deferred deliveries
//!
//! Workers compute the defer TTL they report alongside a temporary
//! failure; the queue only stores whatever TTL it is handed. Exponential
//! backoff with jitter keeps a remote outage from re-synchronizing the
//! whole queue into one thundering retry.

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Retry policy for temporary failures
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts before the delivery is bounced instead of deferred
    #[serde(default = "defaults::max_attempts")]
    pub max_attempts: u32,

    /// Base delay in seconds; attempt `n` waits `base * 2^(n-1)`
    #[serde(default = "defaults::base_delay_secs")]
    pub base_delay_secs: u64,

    /// Backoff cap in seconds
    #[serde(default = "defaults::max_delay_secs")]
    pub max_delay_secs: u64,

    /// Randomization factor, ±fraction of the computed delay
    #[serde(default = "defaults::jitter_factor")]
    pub jitter_factor: f64,
}

mod defaults {
    pub const fn max_attempts() -> u32 {
        25
    }

    pub const fn base_delay_secs() -> u64 {
        300
    }

    pub const fn max_delay_secs() -> u64 {
        86_400
    }

    pub const fn jitter_factor() -> f64 {
        0.1
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: defaults::max_attempts(),
            base_delay_secs: defaults::base_delay_secs(),
            max_delay_secs: defaults::max_delay_secs(),
            jitter_factor: defaults::jitter_factor(),
        }
    }
}

impl RetryPolicy {
    /// Whether another attempt is allowed after `attempt_count` tries
    #[must_use]
    pub const fn should_retry(&self, attempt_count: u32) -> bool {
        attempt_count < self.max_attempts
    }

    /// Defer TTL in milliseconds for the given attempt (1-indexed)
    #[must_use]
    pub fn defer_ttl_ms(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1);
        let delay_secs = if exponent >= 63 {
            self.max_delay_secs
        } else {
            self.base_delay_secs
                .saturating_mul(1_u64 << exponent)
                .min(self.max_delay_secs)
        };

        #[allow(
            clippy::cast_precision_loss,
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss
        )]
        let jittered = {
            let range = (delay_secs as f64) * self.jitter_factor;
            if range > 0.0 {
                let jitter: f64 = rand::rng().random_range(-range..=range);
                ((delay_secs as f64) + jitter).max(0.0) as u64
            } else {
                delay_secs
            }
        };

        jittered.saturating_mul(1000)
    }
}
