//! Retry backoff policy for failed reconciliations.
//!
//! A namespace whose reconciliation fails transiently is re-queued after
//! [`BackoffConfig::delay_for_attempt`] for its consecutive failure count. The
//! count resets on the first success.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Backoff configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackoffConfig {
    /// Fixed delay between retries.
    Fixed {
        /// Delay duration.
        #[serde(with = "humantime_serde")]
        delay: Duration,
    },

    /// Exponential backoff.
    Exponential {
        /// Delay before the first retry.
        #[serde(with = "humantime_serde")]
        initial_delay: Duration,

        /// Maximum delay.
        #[serde(with = "humantime_serde")]
        max_delay: Duration,

        /// Multiplier for each retry (default: 2.0).
        #[serde(default = "default_multiplier")]
        multiplier: f64,
    },

    /// Linear backoff.
    Linear {
        /// Delay before the first retry.
        #[serde(with = "humantime_serde")]
        initial_delay: Duration,

        /// Increment per retry.
        #[serde(with = "humantime_serde")]
        increment: Duration,

        /// Maximum delay.
        #[serde(with = "humantime_serde")]
        max_delay: Duration,
    },
}

const fn default_multiplier() -> f64 {
    2.0
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::Exponential {
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(30),
            multiplier: default_multiplier(),
        }
    }
}

impl BackoffConfig {
    /// Calculate the delay for a given attempt number (1-based; 0 is treated
    /// as 1).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let step = attempt.saturating_sub(1);
        match self {
            Self::Fixed { delay } => *delay,
            Self::Exponential {
                initial_delay,
                max_delay,
                multiplier,
            } => {
                let exponent = i32::try_from(step).unwrap_or(i32::MAX);
                let delay_secs = initial_delay.as_secs_f64() * multiplier.powi(exponent);
                Duration::try_from_secs_f64(delay_secs)
                    .map_or(*max_delay, |delay| delay.min(*max_delay))
            },
            Self::Linear {
                initial_delay,
                increment,
                max_delay,
            } => increment
                .checked_mul(step)
                .and_then(|extra| initial_delay.checked_add(extra))
                .map_or(*max_delay, |delay| delay.min(*max_delay)),
        }
    }

    /// Returns the largest delay this policy can produce.
    #[must_use]
    pub const fn max_delay(&self) -> Duration {
        match self {
            Self::Fixed { delay } => *delay,
            Self::Exponential { max_delay, .. } | Self::Linear { max_delay, .. } => *max_delay,
        }
    }
}
