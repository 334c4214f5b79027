//! Host backoff.
//!
//! After the `n`th consecutive failure a host is left alone for
//! `min(base * 2^(n-1), max)`. With the defaults (30 minutes, 12 hours):
//!
//! | failure | delay |
//! |---------|-------|
//! | 1       | 30 m  |
//! | 2       | 1 h   |
//! | 3       | 2 h   |
//! | 4       | 4 h   |
//! | 5       | 8 h   |
//! | 6+      | 12 h  |

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "defaults::base_retry_delay_secs")]
    pub base_retry_delay_secs: u64,

    /// Cap on the exponential growth.
    #[serde(default = "defaults::max_retry_delay_secs")]
    pub max_retry_delay_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_retry_delay_secs: defaults::base_retry_delay_secs(),
            max_retry_delay_secs: defaults::max_retry_delay_secs(),
        }
    }
}

impl RetryPolicy {
    /// Delay after `failures` consecutive failures (counting from 1; zero
    /// is treated as one).
    #[must_use]
    pub fn delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(63);
        let secs = self
            .base_retry_delay_secs
            .saturating_mul(1u64 << exponent)
            .min(self.max_retry_delay_secs);
        Duration::from_secs(secs)
    }

    /// When the next attempt is due, counted from `now`.
    #[must_use]
    pub fn next_attempt(&self, failures: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = TimeDelta::from_std(self.delay(failures)).unwrap_or(TimeDelta::MAX);
        now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

mod defaults {
    pub const fn base_retry_delay_secs() -> u64 {
        30 * 60
    }

    pub const fn max_retry_delay_secs() -> u64 {
        12 * 60 * 60
    }
}
