use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{dns::DnsConfig, policy::RetryPolicy, timeouts::SmtpTimeouts};

/// Shortest lease that still leaves a whole second between renewals.
const MIN_LEASE_SECS: u64 = 2;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("lease_secs must be at least 2, got {0}")]
    LeaseTooShort(u64),

    #[error("dns.min_cache_ttl_secs ({min}) is greater than dns.max_cache_ttl_secs ({max})")]
    CacheTtlBounds { min: u64, max: u64 },
}

/// Tuning for the delivery engine.
///
/// ```ron
/// delivery: (
///     hostname: "relay.example.com",
///     lease_secs: 120,
///     max_host_failures: 8,
///     idle_timeout_secs: 300,
///     retry: (base_retry_delay_secs: 1800, max_retry_delay_secs: 43200),
/// )
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Name announced in EHLO/HELO.
    #[serde(default = "default_hostname")]
    pub hostname: String,

    /// How long a claimed host stays leased without renewal.
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,

    /// A host that fails more often than this in a row is purged along
    /// with everything queued for it.
    #[serde(default = "default_max_host_failures")]
    pub max_host_failures: u32,

    #[serde(default = "default_max_item_attempts")]
    pub max_item_attempts: u32,

    /// How long an open session waits for more mail before QUIT.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Skip certificate verification during STARTTLS. Many receiving
    /// hosts present self-signed certificates.
    #[serde(default)]
    pub accept_invalid_certs: bool,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub dns: DnsConfig,

    #[serde(default)]
    pub smtp_timeouts: SmtpTimeouts,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            lease_secs: default_lease_secs(),
            max_host_failures: default_max_host_failures(),
            max_item_attempts: default_max_item_attempts(),
            idle_timeout_secs: default_idle_timeout_secs(),
            poll_interval_secs: default_poll_interval_secs(),
            accept_invalid_certs: false,
            port: default_port(),
            retry: RetryPolicy::default(),
            dns: DnsConfig::default(),
            smtp_timeouts: SmtpTimeouts::default(),
        }
    }
}

impl DeliveryConfig {
    /// Rejects settings the engine cannot run with.
    pub const fn validate(&self) -> Result<(), ConfigError> {
        if self.lease_secs < MIN_LEASE_SECS {
            return Err(ConfigError::LeaseTooShort(self.lease_secs));
        }
        if self.dns.min_cache_ttl_secs > self.dns.max_cache_ttl_secs {
            return Err(ConfigError::CacheTtlBounds {
                min: self.dns.min_cache_ttl_secs,
                max: self.dns.max_cache_ttl_secs,
            });
        }
        Ok(())
    }

    #[must_use]
    pub const fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Never zero, so interval timers can be built from it.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}

fn default_hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

const fn default_lease_secs() -> u64 {
    120
}

const fn default_max_host_failures() -> u32 {
    8
}

const fn default_max_item_attempts() -> u32 {
    10
}

const fn default_idle_timeout_secs() -> u64 {
    300
}

const fn default_poll_interval_secs() -> u64 {
    2
}

const fn default_port() -> u16 {
    25
}
