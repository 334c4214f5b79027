//! Mail server resolution.
//!
//! MX answers are cached per domain using the record TTL, clamped to the
//! configured bounds. A domain without usable MX records resolves to
//! itself, which covers hosts that only publish an A record. Fallbacks are
//! never cached so a transient failure is retried on the next attempt.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use dashmap::DashMap;
use hickory_resolver::{
    TokioResolver, config::ResolverOpts, name_server::TokioConnectionProvider,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Why an MX lookup produced no answer. [`MailServerResolver`] turns every
/// one of these into a fallback to the host itself.
#[derive(Debug, Error)]
pub enum DnsError {
    /// The domain exists but publishes no MX records, or does not exist.
    #[error("No MX records for {0}")]
    NoRecords(String),

    /// The resolver gave up, for example on SERVFAIL or a network error.
    #[error("DNS lookup failed: {0}")]
    LookupFailed(#[from] hickory_resolver::ResolveError),

    /// No answer within [`DnsConfig::timeout_secs`].
    #[error("DNS query timed out for {0}")]
    Timeout(String),
}

/// ```ron
/// dns: (
///     timeout_secs: 5,
///     min_cache_ttl_secs: 60,
///     max_cache_ttl_secs: 3600,
/// )
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsConfig {
    /// Per lookup. A slow answer is treated like a failed one.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Floor for cached answers, whatever the record TTL says.
    #[serde(default = "default_min_cache_ttl_secs")]
    pub min_cache_ttl_secs: u64,

    /// Ceiling for cached answers. Must not be below the floor.
    #[serde(default = "default_max_cache_ttl_secs")]
    pub max_cache_ttl_secs: u64,
}

const fn default_timeout_secs() -> u64 {
    5
}

const fn default_min_cache_ttl_secs() -> u64 {
    60
}

const fn default_max_cache_ttl_secs() -> u64 {
    3600
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            min_cache_ttl_secs: default_min_cache_ttl_secs(),
            max_cache_ttl_secs: default_max_cache_ttl_secs(),
        }
    }
}

/// One MX record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MxRecord {
    /// The exchanger's name, possibly with a trailing dot.
    pub exchange: String,
    /// Lower is preferred.
    pub preference: u16,
}

impl MxRecord {
    pub fn new(exchange: impl Into<String>, preference: u16) -> Self {
        Self {
            exchange: exchange.into(),
            preference,
        }
    }
}

/// Everything one lookup returned for a domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MxAnswer {
    pub records: Vec<MxRecord>,
    /// Smallest TTL among the records, in seconds.
    pub ttl: u32,
}

/// Source of MX answers. The system resolver implements this; tests
/// substitute a static table.
#[async_trait]
pub trait MxLookup: Send + Sync {
    /// All MX records for `domain`, in whatever order the source returns them.
    async fn lookup_mx(&self, domain: &str) -> Result<MxAnswer, DnsError>;
}

#[async_trait]
impl MxLookup for TokioResolver {
    async fn lookup_mx(&self, domain: &str) -> Result<MxAnswer, DnsError> {
        let lookup = match self.mx_lookup(domain).await {
            Ok(lookup) => lookup,
            Err(err) if err.is_no_records_found() => {
                return Err(DnsError::NoRecords(domain.to_string()));
            }
            Err(err) => return Err(err.into()),
        };

        let ttl = lookup
            .as_lookup()
            .records()
            .iter()
            .map(hickory_resolver::proto::rr::Record::ttl)
            .min()
            .unwrap_or(DEFAULT_TTL_SECS);

        let records = lookup
            .iter()
            .map(|mx| MxRecord::new(mx.exchange().to_utf8(), mx.preference()))
            .collect();

        Ok(MxAnswer { records, ttl })
    }
}

/// TTL assumed when an answer carries no records to read one from.
const DEFAULT_TTL_SECS: u32 = 300;

#[derive(Debug, Clone)]
struct CachedResult {
    servers: Arc<Vec<String>>,
    expires_at: Instant,
}

/// Resolves a host to the ordered list of servers to try, caching MX
/// answers between attempts.
///
/// Shared by every worker; the cache is keyed by lowercased host.
pub struct MailServerResolver {
    lookup: Arc<dyn MxLookup>,
    /// Only successful MX answers. Entries are dropped lazily on expiry.
    cache: DashMap<String, CachedResult>,
    config: DnsConfig,
}

impl std::fmt::Debug for MailServerResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MailServerResolver")
            .field("cached", &self.cache.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl MailServerResolver {
    /// A resolver backed by the system's DNS configuration.
    pub fn from_system(config: DnsConfig) -> Result<Self, DnsError> {
        let mut opts = ResolverOpts::default();
        opts.timeout = Duration::from_secs(config.timeout_secs);

        let resolver = TokioResolver::builder(TokioConnectionProvider::default())?
            .with_options(opts)
            .build();

        Ok(Self::with_lookup(Arc::new(resolver), config))
    }

    /// A resolver over any [`MxLookup`], such as a static table in tests.
    pub fn with_lookup(lookup: Arc<dyn MxLookup>, config: DnsConfig) -> Self {
        Self {
            lookup,
            cache: DashMap::new(),
            config,
        }
    }

    /// Servers to try for `host`, most preferred first.
    ///
    /// Never empty: when MX lookup fails or yields nothing, the answer is
    /// `[host]` itself.
    pub async fn find_servers(&self, host: &str) -> Arc<Vec<String>> {
        let key = host.to_ascii_lowercase();

        if let Some(cached) = self.cache.get(&key) {
            if cached.expires_at > Instant::now() {
                debug!("MX cache hit for {host}");
                return Arc::clone(&cached.servers);
            }
        }
        self.cache.remove_if(&key, |_, c| c.expires_at <= Instant::now());

        let timeout = Duration::from_secs(self.config.timeout_secs);
        let answer = tokio::time::timeout(timeout, self.lookup.lookup_mx(host))
            .await
            .unwrap_or_else(|_| Err(DnsError::Timeout(host.to_string())));

        let mut answer = match answer {
            Ok(answer) if !answer.records.is_empty() => answer,
            Ok(_) => {
                debug!("No MX records for {host}, using the host itself");
                return Arc::new(vec![host.to_string()]);
            }
            Err(DnsError::NoRecords(_)) => {
                debug!("No MX records for {host}, using the host itself");
                return Arc::new(vec![host.to_string()]);
            }
            Err(err) => {
                warn!("MX lookup for {host} failed, using the host itself: {err}");
                return Arc::new(vec![host.to_string()]);
            }
        };

        // Stable, so equal preferences keep the resolver's order.
        answer.records.sort_by_key(|record| record.preference);
        let servers: Arc<Vec<String>> = Arc::new(
            answer
                .records
                .into_iter()
                .map(|record| record.exchange.trim_end_matches('.').to_string())
                .collect(),
        );

        // Inverted bounds resolve to the ceiling.
        let ttl = u64::from(answer.ttl)
            .max(self.config.min_cache_ttl_secs)
            .min(self.config.max_cache_ttl_secs);
        debug!(
            "Resolved {} server(s) for {host}, caching for {ttl}s",
            servers.len()
        );
        self.cache.insert(
            key,
            CachedResult {
                servers: Arc::clone(&servers),
                expires_at: Instant::now() + Duration::from_secs(ttl),
            },
        );

        servers
    }
}
