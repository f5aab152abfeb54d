//! MX and address resolution
//!
//! Turns a destination domain into an ordered list of connection
//! candidates: MX hosts sorted by priority, each expanded to its A (and,
//! unless the zone ignores IPv6, AAAA) addresses, with an RFC 5321
//! fallback to the domain's own address records when no MX exists.
//! Resolved answers are LRU-cached pre-filter; the validity filter runs
//! on every call because the blacklist window moves.

use std::{
    net::IpAddr,
    num::NonZeroUsize,
    sync::Arc,
    time::{Duration, Instant},
};

use hickory_resolver::{
    TokioAsyncResolver,
    config::{ResolverConfig, ResolverOpts},
    error::{ResolveError, ResolveErrorKind},
};
use lru::LruCache;
use postrider_common::{Domain, TtlCache, cache::blacklist_key};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{DeliveryError, PermanentError, TemporaryError};

/// Configuration for the resolver
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsConfig {
    /// DNS query timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Answer cache TTL in seconds
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    /// Maximum cached domains
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,

    /// Try IPv6 candidates before IPv4 ones
    #[serde(default)]
    pub prefer_ipv6: bool,

    /// Addresses never connected to
    #[serde(default)]
    pub deny_addresses: Vec<IpAddr>,
}

const fn default_timeout_secs() -> u64 {
    5
}

const fn default_cache_ttl_secs() -> u64 {
    300
}

const fn default_cache_size() -> usize {
    1000
}

const DEFAULT_CACHE_SIZE: NonZeroUsize = NonZeroUsize::new(default_cache_size()).unwrap();

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            cache_ttl_secs: default_cache_ttl_secs(),
            cache_size: default_cache_size(),
            prefer_ipv6: false,
            deny_addresses: Vec::new(),
        }
    }
}

/// One connection candidate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MxCandidate {
    /// MX hostname, or the domain itself on fallback
    pub hostname: String,
    /// MX preference; zero for fallback and literal targets
    pub priority: u16,
    /// Resolved address
    pub host: IpAddr,
    /// Whether this came from an MX record (drives the error verdict on
    /// exhaustion)
    pub is_mx: bool,
}

#[derive(Debug, Clone)]
struct CachedAnswer {
    candidates: Arc<Vec<MxCandidate>>,
    expires_at: Instant,
}

/// Resolver with LRU answer caching and address filtering
#[derive(Debug)]
pub struct MxResolver {
    resolver: TokioAsyncResolver,
    cache: Mutex<LruCache<(String, bool), CachedAnswer>>,
    blacklist: Arc<TtlCache<()>>,
    config: DnsConfig,
}

impl MxResolver {
    /// Resolver over the system DNS configuration
    #[must_use]
    pub fn new(blacklist: Arc<TtlCache<()>>) -> Self {
        Self::with_dns_config(DnsConfig::default(), blacklist)
    }

    #[must_use]
    pub fn with_dns_config(config: DnsConfig, blacklist: Arc<TtlCache<()>>) -> Self {
        let mut opts = ResolverOpts::default();
        opts.timeout = Duration::from_secs(config.timeout_secs);
        let resolver = TokioAsyncResolver::tokio(ResolverConfig::default(), opts);
        Self::with_resolver(resolver, config, blacklist)
    }

    /// Resolver over explicit nameservers (tests, split-horizon setups)
    #[must_use]
    pub fn with_resolver(
        resolver: TokioAsyncResolver,
        config: DnsConfig,
        blacklist: Arc<TtlCache<()>>,
    ) -> Self {
        let cache_size = NonZeroUsize::new(config.cache_size).unwrap_or(DEFAULT_CACHE_SIZE);
        Self {
            resolver,
            cache: Mutex::new(LruCache::new(cache_size)),
            blacklist,
            config,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &DnsConfig {
        &self.config
    }

    /// Resolve connection candidates for a destination domain
    ///
    /// Returns candidates in MX priority order (ties keep DNS order),
    /// already filtered for validity. A destination that is a literal IP
    /// short-circuits DNS entirely.
    pub async fn resolve(
        &self,
        domain: &Domain,
        ignore_ipv6: bool,
    ) -> Result<Vec<MxCandidate>, DeliveryError> {
        if let Ok(ip) = domain.as_str().parse::<IpAddr>() {
            return Ok(vec![MxCandidate {
                hostname: domain.as_str().to_string(),
                priority: 0,
                host: ip,
                is_mx: false,
            }]);
        }

        let key = (domain.as_str().to_string(), ignore_ipv6);

        {
            let mut cache = self.cache.lock().await;
            if let Some(cached) = cache.get(&key) {
                if cached.expires_at > Instant::now() {
                    debug!(domain = %domain, "DNS cache hit");
                    let candidates = Arc::clone(&cached.candidates);
                    drop(cache);
                    return self.filter(domain, &candidates);
                }
            }
        }

        let candidates = Arc::new(self.resolve_uncached(domain, ignore_ipv6).await?);

        {
            let mut cache = self.cache.lock().await;
            cache.put(key, CachedAnswer {
                candidates: Arc::clone(&candidates),
                expires_at: Instant::now() + Duration::from_secs(self.config.cache_ttl_secs),
            });
        }

        self.filter(domain, &candidates)
    }

    /// Drop cached answers (admin cache-flush)
    pub async fn clear_cache(&self) {
        self.cache.lock().await.clear();
    }

    async fn resolve_uncached(
        &self,
        domain: &Domain,
        ignore_ipv6: bool,
    ) -> Result<Vec<MxCandidate>, DeliveryError> {
        match self.resolver.mx_lookup(domain.as_str()).await {
            Ok(lookup) => {
                let mut exchanges: Vec<(String, u16)> = lookup
                    .iter()
                    .map(|mx| {
                        let host = mx.exchange().to_utf8();
                        (host.trim_end_matches('.').to_string(), mx.preference())
                    })
                    .collect();

                if exchanges.is_empty() {
                    return self.fallback(domain, ignore_ipv6).await;
                }

                // Stable sort: ties keep DNS return order.
                exchanges.sort_by_key(|(_, preference)| *preference);

                let mut candidates = Vec::new();
                let mut first_error: Option<ResolveError> = None;

                for (hostname, priority) in exchanges {
                    self.expand_host(&hostname, priority, ignore_ipv6, &mut candidates, &mut first_error)
                        .await;
                }

                if candidates.is_empty() {
                    return Err(first_error.map_or_else(
                        || PermanentError::NoMailServers(domain.as_str().to_string()).into(),
                        |e| TemporaryError::DnsLookup(e.to_string()).into(),
                    ));
                }
                Ok(candidates)
            }
            Err(e) if is_no_records(&e) => self.fallback(domain, ignore_ipv6).await,
            Err(e) => {
                warn!(domain = %domain, error = %e, "MX lookup failed");
                Err(TemporaryError::DnsLookup(e.to_string()).into())
            }
        }
    }

    /// Expand one MX host to its addresses; lookup failures exclude the
    /// host without aborting the resolution
    async fn expand_host(
        &self,
        hostname: &str,
        priority: u16,
        ignore_ipv6: bool,
        candidates: &mut Vec<MxCandidate>,
        first_error: &mut Option<ResolveError>,
    ) {
        match self.resolver.ipv4_lookup(hostname).await {
            Ok(lookup) => {
                for a in lookup.iter() {
                    candidates.push(MxCandidate {
                        hostname: hostname.to_string(),
                        priority,
                        host: IpAddr::V4(a.0),
                        is_mx: true,
                    });
                }
            }
            Err(e) => {
                if !is_no_records(&e) {
                    debug!(host = hostname, error = %e, "A lookup failed, excluding host");
                }
                first_error.get_or_insert(e);
            }
        }

        if !ignore_ipv6 {
            match self.resolver.ipv6_lookup(hostname).await {
                Ok(lookup) => {
                    for aaaa in lookup.iter() {
                        candidates.push(MxCandidate {
                            hostname: hostname.to_string(),
                            priority,
                            host: IpAddr::V6(aaaa.0),
                            is_mx: true,
                        });
                    }
                }
                Err(e) => {
                    if !is_no_records(&e) {
                        debug!(host = hostname, error = %e, "AAAA lookup failed, excluding host");
                    }
                    first_error.get_or_insert(e);
                }
            }
        }
    }

    /// RFC 5321 fallback: the domain's own A/AAAA as an implicit MX
    async fn fallback(
        &self,
        domain: &Domain,
        ignore_ipv6: bool,
    ) -> Result<Vec<MxCandidate>, DeliveryError> {
        debug!(domain = %domain, "No MX records, falling back to A/AAAA");

        let mut candidates = Vec::new();
        let mut first_error: Option<ResolveError> = None;

        match self.resolver.ipv4_lookup(domain.as_str()).await {
            Ok(lookup) => {
                for a in lookup.iter() {
                    candidates.push(MxCandidate {
                        hostname: domain.as_str().to_string(),
                        priority: 0,
                        host: IpAddr::V4(a.0),
                        is_mx: false,
                    });
                }
            }
            Err(e) => {
                first_error.get_or_insert(e);
            }
        }

        if !ignore_ipv6 {
            match self.resolver.ipv6_lookup(domain.as_str()).await {
                Ok(lookup) => {
                    for aaaa in lookup.iter() {
                        candidates.push(MxCandidate {
                            hostname: domain.as_str().to_string(),
                            priority: 0,
                            host: IpAddr::V6(aaaa.0),
                            is_mx: false,
                        });
                    }
                }
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        if candidates.is_empty() {
            return Err(match first_error {
                Some(e) if !is_no_records(&e) => TemporaryError::DnsLookup(e.to_string()).into(),
                _ => PermanentError::NoMailServers(domain.as_str().to_string()).into(),
            });
        }
        Ok(candidates)
    }

    /// Apply the validity filter; if everything is rejected, the first
    /// rejection wins as a permanent error
    fn filter(
        &self,
        domain: &Domain,
        candidates: &[MxCandidate],
    ) -> Result<Vec<MxCandidate>, DeliveryError> {
        let mut valid = Vec::with_capacity(candidates.len());
        let mut first_rejection: Option<String> = None;

        for candidate in candidates {
            if let Some(reason) = self.invalid_reason(domain, candidate.host) {
                debug!(host = %candidate.host, reason, "Filtered mail server address");
                first_rejection.get_or_insert(reason);
            } else {
                valid.push(candidate.clone());
            }
        }

        if valid.is_empty() {
            if let Some(reason) = first_rejection {
                return Err(PermanentError::InvalidAddresses {
                    domain: domain.as_str().to_string(),
                    reason,
                }
                .into());
            }
            return Err(PermanentError::NoMailServers(domain.as_str().to_string()).into());
        }
        Ok(valid)
    }

    /// Why an address must not be connected to, if any
    fn invalid_reason(&self, domain: &Domain, host: IpAddr) -> Option<String> {
        if host.is_loopback() {
            return Some("loopback address".to_string());
        }
        if host.is_multicast() {
            return Some("multicast address".to_string());
        }
        if host.is_unspecified() {
            return Some("unspecified address".to_string());
        }
        if self.config.deny_addresses.contains(&host) {
            return Some("administratively denied".to_string());
        }
        if self
            .blacklist
            .contains(&blacklist_key(domain.as_str(), &host.to_string()))
        {
            return Some("temporarily blacklisted for this domain".to_string());
        }
        None
    }
}

fn is_no_records(error: &ResolveError) -> bool {
    matches!(error.kind(), ResolveErrorKind::NoRecordsFound { .. })
}
