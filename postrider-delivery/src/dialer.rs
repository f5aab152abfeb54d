//! Connection establishment
//!
//! Walks the candidate list in MX priority order, binding each attempt
//! to the zone's deterministically chosen source address, and hands back
//! the first socket that connects. The `sender:connect` style extension
//! can substitute a pre-established socket (SOCKS, onion routing) before
//! the dialer ever touches the network.

use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use postrider_common::{Domain, TtlCache, cache::blacklist_key};
use postrider_zones::{Zone, pool::selection_key, pool::wildcard};
use tokio::net::{TcpSocket, TcpStream};
use tracing::{debug, warn};

use crate::{
    dns::MxCandidate,
    error::{DeliveryError, PermanentError, TemporaryError},
};

/// Hard cap on candidates tried per delivery attempt
const MAX_CANDIDATES: usize = 20;

/// Per-attempt connect timeout
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Dialer tunables
#[derive(Debug, Clone)]
pub struct DialConfig {
    /// Remote SMTP port
    pub port: u16,
    /// Per-attempt timeout
    pub attempt_timeout: Duration,
    /// Candidate cap
    pub max_candidates: usize,
    /// Stable-sort IPv6 candidates ahead of IPv4 per MX
    pub prefer_ipv6: bool,
}

impl Default for DialConfig {
    fn default() -> Self {
        Self {
            port: 25,
            attempt_timeout: ATTEMPT_TIMEOUT,
            max_candidates: MAX_CANDIDATES,
            prefer_ipv6: false,
        }
    }
}

/// An established outbound connection, ready for the SMTP conversation
#[derive(Debug)]
pub struct Connection {
    pub socket: TcpStream,
    /// Remote address actually connected to
    pub remote_addr: SocketAddr,
    /// Local address the socket bound to
    pub local_addr: SocketAddr,
    /// Hostname of the MX (or the domain itself)
    pub hostname: String,
    /// Whether the target came from an MX record
    pub is_mx: bool,
    /// Hostname to announce in EHLO for the chosen source address
    pub source_name: String,
}

/// Extension point run before each dial; may substitute a socket
#[async_trait]
pub trait ConnectHook: Send + Sync {
    /// Return `Some` to replace the dial entirely; `None` lets the
    /// dialer connect itself
    async fn connect(
        &self,
        _candidate: &MxCandidate,
        _source: IpAddr,
    ) -> Option<std::io::Result<TcpStream>> {
        None
    }
}

/// Hook that never substitutes
#[derive(Debug, Clone, Copy, Default)]
pub struct NoConnectHook;

#[async_trait]
impl ConnectHook for NoConnectHook {}

/// Sequenced dialer
pub struct Dialer {
    config: DialConfig,
    hook: Arc<dyn ConnectHook>,
    blacklist: Arc<TtlCache<()>>,
}

impl Dialer {
    #[must_use]
    pub fn new(config: DialConfig, blacklist: Arc<TtlCache<()>>) -> Self {
        Self {
            config,
            hook: Arc::new(NoConnectHook),
            blacklist,
        }
    }

    #[must_use]
    pub fn with_hook(mut self, hook: Arc<dyn ConnectHook>) -> Self {
        self.hook = hook;
        self
    }

    /// Try candidates in order and return the first connection
    ///
    /// On exhaustion the first error wins; it is temporary when the
    /// target had MX records and permanent for literal-IP destinations.
    pub async fn connect(
        &self,
        zone: &Zone,
        domain: &Domain,
        recipient: &str,
        mut candidates: Vec<MxCandidate>,
    ) -> Result<Connection, DeliveryError> {
        if candidates.is_empty() {
            return Err(PermanentError::NoMailServers(domain.as_str().to_string()).into());
        }

        if self.config.prefer_ipv6 {
            // Stable: v6 ahead of v4 within each MX priority.
            candidates.sort_by_key(|candidate| (candidate.priority, candidate.host.is_ipv4()));
        }
        let had_mx = candidates.iter().any(|candidate| candidate.is_mx);
        candidates.truncate(self.config.max_candidates);

        let key = selection_key(domain.as_str(), recipient);
        let mut first_error: Option<String> = None;

        for candidate in candidates {
            let source = self.pick_source(zone, domain, candidate.host.is_ipv6(), &key);

            if let Some(substituted) = self.hook.connect(&candidate, source.address).await {
                match substituted {
                    Ok(socket) => return finish(socket, &candidate, &source),
                    Err(e) => {
                        first_error
                            .get_or_insert_with(|| format!("{}: {e}", candidate.hostname));
                        continue;
                    }
                }
            }

            match self.dial(candidate.host, source.address).await {
                Ok(socket) => {
                    debug!(
                        host = %candidate.host,
                        hostname = %candidate.hostname,
                        source = %source.address,
                        "Connected"
                    );
                    return finish(socket, &candidate, &source);
                }
                Err(e) => {
                    warn!(host = %candidate.host, error = %e, "Connection attempt failed");
                    first_error.get_or_insert_with(|| format!("{}: {e}", candidate.hostname));
                }
            }
        }

        let detail = first_error.unwrap_or_else(|| "no candidates attempted".to_string());
        if had_mx {
            Err(TemporaryError::ConnectFailed(detail).into())
        } else {
            Err(PermanentError::ConnectFailed(detail).into())
        }
    }

    /// Source address for one attempt: deterministic pool pick, skipping
    /// disabled and blacklisted addresses when alternatives exist
    fn pick_source(&self, zone: &Zone, domain: &Domain, ipv6: bool, key: &str) -> Source {
        let disabled = zone.disabled_addresses(domain);
        let picked = zone.pool(ipv6).pick(key, &|entry| {
            disabled.contains(&entry.address)
                || self
                    .blacklist
                    .contains(&blacklist_key(domain.as_str(), &entry.address.to_string()))
        });

        picked.map_or_else(
            || Source {
                address: wildcard(ipv6),
                name: String::new(),
            },
            |entry| Source {
                address: entry.address,
                name: entry.name.clone(),
            },
        )
    }

    async fn dial(&self, host: IpAddr, source: IpAddr) -> std::io::Result<TcpStream> {
        let socket = if host.is_ipv6() {
            TcpSocket::new_v6()?
        } else {
            TcpSocket::new_v4()?
        };
        socket.bind(SocketAddr::new(source, 0))?;

        let remote = SocketAddr::new(host, self.config.port);
        tokio::time::timeout(self.config.attempt_timeout, socket.connect(remote))
            .await
            .map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out")
            })?
    }
}

struct Source {
    address: IpAddr,
    name: String,
}

fn finish(
    socket: TcpStream,
    candidate: &MxCandidate,
    source: &Source,
) -> Result<Connection, DeliveryError> {
    let remote_addr = socket
        .peer_addr()
        .map_err(crate::error::SystemError::Io)?;
    let local_addr = socket
        .local_addr()
        .map_err(crate::error::SystemError::Io)?;

    Ok(Connection {
        socket,
        remote_addr,
        local_addr,
        hostname: candidate.hostname.clone(),
        is_mx: candidate.is_mx,
        source_name: source.name.clone(),
    })
}

impl std::fmt::Debug for Dialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dialer")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
