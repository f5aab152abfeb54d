//! Static sending-zone configuration
//!
//! Zones are loaded once at start (or on reload, which rebuilds
//! everything); after that the structures are read-only.

use std::{collections::HashMap, net::IpAddr};

use serde::{Deserialize, Serialize};

/// One source address in a zone pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolEntry {
    /// Local address to bind outbound connections to
    pub address: IpAddr,

    /// Hostname announced in EHLO when sending from this address
    pub name: String,

    /// Warm-up share in `(0, 1]`; entries without a ratio split the
    /// leftover share equally
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ratio: Option<f64>,
}

impl PoolEntry {
    #[must_use]
    pub fn new(address: IpAddr, name: impl Into<String>) -> Self {
        Self {
            address,
            name: name.into(),
            ratio: None,
        }
    }
}

/// Throttling window for a zone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Throttle {
    /// Messages allowed per window
    pub messages: u32,
    /// Window length in seconds
    pub window_secs: u64,
}

const fn default_processes() -> u32 {
    1
}

const fn default_connections() -> u32 {
    5
}

/// Configuration of one sending zone
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ZoneConfig {
    /// Worker processes to run for this zone
    #[serde(default = "default_processes")]
    pub processes: u32,

    /// Parallel SMTP sessions per worker
    #[serde(default = "default_connections")]
    pub connections: u32,

    /// Source addresses, IPv4 and IPv6 mixed
    #[serde(default)]
    pub pool: Vec<PoolEntry>,

    /// Optional send-rate cap
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub throttling: Option<Throttle>,

    /// Sender domains routed into this zone
    #[serde(default)]
    pub sender_domains: Vec<String>,

    /// Recipient domains routed into this zone
    #[serde(default)]
    pub recipient_domains: Vec<String>,

    /// Submitting client addresses routed into this zone
    #[serde(default)]
    pub origin_addresses: Vec<IpAddr>,

    /// Header name → value pairs that route a message into this zone
    #[serde(default)]
    pub routing_headers: HashMap<String, String>,

    /// Skip AAAA resolution for deliveries from this zone
    #[serde(default)]
    pub ignore_ipv6: bool,

    /// Source addresses never used per remote domain
    #[serde(default)]
    pub disabled_addresses: HashMap<String, Vec<IpAddr>>,
}

impl ZoneConfig {
    /// Default `ZoneConfig` with overridden worker/connection counts
    #[must_use]
    pub fn with_limits(processes: u32, connections: u32) -> Self {
        Self {
            processes,
            connections,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_apply_on_empty_table() {
        let config: ZoneConfig = toml::from_str("").unwrap();
        assert_eq!(config.processes, 1);
        assert_eq!(config.connections, 5);
        assert!(config.pool.is_empty());
        assert!(!config.ignore_ipv6);
    }

    #[test]
    fn test_full_zone_parses() {
        let config: ZoneConfig = toml::from_str(
            r#"
            processes = 2
            connections = 10
            sender_domains = ["x.com"]
            ignore_ipv6 = true

            [[pool]]
            address = "192.0.2.10"
            name = "mx1.example.com"
            ratio = 0.25

            [throttling]
            messages = 100
            window_secs = 60

            [routing_headers]
            "x-sending-zone" = "bulk"
            "#,
        )
        .unwrap();

        assert_eq!(config.processes, 2);
        assert_eq!(config.pool.len(), 1);
        assert_eq!(config.pool[0].ratio, Some(0.25));
        assert_eq!(
            config.throttling,
            Some(Throttle {
                messages: 100,
                window_secs: 60
            })
        );
        assert_eq!(
            config.routing_headers.get("x-sending-zone").map(String::as_str),
            Some("bulk")
        );
    }
}
