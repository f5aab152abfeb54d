//! Flattened routing lookups
//!
//! Zone configuration is declarative; at load it is flattened into four
//! maps keyed by normalized (punycoded, lowercased) values so routing a
//! recipient costs a handful of hash lookups.

use std::net::IpAddr;

use ahash::AHashMap;
use postrider_common::{Domain, Headers};
use tracing::warn;

use crate::config::ZoneConfig;

/// Lookup tables derived from every configured zone
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    sender_map: AHashMap<Domain, String>,
    recipient_map: AHashMap<Domain, String>,
    origin_map: AHashMap<IpAddr, String>,
    /// header name → header value → zone
    header_map: AHashMap<String, AHashMap<String, String>>,
}

impl RouteTable {
    /// Flatten zone configs into lookup maps
    #[must_use]
    pub fn build<'a>(zones: impl Iterator<Item = (&'a str, &'a ZoneConfig)>) -> Self {
        let mut table = Self::default();

        for (name, config) in zones {
            for raw in &config.sender_domains {
                match Domain::normalize(raw) {
                    Ok(domain) => {
                        table.sender_map.insert(domain, name.to_string());
                    }
                    Err(e) => warn!(zone = name, domain = raw, error = %e, "Skipping sender domain"),
                }
            }
            for raw in &config.recipient_domains {
                match Domain::normalize(raw) {
                    Ok(domain) => {
                        table.recipient_map.insert(domain, name.to_string());
                    }
                    Err(e) => {
                        warn!(zone = name, domain = raw, error = %e, "Skipping recipient domain");
                    }
                }
            }
            for addr in &config.origin_addresses {
                table.origin_map.insert(*addr, name.to_string());
            }
            for (header, value) in &config.routing_headers {
                table
                    .header_map
                    .entry(header.to_lowercase())
                    .or_default()
                    .insert(value.trim().to_lowercase(), name.to_string());
            }
        }

        table
    }

    #[must_use]
    pub fn find_by_sender(&self, domain: &Domain) -> Option<&str> {
        self.sender_map.get(domain).map(String::as_str)
    }

    #[must_use]
    pub fn find_by_recipient(&self, domain: &Domain) -> Option<&str> {
        self.recipient_map.get(domain).map(String::as_str)
    }

    #[must_use]
    pub fn find_by_origin(&self, origin: IpAddr) -> Option<&str> {
        self.origin_map.get(&origin).map(String::as_str)
    }

    /// First match walking headers from the last occurrence backward
    ///
    /// Later-added routing hints override earlier ones, so the scan runs
    /// in reverse insertion order.
    #[must_use]
    pub fn find_by_headers(&self, headers: &Headers) -> Option<&str> {
        headers.iter_rev().find_map(|(name, value)| {
            self.header_map
                .get(&name.to_lowercase())
                .and_then(|values| values.get(&value.trim().to_lowercase()))
                .map(String::as_str)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> RouteTable {
        let mut bulk = ZoneConfig::default();
        bulk.sender_domains.push("X.COM".to_string());
        bulk.routing_headers
            .insert("X-Sending-Zone".to_string(), "bulk".to_string());

        let mut transactional = ZoneConfig::default();
        transactional.recipient_domains.push("y.test".to_string());
        transactional
            .origin_addresses
            .push("10.1.1.1".parse().unwrap());

        RouteTable::build(
            [("bulk", &bulk), ("transactional", &transactional)].into_iter(),
        )
    }

    #[test]
    fn test_sender_lookup_is_normalized() {
        let table = table();
        assert_eq!(
            table.find_by_sender(&Domain::new("x.com")),
            Some("bulk")
        );
    }

    #[test]
    fn test_recipient_and_origin() {
        let table = table();
        assert_eq!(
            table.find_by_recipient(&Domain::new("y.test")),
            Some("transactional")
        );
        assert_eq!(
            table.find_by_origin("10.1.1.1".parse().unwrap()),
            Some("transactional")
        );
        assert_eq!(table.find_by_origin("10.9.9.9".parse().unwrap()), None);
    }

    #[test]
    fn test_headers_last_occurrence_wins() {
        let mut alpha = ZoneConfig::default();
        alpha
            .routing_headers
            .insert("x-zone".to_string(), "a".to_string());
        let mut beta = ZoneConfig::default();
        beta.routing_headers
            .insert("x-zone".to_string(), "b".to_string());

        let table = RouteTable::build([("alpha", &alpha), ("beta", &beta)].into_iter());

        let mut headers = Headers::new();
        headers.push("X-Zone", "a");
        headers.push("X-Zone", "B");
        // The later header occurrence is consulted first.
        assert_eq!(table.find_by_headers(&headers), Some("beta"));
    }

    #[test]
    fn test_headers_no_match() {
        let table = table();
        let mut headers = Headers::new();
        headers.push("Subject", "hi");
        assert_eq!(table.find_by_headers(&headers), None);
    }
}
