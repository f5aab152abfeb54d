//! Per-remote-domain delivery overrides

use std::net::IpAddr;

use ahash::AHashMap;
use postrider_common::Domain;
use serde::{Deserialize, Serialize};

const fn default_max_connections() -> u32 {
    5
}

/// Overrides for delivering to one remote domain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainConfig {
    /// Cap on simultaneous in-flight deliveries to this domain per zone
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Source addresses never used when sending to this domain
    #[serde(default)]
    pub disabled_addresses: Vec<IpAddr>,
}

impl Default for DomainConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            disabled_addresses: Vec::new(),
        }
    }
}

/// Registry of per-domain configurations merged over a default entry
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DomainConfigRegistry {
    /// Baseline applied to every domain without an entry
    #[serde(default)]
    default: DomainConfig,

    /// Keyed by normalized domain
    #[serde(default)]
    domains: AHashMap<String, DomainConfig>,
}

impl DomainConfigRegistry {
    #[must_use]
    pub fn new(default: DomainConfig) -> Self {
        Self {
            default,
            domains: AHashMap::new(),
        }
    }

    pub fn insert(&mut self, domain: impl Into<String>, config: DomainConfig) {
        self.domains.insert(domain.into(), config);
    }

    /// Effective configuration for a domain
    #[must_use]
    pub fn get(&self, domain: &Domain) -> &DomainConfig {
        self.domains.get(domain.as_str()).unwrap_or(&self.default)
    }

    #[must_use]
    pub fn max_connections(&self, domain: &Domain) -> u32 {
        self.get(domain).max_connections
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.domains.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_fallback() {
        let registry = DomainConfigRegistry::default();
        let domain = Domain::new("nowhere.test");
        assert_eq!(registry.max_connections(&domain), 5);
    }

    #[test]
    fn test_override_wins() {
        let mut registry = DomainConfigRegistry::default();
        registry.insert(
            "busy.test",
            DomainConfig {
                max_connections: 2,
                disabled_addresses: vec!["192.0.2.9".parse().unwrap()],
            },
        );

        let domain = Domain::new("busy.test");
        assert_eq!(registry.max_connections(&domain), 2);
        assert_eq!(registry.get(&domain).disabled_addresses.len(), 1);
    }
}
