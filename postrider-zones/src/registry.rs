//! Zone registry
//!
//! Process-wide view of every configured sending zone, built once at
//! start. A reload constructs a fresh registry; in-flight deliveries keep
//! whatever pool entry they already chose.

use std::{net::IpAddr, sync::Arc};

use ahash::AHashMap;
use postrider_common::{Domain, Envelope};

use crate::{
    DEFAULT_ZONE,
    config::ZoneConfig,
    pool::SourcePool,
    routing::RouteTable,
};

/// A loaded sending zone with its expanded source pools
#[derive(Debug)]
pub struct Zone {
    name: Arc<str>,
    config: ZoneConfig,
    pool_v4: SourcePool,
    pool_v6: SourcePool,
}

impl Zone {
    fn new(name: &str, config: ZoneConfig) -> Self {
        let pool_v4 = SourcePool::build(&config.pool, false);
        let pool_v6 = SourcePool::build(&config.pool, true);
        Self {
            name: Arc::from(name),
            config,
            pool_v4,
            pool_v6,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn config(&self) -> &ZoneConfig {
        &self.config
    }

    #[must_use]
    pub const fn pool(&self, ipv6: bool) -> &SourcePool {
        if ipv6 { &self.pool_v6 } else { &self.pool_v4 }
    }

    /// Source addresses disabled for a remote domain in this zone
    #[must_use]
    pub fn disabled_addresses(&self, domain: &Domain) -> &[IpAddr] {
        self.config
            .disabled_addresses
            .get(domain.as_str())
            .map_or(&[], Vec::as_slice)
    }
}

/// All configured zones plus the flattened route table
#[derive(Debug)]
pub struct ZoneRegistry {
    zones: AHashMap<String, Arc<Zone>>,
    routes: RouteTable,
    default_zone: String,
}

impl ZoneRegistry {
    /// Build a registry from configuration
    ///
    /// A zone named after `default_zone` (or `"default"`) need not be
    /// configured explicitly; an implicit empty zone is added so routing
    /// always has a destination.
    #[must_use]
    pub fn new(configs: AHashMap<String, ZoneConfig>, default_zone: Option<String>) -> Self {
        let default_zone = default_zone.unwrap_or_else(|| DEFAULT_ZONE.to_string());

        let routes = RouteTable::build(configs.iter().map(|(n, c)| (n.as_str(), c)));

        let mut zones: AHashMap<String, Arc<Zone>> = configs
            .into_iter()
            .map(|(name, config)| {
                let zone = Arc::new(Zone::new(&name, config));
                (name, zone)
            })
            .collect();
        zones
            .entry(default_zone.clone())
            .or_insert_with(|| Arc::new(Zone::new(&default_zone, ZoneConfig::default())));

        Self {
            zones,
            routes,
            default_zone,
        }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<Zone>> {
        self.zones.get(name).cloned()
    }

    #[must_use]
    pub fn exists(&self, name: &str) -> bool {
        self.zones.contains_key(name)
    }

    #[must_use]
    pub fn default_zone(&self) -> &str {
        &self.default_zone
    }

    #[must_use]
    pub const fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<Zone>)> {
        self.zones.iter().map(|(name, zone)| (name.as_str(), zone))
    }

    /// Resolve the zone for one recipient
    ///
    /// Priority: explicit envelope zone (when it exists), then a routing
    /// header match, then sender domain, recipient domain, origin
    /// address, and finally the default zone.
    #[must_use]
    pub fn resolve(&self, envelope: &Envelope, recipient_domain: &Domain) -> String {
        if let Some(explicit) = envelope.sending_zone.as_deref()
            && self.exists(explicit)
        {
            return explicit.to_string();
        }

        if let Some(by_header) = self.routes.find_by_headers(&envelope.headers) {
            return by_header.to_string();
        }

        if let Some(sender_domain) = envelope.sender_domain()
            && let Some(by_sender) = self.routes.find_by_sender(&sender_domain)
        {
            return by_sender.to_string();
        }

        if let Some(by_recipient) = self.routes.find_by_recipient(recipient_domain) {
            return by_recipient.to_string();
        }

        if let Some(origin) = envelope.origin
            && let Some(by_origin) = self.routes.find_by_origin(origin)
        {
            return by_origin.to_string();
        }

        self.default_zone.clone()
    }
}

impl Default for ZoneRegistry {
    fn default() -> Self {
        Self::new(AHashMap::new(), None)
    }
}
