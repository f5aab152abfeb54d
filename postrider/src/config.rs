//! Process configuration
//!
//! One TOML file describes the whole relay: instance identity, stores,
//! zones, per-domain overrides, DNS options, and housekeeping knobs.
//! Reloading builds fresh registries; in-flight deliveries keep the pool
//! entries they already chose.

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use ahash::AHashMap;
use postrider_delivery::{DnsConfig, DsnConfig, RetryPolicy};
use postrider_queue::{MaintenanceConfig, QueueConfig};
use postrider_zones::{DomainConfig, DomainConfigRegistry, ZoneConfig, ZoneRegistry};
use serde::Deserialize;

fn default_instance() -> String {
    "default".to_string()
}

fn default_control_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 2525))
}

fn default_spool_dir() -> PathBuf {
    PathBuf::from("/var/spool/postrider")
}

const fn default_release_grace_secs() -> u64 {
    10
}

/// Top-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Instance id; masters sharing a store must differ here
    #[serde(default = "default_instance")]
    pub instance: String,

    /// Where message bodies live
    #[serde(default = "default_spool_dir")]
    pub spool_dir: PathBuf,

    /// Control-plane listen address
    #[serde(default = "default_control_addr")]
    pub control_addr: SocketAddr,

    /// Zone used when no routing rule matches
    #[serde(default)]
    pub default_zone: Option<String>,

    /// Deliveries older than this are released without bounce
    #[serde(default)]
    pub max_queue_time_secs: Option<u64>,

    /// Skip orphan-body collection
    #[serde(default)]
    pub disable_gc: bool,

    /// Delay between releasing the last row and deleting the body
    #[serde(default = "default_release_grace_secs")]
    pub release_grace_secs: u64,

    /// Sending zones by name
    #[serde(default)]
    pub zones: AHashMap<String, ZoneConfig>,

    /// Per-remote-domain overrides
    #[serde(default)]
    pub domains: DomainsSection,

    /// DNS resolver options
    #[serde(default)]
    pub dns: DnsConfig,

    /// Bounce notification options
    #[serde(default)]
    pub dsn: DsnConfig,

    /// Worker retry timing
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Suppression entries seeded at start
    #[serde(default)]
    pub suppression: Vec<SuppressionSeed>,
}

/// Per-domain override section
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DomainsSection {
    /// Baseline for every domain
    #[serde(default)]
    pub default: DomainConfig,

    /// Keyed by remote domain
    #[serde(default)]
    pub overrides: AHashMap<String, DomainConfig>,
}

/// One seeded suppression entry; exactly one field should be set
#[derive(Debug, Clone, Deserialize)]
pub struct SuppressionSeed {
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
}

impl Config {
    /// Load and parse a TOML config file
    pub async fn load(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let raw = tokio::fs::read_to_string(&path).await?;
        let config: Self = toml::from_str(&raw)?;
        Ok(config)
    }

    /// Build the zone registry from the `[zones]` tables
    #[must_use]
    pub fn zone_registry(&self) -> ZoneRegistry {
        ZoneRegistry::new(self.zones.clone(), self.default_zone.clone())
    }

    /// Build the per-domain override registry
    #[must_use]
    pub fn domain_registry(&self) -> DomainConfigRegistry {
        let mut registry = DomainConfigRegistry::new(self.domains.default.clone());
        for (domain, config) in &self.domains.overrides {
            registry.insert(domain.to_lowercase(), config.clone());
        }
        registry
    }

    /// Queue tunables derived from this config
    #[must_use]
    pub fn queue_config(&self) -> QueueConfig {
        let mut queue = QueueConfig::new(self.instance.clone());
        queue.release_grace = Duration::from_secs(self.release_grace_secs);
        queue
    }

    /// Maintenance tunables derived from this config
    #[must_use]
    pub fn maintenance_config(&self) -> MaintenanceConfig {
        MaintenanceConfig {
            max_queue_time: self.max_queue_time_secs.map(Duration::from_secs),
            disable_gc: self.disable_gc,
            ..Default::default()
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            instance: default_instance(),
            spool_dir: default_spool_dir(),
            control_addr: default_control_addr(),
            default_zone: None,
            max_queue_time_secs: None,
            disable_gc: false,
            release_grace_secs: default_release_grace_secs(),
            zones: AHashMap::new(),
            domains: DomainsSection::default(),
            dns: DnsConfig::default(),
            dsn: DsnConfig::default(),
            retry: RetryPolicy::default(),
            suppression: Vec::new(),
        }
    }
}
