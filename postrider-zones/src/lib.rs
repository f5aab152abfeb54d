pub mod config;
pub mod domains;
pub mod pool;
pub mod registry;
pub mod routing;

pub use config::{PoolEntry, Throttle, ZoneConfig};
pub use domains::{DomainConfig, DomainConfigRegistry};
pub use pool::SourcePool;
pub use registry::{Zone, ZoneRegistry};
pub use routing::RouteTable;

/// Name used when no zone rule matches and none is configured
pub const DEFAULT_ZONE: &str = "default";
