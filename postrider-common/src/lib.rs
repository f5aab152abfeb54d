pub mod cache;
pub mod domain;
pub mod envelope;
pub mod id;

pub use cache::TtlCache;
pub use domain::Domain;
pub use envelope::{Envelope, Headers};
pub use id::{IdGenerator, QueueId};
pub use tracing;

/// Shutdown payload broadcast to long-running services
#[derive(Debug, Clone, Copy)]
pub enum Signal {
    Shutdown,
}

/// Milliseconds since the Unix epoch
#[must_use]
pub fn now_ms() -> u64 {
    u64::try_from(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis(),
    )
    .unwrap_or(u64::MAX)
}
