pub mod delivery;
pub mod error;
pub mod hooks;
pub mod locks;
pub mod maintenance;
pub mod queue;
pub mod router;
pub mod store;
pub mod suppression;

pub use delivery::{Deferred, Delivery, format_seq, lock_key};
pub use error::{QueueError, Result};
pub use hooks::{
    DeferTimeline, NoopHooks, QueueHooks, QueueObserver, QueuedSummary, RecipientRoute,
};
pub use locks::LockTable;
pub use maintenance::{Maintenance, MaintenanceConfig};
pub use queue::{PushReceipt, Queue, QueueConfig, ScheduledDelivery};
pub use store::{DeferOutcome, ListKind, MemoryQueueStore, QueueCounts, QueueStore};
pub use suppression::{SuppressionEntry, SuppressionList};
