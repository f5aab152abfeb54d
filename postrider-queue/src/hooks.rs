//! Extension points consumed by the queue core
//!
//! Plugin infrastructure (loading, sandboxing) lives outside the core;
//! the queue only invokes these traits at defined points. Defaults are
//! no-ops so a bare queue works without any wiring.

use async_trait::async_trait;
use postrider_common::{Domain, Envelope, QueueId};
use postrider_spool::MessageMeta;

use crate::delivery::Delivery;

/// Routing decision for one recipient, mutable by the route hook
#[derive(Debug, Clone)]
pub struct RecipientRoute {
    /// Normalized recipient address
    pub recipient: String,
    /// Normalized recipient domain
    pub domain: Domain,
    /// Zone chosen by the routing rules
    pub zone: String,
}

/// Defer history handed to the delayed hook
#[derive(Debug, Clone, Copy)]
pub struct DeferTimeline {
    /// First defer, epoch ms
    pub first: u64,
    /// Defer before this one, epoch ms
    pub prev: u64,
    /// This defer, epoch ms
    pub last: u64,
}

/// Summary emitted for every queued delivery
#[derive(Debug, Clone)]
pub struct QueuedSummary {
    pub id: QueueId,
    pub seq: String,
    pub recipient: String,
    pub zone: String,
}

/// Extension hooks the queue invokes
#[async_trait]
pub trait QueueHooks: Send + Sync {
    /// Runs per recipient before the delivery row is built; may mutate
    /// the envelope or the chosen route
    async fn route(&self, _envelope: &mut Envelope, _route: &mut RecipientRoute) {}

    /// Runs after a repeated defer, with the aggregated history; bounce
    /// generation policy hangs off this
    async fn delayed(&self, _delivery: &Delivery, _timeline: DeferTimeline) {}

    /// Runs when a worker reports a bounce; may compose a DSN and
    /// re-submit it through the router
    async fn bounce(&self, _delivery: &Delivery, _meta: Option<&MessageMeta>, _response: &str) {}
}

/// Hooks that do nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

#[async_trait]
impl QueueHooks for NoopHooks {}

/// Observer notified once per queued delivery
pub trait QueueObserver: Send + Sync {
    fn on_queued(&self, summary: &QueuedSummary);
}
