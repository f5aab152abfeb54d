//! Router: envelope → delivery rows
//!
//! Expands one submitted envelope into one delivery row per recipient,
//! resolving the sending zone for each. Rows are staged in memory and
//! inserted as one batch, so a failed insert leaves nothing half-visible
//! to schedulers.

use postrider_common::{Envelope, QueueId, domain::normalize_address, now_ms};
use postrider_zones::ZoneRegistry;

use crate::{
    delivery::{Delivery, format_seq},
    hooks::{QueueHooks, RecipientRoute},
    store::fold_deferred,
};

/// Messages carrying more `Received` headers than this are loops and are
/// dropped silently
pub const MAX_RECEIVED_HEADERS: usize = 25;

/// Response recorded on rows the router inserts pre-deferred
const ROUTER_DEFER_RESPONSE: &str = "Deferred by router";

/// Whether an envelope looks like a forwarding loop
#[must_use]
pub fn is_looped(envelope: &Envelope) -> bool {
    envelope.headers.count("received") > MAX_RECEIVED_HEADERS
}

/// Expand an envelope into delivery rows, one per recipient in order
///
/// Each recipient is normalized, routed, run through the `route` hook
/// (which may mutate the envelope or the chosen route), and turned into
/// a row. A deferred submission (`defer_until` in the future) starts
/// with the defer block already populated.
pub async fn expand(
    id: &QueueId,
    mut envelope: Envelope,
    zones: &ZoneRegistry,
    hooks: &dyn QueueHooks,
) -> crate::Result<Vec<Delivery>> {
    let now = now_ms();
    let recipients = std::mem::take(&mut envelope.to);
    if recipients.is_empty() {
        return Err(crate::QueueError::NoRecipients);
    }

    let defer_until = envelope.defer_until.filter(|&until| until > now);

    let mut rows = Vec::with_capacity(recipients.len());
    let mut seq: u16 = 0;

    for raw in recipients {
        let normalized = normalize_address(&raw)?;
        let zone = zones.resolve(&envelope, &normalized.domain);

        let mut route = RecipientRoute {
            recipient: normalized.address,
            domain: normalized.domain,
            zone,
        };
        hooks.route(&mut envelope, &mut route).await;

        seq += 1;
        rows.push(Delivery {
            id: id.clone(),
            seq: format_seq(seq),
            recipient: route.recipient,
            domain: route.domain,
            sending_zone: route.zone,
            locked: false,
            lock_time: 0,
            assigned: None,
            queued: defer_until.unwrap_or(now),
            created: now,
            deferred: defer_until
                .map(|until| fold_deferred(None, now, until, ROUTER_DEFER_RESPONSE, None))
                .map(|mut deferred| {
                    // Router-inserted defers have not been attempted yet.
                    deferred.count = 0;
                    deferred
                }),
            session_id: envelope.session_id.clone(),
        });
    }

    Ok(rows)
}
