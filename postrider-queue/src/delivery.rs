//! Delivery rows: the queue's fundamental unit
//!
//! One row exists per (message, recipient). Rows move through exactly
//! three states: created by the router, optionally claimed (locked) by a
//! scheduler, then either deleted on release or updated back to unlocked
//! with a future `queued` time on defer.

use postrider_common::{Domain, QueueId};
use serde::{Deserialize, Serialize};

/// Deferral bookkeeping attached to a row after its first defer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deferred {
    /// First defer, epoch ms
    pub first: u64,
    /// Most recent defer, epoch ms
    pub last: u64,
    /// Next eligibility, epoch ms
    pub next: u64,
    /// Defer count
    pub count: u32,
    /// Last SMTP-style response recorded
    pub response: String,
    /// Optional session transcript from the worker
    #[serde(default)]
    pub log: Option<String>,
}

/// One (message, recipient) pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delivery {
    /// Message id; shared by all recipients of one message
    pub id: QueueId,

    /// Per-message sequence, three hex digits
    pub seq: String,

    /// Normalized recipient address
    pub recipient: String,

    /// Punycoded recipient domain
    pub domain: Domain,

    /// Zone this delivery egresses through
    pub sending_zone: String,

    /// Claimed by a scheduler
    pub locked: bool,

    /// Claim time, epoch ms; zero while unlocked
    pub lock_time: u64,

    /// Instance that claimed the row; `None` is stored as the literal
    /// `"no"` by document-store backends
    pub assigned: Option<String>,

    /// Earliest time the delivery may be attempted, epoch ms
    pub queued: u64,

    /// Creation time, epoch ms; immutable
    pub created: u64,

    /// Present once the delivery has been deferred at least once
    #[serde(default)]
    pub deferred: Option<Deferred>,

    /// Originating session
    #[serde(default)]
    pub session_id: Option<String>,
}

impl Delivery {
    /// Whether this row may be claimed at `now` by `instance`
    #[must_use]
    pub fn eligible(&self, now_ms: u64, instance: &str) -> bool {
        !self.locked
            && self.queued <= now_ms
            && self.assigned.as_deref().is_none_or(|assigned| assigned == instance)
    }

    /// Whether a held lock has gone stale
    #[must_use]
    pub const fn lock_stale(&self, now_ms: u64, lock_ttl_ms: u64) -> bool {
        self.locked && now_ms.saturating_sub(self.lock_time) > lock_ttl_ms
    }
}

/// Format a per-message sequence number as three hex digits
#[must_use]
pub fn format_seq(seq: u16) -> String {
    format!("{:03x}", seq & 0xfff)
}

/// String form of the scheduler lock for a row, carried verbatim in RPC
/// payloads; the lock table itself keys on the `(id, seq)` tuple
#[must_use]
pub fn lock_key(id: &QueueId, seq: &str) -> String {
    format!("lock {id} {seq}")
}
