//! Queue store adapter
//!
//! The store holds delivery rows and provides the one primitive the
//! whole design leans on: an atomic claim that selects an eligible row
//! and marks it locked in a single step. Everything else is plain CRUD
//! plus a few scans the maintenance loop runs.
//!
//! Backends are expected to index rows so the claim is a bounded scan:
//! `(sending_zone, queued, locked, assigned, domain)` compound plus
//! unique `(id, seq)` and `(id)`.

pub mod memory;

use ahash::AHashSet;
use async_trait::async_trait;
use postrider_common::{Domain, QueueId};
use serde::{Deserialize, Serialize};

use crate::delivery::{Deferred, Delivery};

pub use memory::MemoryQueueStore;

/// Which rows a listing should return
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListKind {
    /// Rows eligible now (`queued <= now`)
    Active,
    /// Rows waiting on a future `queued`
    Deferred,
}

/// Queued/deferred row counts for a zone
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub queued: u64,
    pub deferred: u64,
}

/// Result of a defer: the updated row plus the deferred block it replaced
#[derive(Debug, Clone)]
pub struct DeferOutcome {
    pub delivery: Delivery,
    pub previous: Option<Deferred>,
}

/// Durable storage for delivery rows
#[async_trait]
pub trait QueueStore: Send + Sync + std::fmt::Debug {
    /// Insert a batch of rows, all-or-nothing
    ///
    /// Failure leaves no partial batch visible to schedulers.
    async fn insert(&self, rows: Vec<Delivery>) -> crate::Result<()>;

    /// Atomically claim the next eligible row for a zone
    ///
    /// Matches `sending_zone = zone ∧ queued <= now ∧ locked = false ∧
    /// assigned ∈ {None, instance} ∧ domain ∉ skip`, preferring the
    /// oldest `queued` (ties by insertion order), and in the same step
    /// sets `locked = true, lock_time = now, assigned = instance`.
    async fn claim_next(
        &self,
        zone: &str,
        now_ms: u64,
        instance: &str,
        skip: &AHashSet<Domain>,
    ) -> crate::Result<Option<Delivery>>;

    /// Clear the lock on one row without touching anything else
    async fn unlock(&self, id: &QueueId, seq: &str) -> crate::Result<()>;

    /// Record a defer: clear the lock, advance `queued` to `next_ms`,
    /// fold the response into the `deferred` block
    ///
    /// Returns the updated row plus the prior deferred block; `None`
    /// when the row no longer exists.
    async fn defer(
        &self,
        id: &QueueId,
        seq: &str,
        now_ms: u64,
        next_ms: u64,
        response: &str,
        log: Option<&str>,
    ) -> crate::Result<Option<DeferOutcome>>;

    /// Reset `queued` on one row (or every row of a message when `seq`
    /// is `None`); returns how many rows changed
    async fn set_queued(
        &self,
        id: &QueueId,
        seq: Option<&str>,
        queued_ms: u64,
    ) -> crate::Result<u64>;

    /// Delete one row; `false` when it was already gone
    async fn delete(&self, id: &QueueId, seq: &str) -> crate::Result<bool>;

    /// Delete every row of a message; returns how many were removed
    async fn delete_message(&self, id: &QueueId) -> crate::Result<u64>;

    /// Rows still referencing a message id
    async fn remaining_for_message(&self, id: &QueueId) -> crate::Result<u64>;

    /// Clear locks held by `instance` whose `lock_time` is at or before
    /// `cutoff_ms`; returns how many rows were unlocked
    async fn release_expired_locks(&self, instance: &str, cutoff_ms: u64) -> crate::Result<u64>;

    /// Delete and return unlocked rows created at or before `cutoff_ms`
    /// (max-queue-time enforcement)
    async fn take_expired(&self, cutoff_ms: u64) -> crate::Result<Vec<Delivery>>;

    /// Queued/deferred counts for a zone
    async fn counts(&self, zone: &str, now_ms: u64) -> crate::Result<QueueCounts>;

    /// Queued/deferred counts across all zones
    async fn counts_total(&self, now_ms: u64) -> crate::Result<QueueCounts>;

    /// First `limit` rows of a zone in `queued` order
    async fn list(
        &self,
        zone: &str,
        kind: ListKind,
        now_ms: u64,
        limit: usize,
    ) -> crate::Result<Vec<Delivery>>;

    /// Every row of one message, in sequence order
    async fn find_message(&self, id: &QueueId) -> crate::Result<Vec<Delivery>>;

    /// Creation time of the oldest surviving row
    async fn oldest_created(&self) -> crate::Result<Option<u64>>;
}

/// Helper shared by backends: the next deferred block after one defer
#[must_use]
pub fn fold_deferred(
    previous: Option<&Deferred>,
    now_ms: u64,
    next_ms: u64,
    response: &str,
    log: Option<&str>,
) -> Deferred {
    Deferred {
        first: previous.map_or(now_ms, |d| d.first),
        last: now_ms,
        next: next_ms,
        count: previous.map_or(0, |d| d.count) + 1,
        response: response.to_string(),
        log: log.map(str::to_string).or_else(|| previous.and_then(|d| d.log.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fold_deferred_first_time() {
        let folded = fold_deferred(None, 1_000, 2_000, "450 grey", None);
        assert_eq!(folded.first, 1_000);
        assert_eq!(folded.last, 1_000);
        assert_eq!(folded.next, 2_000);
        assert_eq!(folded.count, 1);
        assert_eq!(folded.response, "450 grey");
    }

    #[test]
    fn test_fold_deferred_preserves_first() {
        let first = fold_deferred(None, 1_000, 2_000, "450 a", None);
        let second = fold_deferred(Some(&first), 5_000, 9_000, "450 b", Some("transcript"));

        assert_eq!(second.first, 1_000);
        assert_eq!(second.last, 5_000);
        assert_eq!(second.next, 9_000);
        assert_eq!(second.count, 2);
        assert_eq!(second.response, "450 b");
        assert_eq!(second.log.as_deref(), Some("transcript"));
    }
}
