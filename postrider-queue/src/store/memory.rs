use std::collections::HashMap;

use ahash::AHashSet;
use async_trait::async_trait;
use parking_lot::Mutex;
use postrider_common::{Domain, QueueId};

use crate::{
    delivery::Delivery,
    store::{DeferOutcome, ListKind, QueueCounts, QueueStore, fold_deferred},
};

/// In-memory queue store
///
/// Rows live in a `HashMap` behind a mutex; every operation holds the
/// lock for its full duration, which is what makes `claim_next` atomic.
/// The claim is a linear scan ordered by `(queued, insertion order)`,
/// fine for tests and single-node relays; indexed backends implement
/// the same trait with a bounded scan.
#[derive(Debug, Default)]
pub struct MemoryQueueStore {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    rows: HashMap<(QueueId, String), StoredRow>,
    next_order: u64,
}

#[derive(Debug)]
struct StoredRow {
    delivery: Delivery,
    order: u64,
}

impl MemoryQueueStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of rows
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn insert(&self, rows: Vec<Delivery>) -> crate::Result<()> {
        let mut inner = self.inner.lock();

        // All-or-nothing: refuse the whole batch on a key collision so no
        // partial batch becomes visible.
        for row in &rows {
            if inner.rows.contains_key(&(row.id.clone(), row.seq.clone())) {
                return Err(crate::QueueError::Store(format!(
                    "duplicate delivery {}.{}",
                    row.id, row.seq
                )));
            }
        }

        for delivery in rows {
            let order = inner.next_order;
            inner.next_order += 1;
            inner
                .rows
                .insert((delivery.id.clone(), delivery.seq.clone()), StoredRow {
                    delivery,
                    order,
                });
        }
        Ok(())
    }

    async fn claim_next(
        &self,
        zone: &str,
        now_ms: u64,
        instance: &str,
        skip: &AHashSet<Domain>,
    ) -> crate::Result<Option<Delivery>> {
        let mut inner = self.inner.lock();

        let best = inner
            .rows
            .values()
            .filter(|row| {
                row.delivery.sending_zone == zone
                    && row.delivery.eligible(now_ms, instance)
                    && !skip.contains(&row.delivery.domain)
            })
            .min_by_key(|row| (row.delivery.queued, row.order))
            .map(|row| (row.delivery.id.clone(), row.delivery.seq.clone()));

        let Some(key) = best else {
            return Ok(None);
        };

        let row = inner
            .rows
            .get_mut(&key)
            .ok_or_else(|| crate::QueueError::Internal("claimed row vanished".to_string()))?;
        row.delivery.locked = true;
        row.delivery.lock_time = now_ms;
        row.delivery.assigned = Some(instance.to_string());
        Ok(Some(row.delivery.clone()))
    }

    async fn unlock(&self, id: &QueueId, seq: &str) -> crate::Result<()> {
        let mut inner = self.inner.lock();
        if let Some(row) = inner.rows.get_mut(&(id.clone(), seq.to_string())) {
            row.delivery.locked = false;
            row.delivery.lock_time = 0;
        }
        Ok(())
    }

    async fn defer(
        &self,
        id: &QueueId,
        seq: &str,
        now_ms: u64,
        next_ms: u64,
        response: &str,
        log: Option<&str>,
    ) -> crate::Result<Option<DeferOutcome>> {
        let mut inner = self.inner.lock();
        let Some(row) = inner.rows.get_mut(&(id.clone(), seq.to_string())) else {
            return Ok(None);
        };

        let previous = row.delivery.deferred.take();
        row.delivery.deferred = Some(fold_deferred(
            previous.as_ref(),
            now_ms,
            next_ms,
            response,
            log,
        ));
        row.delivery.queued = next_ms;
        row.delivery.locked = false;
        row.delivery.lock_time = 0;
        Ok(Some(DeferOutcome {
            delivery: row.delivery.clone(),
            previous,
        }))
    }

    async fn set_queued(
        &self,
        id: &QueueId,
        seq: Option<&str>,
        queued_ms: u64,
    ) -> crate::Result<u64> {
        let mut inner = self.inner.lock();
        let mut changed = 0;
        for ((row_id, row_seq), row) in &mut inner.rows {
            if row_id == id && seq.is_none_or(|seq| seq == row_seq) {
                row.delivery.queued = queued_ms;
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn delete(&self, id: &QueueId, seq: &str) -> crate::Result<bool> {
        Ok(self
            .inner
            .lock()
            .rows
            .remove(&(id.clone(), seq.to_string()))
            .is_some())
    }

    async fn delete_message(&self, id: &QueueId) -> crate::Result<u64> {
        let mut inner = self.inner.lock();
        let before = inner.rows.len();
        inner.rows.retain(|(row_id, _), _| row_id != id);
        Ok((before - inner.rows.len()) as u64)
    }

    async fn remaining_for_message(&self, id: &QueueId) -> crate::Result<u64> {
        Ok(self
            .inner
            .lock()
            .rows
            .keys()
            .filter(|(row_id, _)| row_id == id)
            .count() as u64)
    }

    async fn release_expired_locks(&self, instance: &str, cutoff_ms: u64) -> crate::Result<u64> {
        let mut inner = self.inner.lock();
        let mut released = 0;
        for row in inner.rows.values_mut() {
            if row.delivery.locked
                && row.delivery.assigned.as_deref() == Some(instance)
                && row.delivery.lock_time <= cutoff_ms
            {
                row.delivery.locked = false;
                row.delivery.lock_time = 0;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn take_expired(&self, cutoff_ms: u64) -> crate::Result<Vec<Delivery>> {
        let mut inner = self.inner.lock();
        let keys: Vec<(QueueId, String)> = inner
            .rows
            .values()
            .filter(|row| !row.delivery.locked && row.delivery.created <= cutoff_ms)
            .map(|row| (row.delivery.id.clone(), row.delivery.seq.clone()))
            .collect();

        let mut taken = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(row) = inner.rows.remove(&key) {
                taken.push(row.delivery);
            }
        }
        Ok(taken)
    }

    async fn counts(&self, zone: &str, now_ms: u64) -> crate::Result<QueueCounts> {
        let inner = self.inner.lock();
        let mut counts = QueueCounts::default();
        for row in inner.rows.values() {
            if row.delivery.sending_zone != zone {
                continue;
            }
            if row.delivery.queued <= now_ms {
                counts.queued += 1;
            } else {
                counts.deferred += 1;
            }
        }
        Ok(counts)
    }

    async fn counts_total(&self, now_ms: u64) -> crate::Result<QueueCounts> {
        let inner = self.inner.lock();
        let mut counts = QueueCounts::default();
        for row in inner.rows.values() {
            if row.delivery.queued <= now_ms {
                counts.queued += 1;
            } else {
                counts.deferred += 1;
            }
        }
        Ok(counts)
    }

    async fn list(
        &self,
        zone: &str,
        kind: ListKind,
        now_ms: u64,
        limit: usize,
    ) -> crate::Result<Vec<Delivery>> {
        let inner = self.inner.lock();
        let mut rows: Vec<(&StoredRow, u64)> = inner
            .rows
            .values()
            .filter(|row| {
                row.delivery.sending_zone == zone
                    && match kind {
                        ListKind::Active => row.delivery.queued <= now_ms,
                        ListKind::Deferred => row.delivery.queued > now_ms,
                    }
            })
            .map(|row| (row, row.order))
            .collect();

        rows.sort_by_key(|(row, order)| (row.delivery.queued, *order));
        Ok(rows
            .into_iter()
            .take(limit)
            .map(|(row, _)| row.delivery.clone())
            .collect())
    }

    async fn find_message(&self, id: &QueueId) -> crate::Result<Vec<Delivery>> {
        let inner = self.inner.lock();
        let mut rows: Vec<Delivery> = inner
            .rows
            .values()
            .filter(|row| &row.delivery.id == id)
            .map(|row| row.delivery.clone())
            .collect();
        rows.sort_by(|a, b| a.seq.cmp(&b.seq));
        Ok(rows)
    }

    async fn oldest_created(&self) -> crate::Result<Option<u64>> {
        Ok(self
            .inner
            .lock()
            .rows
            .values()
            .map(|row| row.delivery.created)
            .min())
    }
}
