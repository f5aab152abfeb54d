//! Queue façade
//!
//! Ties the stores, the lock table, the fact cache, suppression, and the
//! zone registry into the four operations the rest of the system calls:
//! `push`, `shift`, `release`, `defer`. The master owns exactly one of
//! these; workers reach it over the control plane.

use std::{sync::Arc, time::Duration};

use postrider_common::{
    Envelope, IdGenerator, QueueId, TtlCache,
    cache::{BLACKLIST_TTL, EMPTY_ZONE_TTL, blacklist_key, empty_zone_key},
    now_ms,
};
use postrider_metrics::QueueMetrics;
use postrider_spool::{BlobStore, MessageMeta, SpoolError};
use postrider_zones::{DomainConfigRegistry, ZoneRegistry};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    delivery::{Delivery, lock_key},
    hooks::{DeferTimeline, NoopHooks, QueueHooks, QueueObserver, QueuedSummary},
    locks::LockTable,
    router,
    store::{ListKind, QueueCounts, QueueStore},
    suppression::SuppressionList,
};

/// Tunables of the queue core
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Identity of this master; rows it claims carry this assignment
    pub instance: String,

    /// TTL of the in-memory scheduler lock
    pub lock_ttl: Duration,

    /// Back-off recorded when a zone probe finds nothing
    pub empty_zone_ttl: Duration,

    /// Grace between releasing the last row and deleting the body;
    /// zero deletes inline
    pub release_grace: Duration,

    /// Bounded retries when the store claim wins but the in-memory lock
    /// loses
    pub shift_attempts: usize,
}

impl QueueConfig {
    #[must_use]
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
            lock_ttl: Duration::from_secs(3600),
            empty_zone_ttl: EMPTY_ZONE_TTL,
            release_grace: Duration::from_secs(10),
            shift_attempts: 5,
        }
    }
}

/// Outcome of a `push`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushReceipt {
    pub id: QueueId,
    /// Rows inserted
    pub queued: usize,
    /// The message was a forwarding loop and was dropped silently
    pub dropped_loop: bool,
}

/// A claimed delivery handed to a worker
///
/// Metadata rides alongside the row rather than merged into it, so
/// message-level keys can never clobber row fields like `sending_zone`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledDelivery {
    pub delivery: Delivery,
    pub meta: MessageMeta,
    /// String form of the scheduler lock, echoed back in RELEASE/DEFER
    pub lock: String,
}

/// The delivery queue core
pub struct Queue {
    store: Arc<dyn QueueStore>,
    blobs: Arc<dyn BlobStore>,
    locks: LockTable,
    cache: Arc<TtlCache<()>>,
    suppression: SuppressionList,
    zones: Arc<ZoneRegistry>,
    domains: DomainConfigRegistry,
    hooks: Arc<dyn QueueHooks>,
    observer: Option<Arc<dyn QueueObserver>>,
    metrics: Option<QueueMetrics>,
    ids: IdGenerator,
    config: QueueConfig,
}

impl Queue {
    #[must_use]
    pub fn new(
        store: Arc<dyn QueueStore>,
        blobs: Arc<dyn BlobStore>,
        zones: Arc<ZoneRegistry>,
        config: QueueConfig,
    ) -> Self {
        Self {
            store,
            blobs,
            locks: LockTable::new(),
            cache: Arc::new(TtlCache::new()),
            suppression: SuppressionList::new(),
            zones,
            domains: DomainConfigRegistry::default(),
            hooks: Arc::new(NoopHooks),
            observer: None,
            metrics: None,
            ids: IdGenerator::new(),
            config,
        }
    }

    #[must_use]
    pub fn with_domains(mut self, domains: DomainConfigRegistry) -> Self {
        self.domains = domains;
        self
    }

    #[must_use]
    pub fn with_hooks(mut self, hooks: Arc<dyn QueueHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn QueueObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: QueueMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Fresh message id for a submission about to be stored
    #[must_use]
    pub fn next_id(&self) -> QueueId {
        self.ids.generate()
    }

    /// Expand an envelope into delivery rows and insert them atomically
    ///
    /// The body (and its metadata) must already be stored under `id`.
    /// Nothing becomes visible to schedulers unless the whole batch
    /// lands. Looped messages (`Received` count above the cap) are
    /// dropped silently.
    pub async fn push(&self, id: &QueueId, envelope: Envelope) -> crate::Result<PushReceipt> {
        if router::is_looped(&envelope) {
            info!(id = %id, "Dropping looped message");
            if let Some(metrics) = &self.metrics {
                metrics
                    .dropped
                    .with_label_values(&[self.zones.default_zone()])
                    .inc();
            }
            return Ok(PushReceipt {
                id: id.clone(),
                queued: 0,
                dropped_loop: true,
            });
        }

        let rows = router::expand(id, envelope, &self.zones, self.hooks.as_ref()).await?;
        let summaries: Vec<QueuedSummary> = rows
            .iter()
            .map(|row| QueuedSummary {
                id: row.id.clone(),
                seq: row.seq.clone(),
                recipient: row.recipient.clone(),
                zone: row.sending_zone.clone(),
            })
            .collect();

        let queued = rows.len();
        self.store.insert(rows).await?;

        for summary in &summaries {
            debug!(
                id = %summary.id,
                seq = %summary.seq,
                recipient = %summary.recipient,
                zone = %summary.zone,
                "Delivery queued"
            );
            if let Some(metrics) = &self.metrics {
                metrics.pushed.with_label_values(&[&summary.zone]).inc();
            }
            if let Some(observer) = &self.observer {
                observer.on_queued(summary);
            }
        }

        Ok(PushReceipt {
            id: id.clone(),
            queued,
            dropped_loop: false,
        })
    }

    /// Hand the next eligible delivery of a zone to `lock_owner`
    ///
    /// Returns `None` when the zone has no eligible work; that fact is
    /// cached briefly so hot polling stays cheap.
    pub async fn shift(
        &self,
        zone: &str,
        lock_owner: &str,
    ) -> crate::Result<Option<ScheduledDelivery>> {
        if self.cache.contains(&empty_zone_key(zone)) {
            return Ok(None);
        }

        for _ in 0..self.config.shift_attempts {
            let now = now_ms();
            let skip = self.locks.skip_domains(zone);

            let Some(delivery) = self
                .store
                .claim_next(zone, now, &self.config.instance, &skip)
                .await?
            else {
                self.cache
                    .set(empty_zone_key(zone), (), self.config.empty_zone_ttl);
                return Ok(None);
            };

            let max_connections = self.domains.max_connections(&delivery.domain);
            if !self.locks.lock(
                &delivery.id,
                &delivery.seq,
                zone,
                &delivery.domain,
                lock_owner,
                max_connections,
                self.config.lock_ttl,
            ) {
                // The domain saturated between the store claim and here.
                // Put the row back; another shift will re-pick it.
                self.store.unlock(&delivery.id, &delivery.seq).await?;
                continue;
            }

            let meta = match self.blobs.get_meta(&delivery.id).await {
                Ok(meta) => meta,
                Err(SpoolError::NotFound(_)) => {
                    // The body was collected under us; the rows are
                    // stale and undeliverable.
                    warn!(id = %delivery.id, "Message body missing, deleting stale rows");
                    self.store.delete_message(&delivery.id).await?;
                    self.locks.release(&delivery.id, &delivery.seq);
                    continue;
                }
                // Store I/O trouble: keep both locks, the sweep reclaims
                // them once the TTL runs out.
                Err(e) => return Err(e.into()),
            };

            if self.suppression.matches(&delivery.recipient, &delivery.domain) {
                info!(
                    id = %delivery.id,
                    seq = %delivery.seq,
                    recipient = %delivery.recipient,
                    "Recipient suppressed, dropping delivery"
                );
                if let Some(metrics) = &self.metrics {
                    metrics
                        .dropped
                        .with_label_values(&[&delivery.sending_zone])
                        .inc();
                }
                self.release(&delivery.id, &delivery.seq, false).await?;
                continue;
            }

            let lock = lock_key(&delivery.id, &delivery.seq);
            return Ok(Some(ScheduledDelivery {
                delivery,
                meta,
                lock,
            }));
        }

        Ok(None)
    }

    /// Remove a delivery row after success, permanent failure, or drop
    ///
    /// Idempotent. When the last row of a message goes, the body follows
    /// after the release grace (immediately when `skip_delay_delete`).
    pub async fn release(
        &self,
        id: &QueueId,
        seq: &str,
        skip_delay_delete: bool,
    ) -> crate::Result<()> {
        self.store.delete(id, seq).await?;
        self.locks.release(id, seq);

        if self.store.remaining_for_message(id).await? == 0 {
            if skip_delay_delete || self.config.release_grace.is_zero() {
                self.blobs.remove_message(id).await?;
            } else {
                let blobs = Arc::clone(&self.blobs);
                let store = Arc::clone(&self.store);
                let grace = self.config.release_grace;
                let id = id.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(grace).await;
                    // Re-check: a bounce DSN or admin requeue may have
                    // revived the reference in the meantime.
                    if let Ok(0) = store.remaining_for_message(&id).await
                        && let Err(e) = blobs.remove_message(&id).await
                    {
                        warn!(id = %id, error = %e, "Delayed body removal failed");
                    }
                });
            }
        }
        Ok(())
    }

    /// Return a claimed delivery to the queue with a future `queued`
    pub async fn defer(
        &self,
        id: &QueueId,
        seq: &str,
        ttl_ms: u64,
        response: &str,
        log: Option<&str>,
    ) -> crate::Result<()> {
        let now = now_ms();
        let next = now + ttl_ms;

        let outcome = self
            .store
            .defer(id, seq, now, next, response, log)
            .await?
            .ok_or_else(|| crate::QueueError::NotFound {
                id: id.clone(),
                seq: seq.to_string(),
            })?;

        self.locks.release(id, seq);

        if let Some(metrics) = &self.metrics {
            metrics
                .deferred
                .with_label_values(&[&outcome.delivery.sending_zone])
                .inc();
        }

        if let Some(previous) = outcome.previous {
            let timeline = DeferTimeline {
                first: previous.first,
                prev: previous.last,
                last: now,
            };
            self.hooks.delayed(&outcome.delivery, timeline).await;
        }

        Ok(())
    }

    /// Run the bounce extension for a delivery a worker failed hard
    pub async fn bounce(&self, id: &QueueId, seq: &str, response: &str) -> crate::Result<()> {
        let rows = self.store.find_message(id).await?;
        let Some(delivery) = rows.into_iter().find(|row| row.seq == seq) else {
            return Err(crate::QueueError::NotFound {
                id: id.clone(),
                seq: seq.to_string(),
            });
        };

        let meta = match self.blobs.get_meta(id).await {
            Ok(meta) => Some(meta),
            Err(SpoolError::NotFound(_)) => None,
            Err(e) => return Err(e.into()),
        };

        if let Some(metrics) = &self.metrics {
            metrics
                .bounced
                .with_label_values(&[&delivery.sending_zone])
                .inc();
        }
        self.hooks.bounce(&delivery, meta.as_ref(), response).await;
        Ok(())
    }

    /// Release every lock a worker holds and make its rows eligible again
    ///
    /// Called by the control plane on any disconnect; this is what keeps
    /// deliveries from being lost with their worker.
    pub async fn release_lock_owner(&self, owner: &str) -> crate::Result<u64> {
        let released = self.locks.release_owner(owner);
        let mut unlocked = 0;
        for entry in released {
            self.store.unlock(&entry.id, &entry.seq).await?;
            unlocked += 1;
        }
        if unlocked > 0 {
            info!(owner, unlocked, "Released locks of disconnected worker");
        }
        Ok(unlocked)
    }

    /// Reset `queued` on a row, or a whole message when `seq` is `None`
    pub async fn requeue(
        &self,
        id: &QueueId,
        seq: Option<&str>,
        queued_ms: u64,
    ) -> crate::Result<u64> {
        self.store.set_queued(id, seq, queued_ms).await
    }

    /// Record a blacklisted (destination domain, address) pair
    pub fn blacklist(&self, domain: &str, addr: &str) {
        self.cache.set(blacklist_key(domain, addr), (), BLACKLIST_TTL);
    }

    pub async fn counts(&self, zone: &str) -> crate::Result<QueueCounts> {
        self.store.counts(zone, now_ms()).await
    }

    pub async fn counts_total(&self) -> crate::Result<QueueCounts> {
        self.store.counts_total(now_ms()).await
    }

    pub async fn list(
        &self,
        zone: &str,
        kind: ListKind,
        limit: usize,
    ) -> crate::Result<Vec<Delivery>> {
        self.store.list(zone, kind, now_ms(), limit).await
    }

    /// Per-recipient status of one message
    pub async fn message_status(&self, id: &QueueId) -> crate::Result<Vec<Delivery>> {
        self.store.find_message(id).await
    }

    #[must_use]
    pub const fn suppression(&self) -> &SuppressionList {
        &self.suppression
    }

    #[must_use]
    pub fn fact_cache(&self) -> Arc<TtlCache<()>> {
        Arc::clone(&self.cache)
    }

    #[must_use]
    pub const fn zones(&self) -> &Arc<ZoneRegistry> {
        &self.zones
    }

    #[must_use]
    pub const fn domains(&self) -> &DomainConfigRegistry {
        &self.domains
    }

    #[must_use]
    pub const fn metrics(&self) -> Option<&QueueMetrics> {
        self.metrics.as_ref()
    }

    #[must_use]
    pub fn instance(&self) -> &str {
        &self.config.instance
    }

    pub(crate) const fn store(&self) -> &Arc<dyn QueueStore> {
        &self.store
    }

    pub(crate) const fn blobs(&self) -> &Arc<dyn BlobStore> {
        &self.blobs
    }

    pub(crate) const fn locks(&self) -> &LockTable {
        &self.locks
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("instance", &self.config.instance)
            .field("locks", &self.locks.len())
            .finish_non_exhaustive()
    }
}
