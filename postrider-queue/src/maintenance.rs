//! Background housekeeping
//!
//! One loop, two cadences: a slow sweep reclaiming stale locks, expiring
//! overdue rows, and collecting orphan bodies; a fast timer refreshing
//! the exported gauges. Housekeeping errors are logged and retried on
//! the next tick, never propagated into request paths.

use std::{sync::Arc, time::Duration};

use postrider_common::{Signal, now_ms};
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use crate::queue::Queue;

/// Tunables of the maintenance loop
#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    /// Cadence of the lock sweep / GC pass
    pub sweep_interval: Duration,

    /// Cadence of the gauge refresh
    pub gauge_interval: Duration,

    /// Age after which a held store lock is considered abandoned
    pub stale_lock_ttl: Duration,

    /// Minimum age of an orphan body before it is collected
    pub body_grace: Duration,

    /// Rows older than this are released without a bounce
    pub max_queue_time: Option<Duration>,

    /// Skip the orphan-body pass entirely
    pub disable_gc: bool,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(60),
            gauge_interval: Duration::from_secs(10),
            stale_lock_ttl: Duration::from_secs(61 * 60),
            body_grace: Duration::from_secs(10 * 60),
            max_queue_time: None,
            disable_gc: false,
        }
    }
}

/// The maintenance loop
#[derive(Debug)]
pub struct Maintenance {
    queue: Arc<Queue>,
    config: MaintenanceConfig,
}

impl Maintenance {
    #[must_use]
    pub const fn new(queue: Arc<Queue>, config: MaintenanceConfig) -> Self {
        Self { queue, config }
    }

    /// Run until shutdown
    pub async fn run(self, mut shutdown: broadcast::Receiver<Signal>) {
        let mut sweep_timer = tokio::time::interval(self.config.sweep_interval);
        let mut gauge_timer = tokio::time::interval(self.config.gauge_interval);
        sweep_timer.tick().await;
        gauge_timer.tick().await;

        info!("Maintenance loop started");
        loop {
            tokio::select! {
                _ = sweep_timer.tick() => {
                    if let Err(e) = self.sweep().await {
                        error!(error = %e, "Maintenance sweep failed");
                    }
                }
                _ = gauge_timer.tick() => {
                    if let Err(e) = self.export_gauges().await {
                        error!(error = %e, "Gauge export failed");
                    }
                }
                sig = shutdown.recv() => {
                    match sig {
                        Ok(Signal::Shutdown) | Err(_) => {
                            info!("Maintenance loop shutting down");
                            break;
                        }
                    }
                }
            }
        }
    }

    /// One full sweep: stale locks, max-queue-time, orphan bodies
    pub async fn sweep(&self) -> crate::Result<()> {
        let now = now_ms();

        // Stale store locks: reclaim without worker consent.
        let lock_cutoff = now.saturating_sub(ms(self.config.stale_lock_ttl));
        let reclaimed = self
            .queue
            .store()
            .release_expired_locks(self.queue.instance(), lock_cutoff)
            .await?;
        if reclaimed > 0 {
            info!(reclaimed, "Reclaimed stale store locks");
        }

        // Expired in-memory locks; the matching rows get unlocked too so
        // the next shift can pick them up.
        for entry in self.queue.locks().sweep_expired() {
            self.queue.store().unlock(&entry.id, &entry.seq).await?;
        }

        // Max queue time: overdue rows are released, no bounce.
        if let Some(max_queue_time) = self.config.max_queue_time {
            let age_cutoff = now.saturating_sub(ms(max_queue_time));
            let expired = self.queue.store().take_expired(age_cutoff).await?;
            if !expired.is_empty() {
                info!(count = expired.len(), "Released deliveries past max queue time");
            }
            for delivery in expired {
                if let Some(metrics) = self.queue.metrics() {
                    metrics
                        .dropped
                        .with_label_values(&[&delivery.sending_zone])
                        .inc();
                }
            }
        }

        // Orphan bodies: anything older than the oldest surviving row,
        // minus the grace margin, is unreferenced.
        if !self.config.disable_gc {
            let oldest = self.queue.store().oldest_created().await?.unwrap_or(now);
            let cutoff = oldest.saturating_sub(ms(self.config.body_grace));
            let collected = self.queue.blobs().delete_before(cutoff).await?;
            if collected > 0 {
                info!(collected, "Collected orphan message bodies");
            }
        }

        let purged = self.queue.fact_cache().purge_expired();
        if purged > 0 {
            debug!(purged, "Purged expired cache entries");
        }

        Ok(())
    }

    /// Refresh the queued/deferred/blacklist gauges
    pub async fn export_gauges(&self) -> crate::Result<()> {
        let Some(metrics) = self.queue.metrics() else {
            return Ok(());
        };

        for (zone, _) in self.queue.zones().iter() {
            let counts = self.queue.counts(zone).await?;
            #[allow(clippy::cast_possible_wrap)]
            {
                metrics
                    .queued_rows
                    .with_label_values(&[zone])
                    .set(counts.queued as i64);
                metrics
                    .deferred_rows
                    .with_label_values(&[zone])
                    .set(counts.deferred as i64);
            }
        }

        #[allow(clippy::cast_possible_wrap)]
        metrics
            .blacklist_entries
            .set(self.queue.fact_cache().count_prefix("blacklist:") as i64);
        Ok(())
    }
}

fn ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use ahash::AHashMap;
    use postrider_common::Envelope;
    use postrider_metrics::QueueMetrics;
    use postrider_spool::{BlobStore, MemoryBlobStore, MessageMeta};
    use postrider_zones::ZoneRegistry;

    use super::*;
    use crate::{
        queue::QueueConfig,
        store::{MemoryQueueStore, QueueStore},
    };

    struct Fixture {
        queue: Arc<Queue>,
        blobs: Arc<MemoryBlobStore>,
        store: Arc<MemoryQueueStore>,
    }

    fn fixture() -> Fixture {
        let blobs = Arc::new(MemoryBlobStore::new());
        let store = Arc::new(MemoryQueueStore::new());
        let zones = Arc::new(ZoneRegistry::new(AHashMap::new(), None));

        let mut config = QueueConfig::new("master-1");
        config.release_grace = Duration::ZERO;

        let queue = Queue::new(
            Arc::clone(&store) as Arc<dyn QueueStore>,
            Arc::clone(&blobs) as Arc<dyn BlobStore>,
            zones,
            config,
        )
        .with_metrics(QueueMetrics::new().expect("metrics"));

        Fixture {
            queue: Arc::new(queue),
            blobs,
            store,
        }
    }

    async fn store_and_push(fixture: &Fixture, recipient: &str) -> postrider_common::QueueId {
        let id = fixture.queue.next_id();
        let mut body = Cursor::new(b"x".to_vec());
        fixture.blobs.store(&id, &mut body).await.expect("store");
        fixture
            .blobs
            .set_meta(&id, &MessageMeta::new("a@x.test", vec![recipient.to_string()]))
            .await
            .expect("meta");

        let envelope = Envelope {
            from: "a@x.test".to_string(),
            to: vec![recipient.to_string()],
            ..Default::default()
        };
        fixture.queue.push(&id, envelope).await.expect("push");
        id
    }

    #[tokio::test]
    async fn test_orphan_body_collected_after_grace() {
        let fixture = fixture();

        // A body stored but never pushed is an orphan.
        let orphan = fixture.queue.next_id();
        let mut body = Cursor::new(b"orphan".to_vec());
        fixture.blobs.store(&orphan, &mut body).await.expect("store");

        // Long grace: survives the sweep.
        let keep = Maintenance::new(Arc::clone(&fixture.queue), MaintenanceConfig::default());
        keep.sweep().await.expect("sweep");
        assert!(fixture.blobs.exists(&orphan).await.expect("exists"));

        // Zero grace: collected.
        let collect = Maintenance::new(Arc::clone(&fixture.queue), MaintenanceConfig {
            body_grace: Duration::ZERO,
            ..Default::default()
        });
        // The cutoff is inclusive of the current instant only after a
        // beat passes.
        tokio::time::sleep(Duration::from_millis(5)).await;
        collect.sweep().await.expect("sweep");
        assert!(!fixture.blobs.exists(&orphan).await.expect("exists"));
    }

    #[tokio::test]
    async fn test_referenced_body_survives_gc() {
        let fixture = fixture();
        let id = store_and_push(&fixture, "b@y.test").await;

        // The grace margin keeps blobs near the oldest-row boundary out
        // of the collector's reach.
        let maintenance = Maintenance::new(Arc::clone(&fixture.queue), MaintenanceConfig {
            body_grace: Duration::from_secs(5),
            ..Default::default()
        });
        maintenance.sweep().await.expect("sweep");

        assert!(fixture.blobs.exists(&id).await.expect("exists"));
    }

    #[tokio::test]
    async fn test_stale_store_locks_reclaimed() {
        let fixture = fixture();
        store_and_push(&fixture, "b@y.test").await;

        let scheduled = fixture
            .queue
            .shift("default", "worker-1")
            .await
            .expect("shift")
            .expect("claimed");

        // A zero stale-lock TTL makes the held lock immediately stale.
        let maintenance = Maintenance::new(Arc::clone(&fixture.queue), MaintenanceConfig {
            stale_lock_ttl: Duration::ZERO,
            ..Default::default()
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        maintenance.sweep().await.expect("sweep");

        let rows = fixture
            .store
            .find_message(&scheduled.delivery.id)
            .await
            .expect("rows");
        assert!(!rows[0].locked, "stale lock must be reclaimed");
    }

    #[tokio::test]
    async fn test_max_queue_time_releases_without_bounce() {
        let fixture = fixture();
        store_and_push(&fixture, "b@y.test").await;

        let maintenance = Maintenance::new(Arc::clone(&fixture.queue), MaintenanceConfig {
            max_queue_time: Some(Duration::ZERO),
            ..Default::default()
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        maintenance.sweep().await.expect("sweep");

        assert!(fixture.store.is_empty(), "overdue row must be taken out");
    }

    #[tokio::test]
    async fn test_gauges_exported() {
        let fixture = fixture();
        store_and_push(&fixture, "b@y.test").await;

        let maintenance = Maintenance::new(
            Arc::clone(&fixture.queue),
            MaintenanceConfig::default(),
        );
        maintenance.export_gauges().await.expect("gauges");

        let rendered = fixture
            .queue
            .metrics()
            .expect("metrics")
            .render()
            .expect("render");
        assert!(rendered.contains("postrider_queued_rows"));
    }
}
