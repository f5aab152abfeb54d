//! Master process wiring
//!
//! The master owns the queue core and serves the control plane. Workers
//! are separate processes; everything they do to the queue flows through
//! the `CommandHandler` implementation here.

use std::sync::Arc;

use async_trait::async_trait;
use postrider_common::{QueueId, Signal};
use postrider_control::{CommandHandler, ControlServer};
use postrider_metrics::QueueMetrics;
use postrider_queue::{
    Maintenance, MaintenanceConfig, Queue, QueueError, ScheduledDelivery,
};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// The master: queue core + control plane + maintenance
pub struct Master {
    queue: Arc<Queue>,
    maintenance: MaintenanceConfig,
}

impl Master {
    #[must_use]
    pub const fn new(queue: Arc<Queue>, maintenance: MaintenanceConfig) -> Self {
        Self { queue, maintenance }
    }

    #[must_use]
    pub fn queue(&self) -> Arc<Queue> {
        Arc::clone(&self.queue)
    }

    /// Handler the control server dispatches into
    #[must_use]
    pub fn handler(&self) -> Arc<MasterHandler> {
        Arc::new(MasterHandler {
            queue: Arc::clone(&self.queue),
        })
    }

    /// Run the control server and the maintenance loop until shutdown
    pub async fn serve(
        self,
        addr: std::net::SocketAddr,
        shutdown: &broadcast::Sender<Signal>,
    ) -> anyhow::Result<()> {
        let server = ControlServer::bind(addr, self.handler()).await?;
        info!(addr = %addr, instance = self.queue.instance(), "Master starting");

        let maintenance = Maintenance::new(Arc::clone(&self.queue), self.maintenance.clone());
        let maintenance_shutdown = shutdown.subscribe();
        let maintenance_task = tokio::spawn(async move {
            maintenance.run(maintenance_shutdown).await;
        });

        let result = server.serve(shutdown.subscribe()).await;
        let _ = maintenance_task.await;
        Ok(result?)
    }
}

/// `CommandHandler` over the queue core
pub struct MasterHandler {
    queue: Arc<Queue>,
}

impl MasterHandler {
    fn flatten(operation: &str, error: &QueueError) -> String {
        warn!(operation, error = %error, "Control command failed");
        error.to_string()
    }
}

#[async_trait]
impl CommandHandler for MasterHandler {
    fn zone_known(&self, zone: &str) -> bool {
        self.queue.zones().exists(zone)
    }

    async fn get(
        &self,
        zone: &str,
        lock_owner: &str,
    ) -> Result<Option<ScheduledDelivery>, String> {
        self.queue
            .shift(zone, lock_owner)
            .await
            .map_err(|e| Self::flatten("GET", &e))
    }

    async fn release(
        &self,
        zone: &str,
        id: &QueueId,
        seq: &str,
        _lock: &str,
    ) -> Result<(), String> {
        self.queue
            .release(id, seq, false)
            .await
            .map_err(|e| Self::flatten("RELEASE", &e))?;

        if let Some(metrics) = self.queue.metrics() {
            metrics.delivered.with_label_values(&[zone]).inc();
        }
        Ok(())
    }

    async fn defer(
        &self,
        _zone: &str,
        id: &QueueId,
        seq: &str,
        _lock: &str,
        ttl_ms: u64,
        response: &str,
        log: Option<&str>,
    ) -> Result<(), String> {
        self.queue
            .defer(id, seq, ttl_ms, response, log)
            .await
            .map_err(|e| Self::flatten("DEFER", &e))
    }

    async fn bounce(
        &self,
        _zone: &str,
        id: &QueueId,
        seq: &str,
        response: &str,
    ) -> Result<(), String> {
        self.queue
            .bounce(id, seq, response)
            .await
            .map_err(|e| Self::flatten("BOUNCE", &e))
    }

    async fn disconnected(&self, lock_owner: &str) {
        if let Err(e) = self.queue.release_lock_owner(lock_owner).await {
            error!(lock_owner, error = %e, "Failed to release worker locks");
        }
    }
}

/// Build a metrics registry, logging rather than failing when metric
/// registration is impossible
#[must_use]
pub fn init_metrics() -> Option<QueueMetrics> {
    match QueueMetrics::new() {
        Ok(metrics) => Some(metrics),
        Err(e) => {
            warn!(error = %e, "Metrics disabled");
            None
        }
    }
}
