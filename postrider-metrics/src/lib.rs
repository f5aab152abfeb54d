//! Prometheus metrics for the relay core
//!
//! The core only maintains the registry; serving `/metrics` is the HTTP
//! frontend's job, which calls [`QueueMetrics::render`] for the text
//! exposition.

use prometheus::{Encoder, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use thiserror::Error;

/// Errors raised while registering or rendering metrics
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("Prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),
}

/// Counters and gauges exported by the queue core
#[derive(Clone)]
pub struct QueueMetrics {
    registry: Registry,

    /// Deliveries inserted by the router, per zone
    pub pushed: IntCounterVec,
    /// Deliveries released after remote acceptance, per zone
    pub delivered: IntCounterVec,
    /// Defer operations, per zone
    pub deferred: IntCounterVec,
    /// Bounce notifications generated, per zone
    pub bounced: IntCounterVec,
    /// Deliveries dropped without bounce (suppression, loops, expiry)
    pub dropped: IntCounterVec,

    /// Rows currently eligible, per zone
    pub queued_rows: IntGaugeVec,
    /// Rows currently waiting on a future `queued`, per zone
    pub deferred_rows: IntGaugeVec,
    /// Live `blacklist:*` cache entries
    pub blacklist_entries: IntGauge,
}

impl QueueMetrics {
    /// Create and register every metric on a fresh registry
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let pushed = IntCounterVec::new(
            Opts::new("postrider_pushed_total", "Deliveries queued by the router"),
            &["zone"],
        )?;
        let delivered = IntCounterVec::new(
            Opts::new("postrider_delivered_total", "Deliveries released after acceptance"),
            &["zone"],
        )?;
        let deferred = IntCounterVec::new(
            Opts::new("postrider_deferred_total", "Defer operations"),
            &["zone"],
        )?;
        let bounced = IntCounterVec::new(
            Opts::new("postrider_bounced_total", "Bounce notifications generated"),
            &["zone"],
        )?;
        let dropped = IntCounterVec::new(
            Opts::new("postrider_dropped_total", "Deliveries dropped without bounce"),
            &["zone"],
        )?;
        let queued_rows = IntGaugeVec::new(
            Opts::new("postrider_queued_rows", "Rows eligible for delivery"),
            &["zone"],
        )?;
        let deferred_rows = IntGaugeVec::new(
            Opts::new("postrider_deferred_rows", "Rows deferred to a future time"),
            &["zone"],
        )?;
        let blacklist_entries = IntGauge::new(
            "postrider_blacklist_entries",
            "Live blacklist cache entries",
        )?;

        registry.register(Box::new(pushed.clone()))?;
        registry.register(Box::new(delivered.clone()))?;
        registry.register(Box::new(deferred.clone()))?;
        registry.register(Box::new(bounced.clone()))?;
        registry.register(Box::new(dropped.clone()))?;
        registry.register(Box::new(queued_rows.clone()))?;
        registry.register(Box::new(deferred_rows.clone()))?;
        registry.register(Box::new(blacklist_entries.clone()))?;

        Ok(Self {
            registry,
            pushed,
            delivered,
            deferred,
            bounced,
            dropped,
            queued_rows,
            deferred_rows,
            blacklist_entries,
        })
    }

    /// Text exposition of every registered metric
    pub fn render(&self) -> Result<String, MetricsError> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }

    #[must_use]
    pub const fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl std::fmt::Debug for QueueMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueMetrics").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_render() {
        let metrics = QueueMetrics::new().unwrap();
        metrics.pushed.with_label_values(&["default"]).inc();
        metrics.queued_rows.with_label_values(&["default"]).set(3);
        metrics.blacklist_entries.set(2);

        let rendered = metrics.render().unwrap();
        assert!(rendered.contains("postrider_pushed_total"));
        assert!(rendered.contains("postrider_queued_rows"));
        assert!(rendered.contains("postrider_blacklist_entries 2"));
    }

    #[test]
    fn test_independent_registries() {
        // Two instances must not collide the way a global registry would.
        let a = QueueMetrics::new().unwrap();
        let b = QueueMetrics::new().unwrap();
        a.pushed.with_label_values(&["z"]).inc();
        assert!(a.render().unwrap().contains("zone=\"z\""));
        assert!(!b.render().unwrap().contains("zone=\"z\""));
    }
}
