//! Worker process: fetch, resolve, dial, hand off, report
//!
//! The SMTP conversation itself is not the core's business: a
//! `DeliveryHandler` receives a live connection plus the delivery
//! descriptor and reports one of three verdicts. Everything around that
//! lives here: concurrency, retry timing, and verdict bookkeeping over
//! the control plane.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use postrider_common::Signal;
use postrider_control::ControlClient;
use postrider_delivery::{Connection, DeliveryError, Dialer, MxResolver, RetryPolicy};
use postrider_queue::ScheduledDelivery;
use postrider_zones::{Throttle, Zone};
use tokio::sync::{Mutex, Semaphore, broadcast};
use tracing::{debug, error, info, warn};

/// What the SMTP session reported for one delivery
#[derive(Debug, Clone)]
pub enum DeliveryVerdict {
    /// Remote accepted the message
    Accepted,
    /// 5xx equivalent; release and bounce
    Permanent(String),
    /// 4xx equivalent; defer
    Temporary(String),
}

/// The pluggable SMTP conversation
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    /// Drive EHLO/MAIL/RCPT/DATA over the given connection
    async fn deliver(&self, connection: Connection, delivery: &ScheduledDelivery)
    -> DeliveryVerdict;
}

/// Token bucket pacing a zone's send rate
///
/// Tokens refill continuously at the configured messages-per-window
/// rate; each fetched delivery consumes one. The bucket starts full, so
/// a restart can burst up to one window's worth.
#[derive(Debug)]
struct ZoneThrottle {
    bucket: Mutex<TokenBucket>,
}

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl ZoneThrottle {
    fn new(throttle: Throttle) -> Self {
        let capacity = f64::from(throttle.messages.max(1));
        #[allow(clippy::cast_precision_loss)]
        let refill_per_sec = capacity / (throttle.window_secs.max(1) as f64);
        Self {
            bucket: Mutex::new(TokenBucket {
                tokens: capacity,
                capacity,
                refill_per_sec,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token, sleeping until one is available
    async fn acquire(&self) {
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                let elapsed = bucket.last_refill.elapsed().as_secs_f64();
                bucket.tokens =
                    (bucket.tokens + elapsed * bucket.refill_per_sec).min(bucket.capacity);
                bucket.last_refill = Instant::now();

                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - bucket.tokens) / bucket.refill_per_sec)
            };
            tokio::time::sleep(wait).await;
        }
    }
}

/// One worker process for one zone
pub struct Worker {
    client: Arc<ControlClient>,
    resolver: Arc<MxResolver>,
    dialer: Arc<Dialer>,
    zone: Arc<Zone>,
    handler: Arc<dyn DeliveryHandler>,
    retry: RetryPolicy,
    connections: usize,
    throttle: Option<ZoneThrottle>,
}

impl Worker {
    #[must_use]
    pub fn new(
        client: Arc<ControlClient>,
        resolver: Arc<MxResolver>,
        dialer: Arc<Dialer>,
        zone: Arc<Zone>,
        handler: Arc<dyn DeliveryHandler>,
        retry: RetryPolicy,
    ) -> Self {
        let connections = usize::try_from(zone.config().connections)
            .unwrap_or(1)
            .max(1);
        let throttle = zone.config().throttling.map(ZoneThrottle::new);
        Self {
            client,
            resolver,
            dialer,
            zone,
            handler,
            retry,
            connections,
            throttle,
        }
    }

    /// Fetch and process deliveries until shutdown
    ///
    /// Runs up to the zone's configured `connections` in parallel; an
    /// idle zone is polled with a small pause since the master paces us
    /// with its empty-zone marker anyway.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<Signal>) {
        let permits = Arc::new(Semaphore::new(self.connections));
        info!(zone = self.zone.name(), sessions = self.connections, "Worker running");

        loop {
            let permit = tokio::select! {
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                sig = shutdown.recv() => {
                    match sig {
                        Ok(Signal::Shutdown) | Err(_) => break,
                    }
                }
            };

            if let Some(throttle) = &self.throttle {
                throttle.acquire().await;
            }

            let fetched = tokio::select! {
                fetched = self.client.get() => fetched,
                sig = shutdown.recv() => {
                    match sig {
                        Ok(Signal::Shutdown) | Err(_) => break,
                    }
                }
            };

            match fetched {
                Ok(Some(delivery)) => {
                    let worker = Arc::clone(&self);
                    tokio::spawn(async move {
                        worker.process(delivery).await;
                        drop(permit);
                    });
                }
                Ok(None) => {
                    drop(permit);
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
                Err(e) => {
                    error!(error = %e, "Control connection lost, worker exiting");
                    break;
                }
            }
        }

        info!(zone = self.zone.name(), "Worker stopped");
    }

    /// One delivery attempt end to end
    async fn process(&self, scheduled: ScheduledDelivery) {
        let delivery = &scheduled.delivery;
        debug!(
            id = %delivery.id,
            seq = %delivery.seq,
            recipient = %delivery.recipient,
            "Processing delivery"
        );

        let connection = match self.establish(&scheduled).await {
            Ok(connection) => connection,
            Err(e) => {
                self.report_error(&scheduled, &e).await;
                return;
            }
        };

        match self.handler.deliver(connection, &scheduled).await {
            DeliveryVerdict::Accepted => {
                debug!(id = %delivery.id, seq = %delivery.seq, "Delivery accepted");
                self.report_release(&scheduled).await;
            }
            DeliveryVerdict::Permanent(response) => {
                self.report_bounce(&scheduled, &response).await;
            }
            DeliveryVerdict::Temporary(response) => {
                self.report_defer(&scheduled, &response).await;
            }
        }
    }

    async fn establish(
        &self,
        scheduled: &ScheduledDelivery,
    ) -> Result<Connection, DeliveryError> {
        let delivery = &scheduled.delivery;
        let candidates = self
            .resolver
            .resolve(&delivery.domain, self.zone.config().ignore_ipv6)
            .await?;
        self.dialer
            .connect(&self.zone, &delivery.domain, &delivery.recipient, candidates)
            .await
    }

    /// Route a pre-conversation failure to the right report
    async fn report_error(&self, scheduled: &ScheduledDelivery, error: &DeliveryError) {
        let response = error.smtp_response();
        if error.is_permanent() {
            self.report_bounce(scheduled, &response).await;
        } else {
            // System errors defer too: the message is deliverable, this
            // process just could not prove it right now.
            self.report_defer(scheduled, &response).await;
        }
    }

    async fn report_release(&self, scheduled: &ScheduledDelivery) {
        let delivery = &scheduled.delivery;
        if let Err(e) = self
            .client
            .release(&delivery.id, &delivery.seq, &scheduled.lock)
            .await
        {
            // The master reclaims the lock on disconnect; at-least-once
            // semantics may redeliver.
            warn!(id = %delivery.id, error = %e, "RELEASE failed");
        }
    }

    async fn report_defer(&self, scheduled: &ScheduledDelivery, response: &str) {
        let delivery = &scheduled.delivery;
        let attempts = delivery.deferred.as_ref().map_or(0, |d| d.count) + 1;

        if !self.retry.should_retry(attempts) {
            info!(
                id = %delivery.id,
                seq = %delivery.seq,
                attempts,
                "Retries exhausted, bouncing"
            );
            self.report_bounce(scheduled, response).await;
            return;
        }

        let ttl_ms = self.retry.defer_ttl_ms(attempts);
        debug!(id = %delivery.id, seq = %delivery.seq, ttl_ms, response, "Deferring");
        if let Err(e) = self
            .client
            .defer(&delivery.id, &delivery.seq, &scheduled.lock, ttl_ms, response, None)
            .await
        {
            warn!(id = %delivery.id, error = %e, "DEFER failed");
        }
    }

    async fn report_bounce(&self, scheduled: &ScheduledDelivery, response: &str) {
        let delivery = &scheduled.delivery;
        info!(
            id = %delivery.id,
            seq = %delivery.seq,
            recipient = %delivery.recipient,
            response,
            "Delivery failed permanently"
        );

        if let Err(e) = self
            .client
            .bounce(&delivery.id, &delivery.seq, response)
            .await
        {
            warn!(id = %delivery.id, error = %e, "BOUNCE failed");
        }
        self.report_release(scheduled).await;
    }
}
