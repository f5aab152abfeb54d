//! Bounce hook: compose a DSN and feed it back through the router
//!
//! Installed as the queue's bounce extension. The generated notification
//! is a first-class message: stored like any submission, routed like any
//! envelope, and immune to bouncing again since its envelope sender is
//! null.

use std::{
    io::Cursor,
    sync::{Arc, OnceLock, Weak},
};

use async_trait::async_trait;
use postrider_common::now_ms;
use postrider_delivery::{DsnConfig, compose_dsn};
use postrider_queue::{Delivery, Queue, QueueHooks};
use postrider_spool::{BlobStore, MessageMeta};
use tracing::{info, warn};

/// Queue bounce hook generating RFC 3464 notifications
pub struct DsnBounceHook {
    config: DsnConfig,
    blobs: Arc<dyn BlobStore>,
    queue: OnceLock<Weak<Queue>>,
}

impl DsnBounceHook {
    #[must_use]
    pub fn new(config: DsnConfig, blobs: Arc<dyn BlobStore>) -> Self {
        Self {
            config,
            blobs,
            queue: OnceLock::new(),
        }
    }

    /// Late-bind the queue; the hook is constructed before the queue
    /// that owns it
    pub fn bind(&self, queue: &Arc<Queue>) {
        let _ = self.queue.set(Arc::downgrade(queue));
    }
}

#[async_trait]
impl QueueHooks for DsnBounceHook {
    async fn bounce(&self, delivery: &Delivery, meta: Option<&MessageMeta>, response: &str) {
        let Some(meta) = meta else {
            warn!(id = %delivery.id, "No metadata for bounced delivery, skipping DSN");
            return;
        };
        let Some(dsn) = compose_dsn(&self.config, meta, &delivery.recipient, response) else {
            return;
        };
        let Some(queue) = self.queue.get().and_then(Weak::upgrade) else {
            warn!("Bounce hook not bound to a queue");
            return;
        };

        let id = queue.next_id();
        let body = dsn.body.into_bytes();
        let size = body.len() as u64;

        let mut reader = Cursor::new(body);
        if let Err(e) = self.blobs.store(&id, &mut reader).await {
            warn!(id = %id, error = %e, "Failed to store DSN body");
            return;
        }

        let dsn_meta = MessageMeta {
            created: now_ms(),
            envelope_from: String::new(),
            recipients: dsn.envelope.to.clone(),
            headers: postrider_common::Headers::new(),
            session_id: dsn.envelope.session_id.clone(),
            size,
            attributes: std::collections::HashMap::new(),
        };
        if let Err(e) = self.blobs.set_meta(&id, &dsn_meta).await {
            warn!(id = %id, error = %e, "Failed to store DSN metadata");
            return;
        }

        match queue.push(&id, dsn.envelope).await {
            Ok(receipt) => {
                info!(
                    original = %delivery.id,
                    dsn = %receipt.id,
                    "Bounce notification queued"
                );
            }
            Err(e) => {
                warn!(id = %id, error = %e, "Failed to queue DSN");
                let _ = self.blobs.remove_message(&id).await;
            }
        }
    }
}

impl std::fmt::Debug for DsnBounceHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DsnBounceHook")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
