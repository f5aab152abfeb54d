use std::{
    collections::HashMap,
    io::Cursor,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;
use postrider_common::QueueId;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{MessageMeta, SpoolError, store::BlobStore, store::BodyReader};

/// In-memory blob store
///
/// Bodies live in a `HashMap` behind an `RwLock`. Primarily for tests,
/// also usable for transient relays that accept losing the queue on
/// restart.
#[derive(Debug, Clone, Default)]
pub struct MemoryBlobStore {
    entries: Arc<RwLock<HashMap<QueueId, StoredMessage>>>,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    body: Vec<u8>,
    meta: Option<MessageMeta>,
}

impl MemoryBlobStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored bodies
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn store(
        &self,
        id: &QueueId,
        body: &mut (dyn AsyncRead + Send + Unpin),
    ) -> crate::Result<u64> {
        let mut buffer = Vec::new();
        if let Err(e) = body.read_to_end(&mut buffer).await {
            // Partial upload: nothing was published yet, surface the
            // source error untouched.
            return Err(SpoolError::Io(e));
        }

        let size = buffer.len() as u64;
        self.entries.write()?.insert(
            id.clone(),
            StoredMessage {
                body: buffer,
                meta: None,
            },
        );
        Ok(size)
    }

    async fn retrieve(&self, id: &QueueId) -> crate::Result<BodyReader> {
        let body = self
            .entries
            .read()?
            .get(id)
            .map(|stored| stored.body.clone())
            .ok_or_else(|| SpoolError::NotFound(id.clone()))?;
        Ok(Box::new(Cursor::new(body)))
    }

    async fn set_meta(&self, id: &QueueId, meta: &MessageMeta) -> crate::Result<()> {
        let mut entries = self.entries.write()?;
        let stored = entries
            .get_mut(id)
            .ok_or_else(|| SpoolError::NotFound(id.clone()))?;
        stored.meta = Some(meta.clone());
        Ok(())
    }

    async fn get_meta(&self, id: &QueueId) -> crate::Result<MessageMeta> {
        self.entries
            .read()?
            .get(id)
            .and_then(|stored| stored.meta.clone())
            .ok_or_else(|| SpoolError::NotFound(id.clone()))
    }

    async fn remove_message(&self, id: &QueueId) -> crate::Result<()> {
        self.entries.write()?.remove(id);
        Ok(())
    }

    async fn exists(&self, id: &QueueId) -> crate::Result<bool> {
        Ok(self.entries.read()?.contains_key(id))
    }

    async fn delete_before(&self, cutoff_ms: u64) -> crate::Result<u64> {
        let mut entries = self.entries.write()?;
        let before = entries.len();
        entries.retain(|id, _| id.timestamp_ms() > cutoff_ms);
        Ok((before - entries.len()) as u64)
    }

    async fn list_uploaded_before(&self, cutoff_ms: u64) -> crate::Result<Vec<QueueId>> {
        let mut ids: Vec<_> = self
            .entries
            .read()?
            .keys()
            .filter(|id| id.timestamp_ms() <= cutoff_ms)
            .cloned()
            .collect();
        ids.sort();
        Ok(ids)
    }
}
