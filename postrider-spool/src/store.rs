//! Blob store trait

use async_trait::async_trait;
use postrider_common::QueueId;
use tokio::io::AsyncRead;

use crate::meta::MessageMeta;

/// Readable body stream returned by [`BlobStore::retrieve`]
pub type BodyReader = Box<dyn AsyncRead + Send + Unpin>;

/// Storage for opaque rfc822 message bodies plus a metadata sidecar
///
/// One blob exists per message id at most; a blob without any delivery
/// row referencing its id is garbage once old enough. Implementations
/// must make `remove_message` idempotent: releasing the last two rows of
/// a message may race, and the loser must not fail.
#[async_trait]
pub trait BlobStore: Send + Sync + std::fmt::Debug {
    /// Stream a body into storage under `id`
    ///
    /// Returns the stored size. If the source stream errors mid-upload the
    /// partial blob is finalized (so the writer shuts down cleanly) and
    /// immediately deleted; the source error is returned to the caller.
    async fn store(&self, id: &QueueId, body: &mut (dyn AsyncRead + Send + Unpin))
    -> crate::Result<u64>;

    /// Open the stored body for reading
    async fn retrieve(&self, id: &QueueId) -> crate::Result<BodyReader>;

    /// Write or replace the metadata sidecar
    async fn set_meta(&self, id: &QueueId, meta: &MessageMeta) -> crate::Result<()>;

    /// Read the metadata sidecar
    async fn get_meta(&self, id: &QueueId) -> crate::Result<MessageMeta>;

    /// Delete body and metadata; missing entries are not an error
    async fn remove_message(&self, id: &QueueId) -> crate::Result<()>;

    /// Whether a body exists for `id`
    async fn exists(&self, id: &QueueId) -> crate::Result<bool>;

    /// Delete every blob whose id encodes a creation time at or before
    /// `cutoff_ms`; returns how many were removed
    ///
    /// Ids are time-sortable, so the cutoff is evaluated against the
    /// timestamp embedded in each id rather than filesystem mtimes.
    async fn delete_before(&self, cutoff_ms: u64) -> crate::Result<u64>;

    /// List ids of blobs uploaded at or before `cutoff_ms`
    async fn list_uploaded_before(&self, cutoff_ms: u64) -> crate::Result<Vec<QueueId>>;
}
