//! Error types for queue operations

use postrider_common::{QueueId, domain::AddressError};
use thiserror::Error;

/// Errors raised by the delivery queue
#[derive(Debug, Error)]
pub enum QueueError {
    /// Blob store failure (body or metadata).
    #[error("Spool error: {0}")]
    Spool(#[from] postrider_spool::SpoolError),

    /// Recipient or domain failed normalization.
    #[error("Address error: {0}")]
    Address(#[from] AddressError),

    /// Queue store operation failed.
    #[error("Store error: {0}")]
    Store(String),

    /// Delivery row does not exist.
    #[error("Delivery not found: {id}.{seq}")]
    NotFound { id: QueueId, seq: String },

    /// Envelope has no recipients after normalization.
    #[error("No deliverable recipients")]
    NoRecipients,

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Specialized `Result` for queue operations
pub type Result<T> = std::result::Result<T, QueueError>;
