//! Spool failure types
//!
//! One flat enum covers everything the blob store can get wrong:
//! filesystem trouble, a sidecar that will not round-trip through
//! bincode, lookups for messages that are not there, and a spool
//! directory the process cannot actually use.

use std::io;

use postrider_common::QueueId;
use thiserror::Error;

/// What went wrong inside the blob store
#[derive(Debug, Error)]
pub enum SpoolError {
    /// Reading, writing, or deleting a spool file failed.
    #[error("Spool I/O failed: {0}")]
    Io(#[from] io::Error),

    /// A metadata sidecar would not encode.
    #[error("Metadata would not encode: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    /// A metadata sidecar would not decode; the file is truncated or
    /// written by an incompatible build.
    #[error("Metadata would not decode: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    /// Nothing is stored under this id.
    #[error("No stored message for {0}")]
    NotFound(QueueId),

    /// The configured spool location cannot be used as a directory.
    #[error("Unusable spool directory {path}: {problem}")]
    BadSpoolDir { path: String, problem: String },

    /// A writer panicked while holding the in-memory state guard.
    #[error("Spool state poisoned: {0}")]
    Poisoned(String),
}

/// Specialized `Result` for spool operations
pub type Result<T> = std::result::Result<T, SpoolError>;

impl<T> From<std::sync::PoisonError<T>> for SpoolError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        Self::Poisoned(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use postrider_common::IdGenerator;

    use super::*;

    #[test]
    fn test_not_found_names_the_id() {
        let id = IdGenerator::new().generate();
        let error = SpoolError::NotFound(id.clone());
        assert!(error.to_string().contains(id.as_str()));
    }

    #[test]
    fn test_io_and_poison_conversions() {
        let from_io: SpoolError =
            io::Error::new(io::ErrorKind::PermissionDenied, "spool is read-only").into();
        assert!(matches!(from_io, SpoolError::Io(_)));

        let poisoned = std::sync::Mutex::new(());
        let _ = std::panic::catch_unwind(|| {
            let _guard = poisoned.lock().unwrap();
            panic!("poison the guard");
        });
        let from_poison: SpoolError = poisoned.lock().unwrap_err().into();
        assert!(matches!(from_poison, SpoolError::Poisoned(_)));
    }
}
