//! Error types for control-plane operations

use thiserror::Error;

/// Errors raised on the control plane
#[derive(Debug, Error)]
pub enum ControlError {
    /// I/O error on the control connection
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Frame body failed to serialize
    #[error("Protocol error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    /// Frame body failed to deserialize
    #[error("Protocol error: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    /// Peer announced a frame beyond the cap
    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(u32),

    /// Connection closed by the peer
    #[error("Connection closed")]
    ConnectionClosed,

    /// Request ran out its timer
    #[error("Request timeout")]
    Timeout,

    /// Master rejected the command
    #[error("Server error: {0}")]
    Server(String),

    /// First frame was not a HELLO, or the zone is unknown
    #[error("Handshake rejected: {0}")]
    Handshake(String),
}

/// Result type for control operations
pub type Result<T> = std::result::Result<T, ControlError>;
