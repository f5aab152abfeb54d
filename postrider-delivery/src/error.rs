//! Typed error handling for delivery attempts
//!
//! Failures fall into three kinds: permanent (5xx; the caller releases
//! and may bounce), temporary (4xx; the caller defers), and system
//! (internal trouble that must not masquerade as a remote verdict).
//! Every remote-facing error renders an SMTP-style response string that
//! the defer bookkeeping and the bounce generator record verbatim.

use thiserror::Error;

/// Top-level delivery error
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Permanent failure (5xx); do not retry.
    #[error("Permanent failure: {0}")]
    Permanent(#[from] PermanentError),

    /// Temporary failure (4xx); retry with backoff.
    #[error("Temporary failure: {0}")]
    Temporary(#[from] TemporaryError),

    /// Internal error; neither verdict applies.
    #[error("System error: {0}")]
    System(#[from] SystemError),
}

/// Permanent errors that should not be retried
#[derive(Debug, Error)]
pub enum PermanentError {
    /// No MX, A, or AAAA records exist for the domain.
    #[error("No mail servers available for domain: {0}")]
    NoMailServers(String),

    /// Every resolved address was rejected by the validity filter.
    #[error("No valid mail server addresses for {domain}: {reason}")]
    InvalidAddresses { domain: String, reason: String },

    /// Connecting to a literal-IP destination failed outright.
    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    /// The remote rejected the message.
    #[error("Message rejected: {0}")]
    MessageRejected(String),
}

/// Temporary errors worth retrying with backoff
#[derive(Debug, Error)]
pub enum TemporaryError {
    /// DNS infrastructure failure (not NXDOMAIN/NODATA).
    #[error("DNS lookup failed: {0}")]
    DnsLookup(String),

    /// Every MX candidate refused the connection.
    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    /// A connection attempt ran out the per-attempt timer.
    #[error("Connection timed out: {0}")]
    Timeout(String),

    /// The remote answered with a 4xx.
    #[error("Temporary SMTP error: {0}")]
    SmtpTemporary(String),
}

/// Internal errors
#[derive(Debug, Error)]
pub enum SystemError {
    /// Blob store failure while preparing the attempt.
    #[error("Spool error: {0}")]
    Spool(#[from] postrider_spool::SpoolError),

    /// I/O error outside the remote conversation.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Other internal errors.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl DeliveryError {
    /// Whether the caller should defer
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        matches!(self, Self::Temporary(_))
    }

    /// Whether the caller should release (and possibly bounce)
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }

    /// SMTP-style response line recorded by defer/bounce bookkeeping
    #[must_use]
    pub fn smtp_response(&self) -> String {
        match self {
            Self::Permanent(e) => format!("550 {e}"),
            Self::Temporary(e) => format!("450 {e}"),
            Self::System(e) => format!("451 {e}"),
        }
    }
}
