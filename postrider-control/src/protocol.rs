//! Control protocol commands and replies
//!
//! Workers drive the conversation: one `Hello` to identify, then any mix
//! of in-flight requests matched to replies by `req` id. The master
//! answers out of order as deliveries become available.

use postrider_common::QueueId;
use postrider_queue::ScheduledDelivery;
use serde::{Deserialize, Serialize};

/// Commands a worker sends to the master
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Command {
    /// Identify this worker; the zone must exist or the master closes
    /// the connection
    Hello { zone: String, id: String },

    /// Request the next delivery for the worker's zone
    Get { req: u64 },

    /// Report success or permanent failure; the row is removed
    Release {
        req: u64,
        id: QueueId,
        seq: String,
        /// Lock string handed out with the delivery, echoed verbatim
        lock: String,
    },

    /// Report a temporary failure; the row is re-queued for `ttl_ms`
    /// from now
    Defer {
        req: u64,
        id: QueueId,
        seq: String,
        lock: String,
        ttl_ms: u64,
        response: String,
        log: Option<String>,
    },

    /// Report a hard failure for bounce processing
    Bounce {
        req: u64,
        id: QueueId,
        seq: String,
        response: String,
    },
}

impl Command {
    /// Request id of this command, if it expects a reply
    #[must_use]
    pub const fn req(&self) -> Option<u64> {
        match self {
            Self::Hello { .. } => None,
            Self::Get { req }
            | Self::Release { req, .. }
            | Self::Defer { req, .. }
            | Self::Bounce { req, .. } => Some(*req),
        }
    }
}

/// Replies the master sends back
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Reply {
    /// Answer to `Get`; `None` when the zone has no eligible work
    Delivery {
        req: u64,
        delivery: Option<Box<ScheduledDelivery>>,
    },

    /// Answer to `Release`/`Defer`/`Bounce`; `key` is `"id.seq"`
    Done { req: u64, key: String },

    /// The command failed
    Error { req: u64, message: String },
}

impl Reply {
    /// Request id this reply answers
    #[must_use]
    pub const fn req(&self) -> u64 {
        match self {
            Self::Delivery { req, .. } | Self::Done { req, .. } | Self::Error { req, .. } => *req,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_req_extraction() {
        let hello = Command::Hello {
            zone: "default".to_string(),
            id: "worker-1".to_string(),
        };
        assert_eq!(hello.req(), None);

        let get = Command::Get { req: 42 };
        assert_eq!(get.req(), Some(42));

        let reply = Reply::Done {
            req: 42,
            key: "abc.001".to_string(),
        };
        assert_eq!(reply.req(), 42);
    }
}
