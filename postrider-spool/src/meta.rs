//! Message metadata stored beside the body blob

use std::collections::HashMap;

use postrider_common::{Headers, now_ms};
use serde::{Deserialize, Serialize};

/// Metadata describing a stored message body
///
/// Written once by the submission frontend, read on every `shift` to fold
/// message-level facts into the delivery handed to a worker. The body
/// itself stays an opaque bytestream.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageMeta {
    /// Creation time, epoch ms
    pub created: u64,

    /// Envelope sender; empty for bounces
    pub envelope_from: String,

    /// Parsed envelope recipients
    pub recipients: Vec<String>,

    /// Parsed message headers
    #[serde(default)]
    pub headers: Headers,

    /// Originating interface or session
    pub session_id: Option<String>,

    /// Body size in bytes
    pub size: u64,

    /// Frontend-provided hints (MIME boundaries, DKIM keys, …) the core
    /// carries through without interpreting
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

impl MessageMeta {
    /// Metadata for a freshly accepted message
    #[must_use]
    pub fn new(envelope_from: impl Into<String>, recipients: Vec<String>) -> Self {
        Self {
            created: now_ms(),
            envelope_from: envelope_from.into(),
            recipients,
            ..Default::default()
        }
    }
}
