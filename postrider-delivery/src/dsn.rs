//! Delivery Status Notification (bounce) composition per RFC 3464
//!
//! Builds the multipart/report message sent back to the original sender
//! when a delivery fails for good. The queue core only invokes this
//! through its bounce hook; re-submission goes back through the router
//! with a null envelope sender so a failing DSN can never bounce again.

use mailparse::MailAddr;
use postrider_common::Envelope;
use postrider_spool::MessageMeta;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Configuration for DSN generation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DsnConfig {
    /// Generate DSNs at all
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// FQDN reported in the Reporting-MTA field
    #[serde(default = "default_reporting_mta")]
    pub reporting_mta: String,

    /// From address of generated DSNs
    #[serde(default = "default_postmaster")]
    pub postmaster: String,
}

const fn default_enabled() -> bool {
    true
}

fn default_reporting_mta() -> String {
    "localhost".to_string()
}

fn default_postmaster() -> String {
    "postmaster@localhost".to_string()
}

impl Default for DsnConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            reporting_mta: default_reporting_mta(),
            postmaster: default_postmaster(),
        }
    }
}

/// A composed bounce ready for storage and routing
#[derive(Debug, Clone)]
pub struct ComposedDsn {
    /// Envelope for re-submission: null sender, original sender as the
    /// sole recipient
    pub envelope: Envelope,
    /// Full rfc822 body of the notification
    pub body: String,
}

/// Compose a DSN for one failed recipient
///
/// Returns `None` when no DSN must be generated: generation disabled, or
/// the original sender is null (bounces never bounce).
#[must_use]
pub fn compose_dsn(
    config: &DsnConfig,
    meta: &MessageMeta,
    failed_recipient: &str,
    response: &str,
) -> Option<ComposedDsn> {
    if !config.enabled {
        return None;
    }

    let sender = clean_address(&meta.envelope_from)?;

    info!(recipient = failed_recipient, response, "Composing delivery status notification");

    let boundary = format!("----=_Part_{}", ulid::Ulid::new());
    let status_code = if response.starts_with('5') { "5.0.0" } else { "4.0.0" };

    let human_readable = format!(
        "This is the mail system at {mta}.\r\n\
         \r\n\
         Your message could not be delivered to one or more recipients.\r\n\
         \r\n\
         <{recipient}>: {response}\r\n",
        mta = config.reporting_mta,
        recipient = failed_recipient,
    );

    let machine_readable = format!(
        "Reporting-MTA: dns; {mta}\r\n\
         \r\n\
         Final-Recipient: rfc822; {recipient}\r\n\
         Action: failed\r\n\
         Status: {status_code}\r\n\
         Diagnostic-Code: smtp; {response}\r\n",
        mta = config.reporting_mta,
        recipient = failed_recipient,
    );

    let original_headers: String = meta
        .headers
        .iter()
        .map(|(name, value)| format!("{name}: {value}\r\n"))
        .collect();

    let body = format!(
        "Content-Type: multipart/report; report-type=\"delivery-status\"; boundary=\"{boundary}\"\r\n\
         MIME-Version: 1.0\r\n\
         From: Mail Delivery System <{postmaster}>\r\n\
         To: <{sender}>\r\n\
         Subject: Delivery Status Notification (Failure)\r\n\
         Auto-Submitted: auto-replied\r\n\
         \r\n\
         This is a multi-part message in MIME format.\r\n\
         \r\n\
         --{boundary}\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         \r\n\
         {human_readable}\r\n\
         --{boundary}\r\n\
         Content-Type: message/delivery-status\r\n\
         \r\n\
         {machine_readable}\r\n\
         --{boundary}\r\n\
         Content-Type: text/rfc822-headers\r\n\
         \r\n\
         {original_headers}\r\n\
         --{boundary}--\r\n",
        postmaster = config.postmaster,
    );

    let envelope = Envelope {
        // Null sender: a DSN that fails is dropped, never re-bounced.
        from: String::new(),
        to: vec![sender],
        session_id: meta.session_id.clone(),
        ..Default::default()
    };

    Some(ComposedDsn { envelope, body })
}

/// Extract a plain address from whatever the submitter recorded
fn clean_address(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "<>" {
        return None;
    }

    match mailparse::addrparse(trimmed) {
        Ok(parsed) => parsed.iter().next().and_then(|addr| match addr {
            MailAddr::Single(info) if !info.addr.is_empty() => Some(info.addr.clone()),
            _ => None,
        }),
        Err(_) => Some(trimmed.trim_start_matches('<').trim_end_matches('>').to_string()),
    }
}
