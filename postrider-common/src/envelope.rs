//! Submission envelope and header list

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Ordered list of message headers
///
/// Keeps insertion order and duplicates; lookups that resolve routing
/// hints walk from the last occurrence backward, because later-added
/// headers override earlier ones.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    #[must_use]
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// Last occurrence of a header, matched case-insensitively
    #[must_use]
    pub fn last(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .rev()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Number of occurrences of a header
    #[must_use]
    pub fn count(&self, name: &str) -> usize {
        self.0.iter().filter(|(n, _)| n.eq_ignore_ascii_case(name)).count()
    }

    /// Iterate entries from the last to the first
    pub fn iter_rev(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().rev().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, String)> for Headers {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Envelope handed to the router by a submission frontend
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Envelope {
    /// Envelope sender (MAIL FROM); empty for bounce messages
    pub from: String,

    /// Raw recipient list (RCPT TO), normalized during routing
    pub to: Vec<String>,

    /// Address of the submitting client, if known
    pub origin: Option<IpAddr>,

    /// Parsed message headers
    #[serde(default)]
    pub headers: Headers,

    /// Explicit zone override; honored when the zone exists
    pub sending_zone: Option<String>,

    /// Earliest delivery time (epoch ms); deliveries start deferred when
    /// this lies in the future
    pub defer_until: Option<u64>,

    /// Originating session, carried into every delivery row
    pub session_id: Option<String>,
}

impl Envelope {
    /// Sender domain as used for routing: the `From` header wins over the
    /// envelope sender
    #[must_use]
    pub fn sender_domain(&self) -> Option<crate::Domain> {
        self.headers
            .last("from")
            .and_then(crate::domain::domain_of)
            .or_else(|| crate::domain::domain_of(&self.from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headers_last_occurrence_wins() {
        let mut headers = Headers::new();
        headers.push("X-Zone", "first");
        headers.push("x-zone", "second");
        assert_eq!(headers.last("X-ZONE"), Some("second"));
    }

    #[test]
    fn test_headers_count() {
        let mut headers = Headers::new();
        headers.push("Received", "a");
        headers.push("received", "b");
        headers.push("Subject", "x");
        assert_eq!(headers.count("Received"), 2);
    }

    #[test]
    fn test_sender_domain_prefers_from_header() {
        let mut envelope = Envelope {
            from: "bounce@envelope.test".to_string(),
            ..Default::default()
        };
        envelope.headers.push("From", "Real Sender <real@header.test>");
        assert_eq!(
            envelope.sender_domain().unwrap().as_str(),
            "header.test"
        );
    }

    #[test]
    fn test_sender_domain_falls_back_to_envelope() {
        let envelope = Envelope {
            from: "bounce@envelope.test".to_string(),
            ..Default::default()
        };
        assert_eq!(
            envelope.sender_domain().unwrap().as_str(),
            "envelope.test"
        );
    }
}
