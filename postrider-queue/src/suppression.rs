//! Suppression list
//!
//! Addresses and domains that must never be delivered to. Matched on
//! claim, so a suppressed recipient queued yesterday is still dropped
//! today. A hit releases the delivery silently, without a bounce.

use parking_lot::Mutex;
use postrider_common::{Domain, IdGenerator};
use serde::{Deserialize, Serialize};

/// One suppression entry: an address or a whole domain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuppressionEntry {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
}

#[derive(Debug, Default)]
struct Inner {
    entries: Vec<SuppressionEntry>,
}

/// Case-insensitive suppression matching with CRUD
#[derive(Debug, Default)]
pub struct SuppressionList {
    inner: Mutex<Inner>,
    ids: IdGenerator,
}

impl SuppressionList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Suppress a single address; returns the entry id
    pub fn add_address(&self, address: &str) -> String {
        let id = self.ids.generate().to_string();
        self.inner.lock().entries.push(SuppressionEntry {
            id: id.clone(),
            address: Some(address.trim().to_lowercase()),
            domain: None,
        });
        id
    }

    /// Suppress a whole domain; returns the entry id
    pub fn add_domain(&self, domain: &str) -> String {
        let id = self.ids.generate().to_string();
        self.inner.lock().entries.push(SuppressionEntry {
            id: id.clone(),
            address: None,
            domain: Some(domain.trim().to_lowercase()),
        });
        id
    }

    /// Remove an entry by id; `false` when it did not exist
    pub fn remove(&self, id: &str) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.entries.len();
        inner.entries.retain(|entry| entry.id != id);
        inner.entries.len() != before
    }

    /// Snapshot of all entries
    #[must_use]
    pub fn list(&self) -> Vec<SuppressionEntry> {
        self.inner.lock().entries.clone()
    }

    /// Whether a recipient or its domain is suppressed
    #[must_use]
    pub fn matches(&self, recipient: &str, domain: &Domain) -> bool {
        let recipient = recipient.to_lowercase();
        self.inner.lock().entries.iter().any(|entry| {
            entry
                .address
                .as_deref()
                .is_some_and(|address| address == recipient)
                || entry
                    .domain
                    .as_deref()
                    .is_some_and(|suppressed| suppressed == domain.as_str())
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
