//! Short-lived in-process fact cache
//!
//! Holds facts the master re-derives cheaply but not for free: "this zone
//! had no eligible work a moment ago", "this (domain, address) pair is
//! blacklisted for a window". Eviction is lazy on lookup; a periodic
//! sweep keeps abandoned keys from accumulating.

use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Default back-off after a zone probe finds no eligible work
pub const EMPTY_ZONE_TTL: Duration = Duration::from_secs(5);

/// Default window for a blacklisted (domain, address) pair
pub const BLACKLIST_TTL: Duration = Duration::from_secs(6 * 60 * 60);

/// Cache key for an empty-zone marker
#[must_use]
pub fn empty_zone_key(zone: &str) -> String {
    format!("empty:{zone}")
}

/// Cache key for a blacklisted (destination domain, address) pair
#[must_use]
pub fn blacklist_key(domain: &str, addr: &str) -> String {
    format!("blacklist:{domain}:{addr}")
}

#[derive(Debug, Clone)]
struct Entry<V> {
    value: V,
    expires_at: Instant,
}

/// Map of key → (value, deadline) with lazy eviction
#[derive(Debug)]
pub struct TtlCache<V = String> {
    entries: DashMap<String, Entry<V>>,
}

impl<V: Clone> TtlCache<V> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Insert or refresh a key
    pub fn set(&self, key: impl Into<String>, value: V, ttl: Duration) {
        self.entries.insert(
            key.into(),
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Fetch a live value; expired entries are removed on the way
    #[must_use]
    pub fn get(&self, key: &str) -> Option<V> {
        if let Some(entry) = self.entries.get(key) {
            if entry.expires_at > Instant::now() {
                return Some(entry.value.clone());
            }
        } else {
            return None;
        }
        self.entries.remove(key);
        None
    }

    /// Whether a key is live
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn remove(&self, key: &str) {
        self.entries.remove(key);
    }

    /// Drop every expired entry; returns how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before - self.entries.len()
    }

    /// Count live keys with the given prefix
    ///
    /// Used to export the `blacklist:*` population as a gauge.
    #[must_use]
    pub fn count_prefix(&self, prefix: &str) -> usize {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix) && entry.expires_at > now)
            .count()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<V: Clone> Default for TtlCache<V> {
    fn default() -> Self {
        Self::new()
    }
}
