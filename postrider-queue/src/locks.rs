//! In-memory per-delivery and per-(zone, domain) concurrency locks
//!
//! Master-resident only; nothing here touches the store. Two derived
//! indices are maintained alongside the lock map: by owner, so a worker
//! disconnect releases everything it held in one call, and by
//! (zone, domain), so domains saturated at their connection cap land in
//! a skip set the scheduler excludes up front.

use std::time::{Duration, Instant};

use ahash::{AHashMap, AHashSet};
use parking_lot::Mutex;
use postrider_common::{Domain, QueueId};

/// Default TTL for a scheduler lock
pub const LOCK_TTL: Duration = Duration::from_secs(3600);

type Key = (QueueId, String);

/// One held lock
#[derive(Debug, Clone)]
pub struct LockEntry {
    pub id: QueueId,
    pub seq: String,
    pub zone: String,
    pub domain: Domain,
    pub owner: String,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct DomainState {
    count: usize,
    max_connections: u32,
}

#[derive(Debug, Default)]
struct Inner {
    locks: AHashMap<Key, LockEntry>,
    by_owner: AHashMap<String, AHashSet<Key>>,
    domains: AHashMap<(String, Domain), DomainState>,
    skip: AHashMap<String, AHashSet<Domain>>,
}

/// Lock table guarding in-flight deliveries
#[derive(Debug, Default)]
pub struct LockTable {
    inner: Mutex<Inner>,
}

impl LockTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to take the lock for a row
    ///
    /// Fails when the key is already held (and not expired) or when the
    /// (zone, domain) pair sits in the skip set. Taking the lock that
    /// reaches `max_connections` inserts the domain into the skip set.
    pub fn lock(
        &self,
        id: &QueueId,
        seq: &str,
        zone: &str,
        domain: &Domain,
        owner: &str,
        max_connections: u32,
        ttl: Duration,
    ) -> bool {
        let key = (id.clone(), seq.to_string());
        let mut inner = self.inner.lock();

        // Lazy expiry of a stale holder.
        if let Some(existing) = inner.locks.get(&key) {
            if existing.expires_at > Instant::now() {
                return false;
            }
            let stale = existing.clone();
            Self::remove_entry(&mut inner, &key, &stale);
        }

        if inner
            .skip
            .get(zone)
            .is_some_and(|domains| domains.contains(domain))
        {
            return false;
        }

        let entry = LockEntry {
            id: id.clone(),
            seq: seq.to_string(),
            zone: zone.to_string(),
            domain: domain.clone(),
            owner: owner.to_string(),
            expires_at: Instant::now() + ttl,
        };

        inner
            .by_owner
            .entry(owner.to_string())
            .or_default()
            .insert(key.clone());

        let state = inner
            .domains
            .entry((zone.to_string(), domain.clone()))
            .or_default();
        state.count += 1;
        state.max_connections = max_connections;
        let saturated = state.count >= max_connections as usize;

        if saturated {
            inner
                .skip
                .entry(zone.to_string())
                .or_default()
                .insert(domain.clone());
        }

        inner.locks.insert(key, entry);
        true
    }

    /// Release a lock; idempotent
    pub fn release(&self, id: &QueueId, seq: &str) {
        let key = (id.clone(), seq.to_string());
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.locks.get(&key).cloned() {
            Self::remove_entry(&mut inner, &key, &entry);
        }
    }

    /// Release everything a holder owns; returns the released entries so
    /// the caller can unlock the matching store rows
    pub fn release_owner(&self, owner: &str) -> Vec<LockEntry> {
        let mut inner = self.inner.lock();
        let Some(keys) = inner.by_owner.remove(owner) else {
            return Vec::new();
        };

        let mut released = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(entry) = inner.locks.get(&key).cloned() {
                Self::remove_entry(&mut inner, &key, &entry);
                released.push(entry);
            }
        }
        released
    }

    /// Domains currently at or above their connection cap for a zone
    #[must_use]
    pub fn skip_domains(&self, zone: &str) -> AHashSet<Domain> {
        self.inner.lock().skip.get(zone).cloned().unwrap_or_default()
    }

    /// Drop every expired lock; returns the reclaimed entries
    pub fn sweep_expired(&self) -> Vec<LockEntry> {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        let expired: Vec<(Key, LockEntry)> = inner
            .locks
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(key, entry)| (key.clone(), entry.clone()))
            .collect();

        for (key, entry) in &expired {
            Self::remove_entry(&mut inner, key, entry);
        }
        expired.into_iter().map(|(_, entry)| entry).collect()
    }

    /// Number of held locks
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().locks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove_entry(inner: &mut Inner, key: &Key, entry: &LockEntry) {
        inner.locks.remove(key);

        if let Some(owned) = inner.by_owner.get_mut(&entry.owner) {
            owned.remove(key);
            if owned.is_empty() {
                inner.by_owner.remove(&entry.owner);
            }
        }

        let domain_key = (entry.zone.clone(), entry.domain.clone());
        if let Some(state) = inner.domains.get_mut(&domain_key) {
            state.count = state.count.saturating_sub(1);
            let below_cap = state.count < state.max_connections as usize;
            let empty = state.count == 0;
            if below_cap && let Some(skip) = inner.skip.get_mut(&entry.zone) {
                skip.remove(&entry.domain);
                if skip.is_empty() {
                    inner.skip.remove(&entry.zone);
                }
            }
            if empty {
                inner.domains.remove(&domain_key);
            }
        }
    }
}
