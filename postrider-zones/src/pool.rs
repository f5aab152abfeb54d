//! Source-address pools with warm-up ratios
//!
//! A zone's pool entries are expanded once at load into a weighted list,
//! then a delivery picks its source address deterministically by hashing
//! a selection key. The key is chosen so a recipient greylisted on one
//! source address keeps hitting the same address across retries.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::config::PoolEntry;

/// Weight resolution for the warm-up expansion; each entry occupies
/// `round(share * RESOLUTION)` slots in the expanded list
const RESOLUTION: f64 = 100.0;

/// Expanded, read-only pool for one address family
#[derive(Debug, Clone, Default)]
pub struct SourcePool {
    expanded: Vec<PoolEntry>,
}

impl SourcePool {
    /// Build a pool from configured entries, keeping only one family
    #[must_use]
    pub fn build(entries: &[PoolEntry], ipv6: bool) -> Self {
        let family: Vec<PoolEntry> = entries
            .iter()
            .filter(|entry| entry.address.is_ipv6() == ipv6)
            .cloned()
            .collect();
        Self {
            expanded: expand(&family),
        }
    }

    /// Deterministic selection for a key; `None` when the pool is empty
    ///
    /// `exclude` filters out addresses disabled or blacklisted for this
    /// destination; when everything is excluded the exclusion is ignored
    /// rather than leaving the delivery without a source.
    #[must_use]
    pub fn pick(&self, selection_key: &str, exclude: &dyn Fn(&PoolEntry) -> bool) -> Option<&PoolEntry> {
        let candidates: Vec<&PoolEntry> = self
            .expanded
            .iter()
            .filter(|entry| !exclude(entry))
            .collect();

        let candidates = if candidates.is_empty() {
            self.expanded.iter().collect()
        } else {
            candidates
        };
        if candidates.is_empty() {
            return None;
        }

        let index = crc32fast::hash(selection_key.as_bytes()) as usize % candidates.len();
        Some(candidates[index])
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.expanded.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.expanded.len()
    }
}

/// Selection key that pins a recipient to one source address
#[must_use]
pub fn selection_key(domain: &str, recipient: &str) -> String {
    format!("{domain}|{recipient}")
}

/// Wildcard source for an empty pool
#[must_use]
pub const fn wildcard(ipv6: bool) -> IpAddr {
    if ipv6 {
        IpAddr::V6(Ipv6Addr::UNSPECIFIED)
    } else {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    }
}

/// Expand entries so each one's relative frequency matches its ratio
///
/// An entry with `ratio >= 1` is used exclusively. Entries without a
/// ratio split the leftover share equally. Every entry keeps at least one
/// slot so a tiny ratio still warms up.
fn expand(entries: &[PoolEntry]) -> Vec<PoolEntry> {
    if entries.is_empty() {
        return Vec::new();
    }

    if let Some(exclusive) = entries
        .iter()
        .find(|entry| entry.ratio.is_some_and(|ratio| ratio >= 1.0))
    {
        return vec![exclusive.clone()];
    }

    let ratio_sum: f64 = entries.iter().filter_map(|entry| entry.ratio).sum();
    let unratioed = entries.iter().filter(|entry| entry.ratio.is_none()).count();
    let leftover_share = if unratioed == 0 {
        0.0
    } else {
        #[allow(clippy::cast_precision_loss)]
        let share = (1.0 - ratio_sum).max(0.0) / unratioed as f64;
        share
    };

    let mut expanded = Vec::new();
    for entry in entries {
        let share = entry.ratio.unwrap_or(leftover_share);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let slots = ((share * RESOLUTION).round() as usize).max(1);
        for _ in 0..slots {
            expanded.push(entry.clone());
        }
    }
    expanded
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn entry(addr: &str, ratio: Option<f64>) -> PoolEntry {
        PoolEntry {
            address: addr.parse().unwrap(),
            name: format!("host-{addr}"),
            ratio,
        }
    }

    #[test]
    fn test_exclusive_ratio() {
        let pool = SourcePool::build(
            &[
                entry("192.0.2.1", None),
                entry("192.0.2.2", Some(1.0)),
                entry("192.0.2.3", Some(0.5)),
            ],
            false,
        );
        assert_eq!(pool.len(), 1);
        let picked = pool.pick("any", &|_| false).unwrap();
        assert_eq!(picked.address, "192.0.2.2".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_unratioed_split_equally() {
        let pool = SourcePool::build(&[entry("192.0.2.1", None), entry("192.0.2.2", None)], false);
        // Two unratioed entries take 50 slots each.
        assert_eq!(pool.len(), 100);
    }

    #[test]
    fn test_selection_is_deterministic() {
        let pool = SourcePool::build(
            &[entry("192.0.2.1", None), entry("192.0.2.2", None)],
            false,
        );
        let key = selection_key("y.test", "b@y.test");
        let first = pool.pick(&key, &|_| false).unwrap().address;
        for _ in 0..10 {
            assert_eq!(pool.pick(&key, &|_| false).unwrap().address, first);
        }
    }

    #[test]
    fn test_family_filter() {
        let pool_v6 = SourcePool::build(
            &[entry("192.0.2.1", None), entry("2001:db8::1", None)],
            true,
        );
        let picked = pool_v6.pick("k", &|_| false).unwrap();
        assert!(picked.address.is_ipv6());
    }

    #[test]
    fn test_exclusion_falls_back_when_total() {
        let pool = SourcePool::build(&[entry("192.0.2.1", None)], false);
        // Everything excluded: exclusion is ignored, not a dead end.
        let picked = pool.pick("k", &|_| true);
        assert!(picked.is_some());
    }

    #[test]
    fn test_empty_pool_yields_none() {
        let pool = SourcePool::build(&[], false);
        assert!(pool.pick("k", &|_| false).is_none());
        assert_eq!(wildcard(false), "0.0.0.0".parse::<IpAddr>().unwrap());
        assert_eq!(wildcard(true), "::".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_warmup_distribution() {
        let pool = SourcePool::build(
            &[entry("192.0.2.1", Some(0.25)), entry("192.0.2.2", None)],
            false,
        );

        let mut hits: HashMap<IpAddr, usize> = HashMap::new();
        let samples = 10_000;
        for i in 0..samples {
            let key = selection_key(&format!("domain{i}.test"), &format!("user{i}@domain{i}.test"));
            let picked = pool.pick(&key, &|_| false).unwrap();
            *hits.entry(picked.address).or_default() += 1;
        }

        #[allow(clippy::cast_precision_loss)]
        let warm_share =
            hits[&"192.0.2.1".parse::<IpAddr>().unwrap()] as f64 / f64::from(samples);
        // ratio ± 1/sqrt(N) plus slack for crc32 unevenness
        assert!(
            (warm_share - 0.25).abs() < 0.05,
            "warm-up entry share {warm_share} should be close to 0.25"
        );
    }
}
