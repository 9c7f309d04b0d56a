// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! TTL/LRU cache of fetched ranges

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use super::invalidation::{InvalidationGraph, InvalidationReason};
use super::lru::LruTracker;
use super::{CacheKey, CacheStats};
use crate::range::RangeRef;
use crate::values::Values;

/// A cached range
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub range: RangeRef,
    pub values: Values,
    pub ttl: Duration,
    pub inserted_at: Instant,
    pub hit_count: u64,
}

impl CacheEntry {
    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.inserted_at) >= self.ttl
    }

    pub fn remaining_ttl(&self, now: Instant) -> Duration {
        self.ttl
            .saturating_sub(now.saturating_duration_since(self.inserted_at))
    }
}

#[derive(Debug)]
struct CacheInner {
    entries: HashMap<CacheKey, CacheEntry>,
    lru: LruTracker<CacheKey>,
    tracked: InvalidationGraph,
    /// Bumped per spreadsheet whenever its entries are invalidated
    epochs: HashMap<String, u64>,
    stats: CacheStats,
}

impl CacheInner {
    /// Drop an entry together with its tracked read
    fn remove(&mut self, key: &CacheKey, reason: &InvalidationReason) -> bool {
        let removed = self.entries.remove(key).is_some();
        self.lru.remove(key);
        self.tracked.untrack(&key.spreadsheet_id, &key.range_key);
        if removed {
            log::debug!(
                "Cache drop {}/{} ({})",
                key.spreadsheet_id,
                key.range_key,
                reason
            );
        }
        removed
    }

    fn bump_epoch(&mut self, spreadsheet_id: &str) {
        *self.epochs.entry(spreadsheet_id.to_string()).or_insert(0) += 1;
    }

    fn insert(&mut self, spreadsheet_id: &str, range: &RangeRef, values: Values, ttl: Duration) {
        let key = CacheKey::new(spreadsheet_id, range.key());
        let now = Instant::now();
        let entry = CacheEntry {
            key: key.clone(),
            range: range.clone(),
            values,
            ttl,
            inserted_at: now,
            hit_count: 0,
        };
        self.entries.insert(key.clone(), entry);
        self.tracked.track(spreadsheet_id, range);
        self.lru.touch(&key);
        self.stats.insertions += 1;
    }

    fn enforce_capacity(&mut self, max_entries: usize) {
        while self.entries.len() > max_entries {
            let Some(victim) = self.lru.pop_lru() else {
                break;
            };
            if self.remove(&victim, &InvalidationReason::Evicted) {
                self.stats.evictions += 1;
            }
        }
    }
}

/// Range cache whose tracked reads drive write invalidation
pub struct ReadCache {
    inner: Mutex<CacheInner>,
    default_ttl: Duration,
    max_entries: usize,
}

impl ReadCache {
    pub fn new(default_ttl: Duration, max_entries: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                lru: LruTracker::new(),
                tracked: InvalidationGraph::new(),
                epochs: HashMap::new(),
                stats: CacheStats::default(),
            }),
            default_ttl,
            max_entries: max_entries.max(1),
        }
    }

    /// Look up a range; expired entries are dropped and count as a miss
    pub fn get(&self, spreadsheet_id: &str, range: &RangeRef) -> Option<CacheEntry> {
        let key = CacheKey::new(spreadsheet_id, range.key());
        let now = Instant::now();
        let mut inner = self.inner.lock();

        match inner.entries.get(&key).map(|entry| entry.is_expired(now)) {
            None => {
                inner.stats.misses += 1;
                log::debug!("Cache miss {}/{}", spreadsheet_id, key.range_key);
                return None;
            }
            Some(true) => {
                inner.remove(&key, &InvalidationReason::Expired);
                inner.stats.expirations += 1;
                inner.stats.misses += 1;
                return None;
            }
            Some(false) => {}
        }

        inner.stats.hits += 1;
        inner.lru.touch(&key);
        let entry = inner.entries.get_mut(&key)?;
        entry.hit_count += 1;
        log::debug!("Cache hit {}/{} (hits={})", spreadsheet_id, key.range_key, entry.hit_count);
        Some(entry.clone())
    }

    /// Whether a live entry exists; does not touch statistics or LRU order
    pub fn contains(&self, spreadsheet_id: &str, range: &RangeRef) -> bool {
        let key = CacheKey::new(spreadsheet_id, range.key());
        let now = Instant::now();
        self.inner
            .lock()
            .entries
            .get(&key)
            .is_some_and(|entry| !entry.is_expired(now))
    }

    /// Current invalidation epoch of a spreadsheet, observed before a fetch
    pub fn epoch(&self, spreadsheet_id: &str) -> u64 {
        *self
            .inner
            .lock()
            .epochs
            .entry(spreadsheet_id.to_string())
            .or_insert(0)
    }

    /// Store a fetched range and record its tracked read, unless the
    /// spreadsheet was invalidated after `epoch` was observed. A fetch that
    /// raced a write must not repopulate stale data.
    pub fn put_if_unchanged(
        &self,
        spreadsheet_id: &str,
        range: &RangeRef,
        values: Values,
        epoch: u64,
    ) -> bool {
        let mut inner = self.inner.lock();
        let current = inner.epochs.get(spreadsheet_id).copied().unwrap_or(0);
        if current != epoch {
            log::debug!(
                "Skipping cache fill for {}/{}: invalidated during fetch",
                spreadsheet_id,
                range
            );
            return false;
        }
        inner.insert(spreadsheet_id, range, values, self.default_ttl);
        inner.enforce_capacity(self.max_entries);
        true
    }

    /// Drop every tracked read overlapping `write_range`, returning them
    pub fn invalidate_write(&self, spreadsheet_id: &str, write_range: &RangeRef) -> Vec<RangeRef> {
        let mut inner = self.inner.lock();
        inner.bump_epoch(spreadsheet_id);

        let stale = inner.tracked.overlapping(spreadsheet_id, write_range);
        let reason = InvalidationReason::Write {
            range: write_range.clone(),
        };
        for range in &stale {
            let key = CacheKey::new(spreadsheet_id, range.key());
            if inner.remove(&key, &reason) {
                inner.stats.invalidations += 1;
            }
        }
        stale
    }

    /// Drop everything cached for a spreadsheet
    pub fn invalidate_spreadsheet(&self, spreadsheet_id: &str) -> usize {
        let mut inner = self.inner.lock();
        inner.bump_epoch(spreadsheet_id);

        let ranges = inner.tracked.remove_spreadsheet(spreadsheet_id);
        let mut dropped = 0;
        for range in &ranges {
            let key = CacheKey::new(spreadsheet_id, range.key());
            if inner.remove(&key, &InvalidationReason::Spreadsheet) {
                inner.stats.invalidations += 1;
                dropped += 1;
            }
        }
        dropped
    }

    /// Drop every expired entry
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let expired: Vec<CacheKey> = inner
            .entries
            .values()
            .filter(|entry| entry.is_expired(now))
            .map(|entry| entry.key.clone())
            .collect();
        for key in &expired {
            inner.remove(key, &InvalidationReason::Expired);
            inner.stats.expirations += 1;
        }
        expired.len()
    }

    /// Live entries with less than `threshold` TTL left
    pub fn expiring_within(&self, threshold: Duration) -> Vec<(String, RangeRef, Duration)> {
        let now = Instant::now();
        let inner = self.inner.lock();
        let mut expiring: Vec<(String, RangeRef, Duration)> = inner
            .entries
            .values()
            .filter(|entry| !entry.is_expired(now))
            .filter_map(|entry| {
                let remaining = entry.remaining_ttl(now);
                (remaining < threshold).then(|| {
                    (entry.key.spreadsheet_id.clone(), entry.range.clone(), remaining)
                })
            })
            .collect();
        expiring.sort_by_key(|(_, _, remaining)| *remaining);
        expiring
    }

    /// Ranges with a live tracked read, in key order
    pub fn tracked_ranges(&self, spreadsheet_id: &str) -> Vec<RangeRef> {
        self.inner.lock().tracked.ranges(spreadsheet_id)
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        let mut stats = inner.stats.clone();
        stats.entries = inner.entries.len();
        stats
    }

    /// Drop every entry; fills already in flight are discarded
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.lru.clear();
        inner.tracked.clear();
        let spreadsheets: Vec<String> = inner.epochs.keys().cloned().collect();
        for id in spreadsheets {
            inner.bump_epoch(&id);
        }
    }

    /// Every entry has a tracked read and every tracked read has an entry
    #[cfg(test)]
    pub(crate) fn assert_consistent(&self) {
        let inner = self.inner.lock();
        assert_eq!(inner.entries.len(), inner.tracked.len());
        assert_eq!(inner.entries.len(), inner.lru.len());
        for key in inner.entries.keys() {
            assert!(inner.tracked.is_tracked(&key.spreadsheet_id, &key.range_key));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::values::grid;

    fn r(s: &str) -> RangeRef {
        s.parse().unwrap()
    }

    fn cache() -> ReadCache {
        ReadCache::new(Duration::from_secs(60), 100)
    }

    fn put(cache: &ReadCache, spreadsheet_id: &str, range: &RangeRef, values: Values) {
        let epoch = cache.epoch(spreadsheet_id);
        assert!(cache.put_if_unchanged(spreadsheet_id, range, values, epoch));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tracked_read_scenario() {
        let cache = cache();
        let tracked = r("Sheet1!A1:B10");
        put(&cache, "s", &tracked, grid(vec![vec!["x"]]));

        assert!(cache.invalidate_write("s", &r("Sheet1!C1:D5")).is_empty());
        assert!(cache.get("s", &tracked).is_some());

        assert_eq!(cache.invalidate_write("s", &r("Sheet1!A5:B5")), vec![tracked.clone()]);
        assert!(cache.get("s", &tracked).is_none());
        assert!(cache.tracked_ranges("s").is_empty());
        cache.assert_consistent();
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry_counts_as_miss() {
        let cache = ReadCache::new(Duration::from_secs(5), 100);
        let range = r("Sheet1!A1");
        put(&cache, "s", &range, grid(vec![vec![1i64]]));
        assert!(cache.get("s", &range).is_some());

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(cache.get("s", &range).is_none());
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.expirations, 1);
        cache.assert_consistent();
    }

    #[tokio::test(start_paused = true)]
    async fn test_lru_eviction_drops_tracked_read() {
        let cache = ReadCache::new(Duration::from_secs(60), 2);
        put(&cache, "s", &r("A1"), grid(vec![vec!["a"]]));
        put(&cache, "s", &r("A2"), grid(vec![vec!["b"]]));
        cache.get("s", &r("A1"));
        put(&cache, "s", &r("A3"), grid(vec![vec!["c"]]));

        assert!(cache.contains("s", &r("A1")));
        assert!(!cache.contains("s", &r("A2")));
        assert_eq!(cache.stats().evictions, 1);
        cache.assert_consistent();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_fill_is_skipped() {
        let cache = cache();
        let range = r("Sheet1!A1:A5");
        let epoch = cache.epoch("s");
        cache.invalidate_write("s", &r("Sheet1!A2"));
        assert!(!cache.put_if_unchanged("s", &range, Values::new(), epoch));
        assert_eq!(cache.stats().entries, 0);

        let epoch = cache.epoch("s");
        assert!(cache.put_if_unchanged("s", &range, Values::new(), epoch));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiring_within_and_purge() {
        let cache = ReadCache::new(Duration::from_secs(100), 100);
        put(&cache, "s", &r("A1"), Values::new());
        tokio::time::advance(Duration::from_secs(92)).await;
        put(&cache, "s", &r("B1"), Values::new());

        tokio::time::advance(Duration::from_secs(4)).await;
        let expiring = cache.expiring_within(Duration::from_secs(5));
        assert_eq!(expiring.len(), 1);
        assert_eq!(expiring[0].0, "s");
        assert_eq!(expiring[0].1, r("A1"));
        assert_eq!(expiring[0].2, Duration::from_secs(4));

        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.stats().entries, 1);
        cache.assert_consistent();
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_spreadsheet_is_scoped() {
        let cache = cache();
        put(&cache, "a", &r("A1"), Values::new());
        put(&cache, "a", &r("B1"), Values::new());
        put(&cache, "b", &r("A1"), Values::new());

        assert_eq!(cache.invalidate_spreadsheet("a"), 2);
        assert!(cache.contains("b", &r("A1")));
        assert_eq!(cache.stats().invalidations, 2);
        cache.assert_consistent();
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_drops_entries_and_pending_fills() {
        let cache = cache();
        put(&cache, "s", &r("A1:B2"), Values::new());
        put(&cache, "s", &r("C1"), Values::new());
        assert_eq!(cache.tracked_ranges("s"), vec![r("A1:B2"), r("C1")]);

        let epoch = cache.epoch("s");
        cache.clear();
        assert_eq!(cache.stats().entries, 0);
        assert!(cache.tracked_ranges("s").is_empty());
        assert!(!cache.put_if_unchanged("s", &r("A1"), Values::new(), epoch));
        cache.assert_consistent();
    }
}
