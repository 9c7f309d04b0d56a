// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! LRU eviction tracker

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

/// Orders keys by last use with a monotonically increasing tick
#[derive(Debug)]
pub(crate) struct LruTracker<K> {
    tick: u64,
    by_key: HashMap<K, u64>,
    order: BTreeMap<u64, K>,
}

impl<K: Clone + Eq + Hash> LruTracker<K> {
    pub fn new() -> Self {
        Self {
            tick: 0,
            by_key: HashMap::new(),
            order: BTreeMap::new(),
        }
    }

    /// Mark `key` as most recently used
    pub fn touch(&mut self, key: &K) {
        self.tick += 1;
        if let Some(old) = self.by_key.insert(key.clone(), self.tick) {
            self.order.remove(&old);
        }
        self.order.insert(self.tick, key.clone());
    }

    pub fn remove(&mut self, key: &K) {
        if let Some(tick) = self.by_key.remove(key) {
            self.order.remove(&tick);
        }
    }

    /// Remove and return the least recently used key
    pub fn pop_lru(&mut self) -> Option<K> {
        let (_, key) = self.order.pop_first()?;
        self.by_key.remove(&key);
        Some(key)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn clear(&mut self) {
        self.by_key.clear();
        self.order.clear();
    }
}
