// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Read cache with write-driven invalidation
//!
//! This module provides:
//! - A TTL/LRU cache of fetched ranges, keyed by spreadsheet and range
//! - The invalidation graph of tracked reads, updated in the same step as the
//!   cache so an entry and its tracked read never disagree
//! - Hit/miss/eviction statistics

mod invalidation;
mod lru;
mod read_cache;

pub use read_cache::ReadCache;

use serde::{Deserialize, Serialize};

/// Cache key: spreadsheet plus canonical range string
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    pub spreadsheet_id: String,
    pub range_key: String,
}

impl CacheKey {
    pub fn new(spreadsheet_id: &str, range_key: impl Into<String>) -> Self {
        Self {
            spreadsheet_id: spreadsheet_id.to_string(),
            range_key: range_key.into(),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub insertions: u64,
    /// Entries dropped for LRU pressure
    pub evictions: u64,
    /// Entries dropped because their TTL ran out
    pub expirations: u64,
    /// Entries dropped because an overlapping write landed
    pub invalidations: u64,
    pub entries: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
