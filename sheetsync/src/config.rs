// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Engine configuration and presets
//!
//! The engine consumes named options only. Loading them from files or the
//! environment is left to the embedding application; every struct here
//! round-trips through serde.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{EngineError, EngineResult};

/// Top-level engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upstream read quota (calls per minute)
    pub reads_per_minute: u32,

    /// Upstream write quota (calls per minute)
    pub writes_per_minute: u32,

    /// Default TTL for cached ranges
    pub cache_ttl_ms: u64,

    /// Maximum number of cached ranges before LRU eviction
    pub cache_max_entries: usize,

    /// Batch window used for a (spreadsheet, class) pair with no history
    pub initial_batch_window_ms: u64,

    /// Lower bound for the adaptive batch window
    pub min_batch_window_ms: u64,

    /// Upper bound for the adaptive batch window
    pub max_batch_window_ms: u64,

    /// Ops per window the adaptive window steers towards
    pub target_batch_size: usize,

    /// A window holding this many ops flushes immediately
    pub max_batch_size: usize,

    /// How long a caller may wait for rate-limiter tokens
    pub acquire_timeout_ms: u64,

    /// Consecutive upstream failures that open the circuit
    pub circuit_failure_threshold: u32,

    /// Time an open circuit waits before admitting a probe
    pub circuit_cooldown_ms: u64,

    /// Concurrently open transactions
    pub max_concurrent_transactions: usize,

    /// Spreadsheets larger than this are not snapshotted
    pub max_snapshot_bytes: u64,

    /// How long commit waits for a pending snapshot
    pub snapshot_timeout_ms: u64,

    /// How long a serializable transaction waits for a range lock
    pub lock_timeout_ms: u64,

    /// Whether commit proceeds when no snapshot is available
    pub commit_without_snapshot: bool,

    /// Fraction of the read quota reserved for prefetching
    pub prefetch_token_share: f64,

    pub retry: RetryConfig,
    pub prefetch: PrefetchConfig,
    pub conflict: ConflictConfig,
}

/// Bounded exponential backoff for transient upstream errors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

/// Prefetch scheduler tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrefetchConfig {
    pub enabled: bool,

    /// Idle tick interval
    pub interval_ms: u64,

    /// Candidates fetched per tick at most
    pub batch_size: usize,

    /// Cached entries with less remaining TTL than this are refreshed
    pub refresh_threshold_ms: u64,

    /// Candidates scoring below this are never fetched
    pub min_score: f64,

    /// Half-life of the access-frequency counter
    pub frequency_half_life_ms: u64,

    /// Age at which recency has decayed to 1/e
    pub recency_horizon_ms: u64,

    pub weights: PrefetchWeights,
}

/// Weights of the prefetch score terms
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrefetchWeights {
    pub frequency: f64,
    pub recency: f64,
    pub prediction: f64,
}

/// Conflict severity thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConflictConfig {
    /// More changed cells than this is at least Medium severity
    pub medium_cell_count: u64,

    /// More changed cells than this is at least High severity
    pub large_cell_count: u64,

    /// Recorded versions kept per range
    pub history_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reads_per_minute: 300,
            writes_per_minute: 300,
            cache_ttl_ms: 60_000,
            cache_max_entries: 1_000,
            initial_batch_window_ms: 50,
            min_batch_window_ms: 20,
            max_batch_window_ms: 200,
            target_batch_size: 10,
            max_batch_size: 100,
            acquire_timeout_ms: 30_000,
            circuit_failure_threshold: 5,
            circuit_cooldown_ms: 30_000,
            max_concurrent_transactions: 10,
            max_snapshot_bytes: 50 * 1024 * 1024, // 50MB
            snapshot_timeout_ms: 10_000,
            lock_timeout_ms: 30_000,
            commit_without_snapshot: true,
            prefetch_token_share: 0.1,
            retry: RetryConfig::default(),
            prefetch: PrefetchConfig::default(),
            conflict: ConflictConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 200,
            max_delay_ms: 5_000,
        }
    }
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 1_000,
            batch_size: 4,
            refresh_threshold_ms: 10_000,
            min_score: 0.35,
            frequency_half_life_ms: 60_000,
            recency_horizon_ms: 120_000,
            weights: PrefetchWeights::default(),
        }
    }
}

impl Default for PrefetchWeights {
    fn default() -> Self {
        Self {
            frequency: 0.4,
            recency: 0.3,
            prediction: 0.3,
        }
    }
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            medium_cell_count: 100,
            large_cell_count: 1_000,
            history_depth: 8,
        }
    }
}

impl EngineConfig {
    /// Configuration for dashboards that mostly read
    pub fn read_optimized() -> Self {
        Self {
            cache_ttl_ms: 300_000, // 5 minutes
            cache_max_entries: 5_000,
            prefetch_token_share: 0.2,
            prefetch: PrefetchConfig {
                batch_size: 8,
                refresh_threshold_ms: 30_000,
                ..PrefetchConfig::default()
            },
            ..Self::default()
        }
    }

    /// Configuration for bulk writers: wider windows, larger batches
    pub fn write_optimized() -> Self {
        let mut config = Self::default();
        config.initial_batch_window_ms = 100;
        config.max_batch_window_ms = 500;
        config.target_batch_size = 25;
        config.max_batch_size = 250;
        config.cache_ttl_ms = 15_000; // Writes invalidate aggressively anyway
        config.prefetch.enabled = false;
        config
    }

    /// Configuration for projects on the smallest upstream quota tier
    pub fn low_quota() -> Self {
        let mut config = Self::default();
        config.reads_per_minute = 60;
        config.writes_per_minute = 60;
        config.prefetch_token_share = 0.05;
        config.initial_batch_window_ms = 100;
        config.max_batch_window_ms = 400;
        config
    }

    /// Validate the configuration
    pub fn validate(&self) -> EngineResult<()> {
        if self.reads_per_minute == 0 || self.writes_per_minute == 0 {
            return Err(EngineError::InvalidConfig(
                "reads_per_minute and writes_per_minute must be > 0".to_string(),
            ));
        }

        if self.min_batch_window_ms == 0 {
            return Err(EngineError::InvalidConfig(
                "min_batch_window_ms must be > 0".to_string(),
            ));
        }

        if self.min_batch_window_ms > self.max_batch_window_ms {
            return Err(EngineError::InvalidConfig(format!(
                "min_batch_window_ms ({}) exceeds max_batch_window_ms ({})",
                self.min_batch_window_ms, self.max_batch_window_ms
            )));
        }

        if self.target_batch_size == 0 || self.max_batch_size == 0 {
            return Err(EngineError::InvalidConfig(
                "target_batch_size and max_batch_size must be > 0".to_string(),
            ));
        }

        if self.cache_max_entries == 0 {
            return Err(EngineError::InvalidConfig(
                "cache_max_entries must be > 0".to_string(),
            ));
        }

        if self.max_concurrent_transactions == 0 {
            return Err(EngineError::InvalidConfig(
                "max_concurrent_transactions must be > 0".to_string(),
            ));
        }

        if !(0.0..1.0).contains(&self.prefetch_token_share) {
            return Err(EngineError::InvalidConfig(format!(
                "prefetch_token_share must be in [0, 1), got {}",
                self.prefetch_token_share
            )));
        }

        if self.circuit_failure_threshold == 0 {
            return Err(EngineError::InvalidConfig(
                "circuit_failure_threshold must be > 0".to_string(),
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(EngineError::InvalidConfig(
                "retry.max_attempts must be > 0".to_string(),
            ));
        }

        let weights = &self.prefetch.weights;
        if weights.frequency < 0.0 || weights.recency < 0.0 || weights.prediction < 0.0 {
            return Err(EngineError::InvalidConfig(
                "prefetch weights must be non-negative".to_string(),
            ));
        }

        if self.conflict.medium_cell_count > self.conflict.large_cell_count {
            return Err(EngineError::InvalidConfig(
                "conflict.medium_cell_count exceeds conflict.large_cell_count".to_string(),
            ));
        }

        Ok(())
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn circuit_cooldown(&self) -> Duration {
        Duration::from_millis(self.circuit_cooldown_ms)
    }

    pub fn snapshot_timeout(&self) -> Duration {
        Duration::from_millis(self.snapshot_timeout_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}
