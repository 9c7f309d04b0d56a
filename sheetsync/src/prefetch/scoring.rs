// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Prefetch candidate scoring
//!
//! `score = w_freq * f / (1 + f) + w_recency * exp(-age / horizon) + w_predict * p`
//!
//! where `f` is the decayed access frequency, `age` the time since the last
//! access, and `p` the scan predictor's probability for the range. Each term
//! lies in `[0, 1]`, so with weights summing to 1 the score does too.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::time::Duration;

use crate::config::PrefetchWeights;
use crate::range::RangeRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PrefetchReason {
    /// Hot range that is not cached
    Warm,
    /// Cached entry about to expire
    Refresh,
    /// Next block of a sequential scan
    Predicted,
}

impl fmt::Display for PrefetchReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrefetchReason::Warm => write!(f, "warm"),
            PrefetchReason::Refresh => write!(f, "refresh"),
            PrefetchReason::Predicted => write!(f, "predicted"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PrefetchCandidate {
    pub spreadsheet_id: String,
    pub range: RangeRef,
    pub score: f64,
    pub reason: PrefetchReason,
}

impl PrefetchCandidate {
    pub fn key(&self) -> (String, String) {
        (self.spreadsheet_id.clone(), self.range.key())
    }
}

impl Eq for PrefetchCandidate {}

impl Ord for PrefetchCandidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            // Deterministic order among equal scores
            .then_with(|| other.spreadsheet_id.cmp(&self.spreadsheet_id))
            .then_with(|| other.range.key().cmp(&self.range.key()))
    }
}

impl PartialOrd for PrefetchCandidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Weighted score of one range
pub fn score(
    weights: &PrefetchWeights,
    frequency: f64,
    age: Duration,
    recency_horizon: Duration,
    probability: f64,
) -> f64 {
    let frequency_term = if frequency > 0.0 {
        frequency / (1.0 + frequency)
    } else {
        0.0
    };
    let recency_term = if recency_horizon.is_zero() {
        0.0
    } else {
        (-age.as_secs_f64() / recency_horizon.as_secs_f64()).exp()
    };
    weights.frequency * frequency_term
        + weights.recency * recency_term
        + weights.prediction * probability.clamp(0.0, 1.0)
}

/// Max-heap of candidates, one per range; a duplicate keeps its best score
pub fn rank(candidates: impl IntoIterator<Item = PrefetchCandidate>) -> BinaryHeap<PrefetchCandidate> {
    let mut best: HashMap<(String, String), PrefetchCandidate> = HashMap::new();
    for candidate in candidates {
        match best.get(&candidate.key()) {
            Some(existing) if existing.score >= candidate.score => {}
            _ => {
                best.insert(candidate.key(), candidate);
            }
        }
    }
    best.into_values().collect()
}
