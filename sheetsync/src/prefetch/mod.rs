// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Access-pattern driven prefetching
//!
//! This module provides:
//! - Per-range decayed access frequency and a sequential-scan predictor
//! - Weighted candidate scoring into a priority queue
//! - A scheduler that warms and refreshes the read cache on its own token
//!   allocation

mod scheduler;
mod scoring;
mod tracker;

pub use scheduler::{PrefetchScheduler, PrefetchStats};
pub use scoring::{PrefetchCandidate, PrefetchReason};
