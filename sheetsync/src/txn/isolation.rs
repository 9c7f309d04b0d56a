// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Transaction isolation levels
//!
//! Isolation here governs concurrent transactions on overlapping ranges of
//! the same spreadsheet, not row visibility.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IsolationLevel {
    /// Operations wait until no other open serializable transaction holds an
    /// overlapping range
    Serializable,
    /// No blocking; guarded writes are re-checked for conflicts at commit
    #[default]
    ReadCommitted,
    /// No blocking and no commit-time conflict re-check
    ReadUncommitted,
}

impl IsolationLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            IsolationLevel::Serializable => "SERIALIZABLE",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
        }
    }

    /// Queued operations take range locks
    pub fn takes_range_locks(&self) -> bool {
        matches!(self, IsolationLevel::Serializable)
    }

    /// Guarded writes are checked against the latest remote state at commit
    pub fn rechecks_conflicts(&self) -> bool {
        !matches!(self, IsolationLevel::ReadUncommitted)
    }

    /// Higher is stricter
    pub fn strictness_level(&self) -> u8 {
        match self {
            IsolationLevel::ReadUncommitted => 0,
            IsolationLevel::ReadCommitted => 1,
            IsolationLevel::Serializable => 2,
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
