// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Range fingerprints

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::values::{self, Values};

/// Checksum of a range's canonical contents, plus when it was observed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub checksum: u32,
    /// Non-empty cells
    pub cell_count: u64,
    pub formula_count: u64,
    /// When this version was first observed
    pub captured_at: DateTime<Utc>,
    /// Upstream revision id, informational only
    pub revision: Option<String>,
}

impl Fingerprint {
    /// Fingerprint a grid; trailing empty cells and rows do not count
    pub fn of(values: &Values) -> Self {
        let canonical = values::canonicalize(values.clone());
        let mut hasher = crc32fast::Hasher::new();
        let mut buf = Vec::new();
        for row in &canonical {
            buf.clear();
            for cell in row {
                cell.write_canonical(&mut buf);
            }
            buf.push(0x1e);
            hasher.update(&buf);
        }

        Self {
            checksum: hasher.finalize(),
            cell_count: values::non_empty_cells(&canonical),
            formula_count: values::formula_cells(&canonical),
            captured_at: Utc::now(),
            revision: None,
        }
    }

    pub fn with_revision(mut self, revision: Option<String>) -> Self {
        self.revision = revision;
        self
    }

    /// Same contents, regardless of when or through which revision observed
    pub fn matches(&self, other: &Fingerprint) -> bool {
        self.checksum == other.checksum && self.cell_count == other.cell_count
    }
}
