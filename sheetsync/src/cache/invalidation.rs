// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Tracked reads and overlap-based invalidation
//!
//! For every spreadsheet the graph holds the ranges that currently back a live
//! cache entry. A write computes its invalidation set by testing each tracked
//! range for overlap: same sheet, intersecting rows, intersecting columns.

use std::collections::HashMap;
use std::fmt;

use crate::range::RangeRef;

/// Why a tracked read was dropped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidationReason {
    Write { range: RangeRef },
    Spreadsheet,
    Expired,
    Evicted,
}

impl fmt::Display for InvalidationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvalidationReason::Write { range } => write!(f, "write to {}", range),
            InvalidationReason::Spreadsheet => write!(f, "spreadsheet reset"),
            InvalidationReason::Expired => write!(f, "ttl expired"),
            InvalidationReason::Evicted => write!(f, "lru eviction"),
        }
    }
}

#[derive(Debug, Default)]
pub struct InvalidationGraph {
    /// spreadsheet id -> range key -> range
    tracked: HashMap<String, HashMap<String, RangeRef>>,
}

impl InvalidationGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, spreadsheet_id: &str, range: &RangeRef) {
        self.tracked
            .entry(spreadsheet_id.to_string())
            .or_default()
            .insert(range.key(), range.clone());
    }

    pub fn untrack(&mut self, spreadsheet_id: &str, range_key: &str) -> Option<RangeRef> {
        let ranges = self.tracked.get_mut(spreadsheet_id)?;
        let removed = ranges.remove(range_key);
        if ranges.is_empty() {
            self.tracked.remove(spreadsheet_id);
        }
        removed
    }

    #[cfg(test)]
    pub fn is_tracked(&self, spreadsheet_id: &str, range_key: &str) -> bool {
        self.tracked
            .get(spreadsheet_id)
            .is_some_and(|ranges| ranges.contains_key(range_key))
    }

    /// Tracked ranges a write to `write_range` would make stale
    pub fn overlapping(&self, spreadsheet_id: &str, write_range: &RangeRef) -> Vec<RangeRef> {
        let mut hits: Vec<RangeRef> = self
            .tracked
            .get(spreadsheet_id)
            .map(|ranges| {
                ranges
                    .values()
                    .filter(|tracked| tracked.overlaps(write_range))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        hits.sort_by_key(|r| r.key());
        hits
    }

    pub fn ranges(&self, spreadsheet_id: &str) -> Vec<RangeRef> {
        let mut ranges: Vec<RangeRef> = self
            .tracked
            .get(spreadsheet_id)
            .map(|ranges| ranges.values().cloned().collect())
            .unwrap_or_default();
        ranges.sort_by_key(|r| r.key());
        ranges
    }

    pub fn remove_spreadsheet(&mut self, spreadsheet_id: &str) -> Vec<RangeRef> {
        self.tracked
            .remove(spreadsheet_id)
            .map(|ranges| ranges.into_values().collect())
            .unwrap_or_default()
    }

    /// Number of tracked reads across all spreadsheets
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.tracked.values().map(HashMap::len).sum()
    }

    pub fn clear(&mut self) {
        self.tracked.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(s: &str) -> RangeRef {
        s.parse().unwrap()
    }

    #[test]
    fn test_overlap_selection() {
        let mut graph = InvalidationGraph::new();
        graph.track("s", &r("Sheet1!A1:B10"));
        graph.track("s", &r("Sheet1!D1:D3"));
        graph.track("other", &r("Sheet1!A1:B10"));

        assert!(graph.overlapping("s", &r("Sheet1!C1:C5")).is_empty());
        assert_eq!(graph.overlapping("s", &r("Sheet1!A5:B5")), vec![r("Sheet1!A1:B10")]);
        assert_eq!(graph.overlapping("s", &r("Sheet1!1:1")).len(), 2);
        assert_eq!(graph.len(), 3);
    }

    #[test]
    fn test_untrack_and_remove() {
        let mut graph = InvalidationGraph::new();
        let range = r("Sheet1!A1:B2");
        graph.track("s", &range);
        assert!(graph.is_tracked("s", &range.key()));
        assert_eq!(graph.untrack("s", &range.key()), Some(range.clone()));
        assert!(!graph.is_tracked("s", &range.key()));

        graph.track("s", &range);
        assert_eq!(graph.remove_spreadsheet("s"), vec![range]);
        assert_eq!(graph.len(), 0);
    }
}
