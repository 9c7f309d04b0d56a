// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Optimistic-concurrency conflict detection
//!
//! The detector remembers the last observed fingerprint of every range read
//! through the engine, plus a short history of recent versions so the base a
//! caller worked from can be diffed against the current remote state. It
//! reports conflicts and their severity; it never picks a resolution.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;

use super::fingerprint::Fingerprint;
use crate::config::ConflictConfig;
use crate::range::RangeRef;
use crate::values::{self, Values};

/// How far a remote divergence reaches
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    /// Few plain cells
    Low,
    /// Formulas changed, or more than the medium cell threshold
    Medium,
    /// More than the large cell threshold
    High,
    /// A protected range is involved
    Critical,
}

impl Severity {
    /// Non-decreasing in `changed_cells` for fixed formula and protection flags
    pub fn classify(
        changed_cells: u64,
        formula_cells_changed: u64,
        touches_protected: bool,
        config: &ConflictConfig,
    ) -> Self {
        if touches_protected {
            Severity::Critical
        } else if changed_cells > config.large_cell_count {
            Severity::High
        } else if formula_cells_changed > 0 || changed_cells > config.medium_cell_count {
            Severity::Medium
        } else {
            Severity::Low
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// A detected divergence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictReport {
    pub spreadsheet_id: String,
    pub range: RangeRef,
    /// Fingerprint the caller based its write on
    pub expected: Fingerprint,
    /// Fingerprint currently observed upstream
    pub current: Fingerprint,
    pub severity: Severity,
    pub changed_cells: u64,
    pub formula_cells_changed: u64,
    pub touches_protected: bool,
    pub detected_at: DateTime<Utc>,
    pub details: String,
}

impl ConflictReport {
    pub fn location(&self) -> String {
        format!("{}/{}", self.spreadsheet_id, self.range)
    }
}

/// Outcome of a conflict check
#[derive(Debug, Clone, PartialEq)]
pub enum ConflictCheck {
    /// Expected and current fingerprints match
    Clear,
    Conflict(Box<ConflictReport>),
    /// Nothing observed for the range yet
    Unobserved,
}

#[derive(Debug, Clone)]
struct Version {
    fingerprint: Fingerprint,
    values: Values,
}

#[derive(Debug)]
struct RangeHistory {
    range: RangeRef,
    /// Latest observed version; cleared when a write makes it stale
    current: Option<Fingerprint>,
    /// Most recent first
    recent: VecDeque<Version>,
}

#[derive(Debug, Default)]
struct DetectorInner {
    /// (spreadsheet id, range key) -> history
    histories: HashMap<(String, String), RangeHistory>,
    protected: HashMap<String, Vec<RangeRef>>,
}

pub struct ConflictDetector {
    config: ConflictConfig,
    inner: Mutex<DetectorInner>,
}

impl ConflictDetector {
    pub fn new(config: ConflictConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(DetectorInner::default()),
        }
    }

    /// Record the contents of a range as just observed upstream
    pub fn record_version(
        &self,
        spreadsheet_id: &str,
        range: &RangeRef,
        values: &Values,
        revision: Option<String>,
    ) -> Fingerprint {
        let mut fingerprint = Fingerprint::of(values).with_revision(revision);
        let key = (spreadsheet_id.to_string(), range.key());
        let depth = self.config.history_depth.max(1);

        let mut inner = self.inner.lock();
        let history = inner.histories.entry(key).or_insert_with(|| RangeHistory {
            range: range.clone(),
            current: None,
            recent: VecDeque::new(),
        });

        match history
            .recent
            .iter()
            .position(|v| v.fingerprint.matches(&fingerprint))
        {
            Some(index) => {
                // Same contents seen before: keep the first-seen timestamp
                if let Some(known) = history.recent.remove(index) {
                    fingerprint.captured_at = known.fingerprint.captured_at;
                }
            }
            None => {
                log::debug!(
                    "New version of {}/{}: checksum {:08x}",
                    spreadsheet_id,
                    range,
                    fingerprint.checksum
                );
            }
        }

        history.recent.push_front(Version {
            fingerprint: fingerprint.clone(),
            values: values::canonicalize(values.clone()),
        });
        history.recent.truncate(depth);
        history.current = Some(fingerprint.clone());
        fingerprint
    }

    /// Latest observed fingerprint, if still current
    pub fn current(&self, spreadsheet_id: &str, range: &RangeRef) -> Option<Fingerprint> {
        self.inner
            .lock()
            .histories
            .get(&(spreadsheet_id.to_string(), range.key()))
            .and_then(|h| h.current.clone())
    }

    /// Contents recorded for `fingerprint`, if still in history
    pub fn values_for(
        &self,
        spreadsheet_id: &str,
        range: &RangeRef,
        fingerprint: &Fingerprint,
    ) -> Option<Values> {
        self.inner
            .lock()
            .histories
            .get(&(spreadsheet_id.to_string(), range.key()))
            .and_then(|h| {
                h.recent
                    .iter()
                    .find(|v| v.fingerprint.matches(fingerprint))
                    .map(|v| v.values.clone())
            })
    }

    /// A write landed on `written`: every overlapping range's current
    /// fingerprint is stale. History is kept for base lookups.
    pub fn mark_stale(&self, spreadsheet_id: &str, written: &RangeRef) -> usize {
        let mut inner = self.inner.lock();
        let mut marked = 0;
        for ((sid, _), history) in inner.histories.iter_mut() {
            if sid == spreadsheet_id && history.range.overlaps(written) && history.current.is_some() {
                history.current = None;
                marked += 1;
            }
        }
        marked
    }

    /// Drop everything known about a spreadsheet, e.g. after a restore
    pub fn forget_spreadsheet(&self, spreadsheet_id: &str) {
        self.inner
            .lock()
            .histories
            .retain(|(sid, _), _| sid != spreadsheet_id);
    }

    /// Conflicts touching this range are reported as critical
    pub fn protect_range(&self, spreadsheet_id: &str, range: RangeRef) {
        self.inner
            .lock()
            .protected
            .entry(spreadsheet_id.to_string())
            .or_default()
            .push(range);
    }

    pub fn is_protected(&self, spreadsheet_id: &str, range: &RangeRef) -> bool {
        self.inner
            .lock()
            .protected
            .get(spreadsheet_id)
            .is_some_and(|ranges| ranges.iter().any(|p| p.overlaps(range)))
    }

    /// Compare the fingerprint a write was based on with the current one
    pub fn check_conflict(
        &self,
        spreadsheet_id: &str,
        range: &RangeRef,
        expected: &Fingerprint,
    ) -> ConflictCheck {
        let Some(current) = self.current(spreadsheet_id, range) else {
            return ConflictCheck::Unobserved;
        };
        match self.compare(spreadsheet_id, range, expected, current) {
            None => ConflictCheck::Clear,
            Some(report) => ConflictCheck::Conflict(report),
        }
    }

    /// Record contents just fetched upstream and compare `expected` with
    /// them. Returns the conflict, if any.
    pub fn check_remote(
        &self,
        spreadsheet_id: &str,
        range: &RangeRef,
        expected: &Fingerprint,
        remote: &Values,
    ) -> Option<Box<ConflictReport>> {
        let current = self.record_version(spreadsheet_id, range, remote, None);
        self.compare(spreadsheet_id, range, expected, current)
    }

    fn compare(
        &self,
        spreadsheet_id: &str,
        range: &RangeRef,
        expected: &Fingerprint,
        current: Fingerprint,
    ) -> Option<Box<ConflictReport>> {
        if expected.matches(&current) {
            return None;
        }
        let (current_values, base_values) = {
            let inner = self.inner.lock();
            let find = |fp: &Fingerprint| {
                inner
                    .histories
                    .get(&(spreadsheet_id.to_string(), range.key()))
                    .and_then(|history| {
                        history
                            .recent
                            .iter()
                            .find(|v| v.fingerprint.matches(fp))
                            .map(|v| v.values.clone())
                    })
            };
            (find(&current), find(expected))
        };

        let (changed_cells, formula_cells_changed) = match (&base_values, &current_values) {
            (Some(base), Some(now)) => (
                values::diff_count(base, now),
                values::formula_diff_count(base, now),
            ),
            // Base no longer in history: assume every occupied cell diverged
            _ => (
                expected.cell_count.max(current.cell_count),
                expected.formula_count.max(current.formula_count),
            ),
        };
        let changed_cells = changed_cells.max(1);
        let touches_protected = self.is_protected(spreadsheet_id, range);
        let severity = Severity::classify(
            changed_cells,
            formula_cells_changed,
            touches_protected,
            &self.config,
        );

        let details = format!(
            "expected checksum {:08x}, found {:08x}; {} cell(s) changed, {} formula cell(s){}",
            expected.checksum,
            current.checksum,
            changed_cells,
            formula_cells_changed,
            if touches_protected {
                ", protected range"
            } else {
                ""
            }
        );
        log::info!(
            "Conflict on {}/{}: {} severity ({})",
            spreadsheet_id,
            range,
            severity,
            details
        );

        Some(Box::new(ConflictReport {
            spreadsheet_id: spreadsheet_id.to_string(),
            range: range.clone(),
            expected: expected.clone(),
            current,
            severity,
            changed_cells,
            formula_cells_changed,
            touches_protected,
            detected_at: Utc::now(),
            details,
        }))
    }

    #[cfg(test)]
    pub fn tracked_count(&self) -> usize {
        self.inner.lock().histories.len()
    }
}
