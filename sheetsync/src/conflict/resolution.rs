// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Conflict resolution strategies
//!
//! Resolution is a pure function of the strategy, the local write, and the
//! remote state. Strategies form a closed set; [`resolve`] dispatches through
//! a table from [`StrategyTag`] to resolver function.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::fingerprint::Fingerprint;
use crate::batch::BatchOp;
use crate::range::{Interval, RangeRef};
use crate::values::{self, CellValue, Values};

/// Who wins a cell both sides changed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TieBreak {
    PreferLocal,
    PreferRemote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictStrategy {
    /// Apply the local write regardless
    Overwrite,
    /// Abort and keep the remote state
    Cancel,
    /// Apply local changes the remote did not touch; `tie_break` decides the rest
    Merge { tie_break: TieBreak },
    LastWriteWins,
    FirstWriteWins,
}

/// Discriminant of [`ConflictStrategy`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StrategyTag {
    Overwrite,
    Cancel,
    Merge,
    LastWriteWins,
    FirstWriteWins,
}

impl ConflictStrategy {
    pub fn tag(&self) -> StrategyTag {
        match self {
            ConflictStrategy::Overwrite => StrategyTag::Overwrite,
            ConflictStrategy::Cancel => StrategyTag::Cancel,
            ConflictStrategy::Merge { .. } => StrategyTag::Merge,
            ConflictStrategy::LastWriteWins => StrategyTag::LastWriteWins,
            ConflictStrategy::FirstWriteWins => StrategyTag::FirstWriteWins,
        }
    }
}

impl fmt::Display for StrategyTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrategyTag::Overwrite => write!(f, "overwrite"),
            StrategyTag::Cancel => write!(f, "cancel"),
            StrategyTag::Merge => write!(f, "merge"),
            StrategyTag::LastWriteWins => write!(f, "last_write_wins"),
            StrategyTag::FirstWriteWins => write!(f, "first_write_wins"),
        }
    }
}

/// The write a caller wanted to make
#[derive(Debug, Clone, PartialEq)]
pub struct LocalWrite {
    pub range: RangeRef,
    pub values: Values,
    /// Contents the write was based on, when still known
    pub base: Option<Values>,
    pub issued_at: DateTime<Utc>,
}

/// What is upstream now
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteState {
    pub values: Values,
    pub fingerprint: Fingerprint,
    /// When the engine first observed this remote version
    pub modified_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Operations to run instead of the original write; may be empty when
    /// the remote already holds the result
    Apply(Vec<BatchOp>),
    Abort { reason: String },
}

type Resolver = fn(&ConflictStrategy, &LocalWrite, &RemoteState) -> Resolution;

const RESOLVERS: [(StrategyTag, Resolver); 5] = [
    (StrategyTag::Overwrite, resolve_overwrite),
    (StrategyTag::Cancel, resolve_cancel),
    (StrategyTag::Merge, resolve_merge),
    (StrategyTag::LastWriteWins, resolve_last_write_wins),
    (StrategyTag::FirstWriteWins, resolve_first_write_wins),
];

/// Decide what to do about a conflicting write
pub fn resolve(strategy: &ConflictStrategy, local: &LocalWrite, remote: &RemoteState) -> Resolution {
    let tag = strategy.tag();
    match RESOLVERS.iter().find(|(t, _)| *t == tag) {
        Some((_, resolver)) => resolver(strategy, local, remote),
        None => Resolution::Abort {
            reason: format!("no resolver for {}", tag),
        },
    }
}

fn overwrite(local: &LocalWrite) -> Resolution {
    Resolution::Apply(vec![BatchOp::Update {
        range: local.range.clone(),
        values: local.values.clone(),
    }])
}

fn resolve_overwrite(_: &ConflictStrategy, local: &LocalWrite, _: &RemoteState) -> Resolution {
    overwrite(local)
}

fn resolve_cancel(_: &ConflictStrategy, _: &LocalWrite, remote: &RemoteState) -> Resolution {
    Resolution::Abort {
        reason: format!(
            "cancelled in favour of remote version {:08x}",
            remote.fingerprint.checksum
        ),
    }
}

fn resolve_last_write_wins(_: &ConflictStrategy, local: &LocalWrite, remote: &RemoteState) -> Resolution {
    if local.issued_at >= remote.modified_at {
        overwrite(local)
    } else {
        Resolution::Abort {
            reason: format!(
                "remote version observed at {} is newer than local write issued at {}",
                remote.modified_at, local.issued_at
            ),
        }
    }
}

fn resolve_first_write_wins(_: &ConflictStrategy, local: &LocalWrite, remote: &RemoteState) -> Resolution {
    if local.issued_at < remote.modified_at {
        overwrite(local)
    } else {
        Resolution::Abort {
            reason: format!(
                "remote version observed at {} predates local write issued at {}",
                remote.modified_at, local.issued_at
            ),
        }
    }
}

fn resolve_merge(strategy: &ConflictStrategy, local: &LocalWrite, remote: &RemoteState) -> Resolution {
    let tie_break = match strategy {
        ConflictStrategy::Merge { tie_break } => *tie_break,
        _ => TieBreak::PreferRemote,
    };

    // Cells to write, one row at a time, as (column offset, value)
    let mut ops = Vec::new();
    for (r, row) in local.values.iter().enumerate() {
        let mut run: Vec<CellValue> = Vec::new();
        let mut run_start = 0usize;

        for (c, mine) in row.iter().enumerate() {
            let theirs = values::cell_at(&remote.values, r, c);
            let local_changed = match &local.base {
                Some(base) => values::cell_at(base, r, c) != mine,
                None => true,
            };
            let remote_changed = match &local.base {
                Some(base) => values::cell_at(base, r, c) != theirs,
                None => theirs != mine,
            };

            let write = if !local_changed || mine == theirs {
                false
            } else if !remote_changed {
                true
            } else {
                tie_break == TieBreak::PreferLocal
            };

            if write {
                if run.is_empty() {
                    run_start = c;
                }
                run.push(mine.clone());
            } else if !run.is_empty() {
                ops.push(cell_run(&local.range, r, run_start, std::mem::take(&mut run)));
            }
        }
        if !run.is_empty() {
            ops.push(cell_run(&local.range, r, run_start, run));
        }
    }

    Resolution::Apply(ops)
}

fn cell_run(range: &RangeRef, row: usize, col_start: usize, cells: Vec<CellValue>) -> BatchOp {
    let row = range.rows.start + row as u32;
    let start = range.cols.start + col_start as u32;
    let end = start + cells.len() as u32 - 1;
    BatchOp::Update {
        range: RangeRef::new(range.sheet.clone(), Interval::single(row), Interval::new(start, end)),
        values: vec![cells],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::values::grid;
    use chrono::Duration;

    fn r(s: &str) -> RangeRef {
        s.parse().unwrap()
    }

    fn remote(values: Values, modified_at: DateTime<Utc>) -> RemoteState {
        RemoteState {
            fingerprint: Fingerprint::of(&values),
            values,
            modified_at,
        }
    }

    fn local(values: Values, base: Option<Values>, issued_at: DateTime<Utc>) -> LocalWrite {
        LocalWrite {
            range: r("Sheet1!A1:C2"),
            values,
            base,
            issued_at,
        }
    }

    #[test]
    fn test_overwrite_and_cancel() {
        let now = Utc::now();
        let mine = local(grid(vec![vec!["x"]]), None, now);
        let theirs = remote(grid(vec![vec!["y"]]), now);

        assert_eq!(
            resolve(&ConflictStrategy::Overwrite, &mine, &theirs),
            Resolution::Apply(vec![BatchOp::Update {
                range: r("Sheet1!A1:C2"),
                values: grid(vec![vec!["x"]]),
            }])
        );
        assert!(matches!(
            resolve(&ConflictStrategy::Cancel, &mine, &theirs),
            Resolution::Abort { .. }
        ));
    }

    #[test]
    fn test_write_time_strategies() {
        let now = Utc::now();
        let earlier = now - Duration::seconds(5);
        let mine = local(grid(vec![vec!["x"]]), None, now);
        let older_remote = remote(grid(vec![vec!["y"]]), earlier);
        let newer_remote = remote(grid(vec![vec!["y"]]), now + Duration::seconds(5));

        assert!(matches!(
            resolve(&ConflictStrategy::LastWriteWins, &mine, &older_remote),
            Resolution::Apply(_)
        ));
        assert!(matches!(
            resolve(&ConflictStrategy::LastWriteWins, &mine, &newer_remote),
            Resolution::Abort { .. }
        ));
        assert!(matches!(
            resolve(&ConflictStrategy::FirstWriteWins, &mine, &older_remote),
            Resolution::Abort { .. }
        ));
        assert!(matches!(
            resolve(&ConflictStrategy::FirstWriteWins, &mine, &newer_remote),
            Resolution::Apply(_)
        ));
    }

    #[test]
    fn test_merge_keeps_remote_only_changes() {
        let now = Utc::now();
        let base = grid(vec![vec!["a", "b", "c"], vec!["d", "e", "f"]]);
        // Local changed A1 and C2; remote changed B1 and C2
        let mine = local(
            grid(vec![vec!["A", "b", "c"], vec!["d", "e", "F"]]),
            Some(base),
            now,
        );
        let theirs = remote(grid(vec![vec!["a", "B", "c"], vec!["d", "e", "R"]]), now);

        let Resolution::Apply(ops) = resolve(
            &ConflictStrategy::Merge {
                tie_break: TieBreak::PreferRemote,
            },
            &mine,
            &theirs,
        ) else {
            panic!("merge never aborts");
        };
        assert_eq!(
            ops,
            vec![BatchOp::Update {
                range: r("Sheet1!A1"),
                values: grid(vec![vec!["A"]]),
            }]
        );

        let Resolution::Apply(ops) = resolve(
            &ConflictStrategy::Merge {
                tie_break: TieBreak::PreferLocal,
            },
            &mine,
            &theirs,
        ) else {
            panic!("merge never aborts");
        };
        assert_eq!(
            ops,
            vec![
                BatchOp::Update {
                    range: r("Sheet1!A1"),
                    values: grid(vec![vec!["A"]]),
                },
                BatchOp::Update {
                    range: r("Sheet1!C2"),
                    values: grid(vec![vec!["F"]]),
                },
            ]
        );
    }

    #[test]
    fn test_merge_without_base_writes_contiguous_runs() {
        let now = Utc::now();
        let mine = local(grid(vec![vec!["1", "2", "3"]]), None, now);
        let theirs = remote(grid(vec![vec!["9", "2", "9"]]), now);
        let Resolution::Apply(ops) = resolve(
            &ConflictStrategy::Merge {
                tie_break: TieBreak::PreferLocal,
            },
            &mine,
            &theirs,
        ) else {
            panic!("merge never aborts");
        };
        assert_eq!(ops.len(), 2);
    }
}
