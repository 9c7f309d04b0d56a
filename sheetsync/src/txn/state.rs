// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Transaction state management
//!
//! Identifiers, lifecycle states, queued operations, and the outcome types a
//! commit or rollback reports.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::batch::{BatchOp, OpOutcome};
use crate::conflict::{ConflictStrategy, Fingerprint};
use crate::range::RangeRef;

/// Unique identifier for a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId(u64);

impl TransactionId {
    pub(crate) fn from_u64(id: u64) -> Self {
        TransactionId(id)
    }

    /// Get the underlying ID value
    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn_{}", self.0)
    }
}

/// Transaction lifecycle states
///
/// `Init -> Pending -> Committing -> {Committed, Failed}`, and
/// `Init | Pending -> RolledBack`. Terminal states are final.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionState {
    /// Begun, nothing queued yet
    Init,
    /// Operations being queued
    Pending,
    Committing,
    Committed,
    RolledBack,
    Failed(String),
}

impl TransactionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionState::Committed | TransactionState::RolledBack | TransactionState::Failed(_)
        )
    }

    /// Operations may still be queued
    pub fn accepts_operations(&self) -> bool {
        matches!(self, TransactionState::Init | TransactionState::Pending)
    }

    pub fn can_transition_to(&self, next: &TransactionState) -> bool {
        use TransactionState::*;
        matches!(
            (self, next),
            (Init, Pending)
                | (Pending, Pending)
                | (Init | Pending, Committing)
                | (Init | Pending, RolledBack)
                | (Committing, Committed)
                | (Committing, Failed(_))
        )
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionState::Init => write!(f, "INIT"),
            TransactionState::Pending => write!(f, "PENDING"),
            TransactionState::Committing => write!(f, "COMMITTING"),
            TransactionState::Committed => write!(f, "COMMITTED"),
            TransactionState::RolledBack => write!(f, "ROLLED_BACK"),
            TransactionState::Failed(reason) => write!(f, "FAILED ({})", reason),
        }
    }
}

/// Conflict check attached to a queued write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictGuard {
    /// Fingerprint the write was based on
    pub expected: Fingerprint,
    /// Applied when the range diverged; `None` fails the commit
    pub strategy: Option<ConflictStrategy>,
}

/// Operation queued in a transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxOperation {
    pub op: BatchOp,
    pub guard: Option<ConflictGuard>,
}

impl TxOperation {
    pub fn new(op: BatchOp) -> Self {
        Self { op, guard: None }
    }

    /// Re-check the target against `expected` before committing
    pub fn guarded(op: BatchOp, expected: Fingerprint, strategy: Option<ConflictStrategy>) -> Self {
        Self {
            op,
            guard: Some(ConflictGuard { expected, strategy }),
        }
    }

    /// Ranges whose contents this operation depends on. A guarded write
    /// depends on its own target.
    pub fn reads(&self) -> Vec<RangeRef> {
        let mut ranges: Vec<RangeRef> = self.op.read_range().into_iter().collect();
        if self.guard.is_some() && self.op.is_write() {
            ranges.push(self.op.target().clone());
        }
        ranges
    }

    pub fn writes(&self) -> Vec<RangeRef> {
        self.op.written_range().into_iter().collect()
    }

    /// Every range this operation touches
    pub fn footprint(&self) -> Vec<RangeRef> {
        let mut ranges = self.reads();
        for written in self.writes() {
            if !ranges.contains(&written) {
                ranges.push(written);
            }
        }
        ranges
    }
}

impl From<BatchOp> for TxOperation {
    fn from(op: BatchOp) -> Self {
        TxOperation::new(op)
    }
}

/// What happened to the spreadsheet after a failed commit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RollbackOutcome {
    /// Nothing had been written upstream
    NotNeeded,
    /// The pre-transaction snapshot was restored
    Restored,
    /// Restoring the snapshot failed; the spreadsheet may hold partial writes
    RestoreFailed(String),
    /// No snapshot existed; partial writes stand
    NoSnapshot(String),
}

impl RollbackOutcome {
    /// The spreadsheet is known to hold its pre-transaction state
    pub fn is_clean(&self) -> bool {
        matches!(self, RollbackOutcome::NotNeeded | RollbackOutcome::Restored)
    }
}

impl fmt::Display for RollbackOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RollbackOutcome::NotNeeded => write!(f, "not needed, nothing was written"),
            RollbackOutcome::Restored => write!(f, "snapshot restored"),
            RollbackOutcome::RestoreFailed(reason) => write!(f, "restore failed ({})", reason),
            RollbackOutcome::NoSnapshot(reason) => {
                write!(f, "no snapshot ({}), partial writes stand", reason)
            }
        }
    }
}

/// Whether a commit ran with a restorable snapshot behind it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RollbackSafety {
    Protected,
    Unavailable { reason: String },
}

/// Result of a successful commit
#[derive(Debug, Clone, PartialEq)]
pub struct CommitReport {
    pub transaction_id: TransactionId,
    /// One outcome per dispatched operation, in dispatch order
    pub outcomes: Vec<OpOutcome>,
    /// Upstream calls the commit made, snapshot traffic excluded
    pub upstream_calls: u64,
    pub rollback_safety: RollbackSafety,
    /// Guarded writes whose conflict was resolved by their strategy
    pub resolved_conflicts: usize,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionStatistics {
    pub begun: u64,
    pub committed: u64,
    pub rolled_back: u64,
    pub failed: u64,
    pub open: usize,
    pub snapshots_taken: u64,
    pub snapshots_unavailable: u64,
    pub restores: u64,
    pub restore_failures: u64,
    pub lock_waits: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::values::grid;

    fn r(s: &str) -> RangeRef {
        s.parse().unwrap()
    }

    #[test]
    fn test_terminal_states_are_final() {
        for terminal in [
            TransactionState::Committed,
            TransactionState::RolledBack,
            TransactionState::Failed("x".into()),
        ] {
            assert!(terminal.is_terminal());
            assert!(!terminal.can_transition_to(&TransactionState::Pending));
            assert!(!terminal.can_transition_to(&TransactionState::Committing));
        }
        assert!(!TransactionState::Committing.can_transition_to(&TransactionState::Pending));
        assert!(TransactionState::Init.can_transition_to(&TransactionState::Committing));
    }

    #[test]
    fn test_guarded_write_reads_its_target() {
        let op = BatchOp::Update {
            range: r("A1:B2"),
            values: grid(vec![vec!["x"]]),
        };
        assert!(TxOperation::new(op.clone()).reads().is_empty());

        let guarded = TxOperation::guarded(op, Fingerprint::of(&Vec::new()), None);
        assert_eq!(guarded.reads(), vec![r("A1:B2")]);
        assert_eq!(guarded.footprint(), vec![r("A1:B2")]);
    }

    #[test]
    fn test_display() {
        assert_eq!(TransactionId::from_u64(7).to_string(), "txn_7");
        assert_eq!(
            TransactionState::Failed("boom".into()).to_string(),
            "FAILED (boom)"
        );
        assert!(RollbackOutcome::Restored.is_clean());
        assert!(!RollbackOutcome::NoSnapshot("oversized".into()).is_clean());
    }
}
