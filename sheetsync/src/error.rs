// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Engine error types

use std::time::Duration;
use thiserror::Error;

use crate::conflict::ConflictReport;
use crate::throttle::OperationClass;
use crate::txn::{RollbackOutcome, TransactionId, TransactionState};

/// Errors reported by an upstream client
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UpstreamError {
    /// Network hiccup, 5xx, or upstream throttling; retried with backoff
    #[error("Transient upstream error: {0}")]
    Transient(String),

    #[error("Upstream rejected request: {0}")]
    Rejected(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Snapshot operation failed: {0}")]
    SnapshotFailed(String),
}

impl UpstreamError {
    pub fn is_transient(&self) -> bool {
        matches!(self, UpstreamError::Transient(_))
    }
}

/// Errors surfaced to engine callers
#[derive(Error, Debug, Clone)]
pub enum EngineError {
    #[error("Quota exceeded for {class} operations: {requested} token(s) not granted after {waited:?}")]
    QuotaExceeded {
        class: OperationClass,
        requested: u32,
        waited: Duration,
    },

    #[error("Upstream unavailable for {class} operations (circuit open), retry after {retry_after:?}")]
    UpstreamUnavailable {
        class: OperationClass,
        retry_after: Duration,
    },

    #[error("Conflict detected on {}: {} severity, {} cell(s) diverged", .0.location(), .0.severity, .0.changed_cells)]
    ConflictDetected(Box<ConflictReport>),

    #[error("Transaction capacity exceeded: {open} open, limit {limit}")]
    TransactionCapacityExceeded { open: usize, limit: usize },

    #[error("Operation {op_id} on {spreadsheet_id} ({range}) failed inside batch: {message}")]
    BatchPartialFailure {
        spreadsheet_id: String,
        range: String,
        op_id: u64,
        message: String,
    },

    #[error("Snapshot unavailable for {spreadsheet_id}: {reason}")]
    SnapshotUnavailable {
        spreadsheet_id: String,
        reason: String,
    },

    #[error("Transaction {transaction_id} failed: {source}; rollback: {rollback}")]
    TransactionFailed {
        transaction_id: TransactionId,
        source: Box<EngineError>,
        rollback: RollbackOutcome,
    },

    #[error("Upstream {operation} failed for {spreadsheet_id}: {source}")]
    Upstream {
        spreadsheet_id: String,
        operation: &'static str,
        source: UpstreamError,
    },

    #[error("{operation} cancelled")]
    Cancelled { operation: String },

    #[error("Timed out after {waited:?} waiting for range lock on {spreadsheet_id} ({range}) held by {holder}")]
    LockTimeout {
        spreadsheet_id: String,
        range: String,
        holder: TransactionId,
        waited: Duration,
    },

    #[error("Deadlock: transaction {transaction_id} would wait on {holder}, which waits on it")]
    Deadlock {
        transaction_id: TransactionId,
        holder: TransactionId,
    },

    #[error("Operation would create a dependency cycle in transaction {transaction_id}: {detail}")]
    DependencyCycle {
        transaction_id: TransactionId,
        detail: String,
    },

    #[error("Transaction {transaction_id} is {state}, expected {expected}")]
    InvalidTransactionState {
        transaction_id: TransactionId,
        state: TransactionState,
        expected: &'static str,
    },

    #[error("Transaction {0} not found")]
    TransactionNotFound(TransactionId),

    #[error("Invalid range '{input}': {reason}")]
    InvalidRange { input: String, reason: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Engine is shut down")]
    ShutDown,
}

impl EngineError {
    /// Errors a caller may retry after backing off
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::QuotaExceeded { .. }
            | EngineError::UpstreamUnavailable { .. }
            | EngineError::TransactionCapacityExceeded { .. }
            | EngineError::LockTimeout { .. }
            | EngineError::Deadlock { .. } => true,
            EngineError::Upstream { source, .. } => source.is_transient(),
            _ => false,
        }
    }

    pub(crate) fn upstream(
        spreadsheet_id: &str,
        operation: &'static str,
        source: UpstreamError,
    ) -> Self {
        EngineError::Upstream {
            spreadsheet_id: spreadsheet_id.to_string(),
            operation,
            source,
        }
    }

    pub(crate) fn invalid_range(input: &str, reason: impl Into<String>) -> Self {
        EngineError::InvalidRange {
            input: input.to_string(),
            reason: reason.into(),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(EngineError::QuotaExceeded {
            class: OperationClass::Write,
            requested: 1,
            waited: Duration::from_secs(1),
        }
        .is_retryable());
        assert!(EngineError::upstream("s", "apply", UpstreamError::Transient("503".into()))
            .is_retryable());
        assert!(!EngineError::upstream("s", "apply", UpstreamError::Rejected("bad".into()))
            .is_retryable());
        assert!(!EngineError::InvalidConfig("x".into()).is_retryable());
    }
}
