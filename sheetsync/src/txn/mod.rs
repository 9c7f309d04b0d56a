// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Transaction management
//!
//! Groups spreadsheet operations into transactions with snapshot-backed
//! rollback.
//!
//! # Features
//! - Lifecycle management (begin, add operation, commit, rollback)
//! - Isolation levels (serializable range locking, read committed, read uncommitted)
//! - Read/write dependency cycle rejection when operations are queued
//! - Deadlock detection between serializable transactions
//! - Automatic snapshot restore when a commit fails part way

mod dependency;
mod isolation;
mod locks;
mod manager;
mod snapshot;
mod state;

pub use isolation::IsolationLevel;
pub use manager::TransactionManager;
pub use state::{
    CommitReport, ConflictGuard, RollbackOutcome, RollbackSafety, TransactionId,
    TransactionState, TransactionStatistics, TxOperation,
};
