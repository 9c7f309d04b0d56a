// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! sheetsync - client-side consistency and efficiency engine for spreadsheet APIs
//!
//! sheetsync sits between high-level spreadsheet operations (read, write,
//! append, format) and a remote, quota-limited spreadsheet API. It keeps the
//! number of upstream calls low and the local view coherent.
//!
//! # Features
//!
//! - **Adaptive batching**: operations submitted close together are merged into
//!   one upstream call; the batch window tunes itself to live traffic
//! - **Coherent read cache**: TTL/LRU cache whose entries are invalidated by
//!   overlapping writes
//! - **Conflict detection**: range fingerprints with pluggable resolution
//!   strategies (overwrite, cancel, merge, last/first write wins)
//! - **Transactions**: begin/commit/rollback with snapshot-based restore and
//!   serializable range locking
//! - **Prefetching**: access-pattern scoring that warms the cache in the
//!   background using a dedicated token allocation
//! - **Backpressure**: per-class token buckets and a circuit breaker in front of
//!   every upstream call
//!
//! # Usage
//!
//! ```ignore
//! use sheetsync::{EngineConfig, MemoryUpstream, SyncCoordinator, WriteOptions};
//! use std::sync::Arc;
//!
//! let upstream = Arc::new(MemoryUpstream::new());
//! let coordinator = SyncCoordinator::new(EngineConfig::default(), upstream)?;
//!
//! let values = coordinator.read("sheet-1", "Sheet1!A1:B10").await?;
//! let fingerprint = coordinator.fingerprint("sheet-1", "Sheet1!A1:B10")?;
//! coordinator
//!     .write("sheet-1", "Sheet1!A1:B10", values, WriteOptions::guarded(fingerprint))
//!     .await?;
//! ```

// Public modules - exposed to external users
pub mod coordinator;
pub mod upstream;

// Internal modules - components are reachable through the coordinator
pub(crate) mod batch;
pub(crate) mod cache;
pub(crate) mod config;
pub(crate) mod conflict;
pub(crate) mod error;
pub(crate) mod prefetch;
pub(crate) mod range;
pub(crate) mod throttle;
pub(crate) mod txn;
pub(crate) mod values;

// Re-export the public API - SyncCoordinator is the main entry point
pub use coordinator::{ClassThrottle, EngineStats, SyncCoordinator, WriteOptions, WriteReport};

pub use batch::{BatchOp, BatchStats, OpOutcome, WriteOutcome};
pub use cache::CacheStats;
pub use config::{ConflictConfig, EngineConfig, PrefetchConfig, PrefetchWeights, RetryConfig};
pub use conflict::{
    ConflictCheck, ConflictReport, ConflictStrategy, Fingerprint, Severity, StrategyTag, TieBreak,
};
pub use error::{EngineError, EngineResult, UpstreamError};
pub use prefetch::{PrefetchCandidate, PrefetchReason, PrefetchStats};
pub use range::{Interval, RangeRef};
pub use throttle::{CircuitState, OperationClass};
pub use txn::{
    CommitReport, ConflictGuard, IsolationLevel, RollbackOutcome, RollbackSafety, TransactionId,
    TransactionState, TransactionStatistics, TxOperation,
};
pub use upstream::{
    ApplyReply, MemoryUpstream, RequestOutcome, UpstreamClient, UpstreamRequest, ValueRange,
};
pub use values::{grid, CellValue, Values};

/// sheetsync version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// sheetsync crate name
pub const CRATE_NAME: &str = env!("CARGO_PKG_NAME");
