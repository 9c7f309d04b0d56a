// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Transaction manager implementation
//!
//! Owns the registry of transactions and drives each one through its
//! lifecycle: snapshot capture at begin, dependency and lock checks as
//! operations are queued, and the commit pipeline (conflict re-check,
//! dispatch through the batcher, automatic restore on failure).

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::dependency::DependencyGraph;
use super::isolation::IsolationLevel;
use super::locks::RangeLockTable;
use super::snapshot::{self, Snapshot, SnapshotHandle, SnapshotStatus};
use super::state::{
    CommitReport, RollbackOutcome, RollbackSafety, TransactionId, TransactionState,
    TransactionStatistics, TxOperation,
};
use crate::batch::{BatchOp, OpOutcome, RequestBatcher};
use crate::cache::ReadCache;
use crate::config::EngineConfig;
use crate::conflict::{resolve, ConflictDetector, LocalWrite, RemoteState, Resolution};
use crate::error::{EngineError, EngineResult};
use crate::range::RangeRef;
use crate::throttle::Admission;
use crate::upstream::UpstreamClient;
use crate::values::Values;

const ACCEPTING: &str = "INIT or PENDING";

struct QueuedOp {
    op: TxOperation,
    queued_at: DateTime<Utc>,
}

struct Transaction {
    spreadsheet_id: String,
    isolation: IsolationLevel,
    state: TransactionState,
    operations: Vec<QueuedOp>,
    dependencies: DependencyGraph,
    snapshot: Option<SnapshotHandle>,
    began_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

/// Failure inside the commit pipeline
struct CommitFailure {
    error: EngineError,
    /// Whether any write reached upstream before the failure
    wrote: bool,
}

impl CommitFailure {
    fn before_writes(error: EngineError) -> Self {
        Self {
            error,
            wrote: false,
        }
    }
}

struct Dispatched {
    outcomes: Vec<OpOutcome>,
    upstream_calls: u64,
    resolved_conflicts: usize,
}

/// Transaction manager handles the lifecycle of all transactions
pub struct TransactionManager {
    max_open: usize,
    max_snapshot_bytes: u64,
    snapshot_timeout: Duration,
    lock_timeout: Duration,
    commit_without_snapshot: bool,
    upstream: Arc<dyn UpstreamClient>,
    admission: Arc<Admission>,
    batcher: RequestBatcher,
    cache: Arc<ReadCache>,
    detector: Arc<ConflictDetector>,
    transactions: Mutex<HashMap<TransactionId, Transaction>>,
    locks: RangeLockTable,
    next_id: AtomicU64,
    stats: Mutex<TransactionStatistics>,
}

impl TransactionManager {
    pub fn new(
        config: &EngineConfig,
        upstream: Arc<dyn UpstreamClient>,
        admission: Arc<Admission>,
        batcher: RequestBatcher,
        cache: Arc<ReadCache>,
        detector: Arc<ConflictDetector>,
    ) -> Self {
        Self {
            max_open: config.max_concurrent_transactions,
            max_snapshot_bytes: config.max_snapshot_bytes,
            snapshot_timeout: config.snapshot_timeout(),
            lock_timeout: config.lock_timeout(),
            commit_without_snapshot: config.commit_without_snapshot,
            upstream,
            admission,
            batcher,
            cache,
            detector,
            transactions: Mutex::new(HashMap::new()),
            locks: RangeLockTable::new(),
            next_id: AtomicU64::new(1),
            stats: Mutex::new(TransactionStatistics::default()),
        }
    }

    /// Start a transaction on `spreadsheet_id` and begin capturing its
    /// snapshot in the background. Must be called inside a tokio runtime.
    pub fn begin(
        &self,
        spreadsheet_id: &str,
        isolation: IsolationLevel,
    ) -> EngineResult<TransactionId> {
        let id = {
            let mut transactions = self.transactions.lock();
            let open = transactions
                .values()
                .filter(|t| !t.state.is_terminal())
                .count();
            if open >= self.max_open {
                log::warn!(
                    "Refusing transaction on {}: {} open, limit {}",
                    spreadsheet_id,
                    open,
                    self.max_open
                );
                return Err(EngineError::TransactionCapacityExceeded {
                    open,
                    limit: self.max_open,
                });
            }

            let id = TransactionId::from_u64(self.next_id.fetch_add(1, Ordering::SeqCst));
            let snapshot = SnapshotHandle::capture(
                Arc::clone(&self.upstream),
                Arc::clone(&self.admission),
                spreadsheet_id,
                self.max_snapshot_bytes,
            );
            transactions.insert(
                id,
                Transaction {
                    spreadsheet_id: spreadsheet_id.to_string(),
                    isolation,
                    state: TransactionState::Init,
                    operations: Vec::new(),
                    dependencies: DependencyGraph::new(),
                    snapshot: Some(snapshot),
                    began_at: Utc::now(),
                    finished_at: None,
                },
            );
            id
        };

        self.stats.lock().begun += 1;
        log::info!(
            "BEGIN {} on {} ({})",
            id,
            spreadsheet_id,
            isolation.as_str()
        );
        Ok(id)
    }

    /// Queue an operation. Serializable transactions first take range locks
    /// on everything the operation touches.
    pub async fn add_operation(&self, id: TransactionId, op: TxOperation) -> EngineResult<()> {
        self.add_operation_with_cancel(id, op, None).await
    }

    pub async fn add_operation_with_cancel(
        &self,
        id: TransactionId,
        op: TxOperation,
        cancel: Option<&CancellationToken>,
    ) -> EngineResult<()> {
        let (spreadsheet_id, isolation) = {
            let transactions = self.transactions.lock();
            let txn = transactions
                .get(&id)
                .ok_or(EngineError::TransactionNotFound(id))?;
            ensure_accepting(id, txn)?;
            txn.dependencies
                .check(txn.operations.len(), &op)
                .map_err(|detail| EngineError::DependencyCycle {
                    transaction_id: id,
                    detail,
                })?;
            (txn.spreadsheet_id.clone(), txn.isolation)
        };

        if isolation.takes_range_locks() {
            let waited = self
                .locks
                .acquire(id, &spreadsheet_id, &op.footprint(), self.lock_timeout, cancel)
                .await?;
            if waited {
                self.stats.lock().lock_waits += 1;
            }
        }

        let mut transactions = self.transactions.lock();
        let txn = transactions
            .get_mut(&id)
            .ok_or(EngineError::TransactionNotFound(id))?;
        if let Err(err) = ensure_accepting(id, txn) {
            // Finished while this call waited for its lock
            self.locks.release(id);
            return Err(err);
        }
        let position = txn.operations.len();
        txn.dependencies
            .try_add(position, &op)
            .map_err(|detail| EngineError::DependencyCycle {
                transaction_id: id,
                detail,
            })?;
        log::debug!(
            "{} queued #{}: {} {}",
            id,
            position,
            op.op.kind(),
            op.op.target()
        );
        txn.operations.push(QueuedOp {
            op,
            queued_at: Utc::now(),
        });
        txn.state = TransactionState::Pending;
        Ok(())
    }

    pub async fn commit(&self, id: TransactionId) -> EngineResult<CommitReport> {
        self.commit_with_cancel(id, None).await
    }

    /// Commit queued operations. On failure after any write reached
    /// upstream, the snapshot is restored when one exists; the error carries
    /// the rollback outcome either way.
    pub async fn commit_with_cancel(
        &self,
        id: TransactionId,
        cancel: Option<&CancellationToken>,
    ) -> EngineResult<CommitReport> {
        let (spreadsheet_id, isolation, operations, handle) = {
            let mut transactions = self.transactions.lock();
            let txn = transactions
                .get_mut(&id)
                .ok_or(EngineError::TransactionNotFound(id))?;
            ensure_accepting(id, txn)?;
            txn.state = TransactionState::Committing;
            (
                txn.spreadsheet_id.clone(),
                txn.isolation,
                std::mem::take(&mut txn.operations),
                txn.snapshot.take(),
            )
        };
        log::info!(
            "COMMIT {} on {}: {} operation(s)",
            id,
            spreadsheet_id,
            operations.len()
        );

        let (snapshot, safety) = self.await_snapshot(handle).await;
        if let RollbackSafety::Unavailable { reason } = &safety {
            self.stats.lock().snapshots_unavailable += 1;
            if !self.commit_without_snapshot {
                let err = EngineError::SnapshotUnavailable {
                    spreadsheet_id: spreadsheet_id.clone(),
                    reason: reason.clone(),
                };
                self.finish(id, TransactionState::Failed(err.to_string()));
                return Err(err);
            }
            log::warn!(
                "{} committing without rollback safety: {}",
                id,
                reason
            );
        } else {
            self.stats.lock().snapshots_taken += 1;
        }

        match self
            .dispatch(id, &spreadsheet_id, isolation, operations, cancel)
            .await
        {
            Ok(dispatched) => {
                if let Some(snapshot) = &snapshot {
                    snapshot::discard(self.upstream.as_ref(), snapshot).await;
                }
                self.finish(id, TransactionState::Committed);
                log::info!(
                    "{} committed: {} outcome(s), {} upstream call(s)",
                    id,
                    dispatched.outcomes.len(),
                    dispatched.upstream_calls
                );
                Ok(CommitReport {
                    transaction_id: id,
                    outcomes: dispatched.outcomes,
                    upstream_calls: dispatched.upstream_calls,
                    rollback_safety: safety,
                    resolved_conflicts: dispatched.resolved_conflicts,
                })
            }
            Err(failure) => {
                let rollback = self
                    .roll_back_upstream(&spreadsheet_id, failure.wrote, snapshot, &safety)
                    .await;
                log::info!("{} failed: {}; rollback: {}", id, failure.error, rollback);
                self.finish(id, TransactionState::Failed(failure.error.to_string()));
                Err(EngineError::TransactionFailed {
                    transaction_id: id,
                    source: Box::new(failure.error),
                    rollback,
                })
            }
        }
    }

    /// Discard queued operations without touching upstream
    pub fn rollback(&self, id: TransactionId) -> EngineResult<()> {
        let handle = {
            let mut transactions = self.transactions.lock();
            let txn = transactions
                .get_mut(&id)
                .ok_or(EngineError::TransactionNotFound(id))?;
            ensure_accepting(id, txn)?;
            let discarded = txn.operations.len();
            txn.operations.clear();
            txn.dependencies = DependencyGraph::new();
            txn.state = TransactionState::RolledBack;
            txn.finished_at = Some(Utc::now());
            log::info!("ROLLBACK {}: {} queued operation(s) discarded", id, discarded);
            txn.snapshot.take()
        };
        if let Some(handle) = handle {
            handle.discard_when_ready(Arc::clone(&self.upstream));
        }
        self.locks.release(id);
        self.stats.lock().rolled_back += 1;
        Ok(())
    }

    pub fn status(&self, id: TransactionId) -> EngineResult<TransactionState> {
        self.transactions
            .lock()
            .get(&id)
            .map(|t| t.state.clone())
            .ok_or(EngineError::TransactionNotFound(id))
    }

    /// Operations queued so far
    #[cfg(test)]
    pub fn queued_operations(&self, id: TransactionId) -> EngineResult<Vec<TxOperation>> {
        self.transactions
            .lock()
            .get(&id)
            .map(|t| t.operations.iter().map(|q| q.op.clone()).collect())
            .ok_or(EngineError::TransactionNotFound(id))
    }

    /// Ranges held by a serializable transaction
    #[cfg(test)]
    pub fn held_ranges(&self, id: TransactionId) -> Vec<RangeRef> {
        self.locks.held_by(id)
    }

    pub fn open_count(&self) -> usize {
        self.transactions
            .lock()
            .values()
            .filter(|t| !t.state.is_terminal())
            .count()
    }

    pub fn statistics(&self) -> TransactionStatistics {
        let mut stats = self.stats.lock().clone();
        stats.open = self.open_count();
        stats
    }

    /// Forget finished transactions, returning how many were removed
    pub fn cleanup_completed(&self) -> usize {
        let mut transactions = self.transactions.lock();
        let before = transactions.len();
        transactions.retain(|id, t| {
            let keep = !t.state.is_terminal();
            if !keep {
                log::debug!(
                    "Dropping {} ({}), began {}, finished {:?}",
                    id,
                    t.state,
                    t.began_at,
                    t.finished_at
                );
            }
            keep
        });
        before - transactions.len()
    }

    /// Roll back every transaction that has not started committing
    pub fn abort_open(&self) -> usize {
        let ids: Vec<TransactionId> = self
            .transactions
            .lock()
            .iter()
            .filter(|(_, t)| t.state.accepts_operations())
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter()
            .filter(|id| self.rollback(*id).is_ok())
            .count()
    }

    async fn await_snapshot(
        &self,
        handle: Option<SnapshotHandle>,
    ) -> (Option<Snapshot>, RollbackSafety) {
        let Some(mut handle) = handle else {
            return (
                None,
                RollbackSafety::Unavailable {
                    reason: "no snapshot was requested".to_string(),
                },
            );
        };
        match handle.wait(self.snapshot_timeout).await {
            SnapshotStatus::Ready(snapshot) => (Some(snapshot), RollbackSafety::Protected),
            status => {
                if matches!(status, SnapshotStatus::TimedOut(_)) {
                    handle.discard_when_ready(Arc::clone(&self.upstream));
                }
                let reason = status.unavailable_reason().unwrap_or_default();
                (None, RollbackSafety::Unavailable { reason })
            }
        }
    }

    async fn roll_back_upstream(
        &self,
        spreadsheet_id: &str,
        wrote: bool,
        snapshot: Option<Snapshot>,
        safety: &RollbackSafety,
    ) -> RollbackOutcome {
        if !wrote {
            if let Some(snapshot) = &snapshot {
                snapshot::discard(self.upstream.as_ref(), snapshot).await;
            }
            return RollbackOutcome::NotNeeded;
        }

        let outcome = match &snapshot {
            Some(snapshot) => {
                match snapshot::restore(self.upstream.as_ref(), &self.admission, snapshot).await {
                    Ok(()) => {
                        log::info!(
                            "Restored {} from snapshot {}",
                            spreadsheet_id,
                            snapshot.snapshot_id
                        );
                        snapshot::discard(self.upstream.as_ref(), snapshot).await;
                        self.stats.lock().restores += 1;
                        RollbackOutcome::Restored
                    }
                    Err(reason) => {
                        // The copy is kept for manual recovery
                        log::warn!(
                            "Restore of {} from snapshot {} failed: {}",
                            spreadsheet_id,
                            snapshot.snapshot_id,
                            reason
                        );
                        self.stats.lock().restore_failures += 1;
                        RollbackOutcome::RestoreFailed(reason)
                    }
                }
            }
            None => {
                let reason = match safety {
                    RollbackSafety::Unavailable { reason } => reason.clone(),
                    RollbackSafety::Protected => "snapshot missing".to_string(),
                };
                log::warn!(
                    "Partial writes to {} stand: no snapshot ({})",
                    spreadsheet_id,
                    reason
                );
                RollbackOutcome::NoSnapshot(reason)
            }
        };

        // Cached reads and fingerprints no longer describe the spreadsheet
        self.cache.invalidate_spreadsheet(spreadsheet_id);
        self.detector.forget_spreadsheet(spreadsheet_id);
        outcome
    }

    /// Conflict re-check, then dispatch in same-class runs, stopping at the
    /// first failed operation
    async fn dispatch(
        &self,
        id: TransactionId,
        spreadsheet_id: &str,
        isolation: IsolationLevel,
        operations: Vec<QueuedOp>,
        cancel: Option<&CancellationToken>,
    ) -> Result<Dispatched, CommitFailure> {
        let mut upstream_calls = 0u64;
        let (ops, resolved_conflicts) = if isolation.rechecks_conflicts() {
            self.recheck_guards(id, spreadsheet_id, operations, &mut upstream_calls)
                .await?
        } else {
            (operations.into_iter().map(|q| q.op.op).collect(), 0)
        };

        let mut outcomes = Vec::with_capacity(ops.len());
        let mut wrote = false;
        for run in class_runs(ops) {
            if cancel.is_some_and(CancellationToken::is_cancelled) {
                return Err(CommitFailure {
                    error: EngineError::Cancelled {
                        operation: format!("commit of {}", id),
                    },
                    wrote,
                });
            }
            wrote |= run.iter().any(BatchOp::is_write);
            upstream_calls += 1;
            for result in self.batcher.dispatch_now(spreadsheet_id, run).await {
                match result {
                    Ok(outcome) => outcomes.push(outcome),
                    Err(error) => return Err(CommitFailure { error, wrote }),
                }
            }
        }

        Ok(Dispatched {
            outcomes,
            upstream_calls,
            resolved_conflicts,
        })
    }

    /// Fetch the current state of every guarded range and apply each
    /// guard's strategy on divergence
    async fn recheck_guards(
        &self,
        id: TransactionId,
        spreadsheet_id: &str,
        operations: Vec<QueuedOp>,
        upstream_calls: &mut u64,
    ) -> Result<(Vec<BatchOp>, usize), CommitFailure> {
        let mut targets: Vec<RangeRef> = Vec::new();
        for queued in &operations {
            if queued.op.guard.is_some() && !targets.contains(queued.op.op.target()) {
                targets.push(queued.op.op.target().clone());
            }
        }
        if targets.is_empty() {
            return Ok((operations.into_iter().map(|q| q.op.op).collect(), 0));
        }

        let reads = targets
            .iter()
            .map(|range| BatchOp::Read {
                range: range.clone(),
            })
            .collect();
        *upstream_calls += 1;
        let mut remote: HashMap<String, Values> = HashMap::new();
        for (range, result) in targets
            .iter()
            .zip(self.batcher.dispatch_now(spreadsheet_id, reads).await)
        {
            match result {
                Ok(OpOutcome::Read(values)) => {
                    remote.insert(range.key(), values);
                }
                Ok(OpOutcome::Write(_)) => {}
                Err(error) => return Err(CommitFailure::before_writes(error)),
            }
        }

        let mut ops = Vec::with_capacity(operations.len());
        let mut resolved = 0;
        for queued in operations {
            let TxOperation { op, guard } = queued.op;
            let Some(guard) = guard else {
                ops.push(op);
                continue;
            };
            let range = op.target().clone();
            let values = remote.get(&range.key()).cloned().unwrap_or_default();

            let Some(report) =
                self.detector
                    .check_remote(spreadsheet_id, &range, &guard.expected, &values)
            else {
                ops.push(op);
                continue;
            };

            let Some(strategy) = guard.strategy else {
                return Err(CommitFailure::before_writes(EngineError::ConflictDetected(report)));
            };
            let local = LocalWrite {
                range: range.clone(),
                values: match &op {
                    BatchOp::Update { values, .. } => values.clone(),
                    _ => Values::new(),
                },
                base: self
                    .detector
                    .values_for(spreadsheet_id, &range, &guard.expected),
                issued_at: queued.queued_at,
            };
            let remote_state = RemoteState {
                values,
                fingerprint: report.current.clone(),
                modified_at: report.current.captured_at,
            };
            match resolve(&strategy, &local, &remote_state) {
                Resolution::Apply(replacement) => {
                    log::info!(
                        "{}: {} conflict on {} resolved by {}",
                        id,
                        report.severity,
                        range,
                        strategy.tag()
                    );
                    resolved += 1;
                    if matches!(op, BatchOp::Update { .. }) {
                        ops.extend(replacement);
                    } else {
                        ops.push(op);
                    }
                }
                Resolution::Abort { reason } => {
                    log::info!("{}: {} on {} aborted: {}", id, strategy.tag(), range, reason);
                    return Err(CommitFailure::before_writes(EngineError::ConflictDetected(
                        report,
                    )));
                }
            }
        }
        Ok((ops, resolved))
    }

    fn finish(&self, id: TransactionId, state: TransactionState) {
        let committed = state == TransactionState::Committed;
        if let Some(txn) = self.transactions.lock().get_mut(&id) {
            if txn.state.can_transition_to(&state) {
                txn.state = state;
                txn.finished_at = Some(Utc::now());
            } else {
                log::warn!("{}: ignoring transition {} -> {}", id, txn.state, state);
            }
        }
        self.locks.release(id);
        let mut stats = self.stats.lock();
        if committed {
            stats.committed += 1;
        } else {
            stats.failed += 1;
        }
    }
}

fn ensure_accepting(id: TransactionId, txn: &Transaction) -> EngineResult<()> {
    if txn.state.accepts_operations() {
        Ok(())
    } else {
        Err(EngineError::InvalidTransactionState {
            transaction_id: id,
            state: txn.state.clone(),
            expected: ACCEPTING,
        })
    }
}

/// Split ops into maximal runs of the same operation class, keeping order
fn class_runs(ops: Vec<BatchOp>) -> Vec<Vec<BatchOp>> {
    let mut runs: Vec<Vec<BatchOp>> = Vec::new();
    for op in ops {
        match runs.last_mut() {
            Some(run) if run[0].class() == op.class() => run.push(op),
            _ => runs.push(vec![op]),
        }
    }
    runs
}
