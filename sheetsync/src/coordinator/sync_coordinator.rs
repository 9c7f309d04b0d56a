// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Sync Coordinator - the engine context and caller-facing surface
//!
//! One `SyncCoordinator` owns every component: admission control, the read
//! cache, the conflict detector, the request batcher, the transaction manager
//! and the prefetch scheduler. Nothing is global; two coordinators over two
//! upstream clients never share state.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::batch::{BatchOp, BatchStats, OpOutcome, RequestBatcher, WriteOutcome};
use crate::cache::{CacheStats, ReadCache};
use crate::config::EngineConfig;
use crate::conflict::{
    resolve, ConflictCheck, ConflictDetector, ConflictReport, ConflictStrategy, Fingerprint,
    LocalWrite, RemoteState, Resolution, StrategyTag,
};
use crate::error::{EngineError, EngineResult};
use crate::prefetch::{PrefetchCandidate, PrefetchScheduler, PrefetchStats};
use crate::range::RangeRef;
use crate::throttle::{Admission, CircuitState, OperationClass};
use crate::txn::{
    CommitReport, IsolationLevel, TransactionId, TransactionManager, TransactionState,
    TransactionStatistics, TxOperation,
};
use crate::upstream::UpstreamClient;
use crate::values::Values;

/// Options for [`SyncCoordinator::write`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteOptions {
    /// Fingerprint of the contents the write was based on. Without one the
    /// write is applied blindly.
    pub expected_fingerprint: Option<Fingerprint>,
    /// How to settle a detected conflict; `None` surfaces it as an error
    pub conflict_strategy: Option<ConflictStrategy>,
    /// When the caller decided on the write, for last/first-write-wins
    pub issued_at: Option<DateTime<Utc>>,
}

impl WriteOptions {
    pub fn guarded(expected: Fingerprint) -> Self {
        Self {
            expected_fingerprint: Some(expected),
            ..Self::default()
        }
    }

    pub fn with_strategy(mut self, strategy: ConflictStrategy) -> Self {
        self.conflict_strategy = Some(strategy);
        self
    }

    pub fn issued_at(mut self, at: DateTime<Utc>) -> Self {
        self.issued_at = Some(at);
        self
    }
}

/// Result of a write
#[derive(Debug, Clone, PartialEq)]
pub struct WriteReport {
    pub range: RangeRef,
    pub updated_cells: u64,
    pub revision: Option<String>,
    /// False when a strategy kept the remote contents instead
    pub applied: bool,
    /// The conflict that was detected and settled, if any
    pub conflict: Option<Box<ConflictReport>>,
    pub resolved_by: Option<StrategyTag>,
}

impl WriteReport {
    fn from_outcome(outcome: WriteOutcome) -> Self {
        Self {
            range: outcome.range,
            updated_cells: outcome.updated_cells,
            revision: outcome.revision,
            applied: true,
            conflict: None,
            resolved_by: None,
        }
    }
}

/// Admission state of one operation class
#[derive(Debug, Clone, PartialEq)]
pub struct ClassThrottle {
    pub class: OperationClass,
    pub available_tokens: u32,
    pub circuit: CircuitState,
    pub consecutive_failures: u32,
}

/// Every component's counters in one place
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineStats {
    pub cache: CacheStats,
    pub batch: BatchStats,
    pub transactions: TransactionStatistics,
    pub prefetch: PrefetchStats,
}

pub struct SyncCoordinator {
    config: EngineConfig,
    admission: Arc<Admission>,
    cache: Arc<ReadCache>,
    detector: Arc<ConflictDetector>,
    batcher: RequestBatcher,
    transactions: TransactionManager,
    prefetch: Arc<PrefetchScheduler>,
    shutdown: CancellationToken,
    prefetch_task: Mutex<Option<JoinHandle<()>>>,
}

impl SyncCoordinator {
    /// Build an engine over `upstream`
    ///
    /// # Example
    /// ```no_run
    /// use sheetsync::{EngineConfig, MemoryUpstream, SyncCoordinator};
    /// use std::sync::Arc;
    ///
    /// # async fn demo() -> sheetsync::EngineResult<()> {
    /// let upstream = Arc::new(MemoryUpstream::new().with_spreadsheet("sheet-1"));
    /// let coordinator = SyncCoordinator::new(EngineConfig::default(), upstream)?;
    /// let values = coordinator.read("sheet-1", "Sheet1!A1:B10").await?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn new(config: EngineConfig, upstream: Arc<dyn UpstreamClient>) -> EngineResult<Arc<Self>> {
        config.validate()?;

        let admission = Arc::new(Admission::from_config(&config));
        let cache = Arc::new(ReadCache::new(config.cache_ttl(), config.cache_max_entries));
        let detector = Arc::new(ConflictDetector::new(config.conflict.clone()));
        let batcher = RequestBatcher::new(
            &config,
            Arc::clone(&upstream),
            Arc::clone(&admission),
            Arc::clone(&cache),
            Arc::clone(&detector),
        );
        let transactions = TransactionManager::new(
            &config,
            Arc::clone(&upstream),
            Arc::clone(&admission),
            batcher.clone(),
            Arc::clone(&cache),
            Arc::clone(&detector),
        );
        let prefetch = Arc::new(PrefetchScheduler::new(
            &config,
            upstream,
            Arc::clone(&admission),
            Arc::clone(&cache),
            Arc::clone(&detector),
        ));

        log::info!(
            "Sync engine ready: {} reads/min, {} writes/min, cache ttl {:?}, window {}..{} ms",
            config.reads_per_minute,
            config.writes_per_minute,
            config.cache_ttl(),
            config.min_batch_window_ms,
            config.max_batch_window_ms
        );

        Ok(Arc::new(Self {
            config,
            admission,
            cache,
            detector,
            batcher,
            transactions,
            prefetch,
            shutdown: CancellationToken::new(),
            prefetch_task: Mutex::new(None),
        }))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn ensure_running(&self) -> EngineResult<()> {
        if self.shutdown.is_cancelled() {
            Err(EngineError::ShutDown)
        } else {
            Ok(())
        }
    }

    /// Read a range, from cache when fresh
    pub async fn read(&self, spreadsheet_id: &str, range: &str) -> EngineResult<Values> {
        self.ensure_running()?;
        let range = RangeRef::parse(range)?;
        self.prefetch.record_access(spreadsheet_id, &range);

        if let Some(entry) = self.cache.get(spreadsheet_id, &range) {
            return Ok(entry.values);
        }
        let outcome = self
            .batcher
            .submit(spreadsheet_id, BatchOp::Read { range: range.clone() })
            .await?;
        Ok(outcome.into_values().unwrap_or_default())
    }

    /// Read a range, giving up on the wait when `cancel` fires
    pub async fn read_with_cancel(
        &self,
        spreadsheet_id: &str,
        range: &str,
        cancel: &CancellationToken,
    ) -> EngineResult<Values> {
        self.ensure_running()?;
        let range = RangeRef::parse(range)?;
        self.prefetch.record_access(spreadsheet_id, &range);

        if let Some(entry) = self.cache.get(spreadsheet_id, &range) {
            return Ok(entry.values);
        }
        let outcome = self
            .batcher
            .submit_with_cancel(spreadsheet_id, BatchOp::Read { range }, cancel)
            .await?;
        Ok(outcome.into_values().unwrap_or_default())
    }

    /// Latest observed fingerprint of a range, for a later guarded write
    pub fn fingerprint(&self, spreadsheet_id: &str, range: &str) -> EngineResult<Option<Fingerprint>> {
        let range = RangeRef::parse(range)?;
        Ok(self.detector.current(spreadsheet_id, &range))
    }

    /// Compare `expected` with the last version this engine observed,
    /// without an upstream call
    pub fn check_conflict(
        &self,
        spreadsheet_id: &str,
        range: &str,
        expected: &Fingerprint,
    ) -> EngineResult<ConflictCheck> {
        let range = RangeRef::parse(range)?;
        Ok(self.detector.check_conflict(spreadsheet_id, &range, expected))
    }

    /// Write values to a range
    ///
    /// With an expected fingerprint the current upstream contents are fetched
    /// and compared first. A divergence is settled by the supplied strategy
    /// or surfaced as `ConflictDetected`.
    pub async fn write(
        &self,
        spreadsheet_id: &str,
        range: &str,
        values: Values,
        options: WriteOptions,
    ) -> EngineResult<WriteReport> {
        self.ensure_running()?;
        let range = RangeRef::parse(range)?;
        match options.expected_fingerprint.clone() {
            None => {
                self.submit_write(spreadsheet_id, BatchOp::Update { range, values })
                    .await
            }
            Some(expected) => {
                self.guarded_write(spreadsheet_id, range, values, expected, options)
                    .await
            }
        }
    }

    async fn guarded_write(
        &self,
        spreadsheet_id: &str,
        range: RangeRef,
        values: Values,
        expected: Fingerprint,
        options: WriteOptions,
    ) -> EngineResult<WriteReport> {
        let remote = self
            .batcher
            .dispatch_now(spreadsheet_id, vec![BatchOp::Read { range: range.clone() }])
            .await
            .into_iter()
            .next()
            .unwrap_or(Err(EngineError::ShutDown))?
            .into_values()
            .unwrap_or_default();

        let Some(report) = self
            .detector
            .check_remote(spreadsheet_id, &range, &expected, &remote)
        else {
            return self
                .submit_write(spreadsheet_id, BatchOp::Update { range, values })
                .await;
        };

        let Some(strategy) = options.conflict_strategy else {
            log::info!(
                "Write to {} rejected: {} conflict, {} cell(s) changed upstream",
                report.location(),
                report.severity,
                report.changed_cells
            );
            return Err(EngineError::ConflictDetected(report));
        };

        let local = LocalWrite {
            range: range.clone(),
            values,
            base: self.detector.values_for(spreadsheet_id, &range, &expected),
            issued_at: options.issued_at.unwrap_or_else(Utc::now),
        };
        let remote_state = RemoteState {
            values: remote,
            fingerprint: report.current.clone(),
            modified_at: report.current.captured_at,
        };

        match resolve(&strategy, &local, &remote_state) {
            Resolution::Apply(ops) => {
                log::info!(
                    "{} conflict on {} resolved by {} ({} op(s))",
                    report.severity,
                    report.location(),
                    strategy.tag(),
                    ops.len()
                );
                let mut tickets = Vec::with_capacity(ops.len());
                for op in ops {
                    tickets.push(self.batcher.enqueue(spreadsheet_id, op)?);
                }
                let mut resolved = WriteReport {
                    range,
                    updated_cells: 0,
                    revision: None,
                    applied: true,
                    conflict: Some(report),
                    resolved_by: Some(strategy.tag()),
                };
                for ticket in tickets {
                    let op_id = ticket.id();
                    let outcome = write_outcome(spreadsheet_id, op_id, ticket.wait().await?)?;
                    resolved.updated_cells += outcome.updated_cells;
                    resolved.revision = outcome.revision.or(resolved.revision);
                }
                Ok(resolved)
            }
            Resolution::Abort { reason } if strategy == ConflictStrategy::Cancel => {
                log::info!("Write to {} cancelled: {}", report.location(), reason);
                Err(EngineError::ConflictDetected(report))
            }
            Resolution::Abort { reason } => {
                log::info!(
                    "Write to {} dropped by {}: {}",
                    report.location(),
                    strategy.tag(),
                    reason
                );
                Ok(WriteReport {
                    range,
                    updated_cells: 0,
                    revision: None,
                    applied: false,
                    conflict: Some(report),
                    resolved_by: Some(strategy.tag()),
                })
            }
        }
    }

    /// Append rows after the last non-empty row of `range`
    pub async fn append(&self, spreadsheet_id: &str, range: &str, rows: Values) -> EngineResult<WriteReport> {
        self.ensure_running()?;
        let range = RangeRef::parse(range)?;
        self.submit_write(spreadsheet_id, BatchOp::Append { range, rows })
            .await
    }

    pub async fn clear(&self, spreadsheet_id: &str, range: &str) -> EngineResult<WriteReport> {
        self.ensure_running()?;
        let range = RangeRef::parse(range)?;
        self.submit_write(spreadsheet_id, BatchOp::Clear { range }).await
    }

    /// Apply an opaque formatting payload to `range`
    pub async fn format(
        &self,
        spreadsheet_id: &str,
        range: &str,
        format: serde_json::Value,
    ) -> EngineResult<WriteReport> {
        self.ensure_running()?;
        let range = RangeRef::parse(range)?;
        self.submit_write(spreadsheet_id, BatchOp::Format { range, format })
            .await
    }

    pub async fn copy_range(
        &self,
        spreadsheet_id: &str,
        source: &str,
        destination: &str,
    ) -> EngineResult<WriteReport> {
        self.ensure_running()?;
        let source = RangeRef::parse(source)?;
        let destination = RangeRef::parse(destination)?;
        self.submit_write(
            spreadsheet_id,
            BatchOp::CopyRange {
                source,
                destination,
            },
        )
        .await
    }

    async fn submit_write(&self, spreadsheet_id: &str, op: BatchOp) -> EngineResult<WriteReport> {
        let ticket = self.batcher.enqueue(spreadsheet_id, op)?;
        let op_id = ticket.id();
        let outcome = ticket.wait().await?;
        write_outcome(spreadsheet_id, op_id, outcome).map(WriteReport::from_outcome)
    }

    /// Mark a range as protected; conflicts touching it are at least High severity
    pub fn protect_range(&self, spreadsheet_id: &str, range: &str) -> EngineResult<()> {
        let range = RangeRef::parse(range)?;
        self.detector.protect_range(spreadsheet_id, range);
        Ok(())
    }

    /// Drop everything known about a spreadsheet after an out-of-band change
    pub fn invalidate_spreadsheet(&self, spreadsheet_id: &str) -> usize {
        let dropped = self.cache.invalidate_spreadsheet(spreadsheet_id);
        self.detector.forget_spreadsheet(spreadsheet_id);
        self.prefetch.forget_spreadsheet(spreadsheet_id);
        dropped
    }

    pub fn begin_transaction(
        &self,
        spreadsheet_id: &str,
        isolation: IsolationLevel,
    ) -> EngineResult<TransactionId> {
        self.ensure_running()?;
        self.transactions.begin(spreadsheet_id, isolation)
    }

    pub async fn add_operation(
        &self,
        id: TransactionId,
        op: impl Into<TxOperation>,
    ) -> EngineResult<()> {
        self.ensure_running()?;
        self.transactions.add_operation(id, op.into()).await
    }

    pub async fn add_operation_with_cancel(
        &self,
        id: TransactionId,
        op: impl Into<TxOperation>,
        cancel: &CancellationToken,
    ) -> EngineResult<()> {
        self.ensure_running()?;
        self.transactions
            .add_operation_with_cancel(id, op.into(), Some(cancel))
            .await
    }

    pub async fn commit(&self, id: TransactionId) -> EngineResult<CommitReport> {
        self.ensure_running()?;
        self.transactions.commit(id).await
    }

    pub async fn commit_with_cancel(
        &self,
        id: TransactionId,
        cancel: &CancellationToken,
    ) -> EngineResult<CommitReport> {
        self.ensure_running()?;
        self.transactions.commit_with_cancel(id, Some(cancel)).await
    }

    pub fn rollback(&self, id: TransactionId) -> EngineResult<()> {
        self.transactions.rollback(id)
    }

    pub fn transaction_status(&self, id: TransactionId) -> EngineResult<TransactionState> {
        self.transactions.status(id)
    }

    /// Forget finished transactions
    pub fn cleanup_transactions(&self) -> usize {
        self.transactions.cleanup_completed()
    }

    /// Start the background prefetch loop. Returns false when prefetching is
    /// disabled or already running.
    pub fn start_prefetch(&self) -> bool {
        if !self.prefetch.is_enabled() || self.shutdown.is_cancelled() {
            return false;
        }
        let mut task = self.prefetch_task.lock();
        if task.is_some() {
            return false;
        }
        let period = std::time::Duration::from_millis(self.config.prefetch.interval_ms);
        *task = Some(
            Arc::clone(&self.prefetch).spawn(period, self.shutdown.child_token()),
        );
        true
    }

    /// Run one prefetch cycle now
    pub async fn prefetch_tick(&self) -> usize {
        if self.shutdown.is_cancelled() {
            return 0;
        }
        self.prefetch.tick().await
    }

    /// What the next prefetch cycle would fetch, best first
    pub fn prefetch_candidates(&self) -> Vec<PrefetchCandidate> {
        self.prefetch.candidates()
    }

    /// Stop background work, fail queued ops, roll back open transactions
    /// and drop the cache
    pub async fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        self.batcher.shutdown();
        let aborted = self.transactions.abort_open();
        let task = self.prefetch_task.lock().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                log::warn!("Prefetch task ended abnormally: {}", err);
            }
        }
        self.cache.clear();
        log::info!(
            "Sync engine shut down ({} open transaction(s) rolled back)",
            aborted
        );
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Ranges of a spreadsheet currently served from the cache
    pub fn cached_ranges(&self, spreadsheet_id: &str) -> Vec<RangeRef> {
        self.cache.tracked_ranges(spreadsheet_id)
    }

    pub fn batch_stats(&self) -> BatchStats {
        self.batcher.stats()
    }

    pub fn transaction_statistics(&self) -> TransactionStatistics {
        self.transactions.statistics()
    }

    pub fn prefetch_stats(&self) -> PrefetchStats {
        self.prefetch.stats()
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            cache: self.cache_stats(),
            batch: self.batch_stats(),
            transactions: self.transaction_statistics(),
            prefetch: self.prefetch_stats(),
        }
    }

    /// Tokens and circuit state per operation class
    pub fn throttle_snapshot(&self) -> Vec<ClassThrottle> {
        [
            OperationClass::Read,
            OperationClass::Write,
            OperationClass::Prefetch,
        ]
        .into_iter()
        .map(|class| ClassThrottle {
            class,
            available_tokens: self.admission.limiter().available(class),
            circuit: self.admission.breaker().state(class),
            consecutive_failures: self.admission.breaker().consecutive_failures(class),
        })
        .collect()
    }

    /// Current adaptive batch window for a spreadsheet and class
    pub fn batch_window(&self, spreadsheet_id: &str, class: OperationClass) -> std::time::Duration {
        self.batcher.current_window(spreadsheet_id, class)
    }
}

fn write_outcome(spreadsheet_id: &str, op_id: u64, outcome: OpOutcome) -> EngineResult<WriteOutcome> {
    match outcome {
        OpOutcome::Write(outcome) => Ok(outcome),
        OpOutcome::Read(_) => Err(EngineError::BatchPartialFailure {
            spreadsheet_id: spreadsheet_id.to_string(),
            range: String::new(),
            op_id,
            message: "write produced a read result".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::MemoryUpstream;
    use crate::values::grid;
    use std::time::Duration;

    fn engine() -> (Arc<MemoryUpstream>, Arc<SyncCoordinator>) {
        let upstream = Arc::new(MemoryUpstream::new().with_spreadsheet("s1"));
        let coordinator = SyncCoordinator::new(EngineConfig::default(), upstream.clone()).unwrap();
        (upstream, coordinator)
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_is_served_from_cache() {
        let (upstream, engine) = engine();
        upstream
            .set_values("s1", "Sheet1!A1:B2", grid(vec![vec!["a", "b"], vec!["c", "d"]]))
            .unwrap();

        let first = engine.read("s1", "Sheet1!A1:B2").await.unwrap();
        let second = engine.read("s1", "Sheet1!A1:B2").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(upstream.fetch_calls(), 1);
        assert_eq!(engine.cache_stats().hits, 1);
        assert!(engine.fingerprint("s1", "Sheet1!A1:B2").unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_guarded_write_with_matching_fingerprint() {
        let (upstream, engine) = engine();
        upstream.set_values("s1", "Sheet1!A1", grid(vec![vec!["1"]])).unwrap();
        engine.read("s1", "Sheet1!A1").await.unwrap();
        let fingerprint = engine.fingerprint("s1", "Sheet1!A1").unwrap().unwrap();

        let report = engine
            .write("s1", "Sheet1!A1", grid(vec![vec!["2"]]), WriteOptions::guarded(fingerprint))
            .await
            .unwrap();
        assert!(report.applied);
        assert!(report.conflict.is_none());
        assert_eq!(upstream.values("s1", "Sheet1!A1").unwrap(), grid(vec![vec!["2"]]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_guarded_write_surfaces_conflict() {
        let (upstream, engine) = engine();
        upstream.set_values("s1", "Sheet1!A1", grid(vec![vec!["1"]])).unwrap();
        engine.read("s1", "Sheet1!A1").await.unwrap();
        let fingerprint = engine.fingerprint("s1", "Sheet1!A1").unwrap().unwrap();

        // Someone else edits the cell
        upstream.set_values("s1", "Sheet1!A1", grid(vec![vec!["remote"]])).unwrap();

        let err = engine
            .write(
                "s1",
                "Sheet1!A1",
                grid(vec![vec!["local"]]),
                WriteOptions::guarded(fingerprint.clone()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ConflictDetected(ref r) if r.changed_cells == 1));
        assert_eq!(upstream.values("s1", "Sheet1!A1").unwrap(), grid(vec![vec!["remote"]]));

        let report = engine
            .write(
                "s1",
                "Sheet1!A1",
                grid(vec![vec!["local"]]),
                WriteOptions::guarded(fingerprint).with_strategy(ConflictStrategy::Overwrite),
            )
            .await
            .unwrap();
        assert!(report.applied);
        assert_eq!(report.resolved_by, Some(StrategyTag::Overwrite));
        assert_eq!(upstream.values("s1", "Sheet1!A1").unwrap(), grid(vec![vec!["local"]]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_refuses_new_work() {
        let (_upstream, engine) = engine();
        engine.read("s1", "Sheet1!A1:B2").await.unwrap();
        assert_eq!(engine.cached_ranges("s1"), vec![RangeRef::parse("Sheet1!A1:B2").unwrap()]);
        let txn = engine
            .begin_transaction("s1", IsolationLevel::ReadCommitted)
            .unwrap();
        assert!(engine.start_prefetch());
        assert!(!engine.start_prefetch());

        engine.shutdown().await;
        assert!(engine.is_shut_down());
        assert!(engine.cached_ranges("s1").is_empty());
        assert_eq!(engine.cache_stats().entries, 0);
        assert_eq!(engine.transaction_status(txn).unwrap(), TransactionState::RolledBack);
        assert!(matches!(
            engine.read("s1", "Sheet1!A1").await,
            Err(EngineError::ShutDown)
        ));
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
