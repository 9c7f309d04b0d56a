// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Request batcher
//!
//! Ops for the same (spreadsheet, class) submitted within one window are
//! planned into as few upstream calls as possible. A window closes when its
//! timer fires or it reaches the maximum batch size; the window length then
//! adapts to how many ops it collected.
//!
//! Every upstream call passes through [`Admission`] and is retried on
//! transient errors. Successful writes invalidate overlapping cached reads
//! and stale conflict fingerprints; successful reads fill the cache and
//! record fingerprints.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::merge::{plan_reads, plan_writes, BatchOp};
use super::window::{AdaptiveWindow, WindowBounds};
use crate::cache::ReadCache;
use crate::config::EngineConfig;
use crate::conflict::ConflictDetector;
use crate::error::{EngineError, EngineResult, UpstreamError};
use crate::range::RangeRef;
use crate::throttle::{Admission, OperationClass};
use crate::upstream::retry::RetryPolicy;
use crate::upstream::{ApplyReply, UpstreamClient};
use crate::values::{self, Values};

/// Result of a successful write op
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteOutcome {
    /// Range actually written; for appends, where the rows landed
    pub range: RangeRef,
    pub updated_cells: u64,
    pub revision: Option<String>,
}

/// Result of one op
#[derive(Debug, Clone, PartialEq)]
pub enum OpOutcome {
    Read(Values),
    Write(WriteOutcome),
}

impl OpOutcome {
    pub fn into_values(self) -> Option<Values> {
        match self {
            OpOutcome::Read(values) => Some(values),
            OpOutcome::Write(_) => None,
        }
    }

    pub fn into_write(self) -> Option<WriteOutcome> {
        match self {
            OpOutcome::Write(outcome) => Some(outcome),
            OpOutcome::Read(_) => None,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchStats {
    pub ops_submitted: u64,
    pub ops_dispatched: u64,
    pub ops_cancelled: u64,
    pub ops_failed: u64,
    pub windows_flushed: u64,
    /// Upstream calls made, one per batch_fetch/fetch/apply
    pub upstream_calls: u64,
    /// Sub-requests sent inside apply calls
    pub requests_sent: u64,
}

type WindowKey = (String, OperationClass);

struct PendingOp {
    id: u64,
    op: BatchOp,
    reply: oneshot::Sender<EngineResult<OpOutcome>>,
}

struct OpenWindow {
    generation: u64,
    opened_at: Instant,
    ops: Vec<PendingOp>,
}

#[derive(Default)]
struct BatcherState {
    windows: HashMap<WindowKey, OpenWindow>,
    adaptive: HashMap<WindowKey, AdaptiveWindow>,
    next_generation: u64,
    closed: bool,
}

struct BatcherShared {
    bounds: WindowBounds,
    max_batch_size: usize,
    upstream: Arc<dyn UpstreamClient>,
    admission: Arc<Admission>,
    cache: Arc<ReadCache>,
    detector: Arc<ConflictDetector>,
    retry: RetryPolicy,
    state: Mutex<BatcherState>,
    stats: Mutex<BatchStats>,
    next_op_id: AtomicU64,
    shutdown: CancellationToken,
}

/// Handle to one enqueued op
pub struct BatchTicket {
    id: u64,
    key: WindowKey,
    rx: oneshot::Receiver<EngineResult<OpOutcome>>,
    shared: Arc<BatcherShared>,
}

impl BatchTicket {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the op's result
    pub async fn wait(self) -> EngineResult<OpOutcome> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(EngineError::ShutDown),
        }
    }

    /// Remove the op from its window if it has not been dispatched yet.
    /// Returns false once the op is in flight; its upstream effects then stand.
    pub fn cancel(&self) -> bool {
        self.shared.cancel_queued(&self.key, self.id)
    }

    /// Wait for the result, giving up when `token` fires
    pub async fn wait_or_cancel(mut self, token: &CancellationToken) -> EngineResult<OpOutcome> {
        tokio::select! {
            result = &mut self.rx => return result.unwrap_or(Err(EngineError::ShutDown)),
            _ = token.cancelled() => {}
        }
        if !self.cancel() {
            log::debug!("Op {} already dispatched; discarding its result", self.id);
        }
        Err(EngineError::Cancelled {
            operation: format!("op {}", self.id),
        })
    }
}

/// Coalesces ops into windowed upstream calls
#[derive(Clone)]
pub struct RequestBatcher {
    shared: Arc<BatcherShared>,
}

impl RequestBatcher {
    pub fn new(
        config: &EngineConfig,
        upstream: Arc<dyn UpstreamClient>,
        admission: Arc<Admission>,
        cache: Arc<ReadCache>,
        detector: Arc<ConflictDetector>,
    ) -> Self {
        Self {
            shared: Arc::new(BatcherShared {
                bounds: WindowBounds::from_config(config),
                max_batch_size: config.max_batch_size.max(1),
                upstream,
                admission,
                cache,
                detector,
                retry: RetryPolicy::from_config(&config.retry),
                state: Mutex::new(BatcherState::default()),
                stats: Mutex::new(BatchStats::default()),
                next_op_id: AtomicU64::new(1),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Queue an op into the current window for its spreadsheet and class
    pub fn enqueue(&self, spreadsheet_id: &str, op: BatchOp) -> EngineResult<BatchTicket> {
        let shared = &self.shared;
        let key: WindowKey = (spreadsheet_id.to_string(), op.class());
        let id = shared.next_op_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        let pending = PendingOp { id, op, reply: tx };

        let mut guard = shared.state.lock();
        let state: &mut BatcherState = &mut guard;
        if state.closed {
            return Err(EngineError::ShutDown);
        }
        shared.stats.lock().ops_submitted += 1;

        let full = if let Some(window) = state.windows.get_mut(&key) {
            window.ops.push(pending);
            window.ops.len() >= shared.max_batch_size
        } else {
            let bounds = shared.bounds;
            let duration = state
                .adaptive
                .entry(key.clone())
                .or_insert_with(|| AdaptiveWindow::new(&bounds))
                .current();
            state.next_generation += 1;
            let generation = state.next_generation;
            state.windows.insert(
                key.clone(),
                OpenWindow {
                    generation,
                    opened_at: Instant::now(),
                    ops: vec![pending],
                },
            );
            log::debug!("Opened {} window for {} ({:?})", key.1, key.0, duration);

            let timer_shared = Arc::clone(shared);
            let timer_key = key.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = timer_shared.shutdown.cancelled() => {}
                    _ = tokio::time::sleep(duration) => {
                        if let Some(ops) = timer_shared.close_window(&timer_key, Some(generation)) {
                            timer_shared.dispatch_window(&timer_key.0, ops).await;
                        }
                    }
                }
            });
            shared.max_batch_size <= 1
        };

        if full {
            if let Some(ops) = shared.close_window_locked(state, &key, None) {
                drop(guard);
                let flush_shared = Arc::clone(shared);
                let flush_sid = key.0.clone();
                tokio::spawn(async move {
                    flush_shared.dispatch_window(&flush_sid, ops).await;
                });
            }
        }

        Ok(BatchTicket {
            id,
            key,
            rx,
            shared: Arc::clone(shared),
        })
    }

    /// Queue an op and wait for its result
    pub async fn submit(&self, spreadsheet_id: &str, op: BatchOp) -> EngineResult<OpOutcome> {
        self.enqueue(spreadsheet_id, op)?.wait().await
    }

    /// Queue an op and wait for its result unless `token` fires first
    pub async fn submit_with_cancel(
        &self,
        spreadsheet_id: &str,
        op: BatchOp,
        token: &CancellationToken,
    ) -> EngineResult<OpOutcome> {
        if token.is_cancelled() {
            return Err(EngineError::Cancelled {
                operation: format!("{} on {}", op.kind(), spreadsheet_id),
            });
        }
        self.enqueue(spreadsheet_id, op)?.wait_or_cancel(token).await
    }

    /// Run ops right away, bypassing the window. Same-class runs are planned
    /// and dispatched in order; results come back in op order.
    pub async fn dispatch_now(
        &self,
        spreadsheet_id: &str,
        ops: Vec<BatchOp>,
    ) -> Vec<EngineResult<OpOutcome>> {
        if self.shared.state.lock().closed {
            return ops.iter().map(|_| Err(EngineError::ShutDown)).collect();
        }
        let ids: Vec<u64> = ops
            .iter()
            .map(|_| self.shared.next_op_id.fetch_add(1, Ordering::SeqCst))
            .collect();
        {
            let mut stats = self.shared.stats.lock();
            stats.ops_submitted += ops.len() as u64;
        }
        self.shared.execute(spreadsheet_id, &ops, &ids).await
    }

    /// Current adaptive window length for a (spreadsheet, class) pair
    pub fn current_window(&self, spreadsheet_id: &str, class: OperationClass) -> Duration {
        let state = self.shared.state.lock();
        state
            .adaptive
            .get(&(spreadsheet_id.to_string(), class))
            .map(AdaptiveWindow::current)
            .unwrap_or_else(|| AdaptiveWindow::new(&self.shared.bounds).current())
    }

    /// Ops waiting in open windows
    #[cfg(test)]
    pub fn pending_ops(&self) -> usize {
        self.shared
            .state
            .lock()
            .windows
            .values()
            .map(|w| w.ops.len())
            .sum()
    }

    pub fn stats(&self) -> BatchStats {
        self.shared.stats.lock().clone()
    }

    /// Fail every queued op and refuse new ones
    pub fn shutdown(&self) {
        let drained: Vec<PendingOp> = {
            let mut state = self.shared.state.lock();
            state.closed = true;
            state
                .windows
                .drain()
                .flat_map(|(_, window)| window.ops)
                .collect()
        };
        self.shared.shutdown.cancel();
        if !drained.is_empty() {
            log::info!("Batcher shut down with {} queued op(s)", drained.len());
        }
        for pending in drained {
            let _ = pending.reply.send(Err(EngineError::ShutDown));
        }
    }
}

impl BatcherShared {
    fn close_window(&self, key: &WindowKey, generation: Option<u64>) -> Option<Vec<PendingOp>> {
        let mut state = self.state.lock();
        self.close_window_locked(&mut state, key, generation)
    }

    /// Take a window out of the table and adapt its key's window length.
    /// With `generation` set, only that window is closed.
    fn close_window_locked(
        &self,
        state: &mut BatcherState,
        key: &WindowKey,
        generation: Option<u64>,
    ) -> Option<Vec<PendingOp>> {
        let matches = state
            .windows
            .get(key)
            .is_some_and(|w| generation.map_or(true, |g| w.generation == g));
        if !matches {
            return None;
        }
        let window = state.windows.remove(key)?;
        let collected = window.ops.len();
        let bounds = self.bounds;
        let next = state
            .adaptive
            .entry(key.clone())
            .or_insert_with(|| AdaptiveWindow::new(&bounds))
            .observe(collected);
        log::debug!(
            "Flushing {} window for {}: {} op(s) after {:?}, next window {:?}",
            key.1,
            key.0,
            collected,
            window.opened_at.elapsed(),
            next
        );
        Some(window.ops)
    }

    fn cancel_queued(&self, key: &WindowKey, id: u64) -> bool {
        let removed = {
            let mut state = self.state.lock();
            let Some(window) = state.windows.get_mut(key) else {
                return false;
            };
            let Some(index) = window.ops.iter().position(|p| p.id == id) else {
                return false;
            };
            let removed = window.ops.remove(index);
            if window.ops.is_empty() {
                state.windows.remove(key);
            }
            removed
        };
        self.stats.lock().ops_cancelled += 1;
        log::debug!("Cancelled queued op {} on {}", id, key.0);
        let _ = removed.reply.send(Err(EngineError::Cancelled {
            operation: format!("op {}", id),
        }));
        true
    }

    async fn dispatch_window(&self, spreadsheet_id: &str, pending: Vec<PendingOp>) {
        if pending.is_empty() {
            return;
        }
        self.stats.lock().windows_flushed += 1;

        let mut ops = Vec::with_capacity(pending.len());
        let mut ids = Vec::with_capacity(pending.len());
        let mut replies = Vec::with_capacity(pending.len());
        for p in pending {
            ops.push(p.op);
            ids.push(p.id);
            replies.push(p.reply);
        }

        let results = self.execute(spreadsheet_id, &ops, &ids).await;
        for ((reply, id), result) in replies.into_iter().zip(ids).zip(results) {
            if reply.send(result).is_err() {
                log::debug!("Result of op {} dropped: caller went away", id);
            }
        }
    }

    /// Run ops in order, one upstream call per same-class run
    async fn execute(
        &self,
        spreadsheet_id: &str,
        ops: &[BatchOp],
        ids: &[u64],
    ) -> Vec<EngineResult<OpOutcome>> {
        let mut results = Vec::with_capacity(ops.len());
        let mut start = 0;
        while start < ops.len() {
            let class = ops[start].class();
            let end = ops[start..]
                .iter()
                .position(|op| op.class() != class)
                .map_or(ops.len(), |offset| start + offset);

            let run = &ops[start..end];
            let run_ids = &ids[start..end];
            let run_results = match class {
                OperationClass::Write => self.execute_writes(spreadsheet_id, run, run_ids).await,
                _ => self.execute_reads(spreadsheet_id, run, run_ids).await,
            };
            results.extend(run_results);
            start = end;
        }

        let failed = results.iter().filter(|r| r.is_err()).count() as u64;
        let mut stats = self.stats.lock();
        stats.ops_dispatched += ops.len() as u64;
        stats.ops_failed += failed;
        results
    }

    async fn execute_writes(
        &self,
        spreadsheet_id: &str,
        ops: &[BatchOp],
        ids: &[u64],
    ) -> Vec<EngineResult<OpOutcome>> {
        let planned = plan_writes(ops);
        let requests: Vec<_> = planned.iter().map(|p| p.request.clone()).collect();

        let permit = match self.admission.admit(OperationClass::Write, None).await {
            Ok(permit) => permit,
            Err(err) => return ops.iter().map(|_| Err(err.clone())).collect(),
        };

        let upstream = &self.upstream;
        let request_slice = requests.as_slice();
        let result = self
            .retry
            .run("apply", move || upstream.apply(spreadsheet_id, request_slice))
            .await;
        self.admission
            .complete(permit, !matches!(&result, Err(err) if err.is_transient()));
        {
            let mut stats = self.stats.lock();
            stats.upstream_calls += 1;
            stats.requests_sent += requests.len() as u64;
        }

        let outcomes = match result {
            Ok(outcomes) => outcomes,
            Err(err) => {
                log::warn!(
                    "apply of {} request(s) to {} failed: {}",
                    requests.len(),
                    spreadsheet_id,
                    err
                );
                let err = EngineError::upstream(spreadsheet_id, "apply", err);
                return ops.iter().map(|_| Err(err.clone())).collect();
            }
        };

        let mut results: Vec<Option<EngineResult<OpOutcome>>> = vec![None; ops.len()];
        for (index, plan) in planned.iter().enumerate() {
            let outcome = outcomes.get(index).cloned().unwrap_or_else(|| {
                Err(UpstreamError::Rejected("no result returned for request".to_string()))
            });
            match outcome {
                Ok(reply) => {
                    let mut appended_rows = 0u32;
                    for &member in &plan.members {
                        let op = &ops[member];
                        let outcome = self.write_outcome(op, &reply, plan.members.len(), &mut appended_rows);
                        if let Some(written) = op.written_range() {
                            let invalidated = self.cache.invalidate_write(spreadsheet_id, &written);
                            self.detector.mark_stale(spreadsheet_id, &written);
                            if !invalidated.is_empty() {
                                log::debug!(
                                    "Write to {}/{} invalidated {} cached range(s)",
                                    spreadsheet_id,
                                    written,
                                    invalidated.len()
                                );
                            }
                        }
                        results[member] = Some(Ok(OpOutcome::Write(outcome)));
                    }
                }
                Err(err) => {
                    for &member in &plan.members {
                        let op = &ops[member];
                        log::warn!(
                            "Op {} ({} {}) on {} failed: {}",
                            ids[member],
                            op.kind(),
                            op.target(),
                            spreadsheet_id,
                            err
                        );
                        results[member] = Some(Err(EngineError::BatchPartialFailure {
                            spreadsheet_id: spreadsheet_id.to_string(),
                            range: op.target().to_string(),
                            op_id: ids[member],
                            message: err.to_string(),
                        }));
                    }
                }
            }
        }

        results
            .into_iter()
            .zip(ops)
            .map(|(result, op)| {
                result.unwrap_or_else(|| {
                    Err(EngineError::BatchPartialFailure {
                        spreadsheet_id: spreadsheet_id.to_string(),
                        range: op.target().to_string(),
                        op_id: 0,
                        message: format!("{} was not planned", op.kind()),
                    })
                })
            })
            .collect()
    }

    /// Per-op view of a reply that may cover several merged ops
    fn write_outcome(
        &self,
        op: &BatchOp,
        reply: &ApplyReply,
        members: usize,
        appended_rows: &mut u32,
    ) -> WriteOutcome {
        let (range, updated_cells) = match op {
            BatchOp::Update { range, values } => (range.clone(), cell_total(values)),
            BatchOp::Append { range, rows } => {
                let landed = reply.updated_ranges.first().cloned().unwrap_or_else(|| range.clone());
                let slice = landed.slice_rows(*appended_rows, rows.len() as u32);
                *appended_rows += rows.len() as u32;
                (slice, cell_total(rows))
            }
            other if members == 1 => (other.target().clone(), reply.updated_cells),
            other => (other.target().clone(), other.target().cell_count().unwrap_or(0)),
        };
        WriteOutcome {
            range,
            updated_cells,
            revision: reply.revision.clone(),
        }
    }

    async fn execute_reads(
        &self,
        spreadsheet_id: &str,
        ops: &[BatchOp],
        ids: &[u64],
    ) -> Vec<EngineResult<OpOutcome>> {
        let (ranges, mapping) = plan_reads(ops);
        let epoch = self.cache.epoch(spreadsheet_id);

        let permit = match self.admission.admit(OperationClass::Read, None).await {
            Ok(permit) => permit,
            Err(err) => return ops.iter().map(|_| Err(err.clone())).collect(),
        };

        let upstream = &self.upstream;
        let range_slice = ranges.as_slice();
        let result = if let [single] = range_slice {
            self.retry
                .run("fetch", move || async move {
                    upstream
                        .fetch(spreadsheet_id, single)
                        .await
                        .map(|values| vec![Ok(values)])
                })
                .await
        } else {
            self.retry
                .run("batch_fetch", move || upstream.batch_fetch(spreadsheet_id, range_slice))
                .await
        };
        self.admission
            .complete(permit, !matches!(&result, Err(err) if err.is_transient()));
        self.stats.lock().upstream_calls += 1;

        let fetched = match result {
            Ok(fetched) => fetched,
            Err(err) => {
                log::warn!(
                    "Fetch of {} range(s) from {} failed: {}",
                    ranges.len(),
                    spreadsheet_id,
                    err
                );
                let err = EngineError::upstream(spreadsheet_id, "fetch", err);
                return ops.iter().map(|_| Err(err.clone())).collect();
            }
        };

        for (range, outcome) in ranges.iter().zip(&fetched) {
            if let Ok(values) = outcome {
                let values = values::canonicalize(values.clone());
                // The fill is skipped if a write raced the fetch; the version
                // is still what upstream returned
                self.detector.record_version(spreadsheet_id, range, &values, None);
                self.cache.put_if_unchanged(spreadsheet_id, range, values, epoch);
            }
        }

        mapping
            .iter()
            .enumerate()
            .map(|(index, &range_index)| match fetched.get(range_index) {
                Some(Ok(values)) => Ok(OpOutcome::Read(values::canonicalize(values.clone()))),
                Some(Err(err)) => Err(EngineError::BatchPartialFailure {
                    spreadsheet_id: spreadsheet_id.to_string(),
                    range: ranges[range_index].to_string(),
                    op_id: ids[index],
                    message: err.to_string(),
                }),
                None => Err(EngineError::BatchPartialFailure {
                    spreadsheet_id: spreadsheet_id.to_string(),
                    range: ranges[range_index].to_string(),
                    op_id: ids[index],
                    message: "no result returned for range".to_string(),
                }),
            })
            .collect()
    }
}

fn cell_total(values: &Values) -> u64 {
    values.iter().map(|row| row.len() as u64).sum()
}
