// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Range locks for serializable transactions
//!
//! A transaction holds its ranges until it reaches a terminal state. A
//! request that overlaps a range held by another transaction on the same
//! spreadsheet waits for that holder to release, up to a timeout. Waiting
//! requests are served in transaction begin order: a request also queues
//! behind any earlier transaction already waiting for an overlapping range.
//! Waits are recorded in a wait-for graph; a request that would close a
//! cycle fails with `Deadlock` instead of waiting.

use parking_lot::Mutex;
use petgraph::algo::has_path_connecting;
use petgraph::graphmap::DiGraphMap;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::state::TransactionId;
use crate::error::{EngineError, EngineResult};
use crate::range::RangeRef;

/// A range held or requested by a transaction
#[derive(Debug, Clone)]
struct RangeClaim {
    txn: TransactionId,
    range: RangeRef,
}

#[derive(Debug)]
struct QueuedRequest {
    spreadsheet_id: String,
    ranges: Vec<RangeRef>,
}

#[derive(Default)]
struct LockState {
    /// spreadsheet id -> held ranges
    held: HashMap<String, Vec<RangeClaim>>,
    /// Requests currently waiting, one per transaction
    queued: HashMap<TransactionId, QueuedRequest>,
    /// Edge W -> H: W waits for H
    waits_for: DiGraphMap<TransactionId, ()>,
}

impl LockState {
    /// What `txn` has to wait for: another holder of an overlapping range,
    /// or else the earliest transaction queued for one
    fn blocker(&self, txn: TransactionId, spreadsheet_id: &str, ranges: &[RangeRef]) -> Option<RangeClaim> {
        let overlaps = |other: &RangeRef| ranges.iter().any(|r| r.overlaps(other));

        let held = self.held.get(spreadsheet_id).and_then(|held| {
            held.iter()
                .find(|h| h.txn != txn && overlaps(&h.range))
                .cloned()
        });
        if held.is_some() {
            return held;
        }

        // A queued transaction that already waits on `txn` cannot go first
        self.queued
            .iter()
            .filter(|(&waiter, request)| waiter < txn && request.spreadsheet_id == spreadsheet_id)
            .filter(|(&waiter, _)| !self.waits_on(waiter, txn))
            .filter_map(|(&waiter, request)| {
                request
                    .ranges
                    .iter()
                    .find(|range| overlaps(range))
                    .map(|range| RangeClaim {
                        txn: waiter,
                        range: range.clone(),
                    })
            })
            .min_by_key(|claim| claim.txn)
    }

    fn waits_on(&self, from: TransactionId, to: TransactionId) -> bool {
        self.waits_for.contains_node(from)
            && self.waits_for.contains_node(to)
            && has_path_connecting(&self.waits_for, from, to, None)
    }

    fn enqueue(&mut self, txn: TransactionId, spreadsheet_id: &str, ranges: &[RangeRef], blocker: TransactionId) {
        self.clear_edges(txn);
        self.waits_for.add_edge(txn, blocker, ());
        self.queued
            .entry(txn)
            .or_insert_with(|| QueuedRequest {
                spreadsheet_id: spreadsheet_id.to_string(),
                ranges: ranges.to_vec(),
            });
    }

    /// Leave the queue; returns whether `txn` was queued
    fn dequeue(&mut self, txn: TransactionId) -> bool {
        self.clear_edges(txn);
        self.queued.remove(&txn).is_some()
    }

    fn clear_edges(&mut self, txn: TransactionId) {
        let targets: Vec<TransactionId> = self.waits_for.neighbors(txn).collect();
        for target in targets {
            self.waits_for.remove_edge(txn, target);
        }
    }
}

#[derive(Default)]
pub struct RangeLockTable {
    state: Mutex<LockState>,
    released: Notify,
}

impl RangeLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take `ranges` for `txn`, waiting behind holders and earlier waiters.
    /// Returns whether the call had to wait.
    pub async fn acquire(
        &self,
        txn: TransactionId,
        spreadsheet_id: &str,
        ranges: &[RangeRef],
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> EngineResult<bool> {
        let started = Instant::now();
        let deadline = started + timeout;
        let mut waited = false;

        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let blocker = {
                let mut state = self.state.lock();
                match state.blocker(txn, spreadsheet_id, ranges) {
                    None => {
                        state.dequeue(txn);
                        let held = state.held.entry(spreadsheet_id.to_string()).or_default();
                        for range in ranges {
                            if !held.iter().any(|h| h.txn == txn && h.range == *range) {
                                held.push(RangeClaim {
                                    txn,
                                    range: range.clone(),
                                });
                            }
                        }
                        if waited {
                            log::debug!(
                                "{} acquired range lock on {} after {:?}",
                                txn,
                                spreadsheet_id,
                                started.elapsed()
                            );
                        }
                        return Ok(waited);
                    }
                    Some(blocker) => {
                        if state.waits_on(blocker.txn, txn) {
                            drop(state);
                            self.leave_queue(txn);
                            log::warn!(
                                "Deadlock on {}: {} would wait on {}",
                                spreadsheet_id,
                                txn,
                                blocker.txn
                            );
                            return Err(EngineError::Deadlock {
                                transaction_id: txn,
                                holder: blocker.txn,
                            });
                        }
                        state.enqueue(txn, spreadsheet_id, ranges, blocker.txn);
                        blocker
                    }
                }
            };

            if !waited {
                log::debug!(
                    "{} waiting for {} on {} ({})",
                    txn,
                    blocker.txn,
                    spreadsheet_id,
                    blocker.range
                );
            }
            waited = true;

            let cancelled = async {
                match cancel {
                    Some(token) => token.cancelled().await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => {
                    self.leave_queue(txn);
                    return Err(EngineError::LockTimeout {
                        spreadsheet_id: spreadsheet_id.to_string(),
                        range: blocker.range.to_string(),
                        holder: blocker.txn,
                        waited: started.elapsed(),
                    });
                }
                _ = cancelled => {
                    self.leave_queue(txn);
                    return Err(EngineError::Cancelled {
                        operation: format!("range lock for {}", txn),
                    });
                }
            }
        }
    }

    /// Give up a queued request; later waiters may now be first in line
    fn leave_queue(&self, txn: TransactionId) {
        if self.state.lock().dequeue(txn) {
            self.released.notify_waiters();
        }
    }

    /// Drop every range `txn` holds and wake waiters
    pub fn release(&self, txn: TransactionId) -> usize {
        let released = {
            let mut state = self.state.lock();
            let mut released = 0;
            for held in state.held.values_mut() {
                let before = held.len();
                held.retain(|h| h.txn != txn);
                released += before - held.len();
            }
            state.held.retain(|_, held| !held.is_empty());
            state.queued.remove(&txn);
            state.waits_for.remove_node(txn);
            released
        };
        if released > 0 {
            log::debug!("{} released {} range lock(s)", txn, released);
        }
        self.released.notify_waiters();
        released
    }

    #[cfg(test)]
    pub fn held_by(&self, txn: TransactionId) -> Vec<RangeRef> {
        self.state
            .lock()
            .held
            .values()
            .flatten()
            .filter(|h| h.txn == txn)
            .map(|h| h.range.clone())
            .collect()
    }

    /// Transactions currently waiting for a lock
    #[cfg(test)]
    pub fn waiting(&self) -> usize {
        self.state.lock().queued.len()
    }
}
