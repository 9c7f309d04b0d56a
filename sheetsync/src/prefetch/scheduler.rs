// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Background cache warming
//!
//! Each tick re-scores every tracked range and scan prediction, then fetches
//! the best candidates while Prefetch-class tokens last. Prefetch never waits
//! for tokens: a tick that finds the bucket empty simply stops.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BinaryHeap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::scoring::{rank, score, PrefetchCandidate, PrefetchReason};
use super::tracker::AccessTracker;
use crate::cache::ReadCache;
use crate::config::{EngineConfig, PrefetchConfig};
use crate::conflict::ConflictDetector;
use crate::range::RangeRef;
use crate::throttle::{Admission, OperationClass};
use crate::upstream::UpstreamClient;
use crate::values;

/// Prefetch counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrefetchStats {
    pub ticks: u64,
    pub candidates_considered: u64,
    /// Successful fetches of every reason
    pub fetched: u64,
    pub warmed: u64,
    pub refreshed: u64,
    pub predicted: u64,
    /// Ticks cut short by an empty prefetch bucket or an open circuit
    pub skipped_for_tokens: u64,
    pub failures: u64,
}

pub struct PrefetchScheduler {
    config: PrefetchConfig,
    tracker: AccessTracker,
    upstream: Arc<dyn UpstreamClient>,
    admission: Arc<Admission>,
    cache: Arc<ReadCache>,
    detector: Arc<ConflictDetector>,
    stats: Mutex<PrefetchStats>,
}

impl PrefetchScheduler {
    pub fn new(
        config: &EngineConfig,
        upstream: Arc<dyn UpstreamClient>,
        admission: Arc<Admission>,
        cache: Arc<ReadCache>,
        detector: Arc<ConflictDetector>,
    ) -> Self {
        let prefetch = config.prefetch.clone();
        let tracker = AccessTracker::new(
            Duration::from_millis(prefetch.frequency_half_life_ms),
            config.cache_max_entries,
        );
        Self {
            config: prefetch,
            tracker,
            upstream,
            admission,
            cache,
            detector,
            stats: Mutex::new(PrefetchStats::default()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Note a foreground read of `range`
    pub fn record_access(&self, spreadsheet_id: &str, range: &RangeRef) {
        self.tracker.record_access(spreadsheet_id, range);
    }

    pub fn forget_spreadsheet(&self, spreadsheet_id: &str) {
        self.tracker.forget_spreadsheet(spreadsheet_id);
    }

    /// Current candidates, best first
    pub fn candidates(&self) -> Vec<PrefetchCandidate> {
        let mut ranked = self.rank_candidates(Instant::now()).into_sorted_vec();
        ranked.reverse();
        ranked
    }

    fn rank_candidates(&self, now: Instant) -> BinaryHeap<PrefetchCandidate> {
        let weights = &self.config.weights;
        let horizon = Duration::from_millis(self.config.recency_horizon_ms);
        let refresh_threshold = Duration::from_millis(self.config.refresh_threshold_ms);
        let half_life = self.tracker.half_life();
        let expiring: HashSet<(String, String)> = self
            .cache
            .expiring_within(refresh_threshold)
            .into_iter()
            .map(|(spreadsheet_id, range, _)| (spreadsheet_id, range.key()))
            .collect();
        let mut candidates = Vec::new();

        for record in self.tracker.records() {
            let frequency = record.frequency_at(now, half_life);
            let age = now.saturating_duration_since(record.last_access);
            let value = score(weights, frequency, age, horizon, 0.0);
            if value < self.config.min_score {
                continue;
            }
            let reason = if expiring.contains(&(record.spreadsheet_id.clone(), record.range.key())) {
                PrefetchReason::Refresh
            } else if self.cache.contains(&record.spreadsheet_id, &record.range) {
                continue;
            } else {
                PrefetchReason::Warm
            };
            candidates.push(PrefetchCandidate {
                spreadsheet_id: record.spreadsheet_id,
                range: record.range,
                score: value,
                reason,
            });
        }

        for prediction in self.tracker.predictions() {
            if self.cache.contains(&prediction.spreadsheet_id, &prediction.range) {
                continue;
            }
            let frequency = self
                .tracker
                .record(&prediction.spreadsheet_id, &prediction.range)
                .map_or(0.0, |r| r.frequency_at(now, half_life));
            let age = now.saturating_duration_since(prediction.predicted_at);
            let value = score(weights, frequency, age, horizon, prediction.probability);
            if value < self.config.min_score {
                continue;
            }
            candidates.push(PrefetchCandidate {
                spreadsheet_id: prediction.spreadsheet_id,
                range: prediction.range,
                score: value,
                reason: PrefetchReason::Predicted,
            });
        }

        rank(candidates)
    }

    /// Run one prefetch cycle, returning how many ranges were fetched
    pub async fn tick(&self) -> usize {
        if !self.config.enabled {
            return 0;
        }
        let mut heap = self.rank_candidates(Instant::now());
        {
            let mut stats = self.stats.lock();
            stats.ticks += 1;
            stats.candidates_considered += heap.len() as u64;
        }

        let mut fetched = 0;
        let mut attempts = 0;
        while attempts < self.config.batch_size {
            let Some(candidate) = heap.pop() else {
                break;
            };
            let Some(permit) = self.admission.try_admit(OperationClass::Prefetch) else {
                log::debug!(
                    "Prefetch tick stopped with {} candidate(s) left: no prefetch tokens",
                    heap.len() + 1
                );
                self.stats.lock().skipped_for_tokens += 1;
                break;
            };
            attempts += 1;

            let PrefetchCandidate {
                spreadsheet_id,
                range,
                reason,
                score: candidate_score,
            } = candidate;
            let epoch = self.cache.epoch(&spreadsheet_id);
            let result = self.upstream.fetch(&spreadsheet_id, &range).await;
            self.admission
                .complete(permit, !matches!(&result, Err(err) if err.is_transient()));

            match result {
                Ok(values) => {
                    let values = values::canonicalize(values);
                    self.detector
                        .record_version(&spreadsheet_id, &range, &values, None);
                    self.cache
                        .put_if_unchanged(&spreadsheet_id, &range, values, epoch);
                    self.tracker
                        .mark_fetched(&spreadsheet_id, &range, Instant::now());
                    log::debug!(
                        "Prefetched {}/{} ({}, score {:.2})",
                        spreadsheet_id,
                        range,
                        reason,
                        candidate_score
                    );

                    let mut stats = self.stats.lock();
                    stats.fetched += 1;
                    match reason {
                        PrefetchReason::Warm => stats.warmed += 1,
                        PrefetchReason::Refresh => stats.refreshed += 1,
                        PrefetchReason::Predicted => stats.predicted += 1,
                    }
                    fetched += 1;
                }
                Err(err) => {
                    log::debug!("Prefetch of {}/{} failed: {}", spreadsheet_id, range, err);
                    self.stats.lock().failures += 1;
                }
            }
        }
        fetched
    }

    pub fn stats(&self) -> PrefetchStats {
        self.stats.lock().clone()
    }

    /// Tick every `period` until `cancel` fires
    pub fn spawn(self: Arc<Self>, period: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(period.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            log::info!("Prefetch scheduler started (interval {:?})", period);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        log::info!("Prefetch scheduler stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.cache.purge_expired();
                        let fetched = self.tick().await;
                        if fetched > 0 {
                            log::debug!("Prefetch tick warmed {} range(s)", fetched);
                        }
                    }
                }
            }
        })
    }
}
