// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Access tracking for the prefetcher
//!
//! Keeps an exponentially decayed access frequency per range and a per
//! spreadsheet sequential-scan predictor: a caller reading block after
//! block of the same shape, downwards or rightwards, is expected to read the
//! next block too.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use crate::range::RangeRef;

/// Probability assigned to the next block after `streak` sequential reads
pub fn scan_probability(streak: u32) -> f64 {
    (0.3 + 0.2 * f64::from(streak)).min(0.9)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanDirection {
    Down,
    Right,
}

#[derive(Debug, Clone)]
struct ScanState {
    last: RangeRef,
    direction: Option<ScanDirection>,
    streak: u32,
}

/// Access history of one range
#[derive(Debug, Clone)]
pub struct AccessRecord {
    pub spreadsheet_id: String,
    pub range: RangeRef,
    /// Decayed count as of `updated_at`
    frequency: f64,
    updated_at: Instant,
    pub last_access: Instant,
    pub accesses: u64,
    pub last_fetched_at: Option<Instant>,
}

impl AccessRecord {
    /// Frequency decayed to `now`
    pub fn frequency_at(&self, now: Instant, half_life: Duration) -> f64 {
        decay(self.frequency, now.saturating_duration_since(self.updated_at), half_life)
    }
}

/// Range the scan predictor expects next
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub spreadsheet_id: String,
    pub range: RangeRef,
    pub probability: f64,
    pub predicted_at: Instant,
}

#[derive(Default)]
struct TrackerInner {
    records: HashMap<(String, String), AccessRecord>,
    scans: HashMap<String, ScanState>,
    /// One live prediction per spreadsheet
    predictions: HashMap<String, Prediction>,
}

pub struct AccessTracker {
    half_life: Duration,
    max_tracked: usize,
    inner: Mutex<TrackerInner>,
}

impl AccessTracker {
    pub fn new(half_life: Duration, max_tracked: usize) -> Self {
        Self {
            half_life,
            max_tracked: max_tracked.max(1),
            inner: Mutex::new(TrackerInner::default()),
        }
    }

    pub fn half_life(&self) -> Duration {
        self.half_life
    }

    pub fn record_access(&self, spreadsheet_id: &str, range: &RangeRef) {
        self.record_access_at(spreadsheet_id, range, Instant::now());
    }

    pub fn record_access_at(&self, spreadsheet_id: &str, range: &RangeRef, now: Instant) {
        let mut inner = self.inner.lock();
        let key = (spreadsheet_id.to_string(), range.key());

        if !inner.records.contains_key(&key) && inner.records.len() >= self.max_tracked {
            // Make room by dropping the coldest record
            let half_life = self.half_life;
            let coldest = inner
                .records
                .iter()
                .min_by(|a, b| {
                    a.1.frequency_at(now, half_life)
                        .total_cmp(&b.1.frequency_at(now, half_life))
                })
                .map(|(k, _)| k.clone());
            if let Some(coldest) = coldest {
                inner.records.remove(&coldest);
            }
        }

        let record = inner.records.entry(key).or_insert_with(|| AccessRecord {
            spreadsheet_id: spreadsheet_id.to_string(),
            range: range.clone(),
            frequency: 0.0,
            updated_at: now,
            last_access: now,
            accesses: 0,
            last_fetched_at: None,
        });
        record.frequency = record.frequency_at(now, self.half_life) + 1.0;
        record.updated_at = now;
        record.last_access = now;
        record.accesses += 1;

        let scan = match inner.scans.get(spreadsheet_id) {
            Some(previous) => advance_scan(previous, range),
            None => ScanState {
                last: range.clone(),
                direction: None,
                streak: 0,
            },
        };

        let next = match scan.direction {
            Some(ScanDirection::Down) => range.next_block_down(),
            Some(ScanDirection::Right) => range.next_block_right(),
            None => None,
        };
        match next {
            Some(next) if scan.streak > 0 => {
                let probability = scan_probability(scan.streak);
                log::debug!(
                    "Predicting {}/{} after {} sequential read(s), p={:.2}",
                    spreadsheet_id,
                    next,
                    scan.streak,
                    probability
                );
                inner.predictions.insert(
                    spreadsheet_id.to_string(),
                    Prediction {
                        spreadsheet_id: spreadsheet_id.to_string(),
                        range: next,
                        probability,
                        predicted_at: now,
                    },
                );
            }
            _ => {
                inner.predictions.remove(spreadsheet_id);
            }
        }
        inner.scans.insert(spreadsheet_id.to_string(), scan);
    }

    pub fn mark_fetched(&self, spreadsheet_id: &str, range: &RangeRef, now: Instant) {
        if let Some(record) = self
            .inner
            .lock()
            .records
            .get_mut(&(spreadsheet_id.to_string(), range.key()))
        {
            record.last_fetched_at = Some(now);
        }
    }

    pub fn records(&self) -> Vec<AccessRecord> {
        self.inner.lock().records.values().cloned().collect()
    }

    pub fn record(&self, spreadsheet_id: &str, range: &RangeRef) -> Option<AccessRecord> {
        self.inner
            .lock()
            .records
            .get(&(spreadsheet_id.to_string(), range.key()))
            .cloned()
    }

    pub fn predictions(&self) -> Vec<Prediction> {
        self.inner.lock().predictions.values().cloned().collect()
    }

    #[cfg(test)]
    pub fn prediction_for(&self, spreadsheet_id: &str) -> Option<Prediction> {
        self.inner.lock().predictions.get(spreadsheet_id).cloned()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn forget_spreadsheet(&self, spreadsheet_id: &str) {
        let mut inner = self.inner.lock();
        inner.records.retain(|(sid, _), _| sid != spreadsheet_id);
        inner.scans.remove(spreadsheet_id);
        inner.predictions.remove(spreadsheet_id);
    }
}

fn advance_scan(previous: &ScanState, range: &RangeRef) -> ScanState {
    let direction = if previous.last.next_block_down().as_ref() == Some(range) {
        Some(ScanDirection::Down)
    } else if previous.last.next_block_right().as_ref() == Some(range) {
        Some(ScanDirection::Right)
    } else {
        None
    };
    let streak = match direction {
        Some(d) if previous.direction == Some(d) => previous.streak + 1,
        Some(_) => 1,
        None => 0,
    };
    ScanState {
        last: range.clone(),
        direction,
        streak,
    }
}

fn decay(value: f64, elapsed: Duration, half_life: Duration) -> f64 {
    if half_life.is_zero() {
        return 0.0;
    }
    value * 0.5f64.powf(elapsed.as_secs_f64() / half_life.as_secs_f64())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(s: &str) -> RangeRef {
        s.parse().unwrap()
    }

    #[test]
    fn test_scan_probability_is_capped() {
        assert!((scan_probability(1) - 0.5).abs() < 1e-9);
        assert!((scan_probability(2) - 0.7).abs() < 1e-9);
        assert!((scan_probability(10) - 0.9).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_frequency_decays_by_half_life() {
        let tracker = AccessTracker::new(Duration::from_secs(60), 100);
        let start = Instant::now();
        tracker.record_access_at("s1", &r("A1:B2"), start);
        tracker.record_access_at("s1", &r("A1:B2"), start);

        let record = tracker.record("s1", &r("A1:B2")).unwrap();
        assert_eq!(record.accesses, 2);
        assert!((record.frequency_at(start, tracker.half_life()) - 2.0).abs() < 1e-9);
        let later = start + Duration::from_secs(60);
        assert!((record.frequency_at(later, tracker.half_life()) - 1.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_reads_predict_next_block() {
        let tracker = AccessTracker::new(Duration::from_secs(60), 100);
        tracker.record_access("s1", &r("Sheet1!A1:C10"));
        assert!(tracker.prediction_for("s1").is_none());

        tracker.record_access("s1", &r("Sheet1!A11:C20"));
        let prediction = tracker.prediction_for("s1").unwrap();
        assert_eq!(prediction.range, r("Sheet1!A21:C30"));
        assert!((prediction.probability - 0.5).abs() < 1e-9);

        tracker.record_access("s1", &r("Sheet1!A21:C30"));
        let prediction = tracker.prediction_for("s1").unwrap();
        assert_eq!(prediction.range, r("Sheet1!A31:C40"));
        assert!((prediction.probability - 0.7).abs() < 1e-9);

        // A jump elsewhere breaks the scan
        tracker.record_access("s1", &r("Sheet1!Z1"));
        assert!(tracker.prediction_for("s1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_coldest_record_evicted_at_capacity() {
        let tracker = AccessTracker::new(Duration::from_secs(60), 2);
        tracker.record_access("s1", &r("A1"));
        tracker.record_access("s1", &r("A1"));
        tracker.record_access("s1", &r("B1"));
        tracker.record_access("s1", &r("C1"));
        assert_eq!(tracker.len(), 2);
        assert!(tracker.record("s1", &r("A1")).is_some());
        assert!(tracker.record("s1", &r("B1")).is_none());
    }
}
