// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Token buckets, one per operation class
//!
//! Buckets refill lazily: each call credits the tokens earned since the last
//! call, capped at capacity. Waiting callers sleep for exactly the time their
//! deficit takes to refill.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::OperationClass;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};

/// Shape of one bucket
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketSpec {
    pub capacity: u32,
    /// Tokens credited per second
    pub refill_per_sec: f64,
}

impl BucketSpec {
    #[cfg(test)]
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        Self {
            capacity,
            refill_per_sec,
        }
    }

    /// Bucket holding one minute's worth of `per_minute` calls
    pub fn per_minute(per_minute: f64) -> Self {
        Self {
            capacity: per_minute.round().max(0.0) as u32,
            refill_per_sec: per_minute / 60.0,
        }
    }
}

#[derive(Debug)]
struct Bucket {
    spec: BucketSpec,
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(spec: BucketSpec, now: Instant) -> Self {
        Self {
            spec,
            tokens: spec.capacity as f64,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.spec.refill_per_sec).min(self.spec.capacity as f64);
        self.last_refill = now;
    }

    /// Time until `n` tokens are available, `None` if they never will be
    fn wait_for(&self, n: u32) -> Option<Duration> {
        let deficit = n as f64 - self.tokens;
        if deficit <= 0.0 {
            return Some(Duration::ZERO);
        }
        if self.spec.refill_per_sec <= 0.0 {
            return None;
        }
        // Round up to the next millisecond so the retry finds the tokens there
        let millis = (deficit / self.spec.refill_per_sec * 1000.0).ceil();
        Some(Duration::from_millis(millis as u64))
    }
}

/// Per-class token buckets
pub struct RateLimiter {
    buckets: Mutex<HashMap<OperationClass, Bucket>>,
}

impl RateLimiter {
    /// Read and write buckets hold one minute of quota; the prefetch bucket is
    /// carved out of the read quota so background work never spends
    /// foreground tokens.
    pub fn from_config(config: &EngineConfig) -> Self {
        let reads = config.reads_per_minute as f64;
        let prefetch_share = reads * config.prefetch_token_share;
        Self::with_buckets(
            BucketSpec::per_minute((reads - prefetch_share).max(1.0)),
            BucketSpec::per_minute(config.writes_per_minute as f64),
            BucketSpec::per_minute(prefetch_share),
        )
    }

    pub fn with_buckets(read: BucketSpec, write: BucketSpec, prefetch: BucketSpec) -> Self {
        let now = Instant::now();
        let mut buckets = HashMap::new();
        buckets.insert(OperationClass::Read, Bucket::new(read, now));
        buckets.insert(OperationClass::Write, Bucket::new(write, now));
        buckets.insert(OperationClass::Prefetch, Bucket::new(prefetch, now));
        Self {
            buckets: Mutex::new(buckets),
        }
    }

    #[cfg(test)]
    pub fn spec(&self, class: OperationClass) -> Option<BucketSpec> {
        self.buckets.lock().get(&class).map(|b| b.spec)
    }

    /// Whole tokens currently available
    pub fn available(&self, class: OperationClass) -> u32 {
        let mut buckets = self.buckets.lock();
        match buckets.get_mut(&class) {
            Some(bucket) => {
                bucket.refill(Instant::now());
                bucket.tokens.floor() as u32
            }
            None => 0,
        }
    }

    /// Take `n` tokens if they are available right now
    pub fn try_acquire(&self, class: OperationClass, n: u32) -> bool {
        let mut buckets = self.buckets.lock();
        let Some(bucket) = buckets.get_mut(&class) else {
            return false;
        };
        bucket.refill(Instant::now());
        if bucket.tokens >= n as f64 {
            bucket.tokens -= n as f64;
            true
        } else {
            false
        }
    }

    /// Take `n` tokens, waiting at most `timeout`
    #[cfg(test)]
    pub async fn acquire(&self, class: OperationClass, n: u32, timeout: Duration) -> EngineResult<()> {
        self.acquire_with(class, n, timeout, None).await
    }

    /// Take `n` tokens, waiting at most `timeout` or until `cancel` fires
    ///
    /// Fails immediately when the required wait already exceeds the remaining
    /// budget, rather than sleeping through a timeout that is certain.
    pub async fn acquire_with(
        &self,
        class: OperationClass,
        n: u32,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> EngineResult<()> {
        let started = Instant::now();
        let deadline = started + timeout;

        loop {
            let wait = {
                let mut buckets = self.buckets.lock();
                let bucket = buckets.get_mut(&class).ok_or(EngineError::QuotaExceeded {
                    class,
                    requested: n,
                    waited: Duration::ZERO,
                })?;
                let now = Instant::now();
                bucket.refill(now);

                if n > bucket.spec.capacity {
                    None
                } else if bucket.tokens >= n as f64 {
                    bucket.tokens -= n as f64;
                    return Ok(());
                } else {
                    bucket.wait_for(n).filter(|wait| now + *wait <= deadline)
                }
            };

            let Some(wait) = wait else {
                log::debug!("{} quota exhausted: {} token(s) not available in time", class, n);
                return Err(EngineError::QuotaExceeded {
                    class,
                    requested: n,
                    waited: started.elapsed(),
                });
            };

            log::debug!("Waiting {:?} for {} {} token(s)", wait, n, class);
            match cancel {
                Some(token) => {
                    tokio::select! {
                        _ = token.cancelled() => {
                            return Err(EngineError::Cancelled {
                                operation: format!("{} token acquire", class),
                            });
                        }
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
                None => tokio::time::sleep(wait).await,
            }
        }
    }
}
