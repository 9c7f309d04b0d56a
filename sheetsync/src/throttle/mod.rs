// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Admission control in front of every upstream call
//!
//! Every path that talks upstream goes through [`Admission`]: the circuit
//! breaker is consulted first (an open circuit fails fast without spending
//! tokens), then the token bucket for the operation class.

mod circuit_breaker;
mod rate_limiter;

pub use circuit_breaker::{CircuitBreaker, CircuitPermit, CircuitState};
pub use rate_limiter::RateLimiter;

#[cfg(test)]
pub(crate) use rate_limiter::BucketSpec;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::error::EngineResult;

/// Operation classes with separate quotas
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OperationClass {
    Read,
    Write,
    /// Background cache warming; its own token allocation, shares the read circuit
    Prefetch,
}

impl fmt::Display for OperationClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationClass::Read => write!(f, "read"),
            OperationClass::Write => write!(f, "write"),
            OperationClass::Prefetch => write!(f, "prefetch"),
        }
    }
}

/// Rate limiter and circuit breaker, consulted together
pub struct Admission {
    limiter: RateLimiter,
    breaker: CircuitBreaker,
    acquire_timeout: Duration,
}

impl Admission {
    pub fn new(limiter: RateLimiter, breaker: CircuitBreaker, acquire_timeout: Duration) -> Self {
        Self {
            limiter,
            breaker,
            acquire_timeout,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            RateLimiter::from_config(config),
            CircuitBreaker::new(config.circuit_failure_threshold, config.circuit_cooldown()),
            config.acquire_timeout(),
        )
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Admit one upstream call, suspending for tokens if needed
    pub async fn admit(
        &self,
        class: OperationClass,
        cancel: Option<&CancellationToken>,
    ) -> EngineResult<CircuitPermit> {
        let permit = self.breaker.check(class)?;
        match self
            .limiter
            .acquire_with(class, 1, self.acquire_timeout, cancel)
            .await
        {
            Ok(()) => Ok(permit),
            Err(err) => {
                self.breaker.abandon(permit);
                Err(err)
            }
        }
    }

    /// Admit one upstream call only if it can proceed right now
    pub fn try_admit(&self, class: OperationClass) -> Option<CircuitPermit> {
        let permit = self.breaker.check(class).ok()?;
        if self.limiter.try_acquire(class, 1) {
            Some(permit)
        } else {
            self.breaker.abandon(permit);
            None
        }
    }

    /// Report how an admitted call went
    pub fn complete(&self, permit: CircuitPermit, success: bool) {
        self.breaker.record_outcome(permit, success);
    }
}
