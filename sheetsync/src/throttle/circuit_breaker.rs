// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
// Circuit breaker for upstream calls
//
// States:
// - Closed: calls proceed; consecutive failures are counted
// - Open: calls fail fast until the cooldown elapses
// - HalfOpen: exactly one probe call is in flight; its outcome decides

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use super::OperationClass;
use crate::error::{EngineError, EngineResult};

/// Circuit state for one operation class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open { since: Instant },
    HalfOpen { probe_in_flight: bool },
}

#[derive(Debug)]
struct Circuit {
    state: CircuitState,
    consecutive_failures: u32,
}

impl Circuit {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
        }
    }
}

/// Permission to make one upstream call
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a permit must be completed or abandoned"]
pub struct CircuitPermit {
    class: OperationClass,
    probe: bool,
}

impl CircuitPermit {
    pub fn class(&self) -> OperationClass {
        self.class
    }

    /// Whether this call is the half-open probe
    pub fn is_probe(&self) -> bool {
        self.probe
    }
}

pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    circuits: Mutex<HashMap<OperationClass, Circuit>>,
}

/// Prefetch traffic hits the same endpoints as reads
fn circuit_key(class: OperationClass) -> OperationClass {
    match class {
        OperationClass::Prefetch => OperationClass::Read,
        other => other,
    }
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            cooldown,
            circuits: Mutex::new(HashMap::new()),
        }
    }

    pub fn state(&self, class: OperationClass) -> CircuitState {
        self.circuits
            .lock()
            .get(&circuit_key(class))
            .map(|c| c.state)
            .unwrap_or(CircuitState::Closed)
    }

    pub fn consecutive_failures(&self, class: OperationClass) -> u32 {
        self.circuits
            .lock()
            .get(&circuit_key(class))
            .map(|c| c.consecutive_failures)
            .unwrap_or(0)
    }

    /// Ask to make a call; fails fast while the circuit is open
    pub fn check(&self, class: OperationClass) -> EngineResult<CircuitPermit> {
        let mut circuits = self.circuits.lock();
        let circuit = circuits.entry(circuit_key(class)).or_insert_with(Circuit::new);

        match circuit.state {
            CircuitState::Closed => Ok(CircuitPermit {
                class,
                probe: false,
            }),
            CircuitState::Open { since } => {
                let elapsed = since.elapsed();
                if elapsed >= self.cooldown {
                    circuit.state = CircuitState::HalfOpen {
                        probe_in_flight: true,
                    };
                    log::info!("{} circuit half-open, admitting probe", class);
                    Ok(CircuitPermit { class, probe: true })
                } else {
                    Err(EngineError::UpstreamUnavailable {
                        class,
                        retry_after: self.cooldown - elapsed,
                    })
                }
            }
            CircuitState::HalfOpen {
                probe_in_flight: true,
            } => Err(EngineError::UpstreamUnavailable {
                class,
                retry_after: self.cooldown,
            }),
            CircuitState::HalfOpen {
                probe_in_flight: false,
            } => {
                circuit.state = CircuitState::HalfOpen {
                    probe_in_flight: true,
                };
                Ok(CircuitPermit { class, probe: true })
            }
        }
    }

    /// Feed the outcome of an admitted call. While half-open only the call
    /// admitted by the half-open transition moves the circuit; calls
    /// admitted before it opened cannot close or reopen it.
    pub fn record_outcome(&self, permit: CircuitPermit, success: bool) {
        let class = permit.class();
        let mut circuits = self.circuits.lock();
        let circuit = circuits.entry(circuit_key(class)).or_insert_with(Circuit::new);

        if success {
            match circuit.state {
                CircuitState::Closed => circuit.consecutive_failures = 0,
                CircuitState::HalfOpen { .. } if permit.is_probe() => {
                    log::info!("{} circuit closed after successful probe", class);
                    circuit.state = CircuitState::Closed;
                    circuit.consecutive_failures = 0;
                }
                // Late success from a call admitted before the circuit opened
                CircuitState::HalfOpen { .. } | CircuitState::Open { .. } => {}
            }
            return;
        }

        let now = Instant::now();
        circuit.consecutive_failures = circuit.consecutive_failures.saturating_add(1);

        match circuit.state {
            CircuitState::HalfOpen { .. } if permit.is_probe() => {
                circuit.state = CircuitState::Open { since: now };
                log::warn!("{} circuit reopened after failed probe", class);
            }
            CircuitState::Closed if circuit.consecutive_failures >= self.threshold => {
                circuit.state = CircuitState::Open { since: now };
                log::warn!(
                    "{} circuit opened after {} consecutive failures",
                    class,
                    circuit.consecutive_failures
                );
            }
            // Late failures from calls admitted before the circuit opened
            CircuitState::Closed | CircuitState::HalfOpen { .. } | CircuitState::Open { .. } => {}
        }
    }

    /// Return a permit whose call never reached upstream
    pub fn abandon(&self, permit: CircuitPermit) {
        if !permit.probe {
            return;
        }
        let mut circuits = self.circuits.lock();
        if let Some(circuit) = circuits.get_mut(&circuit_key(permit.class)) {
            if circuit.state
                == (CircuitState::HalfOpen {
                    probe_in_flight: true,
                })
            {
                circuit.state = CircuitState::HalfOpen {
                    probe_in_flight: false,
                };
            }
        }
    }
}
