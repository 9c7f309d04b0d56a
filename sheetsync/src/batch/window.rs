// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Self-tuning batch window
//!
//! After each flush the window shrinks by a fifth when more ops than the
//! target were collected, and grows by a fifth when fewer were. The result is
//! clamped to the configured bounds.

use std::time::Duration;

use crate::config::EngineConfig;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowBounds {
    pub initial: Duration,
    pub min: Duration,
    pub max: Duration,
    pub target_batch_size: usize,
}

impl WindowBounds {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            initial: Duration::from_millis(config.initial_batch_window_ms),
            min: Duration::from_millis(config.min_batch_window_ms),
            max: Duration::from_millis(config.max_batch_window_ms),
            target_batch_size: config.target_batch_size.max(1),
        }
    }
}

/// Window length for one (spreadsheet, class) pair; persists across windows
#[derive(Debug, Clone)]
pub struct AdaptiveWindow {
    current_us: u64,
    min_us: u64,
    max_us: u64,
    target: usize,
}

impl AdaptiveWindow {
    pub fn new(bounds: &WindowBounds) -> Self {
        let min_us = bounds.min.as_micros() as u64;
        let max_us = (bounds.max.as_micros() as u64).max(min_us);
        Self {
            current_us: (bounds.initial.as_micros() as u64).clamp(min_us, max_us),
            min_us,
            max_us,
            target: bounds.target_batch_size,
        }
    }

    pub fn current(&self) -> Duration {
        Duration::from_micros(self.current_us)
    }

    /// Feed the size of the window that just closed; returns the next length
    pub fn observe(&mut self, collected: usize) -> Duration {
        let next = if collected > self.target {
            self.current_us.saturating_mul(4) / 5
        } else if collected < self.target {
            self.current_us.saturating_mul(6) / 5
        } else {
            self.current_us
        };
        self.current_us = next.clamp(self.min_us, self.max_us);
        self.current()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bounds() -> WindowBounds {
        WindowBounds {
            initial: Duration::from_millis(50),
            min: Duration::from_millis(20),
            max: Duration::from_millis(200),
            target_batch_size: 10,
        }
    }

    #[test]
    fn test_shrink_then_grow() {
        let mut window = AdaptiveWindow::new(&bounds());
        assert_eq!(window.current(), Duration::from_millis(50));
        assert_eq!(window.observe(50), Duration::from_millis(40));
        assert_eq!(window.observe(1), Duration::from_millis(48));
        assert_eq!(window.observe(10), Duration::from_millis(48));
    }

    #[test]
    fn test_clamped_to_bounds() {
        let mut window = AdaptiveWindow::new(&bounds());
        for _ in 0..50 {
            window.observe(0);
        }
        assert_eq!(window.current(), Duration::from_millis(200));
        for _ in 0..50 {
            window.observe(1_000);
        }
        assert_eq!(window.current(), Duration::from_millis(20));
    }
}
