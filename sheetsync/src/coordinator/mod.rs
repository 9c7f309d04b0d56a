// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Sync Coordinator - the engine's single entry point
//!
//! The SyncCoordinator wires the throttle, cache, conflict, batch,
//! transaction and prefetch components together and exposes the operations
//! callers use: read, write, and transactions.

pub mod sync_coordinator;

pub use sync_coordinator::{ClassThrottle, EngineStats, SyncCoordinator, WriteOptions, WriteReport};
