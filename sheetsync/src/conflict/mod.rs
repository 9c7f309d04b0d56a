// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Conflict detection and resolution

mod detector;
mod fingerprint;
mod resolution;

pub use detector::{ConflictCheck, ConflictDetector, ConflictReport, Severity};
pub use fingerprint::Fingerprint;
pub use resolution::{
    resolve, ConflictStrategy, LocalWrite, RemoteState, Resolution, StrategyTag, TieBreak,
};
