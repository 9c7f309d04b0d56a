// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Request batching
//!
//! - [`merge`]: batch operations and the planner folding them into upstream requests
//! - [`window`]: the self-tuning collection window
//! - [`batcher`]: windows, tickets, dispatch, and result demultiplexing

mod batcher;
mod merge;
mod window;

pub use batcher::{BatchStats, OpOutcome, RequestBatcher, WriteOutcome};
pub use merge::BatchOp;
