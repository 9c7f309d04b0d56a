// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Upstream spreadsheet API collaborator
//!
//! The engine never builds wire payloads. It hands typed [`UpstreamRequest`]s
//! to an [`UpstreamClient`] and receives per-request outcomes back.

mod memory;
pub(crate) mod retry;

pub use memory::MemoryUpstream;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::UpstreamError;
use crate::range::RangeRef;
use crate::values::Values;

/// Values destined for one range
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueRange {
    pub range: RangeRef,
    pub values: Values,
}

/// One sub-request of an `apply` call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum UpstreamRequest {
    /// Multi-range value update
    UpdateValues { data: Vec<ValueRange> },
    /// Append rows after the last non-empty row of `range`
    AppendRows { range: RangeRef, rows: Values },
    ClearValues { ranges: Vec<RangeRef> },
    /// Formatting payload is opaque to the engine
    Format {
        range: RangeRef,
        format: serde_json::Value,
    },
    CopyPaste {
        source: RangeRef,
        destination: RangeRef,
    },
}

impl UpstreamRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            UpstreamRequest::UpdateValues { .. } => "update_values",
            UpstreamRequest::AppendRows { .. } => "append_rows",
            UpstreamRequest::ClearValues { .. } => "clear_values",
            UpstreamRequest::Format { .. } => "format",
            UpstreamRequest::CopyPaste { .. } => "copy_paste",
        }
    }

    /// Ranges whose contents this request may change
    pub fn written_ranges(&self) -> Vec<RangeRef> {
        match self {
            UpstreamRequest::UpdateValues { data } => {
                data.iter().map(|vr| vr.range.clone()).collect()
            }
            UpstreamRequest::AppendRows { range, .. } => vec![range.append_footprint()],
            UpstreamRequest::ClearValues { ranges } => ranges.clone(),
            UpstreamRequest::Format { range, .. } => vec![range.clone()],
            UpstreamRequest::CopyPaste { destination, .. } => vec![destination.clone()],
        }
    }
}

/// Successful result of one sub-request
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ApplyReply {
    pub updated_cells: u64,
    /// Ranges actually written, in request order
    pub updated_ranges: Vec<RangeRef>,
    pub revision: Option<String>,
}

pub type RequestOutcome = Result<ApplyReply, UpstreamError>;

/// Abstract client for the remote spreadsheet API
///
/// Whole-call failures are reported through the outer `Result`; failures of
/// individual sub-requests through the per-request outcomes.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    async fn fetch(&self, spreadsheet_id: &str, range: &RangeRef) -> Result<Values, UpstreamError>;

    /// Fetch several ranges in one call
    async fn batch_fetch(
        &self,
        spreadsheet_id: &str,
        ranges: &[RangeRef],
    ) -> Result<Vec<Result<Values, UpstreamError>>, UpstreamError> {
        let mut results = Vec::with_capacity(ranges.len());
        for range in ranges {
            results.push(self.fetch(spreadsheet_id, range).await);
        }
        Ok(results)
    }

    async fn apply(
        &self,
        spreadsheet_id: &str,
        requests: &[UpstreamRequest],
    ) -> Result<Vec<RequestOutcome>, UpstreamError>;

    /// Approximate size of the spreadsheet in bytes
    async fn estimate_size(&self, spreadsheet_id: &str) -> Result<u64, UpstreamError>;

    /// Copy the spreadsheet, returning an opaque snapshot id
    async fn copy(&self, spreadsheet_id: &str) -> Result<String, UpstreamError>;

    async fn restore(&self, spreadsheet_id: &str, snapshot_id: &str) -> Result<(), UpstreamError>;

    async fn discard(&self, snapshot_id: &str) -> Result<(), UpstreamError>;
}
