// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Batch operations and the merge planner
//!
//! The planner turns an ordered run of write ops into as few upstream
//! requests as possible without reordering anything that does not commute:
//! an op only ever merges into the request directly before it.

use serde::{Deserialize, Serialize};

use crate::range::RangeRef;
use crate::throttle::OperationClass;
use crate::upstream::{UpstreamRequest, ValueRange};
use crate::values::Values;

/// One caller-level operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BatchOp {
    Read { range: RangeRef },
    Update { range: RangeRef, values: Values },
    Append { range: RangeRef, rows: Values },
    Clear { range: RangeRef },
    Format { range: RangeRef, format: serde_json::Value },
    CopyRange { source: RangeRef, destination: RangeRef },
}

impl BatchOp {
    pub fn class(&self) -> OperationClass {
        match self {
            BatchOp::Read { .. } => OperationClass::Read,
            _ => OperationClass::Write,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            BatchOp::Read { .. } => "read",
            BatchOp::Update { .. } => "update",
            BatchOp::Append { .. } => "append",
            BatchOp::Clear { .. } => "clear",
            BatchOp::Format { .. } => "format",
            BatchOp::CopyRange { .. } => "copy_range",
        }
    }

    /// The range the caller named
    pub fn target(&self) -> &RangeRef {
        match self {
            BatchOp::Read { range }
            | BatchOp::Update { range, .. }
            | BatchOp::Append { range, .. }
            | BatchOp::Clear { range }
            | BatchOp::Format { range, .. } => range,
            BatchOp::CopyRange { destination, .. } => destination,
        }
    }

    /// Area whose contents this op may change
    pub fn written_range(&self) -> Option<RangeRef> {
        match self {
            BatchOp::Read { .. } => None,
            BatchOp::Append { range, .. } => Some(range.append_footprint()),
            BatchOp::Update { range, .. }
            | BatchOp::Clear { range }
            | BatchOp::Format { range, .. } => Some(range.clone()),
            BatchOp::CopyRange { destination, .. } => Some(destination.clone()),
        }
    }

    /// Area whose contents this op depends on
    pub fn read_range(&self) -> Option<RangeRef> {
        match self {
            BatchOp::Read { range } => Some(range.clone()),
            BatchOp::CopyRange { source, .. } => Some(source.clone()),
            _ => None,
        }
    }

    pub fn is_write(&self) -> bool {
        self.class() == OperationClass::Write
    }
}

/// An upstream request and the indices of the ops folded into it
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedRequest {
    pub request: UpstreamRequest,
    pub members: Vec<usize>,
}

/// Plan the upstream requests for a run of write ops, in submission order.
/// Reads are not planned here.
pub fn plan_writes(ops: &[BatchOp]) -> Vec<PlannedRequest> {
    let mut planned: Vec<PlannedRequest> = Vec::new();

    for (index, op) in ops.iter().enumerate() {
        let merged = match (planned.last_mut(), op) {
            (
                Some(PlannedRequest {
                    request: UpstreamRequest::UpdateValues { data },
                    members,
                }),
                BatchOp::Update { range, values },
            ) if data.iter().all(|vr| !vr.range.overlaps(range)) => {
                data.push(ValueRange {
                    range: range.clone(),
                    values: values.clone(),
                });
                members.push(index);
                true
            }
            (
                Some(PlannedRequest {
                    request:
                        UpstreamRequest::AppendRows {
                            range: pending,
                            rows: pending_rows,
                        },
                    members,
                }),
                BatchOp::Append { range, rows },
            ) if pending == range => {
                pending_rows.extend(rows.iter().cloned());
                members.push(index);
                true
            }
            (
                Some(PlannedRequest {
                    request: UpstreamRequest::ClearValues { ranges },
                    members,
                }),
                BatchOp::Clear { range },
            ) => {
                ranges.push(range.clone());
                members.push(index);
                true
            }
            _ => false,
        };

        if merged {
            continue;
        }

        let request = match op {
            BatchOp::Read { .. } => continue,
            BatchOp::Update { range, values } => UpstreamRequest::UpdateValues {
                data: vec![ValueRange {
                    range: range.clone(),
                    values: values.clone(),
                }],
            },
            BatchOp::Append { range, rows } => UpstreamRequest::AppendRows {
                range: range.clone(),
                rows: rows.clone(),
            },
            BatchOp::Clear { range } => UpstreamRequest::ClearValues {
                ranges: vec![range.clone()],
            },
            BatchOp::Format { range, format } => UpstreamRequest::Format {
                range: range.clone(),
                format: format.clone(),
            },
            BatchOp::CopyRange {
                source,
                destination,
            } => UpstreamRequest::CopyPaste {
                source: source.clone(),
                destination: destination.clone(),
            },
        };
        planned.push(PlannedRequest {
            request,
            members: vec![index],
        });
    }

    planned
}

/// Distinct ranges to fetch and, per op, the index of its range
pub fn plan_reads(ops: &[BatchOp]) -> (Vec<RangeRef>, Vec<usize>) {
    let mut ranges: Vec<RangeRef> = Vec::new();
    let mut mapping = Vec::with_capacity(ops.len());
    for op in ops {
        let range = op.target();
        let index = match ranges.iter().position(|r| r == range) {
            Some(index) => index,
            None => {
                ranges.push(range.clone());
                ranges.len() - 1
            }
        };
        mapping.push(index);
    }
    (ranges, mapping)
}
