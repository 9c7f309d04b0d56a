// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! In-process upstream used by tests and benchmarks
//!
//! Holds spreadsheets as plain grids, counts every call, and lets a test
//! script whole-call failures, per-request rejections, latency, and snapshot
//! failures.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use super::{ApplyReply, RequestOutcome, UpstreamClient, UpstreamRequest, ValueRange};
use crate::error::{EngineResult, UpstreamError};
use crate::range::{Interval, RangeRef};
use crate::values::{self, CellValue, Values};

/// Title of the sheet every new spreadsheet starts with
pub const DEFAULT_SHEET: &str = "Sheet1";

#[derive(Debug, Clone, Default)]
struct Workbook {
    /// Sheet title -> grid, in creation order by title
    sheets: BTreeMap<String, Values>,
}

impl Workbook {
    fn with_default_sheet() -> Self {
        let mut sheets = BTreeMap::new();
        sheets.insert(DEFAULT_SHEET.to_string(), Values::new());
        Self { sheets }
    }

    fn sheet_title(&self, range: &RangeRef) -> Result<String, UpstreamError> {
        match &range.sheet {
            None => Ok(DEFAULT_SHEET.to_string()),
            Some(wanted) => self
                .sheets
                .keys()
                .find(|title| title.eq_ignore_ascii_case(wanted))
                .cloned()
                .ok_or_else(|| UpstreamError::NotFound(format!("sheet '{}'", wanted))),
        }
    }

    fn grid(&self, range: &RangeRef) -> Result<&Values, UpstreamError> {
        let title = self.sheet_title(range)?;
        self.sheets
            .get(&title)
            .ok_or_else(|| UpstreamError::NotFound(format!("sheet '{}'", title)))
    }

    fn grid_mut(&mut self, range: &RangeRef) -> Result<&mut Values, UpstreamError> {
        let title = self.sheet_title(range)?;
        self.sheets
            .get_mut(&title)
            .ok_or_else(|| UpstreamError::NotFound(format!("sheet '{}'", title)))
    }

    fn size_bytes(&self) -> u64 {
        self.sheets.values().map(|g| values::size_bytes(g) as u64).sum()
    }
}

fn read_block(grid: &Values, range: &RangeRef) -> Values {
    let (rows, cols) = values::dimensions(grid);
    if rows == 0 || cols == 0 {
        return Values::new();
    }
    let row_end = (range.rows.end as usize).min(rows - 1);
    let col_end = (range.cols.end as usize).min(cols - 1);
    let mut out = Values::new();
    let mut r = range.rows.start as usize;
    while r <= row_end {
        let mut row = Vec::new();
        let mut c = range.cols.start as usize;
        while c <= col_end {
            row.push(values::cell_at(grid, r, c).clone());
            c += 1;
        }
        out.push(row);
        r += 1;
    }
    values::canonicalize(out)
}

fn write_cell(grid: &mut Values, row: usize, col: usize, value: CellValue) {
    if grid.len() <= row {
        grid.resize_with(row + 1, Vec::new);
    }
    let cells = &mut grid[row];
    if cells.len() <= col {
        cells.resize(col + 1, CellValue::Empty);
    }
    cells[col] = value;
}

/// Write `data` with its top-left corner at the top-left of `range`
fn write_block(grid: &mut Values, range: &RangeRef, data: &Values) -> u64 {
    let mut written = 0;
    for (dr, row) in data.iter().enumerate() {
        for (dc, cell) in row.iter().enumerate() {
            let r = range.rows.start as usize + dr;
            let c = range.cols.start as usize + dc;
            write_cell(grid, r, c, cell.clone());
            written += 1;
        }
    }
    let stored = std::mem::take(grid);
    *grid = values::canonicalize(stored);
    written
}

fn fits(range: &RangeRef, data: &Values) -> bool {
    let (rows, cols) = values::dimensions(data);
    let height_ok = range.height().map_or(true, |h| rows as u64 <= h as u64);
    let width_ok = range.width().map_or(true, |w| cols as u64 <= w as u64);
    height_ok && width_ok
}

#[derive(Debug, Default)]
struct MemoryState {
    workbooks: HashMap<String, Workbook>,
    snapshots: HashMap<String, (String, Workbook)>,
    revision: u64,
    apply_failures: VecDeque<UpstreamError>,
    fetch_failures: VecDeque<UpstreamError>,
    rejected: Vec<(String, RangeRef)>,
    size_overrides: HashMap<String, u64>,
    copy_failure: Option<UpstreamError>,
    restore_failure: Option<UpstreamError>,
    apply_log: Vec<(String, Vec<UpstreamRequest>)>,
}

impl MemoryState {
    fn workbook(&self, spreadsheet_id: &str) -> Result<&Workbook, UpstreamError> {
        self.workbooks
            .get(spreadsheet_id)
            .ok_or_else(|| UpstreamError::NotFound(format!("spreadsheet '{}'", spreadsheet_id)))
    }

    fn next_revision(&mut self) -> String {
        self.revision += 1;
        format!("rev-{}", self.revision)
    }

    fn is_rejected(&self, spreadsheet_id: &str, request: &UpstreamRequest) -> bool {
        let written = request.written_ranges();
        self.rejected.iter().any(|(sid, blocked)| {
            sid == spreadsheet_id && written.iter().any(|range| range.overlaps(blocked))
        })
    }

    fn apply_one(&mut self, spreadsheet_id: &str, request: &UpstreamRequest) -> RequestOutcome {
        if self.is_rejected(spreadsheet_id, request) {
            return Err(UpstreamError::Rejected(format!(
                "{} refused for protected range",
                request.kind()
            )));
        }

        let book = self
            .workbooks
            .get_mut(spreadsheet_id)
            .ok_or_else(|| UpstreamError::NotFound(format!("spreadsheet '{}'", spreadsheet_id)))?;

        let mut reply = ApplyReply::default();
        match request {
            UpstreamRequest::UpdateValues { data } => {
                for ValueRange { range, values } in data {
                    if !fits(range, values) {
                        return Err(UpstreamError::Rejected(format!(
                            "values do not fit in {}",
                            range
                        )));
                    }
                    book.grid(range)?;
                }
                for ValueRange { range, values } in data {
                    let grid = book.grid_mut(range)?;
                    reply.updated_cells += write_block(grid, range, values);
                    reply.updated_ranges.push(range.clone());
                }
            }
            UpstreamRequest::AppendRows { range, rows } => {
                let grid = book.grid_mut(range)?;
                let mut next_row = range.rows.start as usize;
                for (r, row) in grid.iter().enumerate().skip(next_row) {
                    let occupied = row
                        .iter()
                        .enumerate()
                        .any(|(c, cell)| range.cols.contains(c as u32) && !cell.is_empty());
                    if occupied {
                        next_row = r + 1;
                    }
                }
                let target = range.slice_rows(next_row as u32 - range.rows.start, rows.len() as u32);
                reply.updated_cells += write_block(grid, &target, rows);
                reply.updated_ranges.push(target);
            }
            UpstreamRequest::ClearValues { ranges } => {
                for range in ranges {
                    book.grid(range)?;
                }
                for range in ranges {
                    let grid = book.grid_mut(range)?;
                    for (r, row) in grid.iter_mut().enumerate() {
                        if !range.rows.contains(r as u32) {
                            continue;
                        }
                        for (c, cell) in row.iter_mut().enumerate() {
                            if range.cols.contains(c as u32) && !cell.is_empty() {
                                *cell = CellValue::Empty;
                                reply.updated_cells += 1;
                            }
                        }
                    }
                    let stored = std::mem::take(grid);
                    *grid = values::canonicalize(stored);
                    reply.updated_ranges.push(range.clone());
                }
            }
            UpstreamRequest::Format { range, .. } => {
                book.grid(range)?;
                reply.updated_cells = range.cell_count().unwrap_or(0);
                reply.updated_ranges.push(range.clone());
            }
            UpstreamRequest::CopyPaste {
                source,
                destination,
            } => {
                let block = read_block(book.grid(source)?, source);
                let grid = book.grid_mut(destination)?;
                reply.updated_cells += write_block(grid, destination, &block);
                reply.updated_ranges.push(destination.clone());
            }
        }

        reply.revision = Some(self.next_revision());
        Ok(reply)
    }
}

/// In-memory [`UpstreamClient`]
#[derive(Debug, Default)]
pub struct MemoryUpstream {
    state: Mutex<MemoryState>,
    latency: Mutex<Option<Duration>>,
    fetch_calls: AtomicU64,
    batch_fetch_calls: AtomicU64,
    apply_calls: AtomicU64,
    copy_calls: AtomicU64,
    restore_calls: AtomicU64,
    discard_calls: AtomicU64,
}

impl MemoryUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`MemoryUpstream::create_spreadsheet`]
    pub fn with_spreadsheet(self, spreadsheet_id: &str) -> Self {
        self.create_spreadsheet(spreadsheet_id);
        self
    }

    /// Create an empty spreadsheet holding one sheet, `Sheet1`
    pub fn create_spreadsheet(&self, spreadsheet_id: &str) {
        self.state
            .lock()
            .workbooks
            .entry(spreadsheet_id.to_string())
            .or_insert_with(Workbook::with_default_sheet);
    }

    pub fn add_sheet(&self, spreadsheet_id: &str, title: &str) {
        self.state
            .lock()
            .workbooks
            .entry(spreadsheet_id.to_string())
            .or_insert_with(Workbook::with_default_sheet)
            .sheets
            .entry(title.to_string())
            .or_default();
    }

    /// Write cells directly, as another client would. Not counted as a call.
    pub fn set_values(&self, spreadsheet_id: &str, range: &str, data: Values) -> EngineResult<()> {
        let range = RangeRef::parse(range)?;
        let mut state = self.state.lock();
        let book = state
            .workbooks
            .entry(spreadsheet_id.to_string())
            .or_insert_with(Workbook::with_default_sheet);
        let title = match &range.sheet {
            Some(title) => title.clone(),
            None => DEFAULT_SHEET.to_string(),
        };
        let grid = book.sheets.entry(title).or_default();
        write_block(grid, &range, &data);
        state.next_revision();
        Ok(())
    }

    /// Current contents of `range`. Not counted as a call.
    pub fn values(&self, spreadsheet_id: &str, range: &str) -> EngineResult<Values> {
        let range = RangeRef::parse(range)?;
        let state = self.state.lock();
        let grid = state
            .workbook(spreadsheet_id)
            .and_then(|book| book.grid(&range))
            .map_err(|e| crate::error::EngineError::upstream(spreadsheet_id, "inspect", e))?;
        Ok(read_block(grid, &range))
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = Some(latency);
    }

    /// Fail the next `apply` call as a whole
    pub fn push_apply_failure(&self, error: UpstreamError) {
        self.state.lock().apply_failures.push_back(error);
    }

    /// Fail the next `fetch` or `batch_fetch` call as a whole
    pub fn push_fetch_failure(&self, error: UpstreamError) {
        self.state.lock().fetch_failures.push_back(error);
    }

    /// Reject every sub-request that writes into `range`
    pub fn reject_writes_to(&self, spreadsheet_id: &str, range: &str) -> EngineResult<()> {
        let range = RangeRef::parse(range)?;
        self.state
            .lock()
            .rejected
            .push((spreadsheet_id.to_string(), range));
        Ok(())
    }

    pub fn clear_rejections(&self) {
        self.state.lock().rejected.clear();
    }

    pub fn set_size_override(&self, spreadsheet_id: &str, bytes: u64) {
        self.state
            .lock()
            .size_overrides
            .insert(spreadsheet_id.to_string(), bytes);
    }

    pub fn fail_copies(&self, error: Option<UpstreamError>) {
        self.state.lock().copy_failure = error;
    }

    pub fn fail_restores(&self, error: Option<UpstreamError>) {
        self.state.lock().restore_failure = error;
    }

    pub fn fetch_calls(&self) -> u64 {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn batch_fetch_calls(&self) -> u64 {
        self.batch_fetch_calls.load(Ordering::SeqCst)
    }

    pub fn apply_calls(&self) -> u64 {
        self.apply_calls.load(Ordering::SeqCst)
    }

    pub fn copy_calls(&self) -> u64 {
        self.copy_calls.load(Ordering::SeqCst)
    }

    pub fn restore_calls(&self) -> u64 {
        self.restore_calls.load(Ordering::SeqCst)
    }

    pub fn discard_calls(&self) -> u64 {
        self.discard_calls.load(Ordering::SeqCst)
    }

    /// Fetches, batch fetches and applies
    pub fn upstream_calls(&self) -> u64 {
        self.fetch_calls() + self.batch_fetch_calls() + self.apply_calls()
    }

    pub fn snapshot_count(&self) -> usize {
        self.state.lock().snapshots.len()
    }

    /// Every request list passed to `apply`, in call order
    pub fn applied_requests(&self) -> Vec<(String, Vec<UpstreamRequest>)> {
        self.state.lock().apply_log.clone()
    }

    pub fn reset_counters(&self) {
        for counter in [
            &self.fetch_calls,
            &self.batch_fetch_calls,
            &self.apply_calls,
            &self.copy_calls,
            &self.restore_calls,
            &self.discard_calls,
        ] {
            counter.store(0, Ordering::SeqCst);
        }
        self.state.lock().apply_log.clear();
    }

    async fn simulate_latency(&self) {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn read_range(&self, spreadsheet_id: &str, range: &RangeRef) -> Result<Values, UpstreamError> {
        let state = self.state.lock();
        let grid = state.workbook(spreadsheet_id)?.grid(range)?;
        Ok(read_block(grid, range))
    }
}

#[async_trait]
impl UpstreamClient for MemoryUpstream {
    async fn fetch(&self, spreadsheet_id: &str, range: &RangeRef) -> Result<Values, UpstreamError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        if let Some(err) = self.state.lock().fetch_failures.pop_front() {
            return Err(err);
        }
        self.read_range(spreadsheet_id, range)
    }

    async fn batch_fetch(
        &self,
        spreadsheet_id: &str,
        ranges: &[RangeRef],
    ) -> Result<Vec<Result<Values, UpstreamError>>, UpstreamError> {
        self.batch_fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        if let Some(err) = self.state.lock().fetch_failures.pop_front() {
            return Err(err);
        }
        self.state.lock().workbook(spreadsheet_id)?;
        Ok(ranges
            .iter()
            .map(|range| self.read_range(spreadsheet_id, range))
            .collect())
    }

    async fn apply(
        &self,
        spreadsheet_id: &str,
        requests: &[UpstreamRequest],
    ) -> Result<Vec<RequestOutcome>, UpstreamError> {
        self.apply_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;

        let mut state = self.state.lock();
        if let Some(err) = state.apply_failures.pop_front() {
            return Err(err);
        }
        state.workbook(spreadsheet_id)?;
        state
            .apply_log
            .push((spreadsheet_id.to_string(), requests.to_vec()));

        Ok(requests
            .iter()
            .map(|request| state.apply_one(spreadsheet_id, request))
            .collect())
    }

    async fn estimate_size(&self, spreadsheet_id: &str) -> Result<u64, UpstreamError> {
        let state = self.state.lock();
        if let Some(size) = state.size_overrides.get(spreadsheet_id) {
            return Ok(*size);
        }
        Ok(state.workbook(spreadsheet_id)?.size_bytes())
    }

    async fn copy(&self, spreadsheet_id: &str) -> Result<String, UpstreamError> {
        self.copy_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        let mut state = self.state.lock();
        if let Some(err) = state.copy_failure.clone() {
            return Err(err);
        }
        let copy = state.workbook(spreadsheet_id)?.clone();
        let snapshot_id = format!("snap-{}", uuid::Uuid::new_v4());
        state
            .snapshots
            .insert(snapshot_id.clone(), (spreadsheet_id.to_string(), copy));
        Ok(snapshot_id)
    }

    async fn restore(&self, spreadsheet_id: &str, snapshot_id: &str) -> Result<(), UpstreamError> {
        self.restore_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        let mut state = self.state.lock();
        if let Some(err) = state.restore_failure.clone() {
            return Err(err);
        }
        let (owner, book) = state
            .snapshots
            .get(snapshot_id)
            .cloned()
            .ok_or_else(|| UpstreamError::NotFound(format!("snapshot '{}'", snapshot_id)))?;
        if owner != spreadsheet_id {
            return Err(UpstreamError::SnapshotFailed(format!(
                "snapshot '{}' belongs to '{}'",
                snapshot_id, owner
            )));
        }
        state.workbooks.insert(owner, book);
        state.next_revision();
        Ok(())
    }

    async fn discard(&self, snapshot_id: &str) -> Result<(), UpstreamError> {
        self.discard_calls.fetch_add(1, Ordering::SeqCst);
        self.state
            .lock()
            .snapshots
            .remove(snapshot_id)
            .map(|_| ())
            .ok_or_else(|| UpstreamError::NotFound(format!("snapshot '{}'", snapshot_id)))
    }
}
