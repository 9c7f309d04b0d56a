// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Cell values and value grids

use serde::{Deserialize, Serialize};
use std::fmt;

/// A single cell as seen by the engine
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum CellValue {
    #[default]
    Empty,
    Bool(bool),
    Number(f64),
    Text(String),
    /// Formula source including the leading `=`
    Formula(String),
}

/// Row-major grid of cells
pub type Values = Vec<Vec<CellValue>>;

static EMPTY: CellValue = CellValue::Empty;

impl CellValue {
    /// Interpret user input the way a spreadsheet would
    pub fn parse_input(input: &str) -> Self {
        if input.is_empty() {
            return CellValue::Empty;
        }
        if input.starts_with('=') {
            return CellValue::Formula(input.to_string());
        }
        if input.eq_ignore_ascii_case("true") {
            return CellValue::Bool(true);
        }
        if input.eq_ignore_ascii_case("false") {
            return CellValue::Bool(false);
        }
        match input.trim().parse::<f64>() {
            Ok(n) if n.is_finite() => CellValue::Number(n),
            _ => CellValue::Text(input.to_string()),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, CellValue::Empty)
    }

    pub fn is_formula(&self) -> bool {
        matches!(self, CellValue::Formula(_))
    }

    /// Stable byte encoding used for fingerprints
    pub(crate) fn write_canonical(&self, out: &mut Vec<u8>) {
        match self {
            CellValue::Empty => out.push(0),
            CellValue::Bool(b) => {
                out.push(1);
                out.push(*b as u8);
            }
            CellValue::Number(n) => {
                out.push(2);
                out.extend_from_slice(canonical_number(*n).as_bytes());
            }
            CellValue::Text(s) => {
                out.push(3);
                out.extend_from_slice(s.as_bytes());
            }
            CellValue::Formula(s) => {
                out.push(4);
                out.extend_from_slice(s.as_bytes());
            }
        }
        out.push(0x1f);
    }

    /// Approximate in-memory size
    pub fn size_bytes(&self) -> usize {
        match self {
            CellValue::Empty | CellValue::Bool(_) => 1,
            CellValue::Number(_) => 8,
            CellValue::Text(s) | CellValue::Formula(s) => s.len(),
        }
    }
}

fn canonical_number(n: f64) -> String {
    if n == 0.0 {
        return "0".to_string();
    }
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellValue::Empty => Ok(()),
            CellValue::Bool(true) => write!(f, "TRUE"),
            CellValue::Bool(false) => write!(f, "FALSE"),
            CellValue::Number(n) => write!(f, "{}", canonical_number(*n)),
            CellValue::Text(s) | CellValue::Formula(s) => write!(f, "{}", s),
        }
    }
}

impl From<&str> for CellValue {
    fn from(value: &str) -> Self {
        CellValue::parse_input(value)
    }
}

impl From<String> for CellValue {
    fn from(value: String) -> Self {
        CellValue::parse_input(&value)
    }
}

impl From<f64> for CellValue {
    fn from(value: f64) -> Self {
        CellValue::Number(value)
    }
}

impl From<i64> for CellValue {
    fn from(value: i64) -> Self {
        CellValue::Number(value as f64)
    }
}

impl From<bool> for CellValue {
    fn from(value: bool) -> Self {
        CellValue::Bool(value)
    }
}

/// Build a grid from rows of anything convertible to a cell
pub fn grid<R, C>(rows: R) -> Values
where
    R: IntoIterator,
    R::Item: IntoIterator<Item = C>,
    C: Into<CellValue>,
{
    rows.into_iter()
        .map(|row| row.into_iter().map(Into::into).collect())
        .collect()
}

/// Drop trailing empty cells and trailing empty rows, the shape the upstream
/// API returns.
pub fn canonicalize(mut values: Values) -> Values {
    for row in values.iter_mut() {
        while row.last().is_some_and(CellValue::is_empty) {
            row.pop();
        }
    }
    while values.last().is_some_and(|row| row.is_empty()) {
        values.pop();
    }
    values
}

pub fn cell_at(values: &Values, row: usize, col: usize) -> &CellValue {
    values
        .get(row)
        .and_then(|r| r.get(col))
        .unwrap_or(&EMPTY)
}

/// (rows, widest row)
pub fn dimensions(values: &Values) -> (usize, usize) {
    let width = values.iter().map(Vec::len).max().unwrap_or(0);
    (values.len(), width)
}

pub fn non_empty_cells(values: &Values) -> u64 {
    values
        .iter()
        .flatten()
        .filter(|cell| !cell.is_empty())
        .count() as u64
}

pub fn formula_cells(values: &Values) -> u64 {
    values.iter().flatten().filter(|cell| cell.is_formula()).count() as u64
}

pub fn size_bytes(values: &Values) -> usize {
    values
        .iter()
        .map(|row| row.iter().map(CellValue::size_bytes).sum::<usize>() + 8)
        .sum()
}

/// Number of cells that differ between two grids, padding both with empties
pub fn diff_count(a: &Values, b: &Values) -> u64 {
    let (rows_a, cols_a) = dimensions(a);
    let (rows_b, cols_b) = dimensions(b);
    let rows = rows_a.max(rows_b);
    let cols = cols_a.max(cols_b);
    let mut changed = 0;
    for r in 0..rows {
        for c in 0..cols {
            if cell_at(a, r, c) != cell_at(b, r, c) {
                changed += 1;
            }
        }
    }
    changed
}

/// Number of differing cells where either side holds a formula
pub fn formula_diff_count(a: &Values, b: &Values) -> u64 {
    let (rows_a, cols_a) = dimensions(a);
    let (rows_b, cols_b) = dimensions(b);
    let mut changed = 0;
    for r in 0..rows_a.max(rows_b) {
        for c in 0..cols_a.max(cols_b) {
            let (x, y) = (cell_at(a, r, c), cell_at(b, r, c));
            if x != y && (x.is_formula() || y.is_formula()) {
                changed += 1;
            }
        }
    }
    changed
}
