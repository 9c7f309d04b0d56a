// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! A1-notation ranges
//!
//! Supported forms: `A1`, `A1:B10`, `A:B` (whole columns), `3:5` (whole rows),
//! `A5:B` (open-ended rows), `C5:` (open to the end of the sheet on both
//! axes), `Sheet1!A1:B2`, `'My Sheet'!A1`, and a bare sheet title for the
//! whole sheet. `$` markers are accepted and ignored. A span may not pair a
//! bare column with a bare row (`1:A`).
//!
//! Rows and columns are stored zero-based and inclusive. An interval ending at
//! [`Interval::UNBOUNDED`] extends to the end of the sheet on that axis.

use nom::{
    branch::alt,
    bytes::complete::{is_not, tag, take_while1},
    character::complete::{alpha1, char, digit1},
    combinator::{all_consuming, map, map_res, opt, verify},
    multi::many0,
    sequence::{delimited, pair, preceded, terminated},
    IResult,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{EngineError, EngineResult};

/// Longest column label accepted (`ZZZ`)
const MAX_COLUMN_LETTERS: usize = 3;

/// Inclusive interval on one axis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Interval {
    pub start: u32,
    pub end: u32,
}

impl Interval {
    pub const UNBOUNDED: u32 = u32::MAX;
    pub const FULL: Interval = Interval {
        start: 0,
        end: Self::UNBOUNDED,
    };

    pub fn new(start: u32, end: u32) -> Self {
        if start <= end {
            Self { start, end }
        } else {
            Self {
                start: end,
                end: start,
            }
        }
    }

    pub fn single(index: u32) -> Self {
        Self {
            start: index,
            end: index,
        }
    }

    pub fn is_full(&self) -> bool {
        self.start == 0 && self.end == Self::UNBOUNDED
    }

    pub fn is_bounded(&self) -> bool {
        self.end != Self::UNBOUNDED
    }

    pub fn intersects(&self, other: &Interval) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    pub fn intersection(&self, other: &Interval) -> Option<Interval> {
        if self.intersects(other) {
            Some(Interval {
                start: self.start.max(other.start),
                end: self.end.min(other.end),
            })
        } else {
            None
        }
    }

    pub fn contains(&self, index: u32) -> bool {
        self.start <= index && index <= self.end
    }

    /// Number of indices, `None` when unbounded
    pub fn len(&self) -> Option<u32> {
        if self.is_bounded() {
            Some(self.end - self.start + 1)
        } else {
            None
        }
    }
}

/// A rectangular range on one sheet
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RangeRef {
    /// Sheet title; `None` means the range is unqualified
    pub sheet: Option<String>,
    pub rows: Interval,
    pub cols: Interval,
}

impl RangeRef {
    pub fn new(sheet: Option<String>, rows: Interval, cols: Interval) -> Self {
        Self { sheet, rows, cols }
    }

    /// Single cell at zero-based `row`, `col`
    pub fn cell(sheet: Option<&str>, row: u32, col: u32) -> Self {
        Self {
            sheet: sheet.map(str::to_string),
            rows: Interval::single(row),
            cols: Interval::single(col),
        }
    }

    /// The whole of `sheet`
    pub fn whole_sheet(sheet: &str) -> Self {
        Self {
            sheet: Some(sheet.to_string()),
            rows: Interval::FULL,
            cols: Interval::FULL,
        }
    }

    pub fn parse(input: &str) -> EngineResult<Self> {
        input.parse()
    }

    /// Canonical string form, used as the cache and fingerprint key
    pub fn key(&self) -> String {
        self.to_string()
    }

    /// Sheet titles compare case-insensitively; an unqualified range may refer
    /// to any sheet.
    pub fn same_sheet(&self, other: &RangeRef) -> bool {
        match (&self.sheet, &other.sheet) {
            (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
            _ => true,
        }
    }

    pub fn overlaps(&self, other: &RangeRef) -> bool {
        self.same_sheet(other)
            && self.rows.intersects(&other.rows)
            && self.cols.intersects(&other.cols)
    }

    pub fn intersection(&self, other: &RangeRef) -> Option<RangeRef> {
        if !self.same_sheet(other) {
            return None;
        }
        let rows = self.rows.intersection(&other.rows)?;
        let cols = self.cols.intersection(&other.cols)?;
        Some(RangeRef {
            sheet: self.sheet.clone().or_else(|| other.sheet.clone()),
            rows,
            cols,
        })
    }

    pub fn is_bounded(&self) -> bool {
        self.rows.is_bounded() && self.cols.is_bounded()
    }

    pub fn height(&self) -> Option<u32> {
        self.rows.len()
    }

    pub fn width(&self) -> Option<u32> {
        self.cols.len()
    }

    /// Number of cells, `None` for ranges open on either axis
    pub fn cell_count(&self) -> Option<u64> {
        Some(self.height()? as u64 * self.width()? as u64)
    }

    /// The same-shaped block directly below this one
    pub fn next_block_down(&self) -> Option<RangeRef> {
        let height = self.height()?;
        let start = self.rows.end.checked_add(1)?;
        let end = start.checked_add(height - 1)?;
        if end == Interval::UNBOUNDED {
            return None;
        }
        Some(RangeRef {
            sheet: self.sheet.clone(),
            rows: Interval::new(start, end),
            cols: self.cols,
        })
    }

    /// The same-shaped block directly to the right of this one
    pub fn next_block_right(&self) -> Option<RangeRef> {
        let width = self.width()?;
        let start = self.cols.end.checked_add(1)?;
        let end = start.checked_add(width - 1)?;
        if end == Interval::UNBOUNDED {
            return None;
        }
        Some(RangeRef {
            sheet: self.sheet.clone(),
            rows: self.rows,
            cols: Interval::new(start, end),
        })
    }

    /// Area an append into this range may touch: same columns, every row from
    /// the start of the range down.
    pub fn append_footprint(&self) -> RangeRef {
        RangeRef {
            sheet: self.sheet.clone(),
            rows: Interval {
                start: self.rows.start,
                end: Interval::UNBOUNDED,
            },
            cols: self.cols,
        }
    }

    /// `count` rows starting `offset` rows below the top of this range
    pub fn slice_rows(&self, offset: u32, count: u32) -> RangeRef {
        let start = self.rows.start.saturating_add(offset);
        let end = start.saturating_add(count.saturating_sub(1));
        RangeRef {
            sheet: self.sheet.clone(),
            rows: Interval::new(start, end),
            cols: self.cols,
        }
    }
}

/// Zero-based column index to label (`0` -> `A`, `26` -> `AA`)
pub fn column_label(index: u32) -> String {
    let mut n = index as u64 + 1;
    let mut label = Vec::new();
    while n > 0 {
        let rem = ((n - 1) % 26) as u8;
        label.push(b'A' + rem);
        n = (n - 1) / 26;
    }
    label.reverse();
    String::from_utf8(label).unwrap_or_default()
}

/// Column label to zero-based index (`A` -> `0`)
pub fn column_index(label: &str) -> u32 {
    label
        .bytes()
        .map(|b| (b.to_ascii_uppercase() - b'A' + 1) as u32)
        .fold(0, |acc, digit| acc * 26 + digit)
        - 1
}

/// Zero-based row index to its one-based label
fn row_label(index: u32) -> u64 {
    index as u64 + 1
}

fn needs_quoting(sheet: &str) -> bool {
    sheet.is_empty()
        || sheet.starts_with(|c: char| c.is_ascii_digit())
        || !sheet.chars().all(|c| c.is_alphanumeric() || c == '_')
}

impl fmt::Display for RangeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let whole_sheet = self.rows.is_full() && self.cols.is_full();

        if let Some(sheet) = &self.sheet {
            if needs_quoting(sheet) {
                write!(f, "'{}'", sheet.replace('\'', "''"))?;
            } else {
                write!(f, "{}", sheet)?;
            }
            if whole_sheet {
                return Ok(());
            }
            write!(f, "!")?;
        }

        if whole_sheet {
            return Ok(());
        }

        // An axis spanning the whole sheet is left out of the start corner
        if !self.cols.is_full() {
            write!(f, "{}", column_label(self.cols.start))?;
        }
        if !self.rows.is_full() {
            write!(f, "{}", row_label(self.rows.start))?;
        }
        if self.rows.start == self.rows.end && self.cols.start == self.cols.end {
            return Ok(());
        }

        // An unbounded axis is left out of the end corner
        write!(f, ":")?;
        if self.cols.is_bounded() {
            write!(f, "{}", column_label(self.cols.end))?;
        }
        if self.rows.is_bounded() {
            write!(f, "{}", row_label(self.rows.end))?;
        }
        Ok(())
    }
}

impl FromStr for RangeRef {
    type Err = EngineError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(EngineError::invalid_range(input, "empty range"));
        }

        match all_consuming(a1_range)(trimmed) {
            Ok((_, (sheet, span))) => build_range(input, sheet, span),
            Err(_) => {
                if let Ok((_, name)) = all_consuming(quoted_sheet_name)(trimmed) {
                    return Ok(RangeRef::whole_sheet(&name));
                }
                // A bare token that is not a cell reference names a whole sheet
                if !trimmed.contains('!') && !trimmed.contains(':') && !looks_like_cell(trimmed) {
                    return Ok(RangeRef::whole_sheet(trimmed));
                }
                Err(EngineError::invalid_range(input, "not valid A1 notation"))
            }
        }
    }
}

/// Column letters followed by row digits, e.g. `A0` or `$B$07`
fn looks_like_cell(token: &str) -> bool {
    let stripped: String = token.chars().filter(|c| *c != '$').collect();
    let letters = stripped.chars().take_while(|c| c.is_ascii_alphabetic()).count();
    let digits = &stripped[letters..];
    (1..=MAX_COLUMN_LETTERS).contains(&letters)
        && !digits.is_empty()
        && digits.chars().all(|c| c.is_ascii_digit())
}

/// One side of an A1 span; either part may be missing (`A`, `5`). Both are
/// missing only for the empty end of `C5:`.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Endpoint {
    col: Option<u32>,
    row: Option<u32>,
}

impl Endpoint {
    const OPEN: Endpoint = Endpoint {
        col: None,
        row: None,
    };

    fn column_only(&self) -> bool {
        self.col.is_some() && self.row.is_none()
    }

    fn row_only(&self) -> bool {
        self.row.is_some() && self.col.is_none()
    }
}

type Span = (Endpoint, Option<Endpoint>);

fn a1_range(input: &str) -> IResult<&str, (Option<String>, Option<Span>)> {
    pair(
        opt(terminated(sheet_name, char('!'))),
        opt(pair(
            endpoint,
            opt(preceded(
                char(':'),
                map(opt(endpoint), |end| end.unwrap_or(Endpoint::OPEN)),
            )),
        )),
    )(input)
}

fn sheet_name(input: &str) -> IResult<&str, String> {
    alt((
        quoted_sheet_name,
        map(take_while1(|c: char| c != '!' && c != '\''), str::to_string),
    ))(input)
}

fn quoted_sheet_name(input: &str) -> IResult<&str, String> {
    map(
        delimited(
            char('\''),
            many0(alt((is_not("'"), map(tag("''"), |_| "'")))),
            char('\''),
        ),
        |parts: Vec<&str>| parts.concat(),
    )(input)
}

fn endpoint(input: &str) -> IResult<&str, Endpoint> {
    let (rest, col) = opt(preceded(
        opt(char('$')),
        map(
            verify(alpha1, |letters: &str| {
                letters.len() <= MAX_COLUMN_LETTERS && letters.is_ascii()
            }),
            column_index,
        ),
    ))(input)?;
    let (rest, row) = opt(preceded(
        opt(char('$')),
        map_res(verify(digit1, |d: &str| !d.starts_with('0')), |d: &str| {
            d.parse::<u32>()
        }),
    ))(rest)?;

    if col.is_none() && row.is_none() {
        return Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::Verify,
        )));
    }

    Ok((
        rest,
        Endpoint {
            col,
            row: row.map(|r| r - 1),
        },
    ))
}

fn axis(start: Option<u32>, end: Option<u32>) -> Interval {
    match (start, end) {
        (None, None) => Interval::FULL,
        (Some(s), None) => Interval {
            start: s,
            end: Interval::UNBOUNDED,
        },
        (None, Some(e)) => Interval { start: 0, end: e },
        (Some(s), Some(e)) => Interval::new(s, e),
    }
}

fn build_range(input: &str, sheet: Option<String>, span: Option<Span>) -> EngineResult<RangeRef> {
    let (rows, cols) = match span {
        None => match &sheet {
            Some(_) => (Interval::FULL, Interval::FULL),
            None => return Err(EngineError::invalid_range(input, "empty range")),
        },
        Some((single, None)) => (
            single.row.map(Interval::single).unwrap_or(Interval::FULL),
            single.col.map(Interval::single).unwrap_or(Interval::FULL),
        ),
        Some((first, Some(second))) => {
            if (first.column_only() && second.row_only())
                || (first.row_only() && second.column_only())
            {
                return Err(EngineError::invalid_range(input, "mixed column and row span"));
            }
            (
                axis(first.row, second.row),
                axis(first.col, second.col),
            )
        }
    };

    if let Some(name) = &sheet {
        if name.is_empty() {
            return Err(EngineError::invalid_range(input, "empty sheet name"));
        }
    } else if rows.is_full() && cols.is_full() {
        return Err(EngineError::invalid_range(input, "unqualified range covers every sheet"));
    }

    Ok(RangeRef { sheet, rows, cols })
}
