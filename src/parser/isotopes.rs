use tracing::{debug, warn};

use super::elements::ElementTable;
use crate::error::IngestError;

pub const CALC_BANNER: &str =
    "{============================= Calculations ======================================}";
const CALC_HEADER: &str = "[Calculations]";

/// Minimum share of the total yield, in percent, for a row to be kept.
pub const MIN_PERCENT: f64 = 0.1;
/// Header tokens after the name that must all be identical.
pub const MARKER_FIELDS: usize = 8;
/// Columns the simulator writes per row; the highest index read is 232.
pub const MIN_COLUMNS: usize = 233;

/// Column offsets in the numeric list of a calculation row.
pub mod col {
    pub const YIELD: usize = 0;
    pub const X_SECTION: usize = 4;
    pub const TRANSMISSION: usize = 6;
    pub const F1_SLIT: usize = 41;
    pub const F2_SLIT: usize = 59;
    pub const F25_SLIT: usize = 69;
    pub const QRATIO_F3: usize = 133;
    pub const F5_SLIT: usize = 161;
    pub const UNREACTED_F5: usize = 166;
    pub const QRATIO_F5: usize = 180;
    pub const F7_SLIT: usize = 232;
}

/// A calculation line split into name, marker tokens and numbers.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRow {
    pub line: usize,
    pub name: String,
    pub markers: Vec<String>,
    pub values: Vec<f64>,
}

impl ParsedRow {
    pub fn production(&self) -> f64 {
        self.values[col::YIELD]
    }

    /// The simulator repeats the same token across the header when the row's
    /// derived quantities agree. Compared as text, not numerically.
    pub fn markers_consistent(&self) -> bool {
        if self.markers.len() < MARKER_FIELDS {
            return false;
        }
        let first = &self.markers[0];
        self.markers[..MARKER_FIELDS].iter().all(|m| m == first)
    }
}

/// One accepted yield record, ready to store.
#[derive(Debug, Clone, PartialEq)]
pub struct IsotopeRow {
    pub name: String,
    pub a: u32,
    pub z: u32,
    pub n: u32,
    pub production: f64,
    pub percent: f64,
    pub x_section: f64,
    pub transmission: f64,
    pub transmission_f1: f64,
    pub transmission_f2: f64,
    pub transmission_f25: f64,
    pub transmission_f5: f64,
    pub transmission_f7: f64,
    pub qratio_f3: f64,
    pub qratio_f5: f64,
    pub unreacted_f5: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Accepted(IsotopeRow),
    InconsistentMarkers,
    BelowThreshold { percent: f64 },
    Unresolved(IngestError),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IsotopeTable {
    pub rows: Vec<ParsedRow>,
    pub malformed: Vec<IngestError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockState {
    Before,
    Inside,
}

fn is_banner(line: &str) -> bool {
    let t = line.trim();
    t.starts_with("{=") && t.ends_with('}')
}

/// Split "106Nb" (or "Nb106") into (A, Z, N).
pub fn decompose(name: &str, elements: &ElementTable) -> Result<(u32, u32, u32), IngestError> {
    let symbol: String = name.chars().filter(|c| c.is_alphabetic()).collect();
    let digits: String = name.chars().filter(|c| c.is_ascii_digit()).collect();
    let a: u32 = digits.parse().map_err(|_| IngestError::InvalidNumber {
        field: "isotope_mass",
        value: name.to_string(),
    })?;
    let z = elements
        .atomic_number(&symbol)
        .ok_or(IngestError::UnknownSymbol { symbol })?;
    let n = a.checked_sub(z).ok_or_else(|| IngestError::InvalidNuclide {
        symbol: name.to_string(),
        a,
        z,
    })?;
    Ok((a, z, n))
}

fn parse_row(line_no: usize, line: &str) -> Result<ParsedRow, IngestError> {
    let malformed = |reason: String| IngestError::MalformedRow {
        line: line_no,
        reason,
    };
    let mut parts = line.split('=');
    let (Some(head), Some(body), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(malformed("expected exactly one '='".to_string()));
    };

    let mut tokens = head.split_whitespace();
    let name = tokens
        .next()
        .ok_or_else(|| malformed("missing isotope name".to_string()))?
        .to_string();
    let markers = tokens.map(str::to_string).collect();

    let mut fields: Vec<&str> = body.split(',').map(str::trim).collect();
    if fields.last().is_some_and(|f| f.is_empty()) {
        fields.pop();
    }
    let mut values = Vec::with_capacity(fields.len());
    for (i, f) in fields.iter().enumerate() {
        let v = f
            .parse::<f64>()
            .map_err(|_| malformed(format!("column {i}: '{f}' is not a number")))?;
        values.push(v);
    }
    if values.len() < MIN_COLUMNS {
        return Err(malformed(format!(
            "{} has {} columns, need {MIN_COLUMNS}",
            name,
            values.len()
        )));
    }

    Ok(ParsedRow {
        line: line_no,
        name,
        markers,
        values,
    })
}

/// Collect every row of the calculation block. Rows that do not split into a
/// name and a full numeric list are kept aside as diagnostics.
pub fn parse_block(lines: &[&str]) -> IsotopeTable {
    let mut table = IsotopeTable::default();
    let mut state = BlockState::Before;

    for (idx, line) in lines.iter().enumerate() {
        match state {
            BlockState::Before => {
                if line.contains(CALC_BANNER) {
                    state = BlockState::Inside;
                }
            }
            BlockState::Inside => {
                if line.contains(CALC_HEADER) {
                    continue;
                }
                if is_banner(line) {
                    break;
                }
                if !line.contains('=') {
                    continue;
                }
                match parse_row(idx + 1, line) {
                    Ok(row) => table.rows.push(row),
                    Err(e) => {
                        warn!(error = %e, "skipping calculation row");
                        table.malformed.push(e);
                    }
                }
            }
        }
    }
    table
}

impl IsotopeTable {
    /// Sum of yields over every parsed row, accepted or not.
    pub fn total_yield(&self) -> f64 {
        self.rows.iter().map(ParsedRow::production).sum()
    }

    pub fn classify(&self, elements: &ElementTable) -> Vec<(&ParsedRow, Verdict)> {
        let total = self.total_yield();
        self.rows
            .iter()
            .map(|row| (row, judge(row, total, elements)))
            .collect()
    }

    pub fn accepted(&self, elements: &ElementTable) -> Vec<IsotopeRow> {
        self.classify(elements)
            .into_iter()
            .filter_map(|(_, v)| match v {
                Verdict::Accepted(r) => Some(r),
                _ => None,
            })
            .collect()
    }
}

fn judge(row: &ParsedRow, total: f64, elements: &ElementTable) -> Verdict {
    if !row.markers_consistent() {
        debug!(isotope = %row.name, line = row.line, "marker fields differ");
        return Verdict::InconsistentMarkers;
    }
    let percent = if total > 0.0 {
        100.0 * row.production() / total
    } else {
        0.0
    };
    if percent.is_nan() || percent < MIN_PERCENT {
        return Verdict::BelowThreshold { percent };
    }
    let (a, z, n) = match decompose(&row.name, elements) {
        Ok(v) => v,
        Err(e) => {
            warn!(isotope = %row.name, line = row.line, error = %e, "unresolved isotope");
            return Verdict::Unresolved(e);
        }
    };
    let v = &row.values;
    Verdict::Accepted(IsotopeRow {
        name: row.name.clone(),
        a,
        z,
        n,
        production: v[col::YIELD],
        percent,
        x_section: v[col::X_SECTION],
        transmission: v[col::TRANSMISSION],
        transmission_f1: v[col::F1_SLIT],
        transmission_f2: v[col::F2_SLIT],
        transmission_f25: v[col::F25_SLIT],
        transmission_f5: v[col::F5_SLIT],
        transmission_f7: v[col::F7_SLIT],
        qratio_f3: v[col::QRATIO_F3],
        qratio_f5: v[col::QRATIO_F5],
        unreacted_f5: v[col::UNREACTED_F5],
    })
}

// ── Tests ──
