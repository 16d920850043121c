use thiserror::Error;

/// Failures raised while turning a simulation log into store rows.
///
/// Configuration-level variants abort the file being ingested. `MalformedRow`
/// is only ever collected as a per-row diagnostic by the isotope extractor.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum IngestError {
    #[error("required field '{field}' not found in source")]
    MissingField { field: &'static str },
    #[error("unknown element symbol '{symbol}'")]
    UnknownSymbol { symbol: String },
    #[error("no element with atomic number {z}")]
    UnknownElement { z: u32 },
    #[error("field '{field}' has non-numeric value '{value}'")]
    InvalidNumber { field: &'static str, value: String },
    #[error("nuclide {symbol}: Z={z} exceeds A={a}")]
    InvalidNuclide { symbol: String, a: u32, z: u32 },
    #[error("settings row with hash {hash} vanished after a uniqueness conflict")]
    StoreConflict { hash: String },
    #[error("line {line}: {reason}")]
    MalformedRow { line: usize, reason: String },
}
