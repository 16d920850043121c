pub mod elements;
pub mod isotopes;
pub mod sections;
pub mod settings;

use tracing::debug;

use crate::error::IngestError;
use elements::ElementTable;
use isotopes::{IsotopeRow, IsotopeTable};
use settings::{Configuration, RawSettings};

/// Everything one simulation log yields before it touches the store.
#[derive(Debug, Clone)]
pub struct ParsedSource {
    pub config: Configuration,
    pub table: IsotopeTable,
    pub accepted: Vec<IsotopeRow>,
}

/// Two independent passes over the same lines: settings sections → one
/// configuration, calculation block → filtered isotope rows. A configuration
/// error fails the whole source; row errors stay in `table.malformed`.
pub fn parse_source(text: &str, elements: &ElementTable) -> Result<ParsedSource, IngestError> {
    let lines: Vec<&str> = text.lines().collect();
    let raw = RawSettings::extract(&lines);
    let config = settings::assemble(&raw, elements)?;
    let table = isotopes::parse_block(&lines);
    let accepted = table.accepted(elements);
    debug!(
        symbol = %config.symbol,
        rows = table.rows.len(),
        accepted = accepted.len(),
        malformed = table.malformed.len(),
        "parsed source"
    );
    Ok(ParsedSource {
        config,
        table,
        accepted,
    })
}

// ── Tests ──
