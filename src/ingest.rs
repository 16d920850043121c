use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rusqlite::Connection;
use serde::Serialize;
use tracing::{info, warn};

use crate::archive;
use crate::db;
use crate::parser::elements::ElementTable;
use crate::parser::parse_source;

/// Where ingested sources are copied after a successful write.
#[derive(Debug, Clone)]
pub struct ArchiveTarget {
    pub root: PathBuf,
    pub category: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub source: String,
    pub setting_id: i64,
    pub symbol: String,
    pub hash: String,
    pub setting_created: bool,
    pub rows_parsed: usize,
    pub rows_accepted: usize,
    pub rows_inserted: usize,
    pub rows_malformed: usize,
    pub archived_to: Option<PathBuf>,
}

impl IngestReport {
    pub fn print(&self) {
        let state = if self.setting_created { "new" } else { "existing" };
        println!(
            "{}: setting {} ({}, {}) | {} parsed, {} accepted, {} inserted, {} malformed",
            self.source,
            self.setting_id,
            self.symbol,
            state,
            self.rows_parsed,
            self.rows_accepted,
            self.rows_inserted,
            self.rows_malformed,
        );
    }
}

/// Parse one simulation log and write it in a single immediate transaction:
/// the configuration row (reused when the hash is already stored), then the
/// accepted isotope rows, then the run record. Nothing is written on error.
pub fn ingest_text(
    conn: &Connection,
    source: &str,
    text: &str,
    elements: &ElementTable,
) -> Result<IngestReport> {
    let parsed = parse_source(text, elements).with_context(|| format!("Failed to parse {}", source))?;
    let hash = parsed.config.content_hash();

    let tx = db::begin_write(conn)?;
    let up = db::upsert_configuration(&tx, &parsed.config)?;
    let inserted = db::insert_isotopes(&tx, up.id, &parsed.accepted)?;
    let report = IngestReport {
        source: source.to_string(),
        setting_id: up.id,
        symbol: parsed.config.symbol.clone(),
        hash,
        setting_created: up.created,
        rows_parsed: parsed.table.rows.len(),
        rows_accepted: parsed.accepted.len(),
        rows_inserted: inserted,
        rows_malformed: parsed.table.malformed.len(),
        archived_to: None,
    };
    db::record_run(
        &tx,
        &db::RunRecord {
            source_path: source,
            setting_id: report.setting_id,
            setting_created: report.setting_created,
            rows_parsed: report.rows_parsed,
            rows_accepted: report.rows_accepted,
            rows_inserted: report.rows_inserted,
            rows_malformed: report.rows_malformed,
        },
    )?;
    tx.commit()?;

    info!(
        setting_id = up.id,
        created = up.created,
        symbol = %report.symbol,
        accepted = report.rows_accepted,
        inserted,
        "ingested {}",
        source
    );
    if inserted < parsed.accepted.len() {
        info!(
            setting_id = up.id,
            skipped = parsed.accepted.len() - inserted,
            "isotope rows already stored"
        );
    }
    Ok(report)
}

pub fn ingest_file(
    conn: &Connection,
    path: &Path,
    elements: &ElementTable,
    archive: Option<&ArchiveTarget>,
) -> Result<IngestReport> {
    let text = std::fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
    let mut report = ingest_text(conn, &path.display().to_string(), &text, elements)?;

    if let Some(target) = archive {
        match archive::store_copy(&target.root, &target.category, &report.symbol, report.setting_id, path) {
            Ok(dest) => report.archived_to = Some(dest),
            // The rows are already committed; a failed copy is not a failed ingest.
            Err(e) => warn!(source = %path.display(), error = %e, "archive copy failed"),
        }
    }
    Ok(report)
}

// ── Tests ──
