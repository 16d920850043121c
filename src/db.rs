use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, ErrorCode, OptionalExtension, Transaction, TransactionBehavior};
use tracing::{debug, warn};

use crate::error::IngestError;
use crate::parser::isotopes::IsotopeRow;
use crate::parser::settings::{Configuration, FieldValue};

pub fn connect(path: &Path) -> Result<Connection> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {:?}", dir))?;
    }
    let conn = Connection::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS settings (
            id               INTEGER PRIMARY KEY AUTOINCREMENT,
            hash             TEXT NOT NULL UNIQUE,
            model            TEXT NOT NULL,
            coeff            REAL,
            nuclide          TEXT NOT NULL,
            intensity        REAL,
            symbol           TEXT NOT NULL,
            a                INTEGER NOT NULL,
            z                INTEGER NOT NULL,
            n                INTEGER NOT NULL,
            target_thickness REAL,
            wedge1_thickness REAL,
            wedge1_angle     REAL,
            wedge2_material  TEXT,
            wedge2_thickness REAL,
            wedge2_angle     REAL,
            brho_1 REAL, brho_2 REAL, brho_3 REAL, brho_4 REAL,
            brho_5 REAL, brho_6 REAL, brho_7 REAL, brho_8 REAL,
            energy_1 REAL, energy_2 REAL, energy_3 REAL, energy_4 REAL,
            energy_5 REAL, energy_6 REAL, energy_7 REAL, energy_8 REAL,
            dump_left  REAL, dump_right  REAL,
            f1_left    REAL, f1_right    REAL,
            f2_left    REAL, f2_right    REAL,
            f25x_left  REAL, f25x_right  REAL,
            f25y_left  REAL, f25y_right  REAL,
            f5_left    REAL, f5_right    REAL,
            f7_left    REAL, f7_right    REAL,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            CHECK (a = z + n)
        );
        CREATE INDEX IF NOT EXISTS idx_settings_symbol ON settings(symbol);

        CREATE TABLE IF NOT EXISTS isotopes (
            id               INTEGER PRIMARY KEY AUTOINCREMENT,
            setting_id       INTEGER NOT NULL REFERENCES settings(id),
            isotope_name     TEXT NOT NULL,
            a                INTEGER NOT NULL,
            z                INTEGER NOT NULL,
            n                INTEGER NOT NULL,
            yield            REAL NOT NULL,
            percent          REAL NOT NULL,
            x_section        REAL,
            transmission     REAL,
            transmission_f1  REAL,
            transmission_f2  REAL,
            transmission_f25 REAL,
            transmission_f5  REAL,
            transmission_f7  REAL,
            qratio_f3        REAL,
            qratio_f5        REAL,
            unreacted_f5     REAL,
            UNIQUE(setting_id, isotope_name),
            CHECK (a = z + n)
        );
        CREATE INDEX IF NOT EXISTS idx_isotopes_setting ON isotopes(setting_id);

        CREATE TABLE IF NOT EXISTS ingest_runs (
            id              INTEGER PRIMARY KEY,
            source_path     TEXT NOT NULL,
            setting_id      INTEGER NOT NULL REFERENCES settings(id),
            setting_created BOOLEAN NOT NULL,
            rows_parsed     INTEGER NOT NULL,
            rows_accepted   INTEGER NOT NULL,
            rows_inserted   INTEGER NOT NULL,
            rows_malformed  INTEGER NOT NULL,
            ingested_at     TEXT NOT NULL DEFAULT (datetime('now'))
        );
        ",
    )?;
    Ok(())
}

/// Open a write transaction that takes the database write lock up front, so
/// check-then-insert sequences inside it cannot interleave with another writer.
pub fn begin_write(conn: &Connection) -> Result<Transaction<'_>> {
    Ok(Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?)
}

// ── Settings ──

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Upsert {
    pub id: i64,
    pub created: bool,
}

fn sql_value(v: &FieldValue<'_>) -> SqlValue {
    match v {
        FieldValue::Text(s) => SqlValue::Text((*s).to_string()),
        FieldValue::Int(i) => SqlValue::Integer(i64::from(*i)),
        FieldValue::Captured(m) => SqlValue::Real(m.value),
        FieldValue::Derived(f) => SqlValue::Real(*f),
    }
}

pub fn find_setting_by_hash(conn: &Connection, hash: &str) -> Result<Option<i64>> {
    let id = conn
        .query_row("SELECT id FROM settings WHERE hash = ?1", [hash], |r| r.get(0))
        .optional()?;
    Ok(id)
}

/// Return the id of the stored configuration with the same content hash,
/// inserting it first if none exists. Never updates an existing row.
pub fn upsert_configuration(conn: &Connection, cfg: &Configuration) -> Result<Upsert> {
    let hash = cfg.content_hash();
    if let Some(id) = find_setting_by_hash(conn, &hash)? {
        debug!(setting_id = id, %hash, "configuration already stored");
        return Ok(Upsert { id, created: false });
    }
    insert_configuration(conn, cfg, hash)
}

/// Insert a configuration row under `hash`. When another writer stored the
/// same hash first, the UNIQUE constraint rejects the insert and the existing
/// id is returned instead.
fn insert_configuration(conn: &Connection, cfg: &Configuration, hash: String) -> Result<Upsert> {
    let columns = cfg.columns();
    let names: Vec<&str> = columns.iter().map(|(k, _)| *k).collect();
    let placeholders: Vec<String> = (1..=columns.len() + 1).map(|i| format!("?{}", i)).collect();
    let sql = format!(
        "INSERT INTO settings (hash, {}) VALUES ({})",
        names.join(", "),
        placeholders.join(", ")
    );
    let mut values = vec![SqlValue::Text(hash.clone())];
    values.extend(columns.iter().map(|(_, v)| sql_value(v)));

    match conn.execute(&sql, params_from_iter(values)) {
        Ok(_) => Ok(Upsert {
            id: conn.last_insert_rowid(),
            created: true,
        }),
        Err(rusqlite::Error::SqliteFailure(e, _))
            if e.code == ErrorCode::ConstraintViolation
                && e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE =>
        {
            warn!(%hash, "settings insert lost a uniqueness race; re-reading");
            match find_setting_by_hash(conn, &hash)? {
                Some(id) => Ok(Upsert { id, created: false }),
                None => Err(IngestError::StoreConflict { hash }.into()),
            }
        }
        Err(e) => Err(e).context("Failed to insert settings row"),
    }
}

// ── Isotopes ──

const INSERT_ISOTOPE: &str = "INSERT OR IGNORE INTO isotopes
     (setting_id, isotope_name, a, z, n, yield, percent, x_section, transmission,
      transmission_f1, transmission_f2, transmission_f25, transmission_f5, transmission_f7,
      qratio_f3, qratio_f5, unreacted_f5)
     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17)";

fn isotope_params(setting_id: i64, r: &IsotopeRow) -> [SqlValue; 17] {
    [
        SqlValue::Integer(setting_id),
        SqlValue::Text(r.name.clone()),
        SqlValue::Integer(i64::from(r.a)),
        SqlValue::Integer(i64::from(r.z)),
        SqlValue::Integer(i64::from(r.n)),
        SqlValue::Real(r.production),
        SqlValue::Real(r.percent),
        SqlValue::Real(r.x_section),
        SqlValue::Real(r.transmission),
        SqlValue::Real(r.transmission_f1),
        SqlValue::Real(r.transmission_f2),
        SqlValue::Real(r.transmission_f25),
        SqlValue::Real(r.transmission_f5),
        SqlValue::Real(r.transmission_f7),
        SqlValue::Real(r.qratio_f3),
        SqlValue::Real(r.qratio_f5),
        SqlValue::Real(r.unreacted_f5),
    ]
}

/// Insert one row unless (setting_id, isotope_name) is already stored.
/// Returns whether a row was written; existing values are kept as they are.
pub fn upsert_isotope_row(conn: &Connection, setting_id: i64, row: &IsotopeRow) -> Result<bool> {
    let mut stmt = conn.prepare_cached(INSERT_ISOTOPE)?;
    let n = stmt.execute(params_from_iter(isotope_params(setting_id, row)))?;
    Ok(n > 0)
}

/// Returns how many of `rows` were new.
pub fn insert_isotopes(conn: &Connection, setting_id: i64, rows: &[IsotopeRow]) -> Result<usize> {
    let mut count = 0;
    for r in rows {
        if upsert_isotope_row(conn, setting_id, r)? {
            count += 1;
        }
    }
    Ok(count)
}

// ── Run log ──

pub struct RunRecord<'a> {
    pub source_path: &'a str,
    pub setting_id: i64,
    pub setting_created: bool,
    pub rows_parsed: usize,
    pub rows_accepted: usize,
    pub rows_inserted: usize,
    pub rows_malformed: usize,
}

pub fn record_run(conn: &Connection, run: &RunRecord<'_>) -> Result<()> {
    conn.execute(
        "INSERT INTO ingest_runs
         (source_path, setting_id, setting_created, rows_parsed, rows_accepted, rows_inserted, rows_malformed)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            run.source_path,
            run.setting_id,
            run.setting_created,
            run.rows_parsed as i64,
            run.rows_accepted as i64,
            run.rows_inserted as i64,
            run.rows_malformed as i64,
        ],
    )?;
    Ok(())
}

// ── Overview ──

pub struct SettingSummary {
    pub id: i64,
    pub symbol: String,
    pub nuclide: String,
    pub model: String,
    pub coeff: Option<f64>,
    pub intensity: Option<f64>,
    pub brho_1: Option<f64>,
    pub energy_1: Option<f64>,
    pub isotopes: i64,
    pub created_at: String,
}

pub fn fetch_settings(
    conn: &Connection,
    symbol: Option<&str>,
    limit: usize,
) -> Result<Vec<SettingSummary>> {
    let sql = format!(
        "SELECT s.id, s.symbol, s.nuclide, s.model, s.coeff, s.intensity, s.brho_1, s.energy_1,
                (SELECT COUNT(*) FROM isotopes i WHERE i.setting_id = s.id), s.created_at
         FROM settings s
         WHERE (?1 IS NULL OR s.symbol = ?1)
         ORDER BY s.id
         LIMIT {}",
        limit
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([symbol], |row| {
            Ok(SettingSummary {
                id: row.get(0)?,
                symbol: row.get(1)?,
                nuclide: row.get(2)?,
                model: row.get(3)?,
                coeff: row.get(4)?,
                intensity: row.get(5)?,
                brho_1: row.get(6)?,
                energy_1: row.get(7)?,
                isotopes: row.get(8)?,
                created_at: row.get(9)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub struct StoredIsotope {
    pub name: String,
    pub a: u32,
    pub z: u32,
    pub n: u32,
    pub production: f64,
    pub percent: f64,
    pub x_section: Option<f64>,
    pub transmission: Option<f64>,
}

pub fn fetch_isotopes(conn: &Connection, setting_id: i64) -> Result<Vec<StoredIsotope>> {
    let mut stmt = conn.prepare(
        "SELECT isotope_name, a, z, n, yield, percent, x_section, transmission
         FROM isotopes
         WHERE setting_id = ?1
         ORDER BY yield DESC, isotope_name",
    )?;
    let rows = stmt
        .query_map([setting_id], |row| {
            Ok(StoredIsotope {
                name: row.get(0)?,
                a: row.get(1)?,
                z: row.get(2)?,
                n: row.get(3)?,
                production: row.get(4)?,
                percent: row.get(5)?,
                x_section: row.get(6)?,
                transmission: row.get(7)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ── Stats ──

pub struct Stats {
    pub settings: usize,
    pub isotopes: usize,
    pub runs: usize,
}

pub fn get_stats(conn: &Connection) -> Result<Stats> {
    let settings: usize = conn.query_row("SELECT COUNT(*) FROM settings", [], |r| r.get(0))?;
    let isotopes: usize = conn.query_row("SELECT COUNT(*) FROM isotopes", [], |r| r.get(0))?;
    let runs: usize = conn.query_row("SELECT COUNT(*) FROM ingest_runs", [], |r| r.get(0))?;
    Ok(Stats {
        settings,
        isotopes,
        runs,
    })
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::elements::ElementTable;
    use crate::parser::parse_source;
    use crate::parser::settings::Measured;

    fn memory_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys=ON;").unwrap();
        init_schema(&conn).unwrap();
        conn
    }

    fn fixture() -> (Configuration, Vec<IsotopeRow>) {
        let text = std::fs::read_to_string("tests/fixtures/84Se.lpp").unwrap();
        let parsed = parse_source(&text, &ElementTable::standard()).unwrap();
        (parsed.config, parsed.accepted)
    }

    fn count(conn: &Connection, sql: &str) -> i64 {
        conn.query_row(sql, [], |r| r.get(0)).unwrap()
    }

    #[test]
    fn schema_is_idempotent() {
        let conn = memory_db();
        init_schema(&conn).unwrap();
    }

    #[test]
    fn upsert_configuration_is_idempotent() {
        let conn = memory_db();
        let (cfg, _) = fixture();
        let first = upsert_configuration(&conn, &cfg).unwrap();
        let second = upsert_configuration(&conn, &cfg).unwrap();
        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.id, second.id);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM settings"), 1);
        let stored: String = conn
            .query_row("SELECT hash FROM settings WHERE id = ?1", [first.id], |r| r.get(0))
            .unwrap();
        assert_eq!(stored, cfg.content_hash());
    }

    #[test]
    fn distinct_configurations_get_distinct_ids() {
        let conn = memory_db();
        let (cfg, _) = fixture();
        let mut other = cfg.clone();
        other.intensity = Measured::parse("intensity", "51").unwrap();
        let a = upsert_configuration(&conn, &cfg).unwrap();
        let b = upsert_configuration(&conn, &other).unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM settings"), 2);
    }

    #[test]
    fn stored_values_match_configuration() {
        let conn = memory_db();
        let (cfg, _) = fixture();
        let up = upsert_configuration(&conn, &cfg).unwrap();
        let (symbol, a, z, n, brho, energy, mat): (String, u32, u32, u32, f64, f64, String) = conn
            .query_row(
                "SELECT symbol, a, z, n, brho_1, energy_1, wedge2_material FROM settings WHERE id = ?1",
                [up.id],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?, r.get(5)?, r.get(6)?)),
            )
            .unwrap();
        assert_eq!(symbol, "84Se");
        assert_eq!((a, z, n), (84, 34, 50));
        assert_eq!(brho, 3.1234);
        assert_eq!(energy, cfg.energy[0]);
        assert_eq!(mat, "C");
    }

    #[test]
    fn existing_hash_is_never_updated() {
        let conn = memory_db();
        let (cfg, _) = fixture();
        let hash = cfg.content_hash();
        // Stored by another writer; the stub values must survive.
        conn.execute(
            "INSERT INTO settings (hash, model, nuclide, symbol, a, z, n) VALUES (?1, '0', 'x', 'x', 0, 0, 0)",
            [&hash],
        )
        .unwrap();
        let id: i64 = conn.query_row("SELECT id FROM settings", [], |r| r.get(0)).unwrap();
        let up = upsert_configuration(&conn, &cfg).unwrap();
        assert_eq!(up, Upsert { id, created: false });
        let symbol: String = conn
            .query_row("SELECT symbol FROM settings WHERE id = ?1", [id], |r| r.get(0))
            .unwrap();
        assert_eq!(symbol, "x");
    }

    #[test]
    fn lost_insert_race_rereads_existing_id() {
        let conn = memory_db();
        let (cfg, _) = fixture();
        let hash = cfg.content_hash();
        // Another writer committed the same hash between lookup and insert.
        conn.execute(
            "INSERT INTO settings (hash, model, nuclide, symbol, a, z, n) VALUES (?1, '0', 'x', 'x', 0, 0, 0)",
            [&hash],
        )
        .unwrap();
        let id: i64 = conn.query_row("SELECT id FROM settings", [], |r| r.get(0)).unwrap();
        let up = insert_configuration(&conn, &cfg, hash).unwrap();
        assert_eq!(up, Upsert { id, created: false });
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM settings"), 1);
    }

    #[test]
    fn check_violation_is_not_a_conflict() {
        let conn = memory_db();
        let (mut cfg, _) = fixture();
        cfg.n = 0;
        let err = upsert_configuration(&conn, &cfg).unwrap_err();
        assert!(err.downcast_ref::<IngestError>().is_none());
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM settings"), 0);
    }

    #[test]
    fn isotope_rows_keep_first() {
        let conn = memory_db();
        let (cfg, rows) = fixture();
        let up = upsert_configuration(&conn, &cfg).unwrap();
        assert!(upsert_isotope_row(&conn, up.id, &rows[0]).unwrap());

        let mut changed = rows[0].clone();
        changed.production = 1.0;
        assert!(!upsert_isotope_row(&conn, up.id, &changed).unwrap());

        let stored: f64 = conn
            .query_row(
                "SELECT yield FROM isotopes WHERE setting_id = ?1 AND isotope_name = ?2",
                params![up.id, rows[0].name],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(stored, rows[0].production);
    }

    #[test]
    fn insert_isotopes_counts_new_rows() {
        let conn = memory_db();
        let (cfg, rows) = fixture();
        let up = upsert_configuration(&conn, &cfg).unwrap();
        assert_eq!(insert_isotopes(&conn, up.id, &rows).unwrap(), 2);
        assert_eq!(insert_isotopes(&conn, up.id, &rows).unwrap(), 0);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM isotopes"), 2);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM isotopes WHERE a != z + n"), 0);
    }

    #[test]
    fn isotopes_require_existing_setting() {
        let conn = memory_db();
        let (_, rows) = fixture();
        assert!(upsert_isotope_row(&conn, 999, &rows[0]).is_err());
    }

    #[test]
    fn overview_and_stats() {
        let conn = memory_db();
        let (cfg, rows) = fixture();
        let up = upsert_configuration(&conn, &cfg).unwrap();
        insert_isotopes(&conn, up.id, &rows).unwrap();
        record_run(
            &conn,
            &RunRecord {
                source_path: "84Se.lpp",
                setting_id: up.id,
                setting_created: true,
                rows_parsed: 5,
                rows_accepted: 2,
                rows_inserted: 2,
                rows_malformed: 1,
            },
        )
        .unwrap();

        let all = fetch_settings(&conn, None, 10).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].isotopes, 2);
        assert!(fetch_settings(&conn, Some("85Br"), 10).unwrap().is_empty());
        assert_eq!(fetch_settings(&conn, Some("84Se"), 10).unwrap().len(), 1);

        let iso = fetch_isotopes(&conn, up.id).unwrap();
        assert_eq!(iso[0].name, "84Se");
        assert_eq!(iso[1].name, "85Br");

        let s = get_stats(&conn).unwrap();
        assert_eq!((s.settings, s.isotopes, s.runs), (1, 2, 1));
    }
}
