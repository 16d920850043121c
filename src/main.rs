mod archive;
mod conf;
mod db;
mod error;
mod ingest;
mod parser;

use std::path::PathBuf;
use std::time::Instant;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use parser::elements::ElementTable;

#[derive(Parser)]
#[command(name = "lise2db", about = "Load LISE++ fragment-separator logs into SQLite")]
struct Cli {
    /// Database file (overrides lise2db.toml and LISE2DB_DB_PATH)
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database schema
    Init,
    /// Ingest simulation logs, one transaction per file
    Ingest {
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Copy each ingested file under this directory
        #[arg(long)]
        archive_dir: Option<PathBuf>,
        /// Archive category directory (default: lpp)
        #[arg(long)]
        category: Option<String>,
        /// Print one JSON report per file
        #[arg(long)]
        json: bool,
    },
    /// Stored settings overview
    Settings {
        /// Only settings centred on this nuclide (e.g. "84Se")
        #[arg(short, long)]
        symbol: Option<String>,
        /// Max rows to display
        #[arg(short = 'n', long, default_value = "50")]
        limit: usize,
    },
    /// Isotope rows of one setting, highest yield first
    Isotopes { setting_id: i64 },
    /// Row counts
    Stats,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();
    let mut cfg = conf::load()?;
    if let Some(db) = cli.db {
        cfg.db_path = db;
    }

    let conn = db::connect(&cfg.db_path)?;
    db::init_schema(&conn)?;

    let result = match cli.command {
        Commands::Init => {
            println!("Schema ready at {:?}", cfg.db_path);
            Ok(())
        }
        Commands::Ingest {
            files,
            archive_dir,
            category,
            json,
        } => {
            let target = archive_dir.or(cfg.archive_dir).map(|root| ingest::ArchiveTarget {
                root,
                category: category.unwrap_or(cfg.archive_category),
            });
            let failed = ingest_files(&conn, &files, target.as_ref(), json)?;
            if failed > 0 {
                anyhow::bail!("{} of {} files failed", failed, files.len());
            }
            Ok(())
        }
        Commands::Settings { symbol, limit } => {
            let rows = db::fetch_settings(&conn, symbol.as_deref(), limit)?;
            if rows.is_empty() {
                println!("No settings stored.");
                return Ok(());
            }

            println!(
                "{:>5} | {:<8} | {:<8} | {:<5} | {:>6} | {:>9} | {:>8} | {:>9} | {:>4} | {:<19}",
                "id", "Centred", "Beam", "Model", "Coeff", "Intensity", "Brho1", "E1 MeV/u", "Iso", "Created"
            );
            println!("{}", "-".repeat(104));
            for r in &rows {
                println!(
                    "{:>5} | {:<8} | {:<8} | {:<5} | {:>6} | {:>9} | {:>8} | {:>9} | {:>4} | {:<19}",
                    r.id,
                    truncate(&r.symbol, 8),
                    truncate(&r.nuclide, 8),
                    truncate(&r.model, 5),
                    opt(r.coeff, 2),
                    opt(r.intensity, 1),
                    opt(r.brho_1, 4),
                    opt(r.energy_1, 2),
                    r.isotopes,
                    r.created_at,
                );
            }
            println!("\n{} settings", rows.len());
            Ok(())
        }
        Commands::Isotopes { setting_id } => {
            let rows = db::fetch_isotopes(&conn, setting_id)?;
            if rows.is_empty() {
                println!("No isotopes stored for setting {}.", setting_id);
                return Ok(());
            }

            println!(
                "{:<8} | {:>3} | {:>3} | {:>3} | {:>12} | {:>7} | {:>10} | {:>8}",
                "Isotope", "A", "Z", "N", "Yield pps", "%", "Sigma mb", "Trans %"
            );
            println!("{}", "-".repeat(76));
            for r in &rows {
                println!(
                    "{:<8} | {:>3} | {:>3} | {:>3} | {:>12.4e} | {:>7.3} | {:>10} | {:>8}",
                    r.name,
                    r.a,
                    r.z,
                    r.n,
                    r.production,
                    r.percent,
                    r.x_section.map(|v| format!("{:.3e}", v)).unwrap_or_else(|| "-".into()),
                    opt(r.transmission, 2),
                );
            }
            Ok(())
        }
        Commands::Stats => {
            let s = db::get_stats(&conn)?;
            println!("Settings:    {}", s.settings);
            println!("Isotopes:    {}", s.isotopes);
            println!("Ingest runs: {}", s.runs);
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

/// Ingest files in order. A failing file is logged and counted; it never
/// stops the batch. Returns the number of failures.
fn ingest_files(
    conn: &rusqlite::Connection,
    files: &[PathBuf],
    archive: Option<&ingest::ArchiveTarget>,
    json: bool,
) -> anyhow::Result<usize> {
    use indicatif::{ProgressBar, ProgressStyle};

    let elements = ElementTable::standard();
    let pb = if files.len() > 1 && !json {
        let pb = ProgressBar::new(files.len() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
                .progress_chars("#>-"),
        );
        pb
    } else {
        ProgressBar::hidden()
    };

    let mut failed = 0;
    let mut created = 0;
    let mut inserted = 0;
    for path in files {
        pb.set_message(path.display().to_string());
        match ingest::ingest_file(conn, path, &elements, archive) {
            Ok(report) => {
                created += usize::from(report.setting_created);
                inserted += report.rows_inserted;
                if json {
                    println!("{}", serde_json::to_string(&report)?);
                } else {
                    pb.suspend(|| report.print());
                }
            }
            Err(e) => {
                failed += 1;
                pb.suspend(|| error!(file = %path.display(), error = %format!("{:#}", e), "ingest failed"));
            }
        }
        pb.inc(1);
    }
    pb.finish_and_clear();

    info!(files = files.len(), failed, created, inserted, "batch complete");
    if !json {
        println!(
            "Ingested {} of {} files: {} new settings, {} new isotope rows.",
            files.len() - failed,
            files.len(),
            created,
            inserted
        );
    }
    Ok(failed)
}

fn opt(v: Option<f64>, prec: usize) -> String {
    v.map(|x| format!("{:.*}", prec, x)).unwrap_or_else(|| "-".into())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max).collect();
        format!("{}...", truncated)
    }
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
