use std::path::PathBuf;

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;

pub const CONFIG_FILE: &str = "lise2db";
pub const ENV_PREFIX: &str = "LISE2DB";

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct AppConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default)]
    pub archive_dir: Option<PathBuf>,
    #[serde(default = "default_category")]
    pub archive_category: String,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("data/settings.sqlite")
}

fn default_category() -> String {
    "lpp".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            db_path: default_db_path(),
            archive_dir: None,
            archive_category: default_category(),
        }
    }
}

/// Optional `lise2db.toml` in the working directory, overridden by
/// `LISE2DB_*` environment variables.
pub fn load() -> Result<AppConfig> {
    load_from(
        File::with_name(CONFIG_FILE).required(false),
        Environment::with_prefix(ENV_PREFIX),
    )
}

fn load_from<F>(file: F, env: Environment) -> Result<AppConfig>
where
    F: config::Source + Send + Sync + 'static,
{
    Config::builder()
        .add_source(file)
        .add_source(env)
        .build()
        .context("Failed to read configuration")?
        .try_deserialize()
        .context("Invalid configuration")
}

// ── Tests ──
