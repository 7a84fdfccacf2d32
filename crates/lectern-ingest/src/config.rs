//! Configuration loaded from environment variables.

use std::path::PathBuf;
use std::time::Duration;

use crate::{Error, Result};

/// Separator between content filter patterns. Regexes may contain commas.
pub const FILTER_SEPARATOR: &str = ";;";

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database path.
    pub db_path: PathBuf,

    /// Local signing identity, `nsec` or hex. `None` runs with a throwaway key.
    pub secret_key: Option<String>,

    /// Regex patterns marking notes as garbage.
    pub filters: Vec<String>,

    /// Notes stored longer than this many days are purged at startup. 0 keeps
    /// everything.
    pub retention_days: u32,

    /// Time between periodic syncs.
    pub sync_interval: Duration,

    /// Relays to seed an empty relay table with.
    pub relays: Vec<String>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Optional:
    /// - `LECTERN_DB_PATH`: SQLite path (default: "./data/lectern.db")
    /// - `LECTERN_SECRET_KEY`: nsec or hex secret key
    /// - `LECTERN_FILTERS`: content filter regexes separated by `;;`
    /// - `LECTERN_RETENTION_DAYS`: retention window (default: 30, 0 disables)
    /// - `LECTERN_SYNC_INTERVAL_MINUTES`: sync interval (default: 5, minimum 1)
    /// - `LECTERN_RELAYS`: comma-separated relay URLs
    pub fn from_env() -> Result<Self> {
        let db_path = std::env::var("LECTERN_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data/lectern.db"));

        let secret_key = std::env::var("LECTERN_SECRET_KEY")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        let filters: Vec<String> = std::env::var("LECTERN_FILTERS")
            .unwrap_or_default()
            .split(FILTER_SEPARATOR)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let retention_days = parse_var("LECTERN_RETENTION_DAYS", 30u32)?;

        let interval_minutes = parse_var("LECTERN_SYNC_INTERVAL_MINUTES", 5u64)?.max(1);

        let relays: Vec<String> = std::env::var("LECTERN_RELAYS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        tracing::info!(
            db_path = %db_path.display(),
            has_secret_key = secret_key.is_some(),
            filters = filters.len(),
            retention_days,
            interval_minutes,
            relays = relays.len(),
            "configuration loaded"
        );

        Ok(Self {
            db_path,
            secret_key,
            filters,
            retention_days,
            sync_interval: Duration::from_secs(interval_minutes * 60),
            relays,
        })
    }
}

fn parse_var<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("{} must be a number: {}", name, e))),
        _ => Ok(default),
    }
}
