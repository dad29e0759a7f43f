use std::fmt::Display;
use std::io;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::engine::BusinessHours;

/// Daemon settings, read from `STUDIO_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    /// WAL appends before the compactor rewrites the log.
    pub compact_threshold: u64,
    pub reaper_interval: Duration,
    pub hours: BusinessHours,
}

impl Config {
    pub fn from_env() -> io::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> io::Result<Self> {
        let data_dir = lookup("STUDIO_DATA_DIR").unwrap_or_else(|| "./data".into());
        let metrics_port = match lookup("STUDIO_METRICS_PORT") {
            Some(raw) => Some(parse("STUDIO_METRICS_PORT", &raw)?),
            None => None,
        };
        let compact_threshold: u64 = parse_or(&lookup, "STUDIO_COMPACT_THRESHOLD", 1000)?;
        let reaper_secs: u64 = parse_or(&lookup, "STUDIO_REAPER_INTERVAL_SECS", 30)?;
        if compact_threshold == 0 || reaper_secs == 0 {
            return Err(invalid("compaction threshold and reaper interval must be positive"));
        }

        let hours = BusinessHours::new(
            parse_or(&lookup, "STUDIO_OPEN_HOUR", 9)?,
            parse_or(&lookup, "STUDIO_CLOSE_HOUR", 22)?,
            parse_or(&lookup, "STUDIO_SLOT_MINUTES", 60)?,
            parse_or(&lookup, "STUDIO_UTC_OFFSET_MINUTES", 0)?,
        )
        .map_err(invalid)?;

        Ok(Self {
            data_dir: PathBuf::from(data_dir),
            metrics_port,
            compact_threshold,
            reaper_interval: Duration::from_secs(reaper_secs),
            hours,
        })
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("studio.wal")
    }
}

fn invalid(msg: impl Display) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, msg.to_string())
}

fn parse<T: FromStr>(key: &str, raw: &str) -> io::Result<T>
where
    T::Err: Display,
{
    raw.trim()
        .parse()
        .map_err(|e| invalid(format!("{key}={raw:?}: {e}")))
}

fn parse_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> io::Result<T>
where
    T::Err: Display,
{
    match lookup(key) {
        Some(raw) => parse(key, &raw),
        None => Ok(default),
    }
}
