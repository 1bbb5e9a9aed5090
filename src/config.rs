//! Process configuration from `SALAS_*` environment variables.

use std::path::PathBuf;

use chrono_tz::Tz;
use tracing::warn;

use crate::engine::Calendar;
use crate::rate::PeakBand;

#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub timezone: Tz,
    pub peak: PeakBand,
    pub metrics_port: Option<u16>,
    /// WAL appends between compactions.
    pub compact_threshold: u64,
}

impl Default for Config {
    fn default() -> Self {
        let calendar = Calendar::default();
        Self {
            data_dir: PathBuf::from("./data"),
            timezone: calendar.tz,
            peak: calendar.peak,
            metrics_port: None,
            compact_threshold: 1000,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Values that don't parse keep their default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let timezone = match lookup("SALAS_TIMEZONE") {
            Some(name) => name.parse::<Tz>().unwrap_or_else(|_| {
                warn!("unknown SALAS_TIMEZONE {name:?}, using {}", defaults.timezone);
                defaults.timezone
            }),
            None => defaults.timezone,
        };

        let start_hour = parsed(&lookup, "SALAS_PEAK_START").unwrap_or(defaults.peak.start_hour);
        let end_hour = parsed(&lookup, "SALAS_PEAK_END").unwrap_or(defaults.peak.end_hour);
        let peak = if start_hour < end_hour && end_hour <= 24 {
            PeakBand { start_hour, end_hour }
        } else {
            warn!("invalid peak band {start_hour}-{end_hour}, using {}-{}", defaults.peak.start_hour, defaults.peak.end_hour);
            defaults.peak
        };

        Self {
            data_dir: lookup("SALAS_DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir),
            timezone,
            peak,
            metrics_port: parsed(&lookup, "SALAS_METRICS_PORT"),
            compact_threshold: parsed(&lookup, "SALAS_COMPACT_THRESHOLD")
                .unwrap_or(defaults.compact_threshold),
        }
    }

    pub fn calendar(&self) -> Calendar {
        Calendar {
            tz: self.timezone,
            peak: self.peak,
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("salas.wal")
    }

    pub fn blob_dir(&self) -> PathBuf {
        self.data_dir.join("blobs")
    }
}

fn parsed<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("ignoring unparsable {key}={raw:?}");
            None
        }
    }
}
