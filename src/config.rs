use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::limits::DEFAULT_LOCK_TIMEOUT_MS;

pub const WAL_FILE_NAME: &str = "clinicq.wal";

/// Server settings, read from `CLINICQ_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    pub lock_timeout: Duration,
    /// WAL appends since the last compaction before the compactor rewrites it.
    pub compact_threshold: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 8080,
            data_dir: PathBuf::from("./data"),
            metrics_port: None,
            lock_timeout: Duration::from_millis(DEFAULT_LOCK_TIMEOUT_MS),
            compact_threshold: 1000,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unparsable numbers fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        fn parsed<T: FromStr>(value: Option<String>) -> Option<T> {
            value.and_then(|s| s.trim().parse().ok())
        }

        let defaults = Self::default();
        Self {
            bind: lookup("CLINICQ_BIND").unwrap_or(defaults.bind),
            port: parsed(lookup("CLINICQ_PORT")).unwrap_or(defaults.port),
            data_dir: lookup("CLINICQ_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            metrics_port: parsed(lookup("CLINICQ_METRICS_PORT")),
            lock_timeout: parsed(lookup("CLINICQ_LOCK_TIMEOUT_MS"))
                .map(Duration::from_millis)
                .unwrap_or(defaults.lock_timeout),
            compact_threshold: parsed(lookup("CLINICQ_COMPACT_THRESHOLD"))
                .unwrap_or(defaults.compact_threshold),
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join(WAL_FILE_NAME)
    }
}
