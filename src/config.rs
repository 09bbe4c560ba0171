//! Server configuration, read from `PEERLINK_*` environment variables.

use std::path::PathBuf;
use std::str::FromStr;

use chrono::FixedOffset;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?}")]
    Invalid { var: &'static str, value: String },
    #[error("{0} is out of range")]
    OutOfRange(&'static str),
    #[error("PEERLINK_TLS_CERT and PEERLINK_TLS_KEY must be set together")]
    PartialTls,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    /// Shared password for every pgwire login.
    pub password: String,
    pub max_connections: usize,
    /// WAL appends between automatic compactions.
    pub compact_threshold: u64,
    /// Prometheus exporter port; disabled when unset.
    pub metrics_port: Option<u16>,
    pub tls: Option<TlsPaths>,
    /// Offset used for the calendar-date filter and rendered notification times.
    pub utc_offset_minutes: i32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 5433,
            data_dir: PathBuf::from("./data"),
            password: "peerlink".into(),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            tls: None,
            utc_offset_minutes: 0,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source. Unset variables take their
    /// defaults; set but malformed ones are errors.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let d = Config::default();

        let tls = match (lookup("PEERLINK_TLS_CERT"), lookup("PEERLINK_TLS_KEY")) {
            (None, None) => None,
            (Some(cert), Some(key)) => Some(TlsPaths {
                cert: cert.into(),
                key: key.into(),
            }),
            _ => return Err(ConfigError::PartialTls),
        };

        let max_connections: usize = parsed(&lookup, "PEERLINK_MAX_CONNECTIONS")?.unwrap_or(d.max_connections);
        if max_connections == 0 {
            return Err(ConfigError::OutOfRange("PEERLINK_MAX_CONNECTIONS"));
        }
        let utc_offset_minutes: i32 =
            parsed(&lookup, "PEERLINK_UTC_OFFSET_MINUTES")?.unwrap_or(d.utc_offset_minutes);
        if utc_offset_minutes.abs() >= 24 * 60 {
            return Err(ConfigError::OutOfRange("PEERLINK_UTC_OFFSET_MINUTES"));
        }

        Ok(Self {
            bind: lookup("PEERLINK_BIND").unwrap_or(d.bind),
            port: parsed(&lookup, "PEERLINK_PORT")?.unwrap_or(d.port),
            data_dir: lookup("PEERLINK_DATA_DIR").map_or(d.data_dir, PathBuf::from),
            password: lookup("PEERLINK_PASSWORD").unwrap_or(d.password),
            max_connections,
            compact_threshold: parsed(&lookup, "PEERLINK_COMPACT_THRESHOLD")?.unwrap_or(d.compact_threshold),
            metrics_port: parsed(&lookup, "PEERLINK_METRICS_PORT")?,
            tls,
            utc_offset_minutes,
        })
    }

    pub fn local_offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_minutes * 60).unwrap_or(crate::notify::utc())
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("peerlink.wal")
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parsed<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    let Some(value) = lookup(var) else { return Ok(None) };
    value
        .trim()
        .parse()
        .map(Some)
        .map_err(|_| ConfigError::Invalid { var, value })
}
