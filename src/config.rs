//! Configuration for the kvetch server.
//!
//! Settings come from an optional TOML file, then `KVETCH_*` environment
//! overrides, and are validated once before anything is opened.
//!
//! # Example Configuration
//!
//! ```toml
//! [server]
//! listen_addr = "0.0.0.0:7777"
//! metrics_addr = "0.0.0.0:9090"
//!
//! [store]
//! path = "/var/lib/kvetch/kvetch.redb"
//! discard_ratio = 0.5
//! reclamation_interval_secs = 300
//!
//! [logging]
//! format = "json"
//! level = "info"
//! with_spans = false
//! with_target = true
//! with_file = false
//! ```

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::constants;
use crate::error::{Error, Result};
use crate::logging::{LogConfig, LogFormat};

/// Root settings object.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub server: ServerSettings,
    pub store: StoreSettings,
    pub logging: LoggingSettings,
}

/// Network listeners.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerSettings {
    /// Address of the API listener.
    pub listen_addr: SocketAddr,
    /// Address of the Prometheus listener.
    pub metrics_addr: SocketAddr,
}

/// Engine and reclamation settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreSettings {
    /// Database file. Required unless `in_memory` is set.
    pub path: Option<PathBuf>,
    /// Use the in-memory engine; nothing is persisted.
    pub in_memory: bool,
    /// redb page cache size.
    pub cache_size_bytes: usize,
    /// Repair a file that was not closed cleanly instead of refusing to open it.
    pub allow_repair: bool,
    /// Minimum stale share for a segment to be rewritten.
    pub discard_ratio: f64,
    pub reclamation_interval_secs: u64,
    pub reclaim_segment_entries: usize,
    /// Batches buffered per subscriber before it is dropped as lagging.
    pub subscriber_buffer: usize,
}

/// Log output settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingSettings {
    pub format: LogFormat,
    /// Minimum level (`trace`, `debug`, `info`, `warn`, `error`).
    pub level: String,
    /// Log span open/close events.
    pub with_spans: bool,
    /// Include the module path of each event.
    pub with_target: bool,
    /// Include file name and line number.
    pub with_file: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen_addr: parse_default_addr(constants::DEFAULT_LISTEN_ADDR, 7777),
            metrics_addr: parse_default_addr(constants::DEFAULT_METRICS_ADDR, 9090),
        }
    }
}

fn parse_default_addr(addr: &str, port: u16) -> SocketAddr {
    addr.parse()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)))
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            path: None,
            in_memory: false,
            cache_size_bytes: constants::DEFAULT_CACHE_SIZE_BYTES,
            allow_repair: true,
            discard_ratio: constants::DEFAULT_DISCARD_RATIO,
            reclamation_interval_secs: constants::DEFAULT_RECLAMATION_INTERVAL_SECS,
            reclaim_segment_entries: constants::DEFAULT_RECLAIM_SEGMENT_ENTRIES,
            subscriber_buffer: constants::DEFAULT_SUBSCRIBER_BUFFER,
        }
    }
}

impl StoreSettings {
    pub const fn reclamation_interval(&self) -> Duration {
        Duration::from_secs(self.reclamation_interval_secs)
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            level: "info".to_string(),
            with_spans: false,
            with_target: true,
            with_file: false,
        }
    }
}

impl LoggingSettings {
    /// Builds the logging configuration, falling back to `info` on an
    /// unparseable level.
    pub fn to_log_config(&self) -> LogConfig {
        let level = tracing::Level::from_str(&self.level).unwrap_or(tracing::Level::INFO);
        LogConfig {
            format: self.format,
            level,
            with_spans: self.with_spans,
            with_target: self.with_target,
            with_file: self.with_file,
        }
    }
}

impl Settings {
    /// Loads settings from `path` (if given) and the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] listing every problem found: unreadable or
    /// malformed file, unparseable overrides and out-of-range values.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_env(path, |name| std::env::var(name).ok())
    }

    /// Like [`Settings::load`] with an explicit variable lookup.
    pub fn load_with_env(
        path: Option<&Path>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let mut settings = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        let mut problems = settings.apply_env(env);
        problems.extend(settings.problems());
        if !problems.is_empty() {
            return Err(invalid_settings(&problems));
        }

        if let Some(path) = path {
            tracing::debug!(path = %path.display(), "Loaded settings file");
        }
        Ok(settings)
    }

    /// Parses a TOML settings file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml(&content)
            .map_err(|e| Error::Config(format!("failed to parse {}: {e}", path.display())))
    }

    /// Parses settings from TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] on invalid TOML or unknown fields.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(e.to_string()))
    }

    /// Applies `KVETCH_*` overrides, returning one message per bad value.
    fn apply_env(&mut self, env: impl Fn(&str) -> Option<String>) -> Vec<String> {
        let mut problems = Vec::new();

        override_parsed(&env, "KVETCH_LISTEN_ADDR", &mut self.server.listen_addr, &mut problems);
        override_parsed(&env, "KVETCH_METRICS_ADDR", &mut self.server.metrics_addr, &mut problems);
        if let Some(path) = env("KVETCH_DATASTORE").filter(|p| !p.is_empty()) {
            self.store.path = Some(PathBuf::from(path));
        }
        override_parsed(&env, "KVETCH_IN_MEMORY", &mut self.store.in_memory, &mut problems);
        override_parsed(
            &env,
            "KVETCH_CACHE_SIZE_BYTES",
            &mut self.store.cache_size_bytes,
            &mut problems,
        );
        override_parsed(&env, "KVETCH_ALLOW_REPAIR", &mut self.store.allow_repair, &mut problems);
        override_parsed(&env, "KVETCH_DISCARD_RATIO", &mut self.store.discard_ratio, &mut problems);
        override_parsed(
            &env,
            "KVETCH_RECLAMATION_INTERVAL_SECS",
            &mut self.store.reclamation_interval_secs,
            &mut problems,
        );
        override_parsed(&env, "KVETCH_LOG_FORMAT", &mut self.logging.format, &mut problems);
        if let Some(level) = env("KVETCH_LOG_LEVEL") {
            self.logging.level = level;
        }

        problems
    }

    /// Value range and cross-field problems, one message each.
    fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        let store = &self.store;

        if self.server.listen_addr == self.server.metrics_addr {
            problems.push(format!(
                "server.listen_addr and server.metrics_addr must differ (both {})",
                self.server.listen_addr
            ));
        }
        if !store.in_memory && store.path.is_none() {
            problems.push(
                "store.path is required unless store.in_memory is set (or set KVETCH_DATASTORE)"
                    .to_string(),
            );
        }
        if store.cache_size_bytes == 0 {
            problems.push("store.cache_size_bytes must be greater than 0".to_string());
        }
        if !(0.0..=1.0).contains(&store.discard_ratio) {
            problems.push(format!(
                "store.discard_ratio must be within [0, 1] (got: {})",
                store.discard_ratio
            ));
        }
        if store.reclamation_interval_secs == 0 {
            problems.push("store.reclamation_interval_secs must be greater than 0".to_string());
        }
        if store.reclaim_segment_entries == 0 {
            problems.push("store.reclaim_segment_entries must be greater than 0".to_string());
        }
        if store.subscriber_buffer == 0 {
            problems.push("store.subscriber_buffer must be greater than 0".to_string());
        }
        if tracing::Level::from_str(&self.logging.level).is_err() {
            problems.push(format!(
                "logging.level '{}' is not one of trace, debug, info, warn, error",
                self.logging.level
            ));
        }

        problems
    }
}

fn invalid_settings(problems: &[String]) -> Error {
    Error::Config(format!("invalid settings:\n  - {}", problems.join("\n  - ")))
}

fn override_parsed<T: FromStr>(
    env: &impl Fn(&str) -> Option<String>,
    name: &str,
    target: &mut T,
    problems: &mut Vec<String>,
) {
    let Some(raw) = env(name) else {
        return;
    };
    match raw.trim().parse() {
        Ok(value) => *target = value,
        Err(_) => problems.push(format!("{name}: cannot parse '{raw}'")),
    }
}
