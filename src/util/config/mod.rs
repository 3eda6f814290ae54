//! Loader configuration
//!
//! Every field has a serde default, so a config file only needs to name the
//! settings it changes.
//!
//! # Usage
//!
//! ```rust
//! use pkgflow::util::config::LoaderConfig;
//!
//! let config = LoaderConfig::from_toml_str("worker_threads = 2\nio_budget_bytes = 1048576").unwrap();
//! assert_eq!(config.worker_threads, 2);
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::object::ExportFilterFlags;
use crate::util::logger::LogLevel;

/// Which runtime the loaded objects are destined for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeTarget {
    Client,
    Server,
    #[default]
    Standalone,
}

impl RuntimeTarget {
    /// Whether an export carrying `filter` must be skipped on this target.
    pub fn excludes(
        &self,
        filter: ExportFilterFlags,
    ) -> bool {
        match self {
            RuntimeTarget::Client => filter.contains(ExportFilterFlags::NOT_FOR_CLIENT),
            RuntimeTarget::Server => filter.contains(ExportFilterFlags::NOT_FOR_SERVER),
            RuntimeTarget::Standalone => false,
        }
    }
}

/// Async loader configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoaderConfig {
    /// Worker threads; 0 runs everything cooperatively from `tick`
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    /// Capacity of each ready-work queue
    #[serde(default = "default_ready_queue_capacity")]
    pub ready_queue_capacity: usize,
    /// Upper bound on issued-but-not-completed payload bytes
    #[serde(default = "default_io_budget_bytes")]
    pub io_budget_bytes: u64,
    /// Runtime target used for export filtering
    #[serde(default)]
    pub target: RuntimeTarget,
    /// Hand finished roots to the collector's clustering hook
    #[serde(default)]
    pub create_clusters: bool,
    /// Abort the process on corrupt headers and export overruns
    #[serde(default = "default_abort_on_corruption")]
    pub abort_on_corruption: bool,
    /// How long `flush` parks between ticks when nothing is runnable
    #[serde(default = "default_flush_poll_interval_ms")]
    pub flush_poll_interval_ms: u64,
    /// Culture whose localized package overrides are applied at mount
    #[serde(default)]
    pub culture: Option<String>,
    /// Log level name for the CLI
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_worker_threads() -> usize {
    let parallelism = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2);
    parallelism.saturating_sub(1).clamp(1, 4)
}

fn default_ready_queue_capacity() -> usize {
    65536
}

fn default_io_budget_bytes() -> u64 {
    32 * 1024 * 1024
}

fn default_abort_on_corruption() -> bool {
    true
}

fn default_flush_poll_interval_ms() -> u64 {
    1
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            worker_threads: default_worker_threads(),
            ready_queue_capacity: default_ready_queue_capacity(),
            io_budget_bytes: default_io_budget_bytes(),
            target: RuntimeTarget::default(),
            create_clusters: false,
            abort_on_corruption: default_abort_on_corruption(),
            flush_poll_interval_ms: default_flush_poll_interval_ms(),
            culture: None,
            log_level: default_log_level(),
        }
    }
}

impl LoaderConfig {
    /// Parse a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(ConfigError::ParseError)
    }

    /// Render as TOML
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::SerializeError)
    }

    #[inline]
    pub fn flush_poll_interval(&self) -> Duration {
        Duration::from_millis(self.flush_poll_interval_ms.max(1))
    }

    /// Parsed log level, falling back to INFO for unknown names
    pub fn log_level(&self) -> LogLevel {
        self.log_level.parse().unwrap_or(LogLevel::Info)
    }
}

/// Load a loader configuration file
pub fn load_config(path: &Path) -> Result<LoaderConfig, ConfigError> {
    let content = fs::read_to_string(path).map_err(ConfigError::IoError)?;
    LoaderConfig::from_toml_str(&content)
}

/// Write a loader configuration file
pub fn save_config(
    config: &LoaderConfig,
    path: &Path,
) -> Result<(), ConfigError> {
    let content = config.to_toml_string()?;
    fs::write(path, content).map_err(ConfigError::IoError)
}

/// Configuration errors
#[derive(Debug)]
pub enum ConfigError {
    IoError(std::io::Error),
    ParseError(toml::de::Error),
    SerializeError(toml::ser::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        match self {
            ConfigError::IoError(e) => write!(f, "IO error: {}", e),
            ConfigError::ParseError(e) => write!(f, "Config parse error: {}", e),
            ConfigError::SerializeError(e) => write!(f, "Config serialize error: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}
