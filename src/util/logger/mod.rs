//! Logger module for pkgflow
//!
//! Compact `[LEVEL] thread: message` output on top of `tracing`.
//!
//! # Usage
//!
//! ```rust
//! use pkgflow::util::logger;
//!
//! logger::init();
//! tracing::info!("Hello, {}", "world");
//! ```

use std::str::FromStr;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer, Registry};

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level '{}'", other)),
        }
    }
}

/// Initialize logger with default configuration (INFO level)
pub fn init() {
    init_with_level(LogLevel::Info);
}

/// Initialize logger with custom level.
///
/// Panics if a global subscriber is already installed; use
/// [`try_init_with_level`] where that can happen.
pub fn init_with_level(level: LogLevel) {
    Registry::default().with(build_layer(level)).init();
}

/// Like [`init_with_level`], but returns `false` instead of panicking when a
/// subscriber is already installed (tests install one per binary).
pub fn try_init_with_level(level: LogLevel) -> bool {
    Registry::default().with(build_layer(level)).try_init().is_ok()
}

/// Initialize logger for debug use (DEBUG level)
pub fn init_debug() {
    init_with_level(LogLevel::Debug);
}

fn build_layer(level: LogLevel) -> impl Layer<Registry> {
    let filter = tracing_subscriber::filter::LevelFilter::from_level(level.into());

    // 不显示时间和模块路径；加载器是多线程的，所以显示线程名
    tracing_subscriber::fmt::layer()
        .without_time()
        .with_target(false)
        .with_level(true)
        .with_thread_names(true)
        .with_ansi(false)
        .compact()
        .with_filter(filter)
}
