//! Process-wide diagnostic logging.
//!
//! The runtime logs through `tracing`. This module installs the global
//! subscriber that decides where those logs go. Installation happens at most
//! once per process: later attempts fail with
//! [`LoggingError::AlreadyInitialized`] and leave the first configuration in
//! place. Reading the active configuration is safe from any thread.

use serde::Deserialize;
use std::fmt;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Mutex, OnceLock};
use thiserror::Error;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static ACTIVE: OnceLock<LogConfig> = OnceLock::new();

/// Errors raised while installing the log subscriber
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("Logging is already initialized")]
    AlreadyInitialized,

    #[error("Failed to open log file {path}: {source}")]
    OpenFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid log level: {0}")]
    InvalidLevel(String),
}

/// Where diagnostic logs are written
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum LogTarget {
    Stdout,
    Stderr,
    /// Appended to, created if missing
    File(PathBuf),
}

impl From<String> for LogTarget {
    fn from(value: String) -> Self {
        match value.as_str() {
            "stdout" => LogTarget::Stdout,
            "stderr" => LogTarget::Stderr,
            _ => LogTarget::File(PathBuf::from(value)),
        }
    }
}

impl From<&str> for LogTarget {
    fn from(value: &str) -> Self {
        LogTarget::from(value.to_string())
    }
}

impl From<PathBuf> for LogTarget {
    fn from(path: PathBuf) -> Self {
        LogTarget::File(path)
    }
}

impl fmt::Display for LogTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogTarget::Stdout => f.write_str("stdout"),
            LogTarget::Stderr => f.write_str("stderr"),
            LogTarget::File(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Minimum severity that gets logged
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(LoggingError::InvalidLevel(s.to_string())),
        }
    }
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

/// Log line format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Single-line human-readable output.
    #[default]
    Compact,

    /// One JSON object per line.
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub target: LogTarget,

    /// Log level filter.
    ///
    /// If None, uses RUST_LOG environment variable or defaults to "info".
    pub level: Option<LogLevel>,

    pub format: LogFormat,

    /// Include timestamps in output.
    pub timestamps: bool,
}

impl LogConfig {
    pub fn new(target: impl Into<LogTarget>) -> Self {
        Self {
            target: target.into(),
            level: None,
            format: LogFormat::Compact,
            timestamps: true,
        }
    }

    pub fn level(mut self, level: LogLevel) -> Self {
        self.level = Some(level);
        self
    }

    pub fn format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn timestamps(mut self, timestamps: bool) -> Self {
        self.timestamps = timestamps;
        self
    }

    fn filter(&self) -> EnvFilter {
        match self.level {
            Some(level) => EnvFilter::new(level.as_str()),
            None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        }
    }

    fn writer(&self) -> Result<BoxMakeWriter, LoggingError> {
        Ok(match &self.target {
            LogTarget::Stdout => BoxMakeWriter::new(std::io::stdout),
            LogTarget::Stderr => BoxMakeWriter::new(std::io::stderr),
            LogTarget::File(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|source| LoggingError::OpenFile {
                        path: path.clone(),
                        source,
                    })?;
                BoxMakeWriter::new(Mutex::new(file))
            }
        })
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self::new(LogTarget::Stderr)
    }
}

/// Install the process-wide log subscriber.
///
/// # Errors
///
/// - [`LoggingError::AlreadyInitialized`] if a global subscriber exists,
///   whether installed here or elsewhere in the process
/// - [`LoggingError::OpenFile`] if a file target cannot be opened
///
/// # Example
///
/// ```ignore
/// use plinth_host::logging::{self, LogConfig, LogLevel};
///
/// logging::init(LogConfig::new("stdout").level(LogLevel::Info))?;
/// ```
pub fn init(config: LogConfig) -> Result<(), LoggingError> {
    if ACTIVE.get().is_some() {
        return Err(LoggingError::AlreadyInitialized);
    }

    let writer = config.writer()?;
    let ansi = !matches!(config.target, LogTarget::File(_));

    let layer = match (config.format, config.timestamps) {
        (LogFormat::Compact, true) => tracing_subscriber::fmt::layer()
            .compact()
            .with_ansi(ansi)
            .with_writer(writer)
            .boxed(),
        (LogFormat::Compact, false) => tracing_subscriber::fmt::layer()
            .compact()
            .without_time()
            .with_ansi(ansi)
            .with_writer(writer)
            .boxed(),
        (LogFormat::Json, true) => tracing_subscriber::fmt::layer()
            .json()
            .with_writer(writer)
            .boxed(),
        (LogFormat::Json, false) => tracing_subscriber::fmt::layer()
            .json()
            .without_time()
            .with_writer(writer)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(layer.with_filter(config.filter()))
        .try_init()
        .map_err(|_| LoggingError::AlreadyInitialized)?;

    let _ = ACTIVE.set(config);
    Ok(())
}

/// Shorthand for [`init`] with a target and level.
pub fn set_log_file(target: impl Into<LogTarget>, level: LogLevel) -> Result<(), LoggingError> {
    init(LogConfig::new(target).level(level))
}

/// Configuration installed by [`init`], if any
pub fn active() -> Option<&'static LogConfig> {
    ACTIVE.get()
}

/// Install `config` unless logging is already set up.
///
/// Used when a plugin config carries log settings: the first plugin to open
/// wins and later ones keep the existing subscriber.
pub(crate) fn ensure_initialized(config: LogConfig) -> Result<(), LoggingError> {
    if let Some(existing) = active() {
        if *existing != config {
            tracing::warn!(
                active = %existing.target,
                requested = %config.target,
                "Logging already initialized; ignoring plugin log settings"
            );
        }
        return Ok(());
    }
    match init(config) {
        Err(LoggingError::AlreadyInitialized) => Ok(()),
        other => other,
    }
}
