//! Structured logging setup.
//!
//! The runtime only emits `tracing` events: an `info` span per run, a
//! `debug` span per executed node, and planning and kernel-resolution
//! messages. Binaries and tests decide where they go by calling
//! [`init_logging`] once.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::{
    fmt::{format::FmtSpan, layer},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::error::CoreError;

/// Crates whose level follows [`LoggingConfig::runtime_level`].
const RUNTIME_TARGETS: [&str; 3] = ["mlinfer_core", "mlinfer_onnx", "mlinfer_runtime"];

/// Minimum severity of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Per-iteration detail, e.g. every Scan step
    Trace,
    /// Planning, kernel resolution and per-node spans
    Debug,
    /// One line per session build and run
    Info,
    /// Replaced kernels and old opsets
    Warn,
    /// Failures only
    Error,
}

impl LogLevel {
    fn as_level(self) -> Level {
        match self {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_level().as_str().to_ascii_lowercase())
    }
}

impl FromStr for LogLevel {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(CoreError::InvalidArgument(format!("unknown log level '{s}'"))),
        }
    }
}

/// Line layout of emitted events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human readable, one event per line
    #[default]
    Full,
    /// Like `Full` without timestamps, for test output and diffs
    Compact,
    /// JSON lines with the current run and node span attached
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Level for everything outside the mlinfer crates
    pub level: LogLevel,
    /// Level for the mlinfer crates; `None` follows `level`
    pub runtime_level: Option<LogLevel>,
    /// Event layout
    pub format: LogFormat,
    /// Emit an event when a run or node span closes, with its duration
    pub span_timings: bool,
    /// Include thread ids, useful when sessions run concurrently
    pub with_thread_ids: bool,
    /// Include file and line of each event
    pub with_source_location: bool,
    /// Write through the test harness so output is captured per test
    pub test_writer: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            runtime_level: None,
            format: LogFormat::Full,
            span_timings: false,
            with_thread_ids: false,
            with_source_location: false,
            test_writer: false,
        }
    }
}

impl LoggingConfig {
    /// Create a new logging configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the level outside the mlinfer crates.
    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    /// Set the level of the mlinfer crates.
    pub fn with_runtime_level(mut self, level: LogLevel) -> Self {
        self.runtime_level = Some(level);
        self
    }

    /// Set the event layout.
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Enable or disable span close timings.
    pub fn with_span_timings(mut self, enable: bool) -> Self {
        self.span_timings = enable;
        self
    }

    /// Enable or disable thread ids.
    pub fn with_thread_ids(mut self, enable: bool) -> Self {
        self.with_thread_ids = enable;
        self
    }

    /// Enable or disable source locations.
    pub fn with_source_location(mut self, enable: bool) -> Self {
        self.with_source_location = enable;
        self
    }

    /// Runtime debug output with node span timings, quiet dependencies.
    pub fn development() -> Self {
        Self {
            level: LogLevel::Warn,
            runtime_level: Some(LogLevel::Debug),
            span_timings: true,
            with_thread_ids: true,
            with_source_location: true,
            ..Self::default()
        }
    }

    /// JSON lines at info level, for log aggregation.
    pub fn production() -> Self {
        Self {
            format: LogFormat::Json,
            ..Self::default()
        }
    }

    /// Compact runtime debug output captured by the test harness.
    pub fn for_tests() -> Self {
        Self {
            level: LogLevel::Warn,
            runtime_level: Some(LogLevel::Debug),
            format: LogFormat::Compact,
            test_writer: true,
            ..Self::default()
        }
    }

    /// `EnvFilter` directives equivalent to this configuration.
    pub fn filter_directives(&self) -> String {
        let mut directives = self.level.to_string();
        if let Some(runtime) = self.runtime_level.filter(|&l| l != self.level) {
            for target in RUNTIME_TARGETS {
                directives.push_str(&format!(",{target}={runtime}"));
            }
        }
        directives
    }
}

/// Install the global subscriber.
///
/// `RUST_LOG` takes precedence over the configured levels. Returns `false`
/// when a subscriber was already installed, so tests may call it freely.
///
/// # Example
///
/// ```no_run
/// use mlinfer_core::logging::{init_logging, LoggingConfig};
///
/// init_logging(LoggingConfig::development());
/// ```
pub fn init_logging(config: LoggingConfig) -> bool {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.filter_directives()))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let span_events = if config.span_timings {
        FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    // The layer type changes with every builder call, so each branch
    // installs its own registry.
    let base = layer()
        .with_span_events(span_events)
        .with_thread_ids(config.with_thread_ids)
        .with_file(config.with_source_location)
        .with_line_number(config.with_source_location);
    let registry = tracing_subscriber::registry().with(env_filter);

    let result = match (config.format, config.test_writer) {
        (LogFormat::Json, false) => registry
            .with(base.json().with_current_span(true))
            .try_init(),
        (LogFormat::Json, true) => registry
            .with(base.json().with_current_span(true).with_test_writer())
            .try_init(),
        (LogFormat::Full, false) => registry.with(base).try_init(),
        (LogFormat::Full, true) => registry.with(base.with_test_writer()).try_init(),
        (LogFormat::Compact, false) => registry
            .with(base.without_time().compact())
            .try_init(),
        (LogFormat::Compact, true) => registry
            .with(base.without_time().compact().with_test_writer())
            .try_init(),
    };

    result.is_ok()
}

/// Initialize logging with default configuration.
pub fn init_default_logging() -> bool {
    init_logging(LoggingConfig::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directives() {
        let config = LoggingConfig::default();
        assert_eq!(config.format, LogFormat::Full);
        assert_eq!(config.filter_directives(), "info");
    }

    #[test]
    fn test_runtime_level_adds_targets() {
        let dev = LoggingConfig::development();
        assert_eq!(
            dev.filter_directives(),
            "warn,mlinfer_core=debug,mlinfer_onnx=debug,mlinfer_runtime=debug"
        );
        assert!(dev.span_timings);

        let same = LoggingConfig::new().with_runtime_level(LogLevel::Info);
        assert_eq!(same.filter_directives(), "info");
    }

    #[test]
    fn test_presets() {
        let prod = LoggingConfig::production();
        assert_eq!(prod.format, LogFormat::Json);
        assert_eq!(prod.runtime_level, None);

        let tests = LoggingConfig::for_tests();
        assert!(tests.test_writer);
        assert_eq!(tests.format, LogFormat::Compact);
    }

    #[test]
    fn test_level_parsing() {
        assert_eq!("WARNING".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!(LogLevel::Trace.to_string(), "trace");
        assert!("loud".parse::<LogLevel>().is_err());
    }

    #[test]
    fn test_config_from_json() {
        let config: LoggingConfig = serde_json::from_str(
            r#"{"runtime_level":"trace","format":"compact","span_timings":true}"#,
        )
        .unwrap();
        assert_eq!(config.level, LogLevel::Info);
        assert_eq!(config.runtime_level, Some(LogLevel::Trace));
        assert_eq!(config.format, LogFormat::Compact);
        assert!(config.span_timings);
    }

    #[test]
    fn test_second_init_is_rejected() {
        init_logging(LoggingConfig::for_tests());
        assert!(!init_default_logging());
    }
}
