//! Structured logging utilities for scopeline
//!
//! All logs use structured fields for easy parsing and analysis.
//!
//! # Log Format Conventions
//!
//! - `cache`: Name of the cache or composite involved
//! - `scope`: Scope name
//! - `key`: Scope key sequence number
//! - `operation`: The operation being performed (e.g., "get_scoped_data")
//! - `status`: The result status ("hit", "miss", "error")
//!
//! # Examples
//!
//! ```rust
//! use tracing::debug;
//!
//! # let name = "recolor";
//! # let seq = 7u64;
//! debug!(
//!     cache = %name,
//!     operation = "get_scoped_data",
//!     status = "hit",
//!     key = seq,
//!     "Scoped entry found"
//! );
//! ```

use std::{fmt as std_fmt, io};
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{
    fmt::{self, format::Writer},
    prelude::*,
    EnvFilter,
};

use crate::config::LoggingConfig;

/// Formatter that shows "scopeline" instead of the full module path
struct ScopelineFormatter {
    with_ansi: bool,
}

impl<S, N> FormatEvent<S, N> for ScopelineFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std_fmt::Result {
        let meta = event.metadata();

        write!(
            writer,
            "{} ",
            chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.6f")
        )?;

        if self.with_ansi {
            let level_style = match *meta.level() {
                tracing::Level::ERROR => "\x1b[31m",
                tracing::Level::WARN => "\x1b[33m",
                tracing::Level::INFO => "\x1b[32m",
                tracing::Level::DEBUG => "\x1b[34m",
                tracing::Level::TRACE => "\x1b[35m",
            };
            write!(writer, "{}{:5}(scopeline)\x1b[0m: ", level_style, meta.level())?;
        } else {
            write!(writer, "{:5}(scopeline): ", meta.level())?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

/// Log format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable format (default for development)
    Pretty,
    /// Compact format (for CI)
    Compact,
    /// JSON format (for log aggregation systems)
    Json,
}

impl LogFormat {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "json" => Some(Self::Json),
            "compact" => Some(Self::Compact),
            "pretty" => Some(Self::Pretty),
            _ => None,
        }
    }

    /// Parse from environment variable (SCOPELINE_LOG_FORMAT)
    pub fn from_env() -> Self {
        Self::from_env_or(None)
    }

    /// `SCOPELINE_LOG_FORMAT` if set, else `configured`, else pretty
    /// (compact under CI).
    pub fn from_env_or(configured: Option<LogFormat>) -> Self {
        let from_env = std::env::var("SCOPELINE_LOG_FORMAT")
            .ok()
            .and_then(|value| Self::parse(&value));

        from_env.or(configured).unwrap_or_else(|| {
            if std::env::var("CI").is_ok() {
                Self::Compact
            } else {
                Self::Pretty
            }
        })
    }
}

/// Initialize the global tracing subscriber
///
/// # Environment Variables
///
/// - `RUST_LOG`: Set log level (e.g., "debug", "scopeline=trace")
/// - `SCOPELINE_LOG_FORMAT`: Set format ("pretty", "compact", "json")
/// - `CI`: If set, defaults to compact format
pub fn init() {
    install(EnvFilter::try_from_default_env().ok(), "info", LogFormat::from_env());
}

/// Initialize from a `[logging]` config section. Environment variables
/// still win.
pub fn init_with(config: &LoggingConfig) {
    let format = LogFormat::from_env_or(LogFormat::parse(&config.format));
    install(EnvFilter::try_from_default_env().ok(), &config.level, format);
}

fn install(filter: Option<EnvFilter>, fallback_level: &str, format: LogFormat) {
    let filter = filter
        .or_else(|| EnvFilter::try_new(fallback_level).ok())
        .unwrap_or_else(|| EnvFilter::new("info"));

    let result = match format {
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .event_format(ScopelineFormatter { with_ansi: true })
                    .with_writer(io::stderr),
            )
            .try_init(),
        LogFormat::Compact => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .event_format(ScopelineFormatter { with_ansi: false })
                    .with_writer(io::stderr),
            )
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_file(false)
                    .with_line_number(false)
                    .with_ansi(false)
                    .with_writer(io::stderr)
                    .json(),
            )
            .try_init(),
    };

    // Already initialized (e.g. by an embedding application); keep theirs.
    let _ = result;
}

/// Standard field names for consistent logging
pub mod fields {
    /// Cache or composite name
    pub const CACHE: &str = "cache";
    /// Scope name
    pub const SCOPE: &str = "scope";
    /// Scope key sequence number
    pub const KEY: &str = "key";
    /// Operation name (e.g., "get_scoped_data", "process")
    pub const OPERATION: &str = "operation";
    /// Status (e.g., "hit", "miss", "error")
    pub const STATUS: &str = "status";
    /// Number of entries (for batch operations)
    pub const ENTRY_COUNT: &str = "entry_count";
}

/// Status values for consistent logging
pub mod status {
    pub const HIT: &str = "hit";
    pub const MISS: &str = "miss";
    pub const ERROR: &str = "error";
}
