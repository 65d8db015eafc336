//! Tracing subscriber initialization
//!
//! Human-readable output for development, one JSON object per line for log
//! shippers. The filter comes from `RUST_LOG` when set.

use crate::constants::{DEFAULT_LOG_FILTER, ENV_LOG_FORMAT};
use evalcycle_core::ConfigError;
use std::fmt;
use std::str::FromStr;
use tracing_subscriber::{fmt as fmt_layer, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log line format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl LogFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogFormat::Pretty => "pretty",
            LogFormat::Json => "json",
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogFormat {
    type Err = LogFormatParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => Err(LogFormatParseError(s.to_string())),
        }
    }
}

/// Error when parsing an invalid log format string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFormatParseError(pub String);

impl fmt::Display for LogFormatParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid log format: {}", self.0)
    }
}

impl std::error::Error for LogFormatParseError {}

/// Telemetry configuration from environment variables.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub log_format: LogFormat,
    /// Filter used when `RUST_LOG` is unset
    pub default_filter: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_format: LogFormat::default(),
            default_filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

impl TelemetryConfig {
    /// Read `EVALCYCLE_LOG_FORMAT`; unknown values fall back to pretty output.
    pub fn from_env() -> Self {
        let log_format = std::env::var(ENV_LOG_FORMAT)
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_default();
        Self {
            log_format,
            ..Self::default()
        }
    }
}

/// Install the global tracing subscriber.
///
/// Call once at startup. A second call fails because a global subscriber
/// is already set.
pub fn init_tracing(config: &TelemetryConfig) -> Result<(), ConfigError> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.default_filter))
        .map_err(|e| ConfigError::InvalidValue {
            field: "log_filter".to_string(),
            value: config.default_filter.clone(),
            reason: e.to_string(),
        })?;

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = match config.log_format {
        LogFormat::Pretty => registry.with(fmt_layer::layer().with_target(true)).try_init(),
        LogFormat::Json => registry
            .with(fmt_layer::layer().json().with_current_span(false))
            .try_init(),
    };

    result.map_err(|e| ConfigError::InvalidValue {
        field: "tracing_subscriber".to_string(),
        value: config.log_format.to_string(),
        reason: e.to_string(),
    })?;

    tracing::info!(log_format = %config.log_format, "Tracing initialized");
    Ok(())
}
