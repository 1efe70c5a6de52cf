//! Tracing subscriber setup shared by both binaries.

use std::env;
use std::io::IsTerminal;
use std::str::FromStr;

use tracing_subscriber::EnvFilter;

use crate::error::{OperatorError, OperatorResult};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// JSON format for structured logging (ELK, Loki).
    Json,
    /// Human-readable pretty format with colors.
    Pretty,
    /// Compact single-line format.
    #[default]
    Compact,
}

impl FromStr for LogFormat {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "json" => Self::Json,
            "pretty" => Self::Pretty,
            "compact" => Self::Compact,
            _ => Self::default(),
        })
    }
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Output format.
    pub format: LogFormat,
    /// `EnvFilter` directives.
    pub filter: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            filter: "info,kube=warn".to_string(),
        }
    }
}

impl TelemetryConfig {
    /// Read configuration from the environment.
    ///
    /// - `RESCHEDULER_LOG_FORMAT`: "json", "pretty" or "compact". Defaults to
    ///   JSON when stdout is not a terminal.
    /// - `RESCHEDULER_LOG_LEVEL` or `RUST_LOG`: filter directives.
    pub fn from_env() -> Self {
        let format = env::var("RESCHEDULER_LOG_FORMAT")
            .ok()
            .and_then(|s| s.parse::<LogFormat>().ok())
            .unwrap_or_else(|| {
                if std::io::stdout().is_terminal() {
                    LogFormat::Pretty
                } else {
                    LogFormat::Json
                }
            });

        let filter = env::var("RESCHEDULER_LOG_LEVEL")
            .or_else(|_| env::var("RUST_LOG"))
            .unwrap_or_else(|_| Self::default().filter);

        Self { format, filter }
    }
}

/// Install the global subscriber.
pub fn init_tracing(config: &TelemetryConfig) -> OperatorResult<()> {
    let filter = EnvFilter::try_new(&config.filter)
        .map_err(|e| OperatorError::InvalidConfig(format!("log filter: {e}")))?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let result = match config.format {
        LogFormat::Json => builder.json().with_current_span(false).try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Compact => builder.compact().try_init(),
    };
    result.map_err(|e| OperatorError::InvalidConfig(format!("tracing: {e}")))
}
