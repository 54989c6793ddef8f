//! Tracing setup for applications embedding the engine
//!
//! The engine itself only emits `tracing` events. `init` is for binaries
//! and tests that want them printed or written to rolling files.

use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::LoggingConfig;

/// How events are rendered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    /// One JSON object per event
    Json,
    Compact,
}

impl LogFormat {
    /// Unknown values fall back to `Pretty`
    pub fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "json" => LogFormat::Json,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Pretty,
        }
    }

    /// Read `LOG_FORMAT`
    pub fn from_env() -> Self {
        std::env::var("LOG_FORMAT")
            .map(|v| Self::parse(&v))
            .unwrap_or(LogFormat::Pretty)
    }
}

/// Where events go
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOutput {
    Stdout,
    /// `stratum.log.<date>` under the configured directory
    File,
    Both,
}

impl LogOutput {
    /// Unknown values fall back to `Stdout`
    pub fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "file" => LogOutput::File,
            "both" => LogOutput::Both,
            _ => LogOutput::Stdout,
        }
    }

    /// Read `LOG_OUTPUT`
    pub fn from_env() -> Self {
        std::env::var("LOG_OUTPUT")
            .map(|v| Self::parse(&v))
            .unwrap_or(LogOutput::Stdout)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("Invalid log filter: {0}")]
    Filter(#[from] tracing_subscriber::filter::ParseError),

    #[error("Failed to create log directory: {0}")]
    Io(#[from] std::io::Error),

    #[error("Logging already initialized: {0}")]
    Init(#[from] tracing_subscriber::util::TryInitError),
}

/// Install the global subscriber described by `config`.
///
/// `RUST_LOG` wins over `config.level` when set. Fails if a global
/// subscriber is already installed.
pub fn init(config: &LoggingConfig) -> Result<(), LoggingError> {
    let format = LogFormat::parse(&config.format);
    let output = LogOutput::parse(&config.output);

    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level)?,
    }
    .add_directive("duckdb=warn".parse()?);

    let stdout_layer = match format {
        LogFormat::Pretty => fmt::layer()
            .pretty()
            .with_thread_ids(true)
            .with_target(true)
            .boxed(),
        LogFormat::Json => fmt::layer().json().with_current_span(true).boxed(),
        LogFormat::Compact => fmt::layer().compact().boxed(),
    };

    let file_layer = if matches!(output, LogOutput::File | LogOutput::Both) {
        std::fs::create_dir_all(&config.directory)?;
        let file_appender =
            RollingFileAppender::new(Rotation::DAILY, &config.directory, "stratum.log");
        Some(
            fmt::layer()
                .with_writer(file_appender)
                .with_ansi(false)
                .boxed(),
        )
    } else {
        None
    };

    let stdout_layer = match output {
        LogOutput::File => None,
        LogOutput::Stdout | LogOutput::Both => Some(stdout_layer),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()?;

    tracing::info!(format = ?format, output = ?output, "Logging initialized");
    Ok(())
}

/// Emit an event tagged `event = <name>` with debug-formatted fields.
///
/// ```ignore
/// log_event!(level: tracing::Level::INFO, event: "batch_cached", query_id: qid, records: 100);
/// ```
#[macro_export]
macro_rules! log_event {
    (level: $level:expr, event: $event:expr $(, $key:ident: $value:expr)* $(,)?) => {
        tracing::event!(
            $level,
            event = $event
            $(, $key = ?$value)*
        );
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parse() {
        assert_eq!(LogFormat::parse("json"), LogFormat::Json);
        assert_eq!(LogFormat::parse("compact"), LogFormat::Compact);
        assert_eq!(LogFormat::parse("pretty"), LogFormat::Pretty);
        assert_eq!(LogFormat::parse("JSON"), LogFormat::Json);
        assert_eq!(LogFormat::parse("anything"), LogFormat::Pretty);
    }

    #[test]
    fn test_log_output_parse() {
        assert_eq!(LogOutput::parse("file"), LogOutput::File);
        assert_eq!(LogOutput::parse("both"), LogOutput::Both);
        assert_eq!(LogOutput::parse("stdout"), LogOutput::Stdout);
        assert_eq!(LogOutput::parse(""), LogOutput::Stdout);
    }
}
