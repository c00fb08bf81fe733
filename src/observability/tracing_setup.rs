/// Tracing and structured logging configuration
use std::fs::File;
use std::io;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Output format for logging
#[derive(Debug, Clone, Copy)]
pub enum OutputFormat {
    /// Human-readable format for development
    Human,
    /// JSON format for production/log aggregation
    Json,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(OutputFormat::Json),
            _ => Ok(OutputFormat::Human),
        }
    }
}

/// Initialize the tracing subscriber, writing to `log_path` when given and
/// stderr otherwise.
///
/// # Environment Variables
/// * `RUST_LOG` - log level filter (e.g. "filetracker=debug,tower=warn")
/// * `LOG_LEVEL` - default level when RUST_LOG is not set (default: "info")
/// * `LOG_FORMAT` - "json" for JSON output, anything else is human-readable
pub fn init_tracing(format: OutputFormat, log_path: Option<&Path>) -> io::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        EnvFilter::new(format!("filetracker={},tower=warn,axum=info", log_level))
    });

    let (writer, ansi) = match log_path {
        Some(path) => (BoxMakeWriter::new(Arc::new(File::create(path)?)), false),
        None => (BoxMakeWriter::new(io::stderr), true),
    };

    match format {
        OutputFormat::Human => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    fmt::layer()
                        .with_writer(writer)
                        .with_target(true)
                        .with_level(true)
                        .with_ansi(ansi),
                )
                .init();
        }
        OutputFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    fmt::layer()
                        .json()
                        .with_writer(writer)
                        .with_current_span(true)
                        .with_target(true)
                        .with_level(true),
                )
                .init();
        }
    }

    Ok(())
}

/// Initialize tracing with the format taken from `LOG_FORMAT`.
pub fn init_tracing_from_env(log_path: Option<&Path>) -> io::Result<()> {
    let format_str = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "human".to_string());
    let format = OutputFormat::from_str(&format_str).unwrap_or(OutputFormat::Human);
    init_tracing(format, log_path)
}
