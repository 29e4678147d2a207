//! Structured logging setup.
//!
//! The library itself only emits `tracing` events. Binaries and tests that want
//! to see them call [`init_logging`] once with a [`LoggingConfig`].
//! `RUST_LOG` takes precedence over the configured level when set.

use std::fs::OpenOptions;
use std::sync::Mutex;

use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::error::{ProtocolError, Result};

/// Install a global `tracing` subscriber described by `config`.
///
/// Fails if the log file can't be opened or a global subscriber is already set.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str().to_lowercase()));

    let writer = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| ProtocolError::ConfigError(format!("Failed to open log file: {e}")))?;
            BoxMakeWriter::new(Mutex::new(file))
        }
        None => BoxMakeWriter::new(std::io::stderr),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_target(true);

    let installed = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    installed.map_err(|e| ProtocolError::ConfigError(format!("Failed to install logger: {e}")))?;
    tracing::info!(app = %config.app_name, "Logging initialized");
    Ok(())
}
