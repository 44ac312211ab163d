//! Subscriber setup for the `sluice` binary.
//!
//! Library code only emits `tracing` events. The database layer logs via the
//! `log` facade, which is forwarded into the same subscriber.

use thiserror::Error;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter};

use crate::config::LogFormat;

#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("Invalid log filter: {0}")]
    Filter(String),

    #[error("A global subscriber is already installed: {0}")]
    AlreadyInstalled(String),
}

/// Installs the global subscriber. `RUST_LOG` overrides the `info` default.
pub fn init_logging(format: LogFormat) -> Result<(), LoggingError> {
    let filter = match std::env::var("RUST_LOG") {
        Ok(directives) if !directives.is_empty() => {
            EnvFilter::try_new(directives).map_err(|e| LoggingError::Filter(e.to_string()))?
        }
        _ => EnvFilter::new("info"),
    };

    let fmt_layer = fmt::layer().with_target(true);

    match format {
        LogFormat::Text => {
            let subscriber = tracing_subscriber::registry().with(filter).with(fmt_layer);
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| LoggingError::AlreadyInstalled(e.to_string()))?;
        }
        LogFormat::Json => {
            let subscriber = tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer.json());
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| LoggingError::AlreadyInstalled(e.to_string()))?;
        }
    }

    tracing_log::LogTracer::init().map_err(|e| LoggingError::AlreadyInstalled(e.to_string()))?;

    Ok(())
}
