//! Telemetry error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("Logging initialization failed: {0}")]
    LoggingInit(String),

    #[error("Notifier configuration error: {0}")]
    Notifier(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type TelemetryResult<T> = Result<T, TelemetryError>;
