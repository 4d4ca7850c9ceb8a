//! Application error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Executor error: {0}")]
    Executor(#[from] sigex_executor::ExecutorError),

    #[error("Gate error: {0}")]
    Gate(#[from] sigex_gate::GateError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] sigex_persistence::PersistenceError),

    #[error("Telemetry error: {0}")]
    Telemetry(#[from] sigex_telemetry::TelemetryError),

    #[error("Signal feed error: {0}")]
    Feed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type AppResult<T> = Result<T, AppError>;
