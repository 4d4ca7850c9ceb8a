//! Executor error types.

use sigex_core::CoreError;
use sigex_gate::GateError;
use sigex_persistence::PersistenceError;
use thiserror::Error;

use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Invalid order spec: {0}")]
    InvalidSpec(String),

    #[error("Market price unavailable for {0}")]
    MarketPriceUnavailable(String),

    #[error("Unknown instrument: {0}")]
    UnknownInstrument(String),

    #[error("Intent not found: {0}")]
    IntentNotFound(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Storage error: {0}")]
    Storage(#[from] PersistenceError),

    #[error("Gate error: {0}")]
    Gate(#[from] GateError),

    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] CoreError),
}

impl ExecutorError {
    /// Infrastructure errors; the operation can be retried on the next cycle.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Storage(e) => e.is_retryable(),
            Self::Gate(e) => e.is_retryable(),
            Self::Transport(e) => e.is_retryable(),
            _ => false,
        }
    }
}

pub type ExecutorResult<T> = Result<T, ExecutorError>;
