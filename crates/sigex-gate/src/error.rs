//! Gate error types.

use sigex_persistence::PersistenceError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GateError {
    /// Storage could not be reached; drop the signal and re-evaluate next cycle.
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Storage error: {0}")]
    Storage(PersistenceError),
}

impl GateError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StorageUnavailable(_))
    }
}

impl From<PersistenceError> for GateError {
    fn from(e: PersistenceError) -> Self {
        if e.is_retryable() {
            Self::StorageUnavailable(e.to_string())
        } else {
            Self::Storage(e)
        }
    }
}

pub type GateResult<T> = Result<T, GateError>;
