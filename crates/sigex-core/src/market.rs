//! Instrument identity and precision.

use crate::{Price, Size};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Exchange instrument symbol (e.g. "BTC-USDT-SWAP").
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstrumentId(String);

impl InstrumentId {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self(symbol.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstrumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InstrumentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Tick/lot precision for one instrument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentSpec {
    pub instrument: InstrumentId,
    /// Minimum price increment.
    pub tick_size: Price,
    /// Minimum quantity increment.
    pub lot_size: Size,
}

impl InstrumentSpec {
    pub fn new(instrument: InstrumentId, tick_size: Price, lot_size: Size) -> Self {
        Self {
            instrument,
            tick_size,
            lot_size,
        }
    }
}
