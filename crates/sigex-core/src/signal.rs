//! Signals and the throttle lanes they are deduplicated on.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{InstrumentId, OrderSide, Price};

/// A strategy-computed BUY/SELL recommendation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signal {
    pub instrument: InstrumentId,
    pub side: OrderSide,
    pub strategy_key: String,
    pub signal_price: Price,
    pub timestamp: DateTime<Utc>,
}

impl Signal {
    pub fn throttle_key(&self) -> ThrottleKey {
        ThrottleKey::new(self.instrument.clone(), self.side, self.strategy_key.clone())
    }
}

/// (instrument, side, strategy) tuple identifying one cooldown/dedup lane.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ThrottleKey {
    pub instrument: InstrumentId,
    pub side: OrderSide,
    pub strategy_key: String,
}

impl ThrottleKey {
    pub fn new(instrument: InstrumentId, side: OrderSide, strategy_key: impl Into<String>) -> Self {
        Self {
            instrument,
            side,
            strategy_key: strategy_key.into(),
        }
    }
}

impl fmt::Display for ThrottleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.instrument, self.side, self.strategy_key)
    }
}

/// Persisted cooldown/dedup state for one throttle key.
///
/// Rows are superseded (`revision` increments), never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottleState {
    pub key: ThrottleKey,
    /// Time of the last ALLOW on this lane.
    pub last_trigger_at: Option<DateTime<Utc>>,
    /// Signal price of the last ALLOW on this lane.
    pub last_trigger_price: Option<Price>,
    /// Operator override: the next evaluation is allowed regardless of cooldown.
    pub force_next_signal: bool,
    pub cooldown_secs: u64,
    pub min_price_change_pct: Decimal,
    /// Time of the last evaluation, allowed or not.
    pub last_evaluated_at: Option<DateTime<Utc>>,
    /// Consecutive denials since the last ALLOW.
    pub denied_since_trigger: u32,
    pub revision: u64,
}

impl ThrottleState {
    /// Fresh row for a lane that has never been evaluated.
    pub fn new(key: ThrottleKey, cooldown_secs: u64, min_price_change_pct: Decimal) -> Self {
        Self {
            key,
            last_trigger_at: None,
            last_trigger_price: None,
            force_next_signal: false,
            cooldown_secs,
            min_price_change_pct,
            last_evaluated_at: None,
            denied_since_trigger: 0,
            revision: 0,
        }
    }
}
