//! Order intent lifecycle.
//!
//! One `OrderIntent` per approved signal. Status moves strictly forward:
//!
//! ```text
//! CREATED -> ENTRY_SUBMITTED -> ENTRY_FILLED -> PROTECTION_PENDING -> PROTECTION_PLACED*
//!                            |                                    -> PROTECTION_PARTIAL*
//!                            |                                    -> PROTECTION_FAILED*
//!                            -> ENTRY_REJECTED*
//!                            -> ENTRY_TIMEOUT*
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{CoreError, Result};
use crate::{CorrelationId, InstrumentId, OrderSide, Price, Signal, Size};

/// Lifecycle status of an order intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntentStatus {
    Created,
    EntrySubmitted,
    EntryFilled,
    ProtectionPending,
    ProtectionPlaced,
    ProtectionPartial,
    ProtectionFailed,
    EntryRejected,
    EntryTimeout,
}

impl IntentStatus {
    pub const ALL: [IntentStatus; 9] = [
        Self::Created,
        Self::EntrySubmitted,
        Self::EntryFilled,
        Self::ProtectionPending,
        Self::ProtectionPlaced,
        Self::ProtectionPartial,
        Self::ProtectionFailed,
        Self::EntryRejected,
        Self::EntryTimeout,
    ];

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::ProtectionPlaced
                | Self::ProtectionPartial
                | Self::ProtectionFailed
                | Self::EntryRejected
                | Self::EntryTimeout
        )
    }

    /// Whether `next` is a legal single step from `self`.
    #[must_use]
    pub fn can_transition_to(&self, next: IntentStatus) -> bool {
        use IntentStatus::*;
        matches!(
            (self, next),
            (Created, EntrySubmitted)
                | (EntrySubmitted, EntryFilled)
                | (EntrySubmitted, EntryRejected)
                | (EntrySubmitted, EntryTimeout)
                | (EntryFilled, ProtectionPending)
                | (ProtectionPending, ProtectionPlaced)
                | (ProtectionPending, ProtectionPartial)
                | (ProtectionPending, ProtectionFailed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::EntrySubmitted => "ENTRY_SUBMITTED",
            Self::EntryFilled => "ENTRY_FILLED",
            Self::ProtectionPending => "PROTECTION_PENDING",
            Self::ProtectionPlaced => "PROTECTION_PLACED",
            Self::ProtectionPartial => "PROTECTION_PARTIAL",
            Self::ProtectionFailed => "PROTECTION_FAILED",
            Self::EntryRejected => "ENTRY_REJECTED",
            Self::EntryTimeout => "ENTRY_TIMEOUT",
        }
    }
}

impl fmt::Display for IntentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One trading decision, from approval to its terminal outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderIntent {
    pub correlation_id: CorrelationId,
    pub instrument: InstrumentId,
    pub side: OrderSide,
    pub strategy_key: String,
    /// Price and time of the originating signal.
    pub signal_price: Price,
    pub signal_at: DateTime<Utc>,
    pub status: IntentStatus,
    pub requested_price: Price,
    pub requested_qty: Size,
    pub filled_price: Option<Price>,
    pub filled_qty: Option<Size>,
    pub entry_order_id: Option<String>,
    /// Every status reached, with the time it was reached.
    pub history: Vec<(IntentStatus, DateTime<Utc>)>,
}

impl OrderIntent {
    /// New intent in `CREATED` for an approved signal.
    pub fn from_signal(signal: &Signal, requested_qty: Size, now: DateTime<Utc>) -> Self {
        Self {
            correlation_id: CorrelationId::new(),
            instrument: signal.instrument.clone(),
            side: signal.side,
            strategy_key: signal.strategy_key.clone(),
            signal_price: signal.signal_price,
            signal_at: signal.timestamp,
            status: IntentStatus::Created,
            requested_price: signal.signal_price,
            requested_qty,
            filled_price: None,
            filled_qty: None,
            entry_order_id: None,
            history: vec![(IntentStatus::Created, now)],
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move to `next`, rejecting anything but a legal forward step.
    pub fn advance(&mut self, next: IntentStatus, at: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(CoreError::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        self.history.push((next, at));
        Ok(())
    }

    /// Time the given status was reached, if it was.
    pub fn reached_at(&self, status: IntentStatus) -> Option<DateTime<Utc>> {
        self.history
            .iter()
            .find(|(s, _)| *s == status)
            .map(|(_, at)| *at)
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.history
            .last()
            .map(|(_, at)| *at)
            .unwrap_or(self.signal_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sample_intent() -> OrderIntent {
        let signal = Signal {
            instrument: InstrumentId::from("X"),
            side: OrderSide::Buy,
            strategy_key: "rsi".to_string(),
            signal_price: Price::new(dec!(100)),
            timestamp: Utc::now(),
        };
        OrderIntent::from_signal(&signal, Size::new(dec!(10)), Utc::now())
    }

    #[test]
    fn test_happy_path_is_monotonic() {
        let mut intent = sample_intent();
        let now = Utc::now();
        for next in [
            IntentStatus::EntrySubmitted,
            IntentStatus::EntryFilled,
            IntentStatus::ProtectionPending,
            IntentStatus::ProtectionPlaced,
        ] {
            intent.advance(next, now).unwrap();
        }
        assert!(intent.is_terminal());
        assert_eq!(intent.history.len(), 5);
    }

    #[test]
    fn test_backward_and_skip_transitions_rejected() {
        let mut intent = sample_intent();
        let now = Utc::now();
        assert!(intent.advance(IntentStatus::EntryFilled, now).is_err());
        intent.advance(IntentStatus::EntrySubmitted, now).unwrap();
        assert!(intent.advance(IntentStatus::Created, now).is_err());
        assert!(intent.advance(IntentStatus::EntrySubmitted, now).is_err());
        assert_eq!(intent.status, IntentStatus::EntrySubmitted);
    }

    #[test]
    fn test_terminal_states_are_immutable() {
        for terminal in IntentStatus::ALL.iter().filter(|s| s.is_terminal()) {
            for next in IntentStatus::ALL {
                assert!(!terminal.can_transition_to(next), "{terminal} -> {next}");
            }
        }
    }
}
