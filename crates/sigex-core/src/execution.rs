//! Conditional (SL/TP) order specs and the probe attempts made to place them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{CorrelationId, InstrumentId, OrderKind, OrderSide, Price, Size};

// ============================================================================
// Trigger condition
// ============================================================================

/// Comparison operator of a trigger condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComparisonOp {
    #[serde(rename = ">=")]
    GreaterOrEqual,
    #[serde(rename = "<=")]
    LessOrEqual,
}

impl fmt::Display for ComparisonOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GreaterOrEqual => f.write_str(">="),
            Self::LessOrEqual => f.write_str("<="),
        }
    }
}

/// Comparison operator plus trigger price, rendered as e.g. `<=96.27`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerCondition {
    pub op: ComparisonOp,
    pub price: Price,
}

impl fmt::Display for TriggerCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.op, self.price)
    }
}

// ============================================================================
// ConditionalOrderSpec
// ============================================================================

/// Fully-rounded SL or TP order, ready to be rendered into payload variations.
///
/// Transient: reconstructable from the owning intent plus the market price
/// observed at build time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionalOrderSpec {
    pub instrument: InstrumentId,
    /// Side of the entry this order protects. Carried so nothing downstream
    /// has to re-derive it from `closing_side`.
    pub entry_side: OrderSide,
    pub closing_side: OrderSide,
    pub execution_price: Price,
    pub quantity: Size,
    pub trigger_price: Price,
    pub reference_price: Price,
    pub trigger_condition: TriggerCondition,
    pub kind: OrderKind,
}

// ============================================================================
// ProbeAttempt
// ============================================================================

/// How one exchange submission was classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProbeClassification {
    /// Order id returned and the existence check confirms it persists.
    VerifiedSuccess,
    /// Order id returned but the order was cancelled/rejected afterwards.
    SoftReject,
    /// No order id; explicit validation error.
    HardReject,
    /// Order id returned but the existence check itself could not complete.
    Unverified,
    /// Transport failed even after the same-payload retry.
    TransportFailure,
}

impl ProbeClassification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VerifiedSuccess => "VERIFIED_SUCCESS",
            Self::SoftReject => "SOFT_REJECT",
            Self::HardReject => "HARD_REJECT",
            Self::Unverified => "UNVERIFIED",
            Self::TransportFailure => "TRANSPORT_FAILURE",
        }
    }

    /// Whether the engine may try the next variation after this outcome.
    ///
    /// `Unverified` and `TransportFailure` may have left a live order behind,
    /// so another variation could create a duplicate.
    pub fn allows_next_variation(&self) -> bool {
        matches!(self, Self::SoftReject | Self::HardReject)
    }
}

impl fmt::Display for ProbeClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One exchange submission inside a single conditional-order placement.
///
/// Append-only; never mutated after it is written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeAttempt {
    pub correlation_id: CorrelationId,
    pub kind: OrderKind,
    /// 1-based position within this placement.
    pub sequence: u32,
    pub variation_id: String,
    /// Exact payload that was sent.
    pub payload: serde_json::Value,
    pub http_status: Option<u16>,
    pub error_code: Option<String>,
    pub message: Option<String>,
    pub order_id: Option<String>,
    pub existence_verified: bool,
    pub classification: ProbeClassification,
    pub recorded_at: DateTime<Utc>,
}

impl ProbeAttempt {
    /// Untruncated `code: message` for traces and operator alerts.
    pub fn error_snippet(&self) -> Option<String> {
        match (&self.error_code, &self.message) {
            (Some(code), Some(msg)) => Some(format!("{code}: {msg}")),
            (Some(code), None) => Some(code.clone()),
            (None, Some(msg)) => Some(msg.clone()),
            (None, None) => None,
        }
    }
}
