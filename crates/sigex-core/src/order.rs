//! Order-related types and identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Order side: buy or sell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// Returns the opposite side.
    pub fn opposite(&self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of protective conditional order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderKind {
    /// Stop-loss.
    Stop,
    /// Take-profit.
    TakeProfit,
}

impl OrderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stop => "STOP",
            Self::TakeProfit => "TAKE_PROFIT",
        }
    }

    /// Short leg label used in operator messages.
    pub fn leg_label(&self) -> &'static str {
        match self {
            Self::Stop => "SL",
            Self::TakeProfit => "TP",
        }
    }
}

impl fmt::Display for OrderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque token threading every record, log line and exchange request that
/// belongs to one decision.
///
/// Doubles as the entry order's client order id, so a replayed entry
/// submission is recognized by the exchange as a duplicate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Create a new unique correlation id.
    ///
    /// Format: `sgx_{timestamp_ms}_{uuid_short}`
    pub fn new() -> Self {
        let ts = chrono::Utc::now().timestamp_millis();
        let uuid = Uuid::new_v4().simple().to_string();
        Self(format!("sgx_{ts}_{}", &uuid[..12]))
    }

    pub fn from_string(s: String) -> Self {
        Self(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Client order id for one protective leg of this decision.
    pub fn leg_id(&self, kind: OrderKind, variation: &str) -> String {
        format!("{}_{}_{}", self.0, kind.leg_label().to_lowercase(), variation)
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for CorrelationId {
    fn from(s: String) -> Self {
        Self::from_string(s)
    }
}

impl From<&str> for CorrelationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_side_opposite() {
        assert_eq!(OrderSide::Buy.opposite(), OrderSide::Sell);
        assert_eq!(OrderSide::Sell.opposite(), OrderSide::Buy);
    }

    #[test]
    fn test_order_side_serde_uppercase() {
        let json = serde_json::to_string(&OrderSide::Buy).unwrap();
        assert_eq!(json, "\"BUY\"");
        let kind = serde_json::to_string(&OrderKind::TakeProfit).unwrap();
        assert_eq!(kind, "\"TAKE_PROFIT\"");
    }

    #[test]
    fn test_correlation_id_unique() {
        assert_ne!(CorrelationId::new(), CorrelationId::new());
        assert!(CorrelationId::new().as_str().starts_with("sgx_"));
    }

    #[test]
    fn test_leg_id_is_stable_per_variation() {
        let id = CorrelationId::from("sgx_1_abc");
        assert_eq!(id.leg_id(OrderKind::Stop, "v1"), "sgx_1_abc_sl_v1");
        assert_eq!(id.leg_id(OrderKind::TakeProfit, "v2"), "sgx_1_abc_tp_v2");
    }
}
