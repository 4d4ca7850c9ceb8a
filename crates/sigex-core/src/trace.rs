//! Decision trace records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{CorrelationId, InstrumentId, IntentStatus, OrderSide};

/// What kind of decision or transition a trace records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionKind {
    Throttled,
    IntentInFlight,
    Approved,
    EntrySubmitted,
    EntryFilled,
    ProtectionPending,
    ProtectionPlaced,
    ProtectionPartial,
    ProtectionFailed,
    EntryRejected,
    EntryTimeout,
    /// Protection outcome known but the intent's terminal status not yet stored.
    OutcomeUnsettled,
}

impl DecisionKind {
    /// Trace kind written when an intent reaches `status`.
    pub fn for_status(status: IntentStatus) -> Self {
        match status {
            IntentStatus::Created => Self::Approved,
            IntentStatus::EntrySubmitted => Self::EntrySubmitted,
            IntentStatus::EntryFilled => Self::EntryFilled,
            IntentStatus::ProtectionPending => Self::ProtectionPending,
            IntentStatus::ProtectionPlaced => Self::ProtectionPlaced,
            IntentStatus::ProtectionPartial => Self::ProtectionPartial,
            IntentStatus::ProtectionFailed => Self::ProtectionFailed,
            IntentStatus::EntryRejected => Self::EntryRejected,
            IntentStatus::EntryTimeout => Self::EntryTimeout,
        }
    }

    /// Outcomes that must reach an operator.
    pub fn is_escalation(&self) -> bool {
        matches!(
            self,
            Self::ProtectionPartial
                | Self::ProtectionFailed
                | Self::EntryRejected
                | Self::EntryTimeout
                | Self::OutcomeUnsettled
        )
    }

    /// Partial, missing or unrecorded protection on a live position.
    pub fn is_high_priority(&self) -> bool {
        matches!(
            self,
            Self::ProtectionPartial | Self::ProtectionFailed | Self::OutcomeUnsettled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Throttled => "THROTTLED",
            Self::IntentInFlight => "INTENT_IN_FLIGHT",
            Self::Approved => "APPROVED",
            Self::EntrySubmitted => "ENTRY_SUBMITTED",
            Self::EntryFilled => "ENTRY_FILLED",
            Self::ProtectionPending => "PROTECTION_PENDING",
            Self::ProtectionPlaced => "PROTECTION_PLACED",
            Self::ProtectionPartial => "PROTECTION_PARTIAL",
            Self::ProtectionFailed => "PROTECTION_FAILED",
            Self::EntryRejected => "ENTRY_REJECTED",
            Self::EntryTimeout => "ENTRY_TIMEOUT",
            Self::OutcomeUnsettled => "OUTCOME_UNSETTLED",
        }
    }
}

impl fmt::Display for DecisionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable record of one gate decision or intent transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionTrace {
    pub correlation_id: CorrelationId,
    pub instrument: InstrumentId,
    pub side: OrderSide,
    pub kind: DecisionKind,
    pub reason_code: String,
    pub reason_message: String,
    /// Full exchange error text. Never truncated.
    pub raw_error: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl DecisionTrace {
    /// One-line human summary for notification channels.
    pub fn summary(&self) -> String {
        let mut line = format!(
            "[{}] {} {} ({}): {} - {}",
            self.kind, self.instrument, self.side, self.correlation_id, self.reason_code, self.reason_message
        );
        if let Some(raw) = &self.raw_error {
            line.push_str(" | exchange: ");
            line.push_str(raw);
        }
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_keeps_full_raw_error() {
        let raw = "51000: Parameter slTriggerPx error ".repeat(20);
        let trace = DecisionTrace {
            correlation_id: CorrelationId::from("sgx_1"),
            instrument: InstrumentId::from("X"),
            side: OrderSide::Buy,
            kind: DecisionKind::ProtectionFailed,
            reason_code: "PROTECTION_FAILED".to_string(),
            reason_message: "both legs exhausted".to_string(),
            raw_error: Some(raw.clone()),
            recorded_at: Utc::now(),
        };
        assert!(trace.summary().ends_with(&raw));
    }

    #[test]
    fn test_escalation_kinds() {
        assert!(DecisionKind::ProtectionPartial.is_escalation());
        assert!(DecisionKind::EntryTimeout.is_escalation());
        assert!(!DecisionKind::Throttled.is_escalation());
        assert!(!DecisionKind::ProtectionPlaced.is_escalation());
        assert!(!DecisionKind::EntryRejected.is_high_priority());
        assert!(DecisionKind::OutcomeUnsettled.is_high_priority());
        assert_eq!(
            serde_json::to_value(DecisionKind::OutcomeUnsettled).unwrap(),
            "OUTCOME_UNSETTLED"
        );
    }
}
