//! Core domain types for the signal-to-order execution pipeline.
//!
//! This crate provides fundamental types used throughout the system:
//! - `Price`, `Size`: Precision-safe numeric types with tick/lot rounding
//! - `OrderSide`, `OrderKind`, `CorrelationId`: Order enums and identifiers
//! - `InstrumentSpec`: Per-instrument tick/lot precision
//! - `ThrottleKey`, `ThrottleState`: Signal dedup/cooldown lanes
//! - `OrderIntent`, `IntentStatus`: One approved trading decision
//! - `ConditionalOrderSpec`, `ProbeAttempt`: SL/TP placement records
//! - `DecisionTrace`: Append-only audit records
//! - `RetryPolicy`: Bounded exponential backoff

pub mod backoff;
pub mod decimal;
pub mod error;
pub mod execution;
pub mod intent;
pub mod market;
pub mod order;
pub mod signal;
pub mod trace;

pub use backoff::RetryPolicy;
pub use decimal::{Price, Size};
pub use error::{CoreError, Result};
pub use execution::{
    ComparisonOp, ConditionalOrderSpec, ProbeAttempt, ProbeClassification, TriggerCondition,
};
pub use intent::{IntentStatus, OrderIntent};
pub use market::{InstrumentId, InstrumentSpec};
pub use order::{CorrelationId, OrderKind, OrderSide};
pub use signal::{Signal, ThrottleKey, ThrottleState};
pub use trace::{DecisionKind, DecisionTrace};

/// Boxed future for dyn-compatible async trait methods.
pub type BoxFuture<'a, T> = std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;
