//! Signal throttle gate.
//!
//! Decides whether a detected signal may produce an order intent:
//! - at most one non-terminal intent per (instrument, side)
//! - per-(instrument, side, strategy) cooldown with a minimum price move
//! - operator force-next-signal override
//!
//! Evaluation for one lane is serialized; an ALLOW hands out a [`KeyPermit`]
//! that keeps the lane locked until the caller has created its intent.

pub mod error;
pub mod throttle;

pub use error::{GateError, GateResult};
pub use throttle::{DenyReason, GateConfig, GateVerdict, KeyPermit, SignalThrottleGate};
