//! Prometheus metrics, structured logging and operator notifications.
//!
//! - Prometheus metrics for gate decisions, probe attempts and intent outcomes
//! - Structured JSON logging with tracing
//! - Fire-and-forget notification channel for escalated decisions

pub mod error;
pub mod logging;
pub mod metrics;
pub mod notify;

pub use error::{TelemetryError, TelemetryResult};
pub use logging::init_logging;
pub use metrics::Metrics;
pub use notify::{LogNotifier, Notifier, RecordingNotifier, WebhookNotifier};
