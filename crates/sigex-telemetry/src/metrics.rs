//! Prometheus metrics for the execution pipeline.
//!
//! - Gate decisions (allow / deny by reason)
//! - Probe attempt classifications and attempts per placement
//! - Terminal intent outcomes
//! - Trace fallback writes and notification failures
//!
//! # Panics
//!
//! Metric registration uses `unwrap()`. A registration failure means a
//! duplicate metric name, which should crash at startup. These panics only
//! occur during static initialization, never at runtime.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, register_int_gauge, CounterVec, HistogramVec,
    IntGauge,
};

/// Gate decisions.
/// Labels: instrument, side, decision (allow/throttled_cooldown/intent_in_flight)
pub static GATE_DECISIONS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "sigex_gate_decisions_total",
        "Total signal throttle gate decisions",
        &["instrument", "side", "decision"]
    )
    .unwrap()
});

/// Gate evaluations abandoned because storage was unavailable.
pub static GATE_STORAGE_ERRORS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "sigex_gate_storage_errors_total",
        "Gate evaluations dropped on storage unavailability",
        &["instrument"]
    )
    .unwrap()
});

/// Probe attempts by classification.
pub static PROBE_ATTEMPTS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "sigex_probe_attempts_total",
        "Conditional order probe attempts by classification",
        &["kind", "variation", "classification"]
    )
    .unwrap()
});

/// Attempts needed per conditional order placement.
pub static PROBE_ATTEMPTS_PER_PLACEMENT: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "sigex_probe_attempts_per_placement",
        "Probe attempts made for one conditional order placement",
        &["kind", "outcome"],
        vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 8.0, 10.0]
    )
    .unwrap()
});

/// Terminal intent outcomes.
pub static INTENT_OUTCOMES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "sigex_intent_outcomes_total",
        "Order intents reaching a terminal status",
        &["instrument", "status"]
    )
    .unwrap()
});

/// Intents currently non-terminal.
pub static INTENTS_IN_FLIGHT: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("sigex_intents_in_flight", "Non-terminal order intents").unwrap()
});

/// Traces written to the local fallback instead of the store.
pub static TRACE_FALLBACK_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "sigex_trace_fallback_total",
        "Decision traces written to the local fallback file",
        &["kind"]
    )
    .unwrap()
});

/// Notification deliveries that failed.
pub static NOTIFY_FAILURES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "sigex_notify_failures_total",
        "Failed operator notification deliveries",
        &["channel"]
    )
    .unwrap()
});

/// Entry order submissions.
/// Labels: outcome (accepted/rejected/transport_error)
pub static ENTRY_SUBMISSIONS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "sigex_entry_submissions_total",
        "Entry order submissions",
        &["instrument", "outcome"]
    )
    .unwrap()
});

/// Helper struct for recording metrics.
pub struct Metrics;

impl Metrics {
    /// Record a gate decision.
    pub fn gate_decision(instrument: &str, side: &str, decision: &str) {
        GATE_DECISIONS_TOTAL
            .with_label_values(&[instrument, side, decision])
            .inc();
    }

    pub fn gate_storage_error(instrument: &str) {
        GATE_STORAGE_ERRORS_TOTAL.with_label_values(&[instrument]).inc();
    }

    /// Record one classified probe attempt.
    pub fn probe_attempt(kind: &str, variation: &str, classification: &str) {
        PROBE_ATTEMPTS_TOTAL
            .with_label_values(&[kind, variation, classification])
            .inc();
    }

    /// Record how many attempts a placement took.
    pub fn probe_placement(kind: &str, outcome: &str, attempts: usize) {
        PROBE_ATTEMPTS_PER_PLACEMENT
            .with_label_values(&[kind, outcome])
            .observe(attempts as f64);
    }

    pub fn intent_created() {
        INTENTS_IN_FLIGHT.inc();
    }

    /// Record a terminal outcome; the intent leaves the in-flight gauge.
    pub fn intent_terminal(instrument: &str, status: &str) {
        INTENT_OUTCOMES_TOTAL
            .with_label_values(&[instrument, status])
            .inc();
        INTENTS_IN_FLIGHT.dec();
    }

    pub fn entry_submission(instrument: &str, outcome: &str) {
        ENTRY_SUBMISSIONS_TOTAL
            .with_label_values(&[instrument, outcome])
            .inc();
    }

    pub fn trace_fallback(kind: &str) {
        TRACE_FALLBACK_TOTAL.with_label_values(&[kind]).inc();
    }

    pub fn notify_failure(channel: &str) {
        NOTIFY_FAILURES_TOTAL.with_label_values(&[channel]).inc();
    }
}
