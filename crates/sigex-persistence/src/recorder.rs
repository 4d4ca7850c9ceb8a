//! DecisionTraceRecorder: append-only decision audit.
//!
//! A trace goes to the [`TraceStore`] first. If the store stays unavailable
//! after the bounded retry, the trace is appended to a local JSON Lines file
//! instead. `record` only returns an error when both sinks fail, so a caller
//! never proceeds believing a trace exists when it does not.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use sigex_core::{CorrelationId, DecisionKind, DecisionTrace, InstrumentId, OrderSide, RetryPolicy};

use crate::error::{PersistenceError, PersistenceResult};
use crate::store::{with_timeout, TraceStore};
use crate::writer::{read_records, JsonLinesWriter};

/// File prefix of the local fallback.
pub const FALLBACK_PREFIX: &str = "decision_traces";

/// Recorder tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecorderConfig {
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default = "default_op_timeout_ms")]
    pub op_timeout_ms: u64,
}

fn default_op_timeout_ms() -> u64 {
    5_000
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            op_timeout_ms: default_op_timeout_ms(),
        }
    }
}

/// Identity shared by every trace of one decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceContext {
    pub correlation_id: CorrelationId,
    pub instrument: InstrumentId,
    pub side: OrderSide,
}

impl TraceContext {
    pub fn new(correlation_id: CorrelationId, instrument: InstrumentId, side: OrderSide) -> Self {
        Self {
            correlation_id,
            instrument,
            side,
        }
    }
}

/// Where a trace ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceSink {
    Store,
    Fallback,
}

pub struct DecisionTraceRecorder {
    store: Arc<dyn TraceStore>,
    fallback: Mutex<JsonLinesWriter<DecisionTrace>>,
    fallback_dir: std::path::PathBuf,
    config: RecorderConfig,
}

impl DecisionTraceRecorder {
    pub fn new(store: Arc<dyn TraceStore>, fallback_dir: impl AsRef<Path>, config: RecorderConfig) -> Self {
        let fallback_dir = fallback_dir.as_ref().to_path_buf();
        Self {
            store,
            fallback: Mutex::new(JsonLinesWriter::new(&fallback_dir, FALLBACK_PREFIX)),
            fallback_dir,
            config,
        }
    }

    /// Append one trace; returns it with the sink that accepted it.
    pub async fn record(
        &self,
        ctx: &TraceContext,
        kind: DecisionKind,
        reason_code: &str,
        reason_message: &str,
        raw_error: Option<String>,
    ) -> PersistenceResult<(DecisionTrace, TraceSink)> {
        let trace = DecisionTrace {
            correlation_id: ctx.correlation_id.clone(),
            instrument: ctx.instrument.clone(),
            side: ctx.side,
            kind,
            reason_code: reason_code.to_string(),
            reason_message: reason_message.to_string(),
            raw_error,
            recorded_at: Utc::now(),
        };
        let sink = self.record_trace(trace.clone()).await?;
        Ok((trace, sink))
    }

    /// Append a fully built trace.
    pub async fn record_trace(&self, trace: DecisionTrace) -> PersistenceResult<TraceSink> {
        let timeout = Duration::from_millis(self.config.op_timeout_ms);
        let stored = self
            .config
            .retry
            .retry(
                "append_trace",
                PersistenceError::is_retryable,
                || with_timeout(timeout, self.store.append_trace(trace.clone())),
            )
            .await;

        match stored {
            Ok(()) => {
                debug!(
                    correlation_id = %trace.correlation_id,
                    kind = %trace.kind,
                    reason = %trace.reason_code,
                    "Decision trace recorded"
                );
                Ok(TraceSink::Store)
            }
            Err(store_err) => {
                warn!(
                    correlation_id = %trace.correlation_id,
                    kind = %trace.kind,
                    error = %store_err,
                    "Trace store unavailable, writing local fallback"
                );
                match self.fallback.lock().append(&trace) {
                    Ok(()) => Ok(TraceSink::Fallback),
                    Err(file_err) => {
                        error!(
                            correlation_id = %trace.correlation_id,
                            kind = %trace.kind,
                            store_error = %store_err,
                            file_error = %file_err,
                            "Decision trace could not be recorded"
                        );
                        Err(PersistenceError::Unrecorded(format!(
                            "{} {}: store: {store_err}; fallback: {file_err}",
                            trace.correlation_id, trace.kind
                        )))
                    }
                }
            }
        }
    }

    /// Traces that only reached the local fallback.
    pub fn fallback_traces(&self) -> PersistenceResult<Vec<DecisionTrace>> {
        read_records(&self.fallback_dir, FALLBACK_PREFIX)
    }

    /// Read side, backed by the store.
    pub fn store(&self) -> &Arc<dyn TraceStore> {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use tempfile::TempDir;

    fn ctx() -> TraceContext {
        TraceContext::new(CorrelationId::from("sgx_1"), InstrumentId::from("X"), OrderSide::Buy)
    }

    fn recorder(store: Arc<MemoryStore>, dir: &TempDir) -> DecisionTraceRecorder {
        let config = RecorderConfig {
            retry: RetryPolicy::immediate(2),
            op_timeout_ms: 1_000,
        };
        DecisionTraceRecorder::new(store, dir.path(), config)
    }

    #[tokio::test]
    async fn test_record_goes_to_store() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let recorder = recorder(store.clone(), &dir);

        let (trace, sink) = recorder
            .record(&ctx(), DecisionKind::Approved, "APPROVED", "gate allowed", None)
            .await
            .unwrap();
        assert_eq!(trace.kind, DecisionKind::Approved);
        assert_eq!(sink, TraceSink::Store);

        let stored = store.traces_for(&CorrelationId::from("sgx_1")).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert!(recorder.fallback_traces().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let recorder = recorder(store.clone(), &dir);

        store.fail_next(1);
        let sink = recorder
            .record_trace(DecisionTrace {
                correlation_id: CorrelationId::from("sgx_1"),
                instrument: InstrumentId::from("X"),
                side: OrderSide::Buy,
                kind: DecisionKind::Throttled,
                reason_code: "THROTTLED_COOLDOWN".to_string(),
                reason_message: "cooldown".to_string(),
                raw_error: None,
                recorded_at: Utc::now(),
            })
            .await
            .unwrap();
        assert_eq!(sink, TraceSink::Store);
    }

    #[tokio::test]
    async fn test_unavailable_store_falls_back_to_file() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let recorder = recorder(store.clone(), &dir);
        store.set_traces_unavailable(true);

        let raw = "51000: Parameter tpTriggerPx error".to_string();
        let (_, sink) = recorder
            .record(
                &ctx(),
                DecisionKind::ProtectionFailed,
                "PROTECTION_FAILED",
                "both legs exhausted",
                Some(raw.clone()),
            )
            .await
            .unwrap();
        assert_eq!(sink, TraceSink::Fallback);

        let fallback = recorder.fallback_traces().unwrap();
        assert_eq!(fallback.len(), 1);
        assert_eq!(fallback[0].raw_error.as_deref(), Some(raw.as_str()));

        store.set_traces_unavailable(false);
        assert!(store.traces_for(&CorrelationId::from("sgx_1")).await.unwrap().is_empty());
    }
}
