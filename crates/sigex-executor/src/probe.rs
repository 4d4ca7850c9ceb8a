//! ExchangeProbeRetryEngine: sequential variation probing for SL/TP orders.
//!
//! For each variation, in order:
//! 1. render the payload and submit it
//! 2. if an order id came back, check that the order still exists
//! 3. classify, and persist the [`ProbeAttempt`] before anything else
//!
//! Only a verified, live order ends the loop with success. Rejections, hard
//! or soft, move on to the next variation. An attempt whose outcome is
//! unknown (existence check failed, or transport failed after its retry)
//! also ends the loop: a further variation could open a second live order.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use sigex_core::{
    ConditionalOrderSpec, CorrelationId, ProbeAttempt, ProbeClassification, RetryPolicy,
};
use sigex_persistence::{with_timeout, PersistenceError, ProbeAttemptStore};
use sigex_telemetry::Metrics;

use crate::error::ExecutorResult;
use crate::transport::{DynTransport, SubmitResponse};
use crate::variation::{PayloadVariation, VariationPolicy};

/// Probe engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Pause between an accepted submission and its existence check, giving
    /// the exchange's secondary validation time to cancel it.
    #[serde(default = "default_verify_delay_ms")]
    pub verify_delay_ms: u64,
    #[serde(default)]
    pub storage_retry: RetryPolicy,
    #[serde(default = "default_op_timeout_ms")]
    pub op_timeout_ms: u64,
}

fn default_verify_delay_ms() -> u64 {
    250
}

fn default_op_timeout_ms() -> u64 {
    5_000
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            verify_delay_ms: default_verify_delay_ms(),
            storage_retry: RetryPolicy::default(),
            op_timeout_ms: default_op_timeout_ms(),
        }
    }
}

/// Result of placing one conditional order.
#[derive(Debug, Clone)]
pub enum PlacementOutcome {
    /// Verified live order, no error reported.
    Success {
        order_id: String,
        attempts: Vec<ProbeAttempt>,
    },
    /// An order id exists but something went wrong alongside it.
    ///
    /// `verified == true`: the order is live but the exchange also reported
    /// an error. `verified == false`: the existence check could not run, so
    /// the order may or may not be live.
    PartialWithError {
        order_id: String,
        error: String,
        verified: bool,
        attempts: Vec<ProbeAttempt>,
    },
    /// No variation produced a verified order.
    Exhausted { attempts: Vec<ProbeAttempt> },
}

impl PlacementOutcome {
    pub fn attempts(&self) -> &[ProbeAttempt] {
        match self {
            Self::Success { attempts, .. }
            | Self::PartialWithError { attempts, .. }
            | Self::Exhausted { attempts } => attempts,
        }
    }

    /// Whether a live order is known to exist.
    pub fn is_placed(&self) -> bool {
        matches!(
            self,
            Self::Success { .. } | Self::PartialWithError { verified: true, .. }
        )
    }

    pub fn order_id(&self) -> Option<&str> {
        match self {
            Self::Success { order_id, .. } | Self::PartialWithError { order_id, .. } => {
                Some(order_id)
            }
            Self::Exhausted { .. } => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Success { .. } => "success",
            Self::PartialWithError { .. } => "partial_with_error",
            Self::Exhausted { .. } => "exhausted",
        }
    }

    /// Every attempt's classification and untruncated exchange error, one per line.
    pub fn error_summary(&self) -> String {
        let mut lines: Vec<String> = self
            .attempts()
            .iter()
            .map(|a| {
                format!(
                    "#{} {} {}{}: {}",
                    a.sequence,
                    a.variation_id,
                    a.classification,
                    a.http_status.map(|s| format!(" http={s}")).unwrap_or_default(),
                    a.error_snippet().unwrap_or_else(|| "no error text".to_string())
                )
            })
            .collect();
        if let Self::PartialWithError { error, .. } = self {
            lines.push(error.clone());
        }
        lines.join("\n")
    }
}

pub struct ExchangeProbeRetryEngine {
    transport: DynTransport,
    attempts: Arc<dyn ProbeAttemptStore>,
    config: ProbeConfig,
}

impl ExchangeProbeRetryEngine {
    pub fn new(transport: DynTransport, attempts: Arc<dyn ProbeAttemptStore>, config: ProbeConfig) -> Self {
        Self {
            transport,
            attempts,
            config,
        }
    }

    /// Place `spec`, trying `policy`'s variations strictly one at a time.
    ///
    /// Errors only when an attempt could not be persisted; the loop stops
    /// there rather than submit a variation whose predecessor is unaudited.
    pub async fn place(
        &self,
        correlation_id: &CorrelationId,
        spec: &ConditionalOrderSpec,
        policy: &VariationPolicy,
    ) -> ExecutorResult<PlacementOutcome> {
        let kind = spec.kind.as_str();
        let mut attempts: Vec<ProbeAttempt> = Vec::with_capacity(policy.len());

        for (index, variation) in policy.variations().iter().enumerate() {
            let sequence = index as u32 + 1;
            let (attempt, response) = self.attempt(correlation_id, spec, variation, sequence).await;
            Metrics::probe_attempt(kind, &variation.id, attempt.classification.as_str());

            info!(
                %correlation_id,
                kind,
                variation = %variation.id,
                sequence,
                classification = %attempt.classification,
                order_id = ?attempt.order_id,
                error = ?attempt.error_snippet(),
                "Probe attempt"
            );

            let persisted = self.persist(attempt.clone()).await;
            let classification = attempt.classification;
            attempts.push(attempt);

            if let Err(e) = persisted {
                if classification == ProbeClassification::VerifiedSuccess {
                    // Live order on the exchange; report it even without the audit row.
                    error!(%correlation_id, kind, error = %e, "Probe attempt not persisted after verified success");
                } else {
                    error!(%correlation_id, kind, error = %e, "Probe attempt not persisted, stopping");
                    return Err(e.into());
                }
            }

            if classification.allows_next_variation() {
                debug!(%correlation_id, kind, variation = %variation.id, "Advancing to next variation");
                continue;
            }

            let last_order_id = attempts.last().and_then(|a| a.order_id.clone());
            let outcome = match (classification, last_order_id) {
                (ProbeClassification::VerifiedSuccess, Some(order_id)) => {
                    let reported_error = response
                        .as_ref()
                        .filter(|r| r.has_error())
                        .map(SubmitResponse::error_text);
                    match reported_error {
                        Some(error) => PlacementOutcome::PartialWithError {
                            order_id,
                            error,
                            verified: true,
                            attempts,
                        },
                        None => PlacementOutcome::Success { order_id, attempts },
                    }
                }
                (ProbeClassification::Unverified, order_id) => {
                    let order_id = order_id.unwrap_or_default();
                    let error = format!(
                        "existence of order {order_id} could not be verified: {}",
                        attempts.last().and_then(|a| a.message.clone()).unwrap_or_default()
                    );
                    PlacementOutcome::PartialWithError {
                        order_id,
                        error,
                        verified: false,
                        attempts,
                    }
                }
                _ => {
                    warn!(%correlation_id, kind, %classification, "Outcome unknown, not probing further");
                    PlacementOutcome::Exhausted { attempts }
                }
            };
            return Ok(self.finish(correlation_id, spec, outcome));
        }

        Ok(self.finish(correlation_id, spec, PlacementOutcome::Exhausted { attempts }))
    }

    async fn attempt(
        &self,
        correlation_id: &CorrelationId,
        spec: &ConditionalOrderSpec,
        variation: &PayloadVariation,
        sequence: u32,
    ) -> (ProbeAttempt, Option<SubmitResponse>) {
        let client_order_id = correlation_id.leg_id(spec.kind, &variation.id);
        let payload = variation.render(spec, &client_order_id);

        let mut attempt = ProbeAttempt {
            correlation_id: correlation_id.clone(),
            kind: spec.kind,
            sequence,
            variation_id: variation.id.clone(),
            payload: payload.clone(),
            http_status: None,
            error_code: None,
            message: None,
            order_id: None,
            existence_verified: false,
            classification: ProbeClassification::TransportFailure,
            recorded_at: Utc::now(),
        };

        let response = match self.transport.submit_order(payload).await {
            Ok(response) => response,
            Err(e) => {
                attempt.message = Some(e.to_string());
                attempt.recorded_at = Utc::now();
                return (attempt, None);
            }
        };

        attempt.http_status = Some(response.http_status);
        attempt.error_code = response.error_code();
        attempt.message = response.message();
        attempt.order_id = response.order_id();

        let Some(order_id) = attempt.order_id.clone() else {
            attempt.classification = ProbeClassification::HardReject;
            attempt.recorded_at = Utc::now();
            return (attempt, Some(response));
        };

        if self.config.verify_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.config.verify_delay_ms)).await;
        }

        attempt.classification = match self.transport.get_order(&order_id).await {
            Ok(lookup) if lookup.is_live() => {
                attempt.existence_verified = true;
                ProbeClassification::VerifiedSuccess
            }
            Ok(lookup) => {
                let status = lookup.status.unwrap_or_else(|| "not found".to_string());
                let note = format!("order {order_id} accepted then {status}");
                attempt.message = Some(match attempt.message.take() {
                    Some(msg) => format!("{msg}; {note}"),
                    None => note,
                });
                ProbeClassification::SoftReject
            }
            Err(e) => {
                let note = format!("existence check failed: {e}");
                attempt.message = Some(match attempt.message.take() {
                    Some(msg) => format!("{msg}; {note}"),
                    None => note,
                });
                ProbeClassification::Unverified
            }
        };
        attempt.recorded_at = Utc::now();
        (attempt, Some(response))
    }

    async fn persist(&self, attempt: ProbeAttempt) -> Result<(), PersistenceError> {
        let timeout = Duration::from_millis(self.config.op_timeout_ms);
        self.config
            .storage_retry
            .retry("append_attempt", PersistenceError::is_retryable, || {
                with_timeout(timeout, self.attempts.append_attempt(attempt.clone()))
            })
            .await
    }

    fn finish(
        &self,
        correlation_id: &CorrelationId,
        spec: &ConditionalOrderSpec,
        outcome: PlacementOutcome,
    ) -> PlacementOutcome {
        let kind = spec.kind.as_str();
        Metrics::probe_placement(kind, outcome.label(), outcome.attempts().len());
        match &outcome {
            PlacementOutcome::Success { order_id, attempts } => {
                info!(%correlation_id, kind, %order_id, attempts = attempts.len(), "Conditional order placed");
            }
            PlacementOutcome::PartialWithError {
                order_id,
                error,
                verified,
                ..
            } => {
                warn!(%correlation_id, kind, %order_id, verified, %error, "Conditional order placed with error");
            }
            PlacementOutcome::Exhausted { attempts } => {
                warn!(%correlation_id, kind, attempts = attempts.len(), "Conditional order variations exhausted");
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MockTransport, OrderLookup, TransportError};
    use rust_decimal_macros::dec;
    use serde_json::Value;
    use sigex_core::{
        ComparisonOp, InstrumentId, OrderKind, OrderSide, Price, Size, TriggerCondition,
    };
    use sigex_persistence::MemoryStore;

    fn spec() -> ConditionalOrderSpec {
        ConditionalOrderSpec {
            instrument: InstrumentId::from("X"),
            entry_side: OrderSide::Buy,
            closing_side: OrderSide::Sell,
            execution_price: Price::new(dec!(106)),
            quantity: Size::new(dec!(10)),
            trigger_price: Price::new(dec!(106)),
            reference_price: Price::new(dec!(100.89)),
            trigger_condition: TriggerCondition {
                op: ComparisonOp::GreaterOrEqual,
                price: Price::new(dec!(106)),
            },
            kind: OrderKind::TakeProfit,
        }
    }

    fn engine(transport: &Arc<MockTransport>, store: &Arc<MemoryStore>) -> ExchangeProbeRetryEngine {
        let config = ProbeConfig {
            verify_delay_ms: 0,
            storage_retry: RetryPolicy::immediate(2),
            op_timeout_ms: 1_000,
        };
        ExchangeProbeRetryEngine::new(transport.clone(), store.clone(), config)
    }

    fn variation_of(payload: &Value) -> String {
        let id = payload["client_order_id"].as_str().unwrap_or_default();
        id.rsplit("_tp_").next().unwrap_or_default().to_string()
    }

    #[tokio::test]
    async fn test_stops_at_first_verified_success() {
        let transport = Arc::new(MockTransport::new());
        let store = Arc::new(MemoryStore::new());
        let policy = VariationPolicy::default();
        let third = policy.variations()[2].id.clone();
        transport.set_submit_handler(move |payload| {
            if variation_of(payload) == third {
                Ok(SubmitResponse::accepted("tp-3"))
            } else {
                Ok(SubmitResponse::rejected(400, "51000", "Parameter side error"))
            }
        });

        let id = CorrelationId::from("sgx_1");
        let outcome = engine(&transport, &store).place(&id, &spec(), &policy).await.unwrap();

        assert!(matches!(&outcome, PlacementOutcome::Success { order_id, .. } if order_id == "tp-3"));
        assert_eq!(outcome.attempts().len(), 3);
        assert_eq!(transport.submit_count(), 3);
        let stored = store.attempts_for(&id).await.unwrap();
        assert_eq!(stored.len(), 3);
        assert_eq!(
            stored.iter().map(|a| a.sequence).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(stored[0].classification, ProbeClassification::HardReject);
        assert!(stored[2].existence_verified);
    }

    #[tokio::test]
    async fn test_soft_reject_is_not_success() {
        let transport = Arc::new(MockTransport::new());
        let store = Arc::new(MemoryStore::new());
        transport.push_submit(Ok(SubmitResponse::accepted("ghost")));
        transport.set_lookup("ghost", OrderLookup::live("cancelled"));

        let id = CorrelationId::from("sgx_2");
        let outcome = engine(&transport, &store)
            .place(&id, &spec(), &VariationPolicy::default())
            .await
            .unwrap();

        let attempts = outcome.attempts();
        assert_eq!(attempts[0].classification, ProbeClassification::SoftReject);
        assert!(attempts[0].order_id.is_some());
        assert!(!attempts[0].existence_verified);
        assert_eq!(attempts.len(), 2);
        assert!(outcome.is_placed());
    }

    #[tokio::test]
    async fn test_missing_order_after_acceptance_is_soft_reject() {
        let transport = Arc::new(MockTransport::new());
        let store = Arc::new(MemoryStore::new());
        transport.push_submit(Ok(SubmitResponse::accepted("vanished")));
        transport.set_lookup("vanished", OrderLookup::missing());
        transport.set_submit_handler(|_| Ok(SubmitResponse::rejected(400, "51000", "rejected")));

        let outcome = engine(&transport, &store)
            .place(&CorrelationId::from("sgx_3"), &spec(), &VariationPolicy::default())
            .await
            .unwrap();
        assert!(matches!(outcome, PlacementOutcome::Exhausted { .. }));
        assert_eq!(outcome.attempts()[0].classification, ProbeClassification::SoftReject);
        assert_eq!(outcome.attempts().len(), 4);
    }

    #[tokio::test]
    async fn test_exhausted_keeps_full_errors() {
        let transport = Arc::new(MockTransport::new());
        let store = Arc::new(MemoryStore::new());
        let long_msg = "TP trigger price must be higher than the last traded price ".repeat(10);
        let msg = long_msg.clone();
        transport.set_submit_handler(move |_| Ok(SubmitResponse::rejected(200, "51279", &msg)));

        let outcome = engine(&transport, &store)
            .place(&CorrelationId::from("sgx_4"), &spec(), &VariationPolicy::default())
            .await
            .unwrap();
        assert!(matches!(outcome, PlacementOutcome::Exhausted { .. }));
        assert_eq!(outcome.attempts().len(), 4);
        assert!(outcome.error_summary().contains(&long_msg));
        assert!(!outcome.is_placed());
    }

    #[tokio::test]
    async fn test_unverified_stops_probing() {
        let transport = Arc::new(MockTransport::new());
        let store = Arc::new(MemoryStore::new());
        transport.set_fail_all_lookups(true);

        let outcome = engine(&transport, &store)
            .place(&CorrelationId::from("sgx_5"), &spec(), &VariationPolicy::default())
            .await
            .unwrap();
        assert!(matches!(outcome, PlacementOutcome::PartialWithError { verified: false, .. }));
        assert_eq!(transport.submit_count(), 1);
        assert!(!outcome.is_placed());
    }

    #[tokio::test]
    async fn test_transport_failure_stops_probing() {
        let transport = Arc::new(MockTransport::new());
        let store = Arc::new(MemoryStore::new());
        transport.push_submit(Err(TransportError::Timeout("8000ms".into())));

        let outcome = engine(&transport, &store)
            .place(&CorrelationId::from("sgx_6"), &spec(), &VariationPolicy::default())
            .await
            .unwrap();
        assert!(matches!(outcome, PlacementOutcome::Exhausted { .. }));
        assert_eq!(outcome.attempts()[0].classification, ProbeClassification::TransportFailure);
        assert_eq!(transport.submit_count(), 1);
    }

    #[tokio::test]
    async fn test_verified_with_error_code_is_partial() {
        let transport = Arc::new(MockTransport::new());
        let store = Arc::new(MemoryStore::new());
        transport.push_submit(Ok(SubmitResponse {
            http_status: 200,
            body: serde_json::json!({ "code": "1", "msg": "partial batch failure", "data": [{ "ordId": "tp-9" }] }),
        }));

        let outcome = engine(&transport, &store)
            .place(&CorrelationId::from("sgx_7"), &spec(), &VariationPolicy::default())
            .await
            .unwrap();
        match outcome {
            PlacementOutcome::PartialWithError {
                order_id,
                error,
                verified,
                ..
            } => {
                assert_eq!(order_id, "tp-9");
                assert!(verified);
                assert!(error.contains("partial batch failure"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unpersisted_attempt_stops_loop() {
        let transport = Arc::new(MockTransport::new());
        let store = Arc::new(MemoryStore::new());
        transport.set_submit_handler(|_| Ok(SubmitResponse::rejected(400, "51000", "bad")));
        store.set_unavailable(true);

        let result = engine(&transport, &store)
            .place(&CorrelationId::from("sgx_8"), &spec(), &VariationPolicy::default())
            .await;
        assert!(result.is_err());
        assert_eq!(transport.submit_count(), 1);
    }
}
