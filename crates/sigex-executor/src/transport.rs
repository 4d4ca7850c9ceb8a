//! Exchange transport abstraction.
//!
//! Authentication and signing belong to the transport. This module adds:
//! - response field extraction (order id, error code, message)
//! - [`RetryingTransport`]: per-call timeout plus one same-payload retry on
//!   pure transport errors
//! - [`MockTransport`]: scripted transport for tests and dry runs

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use sigex_core::BoxFuture;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("connection failed: {0}")]
    Connection(String),

    /// Response could not be interpreted. Not retried.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl TransportError {
    /// Pure transport failures that may be replayed with the same payload.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Connection(_))
    }
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Raw submission response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub http_status: u16,
    pub body: Value,
}

const ORDER_ID_FIELDS: [&str; 4] = ["order_id", "orderId", "ordId", "algoId"];
const CODE_FIELDS: [&str; 3] = ["code", "error_code", "sCode"];
const MESSAGE_FIELDS: [&str; 4] = ["msg", "message", "sMsg", "error"];

impl SubmitResponse {
    pub fn accepted(order_id: &str) -> Self {
        Self {
            http_status: 200,
            body: serde_json::json!({ "code": "0", "order_id": order_id }),
        }
    }

    pub fn rejected(http_status: u16, code: &str, message: &str) -> Self {
        Self {
            http_status,
            body: serde_json::json!({ "code": code, "msg": message }),
        }
    }

    pub fn is_http_success(&self) -> bool {
        (200..300).contains(&self.http_status)
    }

    /// Order id from the body root, `data`, or the first element of `data`.
    pub fn order_id(&self) -> Option<String> {
        self.field(&ORDER_ID_FIELDS)
    }

    /// Exchange error code. `"0"` means no error.
    pub fn error_code(&self) -> Option<String> {
        self.field(&CODE_FIELDS).filter(|c| c != "0")
    }

    pub fn message(&self) -> Option<String> {
        self.field(&MESSAGE_FIELDS)
    }

    /// True if the exchange reported any error alongside this response.
    pub fn has_error(&self) -> bool {
        !self.is_http_success() || self.error_code().is_some()
    }

    /// `http {status}: {code}: {message}`, with absent parts left out.
    pub fn error_text(&self) -> String {
        let mut parts = vec![format!("http {}", self.http_status)];
        parts.extend(self.error_code());
        parts.extend(self.message());
        parts.join(": ")
    }

    fn field(&self, names: &[&str]) -> Option<String> {
        let data = self.body.get("data");
        let nested = match data {
            Some(Value::Array(items)) => items.first(),
            other => other,
        };
        [Some(&self.body), nested]
            .into_iter()
            .flatten()
            .find_map(|obj| names.iter().find_map(|n| scalar(obj.get(*n)?)))
    }
}

fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Result of an order existence check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLookup {
    pub exists: bool,
    pub status: Option<String>,
}

const DEAD_STATUSES: [&str; 6] = ["cancelled", "canceled", "rejected", "failed", "expired", "not_found"];

impl OrderLookup {
    pub fn live(status: &str) -> Self {
        Self {
            exists: true,
            status: Some(status.to_string()),
        }
    }

    pub fn missing() -> Self {
        Self {
            exists: false,
            status: None,
        }
    }

    /// Exists and has not been cancelled or rejected after acceptance.
    pub fn is_live(&self) -> bool {
        self.exists
            && !self
                .status
                .as_deref()
                .map(|s| DEAD_STATUSES.contains(&s.to_ascii_lowercase().as_str()))
                .unwrap_or(false)
    }
}

/// Exchange transport. Implementations own authentication and signing.
pub trait ExchangeTransport: Send + Sync {
    fn submit_order(&self, payload: Value) -> BoxFuture<'_, TransportResult<SubmitResponse>>;

    fn get_order(&self, order_id: &str) -> BoxFuture<'_, TransportResult<OrderLookup>>;
}

/// Arc wrapper for transport trait objects.
pub type DynTransport = Arc<dyn ExchangeTransport>;

// ============================================================================
// RetryingTransport
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Pause before the single same-payload retry.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_request_timeout_ms() -> u64 {
    8_000
}

fn default_retry_delay_ms() -> u64 {
    200
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

/// Bounds every call with a timeout and replays it once on a pure transport
/// error. Variation changes are not this layer's concern.
pub struct RetryingTransport {
    inner: DynTransport,
    config: TransportConfig,
}

impl RetryingTransport {
    pub fn new(inner: DynTransport, config: TransportConfig) -> Self {
        Self { inner, config }
    }

    async fn call<R, F, Fut>(&self, op: &'static str, f: F) -> TransportResult<R>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = TransportResult<R>>,
    {
        let limit = Duration::from_millis(self.config.request_timeout_ms);
        let first = Self::bounded(op, limit, f()).await;
        let err = match first {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => e,
        };

        warn!(op, error = %err, "Transport error, replaying same payload once");
        tokio::time::sleep(Duration::from_millis(self.config.retry_delay_ms)).await;
        Self::bounded(op, limit, f()).await
    }

    async fn bounded<R>(
        op: &'static str,
        limit: Duration,
        fut: impl Future<Output = TransportResult<R>>,
    ) -> TransportResult<R> {
        match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(format!(
                "{op} exceeded {}ms",
                limit.as_millis()
            ))),
        }
    }
}

impl ExchangeTransport for RetryingTransport {
    fn submit_order(&self, payload: Value) -> BoxFuture<'_, TransportResult<SubmitResponse>> {
        Box::pin(async move {
            self.call("submit_order", || self.inner.submit_order(payload.clone()))
                .await
        })
    }

    fn get_order(&self, order_id: &str) -> BoxFuture<'_, TransportResult<OrderLookup>> {
        let order_id = order_id.to_string();
        Box::pin(async move { self.call("get_order", || self.inner.get_order(&order_id)).await })
    }
}

// ============================================================================
// MockTransport
// ============================================================================

type SubmitHandler = Box<dyn Fn(&Value) -> TransportResult<SubmitResponse> + Send + Sync>;

/// Scripted exchange for tests.
///
/// Submission results come from, in order of precedence: the queue filled by
/// [`push_submit`](Self::push_submit), the handler set by
/// [`set_submit_handler`](Self::set_submit_handler), or a default that
/// accepts with a fresh id. Ids returned by accepted submissions are live
/// unless overridden with [`set_lookup`](Self::set_lookup).
#[derive(Default)]
pub struct MockTransport {
    submits: Mutex<Vec<Value>>,
    lookups_made: Mutex<Vec<String>>,
    script: Mutex<VecDeque<TransportResult<SubmitResponse>>>,
    handler: Mutex<Option<SubmitHandler>>,
    lookups: Mutex<HashMap<String, OrderLookup>>,
    fail_all_lookups: AtomicBool,
    next_id: AtomicU64,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the result of the next submission.
    pub fn push_submit(&self, result: TransportResult<SubmitResponse>) {
        self.script.lock().push_back(result);
    }

    /// Decide submission results from the payload.
    pub fn set_submit_handler(
        &self,
        handler: impl Fn(&Value) -> TransportResult<SubmitResponse> + Send + Sync + 'static,
    ) {
        *self.handler.lock() = Some(Box::new(handler));
    }

    pub fn set_lookup(&self, order_id: &str, lookup: OrderLookup) {
        self.lookups.lock().insert(order_id.to_string(), lookup);
    }

    pub fn set_fail_all_lookups(&self, fail: bool) {
        self.fail_all_lookups.store(fail, Ordering::SeqCst);
    }

    /// Every payload submitted, in order.
    pub fn submits(&self) -> Vec<Value> {
        self.submits.lock().clone()
    }

    pub fn submit_count(&self) -> usize {
        self.submits.lock().len()
    }

    pub fn lookups_made(&self) -> Vec<String> {
        self.lookups_made.lock().clone()
    }

    fn respond(&self, payload: &Value) -> TransportResult<SubmitResponse> {
        if let Some(scripted) = self.script.lock().pop_front() {
            return scripted;
        }
        if let Some(handler) = self.handler.lock().as_ref() {
            return handler(payload);
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(SubmitResponse::accepted(&format!("mock-{id}")))
    }
}

impl ExchangeTransport for MockTransport {
    fn submit_order(&self, payload: Value) -> BoxFuture<'_, TransportResult<SubmitResponse>> {
        let result = self.respond(&payload);
        if let Ok(response) = &result {
            if let Some(id) = response.order_id() {
                self.lookups
                    .lock()
                    .entry(id)
                    .or_insert_with(|| OrderLookup::live("open"));
            }
        }
        debug!(?payload, "Mock submit");
        self.submits.lock().push(payload);
        Box::pin(std::future::ready(result))
    }

    fn get_order(&self, order_id: &str) -> BoxFuture<'_, TransportResult<OrderLookup>> {
        self.lookups_made.lock().push(order_id.to_string());
        let result = if self.fail_all_lookups.load(Ordering::SeqCst) {
            Err(TransportError::Connection("lookup failed".to_string()))
        } else {
            Ok(self
                .lookups
                .lock()
                .get(order_id)
                .cloned()
                .unwrap_or_else(OrderLookup::missing))
        };
        Box::pin(std::future::ready(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn test_order_id_extraction() {
        let root = SubmitResponse {
            http_status: 200,
            body: json!({ "orderId": 123 }),
        };
        assert_eq!(root.order_id().as_deref(), Some("123"));

        let nested = SubmitResponse {
            http_status: 200,
            body: json!({ "code": "0", "data": [{ "ordId": "abc", "sCode": "0" }] }),
        };
        assert_eq!(nested.order_id().as_deref(), Some("abc"));
        assert!(!nested.has_error());

        let rejected = SubmitResponse::rejected(400, "51000", "Parameter side error");
        assert!(rejected.order_id().is_none());
        assert_eq!(rejected.error_code().as_deref(), Some("51000"));
        assert_eq!(rejected.message().as_deref(), Some("Parameter side error"));
        assert!(rejected.has_error());
    }

    #[test]
    fn test_lookup_liveness() {
        assert!(OrderLookup::live("open").is_live());
        assert!(!OrderLookup::live("CANCELLED").is_live());
        assert!(!OrderLookup::missing().is_live());
        let no_status = OrderLookup {
            exists: true,
            status: None,
        };
        assert!(no_status.is_live());
    }

    struct FlakyTransport {
        failures: AtomicU32,
        calls: AtomicU32,
        error: TransportError,
    }

    impl ExchangeTransport for FlakyTransport {
        fn submit_order(&self, _payload: Value) -> BoxFuture<'_, TransportResult<SubmitResponse>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let fail = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            let result = if fail {
                Err(self.error.clone())
            } else {
                Ok(SubmitResponse::accepted("ok-1"))
            };
            Box::pin(std::future::ready(result))
        }

        fn get_order(&self, _order_id: &str) -> BoxFuture<'_, TransportResult<OrderLookup>> {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(OrderLookup::live("open"))
            })
        }
    }

    fn flaky(failures: u32, error: TransportError) -> Arc<FlakyTransport> {
        Arc::new(FlakyTransport {
            failures: AtomicU32::new(failures),
            calls: AtomicU32::new(0),
            error,
        })
    }

    fn config() -> TransportConfig {
        TransportConfig {
            request_timeout_ms: 50,
            retry_delay_ms: 0,
        }
    }

    #[tokio::test]
    async fn test_single_retry_on_connection_error() {
        let inner = flaky(1, TransportError::Connection("reset".into()));
        let transport = RetryingTransport::new(inner.clone(), config());
        let response = transport.submit_order(json!({})).await.unwrap();
        assert_eq!(response.order_id().as_deref(), Some("ok-1"));
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retry_is_bounded_to_one() {
        let inner = flaky(5, TransportError::Connection("reset".into()));
        let transport = RetryingTransport::new(inner.clone(), config());
        assert!(transport.submit_order(json!({})).await.is_err());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_protocol_error_not_retried() {
        let inner = flaky(1, TransportError::Protocol("bad json".into()));
        let transport = RetryingTransport::new(inner.clone(), config());
        assert!(transport.submit_order(json!({})).await.is_err());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_becomes_transport_error() {
        let inner = flaky(0, TransportError::Connection("unused".into()));
        let transport = RetryingTransport::new(inner, config());
        let err = transport.get_order("x").await.unwrap_err();
        assert!(matches!(err, TransportError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_mock_registers_accepted_ids_as_live() {
        let mock = MockTransport::new();
        let response = mock.submit_order(json!({ "n": 1 })).await.unwrap();
        let id = response.order_id().unwrap();
        assert!(mock.get_order(&id).await.unwrap().is_live());
        assert!(!mock.get_order("unknown").await.unwrap().exists);

        mock.push_submit(Ok(SubmitResponse::rejected(400, "1", "no")));
        assert!(mock.submit_order(json!({})).await.unwrap().order_id().is_none());
        assert_eq!(mock.submit_count(), 2);
    }
}
