//! Operator notification channel.
//!
//! `notify` is fire-and-forget: it never blocks the pipeline and delivery
//! failures are only logged and counted.

use std::time::Duration;

use parking_lot::Mutex;
use reqwest::Client;
use serde::Serialize;
use tracing::{error, info, warn};

use sigex_core::DecisionTrace;

use crate::error::{TelemetryError, TelemetryResult};
use crate::metrics::Metrics;

/// Best-effort push of human-readable decision summaries.
pub trait Notifier: Send + Sync {
    fn notify(&self, trace: &DecisionTrace);
}

/// Writes summaries to the log only.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, trace: &DecisionTrace) {
        if trace.kind.is_high_priority() {
            error!(
                correlation_id = %trace.correlation_id,
                kind = %trace.kind,
                "OPERATOR ALERT: {}",
                trace.summary()
            );
        } else if trace.kind.is_escalation() {
            warn!(
                correlation_id = %trace.correlation_id,
                kind = %trace.kind,
                "Operator notice: {}",
                trace.summary()
            );
        } else {
            info!(
                correlation_id = %trace.correlation_id,
                kind = %trace.kind,
                "Outcome: {}",
                trace.summary()
            );
        }
    }
}

#[derive(Serialize)]
struct WebhookMessage<'a> {
    text: String,
    priority: &'a str,
    trace: &'a DecisionTrace,
}

/// Posts summaries to a webhook (chat-bot relay or similar).
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: &str, timeout: Duration) -> TelemetryResult<Self> {
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(TelemetryError::Notifier(format!("invalid webhook url: {url}")));
        }
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }

    async fn send(client: Client, url: String, body: serde_json::Value) -> TelemetryResult<()> {
        let response = client.post(&url).json(&body).send().await?;
        if response.status().is_success() {
            info!("Operator notification delivered");
            Ok(())
        } else {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            Err(TelemetryError::Notifier(format!("webhook returned {status}: {text}")))
        }
    }
}

impl Notifier for WebhookNotifier {
    fn notify(&self, trace: &DecisionTrace) {
        let message = WebhookMessage {
            text: trace.summary(),
            priority: if trace.kind.is_high_priority() { "high" } else { "normal" },
            trace,
        };
        let body = match serde_json::to_value(&message) {
            Ok(body) => body,
            Err(e) => {
                warn!(?e, "Failed to serialize notification");
                Metrics::notify_failure("webhook");
                return;
            }
        };

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("No runtime for webhook notification, logging instead");
            LogNotifier.notify(trace);
            return;
        };

        let client = self.client.clone();
        let url = self.url.clone();
        let correlation_id = trace.correlation_id.clone();
        handle.spawn(async move {
            if let Err(e) = Self::send(client, url, body).await {
                error!(%correlation_id, error = %e, "Operator notification failed");
                Metrics::notify_failure("webhook");
            }
        });
    }
}

/// Keeps every notified trace in memory; used by tests and dry runs.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<DecisionTrace>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<DecisionTrace> {
        self.sent.lock().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, trace: &DecisionTrace) {
        self.sent.lock().push(trace.clone());
    }
}
