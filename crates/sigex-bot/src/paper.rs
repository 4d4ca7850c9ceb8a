//! Paper-trading collaborators.
//!
//! [`PaperExchange`] stands in for the exchange: entry orders are accepted
//! and filled at their limit price after a delay, conditional orders are
//! accepted and kept live. [`JsonlSignalFeed`] replays signals from a JSON
//! Lines file, one signal per instrument per scan.

use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use sigex_core::{BoxFuture, CorrelationId, InstrumentId, Price, Signal, Size};
use sigex_executor::{
    ExchangeTransport, MarketFeed, OrderLookup, SubmitResponse, TransportError, TransportResult,
};

use crate::error::{AppError, AppResult};

/// Asynchronous order events delivered to the fill path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeEvent {
    Filled {
        correlation_id: CorrelationId,
        price: Price,
        quantity: Size,
        at: DateTime<Utc>,
    },
    Rejected {
        correlation_id: CorrelationId,
        code: String,
        message: String,
    },
}

impl ExchangeEvent {
    pub fn correlation_id(&self) -> &CorrelationId {
        match self {
            Self::Filled { correlation_id, .. } | Self::Rejected { correlation_id, .. } => {
                correlation_id
            }
        }
    }
}

// ============================================================================
// PaperExchange
// ============================================================================

/// Simulated exchange.
pub struct PaperExchange {
    events: mpsc::Sender<ExchangeEvent>,
    fill_delay: Duration,
    next_id: AtomicU64,
    orders: Mutex<HashMap<String, Value>>,
}

impl PaperExchange {
    pub fn new(events: mpsc::Sender<ExchangeEvent>, fill_delay: Duration) -> Self {
        Self {
            events,
            fill_delay,
            next_id: AtomicU64::new(1),
            orders: Mutex::new(HashMap::new()),
        }
    }

    /// Conditional orders currently live.
    pub fn conditional_orders(&self) -> Vec<Value> {
        self.orders
            .lock()
            .values()
            .filter(|order| order.get("trigger_price").is_some())
            .cloned()
            .collect()
    }

    fn accept(&self, payload: Value) -> String {
        let order_id = format!("paper-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        self.orders.lock().insert(order_id.clone(), payload);
        order_id
    }

    fn schedule_fill(&self, payload: &Value) -> TransportResult<()> {
        let correlation_id = text(payload, "client_order_id")
            .ok_or_else(|| TransportError::Protocol("entry without client_order_id".to_string()))?;
        let price = decimal(payload, "price")
            .ok_or_else(|| TransportError::Protocol("entry without price".to_string()))?;
        let quantity = decimal(payload, "quantity")
            .ok_or_else(|| TransportError::Protocol("entry without quantity".to_string()))?;

        let correlation_id = CorrelationId::from(correlation_id.as_str());
        let events = self.events.clone();
        let delay = self.fill_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let event = ExchangeEvent::Filled {
                correlation_id,
                price: Price::new(price),
                quantity: Size::new(quantity),
                at: Utc::now(),
            };
            if events.send(event).await.is_err() {
                debug!("Fill dropped, event receiver closed");
            }
        });
        Ok(())
    }
}

impl ExchangeTransport for PaperExchange {
    fn submit_order(&self, payload: Value) -> BoxFuture<'_, TransportResult<SubmitResponse>> {
        Box::pin(async move {
            let is_conditional = payload.get("trigger_price").is_some();
            if !is_conditional {
                self.schedule_fill(&payload)?;
            }
            let order_id = self.accept(payload);
            info!(%order_id, conditional = is_conditional, "Paper order accepted");
            Ok(SubmitResponse::accepted(&order_id))
        })
    }

    fn get_order(&self, order_id: &str) -> BoxFuture<'_, TransportResult<OrderLookup>> {
        let lookup = if self.orders.lock().contains_key(order_id) {
            OrderLookup::live("live")
        } else {
            OrderLookup::missing()
        };
        Box::pin(std::future::ready(Ok(lookup)))
    }
}

fn text(payload: &Value, field: &str) -> Option<String> {
    match payload.get(field)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn decimal(payload: &Value, field: &str) -> Option<Decimal> {
    Decimal::from_str(&text(payload, field)?).ok()
}

// ============================================================================
// JsonlSignalFeed
// ============================================================================

/// Replays signals from a JSON Lines file. The current price of an
/// instrument is the price of its last consumed signal.
#[derive(Debug, Default)]
pub struct JsonlSignalFeed {
    queues: Mutex<HashMap<InstrumentId, VecDeque<Signal>>>,
    prices: Mutex<HashMap<InstrumentId, Price>>,
}

impl JsonlSignalFeed {
    /// Load signals. Lines that do not parse are skipped with a warning.
    pub fn load(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .map_err(|e| AppError::Feed(format!("cannot open {}: {e}", path.display())))?;

        let feed = Self::default();
        let mut loaded = 0usize;
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Signal>(&line) {
                Ok(signal) => {
                    feed.push(signal);
                    loaded += 1;
                }
                Err(e) => warn!(path = %path.display(), line = idx + 1, error = %e, "Skipping bad signal line"),
            }
        }
        info!(path = %path.display(), loaded, "Signal replay loaded");
        Ok(feed)
    }

    pub fn push(&self, signal: Signal) {
        self.queues
            .lock()
            .entry(signal.instrument.clone())
            .or_default()
            .push_back(signal);
    }

    pub fn pending(&self) -> usize {
        self.queues.lock().values().map(VecDeque::len).sum()
    }
}

impl MarketFeed for JsonlSignalFeed {
    fn current_price(&self, instrument: &InstrumentId) -> BoxFuture<'_, Option<Price>> {
        let price = self.prices.lock().get(instrument).copied();
        Box::pin(std::future::ready(price))
    }

    fn latest_signal(&self, instrument: &InstrumentId) -> BoxFuture<'_, Option<Signal>> {
        let signal = self
            .queues
            .lock()
            .get_mut(instrument)
            .and_then(VecDeque::pop_front);
        if let Some(signal) = &signal {
            self.prices
                .lock()
                .insert(signal.instrument.clone(), signal.signal_price);
        }
        Box::pin(std::future::ready(signal))
    }
}
