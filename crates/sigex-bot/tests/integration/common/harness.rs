//! Pipeline harness over the in-memory store, mock transport and a
//! recording notifier.

#![allow(dead_code)]

use std::sync::Arc;

use chrono::Utc;
use rust_decimal_macros::dec;
use serde_json::Value;
use tempfile::TempDir;

use sigex_core::{InstrumentId, InstrumentSpec, OrderSide, Price, RetryPolicy, Signal, Size};
use sigex_executor::{
    MachineConfig, MachineDeps, MockTransport, OrderIntentStateMachine, ProbeConfig,
    StaticMarketFeed, SubmitResponse, TransportResult, VariationPolicy,
};
use sigex_gate::{GateConfig, SignalThrottleGate};
use sigex_persistence::{DecisionTraceRecorder, MemoryStore, RecorderConfig};
use sigex_telemetry::RecordingNotifier;

pub const INSTRUMENT: &str = "X";

pub struct Pipeline {
    pub machine: Arc<OrderIntentStateMachine>,
    pub store: Arc<MemoryStore>,
    pub transport: Arc<MockTransport>,
    pub feed: Arc<StaticMarketFeed>,
    pub notifier: Arc<RecordingNotifier>,
    pub recorder: Arc<DecisionTraceRecorder>,
    pub dir: TempDir,
}

impl Pipeline {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(MockTransport::new());
        let feed = Arc::new(StaticMarketFeed::new());
        let notifier = Arc::new(RecordingNotifier::new());

        let gate = Arc::new(SignalThrottleGate::new(
            store.clone(),
            store.clone(),
            GateConfig {
                retry: RetryPolicy::immediate(3),
                ..Default::default()
            },
        ));
        let recorder = Arc::new(DecisionTraceRecorder::new(
            store.clone(),
            dir.path(),
            RecorderConfig {
                retry: RetryPolicy::immediate(2),
                op_timeout_ms: 1_000,
            },
        ));
        let deps = MachineDeps {
            gate,
            intents: store.clone(),
            attempts: store.clone(),
            recorder: recorder.clone(),
            transport: transport.clone(),
            feed: feed.clone(),
            notifier: notifier.clone(),
        };
        let config = MachineConfig {
            storage_retry: RetryPolicy::immediate(3),
            probe: ProbeConfig {
                verify_delay_ms: 0,
                storage_retry: RetryPolicy::immediate(3),
                op_timeout_ms: 1_000,
            },
            ..Default::default()
        };
        let instruments = vec![InstrumentSpec::new(
            InstrumentId::from(INSTRUMENT),
            Price::new(dec!(0.01)),
            Size::new(dec!(0.001)),
        )];
        let machine = Arc::new(OrderIntentStateMachine::new(
            deps,
            instruments,
            VariationPolicy::default(),
            config,
        ));
        feed.set_price(&InstrumentId::from(INSTRUMENT), Price::new(dec!(100)));

        Self {
            machine,
            store,
            transport,
            feed,
            notifier,
            recorder,
            dir,
        }
    }

    /// Accept entries; answer conditional orders with `conditional`.
    pub fn with_conditional_handler(
        self,
        conditional: impl Fn(&Value) -> TransportResult<SubmitResponse> + Send + Sync + 'static,
    ) -> Self {
        let next = std::sync::atomic::AtomicU64::new(0);
        self.transport.set_submit_handler(move |payload| {
            if payload["order_type"] == "LIMIT" {
                let n = next.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Ok(SubmitResponse::accepted(&format!("entry-{n}")))
            } else {
                conditional(payload)
            }
        });
        self
    }
}

pub fn signal(side: OrderSide, strategy: &str, price: Price) -> Signal {
    Signal {
        instrument: InstrumentId::from(INSTRUMENT),
        side,
        strategy_key: strategy.to_string(),
        signal_price: price,
        timestamp: Utc::now(),
    }
}
