//! End-to-end pipeline tests.
//!
//! Signal -> gate -> entry -> fill -> SL/TP placement, with the exchange
//! mocked at the transport boundary.

mod integration;
use integration::common::harness::{signal, Pipeline, INSTRUMENT};

use std::time::Duration;

use chrono::Utc;
use rust_decimal_macros::dec;
use serde_json::json;
use tempfile::TempDir;
use tokio::time::timeout;

use sigex_bot::{AppConfig, Application, ExchangeEvent};
use sigex_core::{
    DecisionKind, InstrumentId, IntentStatus, OrderKind, OrderSide, Price, ProbeClassification,
    Size,
};
use sigex_executor::{SignalOutcome, SubmitResponse};
use sigex_persistence::{IntentFilter, IntentStore, ProbeAttemptStore, TraceStore};

fn fill_qty() -> Size {
    Size::new(dec!(2))
}

async fn submit(pipeline: &Pipeline, side: OrderSide) -> sigex_core::CorrelationId {
    let outcome = pipeline
        .machine
        .on_signal(&signal(side, "rsi", Price::new(dec!(100))), fill_qty(), Utc::now())
        .await
        .unwrap();
    match outcome {
        SignalOutcome::Submitted(id) => id,
        other => panic!("entry not submitted: {other:?}"),
    }
}

/// Concurrent signals for one (instrument, side) produce exactly one intent.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_signals_approve_exactly_one() {
    let pipeline = Pipeline::new();

    let mut handles = Vec::new();
    for i in 0..10u32 {
        let machine = pipeline.machine.clone();
        let strategy = if i % 2 == 0 { "rsi" } else { "macd" };
        let price = Price::new(dec!(100) + rust_decimal::Decimal::from(i));
        handles.push(tokio::spawn(async move {
            machine
                .on_signal(&signal(OrderSide::Buy, strategy, price), fill_qty(), Utc::now())
                .await
                .unwrap()
        }));
    }

    let mut submitted = 0;
    let mut denied = 0;
    for handle in handles {
        match handle.await.unwrap() {
            SignalOutcome::Submitted(_) => submitted += 1,
            SignalOutcome::Denied { .. } => denied += 1,
            SignalOutcome::Rejected(_) => panic!("entry should be accepted"),
        }
    }
    assert_eq!(submitted, 1);
    assert_eq!(denied, 9);

    let intents = pipeline.store.list_intents(IntentFilter::default()).await.unwrap();
    assert_eq!(intents.len(), 1);
    assert_eq!(pipeline.transport.submit_count(), 1);

    let traces = pipeline
        .store
        .traces_between(Utc::now() - chrono::Duration::minutes(1), Utc::now())
        .await
        .unwrap();
    let approved = traces.iter().filter(|t| t.kind == DecisionKind::Approved).count();
    assert_eq!(approved, 1);
    let denials = traces
        .iter()
        .filter(|t| matches!(t.kind, DecisionKind::Throttled | DecisionKind::IntentInFlight))
        .count();
    assert_eq!(denials, 9);
}

/// The opposite side of the same instrument is its own lane.
#[tokio::test]
async fn test_opposite_side_is_independent() {
    let pipeline = Pipeline::new();
    submit(&pipeline, OrderSide::Buy).await;
    submit(&pipeline, OrderSide::Sell).await;

    let sells = pipeline
        .store
        .list_intents(IntentFilter {
            side: Some(OrderSide::Sell),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(sells.len(), 1);
}

/// Every variation rejected for both legs: 2 x N audited attempts and one
/// PROTECTION_FAILED trace carrying the exchange errors.
#[tokio::test]
async fn test_all_variations_rejected_fails_protection() {
    let pipeline = Pipeline::new().with_conditional_handler(|_| {
        Ok(SubmitResponse::rejected(400, "51000", "Parameter side error"))
    });
    let id = submit(&pipeline, OrderSide::Buy).await;

    let status = pipeline
        .machine
        .on_fill(&id, Price::new(dec!(100)), fill_qty(), Utc::now())
        .await
        .unwrap();
    assert_eq!(status, IntentStatus::ProtectionFailed);

    let attempts = pipeline.store.attempts_for(&id).await.unwrap();
    assert_eq!(attempts.len(), 2 * 4);
    for kind in [OrderKind::Stop, OrderKind::TakeProfit] {
        let sequences: Vec<u32> = attempts
            .iter()
            .filter(|a| a.kind == kind)
            .map(|a| a.sequence)
            .collect();
        assert_eq!(sequences, vec![1, 2, 3, 4]);
    }
    assert!(attempts
        .iter()
        .all(|a| a.classification == ProbeClassification::HardReject));

    let traces = pipeline.store.traces_for(&id).await.unwrap();
    let failed: Vec<_> = traces
        .iter()
        .filter(|t| t.kind == DecisionKind::ProtectionFailed)
        .collect();
    assert_eq!(failed.len(), 1);
    let raw = failed[0].raw_error.as_deref().unwrap();
    assert!(!raw.is_empty());
    assert!(raw.contains("[SL]"));
    assert!(raw.contains("[TP]"));
    assert!(raw.contains("51000: Parameter side error"));

    let alert = pipeline.notifier.sent().pop().unwrap();
    assert_eq!(alert.kind, DecisionKind::ProtectionFailed);
    assert!(alert.kind.is_high_priority());
}

/// Stop leg lands, take-profit leg exhausts: PARTIAL, and the alert names
/// the unprotected leg.
#[tokio::test]
async fn test_one_leg_failing_is_partial() {
    let pipeline = Pipeline::new().with_conditional_handler(|payload| {
        if payload["order_type"] == "TAKE_PROFIT" {
            Ok(SubmitResponse::rejected(400, "51279", "TP trigger price cannot be lower than the last price"))
        } else {
            Ok(SubmitResponse::accepted("sl-1"))
        }
    });
    let id = submit(&pipeline, OrderSide::Buy).await;

    let status = pipeline
        .machine
        .on_fill(&id, Price::new(dec!(100)), fill_qty(), Utc::now())
        .await
        .unwrap();
    assert_eq!(status, IntentStatus::ProtectionPartial);

    let intent = pipeline.machine.intent(&id).await.unwrap().unwrap();
    assert!(intent.is_terminal());

    let alert = pipeline.notifier.sent().pop().unwrap();
    assert_eq!(alert.kind, DecisionKind::ProtectionPartial);
    assert!(alert.reason_message.contains("SL placed (order sl-1, 1 attempt)"));
    assert!(alert.reason_message.contains("TP FAILED after 4 attempts"));
    let raw = alert.raw_error.unwrap();
    assert!(raw.starts_with("[TP]"));
    assert!(raw.contains("TP trigger price cannot be lower than the last price"));
    assert!(!raw.contains("[SL]"));

    let attempts = pipeline.store.attempts_for(&id).await.unwrap();
    assert_eq!(attempts.len(), 1 + 4);
}

/// The exchange refuses an explicit side; the next variation omits it.
#[tokio::test]
async fn test_falls_back_to_next_variation() {
    let pipeline = Pipeline::new().with_conditional_handler(|payload| {
        if payload.get("side").is_some() {
            Ok(SubmitResponse::rejected(400, "51000", "Parameter side error"))
        } else {
            let kind = payload["order_type"].as_str().unwrap_or_default().to_lowercase();
            Ok(SubmitResponse::accepted(&format!("{kind}-ok")))
        }
    });
    let id = submit(&pipeline, OrderSide::Buy).await;

    let status = pipeline
        .machine
        .on_fill(&id, Price::new(dec!(100)), fill_qty(), Utc::now())
        .await
        .unwrap();
    assert_eq!(status, IntentStatus::ProtectionPlaced);

    let attempts = pipeline.store.attempts_for(&id).await.unwrap();
    assert_eq!(attempts.len(), 4);
    let stop: Vec<_> = attempts.iter().filter(|a| a.kind == OrderKind::Stop).collect();
    assert_eq!(stop[0].variation_id, "explicit_side_str");
    assert_eq!(stop[0].error_code.as_deref(), Some("51000"));
    assert_eq!(stop[1].variation_id, "omit_side_str");
    assert!(stop[1].existence_verified);
    assert!(stop[1].payload.get("side").is_none());
}

/// Short entry: protective legs buy back, stop above and take-profit below.
#[tokio::test]
async fn test_sell_entry_protection_geometry() {
    let pipeline = Pipeline::new();
    let id = submit(&pipeline, OrderSide::Sell).await;

    pipeline
        .machine
        .on_fill(&id, Price::new(dec!(100)), fill_qty(), Utc::now())
        .await
        .unwrap();

    let submits = pipeline.transport.submits();
    let stop = submits.iter().find(|p| p["order_type"] == "STOP").unwrap();
    let tp = submits.iter().find(|p| p["order_type"] == "TAKE_PROFIT").unwrap();

    assert_eq!(stop["side"], "BUY");
    assert_eq!(stop["price"], json!("103"));
    assert_eq!(stop["trigger_condition"], json!(">=103.78"));
    assert_eq!(tp["side"], "BUY");
    assert_eq!(tp["trigger_price"], json!("94"));
    assert_eq!(tp["quantity"], json!("2"));
}

/// Trace store down: traces land in the local fallback and the intent
/// still progresses.
#[tokio::test]
async fn test_trace_store_outage_uses_fallback() {
    let pipeline = Pipeline::new();
    pipeline.store.set_traces_unavailable(true);

    let id = submit(&pipeline, OrderSide::Buy).await;
    let status = pipeline
        .machine
        .on_fill(&id, Price::new(dec!(100)), fill_qty(), Utc::now())
        .await
        .unwrap();
    assert_eq!(status, IntentStatus::ProtectionPlaced);

    let fallback = pipeline.recorder.fallback_traces().unwrap();
    let kinds: Vec<DecisionKind> = fallback
        .iter()
        .filter(|t| t.correlation_id == id)
        .map(|t| t.kind)
        .collect();
    assert_eq!(
        kinds,
        vec![
            DecisionKind::Approved,
            DecisionKind::EntrySubmitted,
            DecisionKind::EntryFilled,
            DecisionKind::ProtectionPending,
            DecisionKind::ProtectionPlaced,
        ]
    );
    assert_eq!(pipeline.notifier.sent_count(), 1);
}

/// Paper mode through the application: replayed signal, simulated fill,
/// protective orders resting on the paper exchange.
#[tokio::test]
async fn test_paper_mode_round_trip() {
    let dir = TempDir::new().unwrap();
    let signals = dir.path().join("signals.jsonl");
    std::fs::write(
        &signals,
        format!(
            "{}\n",
            json!({
                "instrument": INSTRUMENT,
                "side": "BUY",
                "strategy_key": "rsi",
                "signal_price": "250.00",
                "timestamp": "2026-01-05T10:00:00Z",
            })
        ),
    )
    .unwrap();

    let toml = format!(
        r#"
        [[watchlist]]
        instrument = "{INSTRUMENT}"
        tick_size = "0.01"
        lot_size = "0.1"
        order_qty = "1.25"

        [probe]
        verify_delay_ms = 0

        [persistence]
        data_dir = "{data}"

        [paper]
        signals_path = "{signals}"
        fill_delay_ms = 10
        "#,
        data = dir.path().display(),
        signals = signals.display(),
    );
    let config = AppConfig::from_toml(&toml).unwrap();
    let mut app = Application::paper(config).unwrap();

    let report = app.scan_once(Utc::now()).await;
    assert_eq!(report.submitted, 1);

    let event = timeout(Duration::from_secs(2), app.recv_event())
        .await
        .unwrap()
        .unwrap();
    let ExchangeEvent::Filled { quantity, price, .. } = &event else {
        panic!("expected fill, got {event:?}");
    };
    assert_eq!(*quantity, Size::new(dec!(1.2)));
    assert_eq!(*price, Price::new(dec!(250)));

    let status = app.handle_event(event).await.unwrap();
    assert_eq!(status, IntentStatus::ProtectionPlaced);

    let intents = app
        .store()
        .list_intents(IntentFilter {
            instrument: Some(InstrumentId::from(INSTRUMENT)),
            status: Some(IntentStatus::ProtectionPlaced),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(intents.len(), 1);

    // Nothing left to replay.
    let report = app.scan_once(Utc::now()).await;
    assert_eq!(report.signals, 0);
}
