//! OrderIntentStateMachine: lifecycle of one trading decision.
//!
//! ```text
//! signal -> gate -> CREATED -> ENTRY_SUBMITTED --fill--> ENTRY_FILLED -> PROTECTION_PENDING
//!                                   |                                   -> PROTECTION_PLACED
//!                                   |                                   -> PROTECTION_PARTIAL
//!                                   |                                   -> PROTECTION_FAILED
//!                                   +--reject--> ENTRY_REJECTED
//!                                   +--no fill in time--> ENTRY_TIMEOUT
//! ```
//!
//! Every transition is persisted (with bounded backoff) before the next
//! external call and traced before control returns. Terminal outcomes go to
//! the notifier. `PROTECTION_PARTIAL` is terminal: an operator decides what
//! to do with the unprotected leg.
//!
//! Transitions for one intent are serialized by a per-intent lock, so a fill
//! racing the timeout sweep resolves to exactly one of them.
//!
//! An intent left in ENTRY_FILLED or PROTECTION_PENDING by a storage outage
//! is carried forward by a redelivered fill or by
//! [`recover_stalled_protection`](OrderIntentStateMachine::recover_stalled_protection).
//! A protection outcome that could not be stored is held in memory,
//! escalated once, and stored on the next attempt. Without it (after a
//! restart) the outcome is rebuilt from the recorded probe attempts; no leg
//! is ever submitted twice.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use sigex_core::{
    CorrelationId, DecisionKind, DecisionTrace, InstrumentId, InstrumentSpec, IntentStatus,
    OrderIntent, OrderKind, Price, ProbeAttempt, ProbeClassification, RetryPolicy, Signal, Size,
};
use sigex_gate::{DenyReason, GateVerdict, KeyPermit, SignalThrottleGate};
use sigex_persistence::{
    with_timeout, DecisionTraceRecorder, IntentFilter, IntentStore, PersistenceError,
    ProbeAttemptStore, TraceContext, TraceSink,
};
use sigex_telemetry::{Metrics, Notifier};

use crate::builder::{BuildRequest, BuilderConfig, ConditionalOrderBuilder, ProtectionParams};
use crate::error::{ExecutorError, ExecutorResult};
use crate::feed::MarketFeed;
use crate::probe::{ExchangeProbeRetryEngine, PlacementOutcome, ProbeConfig};
use crate::transport::DynTransport;
use crate::variation::VariationPolicy;

// ============================================================================
// Configuration and collaborators
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineConfig {
    /// Entry orders without a fill after this long become ENTRY_TIMEOUT.
    #[serde(default = "default_fill_timeout_ms")]
    pub fill_timeout_ms: u64,
    #[serde(default)]
    pub storage_retry: RetryPolicy,
    #[serde(default = "default_op_timeout_ms")]
    pub op_timeout_ms: u64,
    #[serde(default)]
    pub builder: BuilderConfig,
    #[serde(default)]
    pub protection: ProtectionParams,
    #[serde(default)]
    pub probe: ProbeConfig,
}

fn default_fill_timeout_ms() -> u64 {
    30_000
}

fn default_op_timeout_ms() -> u64 {
    5_000
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            fill_timeout_ms: default_fill_timeout_ms(),
            storage_retry: RetryPolicy::default(),
            op_timeout_ms: default_op_timeout_ms(),
            builder: BuilderConfig::default(),
            protection: ProtectionParams::default(),
            probe: ProbeConfig::default(),
        }
    }
}

/// Everything the machine talks to.
pub struct MachineDeps {
    pub gate: Arc<SignalThrottleGate>,
    pub intents: Arc<dyn IntentStore>,
    pub attempts: Arc<dyn ProbeAttemptStore>,
    pub recorder: Arc<DecisionTraceRecorder>,
    pub transport: DynTransport,
    pub feed: Arc<dyn MarketFeed>,
    pub notifier: Arc<dyn Notifier>,
}

/// What happened to a signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalOutcome {
    /// Gate said no; `trace_id` identifies the DENY trace.
    Denied {
        reason: DenyReason,
        trace_id: CorrelationId,
    },
    /// Entry order accepted by the exchange; waiting for a fill.
    Submitted(CorrelationId),
    /// Entry order refused; the intent is terminal.
    Rejected(CorrelationId),
}

/// Result of one protective leg.
#[derive(Debug, Clone)]
pub struct LegResult {
    pub kind: OrderKind,
    pub placed: bool,
    pub order_id: Option<String>,
    pub attempts: usize,
    /// Full error text when the leg did not cleanly succeed.
    pub error: Option<String>,
}

impl LegResult {
    fn failed(kind: OrderKind, error: String) -> Self {
        Self {
            kind,
            placed: false,
            order_id: None,
            attempts: 0,
            error: Some(error),
        }
    }

    fn from_outcome(kind: OrderKind, outcome: &PlacementOutcome) -> Self {
        let error = match outcome {
            PlacementOutcome::Success { .. } => None,
            _ => Some(outcome.error_summary()),
        };
        Self {
            kind,
            placed: outcome.is_placed(),
            order_id: outcome.order_id().map(str::to_string),
            attempts: outcome.attempts().len(),
            error,
        }
    }

    /// Rebuild a leg's result from its stored attempts.
    fn from_recorded(kind: OrderKind, recorded: &[ProbeAttempt]) -> Self {
        let leg: Vec<&ProbeAttempt> = recorded.iter().filter(|a| a.kind == kind).collect();
        let verified = leg
            .iter()
            .find(|a| a.classification == ProbeClassification::VerifiedSuccess);
        let unverified = leg
            .iter()
            .find(|a| a.classification == ProbeClassification::Unverified);
        let error = match verified {
            Some(_) => None,
            None if leg.is_empty() => Some("no attempt recorded".to_string()),
            None => Some(
                leg.iter()
                    .map(|a| {
                        format!(
                            "#{} {} {}: {}",
                            a.sequence,
                            a.variation_id,
                            a.classification,
                            a.error_snippet().unwrap_or_else(|| "no error text".to_string())
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n"),
            ),
        };
        Self {
            kind,
            placed: verified.is_some(),
            order_id: verified.or(unverified).and_then(|a| a.order_id.clone()),
            attempts: leg.len(),
            error,
        }
    }

    /// e.g. `SL placed (order 123, 1 attempt)` or `TP FAILED after 4 attempts`.
    pub fn describe(&self) -> String {
        let leg = self.kind.leg_label();
        let attempts = match self.attempts {
            1 => "1 attempt".to_string(),
            n => format!("{n} attempts"),
        };
        match (self.placed, &self.order_id, &self.error) {
            (true, Some(id), None) => format!("{leg} placed (order {id}, {attempts})"),
            (true, Some(id), Some(_)) => format!("{leg} placed with exchange error (order {id}, {attempts})"),
            (false, Some(id), _) => format!("{leg} UNVERIFIED (order {id} needs manual check, {attempts})"),
            _ => format!("{leg} FAILED after {attempts}"),
        }
    }
}

/// Terminal protection status decided from both legs, waiting to be stored.
#[derive(Debug, Clone)]
struct Settlement {
    status: IntentStatus,
    code: &'static str,
    message: String,
    raw_error: Option<String>,
}

impl Settlement {
    fn from_legs(stop: &LegResult, take_profit: &LegResult) -> Self {
        let (status, code) = match (stop.placed, take_profit.placed) {
            (true, true) => (IntentStatus::ProtectionPlaced, "PROTECTION_PLACED"),
            (false, false) => (IntentStatus::ProtectionFailed, "PROTECTION_FAILED"),
            _ => (IntentStatus::ProtectionPartial, "PROTECTION_PARTIAL"),
        };
        let raw_error: Vec<String> = [stop, take_profit]
            .iter()
            .filter_map(|leg| {
                leg.error
                    .as_ref()
                    .map(|e| format!("[{}] {e}", leg.kind.leg_label()))
            })
            .collect();
        Self {
            status,
            code,
            message: format!("{}; {}", stop.describe(), take_profit.describe()),
            raw_error: (!raw_error.is_empty()).then(|| raw_error.join("\n")),
        }
    }
}

// ============================================================================
// OrderIntentStateMachine
// ============================================================================

pub struct OrderIntentStateMachine {
    gate: Arc<SignalThrottleGate>,
    intents: Arc<dyn IntentStore>,
    attempts: Arc<dyn ProbeAttemptStore>,
    recorder: Arc<DecisionTraceRecorder>,
    transport: DynTransport,
    feed: Arc<dyn MarketFeed>,
    notifier: Arc<dyn Notifier>,
    engine: ExchangeProbeRetryEngine,
    builder: ConditionalOrderBuilder,
    variations: VariationPolicy,
    instruments: HashMap<InstrumentId, InstrumentSpec>,
    intent_locks: DashMap<CorrelationId, Arc<Mutex<()>>>,
    unsettled: DashMap<CorrelationId, Settlement>,
    config: MachineConfig,
}

impl OrderIntentStateMachine {
    pub fn new(
        deps: MachineDeps,
        instruments: Vec<InstrumentSpec>,
        variations: VariationPolicy,
        config: MachineConfig,
    ) -> Self {
        let engine =
            ExchangeProbeRetryEngine::new(deps.transport.clone(), deps.attempts.clone(), config.probe.clone());
        Self {
            gate: deps.gate,
            intents: deps.intents,
            attempts: deps.attempts,
            recorder: deps.recorder,
            transport: deps.transport,
            feed: deps.feed,
            notifier: deps.notifier,
            engine,
            builder: ConditionalOrderBuilder::new(config.builder.clone()),
            variations,
            instruments: instruments
                .into_iter()
                .map(|spec| (spec.instrument.clone(), spec))
                .collect(),
            intent_locks: DashMap::new(),
            unsettled: DashMap::new(),
            config,
        }
    }

    pub fn gate(&self) -> &Arc<SignalThrottleGate> {
        &self.gate
    }

    /// Read-only intent lookup.
    pub async fn intent(&self, id: &CorrelationId) -> ExecutorResult<Option<OrderIntent>> {
        Ok(self.intents.get_intent(id).await?)
    }

    // ------------------------------------------------------------------------
    // Signal path
    // ------------------------------------------------------------------------

    /// Run a signal through the gate and, if allowed, submit its entry order.
    ///
    /// The new intent is first stored as ENTRY_SUBMITTED while the gate
    /// permit is still held, so it is visible to the in-flight check before
    /// the lane is released and before anything is sent.
    pub async fn on_signal(
        &self,
        signal: &Signal,
        quantity: Size,
        now: DateTime<Utc>,
    ) -> ExecutorResult<SignalOutcome> {
        let spec = self.instrument(&signal.instrument)?;
        let key = signal.throttle_key();

        let permit = match self.gate.evaluate(&key, signal.signal_price, now).await? {
            GateVerdict::Allow(permit) => permit,
            GateVerdict::Deny(reason) => {
                let ctx = TraceContext::new(CorrelationId::new(), signal.instrument.clone(), signal.side);
                debug!(%key, reason = reason.code(), "Signal denied");
                self.trace(
                    &ctx,
                    reason.decision_kind(),
                    reason.code(),
                    &format!("{key}: {}", reason.message()),
                    None,
                )
                .await;
                return Ok(SignalOutcome::Denied {
                    reason,
                    trace_id: ctx.correlation_id,
                });
            }
        };

        let quantity = quantity.round_to_lot(spec.lot_size);
        if !quantity.is_positive() {
            self.abandon(permit).await;
            return Err(ExecutorError::InvalidSpec(format!(
                "order quantity rounds to zero at lot size {}",
                spec.lot_size
            )));
        }

        let mut intent = OrderIntent::from_signal(signal, quantity, now);
        intent.advance(IntentStatus::EntrySubmitted, now)?;
        if let Err(e) = self.insert(intent.clone()).await {
            error!(%key, error = %e, "Intent not stored, abandoning approval");
            self.abandon(permit).await;
            return Err(e);
        }
        drop(permit);
        Metrics::intent_created();

        let ctx = Self::ctx(&intent);
        info!(
            correlation_id = %ctx.correlation_id,
            %key,
            price = %signal.signal_price,
            %quantity,
            "Signal approved"
        );
        self.trace(
            &ctx,
            DecisionKind::Approved,
            "APPROVED",
            &format!("{key} allowed at {}", signal.signal_price),
            None,
        )
        .await;
        self.trace(
            &ctx,
            DecisionKind::EntrySubmitted,
            "ENTRY_SUBMITTED",
            &format!("entry {} {} @ {}", intent.side, quantity, intent.requested_price),
            None,
        )
        .await;

        let lock = self.intent_lock(&intent.correlation_id);
        let _guard = lock.lock().await;
        self.submit_entry(intent).await
    }

    async fn submit_entry(&self, mut intent: OrderIntent) -> ExecutorResult<SignalOutcome> {
        let id = intent.correlation_id.clone();
        let instrument = intent.instrument.to_string();

        let (code, raw) = match self.transport.submit_order(entry_payload(&intent)).await {
            Ok(response) => match response.order_id() {
                Some(order_id) => {
                    if response.has_error() {
                        warn!(correlation_id = %id, error = %response.error_text(), "Entry accepted with exchange error");
                    }
                    Metrics::entry_submission(&instrument, "accepted");
                    info!(correlation_id = %id, %order_id, "Entry order accepted");
                    intent.entry_order_id = Some(order_id);
                    self.persist(&intent).await?;
                    return Ok(SignalOutcome::Submitted(id));
                }
                None => {
                    Metrics::entry_submission(&instrument, "rejected");
                    ("ENTRY_REJECTED", response.error_text())
                }
            },
            Err(e) => {
                Metrics::entry_submission(&instrument, "transport_error");
                ("ENTRY_TRANSPORT_FAILED", e.to_string())
            }
        };

        self.transition(
            &mut intent,
            IntentStatus::EntryRejected,
            Utc::now(),
            code,
            "exchange did not accept the entry order",
            Some(raw),
        )
        .await?;
        Ok(SignalOutcome::Rejected(id))
    }

    // ------------------------------------------------------------------------
    // Event path
    // ------------------------------------------------------------------------

    /// Fill confirmation for an entry order. Places SL and TP from the
    /// filled values and returns the intent's resulting status.
    pub async fn on_fill(
        &self,
        id: &CorrelationId,
        filled_price: Price,
        filled_qty: Size,
        at: DateTime<Utc>,
    ) -> ExecutorResult<IntentStatus> {
        if !filled_price.is_positive() || !filled_qty.is_positive() {
            return Err(ExecutorError::InvalidSpec(format!(
                "fill {filled_qty} @ {filled_price} for {id}"
            )));
        }

        let lock = self.intent_lock(id);
        let _guard = lock.lock().await;
        let mut intent = self.load(id).await?;

        match intent.status {
            IntentStatus::EntrySubmitted => {}
            IntentStatus::EntryRejected | IntentStatus::EntryTimeout => {
                self.late_fill(&intent, filled_price, filled_qty).await;
                return Ok(intent.status);
            }
            IntentStatus::EntryFilled | IntentStatus::ProtectionPending => {
                info!(correlation_id = %id, status = %intent.status, "Fill redelivered for a stalled intent, resuming");
                return self.resume(&mut intent).await;
            }
            status => {
                debug!(correlation_id = %id, %status, "Duplicate fill ignored");
                return Ok(status);
            }
        }

        intent.filled_price = Some(filled_price);
        intent.filled_qty = Some(filled_qty);
        self.transition(
            &mut intent,
            IntentStatus::EntryFilled,
            at,
            "ENTRY_FILLED",
            &format!("filled {filled_qty} @ {filled_price}"),
            None,
        )
        .await?;
        self.transition(
            &mut intent,
            IntentStatus::ProtectionPending,
            Utc::now(),
            "PROTECTION_PENDING",
            "placing SL and TP",
            None,
        )
        .await?;

        self.place_protection(&mut intent, filled_price, filled_qty).await
    }

    /// Asynchronous exchange rejection of a submitted entry order.
    pub async fn on_entry_rejected(
        &self,
        id: &CorrelationId,
        code: &str,
        message: &str,
        at: DateTime<Utc>,
    ) -> ExecutorResult<IntentStatus> {
        let lock = self.intent_lock(id);
        let _guard = lock.lock().await;
        let mut intent = self.load(id).await?;

        if intent.status != IntentStatus::EntrySubmitted {
            warn!(correlation_id = %id, status = %intent.status, code, "Entry rejection ignored");
            return Ok(intent.status);
        }

        self.transition(
            &mut intent,
            IntentStatus::EntryRejected,
            at,
            "ENTRY_REJECTED",
            "exchange rejected the entry order",
            Some(format!("{code}: {message}")),
        )
        .await?;
        Ok(intent.status)
    }

    /// Move every ENTRY_SUBMITTED intent older than the fill timeout to
    /// ENTRY_TIMEOUT. Returns the intents that timed out.
    pub async fn expire_stale_entries(&self, now: DateTime<Utc>) -> ExecutorResult<Vec<CorrelationId>> {
        let filter = IntentFilter {
            status: Some(IntentStatus::EntrySubmitted),
            ..Default::default()
        };
        let candidates = self.list(filter).await?;
        let limit = chrono::Duration::milliseconds(self.config.fill_timeout_ms as i64);

        let mut expired = Vec::new();
        for candidate in candidates {
            let submitted_at = candidate
                .reached_at(IntentStatus::EntrySubmitted)
                .unwrap_or(candidate.signal_at);
            if now - submitted_at < limit {
                continue;
            }

            let id = candidate.correlation_id;
            match self.expire(&id, now, submitted_at).await {
                Ok(true) => expired.push(id),
                Ok(false) => {}
                Err(e) => warn!(correlation_id = %id, error = %e, "Entry timeout not applied, retrying next sweep"),
            }
        }
        Ok(expired)
    }

    async fn expire(
        &self,
        id: &CorrelationId,
        now: DateTime<Utc>,
        submitted_at: DateTime<Utc>,
    ) -> ExecutorResult<bool> {
        let lock = self.intent_lock(id);
        let _guard = lock.lock().await;
        let mut intent = self.load(id).await?;
        if intent.status != IntentStatus::EntrySubmitted {
            return Ok(false);
        }

        let waited_ms = (now - submitted_at).num_milliseconds();
        self.transition(
            &mut intent,
            IntentStatus::EntryTimeout,
            now,
            "ENTRY_TIMEOUT",
            &format!("no fill after {waited_ms}ms (limit {}ms)", self.config.fill_timeout_ms),
            None,
        )
        .await?;
        Ok(true)
    }

    /// Carry intents stuck between fill and a terminal protection status
    /// forward. Intents with an unstored outcome are retried on every sweep,
    /// the rest once the fill timeout has passed since their last transition.
    /// Returns the intents that reached a terminal status.
    pub async fn recover_stalled_protection(
        &self,
        now: DateTime<Utc>,
    ) -> ExecutorResult<Vec<CorrelationId>> {
        let mut candidates = Vec::new();
        for status in [IntentStatus::EntryFilled, IntentStatus::ProtectionPending] {
            let filter = IntentFilter {
                status: Some(status),
                ..Default::default()
            };
            candidates.extend(self.list(filter).await?);
        }
        let limit = chrono::Duration::milliseconds(self.config.fill_timeout_ms as i64);

        let mut recovered = Vec::new();
        for candidate in candidates {
            let id = candidate.correlation_id.clone();
            if !self.unsettled.contains_key(&id) && now - candidate.updated_at() < limit {
                continue;
            }
            match self.recover(&id).await {
                Ok(Some(status)) => {
                    info!(correlation_id = %id, %status, "Stalled intent recovered");
                    recovered.push(id);
                }
                Ok(None) => {}
                Err(e) => warn!(correlation_id = %id, error = %e, "Stalled intent not recovered, retrying next sweep"),
            }
        }
        Ok(recovered)
    }

    async fn recover(&self, id: &CorrelationId) -> ExecutorResult<Option<IntentStatus>> {
        let lock = self.intent_lock(id);
        let _guard = lock.lock().await;
        let mut intent = self.load(id).await?;
        if intent.is_terminal() {
            return Ok(None);
        }
        let status = self.resume(&mut intent).await?;
        Ok(status.is_terminal().then_some(status))
    }

    /// Continue an intent stalled after its fill. Caller holds the intent lock.
    async fn resume(&self, intent: &mut OrderIntent) -> ExecutorResult<IntentStatus> {
        match intent.status {
            IntentStatus::EntryFilled => {
                let (Some(price), Some(qty)) = (intent.filled_price, intent.filled_qty) else {
                    return Err(ExecutorError::InvalidSpec(format!(
                        "intent {} is filled without fill values",
                        intent.correlation_id
                    )));
                };
                self.transition(
                    intent,
                    IntentStatus::ProtectionPending,
                    Utc::now(),
                    "PROTECTION_PENDING",
                    "placing SL and TP after an interrupted fill",
                    None,
                )
                .await?;
                self.place_protection(intent, price, qty).await
            }
            IntentStatus::ProtectionPending => {
                let pending = self.unsettled.get(&intent.correlation_id).map(|s| s.clone());
                match pending {
                    Some(settlement) => self.settle(intent, settlement).await,
                    None => self.reconcile(intent).await,
                }
            }
            status => Ok(status),
        }
    }

    /// Decide the outcome of a PROTECTION_PENDING intent from its recorded
    /// probe attempts, without submitting anything.
    async fn reconcile(&self, intent: &mut OrderIntent) -> ExecutorResult<IntentStatus> {
        let id = intent.correlation_id.clone();
        let timeout = self.op_timeout();
        let recorded = self
            .config
            .storage_retry
            .retry("attempts_for", PersistenceError::is_retryable, || {
                with_timeout(timeout, self.attempts.attempts_for(&id))
            })
            .await?;
        warn!(correlation_id = %id, attempts = recorded.len(), "Reconciling protection from recorded attempts");

        let stop = LegResult::from_recorded(OrderKind::Stop, &recorded);
        let take_profit = LegResult::from_recorded(OrderKind::TakeProfit, &recorded);
        let mut settlement = Settlement::from_legs(&stop, &take_profit);
        settlement.message = format!("reconciled from recorded attempts: {}", settlement.message);
        self.settle(intent, settlement).await
    }

    // ------------------------------------------------------------------------
    // Protection
    // ------------------------------------------------------------------------

    async fn place_protection(
        &self,
        intent: &mut OrderIntent,
        fill_price: Price,
        fill_qty: Size,
    ) -> ExecutorResult<IntentStatus> {
        let spec = self.instrument(&intent.instrument)?.clone();
        let (stop_target, tp_target) = self.config.protection.targets(intent.side, fill_price);
        let market_price = self.feed.current_price(&intent.instrument).await;

        let request = |kind: OrderKind, target: Price| BuildRequest {
            instrument: spec.clone(),
            entry_side: intent.side,
            entry_price: fill_price,
            close_target_price: target,
            quantity: fill_qty,
            kind,
            market_price,
        };
        let stop_req = request(OrderKind::Stop, stop_target);
        let tp_req = request(OrderKind::TakeProfit, tp_target);

        let id = intent.correlation_id.clone();
        let (stop, take_profit) = tokio::join!(
            self.place_leg(&id, &stop_req),
            self.place_leg(&id, &tp_req)
        );

        self.settle(intent, Settlement::from_legs(&stop, &take_profit)).await
    }

    /// Store a terminal protection status. On failure the outcome is kept for
    /// the next attempt and escalated, once, since the legs are already live.
    async fn settle(&self, intent: &mut OrderIntent, settlement: Settlement) -> ExecutorResult<IntentStatus> {
        let id = intent.correlation_id.clone();
        let stored = self
            .transition(
                intent,
                settlement.status,
                Utc::now(),
                settlement.code,
                &settlement.message,
                settlement.raw_error.clone(),
            )
            .await;

        match stored {
            Ok(()) => {
                self.unsettled.remove(&id);
                Ok(intent.status)
            }
            Err(e) => {
                if self.unsettled.insert(id, settlement.clone()).is_none() {
                    self.escalate_unsettled(intent, &settlement, &e).await;
                }
                Err(e)
            }
        }
    }

    async fn escalate_unsettled(&self, intent: &OrderIntent, settlement: &Settlement, cause: &ExecutorError) {
        error!(
            correlation_id = %intent.correlation_id,
            status = %settlement.status,
            error = %cause,
            "Protection outcome not stored, retrying on the next sweep"
        );
        let trace = self
            .trace(
                &Self::ctx(intent),
                DecisionKind::OutcomeUnsettled,
                "OUTCOME_UNSETTLED",
                &format!("{} not stored ({cause}): {}", settlement.status, settlement.message),
                settlement.raw_error.clone(),
            )
            .await;
        self.notifier.notify(&trace);
    }

    async fn place_leg(&self, id: &CorrelationId, req: &BuildRequest) -> LegResult {
        let spec = match self.builder.build(req) {
            Ok(spec) => spec,
            Err(e) => {
                warn!(correlation_id = %id, kind = %req.kind, error = %e, "Conditional order not buildable");
                return LegResult::failed(req.kind, format!("build failed: {e}"));
            }
        };
        debug!(
            correlation_id = %id,
            kind = %spec.kind,
            entry_side = %spec.entry_side,
            closing_side = %spec.closing_side,
            execution = %spec.execution_price,
            trigger = %spec.trigger_condition,
            reference = %spec.reference_price,
            "Conditional order built"
        );

        match self.engine.place(id, &spec, &self.variations).await {
            Ok(outcome) => LegResult::from_outcome(req.kind, &outcome),
            Err(e) => LegResult::failed(req.kind, format!("probe aborted: {e}")),
        }
    }

    // ------------------------------------------------------------------------
    // Transitions, traces, storage
    // ------------------------------------------------------------------------

    async fn transition(
        &self,
        intent: &mut OrderIntent,
        next: IntentStatus,
        at: DateTime<Utc>,
        reason_code: &str,
        reason_message: &str,
        raw_error: Option<String>,
    ) -> ExecutorResult<()> {
        let previous = intent.clone();
        intent.advance(next, at)?;
        if let Err(e) = self.persist(intent).await {
            error!(
                correlation_id = %intent.correlation_id,
                from = %previous.status,
                to = %next,
                error = %e,
                "Transition not persisted"
            );
            *intent = previous;
            return Err(e);
        }

        info!(
            correlation_id = %intent.correlation_id,
            instrument = %intent.instrument,
            side = %intent.side,
            from = %previous.status,
            to = %next,
            reason = reason_code,
            "Intent transition"
        );

        let trace = self
            .trace(&Self::ctx(intent), DecisionKind::for_status(next), reason_code, reason_message, raw_error)
            .await;

        if next.is_terminal() {
            Metrics::intent_terminal(intent.instrument.as_str(), next.as_str());
            self.notifier.notify(&trace);
            self.intent_locks.remove(&intent.correlation_id);
        }
        Ok(())
    }

    /// Record a trace. The recorder already falls back to a local file; if
    /// that also fails the error is logged and the pipeline continues.
    async fn trace(
        &self,
        ctx: &TraceContext,
        kind: DecisionKind,
        reason_code: &str,
        reason_message: &str,
        raw_error: Option<String>,
    ) -> DecisionTrace {
        match self
            .recorder
            .record(ctx, kind, reason_code, reason_message, raw_error.clone())
            .await
        {
            Ok((trace, sink)) => {
                if sink == TraceSink::Fallback {
                    Metrics::trace_fallback(kind.as_str());
                }
                trace
            }
            Err(e) => {
                error!(correlation_id = %ctx.correlation_id, %kind, error = %e, "Decision trace lost");
                DecisionTrace {
                    correlation_id: ctx.correlation_id.clone(),
                    instrument: ctx.instrument.clone(),
                    side: ctx.side,
                    kind,
                    reason_code: reason_code.to_string(),
                    reason_message: reason_message.to_string(),
                    raw_error,
                    recorded_at: Utc::now(),
                }
            }
        }
    }

    async fn late_fill(&self, intent: &OrderIntent, price: Price, qty: Size) {
        error!(
            correlation_id = %intent.correlation_id,
            status = %intent.status,
            %price,
            %qty,
            "Fill arrived for a closed intent; position is unprotected"
        );
        let trace = self
            .trace(
                &Self::ctx(intent),
                DecisionKind::for_status(intent.status),
                "LATE_FILL",
                &format!(
                    "fill {qty} @ {price} arrived after {}; position has no SL/TP",
                    intent.status
                ),
                None,
            )
            .await;
        self.notifier.notify(&trace);
    }

    async fn abandon(&self, permit: KeyPermit) {
        let key = permit.key().clone();
        if let Err(e) = self.gate.abandon(permit).await {
            error!(%key, error = %e, "Gate approval could not be rolled back");
        }
    }

    fn ctx(intent: &OrderIntent) -> TraceContext {
        TraceContext::new(intent.correlation_id.clone(), intent.instrument.clone(), intent.side)
    }

    fn instrument(&self, instrument: &InstrumentId) -> ExecutorResult<&InstrumentSpec> {
        self.instruments
            .get(instrument)
            .ok_or_else(|| ExecutorError::UnknownInstrument(instrument.to_string()))
    }

    fn intent_lock(&self, id: &CorrelationId) -> Arc<Mutex<()>> {
        self.intent_locks.entry(id.clone()).or_default().clone()
    }

    fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.config.op_timeout_ms)
    }

    async fn insert(&self, intent: OrderIntent) -> ExecutorResult<()> {
        let timeout = self.op_timeout();
        self.config
            .storage_retry
            .retry("insert_intent", PersistenceError::is_retryable, || {
                with_timeout(timeout, self.intents.insert_intent(intent.clone()))
            })
            .await
            .map_err(ExecutorError::from)
    }

    async fn persist(&self, intent: &OrderIntent) -> ExecutorResult<()> {
        let timeout = self.op_timeout();
        self.config
            .storage_retry
            .retry("update_intent", PersistenceError::is_retryable, || {
                with_timeout(timeout, self.intents.update_intent(intent.clone()))
            })
            .await
            .map_err(ExecutorError::from)
    }

    async fn load(&self, id: &CorrelationId) -> ExecutorResult<OrderIntent> {
        let timeout = self.op_timeout();
        self.config
            .storage_retry
            .retry("get_intent", PersistenceError::is_retryable, || {
                with_timeout(timeout, self.intents.get_intent(id))
            })
            .await?
            .ok_or_else(|| ExecutorError::IntentNotFound(id.to_string()))
    }

    async fn list(&self, filter: IntentFilter) -> ExecutorResult<Vec<OrderIntent>> {
        let timeout = self.op_timeout();
        self.config
            .storage_retry
            .retry("list_intents", PersistenceError::is_retryable, || {
                with_timeout(timeout, self.intents.list_intents(filter.clone()))
            })
            .await
            .map_err(ExecutorError::from)
    }
}

/// Entry order payload. The correlation id doubles as the client order id so
/// a replayed submission is deduplicated by the exchange.
fn entry_payload(intent: &OrderIntent) -> Value {
    json!({
        "instrument": intent.instrument.as_str(),
        "client_order_id": intent.correlation_id.as_str(),
        "side": intent.side.as_str(),
        "order_type": "LIMIT",
        "price": intent.requested_price.to_string(),
        "quantity": intent.requested_qty.to_string(),
        "strategy": intent.strategy_key,
    })
}
