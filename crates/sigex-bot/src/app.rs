//! Main application orchestration.
//!
//! - Periodic scan: one task per watchlist instrument pulls the newest
//!   signal and hands it to the state machine
//! - Entry timeout sweep after every scan
//! - Exchange events (fills, rejects) handled as they arrive, each in its
//!   own task so a slow protection placement does not stall the scan
//! - Ctrl-C stops the loop after the running scan; event tasks are drained

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use sigex_core::IntentStatus;
use sigex_executor::{
    DynTransport, ExecutorError, MachineDeps, MarketFeed, OrderIntentStateMachine,
    RetryingTransport, SignalOutcome,
};
use sigex_gate::SignalThrottleGate;
use sigex_persistence::{DecisionTraceRecorder, MemoryStore};
use sigex_telemetry::{LogNotifier, Notifier, WebhookNotifier};

use crate::config::{AppConfig, NotificationConfig, WatchlistEntry};
use crate::error::{AppError, AppResult};
use crate::paper::{ExchangeEvent, JsonlSignalFeed, PaperExchange};

/// Capacity of the exchange event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// External collaborators the pipeline runs against.
pub struct Collaborators {
    pub transport: DynTransport,
    pub feed: Arc<dyn MarketFeed>,
    pub events: mpsc::Receiver<ExchangeEvent>,
    pub notifier: Arc<dyn Notifier>,
}

/// Counts for one scan tick.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanReport {
    pub signals: usize,
    pub submitted: usize,
    pub rejected: usize,
    pub denied: usize,
    pub errors: usize,
    pub expired: usize,
    /// Intents carried from a stalled fill to a terminal protection status.
    pub recovered: usize,
}

/// Main application.
pub struct Application {
    config: AppConfig,
    machine: Arc<OrderIntentStateMachine>,
    feed: Arc<dyn MarketFeed>,
    store: Arc<MemoryStore>,
    events: Option<mpsc::Receiver<ExchangeEvent>>,
}

impl Application {
    /// Wire the pipeline against the given collaborators. Storage is the
    /// in-process store; the transport gets the timeout and single retry.
    pub fn new(config: AppConfig, collaborators: Collaborators) -> AppResult<Self> {
        config.validate()?;
        let variations = config.variation_policy()?;

        let store = Arc::new(MemoryStore::new());
        let gate = Arc::new(SignalThrottleGate::new(
            store.clone(),
            store.clone(),
            config.gate_config(),
        ));
        let recorder = Arc::new(DecisionTraceRecorder::new(
            store.clone(),
            &config.persistence.data_dir,
            config.recorder_config(),
        ));
        let transport: DynTransport = Arc::new(RetryingTransport::new(
            collaborators.transport,
            config.transport.clone(),
        ));

        let deps = MachineDeps {
            gate,
            intents: store.clone(),
            attempts: store.clone(),
            recorder,
            transport,
            feed: collaborators.feed.clone(),
            notifier: collaborators.notifier,
        };
        let machine = Arc::new(OrderIntentStateMachine::new(
            deps,
            config.instruments(),
            variations,
            config.machine_config(),
        ));

        info!(
            mode = ?config.mode,
            instruments = config.watchlist.len(),
            scan_interval_ms = config.scan_interval_ms,
            "Application initialized"
        );

        Ok(Self {
            config,
            machine,
            feed: collaborators.feed,
            store,
            events: Some(collaborators.events),
        })
    }

    /// Paper-trading wiring: simulated exchange plus signal replay.
    pub fn paper(config: AppConfig) -> AppResult<Self> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let exchange = Arc::new(PaperExchange::new(
            tx,
            Duration::from_millis(config.paper.fill_delay_ms),
        ));
        let feed = match &config.paper.signals_path {
            Some(path) => JsonlSignalFeed::load(path)?,
            None => {
                warn!("paper.signals_path not set, no signals will be replayed");
                JsonlSignalFeed::default()
            }
        };
        let notifier = notifier_from_config(&config.notification)?;

        Self::new(
            config,
            Collaborators {
                transport: exchange,
                feed: Arc::new(feed),
                events: rx,
                notifier,
            },
        )
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn machine(&self) -> &Arc<OrderIntentStateMachine> {
        &self.machine
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    /// Next exchange event, if the channel is still open.
    pub async fn recv_event(&mut self) -> Option<ExchangeEvent> {
        self.events.as_mut()?.recv().await
    }

    /// One scan tick: pull a signal per instrument, run them concurrently,
    /// then sweep stale entries.
    pub async fn scan_once(&self, now: DateTime<Utc>) -> ScanReport {
        let mut tasks = JoinSet::new();
        for entry in &self.config.watchlist {
            let machine = self.machine.clone();
            let feed = self.feed.clone();
            let entry = entry.clone();
            tasks.spawn(async move { scan_instrument(machine, feed, entry, now).await });
        }

        let mut report = ScanReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(None) => {}
                Ok(Some(result)) => {
                    report.signals += 1;
                    match result {
                        Ok(SignalOutcome::Submitted(_)) => report.submitted += 1,
                        Ok(SignalOutcome::Rejected(_)) => report.rejected += 1,
                        Ok(SignalOutcome::Denied { .. }) => report.denied += 1,
                        Err(_) => report.errors += 1,
                    }
                }
                Err(e) => {
                    error!(error = %e, "Scan task panicked");
                    report.errors += 1;
                }
            }
        }

        match self.machine.expire_stale_entries(now).await {
            Ok(expired) => report.expired = expired.len(),
            Err(e) => warn!(error = %e, "Entry timeout sweep failed"),
        }
        match self.machine.recover_stalled_protection(now).await {
            Ok(recovered) => report.recovered = recovered.len(),
            Err(e) => warn!(error = %e, "Stalled protection sweep failed"),
        }
        report
    }

    /// Apply one exchange event.
    pub async fn handle_event(&self, event: ExchangeEvent) -> AppResult<IntentStatus> {
        handle_event(&self.machine, event).await
    }

    /// Run until Ctrl-C.
    pub async fn run(mut self) -> AppResult<()> {
        let mut events = self
            .events
            .take()
            .ok_or_else(|| AppError::Config("event channel already consumed".to_string()))?;
        let mut interval = tokio::time::interval(self.config.scan_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut event_tasks: JoinSet<()> = JoinSet::new();
        let mut ticks = 0u64;

        info!("Entering main event loop");
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    ticks += 1;
                    let report = self.scan_once(Utc::now()).await;
                    if report.signals > 0 || report.expired > 0 || report.recovered > 0 {
                        info!(tick = ticks, ?report, "Scan complete");
                    } else {
                        debug!(tick = ticks, "Scan complete, no signals");
                    }
                }

                Some(event) = events.recv() => {
                    let machine = self.machine.clone();
                    let correlation_id = event.correlation_id().clone();
                    event_tasks.spawn(async move {
                        if let Err(e) = handle_event(&machine, event).await {
                            error!(%correlation_id, error = %e, "Exchange event not applied");
                        }
                    });
                }

                Some(joined) = event_tasks.join_next(), if !event_tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Event task panicked");
                    }
                }

                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        let pending = event_tasks.len();
        if pending > 0 {
            info!(pending, "Waiting for in-flight event handling");
        }
        while let Some(joined) = event_tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Event task panicked");
            }
        }

        info!(ticks, "Shutting down");
        Ok(())
    }
}

async fn scan_instrument(
    machine: Arc<OrderIntentStateMachine>,
    feed: Arc<dyn MarketFeed>,
    entry: WatchlistEntry,
    now: DateTime<Utc>,
) -> Option<Result<SignalOutcome, ExecutorError>> {
    let instrument = entry.instrument_id();
    let signal = feed.latest_signal(&instrument).await?;
    if let Some(strategy) = entry.strategy_key.as_deref() {
        if signal.strategy_key != strategy {
            debug!(%instrument, expected = strategy, got = %signal.strategy_key, "Signal from unlisted strategy skipped");
            return None;
        }
    }

    let result = machine.on_signal(&signal, entry.quantity(), now).await;
    match &result {
        Ok(SignalOutcome::Submitted(id)) => {
            debug!(correlation_id = %id, %instrument, "Entry submitted");
        }
        Ok(SignalOutcome::Rejected(id)) => {
            warn!(correlation_id = %id, %instrument, "Entry rejected");
        }
        Ok(SignalOutcome::Denied { reason, .. }) => {
            debug!(%instrument, side = %signal.side, reason = reason.code(), "Signal denied");
        }
        Err(e) if e.is_retryable() => {
            warn!(%instrument, error = %e, "Signal dropped for this tick, storage or transport unavailable");
        }
        Err(e) => {
            error!(%instrument, error = %e, "Signal processing failed");
        }
    }
    Some(result)
}

async fn handle_event(machine: &OrderIntentStateMachine, event: ExchangeEvent) -> AppResult<IntentStatus> {
    let status = match event {
        ExchangeEvent::Filled {
            correlation_id,
            price,
            quantity,
            at,
        } => {
            info!(%correlation_id, %price, %quantity, "Entry fill received");
            machine.on_fill(&correlation_id, price, quantity, at).await?
        }
        ExchangeEvent::Rejected {
            correlation_id,
            code,
            message,
        } => {
            warn!(%correlation_id, %code, %message, "Entry rejection received");
            machine
                .on_entry_rejected(&correlation_id, &code, &message, Utc::now())
                .await?
        }
    };
    Ok(status)
}

/// Webhook notifier when configured, log notifier otherwise.
pub fn notifier_from_config(config: &NotificationConfig) -> AppResult<Arc<dyn Notifier>> {
    match &config.webhook_url {
        Some(url) => {
            let notifier = WebhookNotifier::new(url, Duration::from_millis(config.timeout_ms))?;
            Ok(Arc::new(notifier))
        }
        None => Ok(Arc::new(LogNotifier)),
    }
}
