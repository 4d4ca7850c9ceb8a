//! SignalThrottleGate implementation.
//!
//! # Decision order (first match wins)
//!
//! 1. A non-terminal intent exists for (instrument, side): DENY `INTENT_IN_FLIGHT`
//! 2. Force-next-signal flag set: ALLOW and clear the flag
//! 3. No prior trigger on the lane: ALLOW
//! 4. Inside cooldown and price moved less than the minimum: DENY `THROTTLED_COOLDOWN`
//! 5. Otherwise: ALLOW
//!
//! The in-flight check runs first so that an operator override is not spent
//! on a signal that could not have produced an intent anyway.
//!
//! # Locking
//!
//! Lanes are locked per (instrument, side), one level coarser than the
//! throttle key. The in-flight invariant is per (instrument, side), so two
//! strategies on the same lane must not both pass the check before either
//! creates its intent.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use sigex_core::{
    CorrelationId, DecisionKind, InstrumentId, OrderSide, Price, RetryPolicy, ThrottleKey,
    ThrottleState,
};
use sigex_persistence::{with_timeout, IntentStore, PersistenceError, ThrottleStore};
use sigex_telemetry::Metrics;

use crate::error::{GateError, GateResult};

// ============================================================================
// Configuration
// ============================================================================

/// Gate configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    /// Minimum time between two ALLOWs on a lane unless the price moved enough.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    /// Absolute % move since the last trigger that bypasses the cooldown.
    #[serde(default = "default_min_price_change_pct")]
    pub min_price_change_pct: Decimal,
    #[serde(default = "default_op_timeout_ms")]
    pub op_timeout_ms: u64,
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_cooldown_secs() -> u64 {
    300
}

fn default_min_price_change_pct() -> Decimal {
    Decimal::ONE
}

fn default_op_timeout_ms() -> u64 {
    5_000
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: default_cooldown_secs(),
            min_price_change_pct: default_min_price_change_pct(),
            op_timeout_ms: default_op_timeout_ms(),
            retry: RetryPolicy::default(),
        }
    }
}

// ============================================================================
// Verdict
// ============================================================================

/// Why a signal was denied. An expected outcome, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenyReason {
    ThrottledCooldown {
        elapsed_secs: i64,
        /// `None` when the last trigger price was zero.
        price_change_pct: Option<Decimal>,
    },
    IntentInFlight {
        correlation_id: CorrelationId,
    },
}

impl DenyReason {
    pub fn code(&self) -> &'static str {
        match self {
            Self::ThrottledCooldown { .. } => "THROTTLED_COOLDOWN",
            Self::IntentInFlight { .. } => "INTENT_IN_FLIGHT",
        }
    }

    pub fn decision_kind(&self) -> DecisionKind {
        match self {
            Self::ThrottledCooldown { .. } => DecisionKind::Throttled,
            Self::IntentInFlight { .. } => DecisionKind::IntentInFlight,
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::ThrottledCooldown {
                elapsed_secs,
                price_change_pct,
            } => match price_change_pct {
                Some(pct) => format!(
                    "{elapsed_secs}s since last trigger, price moved {}%",
                    pct.round_dp(4)
                ),
                None => format!("{elapsed_secs}s since last trigger"),
            },
            Self::IntentInFlight { correlation_id } => {
                format!("intent {correlation_id} is still in flight")
            }
        }
    }
}

/// Exclusive hold on an approved lane.
///
/// The throttle state has already been written when this is handed out.
/// Keep it alive until the intent is persisted; dropping it releases the lane.
#[derive(Debug)]
pub struct KeyPermit {
    key: ThrottleKey,
    state: ThrottleState,
    previous: Option<ThrottleState>,
    _guard: OwnedMutexGuard<()>,
}

impl KeyPermit {
    pub fn key(&self) -> &ThrottleKey {
        &self.key
    }

    /// State as written by the ALLOW.
    pub fn state(&self) -> &ThrottleState {
        &self.state
    }
}

#[derive(Debug)]
pub enum GateVerdict {
    Allow(KeyPermit),
    Deny(DenyReason),
}

// ============================================================================
// SignalThrottleGate
// ============================================================================

type Lane = (InstrumentId, OrderSide);

pub struct SignalThrottleGate {
    throttle: Arc<dyn ThrottleStore>,
    intents: Arc<dyn IntentStore>,
    lanes: DashMap<Lane, Arc<Mutex<()>>>,
    config: GateConfig,
}

impl SignalThrottleGate {
    pub fn new(throttle: Arc<dyn ThrottleStore>, intents: Arc<dyn IntentStore>, config: GateConfig) -> Self {
        Self {
            throttle,
            intents,
            lanes: DashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    /// Evaluate a signal for `key`.
    ///
    /// On storage failure nothing has been written and the signal should be
    /// dropped for this cycle.
    pub async fn evaluate(
        &self,
        key: &ThrottleKey,
        signal_price: Price,
        now: DateTime<Utc>,
    ) -> GateResult<GateVerdict> {
        let guard = self.lock_lane(key).await;
        let result = self.evaluate_locked(key, signal_price, now, guard).await;

        match &result {
            Ok(GateVerdict::Allow(_)) => {
                Metrics::gate_decision(key.instrument.as_str(), key.side.as_str(), "allow");
            }
            Ok(GateVerdict::Deny(reason)) => {
                Metrics::gate_decision(
                    key.instrument.as_str(),
                    key.side.as_str(),
                    &reason.code().to_lowercase(),
                );
            }
            Err(e) => {
                warn!(%key, error = %e, "Gate evaluation dropped");
                Metrics::gate_storage_error(key.instrument.as_str());
            }
        }
        result
    }

    async fn evaluate_locked(
        &self,
        key: &ThrottleKey,
        signal_price: Price,
        now: DateTime<Utc>,
        guard: OwnedMutexGuard<()>,
    ) -> GateResult<GateVerdict> {
        let in_flight = self.find_in_flight(&key.instrument, key.side).await?;
        let previous = self.load(key).await?;

        let mut state = previous
            .clone()
            .unwrap_or_else(|| ThrottleState::new(key.clone(), self.config.cooldown_secs, self.config.min_price_change_pct));
        state.cooldown_secs = self.config.cooldown_secs;
        state.min_price_change_pct = self.config.min_price_change_pct;
        state.last_evaluated_at = Some(now);
        state.revision += 1;

        if let Some(intent) = in_flight {
            let reason = DenyReason::IntentInFlight {
                correlation_id: intent.correlation_id,
            };
            return self.deny(state, reason).await;
        }

        if state.force_next_signal {
            info!(%key, %signal_price, "Force-next-signal consumed");
            state.force_next_signal = false;
            return self.allow(key, state, previous, signal_price, now, guard).await;
        }

        let (Some(last_at), Some(last_price)) = (state.last_trigger_at, state.last_trigger_price) else {
            debug!(%key, %signal_price, "First trigger on lane");
            return self.allow(key, state, previous, signal_price, now, guard).await;
        };

        let elapsed_secs = (now - last_at).num_seconds();
        let price_change_pct = signal_price.pct_from(last_price).map(|p| p.abs());
        let in_cooldown = elapsed_secs < state.cooldown_secs as i64;
        let moved_enough = price_change_pct.map_or(true, |p| p >= state.min_price_change_pct);

        if in_cooldown && !moved_enough {
            let reason = DenyReason::ThrottledCooldown {
                elapsed_secs,
                price_change_pct,
            };
            return self.deny(state, reason).await;
        }

        self.allow(key, state, previous, signal_price, now, guard).await
    }

    async fn allow(
        &self,
        key: &ThrottleKey,
        mut state: ThrottleState,
        previous: Option<ThrottleState>,
        signal_price: Price,
        now: DateTime<Utc>,
        guard: OwnedMutexGuard<()>,
    ) -> GateResult<GateVerdict> {
        state.last_trigger_at = Some(now);
        state.last_trigger_price = Some(signal_price);
        state.denied_since_trigger = 0;
        self.save(state.clone()).await?;

        debug!(%key, %signal_price, revision = state.revision, "Gate ALLOW");
        Ok(GateVerdict::Allow(KeyPermit {
            key: key.clone(),
            state,
            previous,
            _guard: guard,
        }))
    }

    async fn deny(&self, mut state: ThrottleState, reason: DenyReason) -> GateResult<GateVerdict> {
        state.denied_since_trigger = state.denied_since_trigger.saturating_add(1);
        self.save(state.clone()).await?;

        debug!(
            key = %state.key,
            reason = reason.code(),
            denied = state.denied_since_trigger,
            "Gate DENY"
        );
        Ok(GateVerdict::Deny(reason))
    }

    /// Undo an ALLOW whose intent could not be created.
    ///
    /// The trigger fields and force flag go back to their pre-ALLOW values in
    /// a new superseding row.
    pub async fn abandon(&self, permit: KeyPermit) -> GateResult<()> {
        let KeyPermit {
            key,
            state,
            previous,
            _guard,
        } = permit;

        let mut restored = previous
            .unwrap_or_else(|| ThrottleState::new(key.clone(), state.cooldown_secs, state.min_price_change_pct));
        restored.revision = state.revision + 1;
        restored.last_evaluated_at = state.last_evaluated_at;
        self.save(restored).await?;

        warn!(%key, "Gate ALLOW abandoned, lane restored");
        Ok(())
    }

    /// Operator override: allow the next signal on `key` regardless of cooldown.
    pub async fn force_next_signal(&self, key: &ThrottleKey) -> GateResult<()> {
        let _guard = self.lock_lane(key).await;
        let mut state = self.load(key).await?.unwrap_or_else(|| {
            ThrottleState::new(key.clone(), self.config.cooldown_secs, self.config.min_price_change_pct)
        });
        state.force_next_signal = true;
        state.revision += 1;
        self.save(state).await?;

        info!(%key, "Force-next-signal set");
        Ok(())
    }

    /// Current throttle row for `key`. Read-only.
    pub async fn state(&self, key: &ThrottleKey) -> GateResult<Option<ThrottleState>> {
        self.load(key).await
    }

    // ------------------------------------------------------------------------
    // Storage
    // ------------------------------------------------------------------------

    async fn lock_lane(&self, key: &ThrottleKey) -> OwnedMutexGuard<()> {
        let lock = self
            .lanes
            .entry((key.instrument.clone(), key.side))
            .or_default()
            .clone();
        lock.lock_owned().await
    }

    fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.config.op_timeout_ms)
    }

    async fn load(&self, key: &ThrottleKey) -> GateResult<Option<ThrottleState>> {
        let timeout = self.op_timeout();
        self.config
            .retry
            .retry("load_throttle", PersistenceError::is_retryable, || {
                with_timeout(timeout, self.throttle.load_throttle(key))
            })
            .await
            .map_err(GateError::from)
    }

    async fn save(&self, state: ThrottleState) -> GateResult<()> {
        let timeout = self.op_timeout();
        self.config
            .retry
            .retry("save_throttle", PersistenceError::is_retryable, || {
                with_timeout(timeout, self.throttle.save_throttle(state.clone()))
            })
            .await
            .map_err(GateError::from)
    }

    async fn find_in_flight(
        &self,
        instrument: &InstrumentId,
        side: OrderSide,
    ) -> GateResult<Option<sigex_core::OrderIntent>> {
        let timeout = self.op_timeout();
        self.config
            .retry
            .retry("find_in_flight", PersistenceError::is_retryable, || {
                with_timeout(timeout, self.intents.find_in_flight(instrument, side))
            })
            .await
            .map_err(GateError::from)
    }
}
