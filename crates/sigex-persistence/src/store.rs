//! Storage collaborator interfaces.
//!
//! Each record family has its own trait so a deployment can back them with
//! different systems. All methods return boxed futures so the traits stay
//! dyn-compatible (`Arc<dyn IntentStore>`).
//!
//! [`MemoryStore`] implements every trait and supports fault injection for
//! exercising the `StorageUnavailable` paths.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;

use sigex_core::{
    BoxFuture, CorrelationId, DecisionTrace, InstrumentId, IntentStatus, OrderIntent, OrderSide,
    ProbeAttempt, ThrottleKey, ThrottleState,
};

use crate::error::{PersistenceError, PersistenceResult};

// ============================================================================
// Traits
// ============================================================================

/// Throttle state rows, one live row per key. Written only by the gate.
pub trait ThrottleStore: Send + Sync {
    fn load_throttle(&self, key: &ThrottleKey) -> BoxFuture<'_, PersistenceResult<Option<ThrottleState>>>;

    /// Supersede the row for `state.key`.
    fn save_throttle(&self, state: ThrottleState) -> BoxFuture<'_, PersistenceResult<()>>;
}

/// Filter for read-only intent queries. `None` fields match anything.
#[derive(Debug, Clone, Default)]
pub struct IntentFilter {
    pub instrument: Option<InstrumentId>,
    pub side: Option<OrderSide>,
    pub status: Option<IntentStatus>,
}

impl IntentFilter {
    fn matches(&self, intent: &OrderIntent) -> bool {
        self.instrument.as_ref().map_or(true, |i| *i == intent.instrument)
            && self.side.map_or(true, |s| s == intent.side)
            && self.status.map_or(true, |s| s == intent.status)
    }
}

/// Order intents. Written only by the state machine.
pub trait IntentStore: Send + Sync {
    fn insert_intent(&self, intent: OrderIntent) -> BoxFuture<'_, PersistenceResult<()>>;

    /// Replace a stored intent. Refuses to overwrite a terminal intent.
    fn update_intent(&self, intent: OrderIntent) -> BoxFuture<'_, PersistenceResult<()>>;

    fn get_intent(&self, id: &CorrelationId) -> BoxFuture<'_, PersistenceResult<Option<OrderIntent>>>;

    /// The non-terminal intent for (instrument, side), if any.
    fn find_in_flight(
        &self,
        instrument: &InstrumentId,
        side: OrderSide,
    ) -> BoxFuture<'_, PersistenceResult<Option<OrderIntent>>>;

    fn list_intents(&self, filter: IntentFilter) -> BoxFuture<'_, PersistenceResult<Vec<OrderIntent>>>;
}

/// Append-only probe attempts.
pub trait ProbeAttemptStore: Send + Sync {
    fn append_attempt(&self, attempt: ProbeAttempt) -> BoxFuture<'_, PersistenceResult<()>>;

    /// Attempts for one intent, in write order.
    fn attempts_for(&self, id: &CorrelationId) -> BoxFuture<'_, PersistenceResult<Vec<ProbeAttempt>>>;
}

/// Append-only decision traces.
pub trait TraceStore: Send + Sync {
    fn append_trace(&self, trace: DecisionTrace) -> BoxFuture<'_, PersistenceResult<()>>;

    fn traces_for(&self, id: &CorrelationId) -> BoxFuture<'_, PersistenceResult<Vec<DecisionTrace>>>;

    fn traces_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> BoxFuture<'_, PersistenceResult<Vec<DecisionTrace>>>;
}

/// Bound a storage call; an elapsed deadline counts as unavailability.
pub async fn with_timeout<T>(
    limit: Duration,
    fut: impl Future<Output = PersistenceResult<T>>,
) -> PersistenceResult<T> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(PersistenceError::Unavailable(format!(
            "storage call exceeded {}ms",
            limit.as_millis()
        ))),
    }
}

// ============================================================================
// MemoryStore
// ============================================================================

/// In-process store backing every trait.
#[derive(Debug, Default)]
pub struct MemoryStore {
    throttle: DashMap<ThrottleKey, ThrottleState>,
    /// Superseded throttle rows, kept for audit.
    throttle_history: Mutex<Vec<ThrottleState>>,
    intents: DashMap<CorrelationId, OrderIntent>,
    attempts: Mutex<Vec<ProbeAttempt>>,
    traces: Mutex<Vec<DecisionTrace>>,
    unavailable: AtomicBool,
    fail_next: AtomicU32,
    traces_unavailable: AtomicBool,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Fail the next `n` operations, then recover.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Make only trace appends fail (exercises the recorder fallback).
    pub fn set_traces_unavailable(&self, unavailable: bool) {
        self.traces_unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Superseded throttle rows for a key, oldest first.
    pub fn throttle_history(&self, key: &ThrottleKey) -> Vec<ThrottleState> {
        self.throttle_history
            .lock()
            .iter()
            .filter(|s| s.key == *key)
            .cloned()
            .collect()
    }

    fn check_available(&self) -> PersistenceResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(PersistenceError::Unavailable("memory store offline".to_string()));
        }
        let consumed = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if consumed {
            return Err(PersistenceError::Unavailable("injected failure".to_string()));
        }
        Ok(())
    }
}

fn ready<'a, T: Send + 'a>(value: T) -> BoxFuture<'a, T> {
    Box::pin(std::future::ready(value))
}

impl ThrottleStore for MemoryStore {
    fn load_throttle(&self, key: &ThrottleKey) -> BoxFuture<'_, PersistenceResult<Option<ThrottleState>>> {
        let result = self
            .check_available()
            .map(|_| self.throttle.get(key).map(|s| s.clone()));
        ready(result)
    }

    fn save_throttle(&self, state: ThrottleState) -> BoxFuture<'_, PersistenceResult<()>> {
        let result = self.check_available().map(|_| {
            if let Some(previous) = self.throttle.insert(state.key.clone(), state) {
                self.throttle_history.lock().push(previous);
            }
        });
        ready(result)
    }
}

impl IntentStore for MemoryStore {
    fn insert_intent(&self, intent: OrderIntent) -> BoxFuture<'_, PersistenceResult<()>> {
        let result = self.check_available().and_then(|_| {
            if self.intents.contains_key(&intent.correlation_id) {
                return Err(PersistenceError::Conflict(format!(
                    "intent {} already exists",
                    intent.correlation_id
                )));
            }
            self.intents.insert(intent.correlation_id.clone(), intent);
            Ok(())
        });
        ready(result)
    }

    fn update_intent(&self, intent: OrderIntent) -> BoxFuture<'_, PersistenceResult<()>> {
        let result = self.check_available().and_then(|_| {
            let mut entry = self
                .intents
                .get_mut(&intent.correlation_id)
                .ok_or_else(|| PersistenceError::NotFound(intent.correlation_id.to_string()))?;
            if entry.is_terminal() {
                return Err(PersistenceError::Conflict(format!(
                    "intent {} is terminal ({})",
                    intent.correlation_id, entry.status
                )));
            }
            *entry = intent;
            Ok(())
        });
        ready(result)
    }

    fn get_intent(&self, id: &CorrelationId) -> BoxFuture<'_, PersistenceResult<Option<OrderIntent>>> {
        let result = self
            .check_available()
            .map(|_| self.intents.get(id).map(|i| i.clone()));
        ready(result)
    }

    fn find_in_flight(
        &self,
        instrument: &InstrumentId,
        side: OrderSide,
    ) -> BoxFuture<'_, PersistenceResult<Option<OrderIntent>>> {
        let result = self.check_available().map(|_| {
            self.intents
                .iter()
                .find(|i| i.instrument == *instrument && i.side == side && !i.is_terminal())
                .map(|i| i.clone())
        });
        ready(result)
    }

    fn list_intents(&self, filter: IntentFilter) -> BoxFuture<'_, PersistenceResult<Vec<OrderIntent>>> {
        let result = self.check_available().map(|_| {
            let mut found: Vec<OrderIntent> = self
                .intents
                .iter()
                .filter(|i| filter.matches(i))
                .map(|i| i.clone())
                .collect();
            found.sort_by_key(|i| i.signal_at);
            found
        });
        ready(result)
    }
}

impl ProbeAttemptStore for MemoryStore {
    fn append_attempt(&self, attempt: ProbeAttempt) -> BoxFuture<'_, PersistenceResult<()>> {
        let result = self
            .check_available()
            .map(|_| self.attempts.lock().push(attempt));
        ready(result)
    }

    fn attempts_for(&self, id: &CorrelationId) -> BoxFuture<'_, PersistenceResult<Vec<ProbeAttempt>>> {
        let result = self.check_available().map(|_| {
            self.attempts
                .lock()
                .iter()
                .filter(|a| a.correlation_id == *id)
                .cloned()
                .collect()
        });
        ready(result)
    }
}

impl TraceStore for MemoryStore {
    fn append_trace(&self, trace: DecisionTrace) -> BoxFuture<'_, PersistenceResult<()>> {
        let result = self.check_available().and_then(|_| {
            if self.traces_unavailable.load(Ordering::SeqCst) {
                return Err(PersistenceError::Unavailable("trace table offline".to_string()));
            }
            self.traces.lock().push(trace);
            Ok(())
        });
        ready(result)
    }

    fn traces_for(&self, id: &CorrelationId) -> BoxFuture<'_, PersistenceResult<Vec<DecisionTrace>>> {
        let result = self.check_available().map(|_| {
            self.traces
                .lock()
                .iter()
                .filter(|t| t.correlation_id == *id)
                .cloned()
                .collect()
        });
        ready(result)
    }

    fn traces_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> BoxFuture<'_, PersistenceResult<Vec<DecisionTrace>>> {
        let result = self.check_available().map(|_| {
            self.traces
                .lock()
                .iter()
                .filter(|t| t.recorded_at >= from && t.recorded_at <= to)
                .cloned()
                .collect()
        });
        ready(result)
    }
}
