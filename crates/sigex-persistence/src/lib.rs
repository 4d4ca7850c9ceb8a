//! Storage interfaces and decision trace recording.
//!
//! - [`store`]: async storage traits for throttle state, intents, probe
//!   attempts and traces, plus an in-memory implementation
//! - [`writer`]: JSON Lines append-only writer used as the durable fallback
//! - [`recorder`]: [`DecisionTraceRecorder`], which never drops a trace

pub mod error;
pub mod recorder;
pub mod store;
pub mod writer;

pub use error::{PersistenceError, PersistenceResult};
pub use recorder::{DecisionTraceRecorder, RecorderConfig, TraceContext, TraceSink};
pub use store::{
    with_timeout, IntentFilter, IntentStore, MemoryStore, ProbeAttemptStore, ThrottleStore,
    TraceStore,
};
pub use writer::{read_records, JsonLinesWriter};
