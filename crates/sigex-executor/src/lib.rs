//! Order execution for approved signals.
//!
//! - [`machine`]: [`OrderIntentStateMachine`], the lifecycle driver
//! - [`builder`]: stop-loss and take-profit order construction
//! - [`probe`]: sequential payload-variation placement with verification
//! - [`transport`]: exchange transport trait, retrying wrapper and mock
//! - [`feed`]: market data and signal source trait

pub mod builder;
pub mod error;
pub mod feed;
pub mod machine;
pub mod probe;
pub mod transport;
pub mod variation;

pub use builder::{BuildRequest, BuilderConfig, ConditionalOrderBuilder, ProtectionParams};
pub use error::{ExecutorError, ExecutorResult};
pub use feed::{MarketFeed, StaticMarketFeed};
pub use machine::{LegResult, MachineConfig, MachineDeps, OrderIntentStateMachine, SignalOutcome};
pub use probe::{ExchangeProbeRetryEngine, PlacementOutcome, ProbeConfig};
pub use transport::{
    DynTransport, ExchangeTransport, MockTransport, OrderLookup, RetryingTransport, SubmitResponse,
    TransportConfig, TransportError, TransportResult,
};
pub use variation::{NumericEncoding, PayloadVariation, SideField, VariationPolicy};
