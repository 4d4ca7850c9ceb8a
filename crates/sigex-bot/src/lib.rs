//! Signal-to-order execution bot.
//!
//! Orchestrates the pipeline components:
//! - Periodic signal scan over the configured watchlist
//! - Throttle gate and order intent lifecycle
//! - Exchange fill and reject events
//! - Paper-trading exchange and signal replay

pub mod app;
pub mod config;
pub mod error;
pub mod paper;

pub use app::{notifier_from_config, Application, Collaborators, ScanReport};
pub use config::{AppConfig, OperatingMode, WatchlistEntry};
pub use error::{AppError, AppResult};
pub use paper::{ExchangeEvent, JsonlSignalFeed, PaperExchange};
