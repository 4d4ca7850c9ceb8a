//! Integration tests for sigex-bot.
//!
//! These tests drive the full pipeline against in-process collaborators:
//! - Throttle gate under concurrent signals
//! - Protection placement when the exchange rejects payload shapes
//! - Paper-mode round trip through the application scan loop

pub mod common;
