//! Market/indicator feed interface.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

use sigex_core::{BoxFuture, InstrumentId, Price, Signal};

/// Market data and strategy signals, provided by a collaborator.
pub trait MarketFeed: Send + Sync {
    /// Last traded price, if known.
    fn current_price(&self, instrument: &InstrumentId) -> BoxFuture<'_, Option<Price>>;

    /// Newest unconsumed signal for `instrument`, if any.
    fn latest_signal(&self, instrument: &InstrumentId) -> BoxFuture<'_, Option<Signal>>;
}

/// In-memory feed with settable prices and a signal queue per instrument.
#[derive(Debug, Default)]
pub struct StaticMarketFeed {
    prices: Mutex<HashMap<InstrumentId, Price>>,
    signals: Mutex<HashMap<InstrumentId, VecDeque<Signal>>>,
}

impl StaticMarketFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_price(&self, instrument: &InstrumentId, price: Price) {
        self.prices.lock().insert(instrument.clone(), price);
    }

    pub fn clear_price(&self, instrument: &InstrumentId) {
        self.prices.lock().remove(instrument);
    }

    /// Queue a signal; it also becomes the instrument's current price.
    pub fn push_signal(&self, signal: Signal) {
        self.set_price(&signal.instrument, signal.signal_price);
        self.signals
            .lock()
            .entry(signal.instrument.clone())
            .or_default()
            .push_back(signal);
    }
}

impl MarketFeed for StaticMarketFeed {
    fn current_price(&self, instrument: &InstrumentId) -> BoxFuture<'_, Option<Price>> {
        let price = self.prices.lock().get(instrument).copied();
        Box::pin(std::future::ready(price))
    }

    fn latest_signal(&self, instrument: &InstrumentId) -> BoxFuture<'_, Option<Signal>> {
        let signal = self
            .signals
            .lock()
            .get_mut(instrument)
            .and_then(VecDeque::pop_front);
        Box::pin(std::future::ready(signal))
    }
}
