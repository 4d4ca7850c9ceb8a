//! ConditionalOrderBuilder: pure SL/TP spec construction.
//!
//! The closing side is derived once here from the entry side and both are
//! carried on the spec. All tick/lot rounding happens here, once; payload
//! rendering never rounds again.
//!
//! | Kind | execution | trigger | reference |
//! |------|-----------|---------|-----------|
//! | STOP | stop price | stop pushed `stop_trigger_buffer_pct` further from entry | entry fill |
//! | TAKE_PROFIT | target | = execution | current market, strictly on the closing side |

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use sigex_core::{
    ComparisonOp, ConditionalOrderSpec, InstrumentSpec, OrderKind, OrderSide, Price, Size,
    TriggerCondition,
};

use crate::error::{ExecutorError, ExecutorResult};

/// Builder tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuilderConfig {
    /// How far (%) past the stop price the STOP trigger sits.
    #[serde(default = "default_stop_trigger_buffer_pct")]
    pub stop_trigger_buffer_pct: Decimal,
    /// How far (%) inside the market price the TP reference sits.
    #[serde(default = "default_tp_reference_offset_pct")]
    pub tp_reference_offset_pct: Decimal,
}

fn default_stop_trigger_buffer_pct() -> Decimal {
    Decimal::new(75, 2)
}

fn default_tp_reference_offset_pct() -> Decimal {
    Decimal::new(1, 1)
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            stop_trigger_buffer_pct: default_stop_trigger_buffer_pct(),
            tp_reference_offset_pct: default_tp_reference_offset_pct(),
        }
    }
}

/// Distance of the SL/TP targets from the entry fill, in percent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectionParams {
    #[serde(default = "default_stop_loss_pct")]
    pub stop_loss_pct: Decimal,
    #[serde(default = "default_take_profit_pct")]
    pub take_profit_pct: Decimal,
}

fn default_stop_loss_pct() -> Decimal {
    Decimal::from(3)
}

fn default_take_profit_pct() -> Decimal {
    Decimal::from(6)
}

impl Default for ProtectionParams {
    fn default() -> Self {
        Self {
            stop_loss_pct: default_stop_loss_pct(),
            take_profit_pct: default_take_profit_pct(),
        }
    }
}

impl ProtectionParams {
    /// (stop target, take-profit target) for a fill, before tick rounding.
    pub fn targets(&self, entry_side: OrderSide, fill_price: Price) -> (Price, Price) {
        match entry_side {
            OrderSide::Buy => (
                fill_price.offset_pct(-self.stop_loss_pct),
                fill_price.offset_pct(self.take_profit_pct),
            ),
            OrderSide::Sell => (
                fill_price.offset_pct(self.stop_loss_pct),
                fill_price.offset_pct(-self.take_profit_pct),
            ),
        }
    }
}

/// Inputs for one SL or TP spec.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub instrument: InstrumentSpec,
    pub entry_side: OrderSide,
    /// Actual entry fill price.
    pub entry_price: Price,
    /// Stop price (STOP) or target price (TAKE_PROFIT).
    pub close_target_price: Price,
    pub quantity: Size,
    pub kind: OrderKind,
    /// Current market price. Required for TAKE_PROFIT.
    pub market_price: Option<Price>,
}

#[derive(Debug, Clone, Default)]
pub struct ConditionalOrderBuilder {
    config: BuilderConfig,
}

impl ConditionalOrderBuilder {
    pub fn new(config: BuilderConfig) -> Self {
        Self { config }
    }

    pub fn build(&self, req: &BuildRequest) -> ExecutorResult<ConditionalOrderSpec> {
        if !req.entry_price.is_positive() {
            return Err(ExecutorError::InvalidSpec(format!(
                "entry price must be positive: {}",
                req.entry_price
            )));
        }
        if !req.close_target_price.is_positive() {
            return Err(ExecutorError::InvalidSpec(format!(
                "{} target must be positive: {}",
                req.kind, req.close_target_price
            )));
        }

        let spec = &req.instrument;
        let quantity = req.quantity.round_to_lot(spec.lot_size);
        if !quantity.is_positive() {
            return Err(ExecutorError::InvalidSpec(format!(
                "quantity {} rounds to zero at lot size {}",
                req.quantity, spec.lot_size
            )));
        }

        let closing_side = req.entry_side.opposite();
        match req.kind {
            OrderKind::Stop => self.build_stop(req, closing_side, quantity),
            OrderKind::TakeProfit => self.build_take_profit(req, closing_side, quantity),
        }
    }

    fn build_stop(
        &self,
        req: &BuildRequest,
        closing_side: OrderSide,
        quantity: Size,
    ) -> ExecutorResult<ConditionalOrderSpec> {
        let tick = req.instrument.tick_size;
        let execution_price = req.close_target_price.round_to_tick(tick);

        let on_loss_side = match req.entry_side {
            OrderSide::Buy => execution_price < req.entry_price,
            OrderSide::Sell => execution_price > req.entry_price,
        };
        if !on_loss_side {
            return Err(ExecutorError::InvalidSpec(format!(
                "stop {} is not on the loss side of a {} entry at {}",
                execution_price, req.entry_side, req.entry_price
            )));
        }

        let buffer = self.config.stop_trigger_buffer_pct;
        let (trigger_price, op) = match closing_side {
            OrderSide::Sell => {
                let mut trigger = execution_price.offset_pct(-buffer).floor_to_tick(tick);
                if trigger >= execution_price {
                    trigger = execution_price - tick;
                }
                (trigger, ComparisonOp::LessOrEqual)
            }
            OrderSide::Buy => {
                let mut trigger = execution_price.offset_pct(buffer).ceil_to_tick(tick);
                if trigger <= execution_price {
                    trigger = execution_price + tick;
                }
                (trigger, ComparisonOp::GreaterOrEqual)
            }
        };
        if trigger_price == execution_price || !trigger_price.is_positive() {
            return Err(ExecutorError::InvalidSpec(format!(
                "stop trigger {trigger_price} cannot be separated from execution {execution_price}"
            )));
        }

        Ok(ConditionalOrderSpec {
            instrument: req.instrument.instrument.clone(),
            entry_side: req.entry_side,
            closing_side,
            execution_price,
            quantity,
            trigger_price,
            reference_price: req.entry_price.round_to_tick(tick),
            trigger_condition: TriggerCondition {
                op,
                price: trigger_price,
            },
            kind: OrderKind::Stop,
        })
    }

    fn build_take_profit(
        &self,
        req: &BuildRequest,
        closing_side: OrderSide,
        quantity: Size,
    ) -> ExecutorResult<ConditionalOrderSpec> {
        let tick = req.instrument.tick_size;
        let market = req
            .market_price
            .filter(Price::is_positive)
            .ok_or_else(|| ExecutorError::MarketPriceUnavailable(req.instrument.instrument.to_string()))?;

        let target = req.close_target_price.round_to_tick(tick);
        let on_profit_side = match req.entry_side {
            OrderSide::Buy => target > req.entry_price,
            OrderSide::Sell => target < req.entry_price,
        };
        if !on_profit_side {
            return Err(ExecutorError::InvalidSpec(format!(
                "take-profit {} is not on the profit side of a {} entry at {}",
                target, req.entry_side, req.entry_price
            )));
        }

        let offset = self.config.tp_reference_offset_pct;
        let (reference_price, op) = match closing_side {
            OrderSide::Sell => {
                let mut reference = market.offset_pct(-offset).floor_to_tick(tick);
                if reference >= market {
                    reference = reference - tick;
                }
                (reference, ComparisonOp::GreaterOrEqual)
            }
            OrderSide::Buy => {
                let mut reference = market.offset_pct(offset).ceil_to_tick(tick);
                if reference <= market {
                    reference = reference + tick;
                }
                (reference, ComparisonOp::LessOrEqual)
            }
        };
        let strictly_inside = match closing_side {
            OrderSide::Sell => reference_price < market,
            OrderSide::Buy => reference_price > market,
        };
        if !strictly_inside || !reference_price.is_positive() {
            return Err(ExecutorError::InvalidSpec(format!(
                "reference {reference_price} is not strictly {} market {market}",
                if closing_side == OrderSide::Sell { "below" } else { "above" }
            )));
        }

        Ok(ConditionalOrderSpec {
            instrument: req.instrument.instrument.clone(),
            entry_side: req.entry_side,
            closing_side,
            execution_price: target,
            quantity,
            trigger_price: target,
            reference_price,
            trigger_condition: TriggerCondition { op, price: target },
            kind: OrderKind::TakeProfit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use sigex_core::InstrumentId;

    fn instrument() -> InstrumentSpec {
        InstrumentSpec::new(InstrumentId::from("X"), Price::new(dec!(0.01)), Size::new(dec!(0.001)))
    }

    fn request(side: OrderSide, target: Decimal, kind: OrderKind, market: Option<Decimal>) -> BuildRequest {
        BuildRequest {
            instrument: instrument(),
            entry_side: side,
            entry_price: Price::new(dec!(100)),
            close_target_price: Price::new(target),
            quantity: Size::new(dec!(10)),
            kind,
            market_price: market.map(Price::new),
        }
    }

    fn builder() -> ConditionalOrderBuilder {
        ConditionalOrderBuilder::new(BuilderConfig::default())
    }

    #[test]
    fn test_buy_entry_stop() {
        let spec = builder()
            .build(&request(OrderSide::Buy, dec!(97), OrderKind::Stop, None))
            .unwrap();
        assert_eq!(spec.closing_side, OrderSide::Sell);
        assert_eq!(spec.entry_side, OrderSide::Buy);
        assert_eq!(spec.execution_price, Price::new(dec!(97)));
        assert_eq!(spec.trigger_price, Price::new(dec!(96.27)));
        assert!(spec.trigger_price.inner() >= dec!(96.03) && spec.trigger_price.inner() <= dec!(96.5));
        assert_eq!(spec.reference_price, Price::new(dec!(100)));
        assert_eq!(spec.trigger_condition.to_string(), "<=96.27");
        assert_ne!(spec.execution_price, spec.trigger_price);
    }

    #[test]
    fn test_buy_entry_take_profit() {
        let spec = builder()
            .build(&request(OrderSide::Buy, dec!(106), OrderKind::TakeProfit, Some(dec!(101.5))))
            .unwrap();
        assert_eq!(spec.closing_side, OrderSide::Sell);
        assert_eq!(spec.execution_price, Price::new(dec!(106)));
        assert_eq!(spec.execution_price, spec.trigger_price);
        assert!(spec.reference_price < Price::new(dec!(101.5)));
        assert_ne!(spec.reference_price, Price::new(dec!(100)));
        assert_eq!(spec.trigger_condition.to_string(), ">=106");
    }

    #[test]
    fn test_sell_entry_mirrors() {
        let stop = builder()
            .build(&request(OrderSide::Sell, dec!(103), OrderKind::Stop, None))
            .unwrap();
        assert_eq!(stop.closing_side, OrderSide::Buy);
        assert!(stop.trigger_price > stop.execution_price);
        assert_eq!(stop.trigger_price, Price::new(dec!(103.78)));
        assert_eq!(stop.trigger_condition.op, ComparisonOp::GreaterOrEqual);

        let tp = builder()
            .build(&request(OrderSide::Sell, dec!(94), OrderKind::TakeProfit, Some(dec!(99))))
            .unwrap();
        assert_eq!(tp.closing_side, OrderSide::Buy);
        assert!(tp.reference_price > Price::new(dec!(99)));
        assert_eq!(tp.trigger_condition.op, ComparisonOp::LessOrEqual);
    }

    #[test]
    fn test_take_profit_requires_market_price() {
        let err = builder()
            .build(&request(OrderSide::Buy, dec!(106), OrderKind::TakeProfit, None))
            .unwrap_err();
        assert!(matches!(err, ExecutorError::MarketPriceUnavailable(_)));
    }

    #[test]
    fn test_reference_strictly_below_market_even_with_zero_offset() {
        let b = ConditionalOrderBuilder::new(BuilderConfig {
            stop_trigger_buffer_pct: dec!(0.75),
            tp_reference_offset_pct: dec!(0),
        });
        let spec = b
            .build(&request(OrderSide::Buy, dec!(106), OrderKind::TakeProfit, Some(dec!(101))))
            .unwrap();
        assert_eq!(spec.reference_price, Price::new(dec!(100.99)));
    }

    #[test]
    fn test_stop_on_wrong_side_rejected() {
        assert!(builder()
            .build(&request(OrderSide::Buy, dec!(101), OrderKind::Stop, None))
            .is_err());
        assert!(builder()
            .build(&request(OrderSide::Buy, dec!(99), OrderKind::TakeProfit, Some(dec!(100))))
            .is_err());
    }

    #[test]
    fn test_rounding_is_shared_between_equal_fields() {
        let spec = builder()
            .build(&request(OrderSide::Buy, dec!(106.004999), OrderKind::TakeProfit, Some(dec!(101))))
            .unwrap();
        assert_eq!(spec.execution_price, Price::new(dec!(106.00)));
        assert_eq!(spec.trigger_price, spec.execution_price);
        assert_eq!(spec.trigger_condition.price, spec.trigger_price);
    }

    #[test]
    fn test_quantity_rounds_down_to_lot() {
        let mut req = request(OrderSide::Buy, dec!(97), OrderKind::Stop, None);
        req.quantity = Size::new(dec!(1.23456));
        assert_eq!(builder().build(&req).unwrap().quantity, Size::new(dec!(1.234)));

        req.quantity = Size::new(dec!(0.0004));
        assert!(builder().build(&req).is_err());
    }

    #[test]
    fn test_protection_targets() {
        let params = ProtectionParams::default();
        let (sl, tp) = params.targets(OrderSide::Buy, Price::new(dec!(100)));
        assert_eq!(sl, Price::new(dec!(97)));
        assert_eq!(tp, Price::new(dec!(106)));

        let (sl, tp) = params.targets(OrderSide::Sell, Price::new(dec!(100)));
        assert_eq!(sl, Price::new(dec!(103)));
        assert_eq!(tp, Price::new(dec!(94)));
    }
}
