//! Precision-safe decimal types for trading.
//!
//! Uses `rust_decimal` for exact decimal arithmetic. All tick/lot rounding
//! for order fields goes through these helpers so that two fields which must
//! be equal can never round to different values.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Mul, Sub};
use std::str::FromStr;

/// Price with exact decimal precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Price(pub Decimal);

impl Price {
    pub const ZERO: Self = Self(Decimal::ZERO);

    #[inline]
    pub fn new(value: Decimal) -> Self {
        Self(value)
    }

    #[inline]
    pub fn inner(&self) -> Decimal {
        self.0
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    #[inline]
    pub fn is_positive(&self) -> bool {
        self.0.is_sign_positive() && !self.0.is_zero()
    }

    /// Round down to tick size.
    #[inline]
    pub fn floor_to_tick(&self, tick_size: Price) -> Self {
        if tick_size.is_zero() {
            return *self;
        }
        Self((self.0 / tick_size.0).floor() * tick_size.0)
    }

    /// Round up to tick size.
    #[inline]
    pub fn ceil_to_tick(&self, tick_size: Price) -> Self {
        if tick_size.is_zero() {
            return *self;
        }
        Self((self.0 / tick_size.0).ceil() * tick_size.0)
    }

    /// Round to the nearest tick (midpoint away from zero).
    #[inline]
    pub fn round_to_tick(&self, tick_size: Price) -> Self {
        if tick_size.is_zero() {
            return *self;
        }
        let ticks = (self.0 / tick_size.0).round_dp_with_strategy(
            0,
            rust_decimal::RoundingStrategy::MidpointAwayFromZero,
        );
        Self(ticks * tick_size.0)
    }

    /// Scale by `(1 + pct / 100)`. Negative `pct` scales down.
    #[inline]
    pub fn offset_pct(&self, pct: Decimal) -> Self {
        Self(self.0 * (Decimal::ONE + pct / Decimal::ONE_HUNDRED))
    }

    /// Calculate percentage difference from another price.
    #[inline]
    pub fn pct_from(&self, other: Price) -> Option<Decimal> {
        if other.is_zero() {
            return None;
        }
        Some((self.0 - other.0) / other.0 * Decimal::ONE_HUNDRED)
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.normalize())
    }
}

impl FromStr for Price {
    type Err = rust_decimal::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

impl From<Decimal> for Price {
    fn from(d: Decimal) -> Self {
        Self(d)
    }
}

impl Add for Price {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0 + rhs.0)
    }
}

impl Sub for Price {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        Self(self.0 - rhs.0)
    }
}

impl Mul<Decimal> for Price {
    type Output = Self;

    fn mul(self, rhs: Decimal) -> Self::Output {
        Self(self.0 * rhs)
    }
}

/// Size/quantity with exact decimal precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Size(pub Decimal);

impl Size {
    pub const ZERO: Self = Self(Decimal::ZERO);

    #[inline]
    pub fn new(value: Decimal) -> Self {
        Self(value)
    }

    #[inline]
    pub fn inner(&self) -> Decimal {
        self.0
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    #[inline]
    pub fn is_positive(&self) -> bool {
        self.0.is_sign_positive() && !self.0.is_zero()
    }

    /// Round down to lot size.
    #[inline]
    pub fn round_to_lot(&self, lot_size: Size) -> Self {
        if lot_size.is_zero() {
            return *self;
        }
        Self((self.0 / lot_size.0).floor() * lot_size.0)
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.normalize())
    }
}

impl FromStr for Size {
    type Err = rust_decimal::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

impl From<Decimal> for Size {
    fn from(d: Decimal) -> Self {
        Self(d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_price_tick_rounding_modes() {
        let price = Price::new(dec!(96.2725));
        let tick = Price::new(dec!(0.01));

        assert_eq!(price.floor_to_tick(tick).0, dec!(96.27));
        assert_eq!(price.ceil_to_tick(tick).0, dec!(96.28));
        assert_eq!(price.round_to_tick(tick).0, dec!(96.27));
        assert_eq!(Price::new(dec!(1.005)).round_to_tick(tick).0, dec!(1.01));
    }

    #[test]
    fn test_zero_tick_is_identity() {
        let price = Price::new(dec!(12.3456));
        assert_eq!(price.round_to_tick(Price::ZERO), price);
        assert_eq!(price.floor_to_tick(Price::ZERO), price);
    }

    #[test]
    fn test_offset_pct() {
        let price = Price::new(dec!(97));
        assert_eq!(price.offset_pct(dec!(-1)).0, dec!(96.03));
        assert_eq!(Price::new(dec!(100)).offset_pct(dec!(6)).0, dec!(106));
    }

    #[test]
    fn test_pct_from() {
        let p1 = Price::new(dec!(100));
        let p2 = Price::new(dec!(99.5));
        assert_eq!(p2.pct_from(p1), Some(dec!(-0.5)));
        assert_eq!(p1.pct_from(Price::ZERO), None);
    }

    #[test]
    fn test_size_round_to_lot() {
        let size = Size::new(dec!(1.2345));
        let lot = Size::new(dec!(0.001));
        assert_eq!(size.round_to_lot(lot).0, dec!(1.234));
    }

    #[test]
    fn test_display_is_normalized() {
        assert_eq!(Price::new(dec!(106.00)).to_string(), "106");
        assert_eq!(Size::new(dec!(10.500)).to_string(), "10.5");
    }
}
