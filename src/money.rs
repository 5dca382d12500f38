//! Fixed-point money and multiplier types
//!
//! Balances, stakes, and payouts are integers in minor units (hundredths).
//! Multipliers are integers in hundredths as well (`150` == 1.50x), so a
//! payout is exact: `stake * multiplier / 100` with no floating drift.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::ops::{Add, AddAssign, Neg, Sub, SubAssign};

use crate::errors::{Error, Result};

/// An amount of currency in minor units (hundredths).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Money(i64);

impl Money {
    pub const ZERO: Money = Money(0);

    pub const fn from_minor(units: i64) -> Self {
        Money(units)
    }

    /// Whole currency units, e.g. `Money::from_major(10)` == 10.00.
    pub const fn from_major(units: i64) -> Self {
        Money(units * 100)
    }

    pub const fn minor(self) -> i64 {
        self.0
    }

    pub fn is_positive(self) -> bool {
        self.0 > 0
    }

    pub fn is_negative(self) -> bool {
        self.0 < 0
    }

    pub fn abs(self) -> Money {
        Money(self.0.abs())
    }

    pub fn checked_add(self, other: Money) -> Option<Money> {
        self.0.checked_add(other.0).map(Money)
    }

    pub fn checked_sub(self, other: Money) -> Option<Money> {
        self.0.checked_sub(other.0).map(Money)
    }

    /// Parse a client-supplied amount. Rejects NaN, infinities, negative
    /// zero-adjacent noise, and anything with more than two decimal places.
    pub fn parse_amount(value: f64) -> Result<Money> {
        if !value.is_finite() {
            return Err(Error::invalid("amount must be a finite number"));
        }
        let cents = value * 100.0;
        let rounded = cents.round();
        if (cents - rounded).abs() > 1e-6 {
            return Err(Error::invalid(
                "amount must have at most two decimal places",
            ));
        }
        if rounded.abs() > i64::MAX as f64 / 2.0 {
            return Err(Error::invalid("amount out of range"));
        }
        Ok(Money(rounded as i64))
    }

    pub fn to_f64(self) -> f64 {
        self.0 as f64 / 100.0
    }

    /// Payout for a stake at a multiplier: `stake * m / 100`, exact in
    /// minor units.
    pub fn payout_at(self, multiplier: Multiplier) -> Money {
        Money(self.0 * multiplier.x100() as i64 / 100)
    }
}

impl Add for Money {
    type Output = Money;
    fn add(self, rhs: Money) -> Money {
        Money(self.0 + rhs.0)
    }
}

impl AddAssign for Money {
    fn add_assign(&mut self, rhs: Money) {
        self.0 += rhs.0;
    }
}

impl Sub for Money {
    type Output = Money;
    fn sub(self, rhs: Money) -> Money {
        Money(self.0 - rhs.0)
    }
}

impl SubAssign for Money {
    fn sub_assign(&mut self, rhs: Money) {
        self.0 -= rhs.0;
    }
}

impl Neg for Money {
    type Output = Money;
    fn neg(self) -> Money {
        Money(-self.0)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{}{}.{:02}", sign, abs / 100, abs % 100)
    }
}

impl Serialize for Money {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.to_f64())
    }
}

impl<'de> Deserialize<'de> for Money {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = f64::deserialize(deserializer)?;
        Money::parse_amount(value).map_err(serde::de::Error::custom)
    }
}

/// A game multiplier in hundredths; never below 1.00x.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Multiplier(u64);

impl Multiplier {
    pub const ONE: Multiplier = Multiplier(100);

    pub const fn from_x100(value: u64) -> Self {
        Multiplier(value)
    }

    pub const fn x100(self) -> u64 {
        self.0
    }

    /// Parse a client-supplied multiplier, e.g. an auto-cashout threshold.
    /// Must be at least 1.01x and have at most two decimal places.
    pub fn parse(value: f64) -> Result<Multiplier> {
        if !value.is_finite() {
            return Err(Error::invalid("multiplier must be a finite number"));
        }
        let x100 = value * 100.0;
        let rounded = x100.round();
        if (x100 - rounded).abs() > 1e-6 {
            return Err(Error::invalid(
                "multiplier must have at most two decimal places",
            ));
        }
        if rounded < 101.0 {
            return Err(Error::invalid("multiplier must be at least 1.01"));
        }
        if rounded > u64::MAX as f64 / 2.0 {
            return Err(Error::invalid("multiplier out of range"));
        }
        Ok(Multiplier(rounded as u64))
    }

    pub fn to_f64(self) -> f64 {
        self.0 as f64 / 100.0
    }
}

impl fmt::Display for Multiplier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}x", self.0 / 100, self.0 % 100)
    }
}

impl Serialize for Multiplier {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.to_f64())
    }
}

impl<'de> Deserialize<'de> for Multiplier {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = f64::deserialize(deserializer)?;
        Multiplier::parse(value).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_formats_minor_units() {
        assert_eq!(Money::from_minor(12345).to_string(), "123.45");
        assert_eq!(Money::from_minor(-50).to_string(), "-0.50");
        assert_eq!(Money::ZERO.to_string(), "0.00");
    }

    #[test]
    fn parse_amount_accepts_two_decimals() {
        assert_eq!(Money::parse_amount(10.0).unwrap(), Money::from_major(10));
        assert_eq!(Money::parse_amount(0.01).unwrap(), Money::from_minor(1));
        assert_eq!(
            Money::parse_amount(123.45).unwrap(),
            Money::from_minor(12345)
        );
    }

    #[test]
    fn parse_amount_rejects_sub_cent_precision() {
        assert!(Money::parse_amount(1.005).is_err());
        assert!(Money::parse_amount(f64::NAN).is_err());
        assert!(Money::parse_amount(f64::INFINITY).is_err());
    }

    #[test]
    fn payout_is_exact() {
        // 100.00 at 1.50x = 150.00
        let stake = Money::from_major(100);
        assert_eq!(
            stake.payout_at(Multiplier::from_x100(150)),
            Money::from_major(150)
        );
        // 0.50 at 2.45x = 1.22 (floor of 1.225)
        assert_eq!(
            Money::from_minor(50).payout_at(Multiplier::from_x100(245)),
            Money::from_minor(122)
        );
    }

    #[test]
    fn multiplier_parse_bounds() {
        assert_eq!(Multiplier::parse(1.5).unwrap(), Multiplier::from_x100(150));
        assert!(Multiplier::parse(1.0).is_err());
        assert!(Multiplier::parse(1.005).is_err());
    }

    #[test]
    fn money_arithmetic() {
        let a = Money::from_major(10);
        let b = Money::from_minor(250);
        assert_eq!((a + b).minor(), 1250);
        assert_eq!((a - b).minor(), 750);
        assert_eq!((-b).minor(), -250);
    }
}
