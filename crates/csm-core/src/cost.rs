//! Money value object for agent run costs.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, AddAssign};

/// Represents a monetary amount in USD.
///
/// Internally stored as microdollars (millionths of a dollar) so that
/// summing the cost of many turns does not drift.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Money {
    microdollars: i64,
}

impl Money {
    const MICRODOLLARS_PER_DOLLAR: i64 = 1_000_000;

    /// Creates Money from a USD dollar amount.
    pub fn from_usd(dollars: f64) -> Self {
        let microdollars = (dollars * Self::MICRODOLLARS_PER_DOLLAR as f64).round() as i64;
        Self { microdollars }
    }

    /// Creates a zero Money value.
    pub const fn zero() -> Self {
        Self { microdollars: 0 }
    }

    /// Returns the amount in USD as a float.
    pub fn as_usd(&self) -> f64 {
        self.microdollars as f64 / Self::MICRODOLLARS_PER_DOLLAR as f64
    }

    /// Returns true if the amount is zero.
    pub fn is_zero(&self) -> bool {
        self.microdollars == 0
    }

    /// Formats the amount for display, e.g. "$0.0042", "$0.35", "$12.3".
    pub fn format(&self) -> String {
        let dollars = self.as_usd();
        if dollars > 0.0 && dollars < 0.01 {
            format!("${dollars:.4}")
        } else if dollars < 10.0 {
            format!("${dollars:.2}")
        } else {
            format!("${dollars:.1}")
        }
    }
}

impl Add for Money {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self {
            microdollars: self.microdollars.saturating_add(other.microdollars),
        }
    }
}

impl AddAssign for Money {
    fn add_assign(&mut self, other: Self) {
        self.microdollars = self.microdollars.saturating_add(other.microdollars);
    }
}

impl Serialize for Money {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        // The wire carries `total_cost_usd` as a float
        serializer.serialize_f64(self.as_usd())
    }
}

impl<'de> Deserialize<'de> for Money {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let dollars = f64::deserialize(deserializer)?;
        Ok(Money::from_usd(dollars))
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.format())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_money_precision() {
        let mut total = Money::zero();
        for _ in 0..1_000 {
            total += Money::from_usd(0.001);
        }
        assert!((total.as_usd() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_money_formatting() {
        assert_eq!(Money::from_usd(0.0042).format(), "$0.0042");
        assert_eq!(Money::from_usd(0.35).format(), "$0.35");
        assert_eq!(Money::from_usd(12.34).format(), "$12.3");
        assert_eq!(Money::zero().format(), "$0.00");
    }

    #[test]
    fn test_money_from_wire_float() {
        let money: Money = serde_json::from_str("0.0123").unwrap();
        assert!((money.as_usd() - 0.0123).abs() < 1e-9);
        assert!(!money.is_zero());
    }
}
