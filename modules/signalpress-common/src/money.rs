use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A non-negative dollar amount held as integer micro-dollars.
///
/// Budget arithmetic stays exact (no float drift across thousands of
/// reservations); JSON sees a plain decimal dollar value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Usd(u64);

impl Usd {
    pub const ZERO: Usd = Usd(0);
    pub const MICROS_PER_DOLLAR: u64 = 1_000_000;

    pub const fn from_micros(micros: u64) -> Self {
        Self(micros)
    }

    /// Convert a dollar amount. Negative, NaN and infinite inputs become zero.
    pub fn from_dollars(dollars: f64) -> Self {
        if !dollars.is_finite() || dollars <= 0.0 {
            return Self::ZERO;
        }
        Self((dollars * Self::MICROS_PER_DOLLAR as f64).round() as u64)
    }

    pub const fn micros(self) -> u64 {
        self.0
    }

    pub fn dollars(self) -> f64 {
        self.0 as f64 / Self::MICROS_PER_DOLLAR as f64
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn saturating_sub(self, other: Usd) -> Usd {
        Usd(self.0.saturating_sub(other.0))
    }

    pub fn checked_add(self, other: Usd) -> Option<Usd> {
        self.0.checked_add(other.0).map(Usd)
    }

    /// How many whole units of `unit` fit into this amount. Zero-cost units are unbounded.
    pub fn units_of(self, unit: Usd) -> u64 {
        if unit.0 == 0 {
            return u64::MAX;
        }
        self.0 / unit.0
    }

    pub fn times(self, n: u64) -> Usd {
        Usd(self.0.saturating_mul(n))
    }
}

/// Spend as a percentage of the cap, rounded to one decimal place.
pub fn utilization_pct(spent: Usd, cap: Usd) -> f64 {
    if cap.is_zero() {
        return 0.0;
    }
    let pct = spent.0 as f64 / cap.0 as f64 * 100.0;
    (pct * 10.0).round() / 10.0
}

impl Add for Usd {
    type Output = Usd;

    fn add(self, rhs: Usd) -> Usd {
        Usd(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for Usd {
    fn add_assign(&mut self, rhs: Usd) {
        self.0 = self.0.saturating_add(rhs.0);
    }
}

impl Sum for Usd {
    fn sum<I: Iterator<Item = Usd>>(iter: I) -> Usd {
        iter.fold(Usd::ZERO, |acc, x| acc + x)
    }
}

impl fmt::Display for Usd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${:.4}", self.dollars())
    }
}

impl Serialize for Usd {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.dollars())
    }
}

impl<'de> Deserialize<'de> for Usd {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let dollars = f64::deserialize(deserializer)?;
        if !dollars.is_finite() || dollars < 0.0 {
            return Err(serde::de::Error::custom(format!(
                "dollar amount must be a non-negative number, got {dollars}"
            )));
        }
        Ok(Usd::from_dollars(dollars))
    }
}
