use crate::error::{BillingError, Result};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Sub};
use std::str::FromStr;

/// Number of fractional digits every monetary value is kept at.
pub const SCALE: u32 = 2;

/// A monetary value with two decimal places of precision.
///
/// Wraps `rust_decimal::Decimal` so ledger arithmetic is exact. Values that come
/// from the caller must already be expressed in whole cents (see [`Money::exact`]);
/// values reported back by the gateway are rounded to cents on entry
/// (see [`Money::from_gateway`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(Decimal);

impl Money {
    pub const ZERO: Self = Self(Decimal::ZERO);

    /// Accepts a caller-supplied value, rejecting sub-cent precision.
    pub fn exact(value: Decimal) -> Result<Self> {
        if value.round_dp(SCALE) != value {
            return Err(BillingError::InvalidArgument(format!(
                "{value} has more than {SCALE} fractional digits"
            )));
        }
        Ok(Self(value.round_dp(SCALE)))
    }

    /// Normalizes an amount reported by the gateway to whole cents.
    pub fn from_gateway(value: Decimal) -> Self {
        Self(value.round_dp_with_strategy(SCALE, RoundingStrategy::MidpointAwayFromZero))
    }

    pub fn value(&self) -> Decimal {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn is_positive(&self) -> bool {
        self.0 > Decimal::ZERO
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}", self.0)
    }
}

impl Add for Money {
    type Output = Self;
    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0 + rhs.0)
    }
}

impl Sub for Money {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self::Output {
        Self(self.0 - rhs.0)
    }
}

impl AddAssign for Money {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl Sum for Money {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::ZERO, Add::add)
    }
}

impl<'a> Sum<&'a Money> for Money {
    fn sum<I: Iterator<Item = &'a Money>>(iter: I) -> Self {
        iter.copied().sum()
    }
}

/// A strictly positive monetary amount, used for charges and line-item prices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "Decimal", into = "Decimal")]
pub struct Amount(Money);

impl Amount {
    pub const ONE: Self = Self(Money(Decimal::ONE));

    pub fn new(value: Decimal) -> Result<Self> {
        let money = Money::exact(value)?;
        if money.is_positive() {
            Ok(Self(money))
        } else {
            Err(BillingError::ValidationError(
                "Amount must be positive".to_string(),
            ))
        }
    }

    pub fn money(&self) -> Money {
        self.0
    }

    pub fn value(&self) -> Decimal {
        self.0.value()
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl TryFrom<Decimal> for Amount {
    type Error = BillingError;

    fn try_from(value: Decimal) -> Result<Self> {
        Self::new(value)
    }
}

impl From<Amount> for Decimal {
    fn from(amount: Amount) -> Self {
        amount.value()
    }
}

impl From<Amount> for Money {
    fn from(amount: Amount) -> Self {
        amount.0
    }
}

/// ISO 4217 currencies the gateway accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    #[default]
    Try,
    Eur,
    Usd,
    Gbp,
    Irr,
}

impl Currency {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Try => "TRY",
            Self::Eur => "EUR",
            Self::Usd => "USD",
            Self::Gbp => "GBP",
            Self::Irr => "IRR",
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Currency {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "TRY" | "TL" => Ok(Self::Try),
            "EUR" => Ok(Self::Eur),
            "USD" => Ok(Self::Usd),
            "GBP" => Ok(Self::Gbp),
            "IRR" => Ok(Self::Irr),
            other => Err(BillingError::ValidationError(format!(
                "Unsupported currency: {other}"
            ))),
        }
    }
}
