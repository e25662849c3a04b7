//! Monetary newtypes: prices, quote-unit quantities, leverage and
//! satoshi amounts.
//!
//! All arithmetic is done in [`Decimal`]; conversion into satoshis always
//! rounds toward zero so that two peers computing the same value from the
//! same inputs get the same integer.

use std::fmt;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::{CfdError, Result, constants};

// ---------------------------------------------------------------------------
// Price
// ---------------------------------------------------------------------------

/// A strictly positive BTC/USD price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Price(Decimal);

impl Price {
    /// # Errors
    /// Returns `InvalidPrice` unless `value > 0`.
    pub fn new(value: Decimal) -> Result<Self> {
        if value <= Decimal::ZERO {
            return Err(CfdError::InvalidPrice {
                reason: format!("price must be positive, got {value}"),
            });
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn into_decimal(self) -> Decimal {
        self.0
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Usd
// ---------------------------------------------------------------------------

/// A quantity denominated in the quote currency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Usd(Decimal);

impl Usd {
    pub const ZERO: Self = Self(Decimal::ZERO);

    #[must_use]
    pub fn new(value: Decimal) -> Self {
        Self(value)
    }

    #[must_use]
    pub fn into_decimal(self) -> Decimal {
        self.0
    }
}

impl fmt::Display for Usd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Leverage
// ---------------------------------------------------------------------------

/// Leverage multiplier of the long side. The short side is never leveraged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Leverage(u8);

impl Leverage {
    pub const ONE: Self = Self(1);

    /// # Errors
    /// Returns `InvalidTerms` for zero leverage.
    pub fn new(value: u8) -> Result<Self> {
        if value == 0 {
            return Err(CfdError::InvalidTerms {
                reason: "leverage must be at least 1".into(),
            });
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u8 {
        self.0
    }

    #[must_use]
    pub fn as_decimal(self) -> Decimal {
        Decimal::from(self.0)
    }
}

impl fmt::Display for Leverage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "x{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Amount / SignedAmount
// ---------------------------------------------------------------------------

/// An amount of bitcoin in satoshis.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Amount(u64);

impl Amount {
    pub const ZERO: Self = Self(0);

    #[must_use]
    pub const fn from_sat(sats: u64) -> Self {
        Self(sats)
    }

    #[must_use]
    pub fn to_sat(self) -> u64 {
        self.0
    }

    /// Convert a BTC value to satoshis, rounding toward zero.
    ///
    /// # Errors
    /// Returns `InvalidTerms` for negative or out-of-range values.
    pub fn from_btc(btc: Decimal) -> Result<Self> {
        if btc.is_sign_negative() && !btc.is_zero() {
            return Err(CfdError::InvalidTerms {
                reason: format!("negative bitcoin amount {btc}"),
            });
        }
        let sats = btc
            .checked_mul(Decimal::from(constants::SATS_PER_BTC))
            .ok_or_else(|| CfdError::InvalidTerms {
                reason: format!("bitcoin amount {btc} out of range"),
            })?
            .round_dp_with_strategy(0, RoundingStrategy::ToZero);
        let sats = sats.to_u64().ok_or_else(|| CfdError::InvalidTerms {
            reason: format!("bitcoin amount {btc} out of range"),
        })?;
        Ok(Self(sats))
    }

    #[must_use]
    pub fn to_btc(self) -> Decimal {
        Decimal::from(self.0) / Decimal::from(constants::SATS_PER_BTC)
    }

    #[must_use]
    pub fn checked_add(self, rhs: Self) -> Option<Self> {
        self.0.checked_add(rhs.0).map(Self)
    }

    #[must_use]
    pub fn checked_sub(self, rhs: Self) -> Option<Self> {
        self.0.checked_sub(rhs.0).map(Self)
    }

    #[must_use]
    pub fn saturating_sub(self, rhs: Self) -> Self {
        Self(self.0.saturating_sub(rhs.0))
    }

    #[must_use]
    pub fn to_signed(self) -> SignedAmount {
        SignedAmount(i64::try_from(self.0).unwrap_or(i64::MAX))
    }
}

impl std::iter::Sum for Amount {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        Self(iter.map(|a| a.0).fold(0u64, u64::saturating_add))
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} sat", self.0)
    }
}

/// A signed satoshi amount, used for profit and loss.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct SignedAmount(i64);

impl SignedAmount {
    pub const ZERO: Self = Self(0);

    #[must_use]
    pub const fn from_sat(sats: i64) -> Self {
        Self(sats)
    }

    #[must_use]
    pub fn to_sat(self) -> i64 {
        self.0
    }
}

impl std::ops::Sub for SignedAmount {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self(self.0.saturating_sub(rhs.0))
    }
}

impl fmt::Display for SignedAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} sat", self.0)
    }
}

/// A percentage, e.g. profit relative to margin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Percent(pub Decimal);

impl fmt::Display for Percent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}%", self.0.round_dp(2))
    }
}

// ---------------------------------------------------------------------------
// Position / Role
// ---------------------------------------------------------------------------

/// Side of the contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Position {
    Long,
    Short,
}

impl Position {
    #[must_use]
    pub fn counter(self) -> Self {
        match self {
            Self::Long => Self::Short,
            Self::Short => Self::Long,
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
        }
    }
}

/// Protocol role of a daemon. The maker publishes offers and always takes
/// the short side; the taker goes long.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Maker,
    Taker,
}

impl Role {
    #[must_use]
    pub fn position(self) -> Position {
        match self {
            Self::Maker => Position::Short,
            Self::Taker => Position::Long,
        }
    }

    #[must_use]
    pub fn counterparty(self) -> Self {
        match self {
            Self::Maker => Self::Taker,
            Self::Taker => Self::Maker,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Maker => write!(f, "MAKER"),
            Self::Taker => write!(f, "TAKER"),
        }
    }
}
