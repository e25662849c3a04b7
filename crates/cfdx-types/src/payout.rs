//! Contract math: margins, liquidation price, payouts and profit.
//!
//! Every function here is a pure function of `(initial price, leverage,
//! quantity)` and, for payouts, the closing price. Both peers run the same
//! code on the same inputs, so the results are bit-identical; any divergence
//! on the wire is therefore a protocol violation.
//!
//! ```text
//!   long payout
//!       │                         ┌──────────── pool
//!       │                      ╱──┘
//!       │                  ╱───
//!       │              ╱───
//!       │          ╱───
//!     0 ├──────────┘
//!       └──────────┬──────────┬──────────────▶ closing price
//!             liquidation   initial
//! ```
//!
//! The long side puts up `Q / (xi · L)` BTC, the short side `Q / xi` BTC.
//! The long is liquidated at `xi · L / (L + 1)`; above that the long payout
//! is `pool − Q / xc` and the short receives the rest.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{
    Amount, CfdError, LiquidationPolicy, Leverage, Percent, Position, Price, Result,
    SignedAmount, Usd, constants,
};

/// The economic terms of a contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Terms {
    pub initial_price: Price,
    pub leverage: Leverage,
    pub quantity: Usd,
}

/// How the funding output is split between the two sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payout {
    pub long: Amount,
    pub short: Amount,
}

impl Payout {
    #[must_use]
    pub fn for_position(&self, position: Position) -> Amount {
        match position {
            Position::Long => self.long,
            Position::Short => self.short,
        }
    }

    #[must_use]
    pub fn total(&self) -> Amount {
        Amount::from_sat(self.long.to_sat().saturating_add(self.short.to_sat()))
    }
}

impl Terms {
    #[must_use]
    pub fn new(initial_price: Price, leverage: Leverage, quantity: Usd) -> Self {
        Self {
            initial_price,
            leverage,
            quantity,
        }
    }

    /// Margin in quote units: `quantity / leverage`.
    #[must_use]
    pub fn quote_margin(&self) -> Usd {
        Usd::new(self.quantity.into_decimal() / self.leverage.as_decimal())
    }

    /// Long collateral: `quantity / (price · leverage)` BTC.
    pub fn long_margin(&self) -> Result<Amount> {
        let price = self.initial_price.into_decimal();
        let btc = checked_div(
            self.quantity.into_decimal(),
            checked_mul(price, self.leverage.as_decimal())?,
        )?;
        Amount::from_btc(btc)
    }

    /// Short collateral: `quantity / price` BTC. The short side is not leveraged.
    pub fn short_margin(&self) -> Result<Amount> {
        let btc = checked_div(
            self.quantity.into_decimal(),
            self.initial_price.into_decimal(),
        )?;
        Amount::from_btc(btc)
    }

    pub fn margin(&self, position: Position) -> Result<Amount> {
        match position {
            Position::Long => self.long_margin(),
            Position::Short => self.short_margin(),
        }
    }

    /// Total collateral locked in the funding output.
    pub fn pool(&self) -> Result<Amount> {
        self.long_margin()?
            .checked_add(self.short_margin()?)
            .ok_or_else(|| CfdError::InvalidTerms {
                reason: "collateral pool overflows".into(),
            })
    }

    /// Long liquidation price: `price · leverage / (leverage + 1)`.
    pub fn liquidation_price(&self) -> Result<Price> {
        let lev = self.leverage.as_decimal();
        let raw = checked_div(checked_mul(self.initial_price.into_decimal(), lev)?, lev + Decimal::ONE)?;
        Price::new(raw.round_dp(constants::PRICE_PRECISION))
    }

    /// Payout split if the contract closes at `closing`.
    ///
    /// Losses are capped at the margin: the long gets nothing at or below
    /// the liquidation price and never more than the pool.
    pub fn payout_at(&self, closing: Price) -> Result<Payout> {
        let pool = self.pool()?;
        if closing <= self.liquidation_price()? {
            return Ok(Payout {
                long: Amount::ZERO,
                short: pool,
            });
        }

        let short_btc = checked_div(self.quantity.into_decimal(), closing.into_decimal())?;
        let short = Amount::from_btc(short_btc)?.min(pool);
        Ok(Payout {
            long: pool.saturating_sub(short),
            short,
        })
    }

    /// Profit or loss for `position` if the contract closes at `closing`.
    pub fn profit(&self, position: Position, closing: Price) -> Result<(SignedAmount, Percent)> {
        let margin = self.margin(position)?;
        let payout = self.payout_at(closing)?.for_position(position);
        let profit = payout.to_signed() - margin.to_signed();
        let percent = if margin == Amount::ZERO {
            Decimal::ZERO
        } else {
            Decimal::from(profit.to_sat()) * Decimal::ONE_HUNDRED / Decimal::from(margin.to_sat())
        };
        Ok((profit, Percent(percent)))
    }

    /// Whether the long position has breached the maintenance threshold at `mark`.
    pub fn margin_breached(&self, policy: &LiquidationPolicy, mark: Price) -> Result<bool> {
        match policy {
            LiquidationPolicy::LiquidationPrice => Ok(mark <= self.liquidation_price()?),
            LiquidationPolicy::MaintenanceMargin { ratio } => {
                let equity = Decimal::from(self.payout_at(mark)?.long.to_sat());
                let threshold = checked_mul(Decimal::from(self.long_margin()?.to_sat()), *ratio)?;
                Ok(equity <= threshold)
            }
        }
    }
}

fn checked_mul(lhs: Decimal, rhs: Decimal) -> Result<Decimal> {
    lhs.checked_mul(rhs).ok_or_else(|| CfdError::InvalidTerms {
        reason: format!("{lhs} times {rhs} overflows"),
    })
}

fn checked_div(numerator: Decimal, denominator: Decimal) -> Result<Decimal> {
    numerator
        .checked_div(denominator)
        .ok_or_else(|| CfdError::InvalidTerms {
            reason: format!("cannot divide {numerator} by {denominator}"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn terms(price: Decimal, leverage: u8, quantity: Decimal) -> Terms {
        Terms::new(
            Price::new(price).unwrap(),
            Leverage::new(leverage).unwrap(),
            Usd::new(quantity),
        )
    }

    fn price(p: Decimal) -> Price {
        Price::new(p).unwrap()
    }

    #[test]
    fn scenario_margin_and_liquidation() {
        let t = terms(dec!(42000), 5, dec!(10000));
        assert_eq!(t.quote_margin(), Usd::new(dec!(2000)));
        assert_eq!(t.liquidation_price().unwrap(), price(dec!(35000)));
        // 10000 / (42000 * 5) BTC = 0.047619047... BTC
        assert_eq!(t.long_margin().unwrap(), Amount::from_sat(4_761_904));
        // 10000 / 42000 BTC = 0.238095238... BTC
        assert_eq!(t.short_margin().unwrap(), Amount::from_sat(23_809_523));
    }

    #[test]
    fn oversized_quantity_is_an_error_not_a_panic() {
        let t = terms(dec!(42000), 5, dec!(70000000000000000000000000000));
        assert!(matches!(t.short_margin(), Err(CfdError::InvalidTerms { .. })));
        assert!(matches!(t.pool(), Err(CfdError::InvalidTerms { .. })));
    }

    #[test]
    fn liquidation_price_with_fractional_result() {
        let t = terms(dec!(46125), 5, dec!(1000));
        assert_eq!(t.liquidation_price().unwrap(), price(dec!(38437.5)));
    }

    #[test]
    fn no_price_change_no_profit() {
        let t = terms(dec!(10000), 2, dec!(10000));
        let (profit, pct) = t.profit(Position::Long, price(dec!(10000))).unwrap();
        assert_eq!(profit, SignedAmount::ZERO);
        assert_eq!(pct.0, Decimal::ZERO);
    }

    #[test]
    fn doubling_price_doubles_long_margin() {
        let t = terms(dec!(10000), 2, dec!(10000));
        let (profit, pct) = t.profit(Position::Long, price(dec!(20000))).unwrap();
        assert_eq!(profit, SignedAmount::from_sat(50_000_000));
        assert_eq!(pct.0, dec!(100));

        let (short_profit, _) = t.profit(Position::Short, price(dec!(20000))).unwrap();
        assert_eq!(short_profit, SignedAmount::from_sat(-50_000_000));
    }

    #[test]
    fn long_loss_is_capped_at_margin() {
        let t = terms(dec!(10000), 2, dec!(10000));
        let (profit, pct) = t.profit(Position::Long, price(dec!(5000))).unwrap();
        assert_eq!(profit, SignedAmount::from_sat(-50_000_000));
        assert_eq!(pct.0, dec!(-100));
    }

    #[test]
    fn liquidation_hands_pool_to_short() {
        let t = terms(dec!(9000), 2, dec!(9000));
        let payout = t.payout_at(price(dec!(6000))).unwrap();
        assert_eq!(payout.long, Amount::ZERO);
        assert_eq!(payout.short, t.pool().unwrap());
    }

    #[test]
    fn payout_conserves_pool() {
        let t = terms(dec!(42000), 5, dec!(10000));
        let pool = t.pool().unwrap();
        for p in [dec!(1), dec!(35000), dec!(35001), dec!(42000), dec!(99999), dec!(10000000)] {
            let payout = t.payout_at(price(p)).unwrap();
            assert_eq!(payout.total(), pool, "pool not conserved at {p}");
        }
    }

    #[test]
    fn maintenance_margin_breaches_before_liquidation() {
        let t = terms(dec!(42000), 5, dec!(10000));
        let policy = LiquidationPolicy::MaintenanceMargin { ratio: dec!(0.5) };
        assert!(!t.margin_breached(&policy, price(dec!(42000))).unwrap());
        assert!(t.margin_breached(&policy, price(dec!(37000))).unwrap());
        assert!(
            !t.margin_breached(&LiquidationPolicy::LiquidationPrice, price(dec!(37000)))
                .unwrap()
        );
        assert!(
            t.margin_breached(&LiquidationPolicy::LiquidationPrice, price(dec!(35000)))
                .unwrap()
        );
    }
}
