//! Both peers derive contract terms independently and must agree bit for bit.
//!
//! Maker and taker each build their own `Contract` from the same offer and
//! quantity. These properties check that every value entering the terms
//! digest, and every payout bucket, comes out identical.

use cfdx_types::*;
use chrono::{Duration, Utc};
use proptest::prelude::*;
use rust_decimal::Decimal;

fn offer(price: i64, leverage: u8, min: i64, max: i64) -> Offer {
    let now = Utc::now();
    let params = OfferParams {
        price: Price::new(Decimal::from(price)).unwrap(),
        min_quantity: Usd::new(Decimal::from(min)),
        max_quantity: Usd::new(Decimal::from(max)),
        leverage: Leverage::new(leverage).unwrap(),
        validity: Duration::seconds(60),
        settlement_time: now + Duration::hours(1),
        oracle_event_id: OracleEventId::btc_usd_at(now + Duration::hours(1)),
    };
    Offer::new(params, now).unwrap()
}

proptest! {
    /// Margins computed by maker and taker are bit-identical for every
    /// quantity in `[min, max]`.
    #[test]
    fn maker_and_taker_margins_identical(
        price in 1_000i64..200_000i64,
        leverage in 1u8..=100u8,
        quantity in 1_000i64..=50_000i64,
        cents in 0i64..100i64,
    ) {
        let offer = offer(price, leverage, 1_000, 50_001);
        let quantity = Usd::new(Decimal::new(quantity * 100 + cents, 2));
        let id = ContractId::new();
        let now = Utc::now();

        let maker = Contract::new(id, Role::Maker, &offer, quantity, PeerId([1; 32]), now).unwrap();
        let taker = Contract::new(id, Role::Taker, &offer, quantity, PeerId([2; 32]), now).unwrap();

        prop_assert_eq!(maker.long_margin, taker.long_margin);
        prop_assert_eq!(maker.short_margin, taker.short_margin);
        prop_assert_eq!(maker.liquidation_price, taker.liquidation_price);
        prop_assert_eq!(maker.terms_digest(), taker.terms_digest());
        prop_assert_eq!(maker.own_margin(), taker.counterparty_margin());
    }

    /// The long margin never exceeds the short margin and liquidation sits
    /// below the initial price.
    #[test]
    fn margins_are_ordered(
        price in 1_000i64..200_000i64,
        leverage in 1u8..=100u8,
        quantity in 1_000i64..=50_000i64,
    ) {
        let terms = Terms::new(
            Price::new(Decimal::from(price)).unwrap(),
            Leverage::new(leverage).unwrap(),
            Usd::new(Decimal::from(quantity)),
        );
        prop_assert!(terms.long_margin().unwrap() <= terms.short_margin().unwrap());
        prop_assert!(terms.liquidation_price().unwrap() < terms.initial_price);
    }

    /// Every payout on the curve splits exactly the pool.
    #[test]
    fn payouts_conserve_pool(
        price in 1_000i64..200_000i64,
        leverage in 1u8..=20u8,
        closing in 1i64..1_000_000i64,
    ) {
        let terms = Terms::new(
            Price::new(Decimal::from(price)).unwrap(),
            Leverage::new(leverage).unwrap(),
            Usd::new(Decimal::from(10_000)),
        );
        let payout = terms.payout_at(Price::new(Decimal::from(closing)).unwrap()).unwrap();
        prop_assert_eq!(payout.total(), terms.pool().unwrap());
    }
}
