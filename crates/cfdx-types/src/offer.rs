//! Offers published by the maker and order requests sent by takers.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    CfdError, ContractId, Leverage, OfferId, OracleEventId, Position, Price, Result, Terms, Usd,
    constants,
};

/// Parameters the maker chooses when publishing an offer.
#[derive(Debug, Clone)]
pub struct OfferParams {
    pub price: Price,
    pub min_quantity: Usd,
    pub max_quantity: Usd,
    pub leverage: Leverage,
    /// How long the offer can be taken after publication.
    pub validity: Duration,
    /// When contracts opened from this offer settle.
    pub settlement_time: DateTime<Utc>,
    /// Oracle event whose attestation settles those contracts.
    pub oracle_event_id: OracleEventId,
}

impl OfferParams {
    /// Params with default validity and settlement interval, settling on the
    /// BTC/USD event at the settlement time.
    #[must_use]
    pub fn with_defaults(price: Price, min_quantity: Usd, max_quantity: Usd, leverage: Leverage) -> Self {
        let settlement_time =
            Utc::now() + Duration::hours(constants::DEFAULT_SETTLEMENT_INTERVAL_HOURS);
        Self {
            price,
            min_quantity,
            max_quantity,
            leverage,
            validity: Duration::seconds(constants::DEFAULT_OFFER_VALIDITY_SECS),
            settlement_time,
            oracle_event_id: OracleEventId::btc_usd_at(settlement_time),
        }
    }
}

/// An immutable, published quote to enter a contract.
///
/// Republishing never mutates an offer; it mints a new one with a new id,
/// and requests against the superseded id are rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Offer {
    pub id: OfferId,
    pub trading_pair: String,
    /// Position the maker takes; takers get the opposite.
    pub position_maker: Position,
    pub price: Price,
    pub min_quantity: Usd,
    pub max_quantity: Usd,
    pub leverage: Leverage,
    /// Derived from `price` and `leverage`.
    pub liquidation_price: Price,
    pub created_at: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
    pub settlement_time: DateTime<Utc>,
    pub oracle_event_id: OracleEventId,
}

impl Offer {
    /// Build an offer from `params`, validating them.
    ///
    /// # Errors
    /// Returns `InvalidTerms` for an empty quantity range or a settlement
    /// time in the past.
    pub fn new(params: OfferParams, now: DateTime<Utc>) -> Result<Self> {
        if params.min_quantity <= Usd::ZERO || params.min_quantity > params.max_quantity {
            return Err(CfdError::InvalidTerms {
                reason: format!(
                    "quantity range [{}, {}] is empty",
                    params.min_quantity, params.max_quantity
                ),
            });
        }
        if params.settlement_time <= now {
            return Err(CfdError::InvalidTerms {
                reason: "settlement time must be in the future".into(),
            });
        }
        let liquidation_price =
            Terms::new(params.price, params.leverage, params.min_quantity).liquidation_price()?;
        Ok(Self {
            id: OfferId::new(),
            trading_pair: constants::DEFAULT_TRADING_PAIR.to_string(),
            position_maker: Position::Short,
            price: params.price,
            min_quantity: params.min_quantity,
            max_quantity: params.max_quantity,
            leverage: params.leverage,
            liquidation_price,
            created_at: now,
            valid_until: now + params.validity,
            settlement_time: params.settlement_time,
            oracle_event_id: params.oracle_event_id,
        })
    }

    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.valid_until
    }

    /// Terms a contract for `quantity` would have.
    #[must_use]
    pub fn terms(&self, quantity: Usd) -> Terms {
        Terms::new(self.price, self.leverage, quantity)
    }

    /// Check `request` against this offer.
    ///
    /// # Errors
    /// - `UnknownOffer` if the request references another offer
    /// - `OfferExpired` if the validity window has passed
    /// - `QuantityOutOfRange` if the quantity is outside `[min, max]`
    pub fn validate_request(&self, request: &OrderRequest, now: DateTime<Utc>) -> Result<()> {
        if request.offer_id != self.id {
            return Err(CfdError::UnknownOffer(request.offer_id));
        }
        if self.is_expired(now) {
            return Err(CfdError::OfferExpired(self.id));
        }
        if request.quantity < self.min_quantity || request.quantity > self.max_quantity {
            return Err(CfdError::QuantityOutOfRange {
                quantity: request.quantity,
                min: self.min_quantity,
                max: self.max_quantity,
            });
        }
        Ok(())
    }
}

/// A taker's request to enter a contract on an offer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRequest {
    /// Contract id proposed by the taker; bound by the maker on acceptance.
    pub contract_id: ContractId,
    pub offer_id: OfferId,
    pub quantity: Usd,
}

impl OrderRequest {
    #[must_use]
    pub fn new(offer_id: OfferId, quantity: Usd) -> Self {
        Self {
            contract_id: ContractId::new(),
            offer_id,
            quantity,
        }
    }
}

/// Dummy offers for testing. **Never use in production.**
#[cfg(any(test, feature = "test-helpers"))]
impl Offer {
    /// The reference offer: price 42000, quantity 1000..=50000, leverage 5.
    #[must_use]
    pub fn dummy() -> Self {
        use rust_decimal::Decimal;

        let now = Utc::now();
        let params = OfferParams {
            price: Price::new(Decimal::new(42_000, 0)).expect("positive price"),
            min_quantity: Usd::new(Decimal::new(1_000, 0)),
            max_quantity: Usd::new(Decimal::new(50_000, 0)),
            leverage: Leverage::new(5).expect("non-zero leverage"),
            validity: Duration::seconds(60),
            settlement_time: now + Duration::hours(24),
            oracle_event_id: OracleEventId::btc_usd_at(now + Duration::hours(24)),
        };
        Self::new(params, now).expect("dummy offer is valid")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn dummy_offer_has_derived_liquidation_price() {
        let offer = Offer::dummy();
        assert_eq!(offer.liquidation_price, Price::new(dec!(35000)).unwrap());
        assert_eq!(offer.position_maker, Position::Short);
        assert_eq!(offer.trading_pair, "BTC/USD");
    }

    #[test]
    fn request_within_range_is_valid() {
        let offer = Offer::dummy();
        let req = OrderRequest::new(offer.id, Usd::new(dec!(10000)));
        assert!(offer.validate_request(&req, Utc::now()).is_ok());
    }

    #[test]
    fn request_bounds_are_inclusive() {
        let offer = Offer::dummy();
        for q in [dec!(1000), dec!(50000)] {
            let req = OrderRequest::new(offer.id, Usd::new(q));
            assert!(offer.validate_request(&req, Utc::now()).is_ok(), "{q} rejected");
        }
    }

    #[test]
    fn request_out_of_range_is_rejected() {
        let offer = Offer::dummy();
        let req = OrderRequest::new(offer.id, Usd::new(dec!(999)));
        let err = offer.validate_request(&req, Utc::now()).unwrap_err();
        assert!(matches!(err, CfdError::QuantityOutOfRange { .. }));
    }

    #[test]
    fn request_against_superseded_offer_is_unknown() {
        let old = Offer::dummy();
        let current = Offer::dummy();
        let req = OrderRequest::new(old.id, Usd::new(dec!(10000)));
        let err = current.validate_request(&req, Utc::now()).unwrap_err();
        assert!(matches!(err, CfdError::UnknownOffer(id) if id == old.id));
    }

    #[test]
    fn expired_offer_rejects_requests() {
        let offer = Offer::dummy();
        let req = OrderRequest::new(offer.id, Usd::new(dec!(10000)));
        let later = offer.valid_until + Duration::seconds(1);
        let err = offer.validate_request(&req, later).unwrap_err();
        assert!(matches!(err, CfdError::OfferExpired(_)));
    }

    #[test]
    fn empty_quantity_range_is_invalid() {
        let mut params = OfferParams::with_defaults(
            Price::new(dec!(42000)).unwrap(),
            Usd::new(dec!(100)),
            Usd::new(dec!(10)),
            Leverage::new(2).unwrap(),
        );
        assert!(Offer::new(params.clone(), Utc::now()).is_err());
        params.max_quantity = Usd::new(dec!(1000));
        assert!(Offer::new(params, Utc::now()).is_ok());
    }
}
