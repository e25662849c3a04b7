//! Discreet log contract terms.
//!
//! The price axis is cut into payout buckets. Each bucket gets one contract
//! execution transaction (CET) spending the joint funding output according
//! to the payout at that bucket, bound to an adaptor point derived from the
//! oracle event and the bucket's range. An oracle attestation for a price
//! falls into exactly one bucket and so selects exactly one CET.
//!
//! ```text
//!   bucket 0          buckets 1..n-2 (equal width)        bucket n-1
//!  [0, liq]  | (liq, ..] (..] (..] ... (.., 2·initial] | (2·initial, ∞)
//!   long = 0 |            payout curve                  | long = payout at cap
//! ```
//!
//! Both peers build the [`DlcTemplate`] locally from the same inputs and then
//! exchange signatures over it; nothing but signatures and party parameters
//! crosses the wire.

use ed25519_dalek::{Signature, SigningKey, VerifyingKey};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    Amount, CfdError, OracleEventId, OutPoint, Payout, Price, Result, Terms, Transaction, TxOut,
    Utxo, tx,
};

// ---------------------------------------------------------------------------
// Payout curve
// ---------------------------------------------------------------------------

/// A closed price range `[start, end]` in whole dollars and its payout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutBucket {
    pub start: u64,
    pub end: u64,
    pub payout: Payout,
}

impl PayoutBucket {
    #[must_use]
    pub fn contains(&self, price: Price) -> bool {
        let dollars = price_to_dollars(price);
        self.start <= dollars && dollars <= self.end
    }

    /// A price this bucket settles at: `hint` if it falls inside, otherwise
    /// the liquidation price for the first bucket and the lower edge for the rest.
    ///
    /// # Errors
    /// Returns `InvalidPrice` for a bucket that only covers zero.
    pub fn settlement_price(&self, hint: Option<Price>) -> Result<Price> {
        match hint {
            Some(price) if self.contains(price) => Ok(price),
            _ if self.start == 0 => price_at(self.end),
            _ => price_at(self.start),
        }
    }
}

fn price_to_dollars(price: Price) -> u64 {
    price.into_decimal().trunc().to_u64().unwrap_or(u64::MAX)
}

fn price_at(dollars: u64) -> Result<Price> {
    Price::new(Decimal::from(dollars))
}

/// Cut the price axis into `n_payouts` buckets for `terms`.
///
/// # Errors
/// Returns `InvalidTerms` if fewer than three buckets are requested.
pub fn payout_curve(terms: &Terms, n_payouts: usize) -> Result<Vec<PayoutBucket>> {
    if n_payouts < 3 {
        return Err(CfdError::InvalidTerms {
            reason: format!("need at least 3 payout buckets, got {n_payouts}"),
        });
    }
    let pool = terms.pool()?;
    let liquidation = price_to_dollars(terms.liquidation_price()?);
    let cap = (terms.initial_price.into_decimal() * Decimal::TWO)
        .ceil()
        .to_u64()
        .unwrap_or(u64::MAX - 1)
        .max(liquidation + 1);

    let mut buckets = Vec::with_capacity(n_payouts);
    buckets.push(PayoutBucket {
        start: 0,
        end: liquidation,
        payout: Payout {
            long: Amount::ZERO,
            short: pool,
        },
    });

    let lo = liquidation + 1;
    let middle = (n_payouts - 2) as u64;
    let width = (cap - lo + 1).div_ceil(middle).max(1);
    let mut start = lo;
    while start <= cap {
        let end = start.saturating_add(width - 1).min(cap);
        let mid = start + (end - start) / 2;
        buckets.push(PayoutBucket {
            start,
            end,
            payout: terms.payout_at(price_at(mid)?)?,
        });
        start = end + 1;
    }

    buckets.push(PayoutBucket {
        start: cap + 1,
        end: u64::MAX,
        payout: terms.payout_at(price_at(cap + 1)?)?,
    });
    Ok(buckets)
}

/// Adaptor point binding a CET to the oracle outcome range it settles.
#[must_use]
pub fn adaptor_point(event: &OracleEventId, bucket: &PayoutBucket) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"cfdx:adaptor:v1:");
    hasher.update(event.as_str().as_bytes());
    hasher.update(bucket.start.to_le_bytes());
    hasher.update(bucket.end.to_le_bytes());
    hasher.finalize().into()
}

// ---------------------------------------------------------------------------
// Party parameters
// ---------------------------------------------------------------------------

/// What one party contributes to the setup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartyParams {
    /// Key the party signs CETs and the funding transaction with.
    pub identity: VerifyingKey,
    /// Outputs the party spends into the funding transaction.
    pub inputs: Vec<Utxo>,
    /// Change returned to the party, if any.
    pub change: Option<TxOut>,
    pub payout_address: String,
    pub margin: Amount,
}

impl PartyParams {
    #[must_use]
    pub fn input_total(&self) -> Amount {
        self.inputs.iter().map(|u| u.value).sum()
    }

    /// Inputs must cover margin plus declared change.
    ///
    /// # Errors
    /// Returns `ProtocolViolation` when they don't.
    pub fn check_balance(&self) -> Result<()> {
        let change = self.change.as_ref().map_or(Amount::ZERO, |c| c.value);
        let needed = self
            .margin
            .checked_add(change)
            .ok_or_else(|| CfdError::ProtocolViolation {
                reason: "margin plus change overflows".into(),
            })?;
        if self.input_total() < needed {
            return Err(CfdError::ProtocolViolation {
                reason: format!(
                    "inputs {} do not cover margin {} plus change {change}",
                    self.input_total(),
                    self.margin
                ),
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Template and signed DLC
// ---------------------------------------------------------------------------

/// A contract execution transaction for one payout bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cet {
    pub bucket: PayoutBucket,
    pub adaptor_point: [u8; 32],
    pub tx: Transaction,
}

/// The unsigned transaction set both parties derive identically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DlcTemplate {
    pub maker: PartyParams,
    pub taker: PartyParams,
    pub funding: Transaction,
    pub cets: Vec<Cet>,
}

impl DlcTemplate {
    /// Build the funding transaction and one CET per payout bucket.
    ///
    /// The taker is long, so CET long payouts go to the taker's payout address.
    ///
    /// # Errors
    /// Propagates curve errors and `ProtocolViolation` for unbalanced params.
    pub fn build(
        terms: &Terms,
        event: &OracleEventId,
        maker: PartyParams,
        taker: PartyParams,
        n_payouts: usize,
    ) -> Result<Self> {
        maker.check_balance()?;
        taker.check_balance()?;

        let joint_value = maker
            .margin
            .checked_add(taker.margin)
            .ok_or_else(|| CfdError::InvalidTerms {
                reason: "joint output overflows".into(),
            })?;
        let mut outputs = vec![TxOut {
            address: joint_address(&maker.identity, &taker.identity),
            value: joint_value,
        }];
        outputs.extend(maker.change.iter().cloned());
        outputs.extend(taker.change.iter().cloned());
        let funding = Transaction {
            inputs: maker
                .inputs
                .iter()
                .chain(taker.inputs.iter())
                .map(|u| u.outpoint)
                .collect(),
            outputs,
        };
        let funding_outpoint = OutPoint::new(funding.txid(), 0);

        let cets = payout_curve(terms, n_payouts)?
            .into_iter()
            .map(|bucket| Cet {
                adaptor_point: adaptor_point(event, &bucket),
                tx: payout_tx(
                    funding_outpoint,
                    &bucket.payout,
                    &taker.payout_address,
                    &maker.payout_address,
                ),
                bucket,
            })
            .collect();

        Ok(Self {
            maker,
            taker,
            funding,
            cets,
        })
    }

    #[must_use]
    pub fn funding_outpoint(&self) -> OutPoint {
        OutPoint::new(self.funding.txid(), 0)
    }

    /// Index of the CET whose bucket contains `price`.
    #[must_use]
    pub fn cet_index_for(&self, price: Price) -> Option<usize> {
        self.cets.iter().position(|c| c.bucket.contains(price))
    }

    /// Sign every CET, in order.
    #[must_use]
    pub fn sign_cets(&self, key: &SigningKey) -> Vec<Signature> {
        self.cets
            .iter()
            .map(|c| c.tx.sign(key, tx::CET_TAG, &c.adaptor_point))
            .collect()
    }

    /// Verify a full set of CET signatures from `signer`.
    ///
    /// # Errors
    /// `ProtocolViolation` on count mismatch, `SignatureInvalid` on a bad signature.
    pub fn verify_cets(&self, signer: &VerifyingKey, sigs: &[Signature]) -> Result<()> {
        if sigs.len() != self.cets.len() {
            return Err(CfdError::ProtocolViolation {
                reason: format!("expected {} CET signatures, got {}", self.cets.len(), sigs.len()),
            });
        }
        for (i, (cet, sig)) in self.cets.iter().zip(sigs).enumerate() {
            cet.tx
                .verify(signer, tx::CET_TAG, &cet.adaptor_point, sig, &format!("CET {i}"))?;
        }
        Ok(())
    }

    #[must_use]
    pub fn sign_funding(&self, key: &SigningKey) -> Signature {
        self.funding.sign(key, tx::FUNDING_TAG, &[])
    }

    /// # Errors
    /// Returns `SignatureInvalid` if `sig` is not `signer`'s funding signature.
    pub fn verify_funding(&self, signer: &VerifyingKey, sig: &Signature) -> Result<()> {
        self.funding
            .verify(signer, tx::FUNDING_TAG, &[], sig, "funding transaction")
    }

    /// A collaborative close transaction paying out `payout` directly.
    #[must_use]
    pub fn close_tx(&self, payout: &Payout) -> Transaction {
        payout_tx(
            self.funding_outpoint(),
            payout,
            &self.taker.payout_address,
            &self.maker.payout_address,
        )
    }
}

/// A transaction spending the funding output that this DLC accounts for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FundingSpend {
    /// One of the CETs.
    Cet(PayoutBucket),
    /// A direct payout, as a collaborative close builds.
    Close(Payout),
}

impl DlcTemplate {
    /// Identify `tx` as one of our CETs or as a close paying both parties.
    ///
    /// Returns `None` for anything else, including a close that pays a
    /// third address.
    #[must_use]
    pub fn recognise_spend(&self, tx: &Transaction) -> Option<FundingSpend> {
        if tx.inputs != [self.funding_outpoint()] {
            return None;
        }
        if let Some(cet) = self.cets.iter().find(|c| c.tx == *tx) {
            return Some(FundingSpend::Cet(cet.bucket));
        }
        let mut payout = Payout {
            long: Amount::ZERO,
            short: Amount::ZERO,
        };
        for out in &tx.outputs {
            let side = if out.address == self.taker.payout_address {
                &mut payout.long
            } else if out.address == self.maker.payout_address {
                &mut payout.short
            } else {
                return None;
            };
            *side = side.checked_add(out.value)?;
        }
        (self.close_tx(&payout) == *tx).then_some(FundingSpend::Close(payout))
    }
}

/// A fully signed DLC: the template plus both parties' signatures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dlc {
    pub template: DlcTemplate,
    pub maker_cet_sigs: Vec<Signature>,
    pub taker_cet_sigs: Vec<Signature>,
    pub maker_funding_sig: Signature,
    pub taker_funding_sig: Signature,
}

impl Dlc {
    #[must_use]
    pub fn funding_txid(&self) -> crate::Txid {
        self.template.funding.txid()
    }

    #[must_use]
    pub fn signed_funding(&self) -> tx::SignedTransaction {
        tx::SignedTransaction {
            tx: self.template.funding.clone(),
            signatures: vec![
                (self.template.maker.identity, self.maker_funding_sig),
                (self.template.taker.identity, self.taker_funding_sig),
            ],
        }
    }

    /// The CET for `price` with both parties' signatures.
    #[must_use]
    pub fn signed_cet_for(&self, price: Price) -> Option<(PayoutBucket, tx::SignedTransaction)> {
        let idx = self.template.cet_index_for(price)?;
        let cet = &self.template.cets[idx];
        Some((
            cet.bucket,
            tx::SignedTransaction {
                tx: cet.tx.clone(),
                signatures: vec![
                    (self.template.maker.identity, self.maker_cet_sigs[idx]),
                    (self.template.taker.identity, self.taker_cet_sigs[idx]),
                ],
            },
        ))
    }
}

fn joint_address(maker: &VerifyingKey, taker: &VerifyingKey) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"cfdx:joint:v1:");
    hasher.update(maker.as_bytes());
    hasher.update(taker.as_bytes());
    format!("dlc1{}", hex::encode(hasher.finalize()))
}

fn payout_tx(funding: OutPoint, payout: &Payout, long_address: &str, short_address: &str) -> Transaction {
    let outputs = [(long_address, payout.long), (short_address, payout.short)]
        .into_iter()
        .filter(|(_, value)| *value > Amount::ZERO)
        .map(|(address, value)| TxOut {
            address: address.to_string(),
            value,
        })
        .collect();
    Transaction {
        inputs: vec![funding],
        outputs,
    }
}

/// Dummy DLC material for testing. **Never use in production.**
#[cfg(any(test, feature = "test-helpers"))]
pub mod dummy {
    use super::*;
    use crate::Txid;

    /// Party params funding `margin` from a single made-up output.
    #[must_use]
    pub fn party(key: &SigningKey, margin: Amount, tag: u8) -> PartyParams {
        PartyParams {
            identity: key.verifying_key(),
            inputs: vec![Utxo {
                outpoint: OutPoint::new(Txid([tag; 32]), 0),
                value: Amount::from_sat(margin.to_sat() + 10_000),
            }],
            change: Some(TxOut {
                address: format!("change-{tag}"),
                value: Amount::from_sat(10_000),
            }),
            payout_address: format!("payout-{tag}"),
            margin,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Leverage, Usd};
    use rust_decimal_macros::dec;

    fn terms() -> Terms {
        Terms::new(
            Price::new(dec!(42000)).unwrap(),
            Leverage::new(5).unwrap(),
            Usd::new(dec!(10000)),
        )
    }

    fn template() -> (DlcTemplate, SigningKey, SigningKey) {
        let t = terms();
        let maker_key = SigningKey::from_bytes(&[1; 32]);
        let taker_key = SigningKey::from_bytes(&[2; 32]);
        let maker = dummy::party(&maker_key, t.short_margin().unwrap(), 1);
        let taker = dummy::party(&taker_key, t.long_margin().unwrap(), 2);
        let tpl = DlcTemplate::build(&t, &OracleEventId("btcusd-1".into()), maker, taker, 20)
            .unwrap();
        (tpl, maker_key, taker_key)
    }

    #[test]
    fn curve_covers_whole_price_axis() {
        let buckets = payout_curve(&terms(), 20).unwrap();
        assert_eq!(buckets[0].start, 0);
        assert_eq!(buckets.last().unwrap().end, u64::MAX);
        for pair in buckets.windows(2) {
            assert_eq!(pair[0].end + 1, pair[1].start, "gap or overlap in curve");
        }
        assert!(buckets.len() <= 20);
    }

    #[test]
    fn every_bucket_conserves_pool() {
        let t = terms();
        let pool = t.pool().unwrap();
        for b in payout_curve(&t, 50).unwrap() {
            assert_eq!(b.payout.total(), pool);
        }
    }

    #[test]
    fn first_bucket_liquidates_long() {
        let buckets = payout_curve(&terms(), 10).unwrap();
        assert_eq!(buckets[0].end, 35000);
        assert_eq!(buckets[0].payout.long, Amount::ZERO);
        assert!(buckets[0].contains(Price::new(dec!(34000)).unwrap()));
    }

    #[test]
    fn too_few_buckets_rejected() {
        assert!(payout_curve(&terms(), 2).is_err());
    }

    #[test]
    fn exactly_one_cet_per_price() {
        let (tpl, _, _) = template();
        for p in [dec!(1), dec!(35000), dec!(35001), dec!(42000), dec!(84001), dec!(1000000)] {
            let price = Price::new(p).unwrap();
            let hits = tpl.cets.iter().filter(|c| c.bucket.contains(price)).count();
            assert_eq!(hits, 1, "price {p} hit {hits} buckets");
        }
    }

    #[test]
    fn both_peers_build_identical_templates() {
        let (a, _, _) = template();
        let (b, _, _) = template();
        assert_eq!(a, b);
        assert_eq!(a.funding.txid(), b.funding.txid());
    }

    #[test]
    fn funding_locks_both_margins() {
        let (tpl, _, _) = template();
        let t = terms();
        assert_eq!(tpl.funding.outputs[0].value, t.pool().unwrap());
        assert_eq!(tpl.funding.inputs.len(), 2);
    }

    #[test]
    fn cet_signatures_verify_and_detect_tampering() {
        let (tpl, maker_key, taker_key) = template();
        let sigs = tpl.sign_cets(&maker_key);
        assert!(tpl.verify_cets(&maker_key.verifying_key(), &sigs).is_ok());
        assert!(tpl.verify_cets(&taker_key.verifying_key(), &sigs).is_err());
        assert!(tpl.verify_cets(&maker_key.verifying_key(), &sigs[1..]).is_err());
    }

    #[test]
    fn spends_of_the_funding_output_are_recognised() {
        let (tpl, _, _) = template();
        let liquidated = &tpl.cets[0];
        assert_eq!(
            tpl.recognise_spend(&liquidated.tx),
            Some(FundingSpend::Cet(liquidated.bucket))
        );

        let payout = Payout {
            long: Amount::from_sat(123_456),
            short: terms().pool().unwrap().checked_sub(Amount::from_sat(123_456)).unwrap(),
        };
        assert_eq!(
            tpl.recognise_spend(&tpl.close_tx(&payout)),
            Some(FundingSpend::Close(payout))
        );

        let mut theft = tpl.close_tx(&payout);
        theft.outputs[0].address = "elsewhere".into();
        assert_eq!(tpl.recognise_spend(&theft), None);
        assert_eq!(tpl.recognise_spend(&tpl.funding), None);
    }

    #[test]
    fn settlement_price_prefers_a_hint_inside_the_bucket() {
        let buckets = payout_curve(&terms(), 10).unwrap();
        let inside = Price::new(dec!(40000)).unwrap();
        let middle = buckets.iter().find(|b| b.contains(inside)).unwrap();
        assert_eq!(middle.settlement_price(Some(inside)).unwrap(), inside);
        assert_eq!(
            middle.settlement_price(None).unwrap(),
            Price::new(Decimal::from(middle.start)).unwrap()
        );
        assert_eq!(
            buckets[0].settlement_price(Some(inside)).unwrap(),
            Price::new(dec!(35000)).unwrap()
        );
    }

    #[test]
    fn underfunded_party_rejected() {
        let t = terms();
        let key = SigningKey::from_bytes(&[1; 32]);
        let mut maker = dummy::party(&key, t.short_margin().unwrap(), 1);
        maker.inputs[0].value = Amount::from_sat(1);
        let taker = dummy::party(&SigningKey::from_bytes(&[2; 32]), t.long_margin().unwrap(), 2);
        let err = DlcTemplate::build(&t, &OracleEventId("e".into()), maker, taker, 10).unwrap_err();
        assert!(matches!(err, CfdError::ProtocolViolation { .. }));
    }
}
