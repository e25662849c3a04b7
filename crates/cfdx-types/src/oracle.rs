//! Oracle data: price quotes and signed attestations.
//!
//! A quote is the oracle's latest mark price and drives monitoring and PnL.
//! An attestation is the oracle's signed statement of the price at an
//! announced event; it selects the contract execution transaction at expiry.

use std::fmt;

use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::{CfdError, Price, Result};

/// Identifier of an announced oracle event, e.g. `btcusd-1700000000`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OracleEventId(pub String);

impl OracleEventId {
    /// Event id for the BTC/USD price at the given time.
    #[must_use]
    pub fn btc_usd_at(time: DateTime<Utc>) -> Self {
        Self(format!("btcusd-{}", time.timestamp()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OracleEventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Latest mark price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    pub price: Price,
    pub timestamp: DateTime<Utc>,
}

impl Quote {
    #[must_use]
    pub fn new(price: Price) -> Self {
        Self {
            price,
            timestamp: Utc::now(),
        }
    }
}

/// An oracle's signed price for an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OracleAttestation {
    pub event_id: OracleEventId,
    pub price: Price,
    pub timestamp: DateTime<Utc>,
    pub signature: Signature,
}

impl OracleAttestation {
    /// Canonical signing payload.
    ///
    /// Format: `"cfdx:attestation:v1:" || event_id || price || timestamp`
    #[must_use]
    pub fn signing_payload(event_id: &OracleEventId, price: Price, timestamp: DateTime<Utc>) -> Vec<u8> {
        let mut payload = Vec::with_capacity(96);
        payload.extend_from_slice(b"cfdx:attestation:v1:");
        payload.extend_from_slice(event_id.as_str().as_bytes());
        payload.push(0);
        payload.extend_from_slice(price.to_string().as_bytes());
        payload.push(0);
        payload.extend_from_slice(&timestamp.timestamp_millis().to_le_bytes());
        payload
    }

    /// Produce an attestation signed with the oracle's key.
    #[must_use]
    pub fn attest(
        key: &SigningKey,
        event_id: OracleEventId,
        price: Price,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let signature = key.sign(&Self::signing_payload(&event_id, price, timestamp));
        Self {
            event_id,
            price,
            timestamp,
            signature,
        }
    }

    /// # Errors
    /// Returns `AttestationInvalid` if the signature does not verify under `oracle`.
    pub fn verify(&self, oracle: &VerifyingKey) -> Result<()> {
        let payload = Self::signing_payload(&self.event_id, self.price, self.timestamp);
        oracle
            .verify(&payload, &self.signature)
            .map_err(|_| CfdError::AttestationInvalid {
                reason: format!("bad signature for event {}", self.event_id),
            })
    }
}
