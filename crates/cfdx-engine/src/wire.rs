//! Messages exchanged between maker and taker over the encrypted channel.
//!
//! Every message is one JSON-encoded [`PeerMessage`] inside one Noise frame.
//!
//! ```text
//!   taker                                   maker
//!     │ ─────────── Hello{version} ───────────▶ │
//!     │ ◀────────── Hello{version} ──────────── │
//!     │ ◀────────── CurrentOffer ────────────── │  on connect and on every republish
//!     │ ─────────── TakeOffer ────────────────▶ │
//!     │ ◀────────── Accept | Reject ─────────── │
//!     │ ◀──────────▶ Setup(Params) ◀──────────▶ │  three rounds, both directions
//!     │ ◀──────────▶ Setup(CetSignatures) ◀───▶ │
//!     │ ◀──────────▶ Setup(FundingSignature) ─▶ │
//!     │        ... contract open ...            │
//!     │ ─── Settlement(Propose) ──────────────▶ │  either side may propose
//!     │ ◀── Settlement(Accept | Reject) ─────── │
//!     │ ─── Rollover(Propose) ────────────────▶ │  taker only, before expiry
//!     │ ◀── Rollover(Accept | Reject) ───────── │
//! ```

use std::fmt;

use cfdx_types::{ContractId, Offer, OracleEventId, OrderRequest, PartyParams, Payout, Price};
use chrono::{DateTime, Utc};
use ed25519_dalek::Signature;
use serde::{Deserialize, Serialize};

/// One of the three setup rounds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SetupMsg {
    /// Round 1: what we fund the contract with, bound to the terms digest.
    Params {
        terms_digest: [u8; 32],
        params: PartyParams,
    },
    /// Round 2: our signature over every CET, in bucket order.
    CetSignatures(Vec<Signature>),
    /// Round 3: our signature over the funding transaction.
    FundingSignature(Signature),
}

impl SetupMsg {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Params { .. } => "Params",
            Self::CetSignatures(_) => "CetSignatures",
            Self::FundingSignature(_) => "FundingSignature",
        }
    }
}

/// Collaborative close negotiation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SettlementMsg {
    /// Close at `price`; `sig` signs the close transaction paying `payout`.
    Propose {
        price: Price,
        payout: Payout,
        sig: Signature,
    },
    /// Counter-signature over the proposed close transaction.
    Accept { sig: Signature },
    Reject { reason: String },
}

impl SettlementMsg {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Propose { .. } => "Propose",
            Self::Accept { .. } => "Accept",
            Self::Reject { .. } => "Reject",
        }
    }
}

/// Moving an open contract to a later settlement event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RolloverMsg {
    /// Re-sign every CET against `oracle_event_id`; `sigs` are the taker's.
    Propose {
        settlement_time: DateTime<Utc>,
        oracle_event_id: OracleEventId,
        sigs: Vec<Signature>,
    },
    /// The maker's signatures over the re-signed CETs.
    Accept { sigs: Vec<Signature> },
    Reject { reason: String },
}

impl RolloverMsg {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Propose { .. } => "RolloverPropose",
            Self::Accept { .. } => "RolloverAccept",
            Self::Reject { .. } => "RolloverReject",
        }
    }
}

/// Every message on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerMessage {
    Hello {
        version: u16,
    },
    /// The maker's current offer, `None` once withdrawn.
    CurrentOffer(Option<Offer>),
    TakeOffer(OrderRequest),
    Accept {
        contract_id: ContractId,
    },
    Reject {
        contract_id: ContractId,
        reason: String,
    },
    Setup {
        contract_id: ContractId,
        msg: SetupMsg,
    },
    Settlement {
        contract_id: ContractId,
        msg: SettlementMsg,
    },
    Rollover {
        contract_id: ContractId,
        msg: RolloverMsg,
    },
    /// The sender gave up on the contract's setup.
    Abort {
        contract_id: ContractId,
        reason: String,
    },
    Heartbeat,
    /// Orderly close; the sender drops the connection next.
    Disconnect,
}

impl PeerMessage {
    /// The contract a message is addressed to, if any.
    #[must_use]
    pub fn contract_id(&self) -> Option<ContractId> {
        match self {
            Self::TakeOffer(request) => Some(request.contract_id),
            Self::Accept { contract_id }
            | Self::Reject { contract_id, .. }
            | Self::Setup { contract_id, .. }
            | Self::Settlement { contract_id, .. }
            | Self::Rollover { contract_id, .. }
            | Self::Abort { contract_id, .. } => Some(*contract_id),
            Self::Hello { .. } | Self::CurrentOffer(_) | Self::Heartbeat | Self::Disconnect => None,
        }
    }

    /// Variant name for logs, without payload.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "Hello",
            Self::CurrentOffer(_) => "CurrentOffer",
            Self::TakeOffer(_) => "TakeOffer",
            Self::Accept { .. } => "Accept",
            Self::Reject { .. } => "Reject",
            Self::Setup { msg, .. } => msg.name(),
            Self::Settlement { msg, .. } => msg.name(),
            Self::Rollover { msg, .. } => msg.name(),
            Self::Abort { .. } => "Abort",
            Self::Heartbeat => "Heartbeat",
            Self::Disconnect => "Disconnect",
        }
    }
}

impl fmt::Display for PeerMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.contract_id() {
            Some(id) => write!(f, "{}({id})", self.name()),
            None => f.write_str(self.name()),
        }
    }
}
