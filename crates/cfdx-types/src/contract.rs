//! # Contract: the CFD and its lifecycle
//!
//! A [`Contract`] holds the immutable economic terms agreed from an offer
//! plus the current [`ContractState`]. The state moves along a fixed DAG:
//!
//! ```text
//!   ┌───────────┐   ┌──────────┐   ┌───────────────────┐   ┌──────┐
//!   │ REQUESTED ├──▶│ ACCEPTED ├──▶│ SETUP_IN_PROGRESS ├──▶│ OPEN │
//!   └─────┬─────┘   └──────────┘   └───────────────────┘   └──┬───┘
//!         │ invalid terms / no funds                          │ collaborative
//!         ▼                                                   │ unilateral
//!   ┌──────────┐                                              │ oracle-attested
//!   │ REJECTED │                                              ▼
//!   └──────────┘                                   ┌───────────────┐   ┌────────┐
//!                                                  │ PENDING_CLOSE ├──▶│ CLOSED │
//!   any non-terminal state ──▶ FAILED              └───────────────┘   └────────┘
//! ```
//!
//! No edge leads backwards. `CLOSED`, `REJECTED` and `FAILED` are terminal.
//!
//! Every transition is recorded in the persistence log with the next
//! per-contract sequence number; [`Contract::apply`] replays such a record
//! and silently skips sequences it has already seen.
//!
//! A [`Rollover`] is the one change that keeps an `OPEN` contract open: it
//! swaps in a DLC re-signed against a later oracle event and pushes the
//! expiry out. It takes a sequence number like any transition.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    Amount, CfdError, ContractId, Dlc, Leverage, OfferId, Offer, OracleEventId, Payout, PeerId,
    Position, Price, Result, Role, SignedTransaction, Terms, Txid, Usd,
};

// ---------------------------------------------------------------------------
// Phases with deadlines
// ---------------------------------------------------------------------------

/// A negotiation or close phase that carries a deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    /// Taker waiting for the maker's accept or reject.
    Negotiation,
    /// Waiting for the peer's setup parameters.
    SetupParams,
    /// Waiting for the peer's CET signatures.
    SetupSignatures,
    /// Waiting for the peer's funding signature.
    SetupFunding,
    /// Waiting for the counter-signature on a close proposal.
    CollaborativeClose,
    /// Waiting for the maker's signatures on a rolled-over DLC.
    Rollover,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Negotiation => write!(f, "NEGOTIATION"),
            Self::SetupParams => write!(f, "SETUP_PARAMS"),
            Self::SetupSignatures => write!(f, "SETUP_SIGNATURES"),
            Self::SetupFunding => write!(f, "SETUP_FUNDING"),
            Self::CollaborativeClose => write!(f, "COLLABORATIVE_CLOSE"),
            Self::Rollover => write!(f, "ROLLOVER"),
        }
    }
}

// ---------------------------------------------------------------------------
// Close paths and outcomes
// ---------------------------------------------------------------------------

/// How an open contract reached its closing transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClosePath {
    Collaborative,
    Unilateral,
    OracleAttested,
}

impl fmt::Display for ClosePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Collaborative => write!(f, "COLLABORATIVE"),
            Self::Unilateral => write!(f, "UNILATERAL"),
            Self::OracleAttested => write!(f, "ORACLE_ATTESTED"),
        }
    }
}

/// A closing transaction ready for broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClosingTx {
    pub path: ClosePath,
    /// Price the payout was derived from.
    pub price: Price,
    pub payout: Payout,
    pub tx: SignedTransaction,
}

impl ClosingTx {
    #[must_use]
    pub fn outcome(&self) -> CloseOutcome {
        CloseOutcome {
            path: self.path,
            price: self.price,
            payout: self.payout,
            liquidated: self.payout.long == Amount::ZERO,
            closing_txid: self.tx.txid(),
        }
    }
}

/// Final settlement of a contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseOutcome {
    pub path: ClosePath,
    pub price: Price,
    pub payout: Payout,
    /// The long side's margin was exhausted.
    pub liquidated: bool,
    pub closing_txid: Txid,
}

impl fmt::Display for CloseOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.liquidated {
            write!(f, "LIQUIDATED")
        } else {
            write!(f, "{}", self.path)
        }
    }
}

// ---------------------------------------------------------------------------
// Failure reasons
// ---------------------------------------------------------------------------

/// Why a contract ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    /// The peer sent something malformed, out of order or inconsistent.
    ProtocolViolation(String),
    /// A phase deadline elapsed.
    Timeout(Phase),
    /// The connection dropped before the contract was open.
    PeerDisconnected,
    /// The peer aborted the setup.
    PeerAborted(String),
    /// A transaction could not be broadcast. Funds need manual recovery.
    BroadcastFailed { txid: Txid, reason: String },
    /// The daemon restarted while the contract was in a state that cannot resume.
    Interrupted { state: String },
}

impl FailureReason {
    #[must_use]
    pub fn requires_manual_recovery(&self) -> bool {
        matches!(self, Self::BroadcastFailed { .. })
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProtocolViolation(r) => write!(f, "protocol violation: {r}"),
            Self::Timeout(phase) => write!(f, "timed out during {phase}"),
            Self::PeerDisconnected => write!(f, "peer disconnected"),
            Self::PeerAborted(r) => write!(f, "peer aborted: {r}"),
            Self::BroadcastFailed { txid, reason } => {
                write!(f, "broadcast of {txid} failed: {reason}")
            }
            Self::Interrupted { state } => write!(f, "interrupted in {state}"),
        }
    }
}

// ---------------------------------------------------------------------------
// ContractState
// ---------------------------------------------------------------------------

/// Lifecycle state of a contract. See the module docs for the graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContractState {
    Requested,
    Accepted,
    SetupInProgress,
    /// Funded. Carries the signed DLC needed for any later close.
    Open { dlc: Box<Dlc> },
    PendingClose { closing: Box<ClosingTx> },
    Closed { outcome: CloseOutcome },
    Rejected { reason: String },
    Failed { reason: FailureReason },
}

impl ContractState {
    /// Can this state transition to `target`?
    #[must_use]
    pub fn can_transition_to(&self, target: &Self) -> bool {
        match (self, target) {
            (_, Self::Failed { .. }) => !self.is_terminal(),
            (Self::Requested, Self::Accepted | Self::Rejected { .. })
            | (Self::Accepted, Self::SetupInProgress)
            | (Self::SetupInProgress, Self::Open { .. })
            | (Self::Open { .. }, Self::PendingClose { .. })
            | (Self::PendingClose { .. }, Self::Closed { .. }) => true,
            _ => false,
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Closed { .. } | Self::Rejected { .. } | Self::Failed { .. }
        )
    }

    /// Negotiation states that cannot survive a restart.
    #[must_use]
    pub fn is_setup_phase(&self) -> bool {
        matches!(self, Self::Requested | Self::Accepted | Self::SetupInProgress)
    }

    /// Short uppercase label without payload, e.g. `PENDING_CLOSE`.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Requested => "REQUESTED",
            Self::Accepted => "ACCEPTED",
            Self::SetupInProgress => "SETUP_IN_PROGRESS",
            Self::Open { .. } => "OPEN",
            Self::PendingClose { .. } => "PENDING_CLOSE",
            Self::Closed { .. } => "CLOSED",
            Self::Rejected { .. } => "REJECTED",
            Self::Failed { .. } => "FAILED",
        }
    }
}

impl fmt::Display for ContractState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PendingClose { closing } => write!(f, "PENDING_CLOSE({})", closing.path),
            Self::Closed { outcome } => write!(f, "CLOSED({outcome})"),
            other => write!(f, "{}", other.label()),
        }
    }
}

/// An open contract re-signed against a later settlement event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rollover {
    pub expiry: DateTime<Utc>,
    pub oracle_event_id: OracleEventId,
    /// Same funding output, CETs bound to `oracle_event_id`.
    pub dlc: Box<Dlc>,
}

// ---------------------------------------------------------------------------
// Contract
// ---------------------------------------------------------------------------

/// A contract-for-difference between the local daemon and one counterparty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contract {
    pub id: ContractId,
    pub role: Role,
    pub offer_id: OfferId,
    pub counterparty: PeerId,
    pub initial_price: Price,
    pub leverage: Leverage,
    /// Quantity in quote units.
    pub quantity: Usd,
    /// Quantity in collateral units at the initial price.
    pub quantity_btc: Amount,
    pub long_margin: Amount,
    pub short_margin: Amount,
    pub liquidation_price: Price,
    pub oracle_event_id: OracleEventId,
    pub created_at: DateTime<Utc>,
    pub expiry: DateTime<Utc>,
    pub state: ContractState,
    /// Sequence number of the last applied log entry. Creation is entry 1.
    pub version: u64,
    pub funding_txid: Option<Txid>,
    pub closing_txid: Option<Txid>,
}

impl Contract {
    /// A new contract in `Requested` for `quantity` on `offer`.
    ///
    /// # Errors
    /// Propagates margin computation errors.
    pub fn new(
        id: ContractId,
        role: Role,
        offer: &Offer,
        quantity: Usd,
        counterparty: PeerId,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let terms = offer.terms(quantity);
        Ok(Self {
            id,
            role,
            offer_id: offer.id,
            counterparty,
            initial_price: offer.price,
            leverage: offer.leverage,
            quantity,
            quantity_btc: terms.short_margin()?,
            long_margin: terms.long_margin()?,
            short_margin: terms.short_margin()?,
            liquidation_price: terms.liquidation_price()?,
            oracle_event_id: offer.oracle_event_id.clone(),
            created_at: now,
            expiry: offer.settlement_time,
            state: ContractState::Requested,
            version: 1,
            funding_txid: None,
            closing_txid: None,
        })
    }

    #[must_use]
    pub fn terms(&self) -> Terms {
        Terms::new(self.initial_price, self.leverage, self.quantity)
    }

    #[must_use]
    pub fn position(&self) -> Position {
        self.role.position()
    }

    #[must_use]
    pub fn margin_of(&self, position: Position) -> Amount {
        match position {
            Position::Long => self.long_margin,
            Position::Short => self.short_margin,
        }
    }

    #[must_use]
    pub fn own_margin(&self) -> Amount {
        self.margin_of(self.position())
    }

    #[must_use]
    pub fn counterparty_margin(&self) -> Amount {
        self.margin_of(self.position().counter())
    }

    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expiry
    }

    /// The signed DLC, while the contract is open.
    #[must_use]
    pub fn dlc(&self) -> Option<&Dlc> {
        match &self.state {
            ContractState::Open { dlc } => Some(dlc),
            _ => None,
        }
    }

    /// Digest over every value both peers must agree on before signing.
    ///
    /// Format: `"cfdx:terms:v1:" || id || offer_id || price || leverage ||
    /// quantity || long_margin || short_margin || liquidation_price ||
    /// oracle_event_id || expiry`
    #[must_use]
    pub fn terms_digest(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(b"cfdx:terms:v1:");
        hasher.update(self.id.as_bytes());
        hasher.update(self.offer_id.0.as_bytes());
        hasher.update(self.initial_price.to_string().as_bytes());
        hasher.update([0, self.leverage.get()]);
        hasher.update(self.quantity.to_string().as_bytes());
        hasher.update([0]);
        hasher.update(self.long_margin.to_sat().to_le_bytes());
        hasher.update(self.short_margin.to_sat().to_le_bytes());
        hasher.update(self.liquidation_price.to_string().as_bytes());
        hasher.update([0]);
        hasher.update(self.oracle_event_id.as_str().as_bytes());
        hasher.update([0]);
        hasher.update(self.expiry.timestamp_millis().to_le_bytes());
        hasher.finalize().into()
    }

    /// Sequence number the next transition must be recorded under.
    #[must_use]
    pub fn next_seq(&self) -> u64 {
        self.version + 1
    }

    /// Check that `next` is a legal successor of the current state.
    ///
    /// # Errors
    /// Returns `InvalidTransition` otherwise.
    pub fn check_transition(&self, next: &ContractState) -> Result<()> {
        if self.state.can_transition_to(next) {
            Ok(())
        } else {
            Err(CfdError::InvalidTransition {
                contract_id: self.id,
                from: self.state.to_string(),
                to: next.to_string(),
            })
        }
    }

    /// Apply a recorded transition.
    ///
    /// Returns `Ok(false)` without touching the contract if `seq` was
    /// already applied, so replaying a log twice is harmless.
    ///
    /// # Errors
    /// - `SequenceConflict` if `seq` skips ahead
    /// - `InvalidTransition` if the state change is not an edge of the DAG
    pub fn apply(&mut self, seq: u64, state: ContractState) -> Result<bool> {
        if seq <= self.version {
            return Ok(false);
        }
        if seq != self.next_seq() {
            return Err(CfdError::SequenceConflict {
                contract_id: self.id,
                expected: self.next_seq(),
                actual: seq,
            });
        }
        self.check_transition(&state)?;
        match &state {
            ContractState::Open { dlc } => self.funding_txid = Some(dlc.funding_txid()),
            ContractState::PendingClose { closing } => self.closing_txid = Some(closing.tx.txid()),
            ContractState::Closed { outcome } => self.closing_txid = Some(outcome.closing_txid),
            _ => {}
        }
        self.state = state;
        self.version = seq;
        Ok(true)
    }

    /// Apply a recorded rollover. Skips sequences already seen, like [`Self::apply`].
    ///
    /// # Errors
    /// - `SequenceConflict` if `seq` skips ahead
    /// - `WrongState` unless the contract is open on the same funding output
    ///   and the new expiry is later
    pub fn apply_rollover(&mut self, seq: u64, rollover: Rollover) -> Result<bool> {
        if seq <= self.version {
            return Ok(false);
        }
        if seq != self.next_seq() {
            return Err(CfdError::SequenceConflict {
                contract_id: self.id,
                expected: self.next_seq(),
                actual: seq,
            });
        }
        self.check_rollover(&rollover)?;
        self.expiry = rollover.expiry;
        self.oracle_event_id = rollover.oracle_event_id;
        self.state = ContractState::Open { dlc: rollover.dlc };
        self.version = seq;
        Ok(true)
    }

    /// Can `rollover` replace the current DLC?
    ///
    /// # Errors
    /// Returns `WrongState` if it cannot.
    pub fn check_rollover(&self, rollover: &Rollover) -> Result<()> {
        let wrong = |state: String| CfdError::WrongState {
            operation: "rollover".into(),
            state,
        };
        let Some(dlc) = self.dlc() else {
            return Err(wrong(self.state.to_string()));
        };
        if dlc.funding_txid() != rollover.dlc.funding_txid() {
            return Err(wrong("rollover spends a different funding output".into()));
        }
        if rollover.expiry <= self.expiry {
            return Err(wrong(format!(
                "rollover to {} does not extend expiry {}",
                rollover.expiry, self.expiry
            )));
        }
        Ok(())
    }
}

/// Dummy contracts for testing. **Never use in production.**
#[cfg(any(test, feature = "test-helpers"))]
impl Contract {
    /// A 10000 USD contract on [`Offer::dummy`].
    #[must_use]
    pub fn dummy(role: Role) -> Self {
        let offer = Offer::dummy();
        Self::new(
            ContractId::new(),
            role,
            &offer,
            Usd::new(rust_decimal::Decimal::new(10_000, 0)),
            PeerId([7; 32]),
            Utc::now(),
        )
        .expect("dummy contract is valid")
    }
}
