//! Error types for the CFDX engine.
//!
//! All errors use the `CFD_ERR_` prefix convention for easy grepping in logs.
//! Error codes are grouped by subsystem:
//! - 1xx: Negotiation errors
//! - 2xx: Wallet errors
//! - 3xx: Contract state / protocol errors
//! - 4xx: Transport errors
//! - 5xx: Persistence errors
//! - 6xx: Oracle errors
//! - 7xx: Timeouts
//! - 9xx: General / internal errors

use thiserror::Error;

use crate::{Amount, ContractId, OfferId, Phase, Usd};

/// Central error enum for all CFDX operations.
#[derive(Debug, Error)]
pub enum CfdError {
    // =================================================================
    // Negotiation Errors (1xx)
    // =================================================================
    /// The referenced offer is not the maker's current offer.
    #[error("CFD_ERR_100: Unknown offer: {0}")]
    UnknownOffer(OfferId),

    /// The offer's validity window has passed.
    #[error("CFD_ERR_101: Offer expired: {0}")]
    OfferExpired(OfferId),

    /// The order request does not fit the offer.
    #[error("CFD_ERR_102: Invalid terms: {reason}")]
    InvalidTerms { reason: String },

    /// Requested quantity is outside `[min, max]`.
    #[error("CFD_ERR_103: Quantity {quantity} outside [{min}, {max}]")]
    QuantityOutOfRange { quantity: Usd, min: Usd, max: Usd },

    /// A contract with this id already exists.
    #[error("CFD_ERR_104: Contract already exists: {0}")]
    DuplicateContract(ContractId),

    /// The counterparty rejected the order request.
    #[error("CFD_ERR_105: Rejected by counterparty: {reason}")]
    RejectedByPeer { reason: String },

    // =================================================================
    // Wallet Errors (2xx)
    // =================================================================
    /// Not enough unreserved outputs to cover the requested amount.
    #[error("CFD_ERR_200: Insufficient funds: need {needed}, have {available}")]
    InsufficientFunds { needed: Amount, available: Amount },

    /// No reservation is held for this contract.
    #[error("CFD_ERR_201: Reservation not found for contract {0}")]
    ReservationNotFound(ContractId),

    /// The reservation cannot make the requested transition.
    #[error("CFD_ERR_202: Invalid reservation: {reason}")]
    InvalidReservation { reason: String },

    /// An output is already held by another active reservation.
    #[error("CFD_ERR_203: Output {outpoint} already reserved by {holder}")]
    OutputAlreadyReserved { outpoint: String, holder: ContractId },

    /// Broadcasting a transaction failed after all retries.
    #[error("CFD_ERR_204: Broadcast of {txid} failed after {attempts} attempts: {reason}")]
    BroadcastFailed {
        txid: String,
        attempts: u32,
        reason: String,
    },

    /// A signature did not verify.
    #[error("CFD_ERR_205: Invalid signature on {context}")]
    SignatureInvalid { context: String },

    /// The chain could not be queried.
    #[error("CFD_ERR_206: Chain unavailable: {reason}")]
    ChainUnavailable { reason: String },

    // =================================================================
    // Contract / Protocol Errors (3xx)
    // =================================================================
    /// No contract with this id is known.
    #[error("CFD_ERR_300: Contract not found: {0}")]
    ContractNotFound(ContractId),

    /// The requested state transition is not an edge of the lifecycle graph.
    #[error("CFD_ERR_301: Invalid transition for {contract_id}: {from} -> {to}")]
    InvalidTransition {
        contract_id: ContractId,
        from: String,
        to: String,
    },

    /// The peer sent a malformed, out-of-order or inconsistent message.
    #[error("CFD_ERR_302: Protocol violation: {reason}")]
    ProtocolViolation { reason: String },

    /// Both peers derived different contract terms.
    #[error("CFD_ERR_303: Terms mismatch: expected {expected}, got {actual}")]
    TermsMismatch { expected: String, actual: String },

    /// The operation is not allowed in the contract's current state.
    #[error("CFD_ERR_304: Operation {operation} not allowed in state {state}")]
    WrongState { operation: String, state: String },

    /// A price was zero, negative or otherwise unusable.
    #[error("CFD_ERR_305: Invalid price: {reason}")]
    InvalidPrice { reason: String },

    // =================================================================
    // Transport Errors (4xx)
    // =================================================================
    /// Handshake or frame authentication failed.
    #[error("CFD_ERR_400: Crypto failure: {reason}")]
    CryptoFailure { reason: String },

    /// The handshake did not complete.
    #[error("CFD_ERR_401: Handshake failed: {reason}")]
    HandshakeFailed { reason: String },

    /// The remote static key is not the one we expected.
    #[error("CFD_ERR_402: Peer key mismatch: expected {expected}, got {actual}")]
    PeerKeyMismatch { expected: String, actual: String },

    /// The peer speaks an incompatible wire version.
    #[error("CFD_ERR_403: Wire version mismatch: ours {ours}, theirs {theirs}")]
    VersionMismatch { ours: u16, theirs: u16 },

    /// The connection to the peer is gone.
    #[error("CFD_ERR_404: Peer disconnected")]
    PeerDisconnected,

    /// A frame exceeded the maximum size.
    #[error("CFD_ERR_405: Frame of {len} bytes exceeds maximum {max}")]
    FrameTooLarge { len: usize, max: usize },

    // =================================================================
    // Persistence Errors (5xx)
    // =================================================================
    /// A durable write or read failed.
    #[error("CFD_ERR_500: Persistence failure: {reason}")]
    PersistenceFailure { reason: String },

    /// An append did not carry the next sequence number.
    #[error("CFD_ERR_501: Sequence conflict for {contract_id}: expected {expected}, got {actual}")]
    SequenceConflict {
        contract_id: ContractId,
        expected: u64,
        actual: u64,
    },

    /// A stored entry could not be decoded or replayed.
    #[error("CFD_ERR_502: Corrupt log: {reason}")]
    CorruptLog { reason: String },

    // =================================================================
    // Oracle Errors (6xx)
    // =================================================================
    /// The attestation signature did not verify.
    #[error("CFD_ERR_600: Invalid attestation: {reason}")]
    AttestationInvalid { reason: String },

    /// The attestation is for a different oracle event.
    #[error("CFD_ERR_601: Oracle event mismatch: expected {expected}, got {actual}")]
    OracleEventMismatch { expected: String, actual: String },

    /// No price quote has been received yet.
    #[error("CFD_ERR_602: No price quote available")]
    NoQuote,

    // =================================================================
    // Timeouts (7xx)
    // =================================================================
    /// A negotiation or close deadline elapsed.
    #[error("CFD_ERR_700: Timed out during {phase}")]
    Timeout { phase: Phase },

    // =================================================================
    // General / Internal (9xx)
    // =================================================================
    /// Unrecoverable internal error.
    #[error("CFD_ERR_900: Internal error: {0}")]
    Internal(String),

    /// Serialization / deserialization error.
    #[error("CFD_ERR_901: Serialization error: {0}")]
    Serialization(String),

    /// Configuration error.
    #[error("CFD_ERR_902: Configuration error: {0}")]
    Configuration(String),

    /// I/O error (disk, network).
    #[error("CFD_ERR_903: I/O error: {0}")]
    Io(String),

    /// An actor's mailbox is closed.
    #[error("CFD_ERR_904: Actor unavailable: {0}")]
    ActorUnavailable(String),
}

impl CfdError {
    /// Whether the failure must close the underlying connection.
    #[must_use]
    pub fn is_fatal_for_connection(&self) -> bool {
        matches!(
            self,
            Self::CryptoFailure { .. }
                | Self::HandshakeFailed { .. }
                | Self::PeerKeyMismatch { .. }
                | Self::VersionMismatch { .. }
                | Self::FrameTooLarge { .. }
        )
    }
}

/// Crate-wide `Result` alias.
pub type Result<T> = std::result::Result<T, CfdError>;

impl From<std::io::Error> for CfdError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for CfdError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
