//! # cfdx-types
//!
//! Shared model, errors, and configuration for the **CFDX** engine.
//!
//! This crate is the leaf dependency of the workspace; every other crate
//! depends on it. It defines:
//!
//! - **Identifiers**: [`ContractId`], [`OfferId`], [`PeerId`], [`Txid`], [`OutPoint`]
//! - **Money**: [`Price`], [`Usd`], [`Leverage`], [`Amount`], [`SignedAmount`], [`Position`], [`Role`]
//! - **Contract math**: [`Terms`], [`Payout`]
//! - **Offers**: [`Offer`], [`OfferParams`], [`OrderRequest`]
//! - **Contract model**: [`Contract`], [`ContractState`], [`ClosePath`], [`CloseOutcome`], [`FailureReason`]
//! - **DLC model**: [`DlcTemplate`], [`Dlc`], [`PartyParams`], [`PayoutBucket`]
//! - **Transactions**: [`Transaction`], [`SignedTransaction`], [`Utxo`]
//! - **Oracle**: [`Quote`], [`OracleAttestation`], [`OracleEventId`]
//! - **Wallet reservations**: [`Reservation`], [`ReservationState`]
//! - **Configuration**: [`NodeConfig`], [`PhaseTimeouts`], [`BroadcastPolicy`], [`LiquidationPolicy`]
//! - **Errors**: [`CfdError`] with `CFD_ERR_` prefix codes
//! - **Constants**: system-wide limits and defaults

pub mod config;
pub mod constants;
pub mod contract;
pub mod dlc;
pub mod error;
pub mod ids;
pub mod money;
pub mod offer;
pub mod oracle;
pub mod payout;
pub mod reservation;
pub mod tx;

// Re-export all primary types at crate root for ergonomic imports:
//   use cfdx_types::{Contract, ContractState, Offer, Amount, ...};

pub use config::*;
pub use contract::*;
pub use dlc::{Cet, Dlc, DlcTemplate, FundingSpend, PartyParams, PayoutBucket, adaptor_point, payout_curve};
pub use error::*;
pub use ids::*;
pub use money::*;
pub use offer::*;
pub use oracle::*;
pub use payout::*;
pub use reservation::*;
pub use tx::{SignedTransaction, Transaction, TxOut, Utxo};

// Constants are accessed via `cfdx_types::constants::FOO`
// (not re-exported to avoid name collisions).
