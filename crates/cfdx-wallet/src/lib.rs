//! # cfdx-wallet
//!
//! The daemon's funds, as seen by the engine:
//!
//! - [`WalletCoordinator`]: owns the UTXO set; reserves outputs per
//!   contract, commits them to a funding transaction or releases them,
//!   exactly once, and builds our side of a DLC setup.
//! - [`Blockchain`]: broadcast collaborator, with [`broadcast_with_retry`]
//!   applying the configured backoff and [`MemoryChain`] as an in-memory
//!   implementation with failure injection.
//!
//! The coordinator is plain synchronous state. The engine wraps it in a
//! single wallet actor, so the UTXO set has one owner.

pub mod chain;
pub mod coordinator;

pub use chain::{Blockchain, MemoryChain, broadcast_with_retry};
pub use coordinator::{WalletCoordinator, WalletInfo};
