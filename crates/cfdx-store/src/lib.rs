//! # cfdx-store
//!
//! Crash-safe persistence of contract state.
//!
//! ```text
//!   contract actor ── append (seq = version + 1) ──▶ sled tree "contracts"
//!                                                    key = id || seq (BE)
//!   restart ── replay(id) ── Created, Transition, Transition ... ──▶ Contract
//! ```
//!
//! - **Append-only**: an existing entry is never overwritten.
//! - **Gapless**: an append must carry exactly `last + 1`.
//! - **Durable first**: every append is flushed before it returns, and
//!   callers act externally only afterwards.
//! - **Idempotent replay**: entries at or below the running version are
//!   skipped.

pub mod error;
pub mod log;

pub use error::StoreError;
pub use log::{LogEntry, Record, Store};
