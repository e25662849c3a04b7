//! # cfdx-engine
//!
//! Maker and taker daemons for peer-to-peer CFDs settled through DLCs.
//!
//! Each daemon is a set of supervised actors exchanging typed messages:
//!
//! ```text
//!                 ┌──────────────┐  Noise   ┌──────────────┐
//!   takers ◀────▶ │  connection  │ ◀──────▶ │    node      │
//!                 └──────────────┘          │  (registry)  │
//!                                           └──────┬───────┘
//!                         ┌────────────────────────┼──────────────┐
//!                         ▼                        ▼              ▼
//!                 ┌──────────────┐         ┌──────────────┐ ┌────────────┐
//!                 │  contract ×N │ ──────▶ │    wallet    │ │ order book │
//!                 └──────┬───────┘         └──────────────┘ └────────────┘
//!                        │  ▲ quotes, attestations
//!                        ▼  │
//!                 ┌──────────────┐         ┌──────────────┐
//!                 │ store (log)  │         │    oracle    │
//!                 └──────────────┘         └──────────────┘
//!                        └────────▶ projection ──▶ `cfds` feed
//! ```
//!
//! - [`actor`] / [`supervisor`]: mailboxes, the message loop and restarts
//! - [`connection`]: one actor per authenticated peer, with heartbeats
//! - [`contract`]: negotiation, three-round setup and settlement of one CFD
//! - [`wallet`], [`order_book`], [`oracle`], [`projection`]: shared services
//! - [`node`], [`maker`], [`taker`]: wiring and the public façades
//! - [`wire`]: the peer protocol
//! - [`logging`]: `tracing` subscriber setup

pub mod actor;
pub mod connection;
pub mod contract;
pub mod logging;
pub mod maker;
pub mod node;
pub mod oracle;
pub mod order_book;
pub mod projection;
pub mod supervisor;
pub mod taker;
pub mod wallet;
pub mod wire;

pub use contract::ContractMsg;
pub use maker::MakerNode;
pub use node::{Feeds, Health, Node, NodeKeys};
pub use projection::CfdProjection;
pub use supervisor::Exit;
pub use taker::TakerNode;
pub use wire::{PeerMessage, RolloverMsg, SettlementMsg, SetupMsg};
