//! # cfdx-transport
//!
//! Authenticated, encrypted, in-order message channel between a maker and a
//! taker daemon.
//!
//! ```text
//!   TcpStream ──▶ Noise_XX handshake ──▶ Session{remote, send, recv}
//!                                            │ split
//!                      ┌─────────────────────┴─────────────────────┐
//!                      ▼                                           ▼
//!        FramedRead<NoiseCodec<In>>                  FramedWrite<NoiseCodec<Out>>
//!        u32 BE len || ChaChaPoly(JSON)              u32 BE len || ChaChaPoly(JSON)
//! ```
//!
//! - Mutual authentication with static X25519 keys; the dialer can pin the
//!   listener's key.
//! - Any authentication or decryption failure is fatal for the connection.
//! - A reconnect is always a fresh handshake; sessions never resume.

pub mod channel;
pub mod codec;
pub mod handshake;
pub mod identity;
pub mod noise;

pub use channel::{Channel, FrameReader, FrameWriter, accept, connect};
pub use codec::{Inbound, NoiseCodec};
pub use handshake::{Handshake, HandshakeRole, Session, TransportPhase};
pub use identity::StaticKeypair;
