//! # Noise_XX handshake
//!
//! Three messages authenticate both static keys:
//!
//! ```text
//!   initiator (taker)                         responder (maker)
//!        │ ── msg 1: e ───────────────────────────▶ │
//!        │ ◀── msg 2: e, ee, s, es ───────────────── │
//!        │ ── msg 3: s, se ────────────────────────▶ │
//!        ▼                                          ▼
//!     Split(): k1 initiator→responder, k2 responder→initiator
//! ```
//!
//! [`Handshake`] is a pure state machine over byte buffers. [`initiate`] and
//! [`respond`] drive it over any `AsyncRead + AsyncWrite` with a 2-byte
//! big-endian length prefix per handshake message.
//!
//! The initiator may pin the responder's static key. A mismatch, like any
//! failed decryption, aborts the handshake; nothing after it is trusted.

use std::fmt;

use cfdx_types::{CfdError, PeerId, Result};
use rand::rngs::OsRng;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::{
    identity::StaticKeypair,
    noise::{CipherState, SymmetricState, TAG_LEN},
};

const DH_LEN: usize = 32;

// ---------------------------------------------------------------------------
// Connection phase
// ---------------------------------------------------------------------------

/// Lifecycle of one transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportPhase {
    Uninitiated,
    HandshakeInProgress,
    Transport,
    Closed,
}

impl TransportPhase {
    #[must_use]
    pub fn can_transition_to(&self, target: Self) -> bool {
        matches!(
            (self, target),
            (Self::Uninitiated, Self::HandshakeInProgress | Self::Closed)
                | (Self::HandshakeInProgress, Self::Transport | Self::Closed)
                | (Self::Transport, Self::Closed)
        )
    }
}

impl fmt::Display for TransportPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uninitiated => write!(f, "UNINITIATED"),
            Self::HandshakeInProgress => write!(f, "HANDSHAKE_IN_PROGRESS"),
            Self::Transport => write!(f, "TRANSPORT"),
            Self::Closed => write!(f, "CLOSED"),
        }
    }
}

// ---------------------------------------------------------------------------
// Handshake state machine
// ---------------------------------------------------------------------------

/// Which side of the handshake we are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeRole {
    Initiator,
    Responder,
}

/// An established session: the authenticated peer and the transport ciphers.
#[derive(Debug)]
pub struct Session {
    pub remote: PeerId,
    pub handshake_hash: [u8; 32],
    pub send: CipherState,
    pub recv: CipherState,
}

/// Sans-IO Noise_XX handshake.
pub struct Handshake {
    role: HandshakeRole,
    symmetric: SymmetricState,
    local: StaticKeypair,
    ephemeral: Option<StaticSecret>,
    remote_ephemeral: Option<PublicKey>,
    remote_static: Option<PublicKey>,
    expected_remote: Option<PeerId>,
    /// Number of handshake messages processed so far (0..=3).
    step: u8,
}

impl Handshake {
    #[must_use]
    pub fn initiator(local: StaticKeypair, expected_remote: Option<PeerId>) -> Self {
        Self::new(HandshakeRole::Initiator, local, expected_remote)
    }

    #[must_use]
    pub fn responder(local: StaticKeypair) -> Self {
        Self::new(HandshakeRole::Responder, local, None)
    }

    fn new(role: HandshakeRole, local: StaticKeypair, expected_remote: Option<PeerId>) -> Self {
        Self {
            role,
            symmetric: SymmetricState::new(),
            local,
            ephemeral: None,
            remote_ephemeral: None,
            remote_static: None,
            expected_remote,
            step: 0,
        }
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.step == 3
    }

    /// Whether the next message is ours to write.
    #[must_use]
    pub fn is_my_turn(&self) -> bool {
        let initiator_writes = self.step % 2 == 0;
        (self.role == HandshakeRole::Initiator) == initiator_writes
    }

    /// Produce the next handshake message carrying `payload`.
    ///
    /// # Errors
    /// `HandshakeFailed` if it is not our turn; `CryptoFailure` on a
    /// cryptographic error.
    pub fn write_message(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        if self.is_finished() || !self.is_my_turn() {
            return Err(handshake_failed("write out of turn"));
        }
        let mut out = Vec::with_capacity(2 * DH_LEN + 2 * TAG_LEN + payload.len());
        match self.step {
            0 => {
                self.write_ephemeral(&mut out);
            }
            1 => {
                self.write_ephemeral(&mut out);
                self.mix_ee()?;
                self.write_static(&mut out)?;
                // es: our static with their ephemeral
                let re = required(self.remote_ephemeral.as_ref(), "remote ephemeral key")?;
                mix_dh(&mut self.symmetric, self.local.secret(), re)?;
            }
            _ => {
                self.write_static(&mut out)?;
                // se: our static with their ephemeral
                let re = required(self.remote_ephemeral.as_ref(), "remote ephemeral key")?;
                mix_dh(&mut self.symmetric, self.local.secret(), re)?;
            }
        }
        out.extend(self.symmetric.encrypt_and_hash(payload)?);
        self.step += 1;
        Ok(out)
    }

    /// Consume the next handshake message and return its payload.
    ///
    /// # Errors
    /// `HandshakeFailed` on a short or out-of-turn message, `CryptoFailure`
    /// on failed decryption, `PeerKeyMismatch` if the responder's static
    /// key is not the pinned one.
    pub fn read_message(&mut self, message: &[u8]) -> Result<Vec<u8>> {
        if self.is_finished() || self.is_my_turn() {
            return Err(handshake_failed("read out of turn"));
        }
        let mut rest = message;
        match self.step {
            0 => {
                rest = self.read_ephemeral(rest)?;
            }
            1 => {
                rest = self.read_ephemeral(rest)?;
                self.mix_ee()?;
                rest = self.read_static(rest)?;
                // es: our ephemeral with their static
                let e = required(self.ephemeral.as_ref(), "local ephemeral key")?;
                let rs = required(self.remote_static.as_ref(), "remote static key")?;
                mix_dh(&mut self.symmetric, e, rs)?;
                self.check_pinned(rs)?;
            }
            _ => {
                rest = self.read_static(rest)?;
                // se: our ephemeral with their static
                let e = required(self.ephemeral.as_ref(), "local ephemeral key")?;
                let rs = required(self.remote_static.as_ref(), "remote static key")?;
                mix_dh(&mut self.symmetric, e, rs)?;
            }
        }
        let payload = self.symmetric.decrypt_and_hash(rest)?;
        self.step += 1;
        Ok(payload)
    }

    /// Finish the handshake.
    ///
    /// # Errors
    /// `HandshakeFailed` if the three messages have not all been processed.
    pub fn into_session(self) -> Result<Session> {
        if !self.is_finished() {
            return Err(handshake_failed("handshake incomplete"));
        }
        let remote = PeerId::from_pubkey(
            required(self.remote_static.as_ref(), "remote static key")?.to_bytes(),
        );
        let (initiator_to_responder, responder_to_initiator) = self.symmetric.split()?;
        let (send, recv) = match self.role {
            HandshakeRole::Initiator => (initiator_to_responder, responder_to_initiator),
            HandshakeRole::Responder => (responder_to_initiator, initiator_to_responder),
        };
        Ok(Session {
            remote,
            handshake_hash: self.symmetric.handshake_hash(),
            send,
            recv,
        })
    }

    // -- token helpers --------------------------------------------------------

    fn write_ephemeral(&mut self, out: &mut Vec<u8>) {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        out.extend_from_slice(public.as_bytes());
        self.symmetric.mix_hash(public.as_bytes());
        self.ephemeral = Some(secret);
    }

    fn read_ephemeral<'a>(&mut self, message: &'a [u8]) -> Result<&'a [u8]> {
        let (key, rest) = split_at_checked(message, DH_LEN, "ephemeral key")?;
        self.symmetric.mix_hash(key);
        self.remote_ephemeral = Some(PublicKey::from(to_array(key)));
        Ok(rest)
    }

    fn write_static(&mut self, out: &mut Vec<u8>) -> Result<()> {
        let public = *self.local.public();
        out.extend(self.symmetric.encrypt_and_hash(public.as_bytes())?);
        Ok(())
    }

    fn read_static<'a>(&mut self, message: &'a [u8]) -> Result<&'a [u8]> {
        let len = self.symmetric.encrypted_len(DH_LEN);
        let (encrypted, rest) = split_at_checked(message, len, "static key")?;
        let key = self.symmetric.decrypt_and_hash(encrypted)?;
        if key.len() != DH_LEN {
            return Err(handshake_failed("static key has wrong length"));
        }
        self.remote_static = Some(PublicKey::from(to_array(&key)));
        Ok(rest)
    }

    fn mix_ee(&mut self) -> Result<()> {
        let e = required(self.ephemeral.as_ref(), "local ephemeral key")?;
        let re = required(self.remote_ephemeral.as_ref(), "remote ephemeral key")?;
        mix_dh(&mut self.symmetric, e, re)
    }

    fn check_pinned(&self, remote: &PublicKey) -> Result<()> {
        let actual = PeerId::from_pubkey(remote.to_bytes());
        match self.expected_remote {
            Some(expected) if expected != actual => Err(CfdError::PeerKeyMismatch {
                expected: expected.to_string(),
                actual: actual.to_string(),
            }),
            _ => Ok(()),
        }
    }
}

impl fmt::Debug for Handshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handshake")
            .field("role", &self.role)
            .field("step", &self.step)
            .finish_non_exhaustive()
    }
}

fn mix_dh(symmetric: &mut SymmetricState, secret: &StaticSecret, public: &PublicKey) -> Result<()> {
    let shared = secret.diffie_hellman(public);
    if !shared.was_contributory() {
        return Err(CfdError::CryptoFailure {
            reason: "low-order public key".into(),
        });
    }
    symmetric.mix_key(shared.as_bytes())
}

fn required<'a, T>(value: Option<&'a T>, what: &str) -> Result<&'a T> {
    value.ok_or_else(|| handshake_failed(&format!("missing {what}")))
}

fn handshake_failed(reason: &str) -> CfdError {
    CfdError::HandshakeFailed {
        reason: reason.to_string(),
    }
}

fn split_at_checked<'a>(message: &'a [u8], at: usize, what: &str) -> Result<(&'a [u8], &'a [u8])> {
    if message.len() < at {
        return Err(handshake_failed(&format!("message too short for {what}")));
    }
    Ok(message.split_at(at))
}

fn to_array(bytes: &[u8]) -> [u8; DH_LEN] {
    let mut out = [0u8; DH_LEN];
    out.copy_from_slice(&bytes[..DH_LEN]);
    out
}

// ---------------------------------------------------------------------------
// Async drivers
// ---------------------------------------------------------------------------

/// Run the handshake as initiator over `stream`.
///
/// # Errors
/// Any handshake error, or `Io` if the stream fails.
pub async fn initiate<S>(
    stream: &mut S,
    local: StaticKeypair,
    expected_remote: Option<PeerId>,
) -> Result<Session>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut hs = Handshake::initiator(local, expected_remote);
    write_frame(stream, &hs.write_message(&[])?).await?;
    hs.read_message(&read_frame(stream).await?)?;
    write_frame(stream, &hs.write_message(&[])?).await?;
    let session = hs.into_session()?;
    tracing::debug!(peer = %session.remote, "noise handshake complete (initiator)");
    Ok(session)
}

/// Run the handshake as responder over `stream`.
///
/// # Errors
/// Any handshake error, or `Io` if the stream fails.
pub async fn respond<S>(stream: &mut S, local: StaticKeypair) -> Result<Session>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut hs = Handshake::responder(local);
    hs.read_message(&read_frame(stream).await?)?;
    write_frame(stream, &hs.write_message(&[])?).await?;
    hs.read_message(&read_frame(stream).await?)?;
    let session = hs.into_session()?;
    tracing::debug!(peer = %session.remote, "noise handshake complete (responder)");
    Ok(session)
}

async fn write_frame<S: AsyncWrite + Unpin>(stream: &mut S, message: &[u8]) -> Result<()> {
    let len = u16::try_from(message.len()).map_err(|_| handshake_failed("message too long"))?;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(message).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_frame<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Vec<u8>> {
    let mut len = [0u8; 2];
    stream
        .read_exact(&mut len)
        .await
        .map_err(|e| handshake_failed(&format!("reading length: {e}")))?;
    let mut message = vec![0u8; usize::from(u16::from_be_bytes(len))];
    stream
        .read_exact(&mut message)
        .await
        .map_err(|e| handshake_failed(&format!("reading message: {e}")))?;
    Ok(message)
}
