//! Handshake-then-frame: turn a raw byte stream into an authenticated,
//! encrypted message channel.

use cfdx_types::{PeerId, Result};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::{
    codec::NoiseCodec,
    handshake::{self, HandshakeRole, Session, TransportPhase},
    identity::StaticKeypair,
};

/// Read half of a channel yielding `Inbound<In>` frames.
pub type FrameReader<S, In> = FramedRead<ReadHalf<S>, NoiseCodec<In>>;
/// Write half of a channel accepting `Out` messages.
pub type FrameWriter<S, Out> = FramedWrite<WriteHalf<S>, NoiseCodec<Out>>;

/// An authenticated connection, split into independently owned halves.
#[derive(Debug)]
pub struct Channel<S, In, Out> {
    pub remote: PeerId,
    pub handshake_hash: [u8; 32],
    pub reader: FrameReader<S, In>,
    pub writer: FrameWriter<S, Out>,
}

impl<S, In, Out> Channel<S, In, Out>
where
    S: AsyncRead + AsyncWrite,
{
    /// Wrap `stream` with the ciphers of an established session.
    #[must_use]
    pub fn from_session(stream: S, session: Session) -> Self {
        let (read, write) = tokio::io::split(stream);
        Self {
            remote: session.remote,
            handshake_hash: session.handshake_hash,
            reader: FramedRead::new(read, NoiseCodec::new(session.recv)),
            writer: FramedWrite::new(write, NoiseCodec::new(session.send)),
        }
    }
}

/// Dial side: handshake as initiator, optionally pinning the remote key.
///
/// # Errors
/// Propagates handshake failures; the stream is dropped on error.
pub async fn connect<S, In, Out>(
    mut stream: S,
    local: StaticKeypair,
    expected_remote: Option<PeerId>,
) -> Result<Channel<S, In, Out>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut phase = PhaseLog::new(HandshakeRole::Initiator);
    phase.advance(TransportPhase::HandshakeInProgress);
    match handshake::initiate(&mut stream, local, expected_remote).await {
        Ok(session) => {
            phase.advance(TransportPhase::Transport);
            Ok(Channel::from_session(stream, session))
        }
        Err(e) => {
            tracing::warn!(error = %e, "outbound handshake failed");
            phase.advance(TransportPhase::Closed);
            Err(e)
        }
    }
}

/// Listen side: handshake as responder.
///
/// # Errors
/// Propagates handshake failures; the stream is dropped on error.
pub async fn accept<S, In, Out>(mut stream: S, local: StaticKeypair) -> Result<Channel<S, In, Out>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut phase = PhaseLog::new(HandshakeRole::Responder);
    phase.advance(TransportPhase::HandshakeInProgress);
    match handshake::respond(&mut stream, local).await {
        Ok(session) => {
            phase.advance(TransportPhase::Transport);
            Ok(Channel::from_session(stream, session))
        }
        Err(e) => {
            tracing::warn!(error = %e, "inbound handshake failed");
            phase.advance(TransportPhase::Closed);
            Err(e)
        }
    }
}

struct PhaseLog {
    role: HandshakeRole,
    phase: TransportPhase,
}

impl PhaseLog {
    fn new(role: HandshakeRole) -> Self {
        Self {
            role,
            phase: TransportPhase::Uninitiated,
        }
    }

    fn advance(&mut self, next: TransportPhase) {
        debug_assert!(self.phase.can_transition_to(next), "{} -> {next}", self.phase);
        tracing::trace!(role = ?self.role, from = %self.phase, to = %next, "transport phase");
        self.phase = next;
    }
}
