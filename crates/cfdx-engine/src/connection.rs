//! One actor per authenticated peer connection.
//!
//! The actor owns the write half of the channel. A reader task turns
//! decrypted frames into mailbox messages and a ticker drives heartbeats,
//! so everything touching the connection is serialized through one queue.
//!
//! ```text
//!   socket ──▶ reader task ──▶ ┌────────────┐ ──▶ node (FromPeer)
//!   ticker ──────────────────▶ │ connection │
//!   contracts / offer feed ──▶ └─────┬──────┘
//!                                    ▼
//!                                  socket
//! ```
//!
//! The connection is never restarted: when it stops, the node is told the
//! peer is gone and contracts in setup fail.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use cfdx_transport::{Channel, FrameReader, FrameWriter, Inbound};
use cfdx_types::{CfdError, Offer, PeerId, PhaseTimeouts, Result, constants::WIRE_VERSION};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::actor::{self, Actor, Address, Context, Flow, forward_feed, mailbox};
use crate::node::NodeMsg;
use crate::wire::PeerMessage;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

pub enum ConnectionMsg {
    /// Write a message to the peer.
    Send(PeerMessage),
    Inbound(Inbound<PeerMessage>),
    ReadFailed(CfdError),
    ReaderClosed,
    HeartbeatTick,
    /// Say goodbye and drop the connection.
    Close { reason: String },
}

pub struct ConnectionActor<S> {
    peer: PeerId,
    connection_id: u64,
    writer: FrameWriter<S, PeerMessage>,
    reader: Option<FrameReader<S, PeerMessage>>,
    node: Address<NodeMsg>,
    timeouts: PhaseTimeouts,
    offers: Option<watch::Receiver<Option<Offer>>>,
    last_seen: Instant,
    greeted: bool,
    tasks: Vec<JoinHandle<()>>,
}

impl<S> ConnectionActor<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn write(&mut self, msg: PeerMessage) -> Flow {
        let name = msg.to_string();
        match self.writer.send(msg).await {
            Ok(()) => {
                tracing::trace!(peer = %self.peer.short(), msg = %name, "sent");
                Flow::Continue
            }
            Err(e) => {
                tracing::warn!(peer = %self.peer.short(), msg = %name, error = %e, "write failed");
                Flow::Stop
            }
        }
    }

    async fn on_message(&mut self, msg: PeerMessage, ctx: &Context<ConnectionMsg>) -> Flow {
        match msg {
            PeerMessage::Hello { version } if version != WIRE_VERSION => {
                let e = CfdError::VersionMismatch {
                    ours: WIRE_VERSION,
                    theirs: version,
                };
                tracing::warn!(peer = %self.peer.short(), error = %e, "incompatible peer");
                let _ = self.write(PeerMessage::Disconnect).await;
                Flow::Stop
            }
            PeerMessage::Hello { .. } if self.greeted => Flow::Continue,
            PeerMessage::Hello { .. } => {
                self.greeted = true;
                let Some(me) = ctx.address() else {
                    return Flow::Stop;
                };
                tracing::info!(peer = %self.peer.short(), connection_id = self.connection_id, "peer connected");
                self.notify(NodeMsg::PeerConnected {
                    peer: self.peer,
                    connection_id: self.connection_id,
                    connection: me,
                })
                .await
            }
            PeerMessage::Heartbeat => Flow::Continue,
            PeerMessage::Disconnect => {
                tracing::info!(peer = %self.peer.short(), "peer said goodbye");
                Flow::Stop
            }
            other if !self.greeted => {
                tracing::warn!(peer = %self.peer.short(), msg = %other, "message before hello dropped");
                Flow::Continue
            }
            other => {
                tracing::debug!(peer = %self.peer.short(), msg = %other, "received");
                self.notify(NodeMsg::FromPeer {
                    peer: self.peer,
                    msg: other,
                })
                .await
            }
        }
    }

    /// Owns its own node address, so the future does not borrow `self`.
    fn notify(&self, msg: NodeMsg) -> impl Future<Output = Flow> + Send + 'static {
        let node = self.node.clone();
        async move {
            match node.send(msg).await {
                Ok(()) => Flow::Continue,
                Err(_) => Flow::Stop,
            }
        }
    }

    fn spawn_reader(&mut self, me: Address<ConnectionMsg>) {
        let Some(mut reader) = self.reader.take() else {
            return;
        };
        self.tasks.push(tokio::spawn(async move {
            loop {
                let msg = match reader.next().await {
                    Some(Ok(frame)) => ConnectionMsg::Inbound(frame),
                    Some(Err(e)) => {
                        let _ = me.send(ConnectionMsg::ReadFailed(e)).await;
                        return;
                    }
                    None => {
                        let _ = me.send(ConnectionMsg::ReaderClosed).await;
                        return;
                    }
                };
                if me.send(msg).await.is_err() {
                    return;
                }
            }
        }));
    }

    fn spawn_ticker(&mut self, me: Address<ConnectionMsg>) {
        let every = self.timeouts.heartbeat_interval;
        self.tasks.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            tick.tick().await;
            loop {
                tick.tick().await;
                if me.send(ConnectionMsg::HeartbeatTick).await.is_err() {
                    return;
                }
            }
        }));
    }
}

impl<S> Drop for ConnectionActor<S> {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[async_trait]
impl<S> Actor for ConnectionActor<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    type Message = ConnectionMsg;

    async fn started(&mut self, ctx: &Context<ConnectionMsg>) -> Result<Flow> {
        let Some(me) = ctx.address() else {
            return Ok(Flow::Stop);
        };
        if self.write(PeerMessage::Hello { version: WIRE_VERSION }).await == Flow::Stop {
            return Ok(Flow::Stop);
        }
        self.spawn_reader(me.clone());
        self.spawn_ticker(me.clone());
        if let Some(offers) = self.offers.take() {
            self.tasks.push(forward_feed(offers, me, |offer| {
                Some(ConnectionMsg::Send(PeerMessage::CurrentOffer(offer)))
            }));
        }
        Ok(Flow::Continue)
    }

    async fn handle(&mut self, msg: ConnectionMsg, ctx: &Context<ConnectionMsg>) -> Result<Flow> {
        let flow = match msg {
            ConnectionMsg::Send(msg) => self.write(msg).await,
            ConnectionMsg::Inbound(Inbound::Message(msg)) => {
                self.last_seen = Instant::now();
                self.on_message(msg, ctx).await
            }
            ConnectionMsg::Inbound(Inbound::Malformed { reason }) => {
                self.last_seen = Instant::now();
                let e = CfdError::ProtocolViolation { reason };
                tracing::warn!(peer = %self.peer.short(), error = %e, "malformed message");
                if self.greeted {
                    self.notify(NodeMsg::PeerMisbehaved {
                        peer: self.peer,
                        reason: e.to_string(),
                    })
                    .await
                } else {
                    Flow::Continue
                }
            }
            ConnectionMsg::ReadFailed(e) => {
                tracing::warn!(peer = %self.peer.short(), error = %e, "read failed");
                Flow::Stop
            }
            ConnectionMsg::ReaderClosed => {
                tracing::info!(peer = %self.peer.short(), "connection closed by peer");
                Flow::Stop
            }
            ConnectionMsg::HeartbeatTick => {
                if self.last_seen.elapsed() > self.timeouts.heartbeat_timeout {
                    tracing::warn!(peer = %self.peer.short(), "heartbeat timeout");
                    Flow::Stop
                } else {
                    self.write(PeerMessage::Heartbeat).await
                }
            }
            ConnectionMsg::Close { reason } => {
                tracing::info!(peer = %self.peer.short(), reason = %reason, "closing connection");
                let _ = self.write(PeerMessage::Disconnect).await;
                Flow::Stop
            }
        };
        Ok(flow)
    }
}

/// Start the actor for an established channel.
///
/// The maker passes its offer feed so every connected taker sees the
/// current offer and each republish. When the actor stops, the node gets
/// `PeerDisconnected` for this connection. The returned address may be
/// dropped; the connection keeps running until the peer goes away.
pub fn spawn_connection<S>(
    channel: Channel<S, PeerMessage, PeerMessage>,
    node: Address<NodeMsg>,
    timeouts: PhaseTimeouts,
    offers: Option<watch::Receiver<Option<Offer>>>,
) -> (Address<ConnectionMsg>, JoinHandle<()>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let connection_id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
    let peer = channel.remote;
    let (address, mbox) = mailbox(format!("connection-{}-{connection_id}", peer.short()));
    let conn = ConnectionActor {
        peer,
        connection_id,
        writer: channel.writer,
        reader: Some(channel.reader),
        node: node.clone(),
        timeouts,
        offers,
        last_seen: Instant::now(),
        greeted: false,
        tasks: Vec::new(),
    };
    // The actor stops on its own (peer gone, timeout, close), never because
    // nobody else holds its address.
    let own = address.clone();
    let task = tokio::spawn(async move {
        let ctx = Context::new(&mbox, 0);
        if let Err(e) = actor::run(conn, mbox, ctx).await {
            tracing::warn!(peer = %peer.short(), error = %e, "connection actor failed");
        }
        drop(own);
        let _ = node
            .send(NodeMsg::PeerDisconnected { peer, connection_id })
            .await;
    });
    (address, task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cfdx_transport::StaticKeypair;
    use std::time::Duration;
    use tokio::io::DuplexStream;

    type Raw<Out = PeerMessage> = Channel<DuplexStream, PeerMessage, Out>;

    async fn pair<Out>() -> (Channel<DuplexStream, PeerMessage, PeerMessage>, Raw<Out>) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let ours = StaticKeypair::from_bytes([1; 32]);
        let theirs = StaticKeypair::from_bytes([2; 32]);
        let (ours, theirs) = tokio::join!(
            cfdx_transport::accept(a, ours),
            cfdx_transport::connect(b, theirs, None)
        );
        (ours.unwrap(), theirs.unwrap())
    }

    fn timeouts() -> PhaseTimeouts {
        PhaseTimeouts {
            heartbeat_interval: Duration::from_millis(50),
            heartbeat_timeout: Duration::from_millis(200),
            ..PhaseTimeouts::default()
        }
    }

    /// Next message that is not a heartbeat.
    async fn next_msg<Out>(raw: &mut Raw<Out>) -> PeerMessage {
        loop {
            match raw.reader.next().await {
                Some(Ok(Inbound::Message(PeerMessage::Heartbeat))) => {}
                Some(Ok(Inbound::Message(msg))) => return msg,
                other => panic!("expected a message, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn hello_registers_and_messages_reach_the_node() {
        let (channel, mut raw) = pair::<PeerMessage>().await;
        let (node, node_mbox) = mailbox::<NodeMsg>("node");
        let (_conn, _task) = spawn_connection(channel, node, timeouts(), None);

        assert_eq!(next_msg(&mut raw).await, PeerMessage::Hello { version: WIRE_VERSION });
        raw.writer.send(PeerMessage::Hello { version: WIRE_VERSION }).await.unwrap();
        raw.writer.send(PeerMessage::CurrentOffer(None)).await.unwrap();

        let mut rx = node_mbox.receiver().await;
        assert!(matches!(rx.recv().await, Some(NodeMsg::PeerConnected { .. })));
        match rx.recv().await {
            Some(NodeMsg::FromPeer { msg, .. }) => assert_eq!(msg, PeerMessage::CurrentOffer(None)),
            _ => panic!("expected the forwarded offer"),
        }
    }

    #[tokio::test]
    async fn version_mismatch_drops_the_connection() {
        let (channel, mut raw) = pair::<PeerMessage>().await;
        let (node, node_mbox) = mailbox::<NodeMsg>("node");
        let (_conn, task) = spawn_connection(channel, node, timeouts(), None);

        let _hello = next_msg(&mut raw).await;
        raw.writer.send(PeerMessage::Hello { version: WIRE_VERSION + 1 }).await.unwrap();
        assert_eq!(next_msg(&mut raw).await, PeerMessage::Disconnect);
        task.await.unwrap();

        let mut rx = node_mbox.receiver().await;
        assert!(matches!(rx.recv().await, Some(NodeMsg::PeerDisconnected { .. })));
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        let (channel, mut raw) = pair::<PeerMessage>().await;
        let (node, _node_mbox) = mailbox::<NodeMsg>("node");
        let (_conn, task) = spawn_connection(channel, node, timeouts(), None);
        let _hello = next_msg(&mut raw).await;
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("connection should give up on a silent peer")
            .unwrap();
    }

    #[tokio::test]
    async fn offer_feed_is_pushed_after_hello() {
        let (channel, mut raw) = pair::<PeerMessage>().await;
        let (node, _node_mbox) = mailbox::<NodeMsg>("node");
        let (offers_tx, offers) = watch::channel(None);
        let (_conn, _task) = spawn_connection(channel, node, timeouts(), Some(offers));

        assert!(matches!(next_msg(&mut raw).await, PeerMessage::Hello { .. }));
        assert_eq!(next_msg(&mut raw).await, PeerMessage::CurrentOffer(None));
        let offer = Offer::dummy();
        offers_tx.send_replace(Some(offer.clone()));
        loop {
            match next_msg(&mut raw).await {
                PeerMessage::Heartbeat => {}
                msg => {
                    assert_eq!(msg, PeerMessage::CurrentOffer(Some(offer)));
                    break;
                }
            }
        }
    }

    #[tokio::test]
    async fn connection_outlives_its_returned_address() {
        let (channel, mut raw) = pair::<PeerMessage>().await;
        let (node, node_mbox) = mailbox::<NodeMsg>("node");
        let (_offers_tx, offers) = watch::channel(Some(Offer::dummy()));
        drop(spawn_connection(channel, node, timeouts(), Some(offers)));

        assert!(matches!(next_msg(&mut raw).await, PeerMessage::Hello { .. }));
        assert!(matches!(next_msg(&mut raw).await, PeerMessage::CurrentOffer(Some(_))));
        raw.writer.send(PeerMessage::Hello { version: WIRE_VERSION }).await.unwrap();

        let mut rx = node_mbox.receiver().await;
        match rx.recv().await {
            Some(NodeMsg::PeerConnected { connection, .. }) => assert!(!connection.is_closed()),
            _ => panic!("expected the connection to register"),
        }
        // Still answering well after start-up.
        tokio::time::sleep(Duration::from_millis(120)).await;
        raw.writer.send(PeerMessage::Heartbeat).await.unwrap();
        raw.writer.send(PeerMessage::CurrentOffer(None)).await.unwrap();
        assert!(matches!(rx.recv().await, Some(NodeMsg::FromPeer { .. })));
    }

    #[tokio::test]
    async fn undecodable_frame_is_reported_and_the_connection_stays_up() {
        let (channel, mut raw) = pair::<serde_json::Value>().await;
        let (node, node_mbox) = mailbox::<NodeMsg>("node");
        let (_conn, task) = spawn_connection(channel, node, timeouts(), None);

        let _hello = next_msg(&mut raw).await;
        let hello = serde_json::to_value(PeerMessage::Hello { version: WIRE_VERSION }).unwrap();
        raw.writer.send(hello).await.unwrap();
        raw.writer.send(serde_json::json!({ "Bogus": [1, 2, 3] })).await.unwrap();
        let offer = serde_json::to_value(PeerMessage::CurrentOffer(None)).unwrap();
        raw.writer.send(offer).await.unwrap();

        let mut rx = node_mbox.receiver().await;
        assert!(matches!(rx.recv().await, Some(NodeMsg::PeerConnected { .. })));
        match rx.recv().await {
            Some(NodeMsg::PeerMisbehaved { reason, .. }) => assert!(reason.starts_with("CFD_ERR_302")),
            _ => panic!("expected the violation to be reported"),
        }
        assert!(matches!(rx.recv().await, Some(NodeMsg::FromPeer { .. })));
        assert!(!task.is_finished());
    }
}
