//! Shared fixtures: two daemons on an in-memory chain, and a scripted peer
//! that speaks the wire protocol by hand.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use cfdx_engine::{CfdProjection, MakerNode, Node, NodeKeys, PeerMessage, TakerNode};
use cfdx_store::Store;
use cfdx_transport::{Channel, Inbound, StaticKeypair};
use cfdx_types::{
    Amount, BroadcastPolicy, ContractId, Leverage, NodeConfig, OfferParams, OracleAttestation,
    OracleEventId, OutPoint, Price, Role, Txid, Usd, Utxo, constants::WIRE_VERSION,
};
use cfdx_wallet::MemoryChain;
use chrono::Utc;
use ed25519_dalek::SigningKey;
use futures::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::io::DuplexStream;

pub const WAIT: Duration = Duration::from_secs(10);
pub const N_PAYOUTS: usize = 20;

pub fn price(value: Decimal) -> Price {
    Price::new(value).unwrap()
}

pub fn oracle_key() -> SigningKey {
    SigningKey::from_bytes(&[200; 32])
}

pub fn attest(event: &OracleEventId, value: Decimal) -> OracleAttestation {
    OracleAttestation::attest(&oracle_key(), event.clone(), price(value), Utc::now())
}

pub fn config(role: Role) -> NodeConfig {
    let mut config = NodeConfig::new(role, "unused");
    config.settlement.n_payouts = N_PAYOUTS;
    config.timeouts.negotiation = Duration::from_secs(3);
    config.timeouts.setup_round = Duration::from_secs(3);
    config.timeouts.collaborative_close = Duration::from_secs(1);
    config.timeouts.rollover = Duration::from_secs(1);
    config.settlement.chain_poll_interval = Duration::from_millis(100);
    config.broadcast = BroadcastPolicy {
        max_attempts: 3,
        initial_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(20),
    };
    config
}

pub fn keys(seed: u8) -> NodeKeys {
    NodeKeys {
        transport: StaticKeypair::from_bytes([seed; 32]),
        wallet: SigningKey::from_bytes(&[seed.wrapping_add(100); 32]),
    }
}

pub fn utxo(tag: u8, sats: u64) -> Utxo {
    Utxo {
        outpoint: OutPoint::new(Txid([tag; 32]), 0),
        value: Amount::from_sat(sats),
    }
}

/// The reference offer: 42000, leverage 5, 1000..=50000, settling in `settle_in`.
pub fn offer_params(settle_in: chrono::Duration) -> OfferParams {
    let mut params = OfferParams::with_defaults(
        price(dec!(42000)),
        Usd::new(dec!(1000)),
        Usd::new(dec!(50000)),
        Leverage::new(5).unwrap(),
    );
    params.settlement_time = Utc::now() + settle_in;
    params.oracle_event_id = OracleEventId::btc_usd_at(params.settlement_time);
    params
}

pub const MAKER_DEPOSIT: u64 = 30_000_000;

pub async fn start_maker(chain: &MemoryChain, store: Store) -> MakerNode {
    start_maker_funded(chain, store, MAKER_DEPOSIT).await
}

pub async fn start_maker_funded(chain: &MemoryChain, store: Store, sats: u64) -> MakerNode {
    let maker = MakerNode::start(
        config(Role::Maker),
        keys(1),
        oracle_key().verifying_key(),
        Arc::new(chain.clone()),
        store,
    )
    .unwrap();
    maker.deposit(utxo(0xA1, sats)).await.unwrap();
    maker
}

pub async fn start_taker(chain: &MemoryChain) -> TakerNode {
    let taker = TakerNode::start(
        config(Role::Taker),
        keys(2),
        oracle_key().verifying_key(),
        Arc::new(chain.clone()),
        Store::temporary().unwrap(),
    )
    .unwrap();
    taker.deposit(utxo(0xB1, 10_000_000)).await.unwrap();
    taker
}

pub struct Pair {
    pub maker: MakerNode,
    pub taker: TakerNode,
    pub chain: MemoryChain,
}

pub async fn connected_pair() -> Pair {
    connected_pair_with(Store::temporary().unwrap()).await
}

/// A connected pair whose maker records into `maker_store`.
pub async fn connected_pair_with(maker_store: Store) -> Pair {
    let chain = MemoryChain::new();
    let maker = start_maker(&chain, maker_store).await;
    connect(chain, maker).await
}

/// A connected pair whose maker holds only `sats`.
pub async fn connected_pair_funded(sats: u64) -> Pair {
    let chain = MemoryChain::new();
    let maker = start_maker_funded(&chain, Store::temporary().unwrap(), sats).await;
    connect(chain, maker).await
}

async fn connect(chain: MemoryChain, maker: MakerNode) -> Pair {
    let taker = start_taker(&chain).await;
    let (a, b) = tokio::io::duplex(1 << 20);
    let (accepted, connected) = tokio::join!(maker.accept(a), taker.connect(b, maker.peer_id()));
    assert_eq!(accepted.unwrap(), taker.peer_id());
    connected.unwrap();
    Pair { maker, taker, chain }
}

impl Pair {
    /// Publish `params`, take 10000 of it and wait until both sides are open.
    pub async fn open(&self, params: OfferParams) -> ContractId {
        let offer = self.maker.publish_offer(params).await.unwrap();
        let mut offers = self.taker.feeds().offer;
        tokio::time::timeout(
            WAIT,
            offers.wait_for(|o| o.as_ref().is_some_and(|o| o.id == offer.id)),
        )
        .await
        .expect("offer never reached the taker")
        .unwrap();

        let id = self
            .taker
            .take_offer(offer.id, Usd::new(dec!(10000)))
            .await
            .unwrap();
        wait_for(&self.maker, id, |p| p.state == "OPEN").await;
        wait_for(&self.taker, id, |p| p.state == "OPEN").await;
        let funding = self.maker.contract(id).unwrap().funding_txid.unwrap();
        let chain = &self.chain;
        eventually(|| async move { chain.is_accepted(&funding).await }).await;
        id
    }
}

/// Wait until the `cfds` feed shows contract `id` matching `pred`.
pub async fn wait_for(node: &Node, id: ContractId, pred: impl Fn(&CfdProjection) -> bool) -> CfdProjection {
    let mut cfds = node.feeds().cfds;
    let found = tokio::time::timeout(
        WAIT,
        cfds.wait_for(|list| list.iter().any(|p| p.id == id && pred(p))),
    )
    .await
    .unwrap_or_else(|_| panic!("contract {id} never reached the expected state: {:?}", node.cfds()))
    .unwrap();
    found.iter().find(|p| p.id == id).cloned().unwrap()
}

/// Poll `check` until it holds.
pub async fn eventually<F, Fut>(check: F)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(WAIT, async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition never held");
}

// ---------------------------------------------------------------------------
// Scripted peer
// ---------------------------------------------------------------------------

/// A taker played by the test itself. Outgoing frames are plain JSON so a
/// test can also send what no real peer would.
pub struct RawTaker {
    pub channel: Channel<DuplexStream, PeerMessage, serde_json::Value>,
}

impl RawTaker {
    pub async fn connect(maker: &MakerNode) -> Self {
        let (a, b) = tokio::io::duplex(1 << 20);
        let keys = StaticKeypair::from_bytes([9; 32]);
        let (accepted, channel) = tokio::join!(
            maker.accept(a),
            cfdx_transport::connect(b, keys, Some(maker.peer_id()))
        );
        accepted.unwrap();
        let mut raw = Self {
            channel: channel.unwrap(),
        };
        raw.send(PeerMessage::Hello { version: WIRE_VERSION }).await;
        raw
    }

    pub async fn send(&mut self, msg: PeerMessage) {
        self.send_raw(serde_json::to_value(msg).unwrap()).await;
    }

    pub async fn send_raw(&mut self, frame: serde_json::Value) {
        self.channel.writer.send(frame).await.unwrap();
    }

    /// Next message that is not a heartbeat.
    pub async fn recv(&mut self) -> PeerMessage {
        loop {
            let frame = tokio::time::timeout(WAIT, self.channel.reader.next())
                .await
                .expect("maker went quiet");
            match frame {
                Some(Ok(Inbound::Message(PeerMessage::Heartbeat))) => {}
                Some(Ok(Inbound::Message(msg))) => return msg,
                other => panic!("unexpected frame: {other:?}"),
            }
        }
    }

    /// Skip messages until one matches `pred`.
    pub async fn recv_until(&mut self, pred: impl Fn(&PeerMessage) -> bool) -> PeerMessage {
        loop {
            let msg = self.recv().await;
            if pred(&msg) {
                return msg;
            }
        }
    }
}
