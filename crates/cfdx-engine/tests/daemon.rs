//! Daemon surface: key persistence, TCP listen/dial, offer propagation.

mod common;

use std::sync::Arc;

use cfdx_engine::{MakerNode, NodeKeys, TakerNode};
use cfdx_store::Store;
use cfdx_types::{CfdError, Role};
use cfdx_wallet::MemoryChain;
use chrono::Duration as ChronoDuration;
use common::*;
use tokio::net::TcpListener;

#[tokio::test]
async fn node_keys_survive_reload() {
    let store = Store::temporary().unwrap();
    let first = NodeKeys::load_or_create(&store).await.unwrap();
    let second = NodeKeys::load_or_create(&store).await.unwrap();
    assert_eq!(first.transport.peer_id(), second.transport.peer_id());
    assert_eq!(first.wallet.to_bytes(), second.wallet.to_bytes());
}

#[tokio::test]
async fn wrong_role_configuration_is_refused() {
    let chain = MemoryChain::new();
    let err = MakerNode::start(
        config(Role::Taker),
        keys(1),
        oracle_key().verifying_key(),
        Arc::new(chain.clone()),
        Store::temporary().unwrap(),
    )
    .err()
    .unwrap();
    assert!(matches!(err, CfdError::Configuration(_)));
    assert!(
        TakerNode::start(
            config(Role::Maker),
            keys(2),
            oracle_key().verifying_key(),
            Arc::new(chain),
            Store::temporary().unwrap(),
        )
        .is_err()
    );
}

#[tokio::test]
async fn taker_dials_maker_over_tcp_and_sees_offers() {
    let chain = MemoryChain::new();
    let maker = Arc::new(start_maker(&chain, Store::temporary().unwrap()).await);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = maker.listen(listener);

    let taker = start_taker(&chain).await;
    taker.dial(addr, maker.peer_id()).await.unwrap();
    let offer = maker
        .publish_offer(offer_params(ChronoDuration::hours(24)))
        .await
        .unwrap();

    let mut offers = taker.feeds().offer;
    tokio::time::timeout(
        WAIT,
        offers.wait_for(|o| o.as_ref().is_some_and(|o| o.id == offer.id)),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(taker.current_offer().await.unwrap(), Some(offer));

    let maker_ref = &maker;
    eventually(|| async move { maker_ref.health().await.is_ok_and(|h| h.connected_peers == 1) }).await;
    let health = taker.health().await.unwrap();
    assert!(health.wallet && health.order_book);
    assert_eq!(health.peer_id, taker.peer_id());
    server.abort();
}

#[tokio::test]
async fn dialing_the_wrong_maker_fails() {
    let chain = MemoryChain::new();
    let maker = Arc::new(start_maker(&chain, Store::temporary().unwrap()).await);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = maker.listen(listener);

    let taker = start_taker(&chain).await;
    let impostor = keys(3).transport.peer_id();
    assert!(taker.dial(addr, impostor).await.is_err());
    server.abort();
}
