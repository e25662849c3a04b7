//! End-to-end channel tests over in-memory duplex streams.

use cfdx_transport::{Channel, Inbound, StaticKeypair, accept, connect};
use cfdx_types::CfdError;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
enum Msg {
    Hello(u16),
    Text(String),
}

type Chan = Channel<DuplexStream, Msg, Msg>;

async fn pair(pin: Option<cfdx_types::PeerId>) -> (cfdx_types::Result<Chan>, cfdx_types::Result<Chan>) {
    let (a, b) = tokio::io::duplex(64 * 1024);
    let maker = StaticKeypair::from_bytes([2; 32]);
    let taker = StaticKeypair::from_bytes([1; 32]);
    tokio::join!(connect(a, taker, pin), accept(b, maker))
}

#[tokio::test]
async fn messages_flow_both_ways_in_order() {
    let maker_id = StaticKeypair::from_bytes([2; 32]).peer_id();
    let (taker, maker) = pair(Some(maker_id)).await;
    let (mut taker, mut maker) = (taker.unwrap(), maker.unwrap());
    assert_eq!(taker.remote, maker_id);
    assert_eq!(taker.handshake_hash, maker.handshake_hash);

    for i in 0..5 {
        taker.writer.send(Msg::Text(format!("m{i}"))).await.unwrap();
    }
    for i in 0..5 {
        let got = maker.reader.next().await.unwrap().unwrap();
        assert_eq!(got, Inbound::Message(Msg::Text(format!("m{i}"))));
    }

    maker.writer.send(Msg::Hello(1)).await.unwrap();
    assert_eq!(
        taker.reader.next().await.unwrap().unwrap(),
        Inbound::Message(Msg::Hello(1))
    );
}

#[tokio::test]
async fn halves_work_from_separate_tasks() {
    let (taker, maker) = pair(None).await;
    let (taker, mut maker) = (taker.unwrap(), maker.unwrap());
    let Channel { mut writer, .. } = taker;
    let sender = tokio::spawn(async move {
        for i in 0..3u16 {
            writer.send(Msg::Hello(i)).await.unwrap();
        }
    });
    for i in 0..3u16 {
        assert_eq!(
            maker.reader.next().await.unwrap().unwrap(),
            Inbound::Message(Msg::Hello(i))
        );
    }
    sender.await.unwrap();
}

#[tokio::test]
async fn wrong_pinned_key_aborts_handshake() {
    let stranger = StaticKeypair::from_bytes([9; 32]).peer_id();
    let (taker, _maker) = pair(Some(stranger)).await;
    assert!(matches!(taker.unwrap_err(), CfdError::PeerKeyMismatch { .. }));
}

#[tokio::test]
async fn garbage_instead_of_handshake_fails() {
    let (mut a, b) = tokio::io::duplex(1024);
    let responder = tokio::spawn(async move {
        accept::<_, Msg, Msg>(b, StaticKeypair::from_bytes([2; 32])).await
    });
    // Length 4, then four bytes: too short for an ephemeral key.
    a.write_all(&[0, 4, 1, 2, 3, 4]).await.unwrap();
    let err = responder.await.unwrap().unwrap_err();
    assert!(matches!(err, CfdError::HandshakeFailed { .. }));
}

#[tokio::test]
async fn corrupted_transport_frame_is_fatal() {
    // Relay the taker's bytes to the maker through a tampering middlebox.
    let (taker_io, mitm_taker_side) = tokio::io::duplex(64 * 1024);
    let (mitm_maker_side, maker_io) = tokio::io::duplex(64 * 1024);
    let maker_key = StaticKeypair::from_bytes([2; 32]);
    let taker_key = StaticKeypair::from_bytes([1; 32]);

    let maker = tokio::spawn(async move { accept::<_, Msg, Msg>(maker_io, maker_key).await });
    let taker = tokio::spawn(async move { connect::<_, Msg, Msg>(taker_io, taker_key, None).await });

    // Forward the handshake verbatim, then flip one bit of the first frame.
    let relay = tokio::spawn(async move {
        let (mut tr, mut tw) = tokio::io::split(mitm_taker_side);
        let (mut mr, mut mw) = tokio::io::split(mitm_maker_side);
        let up = async {
            // msg1 (2 + 32) and msg3 (2 + 48 + 16), then one transport frame.
            let mut buf = vec![0u8; 34];
            tr.read_exact(&mut buf).await.unwrap();
            mw.write_all(&buf).await.unwrap();
            let mut buf = vec![0u8; 66];
            tr.read_exact(&mut buf).await.unwrap();
            mw.write_all(&buf).await.unwrap();
            let mut len = [0u8; 4];
            tr.read_exact(&mut len).await.unwrap();
            let mut frame = vec![0u8; u32::from_be_bytes(len) as usize];
            tr.read_exact(&mut frame).await.unwrap();
            frame[0] ^= 0x80;
            mw.write_all(&len).await.unwrap();
            mw.write_all(&frame).await.unwrap();
        };
        let down = async {
            // msg2 (2 + 32 + 48 + 16).
            let mut buf = vec![0u8; 98];
            mr.read_exact(&mut buf).await.unwrap();
            tw.write_all(&buf).await.unwrap();
        };
        tokio::join!(up, down);
        (tr, tw, mr, mw)
    });

    let mut taker = taker.await.unwrap().unwrap();
    let mut maker = maker.await.unwrap().unwrap();
    taker.writer.send(Msg::Text("pay me".into())).await.unwrap();
    let _halves = relay.await.unwrap();

    let err = maker.reader.next().await.unwrap().unwrap_err();
    assert!(matches!(err, CfdError::CryptoFailure { .. }));
    assert!(err.is_fatal_for_connection());
}
