//! Closing open contracts: collaborative, unilateral and oracle-attested,
//! spends seen on chain, and rollover.

mod common;

use std::sync::Arc;

use cfdx_engine::{MakerNode, PeerMessage, RolloverMsg, SettlementMsg, SetupMsg};
use cfdx_store::{Record, Store};
use cfdx_types::{
    ClosePath, Contract, ContractId, ContractState, DlcTemplate, OracleEventId, OrderRequest,
    Quote, Role, SignedTransaction, Usd, dlc,
    tx::{CET_TAG, CLOSE_TAG},
};
use cfdx_wallet::{Blockchain, MemoryChain};
use chrono::{Duration as ChronoDuration, Utc};
use common::*;
use ed25519_dalek::{Signature, SigningKey};
use rust_decimal_macros::dec;

/// A contract opened by hand against `maker`, with the taker's side kept by the test.
struct Scripted {
    raw: RawTaker,
    contract: Contract,
    template: DlcTemplate,
    key: SigningKey,
    maker_cet_sigs: Vec<Signature>,
}

async fn open_scripted(maker: &MakerNode) -> Scripted {
    let offer = maker
        .publish_offer(offer_params(ChronoDuration::hours(24)))
        .await
        .unwrap();
    let mut raw = RawTaker::connect(maker).await;
    raw.recv_until(|m| matches!(m, PeerMessage::CurrentOffer(Some(_))))
        .await;

    let request = OrderRequest::new(offer.id, Usd::new(dec!(10000)));
    let id = request.contract_id;
    raw.send(PeerMessage::TakeOffer(request.clone())).await;
    let PeerMessage::Setup {
        msg: SetupMsg::Params { terms_digest, params: maker_params },
        ..
    } = raw
        .recv_until(|m| matches!(m, PeerMessage::Setup { .. }))
        .await
    else {
        unreachable!()
    };

    let contract = Contract::new(id, Role::Taker, &offer, request.quantity, maker.peer_id(), Utc::now()).unwrap();
    assert_eq!(contract.terms_digest(), terms_digest);
    let key = SigningKey::from_bytes(&[77; 32]);
    let own = dlc::dummy::party(&key, contract.long_margin, 77);
    raw.send(PeerMessage::Setup {
        contract_id: id,
        msg: SetupMsg::Params {
            terms_digest,
            params: own.clone(),
        },
    })
    .await;
    let template = DlcTemplate::build(&contract.terms(), &contract.oracle_event_id, maker_params, own, N_PAYOUTS).unwrap();

    let PeerMessage::Setup {
        msg: SetupMsg::CetSignatures(maker_sigs),
        ..
    } = raw.recv().await
    else {
        panic!("expected CET signatures")
    };
    template
        .verify_cets(&template.maker.identity, &maker_sigs)
        .unwrap();
    let maker_cet_sigs = maker_sigs;
    raw.send(PeerMessage::Setup {
        contract_id: id,
        msg: SetupMsg::CetSignatures(template.sign_cets(&key)),
    })
    .await;

    let PeerMessage::Setup {
        msg: SetupMsg::FundingSignature(_),
        ..
    } = raw.recv().await
    else {
        panic!("expected a funding signature")
    };
    raw.send(PeerMessage::Setup {
        contract_id: id,
        msg: SetupMsg::FundingSignature(template.sign_funding(&key)),
    })
    .await;

    wait_for(maker, id, |p| p.state == "OPEN").await;
    Scripted {
        raw,
        contract,
        template,
        key,
        maker_cet_sigs,
    }
}

impl Scripted {
    /// The fully signed CET at `index`, as either party could publish it.
    fn cet(&self, index: usize) -> SignedTransaction {
        let cet = &self.template.cets[index];
        SignedTransaction {
            tx: cet.tx.clone(),
            signatures: vec![
                (self.template.maker.identity, self.maker_cet_sigs[index]),
                (
                    self.key.verifying_key(),
                    cet.tx.sign(&self.key, CET_TAG, &cet.adaptor_point),
                ),
            ],
        }
    }
}

fn closing_path(store: &Store, id: ContractId) -> Option<ClosePath> {
    store.entries(id).unwrap().into_iter().find_map(|e| match e.record {
        Record::Transition(ContractState::PendingClose { closing }) => Some(closing.path),
        _ => None,
    })
}

#[tokio::test]
async fn collaborative_close_within_tolerance() {
    let pair = connected_pair().await;
    let id = pair.open(offer_params(ChronoDuration::hours(24))).await;

    let mark = Quote::new(price(dec!(42000)));
    pair.maker.push_quote(mark).await.unwrap();
    pair.taker.push_quote(mark).await.unwrap();
    let mut quotes = pair.taker.feeds().quote;
    quotes.wait_for(Option::is_some).await.unwrap();

    // 45000 is far outside 50 bps of the taker's mark; the taker refuses.
    pair.maker.propose_close(id, price(dec!(45000))).await.unwrap();
    let maker = &pair.maker;
    eventually(|| async move { maker.propose_close(id, price(dec!(42010))).await.is_ok() }).await;

    let maker_view = wait_for(&pair.maker, id, |p| p.state == "CLOSED").await;
    let taker_view = wait_for(&pair.taker, id, |p| p.state == "CLOSED").await;
    assert_eq!(maker_view.state_detail, "CLOSED(COLLABORATIVE)");
    assert_eq!(taker_view.state_detail, "CLOSED(COLLABORATIVE)");
    assert_eq!(maker_view.closing_txid, taker_view.closing_txid);
    assert!(pair.chain.is_accepted(&maker_view.closing_txid.unwrap()).await);
    assert_eq!(closing_path(pair.maker.store(), id), Some(ClosePath::Collaborative));
}

#[tokio::test]
async fn far_proposal_is_refused_and_contract_stays_open() {
    let pair = connected_pair().await;
    let id = pair.open(offer_params(ChronoDuration::hours(24))).await;
    let mark = Quote::new(price(dec!(42000)));
    pair.taker.push_quote(mark).await.unwrap();
    let mut quotes = pair.taker.feeds().quote;
    quotes.wait_for(Option::is_some).await.unwrap();

    pair.maker.propose_close(id, price(dec!(45000))).await.unwrap();
    // The rejection clears the proposal, so a new one is accepted locally.
    let maker = &pair.maker;
    eventually(|| async move { maker.propose_close(id, price(dec!(45000))).await.is_ok() }).await;
    assert_eq!(pair.maker.contract(id).unwrap().state.label(), "OPEN");
    assert_eq!(pair.taker.contract(id).unwrap().state.label(), "OPEN");
}

#[tokio::test]
async fn unanswered_proposal_closes_unilaterally() {
    let chain = MemoryChain::new();
    let store = Store::temporary().unwrap();
    let maker = start_maker(&chain, store.clone()).await;
    let mut scripted = open_scripted(&maker).await;
    let id = scripted.contract.id;

    maker.propose_close(id, price(dec!(42000))).await.unwrap();
    let proposal = scripted
        .raw
        .recv_until(|m| matches!(m, PeerMessage::Settlement { .. }))
        .await;
    assert!(matches!(
        proposal,
        PeerMessage::Settlement {
            msg: SettlementMsg::Propose { .. },
            ..
        }
    ));

    let closed = wait_for(&maker, id, |p| p.state == "CLOSED").await;
    assert_eq!(closed.state_detail, "CLOSED(UNILATERAL)");
    assert_eq!(closing_path(&store, id), Some(ClosePath::Unilateral));
    assert!(chain.is_accepted(&closed.closing_txid.unwrap()).await);
}

#[tokio::test]
async fn maker_accepts_peer_proposal_once_it_has_a_mark() {
    let chain = MemoryChain::new();
    let maker = start_maker(&chain, Store::temporary().unwrap()).await;
    let mut scripted = open_scripted(&maker).await;
    let id = scripted.contract.id;

    let close_price = price(dec!(42000));
    let payout = scripted.contract.terms().payout_at(close_price).unwrap();
    let tx = scripted.template.close_tx(&payout);
    let propose = PeerMessage::Settlement {
        contract_id: id,
        msg: SettlementMsg::Propose {
            price: close_price,
            payout,
            sig: tx.sign(&scripted.key, CLOSE_TAG, &[]),
        },
    };

    // No mark price yet.
    scripted.raw.send(propose.clone()).await;
    let refused = scripted
        .raw
        .recv_until(|m| matches!(m, PeerMessage::Settlement { .. }))
        .await;
    let PeerMessage::Settlement {
        msg: SettlementMsg::Reject { reason },
        ..
    } = refused
    else {
        panic!("expected a refusal without a mark price")
    };
    assert!(reason.starts_with("CFD_ERR_602"), "{reason}");

    maker.push_quote(Quote::new(close_price)).await.unwrap();
    let mut quotes = maker.feeds().quote;
    quotes.wait_for(Option::is_some).await.unwrap();
    scripted.raw.send(propose).await;
    let PeerMessage::Settlement {
        msg: SettlementMsg::Accept { sig },
        ..
    } = scripted
        .raw
        .recv_until(|m| matches!(m, PeerMessage::Settlement { .. }))
        .await
    else {
        panic!("expected the maker to countersign")
    };
    tx.verify(&scripted.template.maker.identity, CLOSE_TAG, &[], &sig, "close")
        .unwrap();

    let closed = wait_for(&maker, id, |p| p.state == "CLOSED").await;
    assert_eq!(closed.state_detail, "CLOSED(COLLABORATIVE)");
}

#[tokio::test]
async fn attestation_settles_at_expiry() {
    let pair = connected_pair().await;
    let params = offer_params(ChronoDuration::seconds(3));
    let event = params.oracle_event_id.clone();
    let expiry = params.settlement_time;
    let id = pair.open(params).await;

    // Early attestations are held until the contract expires.
    let attestation = attest(&event, dec!(30000));
    pair.maker.push_attestation(attestation.clone()).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert_eq!(pair.maker.contract(id).unwrap().state.label(), "OPEN");

    let wait = (expiry - Utc::now()).to_std().unwrap_or_default();
    tokio::time::sleep(wait + std::time::Duration::from_millis(100)).await;
    // Late attestations settle immediately.
    pair.taker.push_attestation(attestation).await.unwrap();

    let maker_view = wait_for(&pair.maker, id, |p| p.state == "CLOSED").await;
    let taker_view = wait_for(&pair.taker, id, |p| p.state == "CLOSED").await;
    assert_eq!(maker_view.state_detail, "CLOSED(LIQUIDATED)");
    assert_eq!(taker_view.state_detail, "CLOSED(LIQUIDATED)");
    assert_eq!(maker_view.closing_txid, taker_view.closing_txid);
    assert_eq!(closing_path(pair.maker.store(), id), Some(ClosePath::OracleAttested));
}

#[tokio::test]
async fn restarted_maker_republishes_funding() {
    let store = Store::temporary().unwrap();
    let pair = connected_pair_with(store.clone()).await;
    let id = pair.open(offer_params(ChronoDuration::hours(24))).await;
    let funding = pair.maker.contract(id).unwrap().funding_txid.unwrap();
    let Pair { maker, taker, .. } = pair;
    maker.into_inner().shutdown().await;
    taker.into_inner().shutdown().await;

    let fresh = MemoryChain::new();
    let restarted = MakerNode::start(
        config(Role::Maker),
        keys(1),
        oracle_key().verifying_key(),
        Arc::new(fresh.clone()),
        store,
    )
    .unwrap();
    let chain = &fresh;
    eventually(|| async move { chain.is_accepted(&funding).await }).await;
    assert_eq!(restarted.contract(id).unwrap().state.label(), "OPEN");
    let health = restarted.health().await.unwrap();
    assert_eq!(health.live_contracts, 1);
    assert_eq!(health.connected_peers, 0);
}

#[tokio::test]
async fn breached_margin_closes_and_counterparty_follows_from_chain() {
    let pair = connected_pair().await;
    let id = pair.open(offer_params(ChronoDuration::hours(24))).await;

    // Below the 35000 liquidation price; only the maker sees it.
    pair.maker
        .push_quote(Quote::new(price(dec!(30000))))
        .await
        .unwrap();

    let maker_view = wait_for(&pair.maker, id, |p| p.state == "CLOSED").await;
    assert_eq!(maker_view.state_detail, "CLOSED(LIQUIDATED)");
    assert_eq!(closing_path(pair.maker.store(), id), Some(ClosePath::Unilateral));

    let taker_view = wait_for(&pair.taker, id, |p| p.state == "CLOSED").await;
    assert_eq!(taker_view.closing_txid, maker_view.closing_txid);
    assert_eq!(closing_path(pair.taker.store(), id), Some(ClosePath::Unilateral));
    let ContractState::Closed { outcome } = pair.taker.contract(id).unwrap().state else {
        unreachable!()
    };
    assert!(outcome.liquidated);
}

#[tokio::test]
async fn counterparty_cet_on_chain_closes_with_its_payout() {
    let chain = MemoryChain::new();
    let store = Store::temporary().unwrap();
    let maker = start_maker(&chain, store.clone()).await;
    let scripted = open_scripted(&maker).await;
    let id = scripted.contract.id;

    let index = scripted.template.cets.len() - 1;
    let cet = scripted.cet(index);
    chain.broadcast(&cet).await.unwrap();

    let closed = wait_for(&maker, id, |p| p.state == "CLOSED").await;
    assert_eq!(closed.closing_txid, Some(cet.txid()));
    let ContractState::Closed { outcome } = maker.contract(id).unwrap().state else {
        unreachable!()
    };
    assert_eq!(outcome.path, ClosePath::Unilateral);
    assert_eq!(outcome.payout, scripted.template.cets[index].bucket.payout);
    assert!(!outcome.liquidated);
    assert_eq!(closing_path(&store, id), Some(ClosePath::Unilateral));
}

#[tokio::test]
async fn rollover_moves_both_sides_to_the_next_event() {
    let pair = connected_pair().await;
    let id = pair.open(offer_params(ChronoDuration::hours(1))).await;
    let before = pair.taker.contract(id).unwrap();

    pair.taker.rollover(id).await.unwrap();
    let (maker, taker) = (&pair.maker, &pair.taker);
    let old_expiry = before.expiry;
    eventually(|| async move {
        maker.contract(id).unwrap().expiry > old_expiry
            && taker.contract(id).unwrap().expiry > old_expiry
    })
    .await;

    let maker_side = pair.maker.contract(id).unwrap();
    let taker_side = pair.taker.contract(id).unwrap();
    assert_eq!(maker_side.expiry, taker_side.expiry);
    assert_eq!(taker_side.oracle_event_id, OracleEventId::btc_usd_at(taker_side.expiry));
    assert_ne!(taker_side.oracle_event_id, before.oracle_event_id);
    assert_eq!(taker_side.funding_txid, before.funding_txid);
    assert_eq!(taker_side.state.label(), "OPEN");
    assert_eq!(maker_side.dlc().unwrap(), taker_side.dlc().unwrap());
    assert!(
        pair.maker
            .store()
            .entries(id)
            .unwrap()
            .iter()
            .any(|e| matches!(e.record, Record::Rollover(_)))
    );

    // An attestation for the old event no longer settles anything.
    pair.taker
        .push_attestation(attest(&before.oracle_event_id, dec!(30000)))
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert_eq!(pair.taker.contract(id).unwrap().state.label(), "OPEN");
}

#[tokio::test]
async fn rollover_to_the_wrong_event_is_refused() {
    let chain = MemoryChain::new();
    let maker = start_maker(&chain, Store::temporary().unwrap()).await;
    let mut scripted = open_scripted(&maker).await;
    let id = scripted.contract.id;

    let settlement_time = scripted.contract.expiry + ChronoDuration::hours(1);
    let wrong_event = OracleEventId("btcusd-elsewhere".into());
    let template = DlcTemplate::build(
        &scripted.contract.terms(),
        &wrong_event,
        scripted.template.maker.clone(),
        scripted.template.taker.clone(),
        N_PAYOUTS,
    )
    .unwrap();
    scripted
        .raw
        .send(PeerMessage::Rollover {
            contract_id: id,
            msg: RolloverMsg::Propose {
                settlement_time,
                oracle_event_id: wrong_event,
                sigs: template.sign_cets(&scripted.key),
            },
        })
        .await;

    let PeerMessage::Rollover {
        msg: RolloverMsg::Reject { reason },
        ..
    } = scripted
        .raw
        .recv_until(|m| matches!(m, PeerMessage::Rollover { .. }))
        .await
    else {
        panic!("expected the maker to refuse")
    };
    assert!(reason.starts_with("CFD_ERR_601"), "{reason}");
    let contract = maker.contract(id).unwrap();
    assert_eq!(contract.expiry, scripted.contract.expiry);
    assert_eq!(contract.state.label(), "OPEN");
}

#[tokio::test]
async fn maker_countersigns_a_valid_rollover() {
    let chain = MemoryChain::new();
    let maker = start_maker(&chain, Store::temporary().unwrap()).await;
    let mut scripted = open_scripted(&maker).await;
    let id = scripted.contract.id;

    let settlement_time = chrono::DateTime::from_timestamp(
        (scripted.contract.expiry + ChronoDuration::hours(1)).timestamp(),
        0,
    )
    .unwrap();
    let event = OracleEventId::btc_usd_at(settlement_time);
    let template = DlcTemplate::build(
        &scripted.contract.terms(),
        &event,
        scripted.template.maker.clone(),
        scripted.template.taker.clone(),
        N_PAYOUTS,
    )
    .unwrap();
    scripted
        .raw
        .send(PeerMessage::Rollover {
            contract_id: id,
            msg: RolloverMsg::Propose {
                settlement_time,
                oracle_event_id: event.clone(),
                sigs: template.sign_cets(&scripted.key),
            },
        })
        .await;

    let PeerMessage::Rollover {
        msg: RolloverMsg::Accept { sigs },
        ..
    } = scripted
        .raw
        .recv_until(|m| matches!(m, PeerMessage::Rollover { .. }))
        .await
    else {
        panic!("expected the maker to countersign")
    };
    template.verify_cets(&template.maker.identity, &sigs).unwrap();
    let contract = maker.contract(id).unwrap();
    assert_eq!(contract.expiry, settlement_time);
    assert_eq!(contract.oracle_event_id, event);
}
