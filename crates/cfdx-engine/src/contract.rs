//! # Contract actor: negotiation, setup and settlement of one CFD
//!
//! One supervised actor per contract, addressed by [`ContractId`]. The
//! actor is the only writer of its contract: every state change is first
//! appended to the store and only then acted upon (reply, peer message,
//! broadcast).
//!
//! ```text
//!   maker                                        taker
//!   ─────                                        ─────
//!                     ◀── TakeOffer ───────────  Requested (reserve)
//!   Requested (validate, reserve)
//!   Accepted  ─────── Accept ─────────────────▶  Accepted
//!   SetupInProgress ◀──── Params ────▶           SetupInProgress
//!                   ◀── CetSignatures ──▶
//!                   ◀── FundingSignature ──▶
//!   Open (broadcast funding)                     Open
//! ```
//!
//! Every wait on the peer carries a deadline. Timers are tagged with a
//! generation so a timer armed for an earlier wait is recognised and
//! ignored. Setup is not resumable: an incarnation that finds its contract
//! mid-setup (after a crash or a daemon restart) marks it failed.
//!
//! Once open, the contract closes one of three ways:
//! - **collaborative**: either side proposes a price, the other checks it
//!   against its own mark and counter-signs
//! - **unilateral**: a breached margin, a protocol violation or an
//!   unanswered proposal publishes the pre-signed CET at the latest quote
//! - **oracle-attested**: at expiry, the CET matching the attested price
//!
//! An open contract also polls the chain for a spend of its funding output,
//! so a close published by the counterparty alone is still recorded with
//! its actual payout. Before expiry the taker may roll the contract over:
//! both sides re-sign the CETs against a later oracle event on the same
//! funding output, and the contract stays open with the later expiry.

use std::sync::Arc;

use async_trait::async_trait;
use cfdx_store::{Record, Store};
use cfdx_types::{
    Amount, CfdError, ClosePath, ClosingTx, Contract, ContractId, ContractState, Dlc, DlcTemplate,
    FailureReason, FundingSpend, NodeConfig, Offer, OracleAttestation, OracleEventId, OrderRequest,
    PartyParams, Payout, PeerId, Phase, Price, Quote, Result, Role, Rollover, SignedTransaction,
    Transaction, tx::CLOSE_TAG,
};
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, VerifyingKey};
use tokio::task::JoinHandle;

use crate::actor::{Actor, Address, Context, Flow, Reply};
use crate::connection::ConnectionMsg;
use crate::oracle::OracleHandle;
use crate::projection::ProjectionHandle;
use crate::wallet::WalletHandle;
use crate::wire::{PeerMessage, RolloverMsg, SettlementMsg, SetupMsg};

pub enum ContractMsg {
    FromPeer(PeerMessage),
    /// The counterparty (re)connected; route outgoing messages here.
    PeerConnected(Address<ConnectionMsg>),
    PeerDisconnected,
    /// The counterparty sent something that could not be decoded.
    PeerMisbehaved(String),
    Timeout {
        phase: Phase,
        generation: u64,
    },
    /// The settlement time has passed.
    Expired,
    Quote(Quote),
    Attestation(OracleAttestation),
    ProposeClose {
        price: Price,
        reply: Reply<Result<()>>,
    },
    /// Taker only: ask the maker to move the contract to a later expiry.
    Rollover(Reply<Result<()>>),
    /// Look for a spend of the funding output.
    CheckChain,
}

/// How the first incarnation begins.
pub enum Start {
    /// A taker asked to take `offer`.
    Maker {
        offer: Offer,
        request: OrderRequest,
        taker: PeerId,
    },
    /// We take `offer`; `reply` learns whether the request went out.
    Taker {
        offer: Offer,
        request: OrderRequest,
        maker: PeerId,
        reply: Reply<Result<ContractId>>,
    },
    /// Rebuild from the log.
    Resume,
}

/// What every contract actor talks to.
#[derive(Clone)]
pub struct ContractDeps {
    pub store: Store,
    pub wallet: WalletHandle,
    pub oracle: OracleHandle,
    pub projection: ProjectionHandle,
    pub config: Arc<NodeConfig>,
}

// ---------------------------------------------------------------------------
// Per-phase scratch state
// ---------------------------------------------------------------------------

struct SetupSession {
    expecting: Phase,
    own: PartyParams,
    template: Option<DlcTemplate>,
    own_cet_sigs: Vec<Signature>,
    peer_cet_sigs: Vec<Signature>,
    own_funding_sig: Option<Signature>,
}

impl SetupSession {
    fn new(own: PartyParams) -> Self {
        Self {
            expecting: Phase::SetupParams,
            own,
            template: None,
            own_cet_sigs: Vec::new(),
            peer_cet_sigs: Vec::new(),
            own_funding_sig: None,
        }
    }
}

/// Our outstanding collaborative close proposal.
struct Proposal {
    price: Price,
    payout: Payout,
    tx: Transaction,
    own_sig: Signature,
}

/// Our outstanding rollover proposal.
struct PendingRollover {
    settlement_time: DateTime<Utc>,
    oracle_event_id: OracleEventId,
    template: DlcTemplate,
    own_sigs: Vec<Signature>,
}

fn peer_identity(role: Role, template: &DlcTemplate) -> VerifyingKey {
    match role {
        Role::Maker => template.taker.identity,
        Role::Taker => template.maker.identity,
    }
}

fn not_loaded(id: ContractId) -> CfdError {
    CfdError::Internal(format!("contract {id} is not loaded"))
}

// ---------------------------------------------------------------------------
// ContractActor
// ---------------------------------------------------------------------------

pub struct ContractActor {
    id: ContractId,
    deps: ContractDeps,
    start: Option<Start>,
    contract: Option<Contract>,
    peer: Option<Address<ConnectionMsg>>,
    generation: u64,
    timer: Option<JoinHandle<()>>,
    expiry_timer: Option<JoinHandle<()>>,
    chain_timer: Option<JoinHandle<()>>,
    setup: Option<SetupSession>,
    proposal: Option<Proposal>,
    rollover: Option<PendingRollover>,
    pending_attestation: Option<OracleAttestation>,
    last_quote: Option<Quote>,
}

impl ContractActor {
    #[must_use]
    pub fn new(deps: ContractDeps, id: ContractId, start: Start, peer: Option<Address<ConnectionMsg>>) -> Self {
        Self {
            id,
            deps,
            start: Some(start),
            contract: None,
            peer,
            generation: 0,
            timer: None,
            expiry_timer: None,
            chain_timer: None,
            setup: None,
            proposal: None,
            rollover: None,
            pending_attestation: None,
            last_quote: None,
        }
    }

    fn loaded(&self) -> Result<&Contract> {
        self.contract.as_ref().ok_or_else(|| not_loaded(self.id))
    }

    /// What we lock for this contract: our margin plus our share of the funding fee.
    fn reservation_amount(&self) -> Result<Amount> {
        self.loaded()?
            .own_margin()
            .checked_add(self.deps.config.funding_fee)
            .ok_or_else(|| CfdError::Internal("reservation amount overflows".into()))
    }

    // -- persistence --------------------------------------------------------

    async fn create(&mut self, contract: Contract) -> Result<()> {
        self.deps.store.append_created(&contract).await?;
        tracing::info!(
            contract_id = %contract.id,
            role = %contract.role,
            quantity = %contract.quantity,
            price = %contract.initial_price,
            "contract created"
        );
        self.publish(&contract).await;
        self.contract = Some(contract);
        Ok(())
    }

    /// Persist `state`, then apply it. Nothing else happens if the append fails.
    async fn transition(&mut self, state: ContractState) -> Result<()> {
        let Some(contract) = self.contract.as_mut() else {
            return Err(not_loaded(self.id));
        };
        contract.check_transition(&state)?;
        let seq = contract.next_seq();
        self.deps
            .store
            .append_transition(contract.id, seq, &state)
            .await?;
        contract.apply(seq, state)?;
        tracing::info!(
            contract_id = %contract.id,
            role = %contract.role,
            state = %contract.state,
            version = contract.version,
            "contract transition"
        );
        if let Err(e) = self.deps.projection.update(contract).await {
            tracing::warn!(contract_id = %self.id, error = %e, "projection not updated");
        }
        Ok(())
    }

    async fn publish(&self, contract: &Contract) {
        if let Err(e) = self.deps.projection.update(contract).await {
            tracing::warn!(contract_id = %self.id, error = %e, "projection not updated");
        }
    }

    // -- peer and timers ----------------------------------------------------

    async fn send_peer(&self, msg: PeerMessage) -> Result<()> {
        let peer = self.peer.as_ref().ok_or(CfdError::PeerDisconnected)?;
        peer.send(ConnectionMsg::Send(msg))
            .await
            .map_err(|_| CfdError::PeerDisconnected)
    }

    fn arm(&mut self, ctx: &Context<ContractMsg>, phase: Phase) {
        self.disarm();
        let timeouts = &self.deps.config.timeouts;
        let deadline = match phase {
            Phase::Negotiation => timeouts.negotiation,
            Phase::SetupParams | Phase::SetupSignatures | Phase::SetupFunding => timeouts.setup_round,
            Phase::CollaborativeClose => timeouts.collaborative_close,
            Phase::Rollover => timeouts.rollover,
        };
        let generation = self.generation;
        self.timer = ctx
            .address()
            .map(|me| me.send_after(deadline, ContractMsg::Timeout { phase, generation }));
    }

    fn disarm(&mut self) {
        self.generation += 1;
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    async fn release(&self) {
        if let Err(e) = self.deps.wallet.release(self.id).await {
            tracing::error!(contract_id = %self.id, error = %e, "reservation not released");
        }
    }

    // -- terminal paths -----------------------------------------------------

    async fn fail(&mut self, reason: FailureReason, notify_peer: bool) -> Result<Flow> {
        self.disarm();
        self.setup = None;
        let was_setup = self.loaded()?.state.is_setup_phase();
        let abort_reason = reason.to_string();
        tracing::warn!(contract_id = %self.id, reason = %reason, "contract failed");
        self.transition(ContractState::Failed { reason }).await?;
        if was_setup {
            self.release().await;
        }
        if notify_peer {
            let _ = self
                .send_peer(PeerMessage::Abort {
                    contract_id: self.id,
                    reason: abort_reason,
                })
                .await;
        }
        Ok(Flow::Stop)
    }

    async fn reject(&mut self, reason: String, notify_peer: bool) -> Result<Flow> {
        self.disarm();
        tracing::info!(contract_id = %self.id, reason = %reason, "contract rejected");
        self.transition(ContractState::Rejected {
            reason: reason.clone(),
        })
        .await?;
        self.release().await;
        if notify_peer {
            let _ = self
                .send_peer(PeerMessage::Reject {
                    contract_id: self.id,
                    reason,
                })
                .await;
        }
        Ok(Flow::Stop)
    }

    /// Fail a contract in setup; close an open one unilaterally.
    async fn violation(&mut self, reason: String) -> Result<Flow> {
        let state = &self.loaded()?.state;
        let in_setup = state.is_setup_phase();
        let open = matches!(state, ContractState::Open { .. });
        if in_setup {
            self.fail(FailureReason::ProtocolViolation(reason), true).await
        } else if open {
            self.close_unilaterally(&format!("protocol violation: {reason}"))
                .await
        } else {
            tracing::warn!(contract_id = %self.id, reason = %reason, "ignoring peer misbehaviour");
            Ok(Flow::Continue)
        }
    }

    // -- negotiation --------------------------------------------------------

    async fn begin_maker(
        &mut self,
        ctx: &Context<ContractMsg>,
        offer: Offer,
        request: OrderRequest,
        taker: PeerId,
    ) -> Result<Flow> {
        let now = Utc::now();
        let checked = offer.validate_request(&request, now);
        let contract = match Contract::new(self.id, Role::Maker, &offer, request.quantity, taker, now) {
            Ok(contract) => contract,
            Err(e) => {
                let reason = checked.err().unwrap_or(e).to_string();
                tracing::warn!(contract_id = %self.id, reason = %reason, "unusable take request");
                let _ = self
                    .send_peer(PeerMessage::Reject {
                        contract_id: self.id,
                        reason,
                    })
                    .await;
                return Ok(Flow::Stop);
            }
        };
        self.create(contract).await?;

        if let Err(e) = checked {
            return self.reject(e.to_string(), true).await;
        }
        let amount = self.reservation_amount()?;
        if let Err(e) = self.deps.wallet.reserve(self.id, amount).await {
            return self.reject(e.to_string(), true).await;
        }
        self.transition(ContractState::Accepted).await?;
        if self
            .send_peer(PeerMessage::Accept {
                contract_id: self.id,
            })
            .await
            .is_err()
        {
            return self.fail(FailureReason::PeerDisconnected, false).await;
        }
        self.enter_setup(ctx).await
    }

    async fn begin_taker(
        &mut self,
        ctx: &Context<ContractMsg>,
        offer: Offer,
        request: OrderRequest,
        maker: PeerId,
        reply: Reply<Result<ContractId>>,
    ) -> Result<Flow> {
        let contract = match Contract::new(self.id, Role::Taker, &offer, request.quantity, maker, Utc::now()) {
            Ok(contract) => contract,
            Err(e) => {
                let _ = reply.send(Err(e));
                return Ok(Flow::Stop);
            }
        };
        if let Err(e) = self.create(contract).await {
            let _ = reply.send(Err(CfdError::PersistenceFailure {
                reason: e.to_string(),
            }));
            return Err(e);
        }

        let amount = self.reservation_amount()?;
        if let Err(e) = self.deps.wallet.reserve(self.id, amount).await {
            self.reject(e.to_string(), false).await?;
            let _ = reply.send(Err(e));
            return Ok(Flow::Stop);
        }
        if self.send_peer(PeerMessage::TakeOffer(request)).await.is_err() {
            let _ = reply.send(Err(CfdError::PeerDisconnected));
            return self.fail(FailureReason::PeerDisconnected, false).await;
        }
        let _ = reply.send(Ok(self.id));
        self.arm(ctx, Phase::Negotiation);
        Ok(Flow::Continue)
    }

    async fn on_accepted(&mut self, ctx: &Context<ContractMsg>) -> Result<Flow> {
        self.disarm();
        self.transition(ContractState::Accepted).await?;
        self.enter_setup(ctx).await
    }

    // -- setup ----------------------------------------------------------------

    async fn enter_setup(&mut self, ctx: &Context<ContractMsg>) -> Result<Flow> {
        self.transition(ContractState::SetupInProgress).await?;
        let (margin, terms_digest) = {
            let contract = self.loaded()?;
            (contract.own_margin(), contract.terms_digest())
        };
        let own = self.deps.wallet.party_params(self.id, margin).await?;
        let params = PeerMessage::Setup {
            contract_id: self.id,
            msg: SetupMsg::Params {
                terms_digest,
                params: own.clone(),
            },
        };
        if self.send_peer(params).await.is_err() {
            return self.fail(FailureReason::PeerDisconnected, false).await;
        }
        self.setup = Some(SetupSession::new(own));
        self.arm(ctx, Phase::SetupParams);
        Ok(Flow::Continue)
    }

    async fn on_setup(&mut self, ctx: &Context<ContractMsg>, msg: SetupMsg) -> Result<Flow> {
        let Some(expecting) = self.setup.as_ref().map(|s| s.expecting) else {
            return self
                .violation(format!("{} outside of setup", msg.name()))
                .await;
        };
        match (expecting, msg) {
            (Phase::SetupParams, SetupMsg::Params {
                terms_digest,
                params,
            }) => self.on_params(ctx, terms_digest, params).await,
            (Phase::SetupSignatures, SetupMsg::CetSignatures(sigs)) => self.on_cet_signatures(ctx, sigs).await,
            (Phase::SetupFunding, SetupMsg::FundingSignature(sig)) => self.on_funding_signature(ctx, sig).await,
            (expecting, other) => {
                self.violation(format!("got {} while waiting in {expecting}", other.name()))
                    .await
            }
        }
    }

    /// Round 1: check the peer's parameters, build the DLC, sign every CET.
    async fn on_params(&mut self, ctx: &Context<ContractMsg>, digest: [u8; 32], params: PartyParams) -> Result<Flow> {
        let (terms, event, expected, counter_margin, role) = {
            let c = self.loaded()?;
            (
                c.terms(),
                c.oracle_event_id.clone(),
                c.terms_digest(),
                c.counterparty_margin(),
                c.role,
            )
        };
        if digest != expected {
            let e = CfdError::TermsMismatch {
                expected: hex::encode(expected),
                actual: hex::encode(digest),
            };
            return self.violation(e.to_string()).await;
        }
        if params.margin != counter_margin {
            return self
                .violation(format!(
                    "peer funds {} but the terms require {counter_margin}",
                    params.margin
                ))
                .await;
        }
        let Some(mut session) = self.setup.take() else {
            return Err(not_loaded(self.id));
        };
        let (maker, taker) = match role {
            Role::Maker => (session.own.clone(), params),
            Role::Taker => (params, session.own.clone()),
        };
        let template = match DlcTemplate::build(&terms, &event, maker, taker, self.deps.config.settlement.n_payouts) {
            Ok(template) => template,
            Err(e) => return self.violation(e.to_string()).await,
        };
        let sigs = self.deps.wallet.sign_cets(&template).await?;
        let round = PeerMessage::Setup {
            contract_id: self.id,
            msg: SetupMsg::CetSignatures(sigs.clone()),
        };
        if self.send_peer(round).await.is_err() {
            return self.fail(FailureReason::PeerDisconnected, false).await;
        }
        tracing::debug!(contract_id = %self.id, cets = template.cets.len(), "CETs signed");
        session.template = Some(template);
        session.own_cet_sigs = sigs;
        session.expecting = Phase::SetupSignatures;
        self.setup = Some(session);
        self.arm(ctx, Phase::SetupSignatures);
        Ok(Flow::Continue)
    }

    /// Round 2: verify the peer's CET signatures, sign the funding transaction.
    async fn on_cet_signatures(&mut self, ctx: &Context<ContractMsg>, sigs: Vec<Signature>) -> Result<Flow> {
        let role = self.loaded()?.role;
        let Some(mut session) = self.setup.take() else {
            return Err(not_loaded(self.id));
        };
        let Some(template) = session.template.as_ref() else {
            return self
                .violation("CET signatures before parameters".into())
                .await;
        };
        if let Err(e) = template.verify_cets(&peer_identity(role, template), &sigs) {
            return self.violation(e.to_string()).await;
        }
        let funding_sig = self.deps.wallet.sign_funding(template).await?;
        let round = PeerMessage::Setup {
            contract_id: self.id,
            msg: SetupMsg::FundingSignature(funding_sig),
        };
        if self.send_peer(round).await.is_err() {
            return self.fail(FailureReason::PeerDisconnected, false).await;
        }
        session.peer_cet_sigs = sigs;
        session.own_funding_sig = Some(funding_sig);
        session.expecting = Phase::SetupFunding;
        self.setup = Some(session);
        self.arm(ctx, Phase::SetupFunding);
        Ok(Flow::Continue)
    }

    /// Round 3: verify the peer's funding signature and open the contract.
    async fn on_funding_signature(&mut self, ctx: &Context<ContractMsg>, sig: Signature) -> Result<Flow> {
        let role = self.loaded()?.role;
        let Some(session) = self.setup.take() else {
            return Err(not_loaded(self.id));
        };
        let (Some(template), Some(own_funding_sig)) = (session.template, session.own_funding_sig) else {
            return self
                .violation("funding signature before CET signatures".into())
                .await;
        };
        if let Err(e) = template.verify_funding(&peer_identity(role, &template), &sig) {
            return self.violation(e.to_string()).await;
        }
        let dlc = match role {
            Role::Maker => Dlc {
                template,
                maker_cet_sigs: session.own_cet_sigs,
                taker_cet_sigs: session.peer_cet_sigs,
                maker_funding_sig: own_funding_sig,
                taker_funding_sig: sig,
            },
            Role::Taker => Dlc {
                template,
                maker_cet_sigs: session.peer_cet_sigs,
                taker_cet_sigs: session.own_cet_sigs,
                maker_funding_sig: sig,
                taker_funding_sig: own_funding_sig,
            },
        };
        let funding = dlc.template.funding.clone();

        self.disarm();
        self.transition(ContractState::Open { dlc: Box::new(dlc) })
            .await?;
        if let Err(e) = self.deps.wallet.commit(self.id, &funding).await {
            tracing::error!(contract_id = %self.id, error = %e, "reservation not committed");
        }
        self.enter_open(ctx).await
    }

    // -- open -----------------------------------------------------------------

    /// Watch the oracle and the chain, arm the expiry timer and, on the
    /// maker, publish funding.
    async fn enter_open(&mut self, ctx: &Context<ContractMsg>) -> Result<Flow> {
        let (role, funding) = {
            let c = self.loaded()?;
            let dlc = c.dlc().ok_or_else(|| not_loaded(self.id))?;
            (c.role, dlc.signed_funding())
        };
        self.watch_event(ctx).await?;
        self.arm_chain_check(ctx);
        if role == Role::Maker {
            let txid = funding.txid();
            match self.deps.wallet.broadcast(funding).await {
                Ok(_) => tracing::info!(contract_id = %self.id, txid = %txid, "funding published"),
                Err(e) => {
                    return self
                        .fail(
                            FailureReason::BroadcastFailed {
                                txid,
                                reason: e.to_string(),
                            },
                            false,
                        )
                        .await;
                }
            }
        }
        Ok(Flow::Continue)
    }

    /// Follow the contract's current oracle event until its expiry.
    async fn watch_event(&mut self, ctx: &Context<ContractMsg>) -> Result<()> {
        let (event_id, expiry) = {
            let c = self.loaded()?;
            (c.oracle_event_id.clone(), c.expiry)
        };
        if let Some(me) = ctx.address() {
            self.deps.oracle.monitor(self.id, event_id, me.clone()).await?;
            let delay = (expiry - Utc::now()).to_std().unwrap_or_default();
            if let Some(timer) = self.expiry_timer.replace(me.send_after(delay, ContractMsg::Expired)) {
                timer.abort();
            }
        }
        Ok(())
    }

    fn arm_chain_check(&mut self, ctx: &Context<ContractMsg>) {
        let interval = self.deps.config.settlement.chain_poll_interval;
        let next = ctx
            .address()
            .map(|me| me.send_after(interval, ContractMsg::CheckChain));
        if let Some(timer) = std::mem::replace(&mut self.chain_timer, next) {
            timer.abort();
        }
    }

    async fn on_check_chain(&mut self, ctx: &Context<ContractMsg>) -> Result<Flow> {
        let funding = match self.loaded()?.dlc() {
            Some(dlc) => dlc.template.funding_outpoint(),
            None => return Ok(Flow::Continue),
        };
        match self.deps.wallet.spender_of(funding).await {
            Ok(Some(spend)) => return self.on_funding_spent(spend).await,
            Ok(None) => {}
            Err(e) => tracing::debug!(contract_id = %self.id, error = %e, "chain check failed"),
        }
        self.arm_chain_check(ctx);
        Ok(Flow::Continue)
    }

    /// Someone published a spend of our funding output.
    async fn on_funding_spent(&mut self, spend: SignedTransaction) -> Result<Flow> {
        let txid = spend.txid();
        let dlc = self
            .loaded()?
            .dlc()
            .cloned()
            .ok_or_else(|| not_loaded(self.id))?;
        match self.observed_closing(&dlc, spend)? {
            Some(closing) => {
                tracing::warn!(
                    contract_id = %self.id,
                    txid = %txid,
                    path = %closing.path,
                    "funding output spent by the counterparty"
                );
                self.settle(closing).await
            }
            None => {
                let reason = format!("funding output spent by unknown transaction {txid}");
                self.fail(FailureReason::ProtocolViolation(reason), false)
                    .await
            }
        }
    }

    /// What a spend of `dlc`'s funding output settles, if it is one of ours.
    fn observed_closing(&self, dlc: &Dlc, spend: SignedTransaction) -> Result<Option<ClosingTx>> {
        let c = self.loaded()?;
        if let Some(proposal) = self.proposal.as_ref().filter(|p| p.tx == spend.tx) {
            return Ok(Some(ClosingTx {
                path: ClosePath::Collaborative,
                price: proposal.price,
                payout: proposal.payout,
                tx: spend,
            }));
        }
        let mark = self.last_quote.map(|q| q.price);
        let closing = match dlc.template.recognise_spend(&spend.tx) {
            Some(FundingSpend::Cet(bucket)) => {
                let attested = self.pending_attestation.as_ref().map(|a| a.price);
                let path = if c.is_expired(Utc::now()) {
                    ClosePath::OracleAttested
                } else {
                    ClosePath::Unilateral
                };
                ClosingTx {
                    path,
                    price: bucket.settlement_price(attested.or(mark))?,
                    payout: bucket.payout,
                    tx: spend,
                }
            }
            Some(FundingSpend::Close(payout)) => ClosingTx {
                path: ClosePath::Collaborative,
                price: mark.unwrap_or(c.initial_price),
                payout,
                tx: spend,
            },
            None => return Ok(None),
        };
        Ok(Some(closing))
    }

    /// The DLC the contract was last open with, from its log.
    fn last_dlc(&self) -> Result<Option<Dlc>> {
        Ok(self
            .deps
            .store
            .entries(self.id)?
            .into_iter()
            .rev()
            .find_map(|entry| match entry.record {
                Record::Transition(ContractState::Open { dlc }) => Some(*dlc),
                Record::Rollover(rollover) => Some(*rollover.dlc),
                _ => None,
            }))
    }

    async fn on_quote(&mut self, quote: Quote) -> Result<Flow> {
        self.last_quote = Some(quote);
        let breached = {
            let c = self.loaded()?;
            if c.dlc().is_none() {
                return Ok(Flow::Continue);
            }
            c.terms()
                .margin_breached(&self.deps.config.settlement.liquidation_policy, quote.price)?
        };
        if breached {
            self.close_unilaterally(&format!("margin breached at {}", quote.price))
                .await
        } else {
            Ok(Flow::Continue)
        }
    }

    async fn on_attestation(&mut self, attestation: OracleAttestation) -> Result<Flow> {
        let (open, expired) = {
            let c = self.loaded()?;
            if attestation.event_id != c.oracle_event_id {
                let e = CfdError::OracleEventMismatch {
                    expected: c.oracle_event_id.to_string(),
                    actual: attestation.event_id.to_string(),
                };
                tracing::warn!(contract_id = %self.id, error = %e, "attestation ignored");
                return Ok(Flow::Continue);
            }
            (c.dlc().is_some(), c.is_expired(Utc::now()))
        };
        if !open {
            return Ok(Flow::Continue);
        }
        if expired {
            self.close_attested(&attestation).await
        } else {
            tracing::info!(contract_id = %self.id, price = %attestation.price, "attestation held until expiry");
            self.pending_attestation = Some(attestation);
            Ok(Flow::Continue)
        }
    }

    async fn on_expired(&mut self) -> Result<Flow> {
        if self.loaded()?.dlc().is_none() {
            return Ok(Flow::Continue);
        }
        match self.pending_attestation.take() {
            Some(attestation) => self.close_attested(&attestation).await,
            None => {
                tracing::info!(contract_id = %self.id, "contract expired, waiting for the attestation");
                Ok(Flow::Continue)
            }
        }
    }

    // -- settlement -----------------------------------------------------------

    async fn propose_close(&mut self, ctx: &Context<ContractMsg>, price: Price) -> Result<()> {
        let (tx, payout) = {
            let c = self.loaded()?;
            let Some(dlc) = c.dlc() else {
                return Err(CfdError::WrongState {
                    operation: "propose_close".into(),
                    state: c.state.to_string(),
                });
            };
            if self.proposal.is_some() || self.rollover.is_some() {
                return Err(CfdError::WrongState {
                    operation: "propose_close".into(),
                    state: "another proposal pending".into(),
                });
            }
            let payout = c.terms().payout_at(price)?;
            (dlc.template.close_tx(&payout), payout)
        };
        let own_sig = self.deps.wallet.sign_close(&tx).await?;
        self.send_peer(PeerMessage::Settlement {
            contract_id: self.id,
            msg: SettlementMsg::Propose {
                price,
                payout,
                sig: own_sig,
            },
        })
        .await?;
        tracing::info!(contract_id = %self.id, price = %price, "close proposed");
        self.proposal = Some(Proposal {
            price,
            payout,
            tx,
            own_sig,
        });
        self.arm(ctx, Phase::CollaborativeClose);
        Ok(())
    }

    async fn on_settlement(&mut self, msg: SettlementMsg) -> Result<Flow> {
        let open = self.loaded()?.dlc().is_some();
        match msg {
            SettlementMsg::Propose { .. } if !open => {
                let reason = format!("contract is {}", self.loaded()?.state);
                self.refuse_proposal(reason).await;
                Ok(Flow::Continue)
            }
            SettlementMsg::Propose { price, payout, sig } => self.on_proposal(price, payout, sig).await,
            SettlementMsg::Accept { sig } => self.on_close_accepted(sig).await,
            SettlementMsg::Reject { reason } => {
                if self.proposal.take().is_some() {
                    self.disarm();
                    tracing::warn!(contract_id = %self.id, reason = %reason, "close proposal rejected");
                }
                Ok(Flow::Continue)
            }
        }
    }

    async fn refuse_proposal(&self, reason: String) {
        tracing::info!(contract_id = %self.id, reason = %reason, "refusing close proposal");
        let _ = self
            .send_peer(PeerMessage::Settlement {
                contract_id: self.id,
                msg: SettlementMsg::Reject { reason },
            })
            .await;
    }

    /// Is `price` an acceptable close price, and is `payout` what it pays?
    fn check_proposal(&self, price: Price, payout: Payout) -> std::result::Result<(), String> {
        let c = self.loaded().map_err(|e| e.to_string())?;
        let expected = c.terms().payout_at(price).map_err(|e| e.to_string())?;
        if expected != payout {
            return Err(format!("payout does not match price {price}"));
        }
        let Some(quote) = self.last_quote else {
            return Err(CfdError::NoQuote.to_string());
        };
        let mark = quote.price.into_decimal();
        let tolerance = self.deps.config.settlement.close_price_tolerance();
        if (price.into_decimal() - mark).abs() > mark * tolerance {
            return Err(format!(
                "price {price} is more than {} bps from mark {}",
                self.deps.config.settlement.close_price_tolerance_bps, quote.price
            ));
        }
        Ok(())
    }

    async fn on_proposal(&mut self, price: Price, payout: Payout, peer_sig: Signature) -> Result<Flow> {
        if self.proposal.is_some() {
            self.refuse_proposal("own proposal pending".into()).await;
            return Ok(Flow::Continue);
        }
        if let Err(reason) = self.check_proposal(price, payout) {
            self.refuse_proposal(reason).await;
            return Ok(Flow::Continue);
        }
        let (tx, peer) = {
            let c = self.loaded()?;
            let dlc = c.dlc().ok_or_else(|| not_loaded(self.id))?;
            (dlc.template.close_tx(&payout), peer_identity(c.role, &dlc.template))
        };
        if let Err(e) = tx.verify(&peer, CLOSE_TAG, &[], &peer_sig, "close proposal") {
            return self.violation(e.to_string()).await;
        }
        let own_sig = self.deps.wallet.sign_close(&tx).await?;
        let signed = self.signed_close(tx, own_sig, peer_sig)?;
        let _ = self
            .send_peer(PeerMessage::Settlement {
                contract_id: self.id,
                msg: SettlementMsg::Accept { sig: own_sig },
            })
            .await;
        self.settle(ClosingTx {
            path: ClosePath::Collaborative,
            price,
            payout,
            tx: signed,
        })
        .await
    }

    async fn on_close_accepted(&mut self, peer_sig: Signature) -> Result<Flow> {
        let Some(proposal) = self.proposal.take() else {
            tracing::warn!(contract_id = %self.id, "unsolicited close acceptance ignored");
            return Ok(Flow::Continue);
        };
        let peer = {
            let c = self.loaded()?;
            let dlc = c.dlc().ok_or_else(|| not_loaded(self.id))?;
            peer_identity(c.role, &dlc.template)
        };
        if let Err(e) = proposal
            .tx
            .verify(&peer, CLOSE_TAG, &[], &peer_sig, "close acceptance")
        {
            return self.violation(e.to_string()).await;
        }
        let signed = self.signed_close(proposal.tx, proposal.own_sig, peer_sig)?;
        self.settle(ClosingTx {
            path: ClosePath::Collaborative,
            price: proposal.price,
            payout: proposal.payout,
            tx: signed,
        })
        .await
    }

    fn signed_close(&self, tx: Transaction, own_sig: Signature, peer_sig: Signature) -> Result<SignedTransaction> {
        let c = self.loaded()?;
        let dlc = c.dlc().ok_or_else(|| not_loaded(self.id))?;
        let (maker_sig, taker_sig) = match c.role {
            Role::Maker => (own_sig, peer_sig),
            Role::Taker => (peer_sig, own_sig),
        };
        Ok(SignedTransaction {
            tx,
            signatures: vec![
                (dlc.template.maker.identity, maker_sig),
                (dlc.template.taker.identity, taker_sig),
            ],
        })
    }

    async fn close_unilaterally(&mut self, why: &str) -> Result<Flow> {
        let closing = {
            let c = self.loaded()?;
            let Some(dlc) = c.dlc() else {
                return Ok(Flow::Continue);
            };
            let price = self.last_quote.map_or(c.initial_price, |q| q.price);
            let (bucket, tx) = dlc
                .signed_cet_for(price)
                .ok_or_else(|| CfdError::Internal(format!("no CET covers {price}")))?;
            ClosingTx {
                path: ClosePath::Unilateral,
                price,
                payout: bucket.payout,
                tx,
            }
        };
        tracing::warn!(contract_id = %self.id, price = %closing.price, reason = why, "closing unilaterally");
        self.settle(closing).await
    }

    async fn close_attested(&mut self, attestation: &OracleAttestation) -> Result<Flow> {
        let closing = {
            let c = self.loaded()?;
            let dlc = c.dlc().ok_or_else(|| not_loaded(self.id))?;
            let (bucket, tx) = dlc.signed_cet_for(attestation.price).ok_or_else(|| {
                CfdError::Internal(format!("no CET covers {}", attestation.price))
            })?;
            ClosingTx {
                path: ClosePath::OracleAttested,
                price: attestation.price,
                payout: bucket.payout,
                tx,
            }
        };
        tracing::info!(contract_id = %self.id, price = %closing.price, "settling at the attested price");
        self.settle(closing).await
    }

    async fn settle(&mut self, closing: ClosingTx) -> Result<Flow> {
        self.disarm();
        self.proposal = None;
        self.rollover = None;
        if let Some(timer) = self.chain_timer.take() {
            timer.abort();
        }
        self.transition(ContractState::PendingClose {
            closing: Box::new(closing.clone()),
        })
        .await?;
        self.publish_closing(closing).await
    }

    async fn publish_closing(&mut self, closing: ClosingTx) -> Result<Flow> {
        let txid = closing.tx.txid();
        match self.deps.wallet.broadcast(closing.tx.clone()).await {
            Ok(_) => {
                self.transition(ContractState::Closed {
                    outcome: closing.outcome(),
                })
                .await?;
                Ok(Flow::Stop)
            }
            Err(e) => {
                if let Some(observed) = self.conflicting_close(&closing).await {
                    tracing::warn!(
                        contract_id = %self.id,
                        ours = %txid,
                        theirs = %observed.tx.txid(),
                        "counterparty closed first"
                    );
                    // Already on chain; this only credits our side of it.
                    let _ = self.deps.wallet.broadcast(observed.tx.clone()).await;
                    self.transition(ContractState::Closed {
                        outcome: observed.outcome(),
                    })
                    .await?;
                    return Ok(Flow::Stop);
                }
                self.fail(
                    FailureReason::BroadcastFailed {
                        txid,
                        reason: e.to_string(),
                    },
                    false,
                )
                .await
            }
        }
    }

    /// A different closing transaction already spending our funding output.
    async fn conflicting_close(&self, ours: &ClosingTx) -> Option<ClosingTx> {
        let funding = *ours.tx.tx.inputs.first()?;
        let spend = self.deps.wallet.spender_of(funding).await.ok().flatten()?;
        if spend.txid() == ours.tx.txid() {
            return None;
        }
        let dlc = self.last_dlc().ok().flatten()?;
        self.observed_closing(&dlc, spend).ok().flatten()
    }

    // -- rollover ---------------------------------------------------------------

    /// The furthest expiry a rollover may move `c` to, in whole seconds.
    fn next_settlement_time(&self, c: &Contract) -> Result<DateTime<Utc>> {
        let interval = chrono::Duration::from_std(self.deps.config.settlement.rollover_interval)
            .map_err(|e| CfdError::Configuration(format!("rollover interval: {e}")))?;
        c.expiry
            .max(Utc::now())
            .checked_add_signed(interval)
            .and_then(|at| DateTime::from_timestamp(at.timestamp(), 0))
            .ok_or_else(|| CfdError::Configuration("rollover interval out of range".into()))
    }

    /// Re-sign the CETs against the next settlement event and ask the maker to follow.
    async fn start_rollover(&mut self, ctx: &Context<ContractMsg>) -> Result<()> {
        let (settlement_time, oracle_event_id, template) = {
            let c = self.loaded()?;
            let wrong = |state: String| CfdError::WrongState {
                operation: "rollover".into(),
                state,
            };
            let Some(dlc) = c.dlc() else {
                return Err(wrong(c.state.to_string()));
            };
            if c.role != Role::Taker {
                return Err(wrong("only the taker proposes a rollover".into()));
            }
            if c.is_expired(Utc::now()) {
                return Err(wrong(format!("expired at {}", c.expiry)));
            }
            if self.proposal.is_some() || self.rollover.is_some() {
                return Err(wrong("another proposal pending".into()));
            }
            let settlement_time = self.next_settlement_time(c)?;
            let event = OracleEventId::btc_usd_at(settlement_time);
            let template = DlcTemplate::build(
                &c.terms(),
                &event,
                dlc.template.maker.clone(),
                dlc.template.taker.clone(),
                self.deps.config.settlement.n_payouts,
            )?;
            (settlement_time, event, template)
        };
        let own_sigs = self.deps.wallet.sign_cets(&template).await?;
        self.send_peer(PeerMessage::Rollover {
            contract_id: self.id,
            msg: RolloverMsg::Propose {
                settlement_time,
                oracle_event_id: oracle_event_id.clone(),
                sigs: own_sigs.clone(),
            },
        })
        .await?;
        tracing::info!(contract_id = %self.id, settlement_time = %settlement_time, "rollover proposed");
        self.rollover = Some(PendingRollover {
            settlement_time,
            oracle_event_id,
            template,
            own_sigs,
        });
        self.arm(ctx, Phase::Rollover);
        Ok(())
    }

    async fn on_rollover(&mut self, ctx: &Context<ContractMsg>, msg: RolloverMsg) -> Result<Flow> {
        match msg {
            RolloverMsg::Propose {
                settlement_time,
                oracle_event_id,
                sigs,
            } => {
                let answer = match self
                    .accept_rollover(settlement_time, oracle_event_id, sigs)
                    .await
                {
                    Ok(sigs) => {
                        self.watch_event(ctx).await?;
                        RolloverMsg::Accept { sigs }
                    }
                    Err(e) => {
                        tracing::info!(contract_id = %self.id, error = %e, "refusing rollover");
                        RolloverMsg::Reject {
                            reason: e.to_string(),
                        }
                    }
                };
                let _ = self
                    .send_peer(PeerMessage::Rollover {
                        contract_id: self.id,
                        msg: answer,
                    })
                    .await;
                Ok(Flow::Continue)
            }
            RolloverMsg::Accept { sigs } => self.on_rollover_accepted(ctx, sigs).await,
            RolloverMsg::Reject { reason } => {
                if self.rollover.take().is_some() {
                    self.disarm();
                    tracing::warn!(contract_id = %self.id, reason = %reason, "rollover rejected");
                }
                Ok(Flow::Continue)
            }
        }
    }

    /// Maker side: check the proposal, counter-sign, record. Returns our signatures.
    async fn accept_rollover(
        &mut self,
        settlement_time: DateTime<Utc>,
        oracle_event_id: OracleEventId,
        taker_sigs: Vec<Signature>,
    ) -> Result<Vec<Signature>> {
        let (template, current) = {
            let c = self.loaded()?;
            let wrong = |state: String| CfdError::WrongState {
                operation: "rollover".into(),
                state,
            };
            let Some(dlc) = c.dlc() else {
                return Err(wrong(c.state.to_string()));
            };
            if c.role != Role::Maker {
                return Err(wrong("only the taker proposes a rollover".into()));
            }
            if c.is_expired(Utc::now()) {
                return Err(wrong(format!("expired at {}", c.expiry)));
            }
            if self.proposal.is_some() {
                return Err(wrong("close proposal pending".into()));
            }
            let latest = self.next_settlement_time(c)?;
            if settlement_time <= c.expiry || settlement_time > latest {
                return Err(CfdError::InvalidTerms {
                    reason: format!(
                        "settlement time {settlement_time} outside ({}, {latest}]",
                        c.expiry
                    ),
                });
            }
            let expected = OracleEventId::btc_usd_at(settlement_time);
            if oracle_event_id != expected {
                return Err(CfdError::OracleEventMismatch {
                    expected: expected.to_string(),
                    actual: oracle_event_id.to_string(),
                });
            }
            let template = DlcTemplate::build(
                &c.terms(),
                &oracle_event_id,
                dlc.template.maker.clone(),
                dlc.template.taker.clone(),
                self.deps.config.settlement.n_payouts,
            )?;
            (template, dlc.clone())
        };
        template.verify_cets(&current.template.taker.identity, &taker_sigs)?;
        let own_sigs = self.deps.wallet.sign_cets(&template).await?;
        let dlc = Dlc {
            template,
            maker_cet_sigs: own_sigs.clone(),
            taker_cet_sigs: taker_sigs,
            maker_funding_sig: current.maker_funding_sig,
            taker_funding_sig: current.taker_funding_sig,
        };
        self.roll_over(Rollover {
            expiry: settlement_time,
            oracle_event_id,
            dlc: Box::new(dlc),
        })
        .await?;
        Ok(own_sigs)
    }

    /// Taker side: the maker counter-signed our rollover.
    async fn on_rollover_accepted(&mut self, ctx: &Context<ContractMsg>, maker_sigs: Vec<Signature>) -> Result<Flow> {
        let Some(pending) = self.rollover.take() else {
            tracing::warn!(contract_id = %self.id, "unsolicited rollover acceptance ignored");
            return Ok(Flow::Continue);
        };
        self.disarm();
        let Some(current) = self.loaded()?.dlc().cloned() else {
            return Ok(Flow::Continue);
        };
        if let Err(e) = pending
            .template
            .verify_cets(&current.template.maker.identity, &maker_sigs)
        {
            tracing::error!(contract_id = %self.id, error = %e, "rollover signatures invalid, keeping current expiry");
            return Ok(Flow::Continue);
        }
        let dlc = Dlc {
            template: pending.template,
            maker_cet_sigs: maker_sigs,
            taker_cet_sigs: pending.own_sigs,
            maker_funding_sig: current.maker_funding_sig,
            taker_funding_sig: current.taker_funding_sig,
        };
        self.roll_over(Rollover {
            expiry: pending.settlement_time,
            oracle_event_id: pending.oracle_event_id,
            dlc: Box::new(dlc),
        })
        .await?;
        self.watch_event(ctx).await?;
        Ok(Flow::Continue)
    }

    /// Persist `rollover`, then apply it.
    async fn roll_over(&mut self, rollover: Rollover) -> Result<()> {
        let Some(contract) = self.contract.as_mut() else {
            return Err(not_loaded(self.id));
        };
        contract.check_rollover(&rollover)?;
        let seq = contract.next_seq();
        self.deps
            .store
            .append_rollover(contract.id, seq, &rollover)
            .await?;
        contract.apply_rollover(seq, rollover)?;
        tracing::info!(
            contract_id = %contract.id,
            role = %contract.role,
            expiry = %contract.expiry,
            event_id = %contract.oracle_event_id,
            version = contract.version,
            "contract rolled over"
        );
        if let Err(e) = self.deps.projection.update(contract).await {
            tracing::warn!(contract_id = %self.id, error = %e, "projection not updated");
        }
        self.pending_attestation = None;
        Ok(())
    }

    // -- restart ----------------------------------------------------------------

    async fn resume(&mut self, ctx: &Context<ContractMsg>) -> Result<Flow> {
        let contract = match self.deps.store.replay(self.id) {
            Ok(contract) => contract,
            // Crashed before the contract was ever recorded.
            Err(CfdError::ContractNotFound(_)) => return Ok(Flow::Stop),
            Err(e) => return Err(e),
        };
        let state = contract.state.clone();
        self.publish(&contract).await;
        self.contract = Some(contract);
        tracing::info!(contract_id = %self.id, state = %state, restarts = ctx.restarts(), "contract resumed");

        if state.is_terminal() {
            return Ok(Flow::Stop);
        }
        if state.is_setup_phase() {
            return self
                .fail(
                    FailureReason::Interrupted {
                        state: state.label().to_string(),
                    },
                    true,
                )
                .await;
        }
        match state {
            ContractState::Open { dlc } => {
                self.restore_funding(&dlc).await?;
                self.enter_open(ctx).await
            }
            ContractState::PendingClose { closing } => {
                if let Some(dlc) = self.last_dlc()? {
                    self.restore_funding(&dlc).await?;
                }
                self.publish_closing(*closing).await
            }
            _ => Ok(Flow::Stop),
        }
    }

    /// Re-lock our funding inputs in a freshly started wallet.
    async fn restore_funding(&self, dlc: &Dlc) -> Result<()> {
        let own = match self.loaded()?.role {
            Role::Maker => &dlc.template.maker,
            Role::Taker => &dlc.template.taker,
        };
        let amount = self.reservation_amount()?;
        if let Err(e) = self
            .deps
            .wallet
            .restore_committed(self.id, own.inputs.clone(), amount, dlc.funding_txid())
            .await
        {
            tracing::error!(contract_id = %self.id, error = %e, "funding inputs not restored");
        }
        Ok(())
    }
}

#[async_trait]
impl Actor for ContractActor {
    type Message = ContractMsg;

    async fn started(&mut self, ctx: &Context<ContractMsg>) -> Result<Flow> {
        match self.start.take() {
            Some(Start::Maker { offer, request, taker }) => self.begin_maker(ctx, offer, request, taker).await,
            Some(Start::Taker {
                offer,
                request,
                maker,
                reply,
            }) => self.begin_taker(ctx, offer, request, maker, reply).await,
            Some(Start::Resume) | None => self.resume(ctx).await,
        }
    }

    async fn handle(&mut self, msg: ContractMsg, ctx: &Context<ContractMsg>) -> Result<Flow> {
        match msg {
            ContractMsg::FromPeer(msg) => self.on_peer(ctx, msg).await,
            ContractMsg::PeerConnected(connection) => {
                self.peer = Some(connection);
                Ok(Flow::Continue)
            }
            ContractMsg::PeerDisconnected => {
                self.peer = None;
                if self.loaded()?.state.is_setup_phase() {
                    self.fail(FailureReason::PeerDisconnected, false).await
                } else {
                    Ok(Flow::Continue)
                }
            }
            ContractMsg::PeerMisbehaved(reason) => {
                if self.loaded()?.state.is_setup_phase() {
                    self.fail(FailureReason::ProtocolViolation(reason), true).await
                } else {
                    tracing::warn!(contract_id = %self.id, reason = %reason, "peer misbehaviour outside setup ignored");
                    Ok(Flow::Continue)
                }
            }
            ContractMsg::Timeout { generation, .. } if generation != self.generation => Ok(Flow::Continue),
            ContractMsg::Timeout { phase, .. } => self.on_timeout(phase).await,
            ContractMsg::Expired => self.on_expired().await,
            ContractMsg::Quote(quote) => self.on_quote(quote).await,
            ContractMsg::Attestation(attestation) => self.on_attestation(attestation).await,
            ContractMsg::ProposeClose { price, reply } => {
                let result = self.propose_close(ctx, price).await;
                let _ = reply.send(result);
                Ok(Flow::Continue)
            }
            ContractMsg::Rollover(reply) => {
                let result = self.start_rollover(ctx).await;
                let _ = reply.send(result);
                Ok(Flow::Continue)
            }
            ContractMsg::CheckChain => self.on_check_chain(ctx).await,
        }
    }

    async fn stopped(&mut self) {
        self.disarm();
        for timer in [self.expiry_timer.take(), self.chain_timer.take()]
            .into_iter()
            .flatten()
        {
            timer.abort();
        }
        let _ = self.deps.oracle.unmonitor(self.id).await;
    }
}

impl ContractActor {
    async fn on_peer(&mut self, ctx: &Context<ContractMsg>, msg: PeerMessage) -> Result<Flow> {
        let (role, state) = {
            let c = self.loaded()?;
            (c.role, c.state.clone())
        };
        let awaiting_answer = role == Role::Taker && state == ContractState::Requested;
        match msg {
            PeerMessage::Accept { .. } if awaiting_answer => self.on_accepted(ctx).await,
            PeerMessage::Reject { reason, .. } if awaiting_answer => {
                self.reject(CfdError::RejectedByPeer { reason }.to_string(), false)
                    .await
            }
            PeerMessage::Setup { msg, .. } if state == ContractState::SetupInProgress => self.on_setup(ctx, msg).await,
            PeerMessage::Settlement { msg, .. } => self.on_settlement(msg).await,
            PeerMessage::Rollover { msg, .. } => self.on_rollover(ctx, msg).await,
            PeerMessage::Abort { reason, .. } if state.is_setup_phase() => {
                self.fail(FailureReason::PeerAborted(reason), false).await
            }
            PeerMessage::Abort { reason, .. } => {
                tracing::warn!(contract_id = %self.id, state = %state, reason = %reason, "abort ignored");
                Ok(Flow::Continue)
            }
            other => {
                self.violation(format!("unexpected {} in {}", other.name(), state.label()))
                    .await
            }
        }
    }

    async fn on_timeout(&mut self, phase: Phase) -> Result<Flow> {
        match phase {
            Phase::CollaborativeClose => {
                if self.proposal.take().is_some() {
                    self.close_unilaterally("close proposal unanswered").await
                } else {
                    Ok(Flow::Continue)
                }
            }
            Phase::Rollover => {
                if self.rollover.take().is_some() {
                    tracing::warn!(contract_id = %self.id, "rollover unanswered, keeping current expiry");
                }
                Ok(Flow::Continue)
            }
            _ if self.loaded()?.state.is_setup_phase() => self.fail(FailureReason::Timeout(phase), true).await,
            _ => Ok(Flow::Continue),
        }
    }
}
