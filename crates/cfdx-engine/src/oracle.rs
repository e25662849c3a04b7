//! Oracle-feed actor.
//!
//! Holds the latest mark price (published on the `quote` feed) and every
//! verified attestation. Open contracts register interest in their oracle
//! event and get quotes and matching attestations delivered to their
//! mailboxes. An attestation that arrives before a contract registers is
//! kept and handed over on registration.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use cfdx_types::{CfdError, ContractId, OracleAttestation, OracleEventId, Quote, Result};
use ed25519_dalek::VerifyingKey;
use tokio::sync::{Mutex, watch};

use crate::actor::{Actor, Address, Context, Flow, Reply};
use crate::contract::ContractMsg;

pub enum OracleMsg {
    Quote(Quote),
    Attestation {
        attestation: OracleAttestation,
        reply: Reply<Result<()>>,
    },
    /// Register interest; answered once the latest quote and any stored
    /// attestation are in the contract's mailbox.
    Monitor {
        contract_id: ContractId,
        event_id: OracleEventId,
        contract: Address<ContractMsg>,
        reply: Reply<()>,
    },
    Unmonitor(ContractId),
}

struct Monitor {
    event_id: OracleEventId,
    contract: Address<ContractMsg>,
}

/// Attestations and registrations, kept across restarts.
#[derive(Default)]
pub struct OracleBook {
    attestations: BTreeMap<OracleEventId, OracleAttestation>,
    monitors: HashMap<ContractId, Monitor>,
}

pub type OracleCell = Arc<Mutex<OracleBook>>;

pub struct OracleActor {
    oracle_key: VerifyingKey,
    book: OracleCell,
    quotes: watch::Sender<Option<Quote>>,
}

impl OracleActor {
    #[must_use]
    pub fn new(oracle_key: VerifyingKey, book: OracleCell, quotes: watch::Sender<Option<Quote>>) -> Self {
        Self {
            oracle_key,
            book,
            quotes,
        }
    }

    fn on_quote(&self, book: &mut OracleBook, quote: Quote) {
        let stale = self
            .quotes
            .borrow()
            .is_some_and(|current| current.timestamp > quote.timestamp);
        if stale {
            tracing::debug!(price = %quote.price, "ignoring out-of-date quote");
            return;
        }
        self.quotes.send_replace(Some(quote));
        book.monitors.retain(|contract_id, monitor| {
            if monitor.contract.is_closed() {
                return false;
            }
            if let Err(e) = monitor.contract.try_send(ContractMsg::Quote(quote)) {
                tracing::warn!(contract_id = %contract_id, error = %e, "quote not delivered");
            }
            true
        });
    }

    fn on_attestation(&self, book: &mut OracleBook, attestation: OracleAttestation) -> Result<()> {
        attestation.verify(&self.oracle_key)?;
        if let Some(known) = book.attestations.get(&attestation.event_id) {
            if known.price != attestation.price {
                return Err(CfdError::AttestationInvalid {
                    reason: format!(
                        "event {} already attested at {}, got {}",
                        attestation.event_id, known.price, attestation.price
                    ),
                });
            }
            return Ok(());
        }
        tracing::info!(event_id = %attestation.event_id, price = %attestation.price, "attestation received");
        book.attestations
            .insert(attestation.event_id.clone(), attestation.clone());

        book.monitors.retain(|contract_id, monitor| {
            if monitor.event_id != attestation.event_id {
                return true;
            }
            if monitor.contract.is_closed() {
                return false;
            }
            if let Err(e) = monitor.contract.try_send(ContractMsg::Attestation(attestation.clone())) {
                tracing::warn!(contract_id = %contract_id, error = %e, "attestation not delivered");
            }
            true
        });
        Ok(())
    }

    fn on_monitor(
        &self,
        book: &mut OracleBook,
        contract_id: ContractId,
        event_id: OracleEventId,
        contract: Address<ContractMsg>,
    ) {
        if let Some(quote) = *self.quotes.borrow() {
            let _ = contract.try_send(ContractMsg::Quote(quote));
        }
        if let Some(attestation) = book.attestations.get(&event_id) {
            let _ = contract.try_send(ContractMsg::Attestation(attestation.clone()));
        }
        tracing::debug!(contract_id = %contract_id, event_id = %event_id, "monitoring oracle event");
        book.monitors.insert(contract_id, Monitor { event_id, contract });
    }
}

#[async_trait]
impl Actor for OracleActor {
    type Message = OracleMsg;

    async fn handle(&mut self, msg: OracleMsg, _ctx: &Context<OracleMsg>) -> Result<Flow> {
        let mut book = self.book.lock().await;
        match msg {
            OracleMsg::Quote(quote) => self.on_quote(&mut book, quote),
            OracleMsg::Attestation { attestation, reply } => {
                let result = self.on_attestation(&mut book, attestation);
                if let Err(e) = &result {
                    tracing::warn!(error = %e, "attestation refused");
                }
                let _ = reply.send(result);
            }
            OracleMsg::Monitor {
                contract_id,
                event_id,
                contract,
                reply,
            } => {
                self.on_monitor(&mut book, contract_id, event_id, contract);
                let _ = reply.send(());
            }
            OracleMsg::Unmonitor(contract_id) => {
                book.monitors.remove(&contract_id);
            }
        }
        Ok(Flow::Continue)
    }
}

/// Typed front for the oracle mailbox.
#[derive(Debug, Clone)]
pub struct OracleHandle {
    address: Address<OracleMsg>,
}

impl OracleHandle {
    #[must_use]
    pub fn new(address: Address<OracleMsg>) -> Self {
        Self { address }
    }

    pub async fn push_quote(&self, quote: Quote) -> Result<()> {
        self.address.send(OracleMsg::Quote(quote)).await
    }

    /// # Errors
    /// `AttestationInvalid` if the oracle's signature does not verify or
    /// the event was already attested at another price.
    pub async fn push_attestation(&self, attestation: OracleAttestation) -> Result<()> {
        self.address
            .ask(|reply| OracleMsg::Attestation { attestation, reply })
            .await?
    }

    pub async fn monitor(&self, contract_id: ContractId, event_id: OracleEventId, contract: Address<ContractMsg>) -> Result<()> {
        self.address
            .ask(|reply| OracleMsg::Monitor {
                contract_id,
                event_id,
                contract,
                reply,
            })
            .await
    }

    pub async fn unmonitor(&self, contract_id: ContractId) -> Result<()> {
        self.address.send(OracleMsg::Unmonitor(contract_id)).await
    }
}
