//! Wallet actor: the single owner of the UTXO set.
//!
//! Contract actors reserve, sign, commit and release through
//! [`WalletHandle`]. Broadcasts run in their own task so a slow retry loop
//! never blocks reservations; a successful broadcast credits any output
//! paying our address. Chain lookups run the same way.

use std::sync::Arc;

use async_trait::async_trait;
use cfdx_types::{
    Amount, ContractId, DlcTemplate, OutPoint, PartyParams, Reservation, Result, SignedTransaction,
    Transaction, Txid, Utxo, tx::CLOSE_TAG,
};
use cfdx_wallet::{Blockchain, WalletCoordinator, WalletInfo, broadcast_with_retry};
use ed25519_dalek::{Signature, VerifyingKey};
use tokio::sync::{Mutex, watch};

use crate::actor::{Actor, Address, Context, Flow, Reply};

pub enum WalletMsg {
    Deposit(Utxo),
    Reserve {
        contract_id: ContractId,
        amount: Amount,
        reply: Reply<Result<Reservation>>,
    },
    PartyParams {
        contract_id: ContractId,
        margin: Amount,
        reply: Reply<Result<PartyParams>>,
    },
    SignCets {
        template: Box<DlcTemplate>,
        reply: Reply<Vec<Signature>>,
    },
    SignFunding {
        template: Box<DlcTemplate>,
        reply: Reply<Signature>,
    },
    SignClose {
        tx: Transaction,
        reply: Reply<Signature>,
    },
    Commit {
        contract_id: ContractId,
        funding: Transaction,
        reply: Reply<Result<bool>>,
    },
    Release {
        contract_id: ContractId,
        reply: Reply<Result<bool>>,
    },
    RestoreCommitted {
        contract_id: ContractId,
        inputs: Vec<Utxo>,
        amount: Amount,
        funding_txid: Txid,
        reply: Reply<Result<()>>,
    },
    Broadcast {
        tx: SignedTransaction,
        reply: Reply<Result<Txid>>,
    },
    SpenderOf {
        outpoint: OutPoint,
        reply: Reply<Result<Option<SignedTransaction>>>,
    },
    /// A broadcast went through; credit what it pays us.
    Broadcasted(Transaction),
    Info(Reply<WalletInfo>),
    Identity(Reply<VerifyingKey>),
}

/// State shared by every incarnation of the wallet actor.
pub type WalletCell = Arc<Mutex<WalletCoordinator>>;

pub struct WalletActor {
    coordinator: WalletCell,
    chain: Arc<dyn Blockchain>,
    policy: cfdx_types::BroadcastPolicy,
    feed: watch::Sender<WalletInfo>,
}

impl WalletActor {
    #[must_use]
    pub fn new(
        coordinator: WalletCell,
        chain: Arc<dyn Blockchain>,
        policy: cfdx_types::BroadcastPolicy,
        feed: watch::Sender<WalletInfo>,
    ) -> Self {
        Self {
            coordinator,
            chain,
            policy,
            feed,
        }
    }

    fn publish(&self, wallet: &WalletCoordinator) {
        self.feed.send_replace(wallet.balance());
    }

    fn spawn_broadcast(&self, tx: SignedTransaction, reply: Reply<Result<Txid>>, this: Option<Address<WalletMsg>>) {
        let chain = Arc::clone(&self.chain);
        let policy = self.policy.clone();
        tokio::spawn(async move {
            let result = broadcast_with_retry(chain.as_ref(), &tx, &policy).await;
            if result.is_ok() {
                if let Some(this) = this {
                    // Credit before answering so callers see the payout.
                    let _ = this.send(WalletMsg::Broadcasted(tx.tx)).await;
                }
            }
            let _ = reply.send(result);
        });
    }
}

#[async_trait]
impl Actor for WalletActor {
    type Message = WalletMsg;

    async fn started(&mut self, _ctx: &Context<WalletMsg>) -> Result<Flow> {
        let wallet = self.coordinator.lock().await;
        self.publish(&wallet);
        Ok(Flow::Continue)
    }

    async fn handle(&mut self, msg: WalletMsg, ctx: &Context<WalletMsg>) -> Result<Flow> {
        let mut wallet = self.coordinator.lock().await;
        match msg {
            WalletMsg::Deposit(utxo) => {
                wallet.deposit(utxo);
                self.publish(&wallet);
            }
            WalletMsg::Reserve {
                contract_id,
                amount,
                reply,
            } => {
                let result = wallet.reserve(contract_id, amount);
                if let Err(e) = &result {
                    tracing::warn!(contract_id = %contract_id, error = %e, "reservation refused");
                }
                self.publish(&wallet);
                let _ = reply.send(result);
            }
            WalletMsg::PartyParams {
                contract_id,
                margin,
                reply,
            } => {
                let _ = reply.send(wallet.party_params(contract_id, margin));
            }
            WalletMsg::SignCets { template, reply } => {
                let _ = reply.send(template.sign_cets(wallet.signing_key()));
            }
            WalletMsg::SignFunding { template, reply } => {
                let _ = reply.send(template.sign_funding(wallet.signing_key()));
            }
            WalletMsg::SignClose { tx, reply } => {
                let _ = reply.send(tx.sign(wallet.signing_key(), CLOSE_TAG, &[]));
            }
            WalletMsg::Commit {
                contract_id,
                funding,
                reply,
            } => {
                let result = wallet.commit(contract_id, &funding);
                self.publish(&wallet);
                let _ = reply.send(result);
            }
            WalletMsg::Release { contract_id, reply } => {
                let result = wallet.release_if_reserved(contract_id);
                self.publish(&wallet);
                let _ = reply.send(result);
            }
            WalletMsg::RestoreCommitted {
                contract_id,
                inputs,
                amount,
                funding_txid,
                reply,
            } => {
                let result = wallet.restore_committed(contract_id, &inputs, amount, funding_txid);
                self.publish(&wallet);
                let _ = reply.send(result);
            }
            WalletMsg::Broadcast { tx, reply } => {
                self.spawn_broadcast(tx, reply, ctx.address());
            }
            WalletMsg::SpenderOf { outpoint, reply } => {
                let chain = Arc::clone(&self.chain);
                tokio::spawn(async move {
                    let _ = reply.send(chain.spender_of(&outpoint).await);
                });
            }
            WalletMsg::Broadcasted(tx) => {
                let credited = wallet.credit_outputs(&tx);
                if credited > Amount::ZERO {
                    tracing::info!(txid = %tx.txid(), credited = %credited, "payout credited");
                }
                self.publish(&wallet);
            }
            WalletMsg::Info(reply) => {
                let _ = reply.send(wallet.balance());
            }
            WalletMsg::Identity(reply) => {
                let _ = reply.send(wallet.identity());
            }
        }
        Ok(Flow::Continue)
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Typed front for the wallet actor's mailbox.
#[derive(Debug, Clone)]
pub struct WalletHandle {
    address: Address<WalletMsg>,
}

impl WalletHandle {
    #[must_use]
    pub fn new(address: Address<WalletMsg>) -> Self {
        Self { address }
    }

    pub async fn deposit(&self, utxo: Utxo) -> Result<()> {
        self.address.send(WalletMsg::Deposit(utxo)).await
    }

    pub async fn reserve(&self, contract_id: ContractId, amount: Amount) -> Result<Reservation> {
        self.address
            .ask(|reply| WalletMsg::Reserve {
                contract_id,
                amount,
                reply,
            })
            .await?
    }

    pub async fn party_params(&self, contract_id: ContractId, margin: Amount) -> Result<PartyParams> {
        self.address
            .ask(|reply| WalletMsg::PartyParams {
                contract_id,
                margin,
                reply,
            })
            .await?
    }

    pub async fn sign_cets(&self, template: &DlcTemplate) -> Result<Vec<Signature>> {
        let template = Box::new(template.clone());
        self.address
            .ask(|reply| WalletMsg::SignCets { template, reply })
            .await
    }

    pub async fn sign_funding(&self, template: &DlcTemplate) -> Result<Signature> {
        let template = Box::new(template.clone());
        self.address
            .ask(|reply| WalletMsg::SignFunding { template, reply })
            .await
    }

    pub async fn sign_close(&self, tx: &Transaction) -> Result<Signature> {
        let tx = tx.clone();
        self.address
            .ask(|reply| WalletMsg::SignClose { tx, reply })
            .await
    }

    pub async fn commit(&self, contract_id: ContractId, funding: &Transaction) -> Result<bool> {
        let funding = funding.clone();
        self.address
            .ask(|reply| WalletMsg::Commit {
                contract_id,
                funding,
                reply,
            })
            .await?
    }

    /// Release the contract's reservation if one is held.
    pub async fn release(&self, contract_id: ContractId) -> Result<bool> {
        self.address
            .ask(|reply| WalletMsg::Release { contract_id, reply })
            .await?
    }

    pub async fn restore_committed(
        &self,
        contract_id: ContractId,
        inputs: Vec<Utxo>,
        amount: Amount,
        funding_txid: Txid,
    ) -> Result<()> {
        self.address
            .ask(|reply| WalletMsg::RestoreCommitted {
                contract_id,
                inputs,
                amount,
                funding_txid,
                reply,
            })
            .await?
    }

    /// Broadcast with the configured retry policy.
    pub async fn broadcast(&self, tx: SignedTransaction) -> Result<Txid> {
        self.address
            .ask(|reply| WalletMsg::Broadcast { tx, reply })
            .await?
    }

    /// Ask the chain which transaction, if any, spent `outpoint`.
    pub async fn spender_of(&self, outpoint: OutPoint) -> Result<Option<SignedTransaction>> {
        self.address
            .ask(|reply| WalletMsg::SpenderOf { outpoint, reply })
            .await?
    }

    pub async fn info(&self) -> Result<WalletInfo> {
        self.address.ask(WalletMsg::Info).await
    }

    pub async fn identity(&self) -> Result<VerifyingKey> {
        self.address.ask(WalletMsg::Identity).await
    }
}
