//! The node: actor wiring shared by maker and taker daemons.
//!
//! ```text
//!                        ┌────────────┐
//!   connections ───────▶ │    node    │ ──▶ contract actors (one per CFD)
//!   take / close calls ─▶ │ (registry) │ ──▶ order book
//!                        └────────────┘
//!   contract actors ──▶ wallet · oracle · projection · store
//! ```
//!
//! The node actor routes peer messages to contract actors by contract id,
//! starts a contract actor for every take request, and on start resumes
//! every contract the store still holds open. Its registry lives in a cell
//! shared across incarnations, so a restarted node keeps routing to the
//! same contract actors.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use cfdx_store::Store;
use cfdx_transport::StaticKeypair;
use cfdx_types::{
    CfdError, Contract, ContractId, NodeConfig, Offer, OfferId, OracleAttestation, OrderRequest,
    PeerId, Price, Quote, Result, Role, Usd, Utxo,
};
use cfdx_wallet::{Blockchain, WalletCoordinator, WalletInfo};
use chrono::Utc;
use ed25519_dalek::{SigningKey, VerifyingKey};
use serde::Serialize;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;

use crate::actor::{Actor, Address, Context, Flow, Reply, forward_feed, mailbox};
use crate::connection::ConnectionMsg;
use crate::contract::{ContractActor, ContractDeps, ContractMsg, Start};
use crate::oracle::{OracleActor, OracleCell, OracleHandle};
use crate::order_book::{OrderBookActor, OrderBookHandle};
use crate::projection::{CfdProjection, ProjectionActor, ProjectionHandle, ProjectionMsg};
use crate::supervisor::{Exit, supervise};
use crate::wallet::{WalletActor, WalletCell, WalletHandle};
use crate::wire::PeerMessage;

pub enum NodeMsg {
    PeerConnected {
        peer: PeerId,
        connection_id: u64,
        connection: Address<ConnectionMsg>,
    },
    PeerDisconnected {
        peer: PeerId,
        connection_id: u64,
    },
    FromPeer {
        peer: PeerId,
        msg: PeerMessage,
    },
    /// The peer sent a frame that authenticated but did not decode.
    PeerMisbehaved {
        peer: PeerId,
        reason: String,
    },
    TakeOffer {
        offer_id: OfferId,
        quantity: Usd,
        reply: Reply<Result<ContractId>>,
    },
    ProposeClose {
        contract_id: ContractId,
        price: Price,
        reply: Reply<Result<()>>,
    },
    Rollover {
        contract_id: ContractId,
        reply: Reply<Result<()>>,
    },
    Status(Reply<RegistryStatus>),
    /// Close every connection and stop every contract actor.
    Shutdown(Reply<()>),
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

struct PeerEntry {
    connection_id: u64,
    connection: Address<ConnectionMsg>,
}

struct ContractEntry {
    address: Address<ContractMsg>,
    peer: PeerId,
    supervisor: JoinHandle<Exit>,
}

/// Who is connected and which contract actors are running.
#[derive(Default)]
pub struct Registry {
    peers: HashMap<PeerId, PeerEntry>,
    contracts: HashMap<ContractId, ContractEntry>,
}

impl Registry {
    fn prune(&mut self) {
        self.contracts.retain(|_, entry| !entry.address.is_closed());
    }

    fn connection(&self, peer: &PeerId) -> Option<Address<ConnectionMsg>> {
        self.peers.get(peer).map(|p| p.connection.clone())
    }

    fn contracts_of(&self, peer: PeerId) -> Vec<(ContractId, Address<ContractMsg>)> {
        self.contracts
            .iter()
            .filter(|(_, entry)| entry.peer == peer)
            .map(|(id, entry)| (*id, entry.address.clone()))
            .collect()
    }
}

/// Queue `msg` for a contract without waiting. The node never blocks on a
/// contract or connection mailbox: both may be waiting on the node.
fn deliver(contract_id: ContractId, contract: &Address<ContractMsg>, msg: ContractMsg) {
    if let Err(e) = contract.try_send(msg) {
        tracing::warn!(contract_id = %contract_id, error = %e, "message to contract dropped");
    }
}

fn send_to_peer(peer: PeerId, connection: &Address<ConnectionMsg>, msg: PeerMessage) {
    if let Err(e) = connection.try_send(ConnectionMsg::Send(msg)) {
        tracing::warn!(peer = %peer.short(), error = %e, "message to peer dropped");
    }
}

pub type RegistryCell = Arc<Mutex<Registry>>;

/// Counts reported by [`NodeMsg::Status`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistryStatus {
    pub peers: Vec<PeerId>,
    pub live_contracts: usize,
}

// ---------------------------------------------------------------------------
// NodeActor
// ---------------------------------------------------------------------------

pub struct NodeActor {
    role: Role,
    deps: ContractDeps,
    order_book: OrderBookHandle,
    registry: RegistryCell,
}

impl NodeActor {
    #[must_use]
    pub fn new(role: Role, deps: ContractDeps, order_book: OrderBookHandle, registry: RegistryCell) -> Self {
        Self {
            role,
            deps,
            order_book,
            registry,
        }
    }

    fn spawn_contract(
        &self,
        registry: &mut Registry,
        id: ContractId,
        peer: PeerId,
        start: Start,
    ) -> Address<ContractMsg> {
        let (address, mbox) = mailbox(format!("contract-{id}"));
        let deps = self.deps.clone();
        let connection = registry.connection(&peer);
        let mut start = Some(start);
        let supervisor = supervise(mbox, self.deps.config.supervisor.clone(), move || {
            ContractActor::new(
                deps.clone(),
                id,
                start.take().unwrap_or(Start::Resume),
                connection.clone(),
            )
        });
        registry.contracts.insert(
            id,
            ContractEntry {
                address: address.clone(),
                peer,
                supervisor,
            },
        );
        address
    }

    /// Start an actor for every contract the store still holds unfinished.
    async fn resume_all(&self) -> Result<usize> {
        let mut registry = self.registry.lock().await;
        registry.prune();
        let mut resumed = 0;
        for contract in self.deps.store.load_all()? {
            if contract.state.is_terminal() || registry.contracts.contains_key(&contract.id) {
                continue;
            }
            self.spawn_contract(&mut registry, contract.id, contract.counterparty, Start::Resume);
            resumed += 1;
        }
        Ok(resumed)
    }

    async fn on_peer_connected(&self, peer: PeerId, connection_id: u64, connection: Address<ConnectionMsg>) {
        let (previous, contracts) = {
            let mut registry = self.registry.lock().await;
            let previous = registry.peers.insert(
                peer,
                PeerEntry {
                    connection_id,
                    connection: connection.clone(),
                },
            );
            (previous, registry.contracts_of(peer))
        };
        if let Some(old) = previous {
            tracing::info!(peer = %peer.short(), "replacing an older connection");
            let _ = old.connection.try_send(ConnectionMsg::Close {
                reason: "superseded".into(),
            });
        }
        for (id, contract) in contracts {
            deliver(id, &contract, ContractMsg::PeerConnected(connection.clone()));
        }
    }

    async fn on_peer_disconnected(&self, peer: PeerId, connection_id: u64) -> Result<()> {
        let contracts = {
            let mut registry = self.registry.lock().await;
            if !registry
                .peers
                .get(&peer)
                .is_some_and(|p| p.connection_id == connection_id)
            {
                return Ok(());
            }
            registry.peers.remove(&peer);
            registry.contracts_of(peer)
        };
        tracing::info!(peer = %peer.short(), "peer gone");
        for (id, contract) in contracts {
            deliver(id, &contract, ContractMsg::PeerDisconnected);
        }
        if self.role == Role::Taker {
            self.order_book.received(None).await?;
        }
        Ok(())
    }

    async fn on_peer_misbehaved(&self, peer: PeerId, reason: String) {
        let contracts = self.registry.lock().await.contracts_of(peer);
        tracing::warn!(peer = %peer.short(), contracts = contracts.len(), reason = %reason, "peer misbehaved");
        for (id, contract) in contracts {
            deliver(id, &contract, ContractMsg::PeerMisbehaved(reason.clone()));
        }
    }

    async fn on_from_peer(&self, peer: PeerId, msg: PeerMessage) -> Result<()> {
        match msg {
            PeerMessage::CurrentOffer(offer) if self.role == Role::Taker => self.order_book.received(offer).await,
            PeerMessage::TakeOffer(request) if self.role == Role::Maker => self.on_take_request(peer, request).await,
            msg => {
                let Some(contract_id) = msg.contract_id() else {
                    tracing::warn!(peer = %peer.short(), msg = %msg, "unexpected message dropped");
                    return Ok(());
                };
                let target = {
                    let mut registry = self.registry.lock().await;
                    registry.prune();
                    registry
                        .contracts
                        .get(&contract_id)
                        .map(|entry| (entry.peer, entry.address.clone()))
                };
                match target {
                    Some((owner, contract)) if owner == peer => {
                        deliver(contract_id, &contract, ContractMsg::FromPeer(msg));
                    }
                    Some(_) => {
                        tracing::warn!(peer = %peer.short(), msg = %msg, "message for another peer's contract dropped");
                    }
                    None => tracing::debug!(peer = %peer.short(), msg = %msg, "no live contract, message dropped"),
                }
                Ok(())
            }
        }
    }

    async fn on_take_request(&self, peer: PeerId, request: OrderRequest) -> Result<()> {
        let contract_id = request.contract_id;
        let known = {
            let mut registry = self.registry.lock().await;
            registry.prune();
            registry.contracts.contains_key(&contract_id)
        };
        let refusal = if known || self.deps.store.last_seq(contract_id)? != 0 {
            Some(CfdError::DuplicateContract(contract_id).to_string())
        } else {
            match self.order_book.lookup(request.offer_id).await {
                Ok(offer) => {
                    tracing::info!(
                        contract_id = %contract_id,
                        peer = %peer.short(),
                        quantity = %request.quantity,
                        "take request"
                    );
                    let mut registry = self.registry.lock().await;
                    self.spawn_contract(
                        &mut registry,
                        contract_id,
                        peer,
                        Start::Maker {
                            offer,
                            request,
                            taker: peer,
                        },
                    );
                    None
                }
                Err(e) => Some(e.to_string()),
            }
        };

        if let Some(reason) = refusal {
            tracing::info!(contract_id = %contract_id, reason = %reason, "take request refused");
            let connection = self.registry.lock().await.connection(&peer);
            if let Some(connection) = connection {
                send_to_peer(peer, &connection, PeerMessage::Reject { contract_id, reason });
            }
        }
        Ok(())
    }

    async fn take_offer(&self, offer_id: OfferId, quantity: Usd, reply: Reply<Result<ContractId>>) {
        if self.role != Role::Taker {
            let _ = reply.send(Err(CfdError::WrongState {
                operation: "take_offer".into(),
                state: "maker".into(),
            }));
            return;
        }
        let maker = self.registry.lock().await.peers.keys().next().copied();
        let Some(maker) = maker else {
            let _ = reply.send(Err(CfdError::PeerDisconnected));
            return;
        };
        let offer = match self.order_book.lookup(offer_id).await {
            Ok(offer) => offer,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };
        let request = OrderRequest::new(offer_id, quantity);
        if let Err(e) = offer.validate_request(&request, Utc::now()) {
            let _ = reply.send(Err(e));
            return;
        }
        let id = request.contract_id;
        let mut registry = self.registry.lock().await;
        registry.prune();
        self.spawn_contract(
            &mut registry,
            id,
            maker,
            Start::Taker {
                offer,
                request,
                maker,
                reply,
            },
        );
    }

    /// Hand a caller's request to a running contract actor. Without one the
    /// caller learns the recorded state. A full contract mailbox drops the
    /// request, and the caller sees `ActorUnavailable`.
    async fn to_contract<F>(&self, contract_id: ContractId, operation: &str, reply: Reply<Result<()>>, request: F)
    where
        F: FnOnce(Reply<Result<()>>) -> ContractMsg,
    {
        let contract = {
            let mut registry = self.registry.lock().await;
            registry.prune();
            registry.contracts.get(&contract_id).map(|e| e.address.clone())
        };
        let Some(contract) = contract else {
            let error = match self.deps.store.replay(contract_id) {
                Ok(contract) => CfdError::WrongState {
                    operation: operation.into(),
                    state: contract.state.to_string(),
                },
                Err(e) => e,
            };
            let _ = reply.send(Err(error));
            return;
        };
        deliver(contract_id, &contract, request(reply));
    }

    async fn shutdown(&self) {
        let mut registry = self.registry.lock().await;
        for (_, peer) in registry.peers.drain() {
            let _ = peer.connection.try_send(ConnectionMsg::Close {
                reason: "shutting down".into(),
            });
        }
        for (_, entry) in registry.contracts.drain() {
            entry.supervisor.abort();
        }
    }
}

#[async_trait]
impl Actor for NodeActor {
    type Message = NodeMsg;

    async fn started(&mut self, ctx: &Context<NodeMsg>) -> Result<Flow> {
        let resumed = self.resume_all().await?;
        tracing::info!(role = %self.role, resumed, restarts = ctx.restarts(), "node started");
        Ok(Flow::Continue)
    }

    async fn handle(&mut self, msg: NodeMsg, _ctx: &Context<NodeMsg>) -> Result<Flow> {
        match msg {
            NodeMsg::PeerConnected {
                peer,
                connection_id,
                connection,
            } => self.on_peer_connected(peer, connection_id, connection).await,
            NodeMsg::PeerDisconnected { peer, connection_id } => {
                self.on_peer_disconnected(peer, connection_id).await?;
            }
            NodeMsg::FromPeer { peer, msg } => self.on_from_peer(peer, msg).await?,
            NodeMsg::PeerMisbehaved { peer, reason } => self.on_peer_misbehaved(peer, reason).await,
            NodeMsg::TakeOffer {
                offer_id,
                quantity,
                reply,
            } => self.take_offer(offer_id, quantity, reply).await,
            NodeMsg::ProposeClose {
                contract_id,
                price,
                reply,
            } => {
                self.to_contract(contract_id, "propose_close", reply, |reply| {
                    ContractMsg::ProposeClose { price, reply }
                })
                .await;
            }
            NodeMsg::Rollover { contract_id, reply } => {
                self.to_contract(contract_id, "rollover", reply, ContractMsg::Rollover)
                    .await;
            }
            NodeMsg::Status(reply) => {
                let mut registry = self.registry.lock().await;
                registry.prune();
                let _ = reply.send(RegistryStatus {
                    peers: registry.peers.keys().copied().collect(),
                    live_contracts: registry.contracts.len(),
                });
            }
            NodeMsg::Shutdown(reply) => {
                self.shutdown().await;
                let _ = reply.send(());
                return Ok(Flow::Stop);
            }
        }
        Ok(Flow::Continue)
    }
}

// ---------------------------------------------------------------------------
// Node: the assembled daemon
// ---------------------------------------------------------------------------

/// Long-lived keys of a daemon, kept in the store.
#[derive(Clone)]
pub struct NodeKeys {
    /// Authenticates the daemon in every Noise handshake.
    pub transport: StaticKeypair,
    /// Signs funding, CETs and close transactions.
    pub wallet: SigningKey,
}

impl NodeKeys {
    /// Load the keys from `store`, generating them on first use.
    pub async fn load_or_create(store: &Store) -> Result<Self> {
        let transport = store.key_or_insert("transport", rand::random).await?;
        let wallet = store.key_or_insert("wallet", rand::random).await?;
        Ok(Self {
            transport: StaticKeypair::from_bytes(transport),
            wallet: SigningKey::from_bytes(&wallet),
        })
    }
}

/// Live views published by the daemon.
#[derive(Clone)]
pub struct Feeds {
    /// Maker: the offer it publishes. Taker: the maker's latest offer.
    pub offer: watch::Receiver<Option<Offer>>,
    pub cfds: watch::Receiver<Vec<CfdProjection>>,
    pub wallet: watch::Receiver<WalletInfo>,
    pub quote: watch::Receiver<Option<Quote>>,
}

/// Liveness report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Health {
    pub role: Role,
    pub peer_id: PeerId,
    pub connected_peers: usize,
    pub live_contracts: usize,
    pub wallet: bool,
    pub order_book: bool,
}

/// Everything a running daemon needs, whichever side it plays.
pub struct Node {
    config: Arc<NodeConfig>,
    keys: NodeKeys,
    store: Store,
    address: Address<NodeMsg>,
    wallet: WalletHandle,
    order_book: OrderBookHandle,
    oracle: OracleHandle,
    feeds: Feeds,
    tasks: Vec<JoinHandle<Exit>>,
}

impl Node {
    /// Spawn every long-lived actor and resume unfinished contracts.
    ///
    /// Must be called inside a Tokio runtime.
    #[must_use]
    pub fn start(
        config: NodeConfig,
        keys: NodeKeys,
        oracle_key: VerifyingKey,
        chain: Arc<dyn Blockchain>,
        store: Store,
    ) -> Self {
        let config = Arc::new(config);
        let supervision = config.supervisor.clone();
        let mut tasks = Vec::new();

        let coordinator = WalletCoordinator::new(keys.wallet.clone());
        let (wallet_tx, wallet_rx) = watch::channel(coordinator.balance());
        let wallet_cell: WalletCell = Arc::new(Mutex::new(coordinator));
        let (wallet_addr, wallet_mbox) = mailbox("wallet");
        let policy = config.broadcast.clone();
        tasks.push(supervise(wallet_mbox, supervision.clone(), move || {
            WalletActor::new(Arc::clone(&wallet_cell), Arc::clone(&chain), policy.clone(), wallet_tx.clone())
        }));
        let wallet = WalletHandle::new(wallet_addr);

        let (offer_tx, offer_rx) = watch::channel(None);
        let (book_addr, book_mbox) = mailbox("order-book");
        tasks.push(supervise(book_mbox, supervision.clone(), move || {
            OrderBookActor::new(offer_tx.clone())
        }));
        let order_book = OrderBookHandle::new(book_addr);

        let (quote_tx, quote_rx) = watch::channel(None);
        let oracle_cell: OracleCell = Arc::default();
        let (oracle_addr, oracle_mbox) = mailbox("oracle");
        tasks.push(supervise(oracle_mbox, supervision.clone(), move || {
            OracleActor::new(oracle_key, Arc::clone(&oracle_cell), quote_tx.clone())
        }));
        let oracle = OracleHandle::new(oracle_addr);

        let (cfds_tx, cfds_rx) = watch::channel(Vec::new());
        let (projection_addr, projection_mbox) = mailbox("projection");
        let projection_store = store.clone();
        tasks.push(supervise(projection_mbox, supervision.clone(), move || {
            ProjectionActor::new(projection_store.clone(), cfds_tx.clone())
        }));
        forward_feed(quote_rx.clone(), projection_addr.clone(), |quote| {
            quote.map(ProjectionMsg::Quote)
        });
        let projection = ProjectionHandle::new(projection_addr);

        let deps = ContractDeps {
            store: store.clone(),
            wallet: wallet.clone(),
            oracle: oracle.clone(),
            projection,
            config: Arc::clone(&config),
        };
        let registry: RegistryCell = Arc::default();
        let role = config.role;
        let (address, node_mbox) = mailbox("node");
        let node_book = order_book.clone();
        tasks.push(supervise(node_mbox, supervision, move || {
            NodeActor::new(role, deps.clone(), node_book.clone(), Arc::clone(&registry))
        }));

        tracing::info!(role = %role, peer_id = %keys.transport.peer_id(), "node up");
        Self {
            config,
            keys,
            store,
            address,
            wallet,
            order_book,
            oracle,
            feeds: Feeds {
                offer: offer_rx,
                cfds: cfds_rx,
                wallet: wallet_rx,
                quote: quote_rx,
            },
            tasks,
        }
    }

    #[must_use]
    pub fn role(&self) -> Role {
        self.config.role
    }

    #[must_use]
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    #[must_use]
    pub fn peer_id(&self) -> PeerId {
        self.keys.transport.peer_id()
    }

    pub(crate) fn transport_keys(&self) -> StaticKeypair {
        self.keys.transport.clone()
    }

    pub(crate) fn address(&self) -> &Address<NodeMsg> {
        &self.address
    }

    pub(crate) fn order_book(&self) -> &OrderBookHandle {
        &self.order_book
    }

    #[must_use]
    pub fn feeds(&self) -> Feeds {
        self.feeds.clone()
    }

    #[must_use]
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Latest mark price from our price feed.
    pub async fn push_quote(&self, quote: Quote) -> Result<()> {
        self.oracle.push_quote(quote).await
    }

    /// # Errors
    /// `AttestationInvalid` if the signature does not verify or the event
    /// was already attested at another price.
    pub async fn push_attestation(&self, attestation: OracleAttestation) -> Result<()> {
        self.oracle.push_attestation(attestation).await
    }

    pub async fn deposit(&self, utxo: Utxo) -> Result<()> {
        self.wallet.deposit(utxo).await
    }

    pub async fn wallet_info(&self) -> Result<WalletInfo> {
        self.wallet.info().await
    }

    /// Offer a collaborative close of an open contract at `price`.
    ///
    /// # Errors
    /// - `ContractNotFound` for an unknown id
    /// - `WrongState` unless the contract is open with no proposal pending
    /// - `PeerDisconnected` if the proposal cannot be sent
    pub async fn propose_close(&self, contract_id: ContractId, price: Price) -> Result<()> {
        self.address
            .ask(|reply| NodeMsg::ProposeClose {
                contract_id,
                price,
                reply,
            })
            .await?
    }

    /// The contract as recorded in the store.
    pub fn contract(&self, contract_id: ContractId) -> Result<Contract> {
        self.store.replay(contract_id)
    }

    /// Current projections of every contract.
    #[must_use]
    pub fn cfds(&self) -> Vec<CfdProjection> {
        self.feeds.cfds.borrow().clone()
    }

    /// Ask every long-lived actor to answer.
    ///
    /// # Errors
    /// `ActorUnavailable` if the node actor itself is down.
    pub async fn health(&self) -> Result<Health> {
        let status = self.address.ask(NodeMsg::Status).await?;
        Ok(Health {
            role: self.role(),
            peer_id: self.peer_id(),
            connected_peers: status.peers.len(),
            live_contracts: status.live_contracts,
            wallet: self.wallet.info().await.is_ok(),
            order_book: self.order_book.current().await.is_ok(),
        })
    }

    /// Close connections and stop every actor. Recorded state is untouched.
    pub async fn shutdown(self) {
        let _ = self.address.ask(NodeMsg::Shutdown).await;
        for task in &self.tasks {
            task.abort();
        }
        tracing::info!(role = %self.config.role, "node stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor;
    use std::time::Duration;

    /// A node whose services have addresses but nothing behind them.
    fn idle_node(registry: RegistryCell) -> (Address<NodeMsg>, JoinHandle<Result<()>>) {
        let (wallet, _) = mailbox("wallet");
        let (oracle, _) = mailbox("oracle");
        let (projection, _) = mailbox("projection");
        let (order_book, _) = mailbox("order-book");
        let deps = ContractDeps {
            store: Store::temporary().unwrap(),
            wallet: WalletHandle::new(wallet),
            oracle: OracleHandle::new(oracle),
            projection: ProjectionHandle::new(projection),
            config: Arc::new(NodeConfig::new(Role::Maker, "unused")),
        };
        let node = NodeActor::new(Role::Maker, deps, OrderBookHandle::new(order_book), registry);
        let (address, mbox) = mailbox("node");
        let ctx = Context::new(&mbox, 0);
        (address, tokio::spawn(actor::run(node, mbox, ctx)))
    }

    #[tokio::test]
    async fn full_contract_mailbox_does_not_stall_the_node() {
        let registry: RegistryCell = Arc::default();
        let peer = StaticKeypair::from_bytes([3; 32]).peer_id();
        let contract_id = ContractId::new();
        // Nobody drains this mailbox.
        let (contract, _stuck) = mailbox::<ContractMsg>("contract-stuck");
        registry.lock().await.contracts.insert(
            contract_id,
            ContractEntry {
                address: contract,
                peer,
                supervisor: tokio::spawn(async { Exit::Stopped }),
            },
        );
        let (node, _task) = idle_node(Arc::clone(&registry));

        for _ in 0..=cfdx_types::constants::MAILBOX_CAPACITY {
            node.send(NodeMsg::FromPeer {
                peer,
                msg: PeerMessage::Abort {
                    contract_id,
                    reason: "noise".into(),
                },
            })
            .await
            .unwrap();
        }
        let status = tokio::time::timeout(Duration::from_secs(5), node.ask(NodeMsg::Status))
            .await
            .expect("node stalled on a full contract mailbox")
            .unwrap();
        assert_eq!(status.live_contracts, 1);
    }

    #[tokio::test]
    async fn misbehaving_peer_is_reported_to_its_contracts() {
        let registry: RegistryCell = Arc::default();
        let peer = StaticKeypair::from_bytes([4; 32]).peer_id();
        let other = StaticKeypair::from_bytes([5; 32]).peer_id();
        let (ours, ours_mbox) = mailbox::<ContractMsg>("contract-ours");
        let (theirs, theirs_mbox) = mailbox::<ContractMsg>("contract-theirs");
        {
            let mut registry = registry.lock().await;
            for (address, owner) in [(ours, peer), (theirs, other)] {
                registry.contracts.insert(
                    ContractId::new(),
                    ContractEntry {
                        address,
                        peer: owner,
                        supervisor: tokio::spawn(async { Exit::Stopped }),
                    },
                );
            }
        }
        let (node, _task) = idle_node(Arc::clone(&registry));
        node.send(NodeMsg::PeerMisbehaved {
            peer,
            reason: "garbage".into(),
        })
        .await
        .unwrap();
        node.ask(NodeMsg::Status).await.unwrap();

        match ours_mbox.receiver().await.try_recv() {
            Ok(ContractMsg::PeerMisbehaved(reason)) => assert_eq!(reason, "garbage"),
            _ => panic!("contract of the misbehaving peer was not told"),
        }
        assert!(theirs_mbox.receiver().await.try_recv().is_err());
    }
}
