//! Taker daemon: connects to one maker and takes its offers.

use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::Arc;

use cfdx_store::Store;
use cfdx_types::{CfdError, ContractId, NodeConfig, Offer, OfferId, PeerId, Result, Role, Usd};
use cfdx_wallet::Blockchain;
use ed25519_dalek::VerifyingKey;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::connection::spawn_connection;
use crate::node::{Node, NodeKeys, NodeMsg};

pub struct TakerNode {
    node: Node,
}

impl TakerNode {
    /// # Errors
    /// `Configuration` if `config` is not a taker configuration.
    pub fn start(
        config: NodeConfig,
        keys: NodeKeys,
        oracle_key: VerifyingKey,
        chain: Arc<dyn Blockchain>,
        store: Store,
    ) -> Result<Self> {
        if config.role != Role::Taker {
            return Err(CfdError::Configuration(format!(
                "taker started with a {} configuration",
                config.role
            )));
        }
        Ok(Self {
            node: Node::start(config, keys, oracle_key, chain, store),
        })
    }

    /// Authenticate to the maker over `stream`, which must present `maker`'s key.
    ///
    /// # Errors
    /// `PeerKeyMismatch` if the remote is someone else; handshake errors otherwise.
    pub async fn connect<S>(&self, stream: S, maker: PeerId) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let channel = cfdx_transport::connect(stream, self.node.transport_keys(), Some(maker)).await?;
        spawn_connection(
            channel,
            self.node.address().clone(),
            self.node.config().timeouts.clone(),
            None,
        );
        tracing::info!(maker = %maker.short(), "connected to maker");
        Ok(())
    }

    /// Dial the maker over TCP.
    pub async fn dial(&self, addr: SocketAddr, maker: PeerId) -> Result<()> {
        let stream = TcpStream::connect(addr).await?;
        self.connect(stream, maker).await
    }

    /// The maker's current offer, if any.
    pub async fn current_offer(&self) -> Result<Option<Offer>> {
        self.node.order_book().current().await
    }

    /// Take `quantity` of the maker's offer `offer_id`.
    ///
    /// Returns once the request is recorded and sent; follow the `cfds`
    /// feed for the maker's answer and the setup.
    ///
    /// # Errors
    /// - `PeerDisconnected` when no maker is connected
    /// - `UnknownOffer` / `OfferExpired` / `QuantityOutOfRange`
    /// - `InsufficientFunds` if the margin cannot be reserved
    pub async fn take_offer(&self, offer_id: OfferId, quantity: Usd) -> Result<ContractId> {
        self.node
            .address()
            .ask(|reply| NodeMsg::TakeOffer {
                offer_id,
                quantity,
                reply,
            })
            .await?
    }

    /// Ask the maker to move an open contract to the next settlement event.
    ///
    /// Returns once the proposal is sent; the contract's expiry changes when
    /// the maker counter-signs.
    ///
    /// # Errors
    /// - `ContractNotFound` for an unknown id
    /// - `WrongState` unless the contract is open, unexpired and idle
    /// - `PeerDisconnected` if the proposal cannot be sent
    pub async fn rollover(&self, contract_id: ContractId) -> Result<()> {
        self.node
            .address()
            .ask(|reply| NodeMsg::Rollover { contract_id, reply })
            .await?
    }

    #[must_use]
    pub fn into_inner(self) -> Node {
        self.node
    }
}

impl Deref for TakerNode {
    type Target = Node;

    fn deref(&self) -> &Node {
        &self.node
    }
}
