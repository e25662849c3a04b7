//! Maker daemon: publishes offers and serves takers.

use std::ops::Deref;
use std::sync::Arc;

use cfdx_store::Store;
use cfdx_types::{CfdError, NodeConfig, Offer, OfferParams, PeerId, Result, Role};
use cfdx_wallet::Blockchain;
use ed25519_dalek::VerifyingKey;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::connection::spawn_connection;
use crate::node::{Node, NodeKeys};

pub struct MakerNode {
    node: Node,
}

impl MakerNode {
    /// # Errors
    /// `Configuration` if `config` is not a maker configuration.
    pub fn start(
        config: NodeConfig,
        keys: NodeKeys,
        oracle_key: VerifyingKey,
        chain: Arc<dyn Blockchain>,
        store: Store,
    ) -> Result<Self> {
        if config.role != Role::Maker {
            return Err(CfdError::Configuration(format!(
                "maker started with a {} configuration",
                config.role
            )));
        }
        Ok(Self {
            node: Node::start(config, keys, oracle_key, chain, store),
        })
    }

    /// Mint a new offer and push it to every connected taker. Supersedes
    /// the current offer.
    ///
    /// # Errors
    /// `InvalidTerms` if the parameters are inconsistent.
    pub async fn publish_offer(&self, params: OfferParams) -> Result<Offer> {
        self.node.order_book().publish(params).await
    }

    pub async fn withdraw_offer(&self) -> Result<()> {
        self.node.order_book().withdraw().await
    }

    /// Authenticate an inbound stream and serve the taker on it.
    ///
    /// # Errors
    /// `HandshakeFailed` and friends if the Noise handshake does not complete.
    pub async fn accept<S>(&self, stream: S) -> Result<PeerId>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let channel = cfdx_transport::accept(stream, self.node.transport_keys()).await?;
        let peer = channel.remote;
        spawn_connection(
            channel,
            self.node.address().clone(),
            self.node.config().timeouts.clone(),
            Some(self.node.feeds().offer),
        );
        Ok(peer)
    }

    /// Accept takers from `listener` until the returned task is aborted.
    #[must_use]
    pub fn listen(self: &Arc<Self>, listener: TcpListener) -> JoinHandle<()> {
        let maker = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let (stream, remote) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let maker = Arc::clone(&maker);
                tokio::spawn(async move {
                    match maker.accept(stream).await {
                        Ok(peer) => tracing::info!(remote = %remote, peer = %peer.short(), "taker authenticated"),
                        Err(e) => tracing::warn!(remote = %remote, error = %e, "taker rejected"),
                    }
                });
            }
        })
    }

    #[must_use]
    pub fn into_inner(self) -> Node {
        self.node
    }
}

impl Deref for MakerNode {
    type Target = Node;

    fn deref(&self) -> &Node {
        &self.node
    }
}
