//! Projection actor: the `cfds` feed.
//!
//! Contract actors report every recorded transition; the actor keeps the
//! latest copy of each contract, values open positions at the latest quote
//! and republishes the whole list.

use std::collections::BTreeMap;

use async_trait::async_trait;
use cfdx_store::Store;
use cfdx_types::{
    Amount, Contract, ContractId, ContractState, Leverage, Percent, Position, Price, Quote, Result,
    Role, SignedAmount, Txid, Usd,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::actor::{Actor, Address, Context, Flow};

/// A contract as shown to the outside world.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CfdProjection {
    pub id: ContractId,
    pub role: Role,
    pub position: Position,
    /// Uppercase state label, e.g. `OPEN`.
    pub state: String,
    /// Label with detail, e.g. `CLOSED(LIQUIDATED)`.
    pub state_detail: String,
    pub initial_price: Price,
    pub leverage: Leverage,
    pub quantity: Usd,
    pub own_margin: Amount,
    pub counterparty_margin: Amount,
    pub liquidation_price: Price,
    pub expiry: DateTime<Utc>,
    pub funding_txid: Option<Txid>,
    pub closing_txid: Option<Txid>,
    /// Profit at the closing price once settled, otherwise at the latest quote.
    pub profit: Option<SignedAmount>,
    pub profit_percent: Option<Percent>,
}

impl CfdProjection {
    #[must_use]
    pub fn new(contract: &Contract, quote: Option<&Quote>) -> Self {
        let valuation = valuation_price(&contract.state, quote);
        let pnl = valuation.and_then(|price| contract.terms().profit(contract.position(), price).ok());
        Self {
            id: contract.id,
            role: contract.role,
            position: contract.position(),
            state: contract.state.label().to_string(),
            state_detail: contract.state.to_string(),
            initial_price: contract.initial_price,
            leverage: contract.leverage,
            quantity: contract.quantity,
            own_margin: contract.own_margin(),
            counterparty_margin: contract.counterparty_margin(),
            liquidation_price: contract.liquidation_price,
            expiry: contract.expiry,
            funding_txid: contract.funding_txid,
            closing_txid: contract.closing_txid,
            profit: pnl.map(|(profit, _)| profit),
            profit_percent: pnl.map(|(_, percent)| percent),
        }
    }
}

fn valuation_price(state: &ContractState, quote: Option<&Quote>) -> Option<Price> {
    match state {
        ContractState::Closed { outcome } => Some(outcome.price),
        ContractState::PendingClose { closing } => Some(closing.price),
        ContractState::Rejected { .. } | ContractState::Failed { .. } => None,
        _ => quote.map(|q| q.price),
    }
}

pub enum ProjectionMsg {
    Update(Box<Contract>),
    Quote(Quote),
}

pub struct ProjectionActor {
    store: Store,
    contracts: BTreeMap<ContractId, Contract>,
    quote: Option<Quote>,
    feed: watch::Sender<Vec<CfdProjection>>,
}

impl ProjectionActor {
    #[must_use]
    pub fn new(store: Store, feed: watch::Sender<Vec<CfdProjection>>) -> Self {
        Self {
            store,
            contracts: BTreeMap::new(),
            quote: None,
            feed,
        }
    }

    fn publish(&self) {
        let list = self
            .contracts
            .values()
            .map(|c| CfdProjection::new(c, self.quote.as_ref()))
            .collect();
        self.feed.send_replace(list);
    }
}

#[async_trait]
impl Actor for ProjectionActor {
    type Message = ProjectionMsg;

    /// Rebuild from the log, so a restart shows the same list.
    async fn started(&mut self, _ctx: &Context<ProjectionMsg>) -> Result<Flow> {
        self.contracts = self
            .store
            .load_all()?
            .into_iter()
            .map(|c| (c.id, c))
            .collect();
        self.publish();
        Ok(Flow::Continue)
    }

    async fn handle(&mut self, msg: ProjectionMsg, _ctx: &Context<ProjectionMsg>) -> Result<Flow> {
        match msg {
            ProjectionMsg::Update(contract) => {
                // Updates from a replaying actor can arrive late.
                let stale = self
                    .contracts
                    .get(&contract.id)
                    .is_some_and(|known| known.version > contract.version);
                if !stale {
                    self.contracts.insert(contract.id, *contract);
                }
            }
            ProjectionMsg::Quote(quote) => self.quote = Some(quote),
        }
        self.publish();
        Ok(Flow::Continue)
    }
}

/// Typed front for the projection mailbox.
#[derive(Debug, Clone)]
pub struct ProjectionHandle {
    address: Address<ProjectionMsg>,
}

impl ProjectionHandle {
    #[must_use]
    pub fn new(address: Address<ProjectionMsg>) -> Self {
        Self { address }
    }

    #[must_use]
    pub fn address(&self) -> &Address<ProjectionMsg> {
        &self.address
    }

    pub async fn update(&self, contract: &Contract) -> Result<()> {
        self.address
            .send(ProjectionMsg::Update(Box::new(contract.clone())))
            .await
    }
}
