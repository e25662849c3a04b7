//! Order-book actor: the current offer and its feed.
//!
//! On the maker it mints offers; on the taker it tracks the last offer the
//! maker pushed. Either way the offer is only ever replaced, never edited,
//! and the `offer` feed carries the latest one.

use async_trait::async_trait;
use cfdx_types::{CfdError, Offer, OfferId, OfferParams, Result};
use chrono::Utc;
use tokio::sync::watch;

use crate::actor::{Actor, Address, Context, Flow, Reply};

pub enum OrderBookMsg {
    /// Mint and publish a new offer, superseding the current one.
    Publish {
        params: OfferParams,
        reply: Reply<Result<Offer>>,
    },
    Withdraw,
    /// Offer pushed by the maker.
    Received(Option<Offer>),
    /// The current offer if its id is `offer_id`.
    Lookup {
        offer_id: OfferId,
        reply: Reply<Result<Offer>>,
    },
    Current(Reply<Option<Offer>>),
}

/// Keeps no state of its own: the feed's last value is the current offer,
/// so a restarted incarnation resumes where the last one left off.
pub struct OrderBookActor {
    feed: watch::Sender<Option<Offer>>,
}

impl OrderBookActor {
    #[must_use]
    pub fn new(feed: watch::Sender<Option<Offer>>) -> Self {
        Self { feed }
    }

    fn current(&self) -> Option<Offer> {
        self.feed.borrow().clone()
    }

    fn replace(&self, offer: Option<Offer>) {
        let previous = self.feed.send_replace(offer);
        let current = self.feed.borrow();
        match (&previous, &*current) {
            (_, Some(new)) => tracing::info!(
                offer_id = %new.id,
                superseded = ?previous.as_ref().map(|o| o.id),
                price = %new.price,
                "offer published"
            ),
            (Some(old), None) => tracing::info!(offer_id = %old.id, "offer withdrawn"),
            (None, None) => {}
        }
    }
}

#[async_trait]
impl Actor for OrderBookActor {
    type Message = OrderBookMsg;

    async fn handle(&mut self, msg: OrderBookMsg, _ctx: &Context<OrderBookMsg>) -> Result<Flow> {
        match msg {
            OrderBookMsg::Publish { params, reply } => {
                let result = Offer::new(params, Utc::now());
                if let Ok(offer) = &result {
                    self.replace(Some(offer.clone()));
                }
                let _ = reply.send(result);
            }
            OrderBookMsg::Withdraw => self.replace(None),
            OrderBookMsg::Received(offer) => self.replace(offer),
            OrderBookMsg::Lookup { offer_id, reply } => {
                let found = self
                    .current()
                    .filter(|o| o.id == offer_id)
                    .ok_or(CfdError::UnknownOffer(offer_id));
                let _ = reply.send(found);
            }
            OrderBookMsg::Current(reply) => {
                let _ = reply.send(self.current());
            }
        }
        Ok(Flow::Continue)
    }
}

/// Typed front for the order-book mailbox.
#[derive(Debug, Clone)]
pub struct OrderBookHandle {
    address: Address<OrderBookMsg>,
}

impl OrderBookHandle {
    #[must_use]
    pub fn new(address: Address<OrderBookMsg>) -> Self {
        Self { address }
    }

    pub async fn publish(&self, params: OfferParams) -> Result<Offer> {
        self.address
            .ask(|reply| OrderBookMsg::Publish { params, reply })
            .await?
    }

    pub async fn withdraw(&self) -> Result<()> {
        self.address.send(OrderBookMsg::Withdraw).await
    }

    pub async fn received(&self, offer: Option<Offer>) -> Result<()> {
        self.address.send(OrderBookMsg::Received(offer)).await
    }

    /// # Errors
    /// `UnknownOffer` unless `offer_id` is the current offer.
    pub async fn lookup(&self, offer_id: OfferId) -> Result<Offer> {
        self.address
            .ask(|reply| OrderBookMsg::Lookup { offer_id, reply })
            .await?
    }

    pub async fn current(&self) -> Result<Option<Offer>> {
        self.address.ask(OrderBookMsg::Current).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::mailbox;
    use crate::supervisor::supervise;
    use cfdx_types::{Leverage, Price, SupervisorConfig, Usd};
    use rust_decimal_macros::dec;

    fn spawn_book() -> (OrderBookHandle, watch::Receiver<Option<Offer>>) {
        let (feed, rx) = watch::channel(None);
        let (address, mbox) = mailbox("order-book");
        supervise(mbox, SupervisorConfig::default(), move || OrderBookActor::new(feed.clone()));
        (OrderBookHandle::new(address), rx)
    }

    fn params(price: rust_decimal::Decimal) -> OfferParams {
        OfferParams::with_defaults(
            Price::new(price).unwrap(),
            Usd::new(dec!(1000)),
            Usd::new(dec!(50000)),
            Leverage::new(5).unwrap(),
        )
    }

    #[tokio::test]
    async fn republishing_supersedes_the_previous_offer() {
        let (book, feed) = spawn_book();
        let first = book.publish(params(dec!(42000))).await.unwrap();
        let second = book.publish(params(dec!(42100))).await.unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(feed.borrow().as_ref().map(|o| o.id), Some(second.id));

        assert!(matches!(
            book.lookup(first.id).await,
            Err(CfdError::UnknownOffer(id)) if id == first.id
        ));
        assert_eq!(book.lookup(second.id).await.unwrap(), second);
    }

    #[tokio::test]
    async fn invalid_params_leave_the_feed_untouched() {
        let (book, feed) = spawn_book();
        let mut bad = params(dec!(42000));
        bad.min_quantity = Usd::new(dec!(60000));
        assert!(matches!(
            book.publish(bad).await,
            Err(CfdError::InvalidTerms { .. })
        ));
        assert!(feed.borrow().is_none());
    }

    #[tokio::test]
    async fn withdraw_and_receive() {
        let (book, feed) = spawn_book();
        book.received(Some(Offer::dummy())).await.unwrap();
        assert!(book.current().await.unwrap().is_some());
        book.withdraw().await.unwrap();
        assert!(book.current().await.unwrap().is_none());
        assert!(feed.borrow().is_none());
    }
}
