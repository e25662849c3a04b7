//! Minimal actor runtime: typed mailboxes, addresses and a message loop.
//!
//! An actor owns its state exclusively and handles one message to
//! completion before taking the next. Other components hold an
//! [`Address`] and either fire a message ([`Address::send`]) or ask and
//! await a `oneshot` reply ([`Address::ask`]).
//!
//! The receiving end lives in a [`Mailbox`] shared behind a mutex, so when
//! the supervisor restarts a crashed actor the new incarnation drains the
//! same queue and every outstanding address stays valid.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cfdx_types::{CfdError, Result, constants};
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// Reply channel carried inside request messages.
pub type Reply<T> = oneshot::Sender<T>;

// ---------------------------------------------------------------------------
// Address / Mailbox
// ---------------------------------------------------------------------------

/// Sending side of an actor's mailbox.
pub struct Address<M> {
    tx: mpsc::Sender<M>,
    name: Arc<str>,
}

impl<M> Clone for Address<M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            name: Arc::clone(&self.name),
        }
    }
}

impl<M> std::fmt::Debug for Address<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Address").field("name", &self.name).finish()
    }
}

impl<M: Send + 'static> Address<M> {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue `msg`, waiting for mailbox capacity.
    ///
    /// # Errors
    /// Returns `ActorUnavailable` if the actor is gone for good.
    pub async fn send(&self, msg: M) -> Result<()> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| CfdError::ActorUnavailable(self.name.to_string()))
    }

    /// Queue `msg` without waiting.
    ///
    /// # Errors
    /// Returns `ActorUnavailable` if the mailbox is full or closed.
    pub fn try_send(&self, msg: M) -> Result<()> {
        self.tx.try_send(msg).map_err(|e| {
            CfdError::ActorUnavailable(match e {
                mpsc::error::TrySendError::Full(_) => format!("{} (mailbox full)", self.name),
                mpsc::error::TrySendError::Closed(_) => self.name.to_string(),
            })
        })
    }

    /// Send a request built around a fresh reply channel and await the answer.
    ///
    /// # Errors
    /// Returns `ActorUnavailable` if the actor is gone or drops the request.
    pub async fn ask<R>(&self, make: impl FnOnce(Reply<R>) -> M) -> Result<R> {
        let (reply, response) = oneshot::channel();
        self.send(make(reply)).await?;
        response
            .await
            .map_err(|_| CfdError::ActorUnavailable(format!("{} dropped the request", self.name)))
    }

    /// Deliver `msg` after `delay`. Dropped silently if the actor is gone by then.
    pub fn send_after(&self, delay: Duration, msg: M) -> JoinHandle<()> {
        let address = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if address.send(msg).await.is_err() {
                tracing::trace!(actor = %address.name, "timer fired for a stopped actor");
            }
        })
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receiving side of an actor's mailbox. Cloning shares the same queue.
pub struct Mailbox<M> {
    rx: Arc<Mutex<mpsc::Receiver<M>>>,
    weak: mpsc::WeakSender<M>,
    name: Arc<str>,
}

impl<M> Clone for Mailbox<M> {
    fn clone(&self) -> Self {
        Self {
            rx: Arc::clone(&self.rx),
            weak: self.weak.clone(),
            name: Arc::clone(&self.name),
        }
    }
}

impl<M> Mailbox<M> {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
impl<M> Mailbox<M> {
    /// Read the queue directly, bypassing any actor.
    pub(crate) async fn receiver(&self) -> tokio::sync::MutexGuard<'_, mpsc::Receiver<M>> {
        self.rx.lock().await
    }
}

/// Create a mailbox with the default capacity.
#[must_use]
pub fn mailbox<M>(name: impl Into<Arc<str>>) -> (Address<M>, Mailbox<M>) {
    let name = name.into();
    let (tx, rx) = mpsc::channel(constants::MAILBOX_CAPACITY);
    let weak = tx.downgrade();
    (
        Address {
            tx,
            name: Arc::clone(&name),
        },
        Mailbox {
            rx: Arc::new(Mutex::new(rx)),
            weak,
            name,
        },
    )
}

/// Forward every new value of `feed` to `address`, mapped through `wrap`.
///
/// Ends when the feed's sender or the actor goes away.
pub fn forward_feed<T, M, F>(mut feed: watch::Receiver<T>, address: Address<M>, wrap: F) -> JoinHandle<()>
where
    T: Clone + Send + Sync + 'static,
    M: Send + 'static,
    F: Fn(T) -> Option<M> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            let value = feed.borrow_and_update().clone();
            if let Some(msg) = wrap(value) {
                if address.send(msg).await.is_err() {
                    return;
                }
            }
            if feed.changed().await.is_err() {
                return;
            }
        }
    })
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

/// What the loop does after a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// Per-incarnation context handed to an actor.
pub struct Context<M> {
    weak: mpsc::WeakSender<M>,
    name: Arc<str>,
    restarts: u32,
}

impl<M: Send + 'static> Context<M> {
    pub(crate) fn new(mailbox: &Mailbox<M>, restarts: u32) -> Self {
        Self {
            weak: mailbox.weak.clone(),
            name: Arc::clone(&mailbox.name),
            restarts,
        }
    }

    /// The actor's own address, unless every external address is gone.
    #[must_use]
    pub fn address(&self) -> Option<Address<M>> {
        self.weak.upgrade().map(|tx| Address {
            tx,
            name: Arc::clone(&self.name),
        })
    }

    /// How many times this actor has been restarted. `0` on first start.
    #[must_use]
    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
pub trait Actor: Send + 'static {
    type Message: Send + 'static;

    /// Runs before the first message of every incarnation.
    async fn started(&mut self, _ctx: &Context<Self::Message>) -> Result<Flow> {
        Ok(Flow::Continue)
    }

    /// Handle one message. An `Err` crashes the incarnation.
    async fn handle(&mut self, msg: Self::Message, ctx: &Context<Self::Message>) -> Result<Flow>;

    /// Runs after a clean stop.
    async fn stopped(&mut self) {}
}

/// Drive one incarnation until it stops or fails.
pub(crate) async fn run<A: Actor>(mut actor: A, mailbox: Mailbox<A::Message>, ctx: Context<A::Message>) -> Result<()> {
    let mut rx = mailbox.rx.lock().await;
    if actor.started(&ctx).await? == Flow::Continue {
        while let Some(msg) = rx.recv().await {
            if actor.handle(msg, &ctx).await? == Flow::Stop {
                break;
            }
        }
    }
    actor.stopped().await;
    Ok(())
}
