//! Restart crashed actors with bounded intensity.
//!
//! ```text
//!   supervise(mailbox, factory)
//!     loop:
//!       actor = factory()
//!       run(actor) in its own task ──▶ Ok            → done (Stopped)
//!                                  ──▶ Err | panic   → restart?
//!       restarts inside window > max_restarts        → done (GaveUp)
//!       sleep(restart_backoff)
//! ```
//!
//! The mailbox outlives every incarnation: messages queued while an actor
//! is down are handled by its successor.

use std::any::Any;
use std::collections::VecDeque;

use cfdx_types::SupervisorConfig;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::actor::{self, Actor, Context, Mailbox};

/// How a supervised actor ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exit {
    /// The actor stopped on its own.
    Stopped,
    /// Restart intensity exceeded; the mailbox is closed.
    GaveUp { restarts: u32, last_error: String },
}

/// Aborts the wrapped task when dropped, so aborting the supervisor also
/// stops the running incarnation.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Run actors built by `factory` on `mailbox`, restarting them on failure.
pub fn supervise<A, F>(mailbox: Mailbox<A::Message>, config: SupervisorConfig, mut factory: F) -> JoinHandle<Exit>
where
    A: Actor,
    F: FnMut() -> A + Send + 'static,
{
    tokio::spawn(async move {
        let name = mailbox.name().to_string();
        let mut recent: VecDeque<Instant> = VecDeque::new();
        let mut restarts = 0u32;
        loop {
            let ctx = Context::new(&mailbox, restarts);
            let mut task = AbortOnDrop(tokio::spawn(actor::run(factory(), mailbox.clone(), ctx)));
            let failure = match (&mut task.0).await {
                Ok(Ok(())) => {
                    tracing::debug!(actor = %name, "actor stopped");
                    return Exit::Stopped;
                }
                Ok(Err(e)) => e.to_string(),
                Err(join) if join.is_panic() => panic_message(join.into_panic().as_ref()),
                Err(_) => return Exit::Stopped,
            };

            let now = Instant::now();
            while recent
                .front()
                .is_some_and(|t| now.duration_since(*t) > config.restart_window)
            {
                recent.pop_front();
            }
            if recent.len() >= config.max_restarts as usize {
                tracing::error!(actor = %name, restarts, error = %failure, "restart intensity exceeded, giving up");
                return Exit::GaveUp {
                    restarts,
                    last_error: failure,
                };
            }
            recent.push_back(now);
            restarts += 1;
            tracing::warn!(actor = %name, restarts, error = %failure, "actor crashed, restarting");
            tokio::time::sleep(config.restart_backoff).await;
        }
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panic: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panic: {s}")
    } else {
        "panic".to_string()
    }
}
