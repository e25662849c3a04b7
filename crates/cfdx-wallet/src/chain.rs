//! Blockchain collaborator: broadcast with bounded retry.
//!
//! The engine never talks to a node directly. It hands fully signed
//! transactions to a [`Blockchain`] implementation and retries failed
//! broadcasts with exponential backoff per [`BroadcastPolicy`]. It also
//! asks the chain who spent an output, which is how a contract learns that
//! the counterparty closed it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use cfdx_types::{BroadcastPolicy, CfdError, OutPoint, Result, SignedTransaction, Txid};
use tokio::sync::Mutex;

/// Access to the Bitcoin network.
#[async_trait]
pub trait Blockchain: Send + Sync {
    /// Submit a signed transaction. Re-submitting a transaction the network
    /// already knows succeeds with its txid.
    ///
    /// # Errors
    /// Returns `BroadcastFailed` if the network refuses the transaction.
    async fn broadcast(&self, tx: &SignedTransaction) -> Result<Txid>;

    /// The accepted transaction spending `outpoint`, if there is one.
    ///
    /// # Errors
    /// Returns `ChainUnavailable` if the network cannot be queried.
    async fn spender_of(&self, outpoint: &OutPoint) -> Result<Option<SignedTransaction>>;
}

/// Broadcast `tx`, retrying up to `policy.max_attempts` times.
///
/// # Errors
/// Returns `BroadcastFailed` with the last refusal once attempts are exhausted.
pub async fn broadcast_with_retry(
    chain: &dyn Blockchain,
    tx: &SignedTransaction,
    policy: &BroadcastPolicy,
) -> Result<Txid> {
    let txid = tx.txid();
    let attempts = policy.max_attempts.max(1);
    let mut last_error = String::new();
    for attempt in 1..=attempts {
        match chain.broadcast(tx).await {
            Ok(accepted) => {
                tracing::info!(txid = %accepted, attempt, "transaction broadcast");
                return Ok(accepted);
            }
            Err(e) => {
                tracing::warn!(txid = %txid, attempt, error = %e, "broadcast attempt failed");
                last_error = e.to_string();
                if attempt < attempts {
                    tokio::time::sleep(policy.backoff(attempt)).await;
                }
            }
        }
    }
    tracing::error!(txid = %txid, attempts, "broadcast exhausted");
    Err(CfdError::BroadcastFailed {
        txid: txid.to_string(),
        attempts,
        reason: last_error,
    })
}

// ---------------------------------------------------------------------------
// In-memory chain
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct ChainState {
    accepted: HashMap<Txid, SignedTransaction>,
    /// Outputs consumed by accepted transactions, with the spender.
    spent: HashMap<OutPoint, Txid>,
    /// Broadcasts refused before the next one is accepted.
    fail_next: u32,
    /// Refuse everything.
    offline: bool,
    /// Transactions that may never be accepted.
    blacklist: HashSet<Txid>,
    attempts: u32,
}

/// A mempool-like chain held in memory, with failure injection.
///
/// Cloning yields a handle to the same chain.
#[derive(Debug, Clone, Default)]
pub struct MemoryChain {
    state: Arc<Mutex<ChainState>>,
}

impl MemoryChain {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse the next `n` broadcasts.
    pub async fn fail_next(&self, n: u32) {
        self.state.lock().await.fail_next = n;
    }

    /// Refuse every broadcast until switched back.
    pub async fn set_offline(&self, offline: bool) {
        self.state.lock().await.offline = offline;
    }

    /// Never accept `txid`.
    pub async fn reject(&self, txid: Txid) {
        self.state.lock().await.blacklist.insert(txid);
    }

    pub async fn is_accepted(&self, txid: &Txid) -> bool {
        self.state.lock().await.accepted.contains_key(txid)
    }

    pub async fn accepted(&self) -> Vec<SignedTransaction> {
        self.state.lock().await.accepted.values().cloned().collect()
    }

    /// Broadcast calls seen so far, successful or not.
    pub async fn attempts(&self) -> u32 {
        self.state.lock().await.attempts
    }
}

#[async_trait]
impl Blockchain for MemoryChain {
    async fn broadcast(&self, tx: &SignedTransaction) -> Result<Txid> {
        let mut state = self.state.lock().await;
        state.attempts += 1;
        let txid = tx.txid();
        let refuse = |reason: &str| CfdError::BroadcastFailed {
            txid: txid.to_string(),
            attempts: 1,
            reason: reason.to_string(),
        };

        if state.offline {
            return Err(refuse("node unreachable"));
        }
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(refuse("transient failure"));
        }
        if state.blacklist.contains(&txid) {
            return Err(refuse("rejected by policy"));
        }
        if state.accepted.contains_key(&txid) {
            return Ok(txid);
        }
        if tx.signatures.is_empty() {
            return Err(refuse("unsigned transaction"));
        }
        if let Some(conflict) = tx.tx.inputs.iter().find_map(|i| state.spent.get(i)) {
            return Err(refuse(&format!("input already spent by {conflict}")));
        }
        for input in &tx.tx.inputs {
            state.spent.insert(*input, txid);
        }
        state.accepted.insert(txid, tx.clone());
        Ok(txid)
    }

    async fn spender_of(&self, outpoint: &OutPoint) -> Result<Option<SignedTransaction>> {
        let state = self.state.lock().await;
        if state.offline {
            return Err(CfdError::ChainUnavailable {
                reason: "node unreachable".into(),
            });
        }
        Ok(state
            .spent
            .get(outpoint)
            .and_then(|txid| state.accepted.get(txid))
            .cloned())
    }
}
