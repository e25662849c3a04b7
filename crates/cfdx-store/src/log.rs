//! Per-contract append-only log.
//!
//! Key layout in the `contracts` tree: `contract_id (16 bytes) || seq (u64 BE)`,
//! so a prefix scan yields one contract's entries in sequence order. The
//! value is a JSON-encoded [`LogEntry`].
//!
//! Entry 1 is always [`Record::Created`]; every later entry is a
//! [`Record::Transition`] carrying the full new state, or a
//! [`Record::Rollover`] re-signing an open contract. Appends are
//! compare-and-swap against an absent key and are flushed before returning.

use std::collections::BTreeSet;
use std::path::Path;

use cfdx_types::{CfdError, Contract, ContractId, ContractState, Result, Rollover};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

const CONTRACTS_TREE: &str = "contracts";
const KEYS_TREE: &str = "keys";
const KEY_LEN: usize = 16 + 8;

/// What a log entry records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Record {
    /// The contract's static terms, in its initial state.
    Created(Contract),
    /// A state transition.
    Transition(ContractState),
    /// An open contract moved to a later expiry.
    Rollover(Rollover),
}

/// One durable log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub contract_id: ContractId,
    pub seq: u64,
    pub recorded_at: DateTime<Utc>,
    pub record: Record,
}

/// Durable store for contract histories and node keys.
///
/// Cloning yields a handle to the same database.
#[derive(Debug, Clone)]
pub struct Store {
    db: sled::Db,
    contracts: sled::Tree,
    keys: sled::Tree,
}

impl Store {
    /// Open (or create) the store under `path`.
    ///
    /// # Errors
    /// Returns `PersistenceFailure` if the database cannot be opened.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(path).map_err(StoreError::from)?;
        Self::from_db(db)
    }

    /// A throwaway store deleted on drop.
    ///
    /// # Errors
    /// Returns `PersistenceFailure` if the database cannot be created.
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(StoreError::from)?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self> {
        let contracts = db.open_tree(CONTRACTS_TREE).map_err(StoreError::from)?;
        let keys = db.open_tree(KEYS_TREE).map_err(StoreError::from)?;
        Ok(Self {
            db,
            contracts,
            keys,
        })
    }

    // -- writes ---------------------------------------------------------------

    /// Record a new contract as entry `contract.version` (1).
    ///
    /// # Errors
    /// - `DuplicateContract` if the contract already has entries
    /// - `PersistenceFailure` if the write or flush fails
    pub async fn append_created(&self, contract: &Contract) -> Result<()> {
        if self.last_seq(contract.id)? != 0 {
            return Err(CfdError::DuplicateContract(contract.id));
        }
        self.append(LogEntry {
            contract_id: contract.id,
            seq: contract.version,
            recorded_at: Utc::now(),
            record: Record::Created(contract.clone()),
        })
        .await
        .map_err(|e| match e {
            CfdError::SequenceConflict { .. } => CfdError::DuplicateContract(contract.id),
            other => other,
        })
    }

    /// Record `state` as entry `seq`, which must be exactly one past the last.
    ///
    /// # Errors
    /// - `ContractNotFound` if the contract was never created
    /// - `SequenceConflict` if `seq` is not `last + 1`
    /// - `PersistenceFailure` if the write or flush fails
    pub async fn append_transition(
        &self,
        contract_id: ContractId,
        seq: u64,
        state: &ContractState,
    ) -> Result<()> {
        self.append_next(contract_id, seq, Record::Transition(state.clone()))
            .await
    }

    /// Record `rollover` as entry `seq`, with the same rules as a transition.
    ///
    /// # Errors
    /// As [`Self::append_transition`].
    pub async fn append_rollover(
        &self,
        contract_id: ContractId,
        seq: u64,
        rollover: &Rollover,
    ) -> Result<()> {
        self.append_next(contract_id, seq, Record::Rollover(rollover.clone()))
            .await
    }

    async fn append_next(&self, contract_id: ContractId, seq: u64, record: Record) -> Result<()> {
        let last = self.last_seq(contract_id)?;
        if last == 0 {
            return Err(CfdError::ContractNotFound(contract_id));
        }
        if seq != last + 1 {
            return Err(CfdError::SequenceConflict {
                contract_id,
                expected: last + 1,
                actual: seq,
            });
        }
        self.append(LogEntry {
            contract_id,
            seq,
            recorded_at: Utc::now(),
            record,
        })
        .await
    }

    async fn append(&self, entry: LogEntry) -> Result<()> {
        let key = entry_key(entry.contract_id, entry.seq);
        let value = serde_json::to_vec(&entry).map_err(StoreError::from)?;
        let swapped = self
            .contracts
            .compare_and_swap(key, None as Option<&[u8]>, Some(value))
            .map_err(StoreError::from)?;
        if swapped.is_err() {
            return Err(CfdError::SequenceConflict {
                contract_id: entry.contract_id,
                expected: entry.seq + 1,
                actual: entry.seq,
            });
        }
        self.db.flush_async().await.map_err(StoreError::from)?;
        tracing::debug!(contract_id = %entry.contract_id, seq = entry.seq, "log entry flushed");
        Ok(())
    }

    // -- reads ----------------------------------------------------------------

    /// Sequence number of the contract's last entry, 0 if none.
    ///
    /// # Errors
    /// Returns `PersistenceFailure` or `CorruptLog` on read failures.
    pub fn last_seq(&self, contract_id: ContractId) -> Result<u64> {
        match self.contracts.scan_prefix(contract_id.as_bytes()).next_back() {
            None => Ok(0),
            Some(item) => {
                let (key, _) = item.map_err(StoreError::from)?;
                seq_from_key(&key)
            }
        }
    }

    /// All entries of one contract, in sequence order.
    ///
    /// # Errors
    /// Returns `PersistenceFailure` or `CorruptLog` on read failures.
    pub fn entries(&self, contract_id: ContractId) -> Result<Vec<LogEntry>> {
        self.contracts
            .scan_prefix(contract_id.as_bytes())
            .map(|item| -> Result<LogEntry> {
                let (_, value) = item.map_err(StoreError::from)?;
                Ok(serde_json::from_slice::<LogEntry>(&value).map_err(StoreError::from)?)
            })
            .collect()
    }

    /// Rebuild a contract from its log.
    ///
    /// Entries at or below the running version are skipped, so replaying
    /// over a partially applied contract is harmless.
    ///
    /// # Errors
    /// - `ContractNotFound` if the contract has no entries
    /// - `CorruptLog` if entry 1 is not a creation record or an entry
    ///   cannot be applied
    pub fn replay(&self, contract_id: ContractId) -> Result<Contract> {
        let mut entries = self.entries(contract_id)?.into_iter();
        let mut contract = match entries.next() {
            None => return Err(CfdError::ContractNotFound(contract_id)),
            Some(LogEntry {
                record: Record::Created(contract),
                seq: 1,
                ..
            }) => contract,
            Some(other) => {
                return Err(CfdError::CorruptLog {
                    reason: format!(
                        "first entry of {contract_id} is seq {} and not a creation record",
                        other.seq
                    ),
                });
            }
        };
        for entry in entries {
            let corrupt = |e: CfdError| CfdError::CorruptLog {
                reason: format!("{contract_id} seq {}: {e}", entry.seq),
            };
            match entry.record {
                Record::Transition(state) => {
                    contract.apply(entry.seq, state).map_err(corrupt)?;
                }
                Record::Rollover(rollover) => {
                    contract
                        .apply_rollover(entry.seq, rollover)
                        .map_err(corrupt)?;
                }
                Record::Created(_) => {
                    return Err(CfdError::CorruptLog {
                        reason: format!("{contract_id} seq {} repeats the creation", entry.seq),
                    });
                }
            }
        }
        Ok(contract)
    }

    /// Ids of every contract with at least one entry, in id order.
    ///
    /// # Errors
    /// Returns `PersistenceFailure` on read failures.
    pub fn contract_ids(&self) -> Result<Vec<ContractId>> {
        let mut ids = BTreeSet::new();
        for item in self.contracts.iter().keys() {
            let key = item.map_err(StoreError::from)?;
            if key.len() == KEY_LEN {
                let mut id = [0u8; 16];
                id.copy_from_slice(&key[..16]);
                ids.insert(ContractId::from_bytes(id));
            }
        }
        Ok(ids.into_iter().collect())
    }

    /// Replay every stored contract.
    ///
    /// # Errors
    /// Propagates the first replay failure.
    pub fn load_all(&self) -> Result<Vec<Contract>> {
        self.contract_ids()?
            .into_iter()
            .map(|id| self.replay(id))
            .collect()
    }

    // -- node keys ------------------------------------------------------------

    /// Load the 32-byte secret stored under `name`, generating and storing
    /// one on first use.
    ///
    /// # Errors
    /// Returns `PersistenceFailure` or `CorruptLog` on read/write failures.
    pub async fn key_or_insert<F>(&self, name: &str, generate: F) -> Result<[u8; 32]>
    where
        F: FnOnce() -> [u8; 32],
    {
        if let Some(stored) = self.keys.get(name).map_err(StoreError::from)? {
            return key_from_slice(name, &stored);
        }
        let fresh = generate();
        let previous = self
            .keys
            .compare_and_swap(name, None as Option<&[u8]>, Some(&fresh[..]))
            .map_err(StoreError::from)?;
        if let Err(current) = previous {
            // Raced with another writer; theirs wins.
            if let Some(stored) = current.current {
                return key_from_slice(name, &stored);
            }
        }
        self.db.flush_async().await.map_err(StoreError::from)?;
        Ok(fresh)
    }
}

fn entry_key(contract_id: ContractId, seq: u64) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    key[..16].copy_from_slice(contract_id.as_bytes());
    key[16..].copy_from_slice(&seq.to_be_bytes());
    key
}

fn seq_from_key(key: &[u8]) -> Result<u64> {
    if key.len() != KEY_LEN {
        return Err(CfdError::CorruptLog {
            reason: format!("log key has {} bytes", key.len()),
        });
    }
    let mut seq = [0u8; 8];
    seq.copy_from_slice(&key[16..]);
    Ok(u64::from_be_bytes(seq))
}

fn key_from_slice(name: &str, bytes: &[u8]) -> Result<[u8; 32]> {
    <[u8; 32]>::try_from(bytes).map_err(|_| CfdError::CorruptLog {
        reason: format!("stored key {name} has {} bytes", bytes.len()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use cfdx_types::{FailureReason, Role};

    #[test]
    fn keys_sort_by_sequence() {
        let id = ContractId::new();
        assert!(entry_key(id, 2) < entry_key(id, 10));
        assert_eq!(seq_from_key(&entry_key(id, 300)).unwrap(), 300);
    }

    #[tokio::test]
    async fn create_then_transition() {
        let store = Store::temporary().unwrap();
        let c = Contract::dummy(Role::Maker);
        store.append_created(&c).await.unwrap();
        store
            .append_transition(c.id, 2, &ContractState::Accepted)
            .await
            .unwrap();
        assert_eq!(store.last_seq(c.id).unwrap(), 2);
        assert_eq!(store.entries(c.id).unwrap().len(), 2);
        assert_eq!(store.replay(c.id).unwrap().state, ContractState::Accepted);
    }

    #[tokio::test]
    async fn duplicate_creation_refused() {
        let store = Store::temporary().unwrap();
        let c = Contract::dummy(Role::Taker);
        store.append_created(&c).await.unwrap();
        assert!(matches!(
            store.append_created(&c).await,
            Err(CfdError::DuplicateContract(_))
        ));
    }

    #[tokio::test]
    async fn sequence_gap_and_rewrite_refused() {
        let store = Store::temporary().unwrap();
        let c = Contract::dummy(Role::Maker);
        store.append_created(&c).await.unwrap();
        store
            .append_transition(c.id, 2, &ContractState::Accepted)
            .await
            .unwrap();
        let gap = store
            .append_transition(c.id, 4, &ContractState::SetupInProgress)
            .await;
        assert!(matches!(gap, Err(CfdError::SequenceConflict { expected: 3, actual: 4, .. })));
        let rewrite = store
            .append_transition(
                c.id,
                2,
                &ContractState::Failed {
                    reason: FailureReason::PeerDisconnected,
                },
            )
            .await;
        assert!(matches!(rewrite, Err(CfdError::SequenceConflict { .. })));
        assert_eq!(store.replay(c.id).unwrap().state, ContractState::Accepted);
    }

    #[tokio::test]
    async fn transition_for_unknown_contract_refused() {
        let store = Store::temporary().unwrap();
        let err = store
            .append_transition(ContractId::new(), 2, &ContractState::Accepted)
            .await
            .unwrap_err();
        assert!(matches!(err, CfdError::ContractNotFound(_)));
    }

    #[tokio::test]
    async fn contract_ids_lists_each_once() {
        let store = Store::temporary().unwrap();
        let a = Contract::dummy(Role::Maker);
        let b = Contract::dummy(Role::Taker);
        store.append_created(&a).await.unwrap();
        store.append_created(&b).await.unwrap();
        store
            .append_transition(a.id, 2, &ContractState::Accepted)
            .await
            .unwrap();
        let ids = store.contract_ids().unwrap();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&a.id) && ids.contains(&b.id));
    }

    #[tokio::test]
    async fn key_or_insert_is_stable() {
        let store = Store::temporary().unwrap();
        let first = store.key_or_insert("noise", || [7; 32]).await.unwrap();
        let second = store.key_or_insert("noise", || [8; 32]).await.unwrap();
        assert_eq!(first, [7; 32]);
        assert_eq!(second, [7; 32]);
    }
}
