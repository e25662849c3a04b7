//! Wallet coordinator: reserves, commits and releases outputs per contract.
//!
//! The coordinator owns the daemon's unspent outputs. Negotiation reserves
//! enough of them to cover a contract's margin plus a fee allowance; a
//! successful setup commits the reservation to the funding transaction and
//! every other outcome releases it.
//!
//! Invariants:
//! - an output is held by at most one active reservation
//! - a reservation is committed or released exactly once
//! - reserving again for the same contract returns the existing reservation

use std::collections::{BTreeMap, HashMap};

use cfdx_types::{
    Amount, CfdError, ContractId, OutPoint, PartyParams, Reservation, ReservationState, Result,
    Transaction, TxOut, Txid, Utxo,
};
use ed25519_dalek::{SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Balance snapshot published on the wallet feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletInfo {
    pub address: String,
    /// All unspent outputs, reserved or not.
    pub total: Amount,
    /// Outputs free for new reservations.
    pub available: Amount,
    /// Outputs held by active reservations.
    pub reserved: Amount,
}

/// Owns the UTXO set and every reservation made against it.
pub struct WalletCoordinator {
    key: SigningKey,
    address: String,
    /// Unspent outputs, ordered for deterministic coin selection.
    utxos: BTreeMap<OutPoint, Utxo>,
    /// Which active reservation holds an output.
    holders: HashMap<OutPoint, ContractId>,
    reservations: HashMap<ContractId, Reservation>,
}

impl WalletCoordinator {
    #[must_use]
    pub fn new(key: SigningKey) -> Self {
        let address = address_for(&key.verifying_key());
        Self {
            key,
            address,
            utxos: BTreeMap::new(),
            holders: HashMap::new(),
            reservations: HashMap::new(),
        }
    }

    /// Address payouts and change are sent to.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    #[must_use]
    pub fn identity(&self) -> VerifyingKey {
        self.key.verifying_key()
    }

    #[must_use]
    pub fn signing_key(&self) -> &SigningKey {
        &self.key
    }

    /// Add an unspent output. Re-adding a known outpoint is a no-op.
    pub fn deposit(&mut self, utxo: Utxo) {
        self.utxos.entry(utxo.outpoint).or_insert(utxo);
    }

    /// Add every output of `tx` paid to our address, e.g. change or a payout.
    /// Returns the value credited.
    pub fn credit_outputs(&mut self, tx: &Transaction) -> Amount {
        let txid = tx.txid();
        let mut credited = Amount::ZERO;
        for (vout, output) in tx.outputs.iter().enumerate() {
            if output.address != self.address {
                continue;
            }
            let Ok(vout) = u32::try_from(vout) else {
                continue;
            };
            let outpoint = OutPoint::new(txid, vout);
            if self.utxos.contains_key(&outpoint) {
                continue;
            }
            self.utxos.insert(
                outpoint,
                Utxo {
                    outpoint,
                    value: output.value,
                },
            );
            credited = credited.checked_add(output.value).unwrap_or(credited);
        }
        credited
    }

    #[must_use]
    pub fn balance(&self) -> WalletInfo {
        let total: Amount = self.utxos.values().map(|u| u.value).sum();
        let reserved: Amount = self
            .utxos
            .values()
            .filter(|u| self.holders.contains_key(&u.outpoint))
            .map(|u| u.value)
            .sum();
        WalletInfo {
            address: self.address.clone(),
            total,
            available: total.saturating_sub(reserved),
            reserved,
        }
    }

    /// Reserve outputs worth at least `amount` for `contract_id`.
    ///
    /// Coin selection takes the largest free outputs first, ties broken by
    /// outpoint, so the same wallet state always yields the same selection.
    /// All-or-nothing: on error no output is held.
    ///
    /// # Errors
    /// - `InsufficientFunds` if free outputs don't cover `amount`
    /// - `InvalidReservation` if the contract's reservation already ended
    pub fn reserve(&mut self, contract_id: ContractId, amount: Amount) -> Result<Reservation> {
        if let Some(existing) = self.reservations.get(&contract_id) {
            if existing.is_active() {
                return Ok(existing.clone());
            }
            return Err(CfdError::InvalidReservation {
                reason: format!("reservation for {contract_id} is already {}", existing.state),
            });
        }

        let mut free: Vec<&Utxo> = self
            .utxos
            .values()
            .filter(|u| !self.holders.contains_key(&u.outpoint))
            .collect();
        free.sort_by(|a, b| b.value.cmp(&a.value).then(a.outpoint.cmp(&b.outpoint)));

        let mut selected = Vec::new();
        let mut total = Amount::ZERO;
        for utxo in free {
            if total >= amount {
                break;
            }
            total = total.checked_add(utxo.value).unwrap_or(total);
            selected.push(*utxo);
        }
        if total < amount {
            return Err(CfdError::InsufficientFunds {
                needed: amount,
                available: total,
            });
        }

        for utxo in &selected {
            self.holders.insert(utxo.outpoint, contract_id);
        }
        let reservation = Reservation::new(contract_id, selected, amount);
        tracing::debug!(
            contract_id = %contract_id,
            amount = %amount,
            inputs = reservation.utxos.len(),
            "outputs reserved"
        );
        self.reservations.insert(contract_id, reservation.clone());
        Ok(reservation)
    }

    /// Commit the reservation to `funding`: its outputs become spent and any
    /// change paid back to us is credited. Returns `Ok(false)` if it was
    /// already committed to the same transaction.
    ///
    /// # Errors
    /// - `ReservationNotFound` if nothing is reserved for the contract
    /// - `InvalidReservation` if it was released or committed elsewhere
    pub fn commit(&mut self, contract_id: ContractId, funding: &Transaction) -> Result<bool> {
        let txid = funding.txid();
        let reservation = self
            .reservations
            .get_mut(&contract_id)
            .ok_or(CfdError::ReservationNotFound(contract_id))?;
        if !reservation.mark_committed(txid)? {
            return Ok(false);
        }
        for utxo in &reservation.utxos {
            self.holders.remove(&utxo.outpoint);
            self.utxos.remove(&utxo.outpoint);
        }
        self.credit_outputs(funding);
        tracing::info!(contract_id = %contract_id, txid = %txid, "reservation committed");
        Ok(true)
    }

    /// Return the reservation's outputs to the free pool. Returns
    /// `Ok(false)` if it was already released.
    ///
    /// # Errors
    /// - `ReservationNotFound` if nothing is reserved for the contract
    /// - `InvalidReservation` if it was committed
    pub fn release(&mut self, contract_id: ContractId) -> Result<bool> {
        let reservation = self
            .reservations
            .get_mut(&contract_id)
            .ok_or(CfdError::ReservationNotFound(contract_id))?;
        if !reservation.mark_released()? {
            return Ok(false);
        }
        for utxo in &reservation.utxos {
            if self.holders.get(&utxo.outpoint) == Some(&contract_id) {
                self.holders.remove(&utxo.outpoint);
            }
        }
        tracing::info!(contract_id = %contract_id, "reservation released");
        Ok(true)
    }

    /// Release if anything is reserved for the contract; no-op otherwise.
    ///
    /// # Errors
    /// Returns `InvalidReservation` if the reservation was committed.
    pub fn release_if_reserved(&mut self, contract_id: ContractId) -> Result<bool> {
        if self.reservations.contains_key(&contract_id) {
            self.release(contract_id)
        } else {
            Ok(false)
        }
    }

    /// Re-create the committed reservation of a funded contract after a
    /// restart: the inputs are marked spent and the record shows them
    /// committed to `funding_txid`. Idempotent.
    ///
    /// # Errors
    /// - `InvalidReservation` if the contract has a conflicting record
    /// - `OutputAlreadyReserved` if another contract holds one of the inputs
    pub fn restore_committed(
        &mut self,
        contract_id: ContractId,
        inputs: &[Utxo],
        amount: Amount,
        funding_txid: Txid,
    ) -> Result<()> {
        if let Some((outpoint, holder)) = inputs.iter().find_map(|u| {
            self.holders
                .get(&u.outpoint)
                .filter(|holder| **holder != contract_id)
                .map(|holder| (u.outpoint, *holder))
        }) {
            return Err(CfdError::OutputAlreadyReserved {
                outpoint: outpoint.to_string(),
                holder,
            });
        }
        if let Some(existing) = self.reservations.get_mut(&contract_id) {
            existing.mark_committed(funding_txid)?;
        } else {
            let mut reservation = Reservation::new(contract_id, inputs.to_vec(), amount);
            reservation.mark_committed(funding_txid)?;
            self.reservations.insert(contract_id, reservation);
        }
        for utxo in inputs {
            self.holders.remove(&utxo.outpoint);
            self.utxos.remove(&utxo.outpoint);
        }
        Ok(())
    }

    /// Our side of a DLC setup, funded from the contract's reservation.
    ///
    /// Inputs are the reserved outputs; whatever exceeds the reserved
    /// amount comes back as change.
    ///
    /// # Errors
    /// `ReservationNotFound` or `InvalidReservation` if no active reservation exists.
    pub fn party_params(&self, contract_id: ContractId, margin: Amount) -> Result<PartyParams> {
        let reservation = self
            .reservations
            .get(&contract_id)
            .ok_or(CfdError::ReservationNotFound(contract_id))?;
        if reservation.state != ReservationState::Active {
            return Err(CfdError::InvalidReservation {
                reason: format!("reservation for {contract_id} is {}", reservation.state),
            });
        }
        let change = reservation.change();
        Ok(PartyParams {
            identity: self.identity(),
            inputs: reservation.utxos.clone(),
            change: (change > Amount::ZERO).then(|| TxOut {
                address: self.address.clone(),
                value: change,
            }),
            payout_address: self.address.clone(),
            margin,
        })
    }

    #[must_use]
    pub fn reservation(&self, contract_id: &ContractId) -> Option<&Reservation> {
        self.reservations.get(contract_id)
    }

    /// Number of ACTIVE reservations.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.reservations.values().filter(|r| r.is_active()).count()
    }

    /// Contract holding `outpoint`, if any.
    #[must_use]
    pub fn holder_of(&self, outpoint: &OutPoint) -> Option<ContractId> {
        self.holders.get(outpoint).copied()
    }
}

fn address_for(key: &VerifyingKey) -> String {
    let digest = Sha256::digest(key.as_bytes());
    format!("cfdx1{}", hex::encode(&digest[..20]))
}
