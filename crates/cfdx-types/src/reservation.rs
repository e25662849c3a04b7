//! # Reservation: wallet outputs earmarked for one contract
//!
//! A `Reservation` ties a set of unspent outputs to exactly one in-flight
//! contract while it is negotiated and set up.
//!
//! ## State Machine
//!
//! ```text
//!   ┌────────┐  funding signed  ┌───────────┐
//!   │ ACTIVE ├─────────────────▶│ COMMITTED │
//!   └───┬────┘                  └───────────┘
//!       │ rejected / failed
//!       ▼
//!   ┌──────────┐
//!   │ RELEASED │
//!   └──────────┘
//! ```
//!
//! - **Exactly once**: a reservation ends committed or released, never both.
//! - **Replay-safe**: repeating the transition that already happened is a
//!   no-op, so recovery can re-issue it blindly.
//! - **Exclusive**: the wallet coordinator never lets one output sit in two
//!   active reservations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Amount, CfdError, ContractId, Result, Txid, Utxo};

/// The lifecycle state of a reservation.
///
/// Transitions are **monotonic**:
/// - `Active → Committed` (outputs spent by the contract's funding transaction)
/// - `Active → Released` (outputs returned to the free pool)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationState {
    Active,
    Committed,
    Released,
}

impl ReservationState {
    #[must_use]
    pub fn can_transition_to(&self, target: Self) -> bool {
        matches!(
            (self, target),
            (Self::Active, Self::Committed | Self::Released)
        )
    }
}

impl std::fmt::Display for ReservationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "ACTIVE"),
            Self::Committed => write!(f, "COMMITTED"),
            Self::Released => write!(f, "RELEASED"),
        }
    }
}

/// Outputs held for one contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub contract_id: ContractId,
    pub utxos: Vec<Utxo>,
    /// Amount requested: margin plus fee allowance.
    pub amount: Amount,
    pub state: ReservationState,
    /// Funding transaction the outputs were committed to.
    pub committed_to: Option<Txid>,
    pub created_at: DateTime<Utc>,
}

impl Reservation {
    #[must_use]
    pub fn new(contract_id: ContractId, utxos: Vec<Utxo>, amount: Amount) -> Self {
        Self {
            contract_id,
            utxos,
            amount,
            state: ReservationState::Active,
            committed_to: None,
            created_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn total(&self) -> Amount {
        self.utxos.iter().map(|u| u.value).sum()
    }

    /// Value left over after `amount`, returned to the wallet as change.
    #[must_use]
    pub fn change(&self) -> Amount {
        self.total().saturating_sub(self.amount)
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state == ReservationState::Active
    }

    /// Commit to `txid`. Returns `Ok(false)` if already committed to the same txid.
    ///
    /// # Errors
    /// Returns `InvalidReservation` if released, or committed to a different txid.
    pub fn mark_committed(&mut self, txid: Txid) -> Result<bool> {
        if self.state == ReservationState::Committed && self.committed_to == Some(txid) {
            return Ok(false);
        }
        if !self.state.can_transition_to(ReservationState::Committed) {
            return Err(CfdError::InvalidReservation {
                reason: format!(
                    "cannot commit reservation for {} from {} to {txid}",
                    self.contract_id, self.state
                ),
            });
        }
        self.state = ReservationState::Committed;
        self.committed_to = Some(txid);
        Ok(true)
    }

    /// Release the outputs. Returns `Ok(false)` if already released.
    ///
    /// # Errors
    /// Returns `InvalidReservation` if the reservation was committed.
    pub fn mark_released(&mut self) -> Result<bool> {
        if self.state == ReservationState::Released {
            return Ok(false);
        }
        if !self.state.can_transition_to(ReservationState::Released) {
            return Err(CfdError::InvalidReservation {
                reason: format!(
                    "cannot release reservation for {} from {}",
                    self.contract_id, self.state
                ),
            });
        }
        self.state = ReservationState::Released;
        Ok(true)
    }
}

/// Dummy reservation for testing. **Never use in production.**
#[cfg(any(test, feature = "test-helpers"))]
impl Reservation {
    #[must_use]
    pub fn dummy(amount: Amount) -> Self {
        use crate::{OutPoint, Txid};

        let utxo = Utxo {
            outpoint: OutPoint::new(Txid(rand::random::<[u8; 32]>()), 0),
            value: amount,
        };
        Self::new(ContractId::new(), vec![utxo], amount)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make() -> Reservation {
        Reservation::dummy(Amount::from_sat(50_000))
    }

    #[test]
    fn state_transitions_valid() {
        assert!(ReservationState::Active.can_transition_to(ReservationState::Committed));
        assert!(ReservationState::Active.can_transition_to(ReservationState::Released));
    }

    #[test]
    fn state_transitions_invalid() {
        assert!(!ReservationState::Committed.can_transition_to(ReservationState::Active));
        assert!(!ReservationState::Committed.can_transition_to(ReservationState::Released));
        assert!(!ReservationState::Released.can_transition_to(ReservationState::Active));
        assert!(!ReservationState::Released.can_transition_to(ReservationState::Committed));
    }

    #[test]
    fn commit_then_release_fails() {
        let mut r = make();
        assert!(r.mark_committed(Txid([1; 32])).unwrap());
        assert!(r.mark_released().is_err(), "COMMITTED → RELEASED must fail");
    }

    #[test]
    fn release_then_commit_fails() {
        let mut r = make();
        assert!(r.mark_released().unwrap());
        assert!(r.mark_committed(Txid([1; 32])).is_err(), "RELEASED → COMMITTED must fail");
    }

    #[test]
    fn repeated_commit_same_txid_is_noop() {
        let mut r = make();
        assert!(r.mark_committed(Txid([1; 32])).unwrap());
        assert!(!r.mark_committed(Txid([1; 32])).unwrap());
        assert!(r.mark_committed(Txid([2; 32])).is_err());
    }

    #[test]
    fn repeated_release_is_noop() {
        let mut r = make();
        assert!(r.mark_released().unwrap());
        assert!(!r.mark_released().unwrap());
    }

    #[test]
    fn change_is_excess_over_amount() {
        let mut r = make();
        r.amount = Amount::from_sat(30_000);
        assert_eq!(r.change(), Amount::from_sat(20_000));
    }

    #[test]
    fn serde_roundtrip() {
        let r = make();
        let json = serde_json::to_string(&r).unwrap();
        let back: Reservation = serde_json::from_str(&json).unwrap();
        assert_eq!(r, back);
    }
}
