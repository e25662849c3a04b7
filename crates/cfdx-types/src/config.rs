//! Configuration types for CFDX daemons.
//!
//! Every deadline, retry and settlement knob is an explicit value here with
//! a default from [`constants`]. Loading these from files or flags is the
//! embedding binary's business.

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{Amount, Role, constants};

/// Deadlines for each phase that waits on the peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseTimeouts {
    /// Taker waiting for accept or reject.
    pub negotiation: Duration,
    /// Each of the three setup rounds.
    pub setup_round: Duration,
    /// Counter-signature on a collaborative close proposal.
    pub collaborative_close: Duration,
    /// Maker's signatures on a rollover proposal.
    pub rollover: Duration,
    /// Interval between outgoing heartbeats.
    pub heartbeat_interval: Duration,
    /// Silence after which the peer is considered gone.
    pub heartbeat_timeout: Duration,
}

impl Default for PhaseTimeouts {
    fn default() -> Self {
        Self {
            negotiation: Duration::from_millis(constants::DEFAULT_NEGOTIATION_TIMEOUT_MS),
            setup_round: Duration::from_millis(constants::DEFAULT_SETUP_ROUND_TIMEOUT_MS),
            collaborative_close: Duration::from_millis(constants::DEFAULT_COLLAB_CLOSE_TIMEOUT_MS),
            rollover: Duration::from_millis(constants::DEFAULT_ROLLOVER_TIMEOUT_MS),
            heartbeat_interval: Duration::from_millis(constants::DEFAULT_HEARTBEAT_INTERVAL_MS),
            heartbeat_timeout: Duration::from_millis(constants::DEFAULT_HEARTBEAT_TIMEOUT_MS),
        }
    }
}

/// Bounded exponential backoff for transaction broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl BroadcastPolicy {
    /// Delay before retry number `attempt` (1-based): `initial · 2^(attempt-1)`, capped.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl Default for BroadcastPolicy {
    fn default() -> Self {
        Self {
            max_attempts: constants::DEFAULT_BROADCAST_ATTEMPTS,
            initial_backoff: Duration::from_millis(constants::DEFAULT_BROADCAST_BACKOFF_MS),
            max_backoff: Duration::from_millis(constants::MAX_BROADCAST_BACKOFF_MS),
        }
    }
}

/// When an open position counts as breached and is closed unilaterally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum LiquidationPolicy {
    /// Breach when the mark price reaches the long liquidation price.
    #[default]
    LiquidationPrice,
    /// Breach when the long's equity at the mark price falls to
    /// `ratio · long margin` or below.
    MaintenanceMargin { ratio: Decimal },
}

/// Settlement knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementConfig {
    /// Number of payout buckets (CETs) per contract.
    pub n_payouts: usize,
    /// Accept a close proposal within this many basis points of our mark price.
    pub close_price_tolerance_bps: u32,
    pub liquidation_policy: LiquidationPolicy,
    /// How often an open contract asks the chain whether its funding output was spent.
    pub chain_poll_interval: Duration,
    /// How far a rollover pushes the expiry past `max(expiry, now)`.
    pub rollover_interval: Duration,
}

impl SettlementConfig {
    /// Tolerance as a fraction, e.g. 50 bps = 0.005.
    #[must_use]
    pub fn close_price_tolerance(&self) -> Decimal {
        Decimal::from(self.close_price_tolerance_bps) / Decimal::from(10_000)
    }
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            n_payouts: constants::DEFAULT_N_PAYOUTS,
            close_price_tolerance_bps: constants::DEFAULT_CLOSE_PRICE_TOLERANCE_BPS,
            liquidation_policy: LiquidationPolicy::default(),
            chain_poll_interval: Duration::from_millis(constants::DEFAULT_CHAIN_POLL_MS),
            rollover_interval: Duration::from_secs(
                constants::DEFAULT_SETTLEMENT_INTERVAL_HOURS.unsigned_abs() * 3600,
            ),
        }
    }
}

/// Restart intensity for supervised actors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Restarts allowed inside `restart_window` before giving up.
    pub max_restarts: u32,
    pub restart_window: Duration,
    pub restart_backoff: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_restarts: constants::DEFAULT_MAX_RESTARTS,
            restart_window: Duration::from_millis(constants::DEFAULT_RESTART_WINDOW_MS),
            restart_backoff: Duration::from_millis(constants::DEFAULT_RESTART_BACKOFF_MS),
        }
    }
}

/// Configuration for a single daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub role: Role,
    /// Address the maker listens on for takers.
    pub listen_addr: Option<SocketAddr>,
    /// Directory holding the persistence store.
    pub data_dir: PathBuf,
    /// Fee each party contributes to the funding transaction.
    pub funding_fee: Amount,
    pub timeouts: PhaseTimeouts,
    pub broadcast: BroadcastPolicy,
    pub settlement: SettlementConfig,
    pub supervisor: SupervisorConfig,
}

impl NodeConfig {
    #[must_use]
    pub fn new(role: Role, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            role,
            listen_addr: None,
            data_dir: data_dir.into(),
            funding_fee: Amount::from_sat(constants::DEFAULT_FUNDING_FEE_SATS),
            timeouts: PhaseTimeouts::default(),
            broadcast: BroadcastPolicy::default(),
            settlement: SettlementConfig::default(),
            supervisor: SupervisorConfig::default(),
        }
    }
}
