//! System-wide constants for the CFDX engine.

/// Satoshis per bitcoin.
pub const SATS_PER_BTC: u64 = 100_000_000;

/// Decimal places kept for prices after derivation (liquidation price etc.).
pub const PRICE_PRECISION: u32 = 8;

/// The only trading pair currently offered.
pub const DEFAULT_TRADING_PAIR: &str = "BTC/USD";

/// Default offer validity window in seconds.
pub const DEFAULT_OFFER_VALIDITY_SECS: i64 = 60;

/// Default settlement interval (acceptance to expiry) in hours.
pub const DEFAULT_SETTLEMENT_INTERVAL_HOURS: i64 = 24;

/// Fee allowance reserved on top of the margin when funding a contract.
pub const DEFAULT_FUNDING_FEE_SATS: u64 = 1_000;

/// Default number of payout buckets (contract execution transactions).
pub const DEFAULT_N_PAYOUTS: usize = 200;

/// Default tolerance, in basis points of the mark price, for accepting a
/// collaborative close proposal.
pub const DEFAULT_CLOSE_PRICE_TOLERANCE_BPS: u32 = 50;

/// Default deadline for the peer to answer a take request, in milliseconds.
pub const DEFAULT_NEGOTIATION_TIMEOUT_MS: u64 = 30_000;

/// Default deadline per setup round, in milliseconds.
pub const DEFAULT_SETUP_ROUND_TIMEOUT_MS: u64 = 30_000;

/// Default deadline for a collaborative close counter-signature, in milliseconds.
pub const DEFAULT_COLLAB_CLOSE_TIMEOUT_MS: u64 = 60_000;

/// Default deadline for the maker to sign a rollover, in milliseconds.
pub const DEFAULT_ROLLOVER_TIMEOUT_MS: u64 = 30_000;

/// Default interval between funding-output spend checks, in milliseconds.
pub const DEFAULT_CHAIN_POLL_MS: u64 = 10_000;

/// Default interval between outgoing heartbeats, in milliseconds.
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 5_000;

/// Default silence after which a peer is considered gone, in milliseconds.
pub const DEFAULT_HEARTBEAT_TIMEOUT_MS: u64 = 20_000;

/// Default broadcast attempts before giving up.
pub const DEFAULT_BROADCAST_ATTEMPTS: u32 = 5;

/// Default initial broadcast backoff in milliseconds (doubled per retry).
pub const DEFAULT_BROADCAST_BACKOFF_MS: u64 = 500;

/// Upper bound on a single broadcast backoff, in milliseconds.
pub const MAX_BROADCAST_BACKOFF_MS: u64 = 30_000;

/// Default maximum actor restarts inside one restart window.
pub const DEFAULT_MAX_RESTARTS: u32 = 3;

/// Default restart window in milliseconds.
pub const DEFAULT_RESTART_WINDOW_MS: u64 = 60_000;

/// Default delay before restarting a crashed actor, in milliseconds.
pub const DEFAULT_RESTART_BACKOFF_MS: u64 = 100;

/// Mailbox capacity for every actor.
pub const MAILBOX_CAPACITY: usize = 256;

/// Largest encrypted frame accepted from a peer, in bytes.
pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

/// Wire protocol version exchanged in `Hello`.
pub const WIRE_VERSION: u16 = 1;

/// Version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Engine name.
pub const ENGINE_NAME: &str = "CFDX";
