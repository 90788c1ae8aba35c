//! Protocol constants for the coordinator.
//!
//! Sizes follow BIP-141 weight accounting. Input and output sizes are the
//! standard estimates for the script types a round accepts.

use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// WEIGHT ACCOUNTING (BIP-141)
// ═══════════════════════════════════════════════════════════════════════════════

/// Weight units per virtual byte.
pub const WITNESS_SCALE_FACTOR: u64 = 4;

/// Virtual size of a P2WPKH input (outpoint, sequence, empty script sig, witness).
pub const P2WPKH_INPUT_VSIZE: u64 = 68;

/// Virtual size of a key-path Taproot input.
pub const P2TR_INPUT_VSIZE: u64 = 58;

/// Virtual size of a P2WPKH output.
pub const P2WPKH_OUTPUT_VSIZE: u64 = 31;

/// Virtual size of a P2TR output.
pub const P2TR_OUTPUT_VSIZE: u64 = 43;

/// Virtual size of the transaction skeleton (version, locktime, counts, marker).
pub const TX_SKELETON_VSIZE: u64 = 11;

/// Maximum weight of a standard transaction.
pub const MAX_STANDARD_TX_WEIGHT: u64 = 400_000;

// ═══════════════════════════════════════════════════════════════════════════════
// CHAIN RULES
// ═══════════════════════════════════════════════════════════════════════════════

/// Confirmations a coinbase output needs before it can be spent.
pub const COINBASE_MATURITY: u32 = 100;

/// Smallest output value the coordinator creates for itself.
pub const DUST_THRESHOLD_SATS: u64 = 294;

/// One bitcoin in satoshis.
pub const COIN_SATS: u64 = 100_000_000;

// ═══════════════════════════════════════════════════════════════════════════════
// PROTOCOL
// ═══════════════════════════════════════════════════════════════════════════════

/// Fraction of the connection confirmation timeout an Alice's deadline is
/// moved forward by on every confirmation.
pub const ALICE_DEADLINE_FRACTION: f64 = 0.9;

/// Current protocol version, reported by the status endpoint.
pub const PROTOCOL_VERSION: u8 = 2;

// ═══════════════════════════════════════════════════════════════════════════════
// RISK API
// ═══════════════════════════════════════════════════════════════════════════════

/// Backoff step between risk API attempts; the n-th retry waits n steps.
pub const RISK_API_RETRY_STEP: Duration = Duration::from_secs(1);
