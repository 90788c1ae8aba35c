//! Interfaces to external collaborators.
//!
//! The coordinator consumes the chain, the script interpreter, the credential
//! scheme and the coinjoin history only through these traits, so each can be
//! swapped for an in-memory implementation in tests.

use async_trait::async_trait;
use bitcoin::{OutPoint, Transaction, TxOut, Txid, Witness};

use crate::error::Result;
use crate::types::{Coin, Credential, RoundId};

// ═══════════════════════════════════════════════════════════════════════════════
// CHAIN BACKEND
// ═══════════════════════════════════════════════════════════════════════════════

/// Unspent output as reported by the chain backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UtxoInfo {
    /// The output itself.
    pub tx_out: TxOut,
    /// Confirmations; zero while in the mempool.
    pub confirmations: u32,
    /// True if created by a coinbase transaction.
    pub is_coinbase: bool,
}

/// Interface to the UTXO set and transaction relay.
#[async_trait]
pub trait UtxoProvider: Send + Sync {
    /// Looks up an unspent output. Returns None if it does not exist or is spent.
    async fn get_tx_out(&self, outpoint: &OutPoint, include_mempool: bool) -> Result<Option<UtxoInfo>>;

    /// Returns the current chain height.
    async fn get_block_count(&self) -> Result<u64>;

    /// Broadcasts a fully signed transaction.
    async fn broadcast(&self, tx: &Transaction) -> Result<Txid>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// SIGNATURES
// ═══════════════════════════════════════════════════════════════════════════════

/// Script and ownership-proof verification.
///
/// Only the script templates a round accepts need to be understood.
pub trait SignatureVerifier: Send + Sync {
    /// Verifies the proof that the registrant controls `coin`, bound to `round_id`.
    fn verify_ownership_proof(&self, coin: &Coin, proof: &[u8], round_id: &RoundId) -> bool;

    /// Verifies `witness` for input `input_index` of `tx`.
    ///
    /// `prevouts` holds the output spent by every input of `tx`, in input order.
    fn verify_witness(&self, tx: &Transaction, input_index: usize, prevouts: &[TxOut], witness: &Witness) -> bool;
}

// ═══════════════════════════════════════════════════════════════════════════════
// CREDENTIALS
// ═══════════════════════════════════════════════════════════════════════════════

/// A per-round credential issuer.
///
/// Stands in for the anonymous-credential scheme: it issues credentials,
/// checks presented ones and tracks the outstanding balance.
pub trait CredentialPool: Send + Sync {
    /// Issues a credential worth `value`.
    fn issue(&self, value: u64) -> Credential;

    /// Checks that every presented credential was issued by this pool, is
    /// unspent, carries the issued value and appears once. Returns the total.
    fn verify(&self, presented: &[Credential]) -> Result<u64>;

    /// Verifies and spends the presented credentials. Returns the total.
    fn redeem(&self, presented: &[Credential]) -> Result<u64>;

    /// Value issued and not yet redeemed.
    fn outstanding(&self) -> u64;
}

// ═══════════════════════════════════════════════════════════════════════════════
// COINJOIN HISTORY
// ═══════════════════════════════════════════════════════════════════════════════

/// Set of coinjoin transaction ids this coordinator produced.
pub trait CoinJoinIdStore: Send + Sync {
    /// Returns true if `txid` is a coinjoin of this coordinator.
    fn contains(&self, txid: &Txid) -> bool;

    /// Records a coinjoin. Returns false if it was already known.
    fn add(&self, txid: Txid) -> bool;
}
