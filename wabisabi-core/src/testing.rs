//! In-memory collaborators for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use bitcoin::hashes::Hash;
use bitcoin::{Amount, OutPoint, ScriptBuf, Transaction, TxOut, Txid, WPubkeyHash, Witness};
use parking_lot::Mutex;

use crate::error::{CoordinatorError, Result};
use crate::traits::{SignatureVerifier, UtxoProvider, UtxoInfo};
use crate::types::{Coin, RoundId};

/// Builds a distinct txid from a counter.
pub fn txid(n: u32) -> Txid {
    let mut bytes = [0u8; 32];
    bytes[..4].copy_from_slice(&n.to_le_bytes());
    bytes[31] = 0xab;
    Txid::from_byte_array(bytes)
}

/// Builds an outpoint on [`txid`]`(n)`.
pub fn outpoint(n: u32, vout: u32) -> OutPoint {
    OutPoint::new(txid(n), vout)
}

/// A P2WPKH script unique to `n`.
pub fn p2wpkh_script(n: u32) -> ScriptBuf {
    let mut bytes = [0u8; 20];
    bytes[..4].copy_from_slice(&n.to_le_bytes());
    ScriptBuf::new_p2wpkh(&WPubkeyHash::from_byte_array(bytes))
}

/// A P2WPKH coin worth `sats`.
pub fn coin(n: u32, sats: u64) -> Coin {
    Coin::new(
        outpoint(n, 0),
        TxOut {
            value: Amount::from_sat(sats),
            script_pubkey: p2wpkh_script(n),
        },
    )
}

/// A witness that the fake verifiers treat as valid.
pub fn valid_witness() -> Witness {
    Witness::from_slice(&[vec![1u8; 71], vec![2u8; 33]])
}

// ═══════════════════════════════════════════════════════════════════════════════
// UTXO PROVIDER
// ═══════════════════════════════════════════════════════════════════════════════

/// UTXO set held in memory.
#[derive(Debug, Default)]
pub struct MemoryUtxoProvider {
    utxos: Mutex<HashMap<OutPoint, UtxoInfo>>,
    broadcasted: Mutex<Vec<Transaction>>,
    height: AtomicU32,
    fail_broadcast: Mutex<bool>,
}

impl MemoryUtxoProvider {
    pub fn new() -> Self {
        Self {
            height: AtomicU32::new(800_000),
            ..Default::default()
        }
    }

    /// Adds a confirmed, non-coinbase coin.
    pub fn add_coin(&self, coin: &Coin) {
        self.add_utxo(coin, 6, false);
    }

    pub fn add_utxo(&self, coin: &Coin, confirmations: u32, is_coinbase: bool) {
        self.utxos.lock().insert(
            coin.outpoint,
            UtxoInfo {
                tx_out: coin.tx_out.clone(),
                confirmations,
                is_coinbase,
            },
        );
    }

    pub fn spend(&self, outpoint: &OutPoint) {
        self.utxos.lock().remove(outpoint);
    }

    pub fn set_fail_broadcast(&self, fail: bool) {
        *self.fail_broadcast.lock() = fail;
    }

    pub fn broadcasted(&self) -> Vec<Transaction> {
        self.broadcasted.lock().clone()
    }
}

#[async_trait]
impl UtxoProvider for MemoryUtxoProvider {
    async fn get_tx_out(&self, outpoint: &OutPoint, _include_mempool: bool) -> Result<Option<UtxoInfo>> {
        Ok(self.utxos.lock().get(outpoint).cloned())
    }

    async fn get_block_count(&self) -> Result<u64> {
        Ok(u64::from(self.height.load(Ordering::Relaxed)))
    }

    async fn broadcast(&self, tx: &Transaction) -> Result<Txid> {
        if *self.fail_broadcast.lock() {
            return Err(CoordinatorError::BroadcastRejected("rejected by test provider".into()));
        }
        self.broadcasted.lock().push(tx.clone());
        Ok(tx.compute_txid())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SIGNATURE VERIFIERS
// ═══════════════════════════════════════════════════════════════════════════════

/// Accepts every non-empty proof and witness.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAllVerifier;

impl SignatureVerifier for AcceptAllVerifier {
    fn verify_ownership_proof(&self, _coin: &Coin, proof: &[u8], _round_id: &RoundId) -> bool {
        !proof.is_empty()
    }

    fn verify_witness(&self, _tx: &Transaction, _input_index: usize, _prevouts: &[TxOut], witness: &Witness) -> bool {
        !witness.is_empty()
    }
}

/// Rejects everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct RejectAllVerifier;

impl SignatureVerifier for RejectAllVerifier {
    fn verify_ownership_proof(&self, _coin: &Coin, _proof: &[u8], _round_id: &RoundId) -> bool {
        false
    }

    fn verify_witness(&self, _tx: &Transaction, _input_index: usize, _prevouts: &[TxOut], _witness: &Witness) -> bool {
        false
    }
}
