//! Coins registered into rounds.

use bitcoin::{Amount, OutPoint, Script, TxOut};
use serde::{Deserialize, Serialize};

use super::ScriptType;

/// An unspent output offered as a round input.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coin {
    /// The output being spent.
    pub outpoint: OutPoint,
    /// The previous output, as reported by the chain backend.
    pub tx_out: TxOut,
}

impl Coin {
    /// Creates a coin.
    pub fn new(outpoint: OutPoint, tx_out: TxOut) -> Self {
        Self { outpoint, tx_out }
    }

    /// Returns the coin value.
    pub fn amount(&self) -> Amount {
        self.tx_out.value
    }

    /// Returns the locking script.
    pub fn script_pubkey(&self) -> &Script {
        &self.tx_out.script_pubkey
    }

    /// Returns the script type, if supported.
    pub fn script_type(&self) -> Option<ScriptType> {
        ScriptType::from_script(&self.tx_out.script_pubkey)
    }

    /// Returns the estimated input weight, if the script type is supported.
    pub fn input_weight(&self) -> Option<u64> {
        self.script_type().map(|t| t.input_weight())
    }

    /// Returns the estimated input virtual size, if the script type is supported.
    pub fn input_vsize(&self) -> Option<u64> {
        self.script_type().map(|t| t.input_vsize())
    }
}
