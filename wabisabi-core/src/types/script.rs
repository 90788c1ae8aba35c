//! Script templates accepted by rounds.

use bitcoin::Script;
use serde::{Deserialize, Serialize};

use crate::constants::*;

/// Script type of an input or output.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptType {
    /// Native SegWit v0 pay-to-witness-pubkey-hash.
    P2wpkh,
    /// SegWit v1 pay-to-taproot.
    Taproot,
}

impl ScriptType {
    /// Classifies a script pubkey. Returns None for unsupported templates.
    pub fn from_script(script: &Script) -> Option<Self> {
        if script.is_p2wpkh() {
            Some(Self::P2wpkh)
        } else if script.is_p2tr() {
            Some(Self::Taproot)
        } else {
            None
        }
    }

    /// Estimated virtual size of spending an output of this type.
    pub fn input_vsize(&self) -> u64 {
        match self {
            Self::P2wpkh => P2WPKH_INPUT_VSIZE,
            Self::Taproot => P2TR_INPUT_VSIZE,
        }
    }

    /// Virtual size of an output of this type.
    pub fn output_vsize(&self) -> u64 {
        match self {
            Self::P2wpkh => P2WPKH_OUTPUT_VSIZE,
            Self::Taproot => P2TR_OUTPUT_VSIZE,
        }
    }

    /// Weight of spending an output of this type.
    pub fn input_weight(&self) -> u64 {
        self.input_vsize() * WITNESS_SCALE_FACTOR
    }

    /// Weight of an output of this type.
    pub fn output_weight(&self) -> u64 {
        self.output_vsize() * WITNESS_SCALE_FACTOR
    }
}
