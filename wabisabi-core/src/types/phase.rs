//! Round lifecycle.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Phase of a round. Phases only move forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Phase {
    InputRegistration,
    ConnectionConfirmation,
    OutputRegistration,
    TransactionSigning,
    Ended,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::InputRegistration => "InputRegistration",
            Self::ConnectionConfirmation => "ConnectionConfirmation",
            Self::OutputRegistration => "OutputRegistration",
            Self::TransactionSigning => "TransactionSigning",
            Self::Ended => "Ended",
        };
        f.write_str(s)
    }
}

/// How an ended round finished.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EndRoundState {
    /// Round has not ended.
    None,
    /// Coinjoin was broadcast.
    TransactionBroadcasted,
    /// Coinjoin was signed but the backend rejected it.
    TransactionBroadcastFailed,
    /// Too few inputs registered or confirmed.
    AbortedNotEnoughAlices,
    /// Too few inputs signed; signers continue in a blame round.
    AbortedNotEnoughAlicesSigned,
    /// A registered input was double spent.
    AbortedDoubleSpendingDetected,
    /// No outputs were registered.
    AbortedNoOutputs,
    /// Unexpected failure while advancing the round.
    AbortedWithError,
}

impl EndRoundState {
    /// Returns true if the round produced a coinjoin.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::TransactionBroadcasted)
    }
}
