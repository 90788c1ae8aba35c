//! Round participants.

use bitcoin::{OutPoint, ScriptBuf};
use chrono::{DateTime, Utc};

use wabisabi_core::{AliceId, Coin, ALICE_DEADLINE_FRACTION};

/// An input registrant.
#[derive(Clone, Debug)]
pub struct Alice {
    pub id: AliceId,
    pub coins: Vec<Coin>,
    pub ownership_proofs: Vec<Vec<u8>>,
    /// Removed during input registration once this passes without a confirmation.
    pub deadline: DateTime<Utc>,
    pub confirmed_connection: bool,
    pub ready_to_sign: bool,
}

impl Alice {
    pub fn new(coins: Vec<Coin>, ownership_proofs: Vec<Vec<u8>>, deadline: DateTime<Utc>) -> Self {
        Self {
            id: AliceId::new(),
            coins,
            ownership_proofs,
            deadline,
            confirmed_connection: false,
            ready_to_sign: false,
        }
    }

    pub fn outpoints(&self) -> impl Iterator<Item = &OutPoint> {
        self.coins.iter().map(|c| &c.outpoint)
    }

    pub fn owns(&self, outpoint: &OutPoint) -> bool {
        self.coins.iter().any(|c| c.outpoint == *outpoint)
    }

    pub fn total_amount(&self) -> u64 {
        self.coins.iter().map(|c| c.amount().to_sat()).sum()
    }

    /// Moves the deadline to a fraction of `timeout` after `now`.
    pub fn set_deadline_relative_to(&mut self, now: DateTime<Utc>, timeout: chrono::Duration) {
        let millis = (timeout.num_milliseconds() as f64 * ALICE_DEADLINE_FRACTION) as i64;
        self.deadline = now + chrono::Duration::milliseconds(millis);
    }

    /// Copy carried into a blame round: same id and coins, fresh progress.
    pub fn seed_for_blame_round(&self, deadline: DateTime<Utc>) -> Self {
        Self {
            id: self.id,
            coins: self.coins.clone(),
            ownership_proofs: self.ownership_proofs.clone(),
            deadline,
            confirmed_connection: false,
            ready_to_sign: false,
        }
    }
}

/// An output registrant.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Bob {
    pub script: ScriptBuf,
    /// Output value in sats.
    pub amount: u64,
    pub weight: u64,
}
