//! Mempool watching for double-spends of round inputs.
//!
//! Every transaction seen by the node is checked against open rounds. A
//! transaction spending a registered input disrupts that round and its
//! outputs are banned. Transactions spending banned coins pass the ban down
//! to their outputs.

use std::sync::Arc;

use bitcoin::{OutPoint, Transaction};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use wabisabi_core::RoundId;
use wabisabi_prison::{DisruptionMethod, Offense};

use crate::arena::Arena;

/// Outcome of looking at one mempool transaction.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MempoolVerdict {
    /// Rounds flagged as disrupted.
    pub disrupted_rounds: Vec<RoundId>,
    /// Outputs banned as double-spending.
    pub banned_outputs: usize,
    /// Outputs that inherited a ban from a spent input.
    pub inherited_bans: usize,
}

/// Feeds mempool transactions into disruption detection.
pub struct CoinJoinMempoolManager {
    arena: Arc<Arena>,
}

impl CoinJoinMempoolManager {
    pub fn new(arena: Arc<Arena>) -> Self {
        Self { arena }
    }

    /// Checks one transaction. Our own coinjoins are ignored.
    pub fn process_transaction(&self, tx: &Transaction) -> MempoolVerdict {
        let txid = tx.compute_txid();
        let mut verdict = MempoolVerdict::default();
        if self.arena.coinjoin_ids.contains(&txid) {
            debug!(%txid, "Own coinjoin seen in mempool");
            return verdict;
        }

        let outputs: Vec<OutPoint> = (0..tx.output.len() as u32).map(|vout| OutPoint::new(txid, vout)).collect();
        let prison = &self.arena.prison;

        for txin in &tx.input {
            let spent = txin.previous_output;

            if let Some(round_id) = self.arena.mark_disrupted(&spent) {
                verdict.disrupted_rounds.push(round_id);
                for (outpoint, txout) in outputs.iter().zip(&tx.output) {
                    let offense = Offense::RoundDisruption {
                        method: DisruptionMethod::DoubleSpent,
                        value: txout.value.to_sat(),
                    };
                    if prison.ban(*outpoint, offense, Some(round_id)).is_banned() {
                        verdict.banned_outputs += 1;
                    }
                }
                warn!(%txid, %spent, %round_id, "Round input double-spent in mempool");
            }

            verdict.inherited_bans += prison.inherit_punishment(&spent, &outputs);
        }

        verdict
    }

    /// Processes transactions until `shutdown` flips to true or the feed closes.
    pub async fn run(self, mut transactions: broadcast::Receiver<Transaction>, mut shutdown: watch::Receiver<bool>) {
        info!("Mempool watcher started");
        loop {
            tokio::select! {
                received = transactions.recv() => match received {
                    Ok(tx) => {
                        self.process_transaction(&tx);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Mempool watcher lagged behind");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Mempool watcher stopped");
    }
}
