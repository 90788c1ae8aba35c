//! Coin risk verification.
//!
//! Checks are scheduled as coins register, so the API calls overlap with the
//! registration phase, and collected when input registration closes. Coins
//! sharing a script share one API call.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use bitcoin::{OutPoint, ScriptBuf};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use wabisabi_core::{Coin, CoordinatorError, Result, SharedConfig};

use crate::api_client::{ApiResponse, CoinVerifierApiClient};
use crate::whitelist::Whitelist;

/// Why a coin got its verdict.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type")]
pub enum VerifyReason {
    /// Clean verdict still cached.
    Whitelisted,
    /// Too few confirmations to be sent to the API.
    Immature,
    RemoteApiChecked { flags: Vec<u32> },
    /// Shares its script with another coin of the batch that was checked.
    AddressReusedInBatch,
    /// The API could not produce a verdict.
    Exception(String),
    /// No verdict before the deadline.
    Cancelled,
}

/// Verdict for one coin.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CoinVerifyResult {
    pub coin: Coin,
    pub should_ban: bool,
    pub should_remove: bool,
    pub reason: VerifyReason,
}

impl CoinVerifyResult {
    fn clean(coin: Coin, reason: VerifyReason) -> Self {
        Self {
            coin,
            should_ban: false,
            should_remove: false,
            reason,
        }
    }
}

/// A coin submitted for verification.
#[derive(Clone, Debug)]
pub struct CandidateCoin {
    pub coin: Coin,
    pub confirmations: u32,
}

type ReportTask = JoinHandle<Result<ApiResponse>>;

/// An API call in flight and the outpoints waiting on it.
struct ScheduledCheck {
    task: ReportTask,
    outpoints: HashSet<OutPoint>,
}

/// Schedules and interprets risk checks.
pub struct CoinVerifier {
    client: Arc<CoinVerifierApiClient>,
    whitelist: Arc<Whitelist>,
    config: SharedConfig,
    scheduled: Mutex<HashMap<ScriptBuf, ScheduledCheck>>,
}

impl CoinVerifier {
    pub fn new(client: CoinVerifierApiClient, whitelist: Arc<Whitelist>, config: SharedConfig) -> Self {
        Self {
            client: Arc::new(client),
            whitelist,
            config,
            scheduled: Mutex::new(HashMap::new()),
        }
    }

    /// Builds the client from the live config.
    pub fn from_config(whitelist: Arc<Whitelist>, config: SharedConfig) -> Result<Self> {
        let client = CoinVerifierApiClient::new(&config.read().coin_verifier)?;
        Ok(Self::new(client, whitelist, config))
    }

    pub fn is_enabled(&self) -> bool {
        self.config.read().coin_verifier.enabled
    }

    pub fn whitelist(&self) -> &Arc<Whitelist> {
        &self.whitelist
    }

    fn needs_check(&self, candidate: &CandidateCoin) -> bool {
        candidate.confirmations >= self.config.read().coin_verifier.required_confirmations
            && !self.whitelist.contains(&candidate.coin.outpoint)
    }

    /// Starts the API call for `candidate` in the background after the configured delay.
    ///
    /// Coins that are whitelisted, immature, or whose script already has a
    /// check in flight are not scheduled. Returns true if a call was started.
    pub fn schedule(&self, candidate: &CandidateCoin) -> bool {
        if !self.is_enabled() || !self.needs_check(candidate) {
            return false;
        }

        let script = candidate.coin.script_pubkey().to_owned();
        let mut scheduled = self.scheduled.lock();
        if let Some(check) = scheduled.get_mut(&script) {
            check.outpoints.insert(candidate.coin.outpoint);
            return false;
        }

        let delay = self.config.read().coin_verifier.start_delay();
        let task = self.spawn_check(script.clone(), delay);
        scheduled.insert(
            script,
            ScheduledCheck {
                task,
                outpoints: HashSet::from([candidate.coin.outpoint]),
            },
        );
        debug!(outpoint = %candidate.coin.outpoint, "Coin verification scheduled");
        true
    }

    fn spawn_check(&self, script: ScriptBuf, delay: Duration) -> ReportTask {
        let client = Arc::clone(&self.client);
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            client.get_report(&script).await
        })
    }

    /// Collects verdicts for `candidates`, waiting at most `timeout` for API answers.
    ///
    /// Returns an empty list when verification is disabled. Infrastructure
    /// failures never ban: an exhausted API call yields an unpunished,
    /// unwhitelisted verdict, and a missed deadline only removes the coin.
    pub async fn verify_coins(&self, candidates: Vec<CandidateCoin>, timeout: Duration) -> Vec<CoinVerifyResult> {
        if !self.is_enabled() {
            return Vec::new();
        }

        let harmless = self.config.read().coin_verifier.harmless_risk_flags.clone();
        let required = self.config.read().coin_verifier.required_confirmations;

        let mut results = Vec::with_capacity(candidates.len());
        let mut groups: Vec<(ScriptBuf, Vec<Coin>)> = Vec::new();

        for candidate in candidates {
            if self.whitelist.contains(&candidate.coin.outpoint) {
                results.push(CoinVerifyResult::clean(candidate.coin, VerifyReason::Whitelisted));
            } else if candidate.confirmations < required {
                results.push(CoinVerifyResult::clean(candidate.coin, VerifyReason::Immature));
            } else {
                let script = candidate.coin.script_pubkey().to_owned();
                match groups.iter_mut().find(|(s, _)| *s == script) {
                    Some((_, coins)) => coins.push(candidate.coin),
                    None => groups.push((script, vec![candidate.coin])),
                }
            }
        }

        let tasks: Vec<ReportTask> = {
            let mut scheduled = self.scheduled.lock();
            groups
                .iter()
                .map(|(script, _)| {
                    scheduled
                        .remove(script)
                        .map(|check| check.task)
                        .unwrap_or_else(|| self.spawn_check(script.clone(), Duration::ZERO))
                })
                .collect()
        };

        let deadline = tokio::time::Instant::now() + timeout;
        let outcomes = join_all(tasks.into_iter().map(|mut task| async move {
            match tokio::time::timeout_at(deadline, &mut task).await {
                Ok(Ok(outcome)) => Some(outcome),
                Ok(Err(join_error)) => Some(Err(CoordinatorError::InternalError(join_error.to_string()))),
                Err(_) => {
                    task.abort();
                    None
                }
            }
        }))
        .await;

        for ((_, coins), outcome) in groups.into_iter().zip(outcomes) {
            results.extend(self.interpret(coins, outcome, &harmless));
        }

        let banned = results.iter().filter(|r| r.should_ban).count();
        let removed = results.iter().filter(|r| r.should_remove).count();
        info!(checked = results.len(), banned, removed, "Coin verification finished");
        results
    }

    fn interpret(&self, coins: Vec<Coin>, outcome: Option<Result<ApiResponse>>, harmless: &[u32]) -> Vec<CoinVerifyResult> {
        let (should_ban, should_remove, reason) = match outcome {
            Some(Ok(report)) => {
                let flags = report.flag_ids();
                let naughty = flags.iter().any(|id| !harmless.contains(id));
                (naughty, false, VerifyReason::RemoteApiChecked { flags })
            }
            Some(Err(e)) => {
                warn!(error = %e, "Coin verification failed, letting coin through");
                (false, false, VerifyReason::Exception(e.to_string()))
            }
            None => (false, true, VerifyReason::Cancelled),
        };

        let clean = matches!(reason, VerifyReason::RemoteApiChecked { .. }) && !should_ban;

        coins
            .into_iter()
            .enumerate()
            .map(|(i, coin)| {
                if clean {
                    self.whitelist.add(coin.outpoint);
                } else if should_ban {
                    self.whitelist.remove(&coin.outpoint);
                }
                let reason = if i == 0 {
                    reason.clone()
                } else {
                    VerifyReason::AddressReusedInBatch
                };
                CoinVerifyResult {
                    coin,
                    should_ban,
                    should_remove,
                    reason,
                }
            })
            .collect()
    }

    /// Aborts every scheduled check without producing verdicts.
    pub fn cancel_all(&self) {
        let scheduled = std::mem::take(&mut *self.scheduled.lock());
        let count = scheduled.len();
        for check in scheduled.into_values() {
            check.task.abort();
        }
        if count > 0 {
            debug!(count, "Cancelled scheduled coin verifications");
        }
    }

    /// Forgets a coin that left the round.
    ///
    /// The API call is aborted only once no other scheduled coin shares its script.
    pub fn unschedule(&self, outpoint: &OutPoint, script: &ScriptBuf) {
        let mut scheduled = self.scheduled.lock();
        let Some(check) = scheduled.get_mut(script) else {
            return;
        };
        check.outpoints.remove(outpoint);
        if check.outpoints.is_empty() {
            if let Some(check) = scheduled.remove(script) {
                check.task.abort();
            }
            debug!(%outpoint, "Coin verification unscheduled");
        }
    }

    /// Number of scripts with a check in flight.
    pub fn scheduled_count(&self) -> usize {
        self.scheduled.lock().len()
    }
}
