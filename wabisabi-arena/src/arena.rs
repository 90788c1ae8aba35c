//! Round manager.
//!
//! The arena owns every round and advances them on a periodic tick. Request
//! handlers and the tick share the same [`Round`] objects and serialize on
//! each round's mutex. Registration additionally takes the arena-wide
//! registration lock so an outpoint is never committed to two open rounds.

use std::collections::HashMap;
use std::sync::Arc;

use bitcoin::OutPoint;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use wabisabi_core::{
    CoinJoinIdStore, CoordinatorError, EndRoundState, Phase, ProtocolErrorCode, Result, RoundId, SharedClock,
    SharedConfig, SignatureVerifier, UtxoProvider, WabiSabiConfig,
};
use wabisabi_prison::{DisruptionMethod, Offense, Prison};
use wabisabi_verifier::{CandidateCoin, CoinVerifier};

use crate::params::RoundParameters;
use crate::participants::Alice;
use crate::round::{Round, RoundState, RoundStatus};

/// Owner of all rounds.
pub struct Arena {
    rounds: RwLock<HashMap<RoundId, Arc<Round>>>,
    registration_lock: Mutex<()>,
    tick_lock: tokio::sync::Mutex<()>,
    pub(crate) config: SharedConfig,
    pub(crate) clock: SharedClock,
    pub(crate) prison: Arc<Prison>,
    pub(crate) utxos: Arc<dyn UtxoProvider>,
    pub(crate) signatures: Arc<dyn SignatureVerifier>,
    pub(crate) coinjoin_ids: Arc<dyn CoinJoinIdStore>,
    pub(crate) coin_verifier: Option<Arc<CoinVerifier>>,
}

impl Arena {
    pub fn new(
        config: SharedConfig,
        clock: SharedClock,
        prison: Arc<Prison>,
        utxos: Arc<dyn UtxoProvider>,
        signatures: Arc<dyn SignatureVerifier>,
        coinjoin_ids: Arc<dyn CoinJoinIdStore>,
    ) -> Self {
        Self {
            rounds: RwLock::new(HashMap::new()),
            registration_lock: Mutex::new(()),
            tick_lock: tokio::sync::Mutex::new(()),
            config,
            clock,
            prison,
            utxos,
            signatures,
            coinjoin_ids,
            coin_verifier: None,
        }
    }

    /// Enables external coin verification.
    pub fn with_coin_verifier(mut self, coin_verifier: Arc<CoinVerifier>) -> Self {
        self.coin_verifier = Some(coin_verifier);
        self
    }

    pub fn config(&self) -> &SharedConfig {
        &self.config
    }

    pub fn prison(&self) -> &Arc<Prison> {
        &self.prison
    }

    pub fn coin_verifier(&self) -> Option<&Arc<CoinVerifier>> {
        self.coin_verifier.as_ref()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // ROUND LOOKUP
    // ═══════════════════════════════════════════════════════════════════════════

    pub fn try_get_round(&self, id: &RoundId) -> Option<Arc<Round>> {
        self.rounds.read().get(id).cloned()
    }

    /// Like [`Arena::try_get_round`] but fails with `RoundNotFound`.
    pub fn get_round(&self, id: &RoundId) -> Result<Arc<Round>> {
        self.try_get_round(id)
            .ok_or_else(|| CoordinatorError::protocol(ProtocolErrorCode::RoundNotFound, id.to_string()))
    }

    /// All rounds, oldest first.
    pub fn rounds(&self) -> Vec<Arc<Round>> {
        let mut rounds: Vec<Arc<Round>> = self.rounds.read().values().cloned().collect();
        rounds.sort_by_key(|r| r.created_at);
        rounds
    }

    /// Status snapshots of all rounds.
    pub fn status(&self) -> Vec<RoundStatus> {
        let config = self.config.read().clone();
        self.rounds().iter().map(|r| r.status(&config)).collect()
    }

    /// The open round an outpoint is registered in, if any.
    pub fn find_round_with_input(&self, outpoint: &OutPoint) -> Option<Arc<Round>> {
        self.rounds().into_iter().find(|round| {
            let state = round.lock();
            !state.is_ended() && state.contains_input(outpoint)
        })
    }

    fn insert_round(&self, round: Round) -> Arc<Round> {
        let round = Arc::new(round);
        self.rounds.write().insert(round.id, Arc::clone(&round));
        round
    }

    /// Creates a standard round in input registration.
    pub fn create_round(&self) -> Arc<Round> {
        let params = RoundParameters::from_config(&self.config.read());
        let round = self.insert_round(Round::new(params, self.clock.now()));
        info!(
            round_id = %round.id,
            max_inputs = round.params.max_input_count,
            min_inputs = round.params.min_input_count,
            "Round created"
        );
        round
    }

    fn create_blame_round(&self, parent: &Round, survivors: &[Alice], now: DateTime<Utc>) -> Arc<Round> {
        let deadline = now + self.config.read().connection_confirmation_timeout();
        let seeded: Vec<Alice> = survivors.iter().map(|a| a.seed_for_blame_round(deadline)).collect();
        let round = self.insert_round(Round::new_blame(parent, seeded, now));
        info!(round_id = %round.id, blame_of = %parent.id, alices = survivors.len(), "Blame round created");
        round
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // REGISTRATION
    // ═══════════════════════════════════════════════════════════════════════════

    /// Adds `alice` to `round`, keeping outpoints disjoint across open rounds.
    ///
    /// An Alice with exactly the same inputs already in this round is kept and
    /// her id returned; Alices sharing only some of the inputs are replaced.
    /// Any of the inputs sitting in another open round fails the call.
    pub(crate) fn commit_alice(&self, round: &Arc<Round>, mut alice: Alice) -> Result<Alice> {
        let _registration = self.registration_lock.lock();
        let config = self.config.read().clone();
        let now = self.clock.now();

        for other in self.rounds() {
            if other.id == round.id {
                continue;
            }
            let state = other.lock();
            if !state.is_ended() && alice.outpoints().any(|op| state.contains_input(op)) {
                return Err(CoordinatorError::protocol(
                    ProtocolErrorCode::AliceAlreadyRegistered,
                    format!("input registered in round {}", other.id),
                ));
            }
        }

        let mut state = round.lock();
        if state.phase != Phase::InputRegistration || state.input_registration_closed {
            return Err(CoordinatorError::protocol(ProtocolErrorCode::WrongPhase, "input registration is over"));
        }

        if let Some(existing) = state
            .alices
            .iter_mut()
            .find(|a| a.coins.len() == alice.coins.len() && alice.outpoints().all(|op| a.owns(op)))
        {
            existing.ownership_proofs = alice.ownership_proofs;
            existing.set_deadline_relative_to(now, config.connection_confirmation_timeout());
            debug!(round_id = %round.id, alice_id = %existing.id, "Alice re-registered");
            return Ok(existing.clone());
        }

        if !round.accepts_inputs(&state, now, &config) {
            return Err(CoordinatorError::protocol(ProtocolErrorCode::WrongPhase, "round is not accepting inputs"));
        }
        let incoming: Vec<OutPoint> = alice.outpoints().copied().collect();
        if !round.has_room_for(&state, &incoming) {
            return Err(CoordinatorError::protocol(
                ProtocolErrorCode::WrongPhase,
                "registration would exceed the round's input cap",
            ));
        }

        let replaced = state.drain_alices(|a| alice.outpoints().any(|op| a.owns(op)));
        if !replaced.is_empty() {
            debug!(round_id = %round.id, count = replaced.len(), "Replaced overlapping Alices");
        }

        alice.set_deadline_relative_to(now, config.connection_confirmation_timeout());
        state.alices.push(alice.clone());
        info!(
            round_id = %round.id,
            alice_id = %alice.id,
            inputs = alice.coins.len(),
            alices = state.alices.len(),
            "Alice registered"
        );
        Ok(alice)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // DISRUPTION
    // ═══════════════════════════════════════════════════════════════════════════

    /// Flags the open round holding `outpoint` as disrupted. Returns its id.
    pub fn mark_disrupted(&self, outpoint: &OutPoint) -> Option<RoundId> {
        let round = self.find_round_with_input(outpoint)?;
        let mut state = round.lock();
        if state.is_ended() {
            return None;
        }
        state.disruption_count += 1;
        state.double_spent_inputs.insert(*outpoint);
        warn!(round_id = %round.id, %outpoint, phase = %state.phase, "Round input double-spent");
        Some(round.id)
    }

    fn end_disrupted(&self, round: &Round, state: &mut RoundState, now: DateTime<Utc>) {
        let double_spent = state.double_spent_inputs.clone();
        let offenders = state.drain_alices(|a| a.outpoints().any(|op| double_spent.contains(op)));
        round.end(state, EndRoundState::AbortedDoubleSpendingDetected, now);

        let survivors = state.alices.clone();
        info!(
            round_id = %round.id,
            offenders = offenders.len(),
            survivors = survivors.len(),
            "Disrupted round aborted"
        );
        if survivors.iter().map(|a| a.coins.len()).sum::<usize>() >= round.params.min_input_count {
            self.create_blame_round(round, &survivors, now);
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // TICK
    // ═══════════════════════════════════════════════════════════════════════════

    /// Advances every round once, then removes stale rounds and opens a new one if needed.
    pub async fn tick(&self) {
        let _tick = self.tick_lock.lock().await;
        let config = self.config.read().clone();

        let rounds = self.rounds();
        join_all(rounds.iter().map(|round| self.step(round, &config))).await;

        self.housekeeping(&config);
    }

    async fn step(&self, round: &Arc<Round>, config: &WabiSabiConfig) {
        let phase = {
            let mut state = round.lock();
            if state.is_ended() {
                return;
            }
            if state.is_disrupted() {
                self.end_disrupted(round, &mut state, self.clock.now());
                return;
            }
            state.phase
        };

        match phase {
            Phase::InputRegistration => self.step_input_registration(round, config).await,
            Phase::ConnectionConfirmation => self.step_connection_confirmation(round, config),
            Phase::OutputRegistration => self.step_output_registration(round, config),
            Phase::TransactionSigning => self.step_transaction_signing(round, config).await,
            Phase::Ended => {}
        }
    }

    async fn step_input_registration(&self, round: &Arc<Round>, config: &WabiSabiConfig) {
        let now = self.clock.now();
        let candidates = {
            let mut state = round.lock();
            if state.phase != Phase::InputRegistration {
                return;
            }

            let full = state.input_count() >= round.params.max_input_count;
            let timed_out = round.input_registration_timed_out(&state, now, config);

            if !full && !timed_out {
                let expired = state.drain_alices(|a| a.deadline < now);
                for alice in &expired {
                    self.unschedule(alice);
                    debug!(round_id = %round.id, alice_id = %alice.id, "Alice missed her deadline");
                }
                return;
            }

            if state.input_count() < round.params.min_input_count {
                round.end(&mut state, EndRoundState::AbortedNotEnoughAlices, now);
                return;
            }

            state.input_registration_closed = true;
            state.alices.iter().flat_map(|a| a.coins.iter()).cloned().collect::<Vec<_>>()
        };

        self.verify_round_coins(round, candidates, config).await;

        let now = self.clock.now();
        let mut state = round.lock();
        if state.phase != Phase::InputRegistration {
            return;
        }
        if state.input_count() >= round.params.min_input_count {
            round.set_phase(&mut state, Phase::ConnectionConfirmation, now);
        } else {
            round.end(&mut state, EndRoundState::AbortedNotEnoughAlices, now);
        }
    }

    async fn verify_round_coins(&self, round: &Arc<Round>, coins: Vec<wabisabi_core::Coin>, config: &WabiSabiConfig) {
        let Some(verifier) = self.coin_verifier.as_ref().filter(|v| v.is_enabled()) else {
            return;
        };

        let mut candidates = Vec::with_capacity(coins.len());
        for coin in coins {
            let confirmations = match self.utxos.get_tx_out(&coin.outpoint, true).await {
                Ok(Some(info)) => info.confirmations,
                Ok(None) => 0,
                Err(e) => {
                    warn!(outpoint = %coin.outpoint, error = %e, "UTXO lookup failed during verification");
                    0
                }
            };
            candidates.push(CandidateCoin { coin, confirmations });
        }

        let results = verifier.verify_coins(candidates, config.coin_verifier.verification_timeout()).await;

        let mut state = round.lock();
        for result in results.iter().filter(|r| r.should_ban || r.should_remove) {
            let outpoint = result.coin.outpoint;
            if result.should_ban {
                self.prison.ban(outpoint, Offense::FailedToVerify, Some(round.id));
            }
            let removed = state.drain_alices(|a| a.owns(&outpoint));
            for alice in removed {
                info!(
                    round_id = %round.id,
                    alice_id = %alice.id,
                    %outpoint,
                    banned = result.should_ban,
                    "Alice removed after coin verification"
                );
            }
        }
    }

    fn step_connection_confirmation(&self, round: &Arc<Round>, config: &WabiSabiConfig) {
        let now = self.clock.now();
        let mut state = round.lock();
        if state.phase != Phase::ConnectionConfirmation {
            return;
        }

        if state.alices.iter().all(|a| a.confirmed_connection) {
            round.set_phase(&mut state, Phase::OutputRegistration, now);
            return;
        }

        if !round.phase_timed_out(&state, now, config) {
            return;
        }

        let unconfirmed = state.drain_alices(|a| !a.confirmed_connection);
        for alice in &unconfirmed {
            for coin in &alice.coins {
                self.prison
                    .note(coin.outpoint, DisruptionMethod::DidNotConfirm, coin.amount().to_sat(), Some(round.id));
            }
        }
        info!(round_id = %round.id, evicted = unconfirmed.len(), remaining = state.alices.len(), "Connection confirmation timed out");

        if state.input_count() >= round.params.min_input_count {
            round.set_phase(&mut state, Phase::OutputRegistration, now);
        } else {
            round.end(&mut state, EndRoundState::AbortedNotEnoughAlices, now);
        }
    }

    fn step_output_registration(&self, round: &Arc<Round>, config: &WabiSabiConfig) {
        let now = self.clock.now();
        let mut state = round.lock();
        if state.phase != Phase::OutputRegistration {
            return;
        }

        let all_ready = state.alices.iter().all(|a| a.ready_to_sign);
        let exhausted = round.amount_credentials().outstanding() < round.params.min_output_cost();
        let timed_out = round.phase_timed_out(&state, now, config);

        if !all_ready && !exhausted && !timed_out {
            return;
        }

        if timed_out && !all_ready && !exhausted {
            for alice in state.alices.iter().filter(|a| !a.ready_to_sign) {
                for coin in &alice.coins {
                    self.prison.note(
                        coin.outpoint,
                        DisruptionMethod::DidNotSignalReadyToSign,
                        coin.amount().to_sat(),
                        Some(round.id),
                    );
                }
            }
        }

        match round.build_coinjoin(&state) {
            Some(coinjoin) => {
                info!(
                    round_id = %round.id,
                    inputs = coinjoin.input.len(),
                    outputs = coinjoin.output.len(),
                    "Coinjoin assembled"
                );
                state.coinjoin = Some(coinjoin);
                round.set_phase(&mut state, Phase::TransactionSigning, now);
            }
            None => round.end(&mut state, EndRoundState::AbortedNoOutputs, now),
        }
    }

    async fn step_transaction_signing(&self, round: &Arc<Round>, config: &WabiSabiConfig) {
        let now = self.clock.now();
        let signed = {
            let mut state = round.lock();
            if state.phase != Phase::TransactionSigning || state.broadcasting {
                return;
            }

            if state.is_fully_signed() {
                state.broadcasting = true;
                state.signed_coinjoin()
            } else {
                if round.phase_timed_out(&state, now, config) {
                    self.fail_signing(round, &mut state, now);
                }
                return;
            }
        };

        let Some(tx) = signed else {
            return;
        };
        let txid = tx.compute_txid();
        // Recorded before broadcasting so the mempool watcher never mistakes it for a double-spend.
        self.coinjoin_ids.add(txid);

        let broadcast = tokio::time::timeout(config.rpc.timeout(), self.utxos.broadcast(&tx)).await;
        let now = self.clock.now();
        let mut state = round.lock();
        match broadcast {
            Ok(Ok(_)) => {
                info!(round_id = %round.id, %txid, "Coinjoin broadcast");
                // A completed round supersedes earlier notes on its inputs.
                for txin in &tx.input {
                    if self.prison.is_noted(&txin.previous_output) {
                        self.prison.try_release(&txin.previous_output);
                    }
                }
                round.end(&mut state, EndRoundState::TransactionBroadcasted, now);
            }
            Ok(Err(e)) => {
                error!(round_id = %round.id, %txid, error = %e, "Coinjoin broadcast failed");
                round.end(&mut state, EndRoundState::TransactionBroadcastFailed, now);
            }
            Err(_) => {
                error!(round_id = %round.id, %txid, "Coinjoin broadcast timed out");
                round.end(&mut state, EndRoundState::TransactionBroadcastFailed, now);
            }
        }
    }

    fn fail_signing(&self, round: &Round, state: &mut RoundState, now: DateTime<Utc>) {
        let Some(tx) = state.coinjoin.clone() else {
            round.end(state, EndRoundState::AbortedWithError, now);
            return;
        };

        let signed_inputs: Vec<OutPoint> = tx
            .input
            .iter()
            .enumerate()
            .filter(|(i, _)| state.witnesses.contains_key(i))
            .map(|(_, txin)| txin.previous_output)
            .collect();

        let non_signers = state.drain_alices(|a| !a.outpoints().all(|op| signed_inputs.contains(op)));
        for alice in &non_signers {
            for coin in &alice.coins {
                self.prison.ban(
                    coin.outpoint,
                    Offense::RoundDisruption {
                        method: DisruptionMethod::DidNotSign,
                        value: coin.amount().to_sat(),
                    },
                    Some(round.id),
                );
            }
        }

        round.end(state, EndRoundState::AbortedNotEnoughAlicesSigned, now);
        let signers = state.alices.clone();
        info!(round_id = %round.id, non_signers = non_signers.len(), signers = signers.len(), "Signing timed out");

        if signers.iter().map(|a| a.coins.len()).sum::<usize>() >= round.params.min_input_count {
            self.create_blame_round(round, &signers, now);
        }
    }

    fn housekeeping(&self, config: &WabiSabiConfig) {
        let now = self.clock.now();
        let retention = config.ended_round_retention();

        let stale: Vec<RoundId> = self
            .rounds()
            .iter()
            .filter(|r| r.lock().ended_at.map(|t| t + retention <= now).unwrap_or(false))
            .map(|r| r.id)
            .collect();
        if !stale.is_empty() {
            let mut rounds = self.rounds.write();
            for id in &stale {
                rounds.remove(id);
            }
            debug!(count = stale.len(), "Removed ended rounds");
        }

        let has_open_round = self.rounds().iter().any(|r| {
            let state = r.lock();
            !r.is_blame_round() && state.phase == Phase::InputRegistration && !state.input_registration_closed
        });
        if !has_open_round {
            self.create_round();
        }

        if let Some(verifier) = &self.coin_verifier {
            verifier.whitelist().remove_expired();
        }
    }

    fn unschedule(&self, alice: &Alice) {
        if let Some(verifier) = &self.coin_verifier {
            for coin in &alice.coins {
                verifier.unschedule(&coin.outpoint, &coin.tx_out.script_pubkey);
            }
        }
    }

    /// Ticks on the configured period until `shutdown` flips to true.
    ///
    /// The period is re-read every iteration. A tick in progress always
    /// completes before the loop exits.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("Arena started");
        loop {
            let period = self.config.read().arena_period();
            tokio::select! {
                _ = tokio::time::sleep(period) => self.tick().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        if let Some(verifier) = &self.coin_verifier {
            verifier.cancel_all();
        }
        info!("Arena stopped");
    }
}
