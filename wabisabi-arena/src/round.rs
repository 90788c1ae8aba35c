//! A single coinjoin round.
//!
//! All mutable state lives in [`RoundState`] behind the round's mutex. The
//! guard is never held across an `.await`; steps that need I/O copy what they
//! need out, release the lock, and re-check the phase when they come back.

use std::collections::{HashMap, HashSet};

use bitcoin::absolute::LockTime;
use bitcoin::transaction::Version;
use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use rand::RngCore;
use serde::Serialize;
use tracing::info;

use wabisabi_core::{
    AliceId, Coin, CoordinatorError, CredentialPool, EndRoundState, Phase, ProtocolErrorCode, Result, RoundId,
    WabiSabiConfig, DUST_THRESHOLD_SATS,
};

use crate::credentials::SerialNumberPool;
use crate::params::RoundParameters;
use crate::participants::{Alice, Bob};

/// Mutable part of a round.
#[derive(Debug)]
pub struct RoundState {
    pub phase: Phase,
    pub end_state: EndRoundState,
    pub phase_started_at: DateTime<Utc>,
    pub input_registration_started_at: DateTime<Utc>,
    /// Set while input registration is being closed (coin verification in flight).
    pub input_registration_closed: bool,
    pub ended_at: Option<DateTime<Utc>>,
    /// Insertion ordered.
    pub alices: Vec<Alice>,
    pub bobs: Vec<Bob>,
    pub coinjoin: Option<Transaction>,
    /// Witnesses by coinjoin input index.
    pub witnesses: HashMap<usize, Witness>,
    /// Number of double-spends observed against this round's inputs.
    pub disruption_count: u32,
    pub double_spent_inputs: HashSet<OutPoint>,
    /// Set once the signed coinjoin was handed to the broadcaster.
    pub broadcasting: bool,
}

impl RoundState {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            phase: Phase::InputRegistration,
            end_state: EndRoundState::None,
            phase_started_at: now,
            input_registration_started_at: now,
            input_registration_closed: false,
            ended_at: None,
            alices: Vec::new(),
            bobs: Vec::new(),
            coinjoin: None,
            witnesses: HashMap::new(),
            disruption_count: 0,
            double_spent_inputs: HashSet::new(),
            broadcasting: false,
        }
    }

    pub fn alice(&self, id: &AliceId) -> Result<&Alice> {
        self.alices
            .iter()
            .find(|a| a.id == *id)
            .ok_or_else(|| CoordinatorError::protocol(ProtocolErrorCode::AliceNotFound, id.to_string()))
    }

    pub fn alice_mut(&mut self, id: &AliceId) -> Result<&mut Alice> {
        self.alices
            .iter_mut()
            .find(|a| a.id == *id)
            .ok_or_else(|| CoordinatorError::protocol(ProtocolErrorCode::AliceNotFound, id.to_string()))
    }

    pub fn remove_alice(&mut self, id: &AliceId) -> Option<Alice> {
        let index = self.alices.iter().position(|a| a.id == *id)?;
        Some(self.alices.remove(index))
    }

    /// Removes and returns every Alice matching `predicate`.
    pub fn drain_alices(&mut self, mut predicate: impl FnMut(&Alice) -> bool) -> Vec<Alice> {
        let (removed, kept) = std::mem::take(&mut self.alices).into_iter().partition(|a| predicate(a));
        self.alices = kept;
        removed
    }

    pub fn alice_owning(&self, outpoint: &OutPoint) -> Option<&Alice> {
        self.alices.iter().find(|a| a.owns(outpoint))
    }

    pub fn contains_input(&self, outpoint: &OutPoint) -> bool {
        self.alice_owning(outpoint).is_some()
    }

    pub fn input_count(&self) -> usize {
        self.alices.iter().map(|a| a.coins.len()).sum()
    }

    pub fn is_ended(&self) -> bool {
        self.phase == Phase::Ended
    }

    pub fn is_disrupted(&self) -> bool {
        self.disruption_count > 0
    }

    /// Coin spent by each coinjoin input, by index.
    pub fn spent_coins(&self) -> Vec<Coin> {
        let Some(tx) = &self.coinjoin else {
            return Vec::new();
        };
        let coins: HashMap<OutPoint, &Coin> = self.alices.iter().flat_map(|a| a.coins.iter()).map(|c| (c.outpoint, c)).collect();
        tx.input
            .iter()
            .filter_map(|txin| coins.get(&txin.previous_output).map(|c| (*c).clone()))
            .collect()
    }

    /// Returns true if every coinjoin input carries a witness.
    pub fn is_fully_signed(&self) -> bool {
        self.coinjoin
            .as_ref()
            .map(|tx| (0..tx.input.len()).all(|i| self.witnesses.contains_key(&i)))
            .unwrap_or(false)
    }

    /// The coinjoin with all collected witnesses applied.
    pub fn signed_coinjoin(&self) -> Option<Transaction> {
        let mut tx = self.coinjoin.clone()?;
        for (index, witness) in &self.witnesses {
            if let Some(txin) = tx.input.get_mut(*index) {
                txin.witness = witness.clone();
            }
        }
        Some(tx)
    }
}

/// A coinjoin round.
pub struct Round {
    pub id: RoundId,
    pub params: RoundParameters,
    /// Round this one was started from after a failure.
    pub blame_of: Option<RoundId>,
    /// Outpoints a blame round accepts.
    blame_whitelist: HashSet<OutPoint>,
    pub created_at: DateTime<Utc>,
    amount_credentials: Box<dyn CredentialPool>,
    weight_credentials: Box<dyn CredentialPool>,
    unsigned_transaction_secret: String,
    state: Mutex<RoundState>,
}

impl Round {
    pub fn new(params: RoundParameters, now: DateTime<Utc>) -> Self {
        let mut secret = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);

        Self {
            id: RoundId::new(),
            params,
            blame_of: None,
            blame_whitelist: HashSet::new(),
            created_at: now,
            amount_credentials: Box::new(SerialNumberPool::new()),
            weight_credentials: Box::new(SerialNumberPool::new()),
            unsigned_transaction_secret: hex::encode(secret),
            state: Mutex::new(RoundState::new(now)),
        }
    }

    /// Creates a blame round of `parent` seeded with `alices`.
    pub fn new_blame(parent: &Round, alices: Vec<Alice>, now: DateTime<Utc>) -> Self {
        let seeded_inputs = alices.iter().map(|a| a.coins.len()).sum();
        let mut round = Self::new(parent.params.for_blame_round(seeded_inputs), now);
        round.blame_of = Some(parent.id);
        round.blame_whitelist = alices.iter().flat_map(|a| a.outpoints().copied()).collect();
        round.state.get_mut().alices = alices;
        round
    }

    pub fn is_blame_round(&self) -> bool {
        self.blame_of.is_some()
    }

    /// Returns true if a blame round accepts `outpoint`. Always true for normal rounds.
    pub fn is_whitelisted_for_blame(&self, outpoint: &OutPoint) -> bool {
        !self.is_blame_round() || self.blame_whitelist.contains(outpoint)
    }

    pub fn lock(&self) -> MutexGuard<'_, RoundState> {
        self.state.lock()
    }

    pub fn phase(&self) -> Phase {
        self.state.lock().phase
    }

    pub fn end_state(&self) -> EndRoundState {
        self.state.lock().end_state
    }

    pub fn is_disrupted(&self) -> bool {
        self.state.lock().is_disrupted()
    }

    pub fn amount_credentials(&self) -> &dyn CredentialPool {
        self.amount_credentials.as_ref()
    }

    pub fn weight_credentials(&self) -> &dyn CredentialPool {
        self.weight_credentials.as_ref()
    }

    pub fn unsigned_transaction_secret(&self) -> &str {
        &self.unsigned_transaction_secret
    }

    /// Moves `state` to `phase`.
    pub fn set_phase(&self, state: &mut RoundState, phase: Phase, now: DateTime<Utc>) {
        let from = state.phase;
        state.phase = phase;
        state.phase_started_at = now;
        info!(round_id = %self.id, %from, to = %phase, alices = state.alices.len(), "Phase changed");
    }

    /// Ends the round.
    pub fn end(&self, state: &mut RoundState, end_state: EndRoundState, now: DateTime<Utc>) {
        let from = state.phase;
        state.phase = Phase::Ended;
        state.end_state = end_state;
        state.phase_started_at = now;
        state.ended_at = Some(now);
        info!(round_id = %self.id, %from, ?end_state, alices = state.alices.len(), "Round ended");
    }

    /// Returns true while the round accepts new inputs at `now`.
    pub fn accepts_inputs(&self, state: &RoundState, now: DateTime<Utc>, config: &WabiSabiConfig) -> bool {
        state.phase == Phase::InputRegistration
            && !state.input_registration_closed
            && state.input_count() < self.params.max_input_count
            && !self.input_registration_timed_out(state, now, config)
    }

    /// Returns true if registering `incoming` keeps the round within its input cap.
    ///
    /// Inputs of Alices the registration would replace are not counted.
    pub fn has_room_for(&self, state: &RoundState, incoming: &[OutPoint]) -> bool {
        let kept: usize = state
            .alices
            .iter()
            .filter(|a| !incoming.iter().any(|op| a.owns(op)))
            .map(|a| a.coins.len())
            .sum();
        kept + incoming.len() <= self.params.max_input_count
    }

    pub fn input_registration_timed_out(&self, state: &RoundState, now: DateTime<Utc>, config: &WabiSabiConfig) -> bool {
        now >= state.input_registration_started_at + config.input_registration_timeout()
    }

    /// End of the current phase under the live config.
    pub fn phase_deadline(&self, state: &RoundState, config: &WabiSabiConfig) -> Option<DateTime<Utc>> {
        match state.phase {
            Phase::InputRegistration => Some(state.input_registration_started_at + config.input_registration_timeout()),
            Phase::ConnectionConfirmation => Some(state.phase_started_at + config.connection_confirmation_timeout()),
            Phase::OutputRegistration => Some(state.phase_started_at + config.output_registration_timeout()),
            Phase::TransactionSigning => Some(state.phase_started_at + config.transaction_signing_timeout()),
            Phase::Ended => None,
        }
    }

    pub fn phase_timed_out(&self, state: &RoundState, now: DateTime<Utc>, config: &WabiSabiConfig) -> bool {
        self.phase_deadline(state, config).map(|d| now >= d).unwrap_or(false)
    }

    /// Assembles the unsigned coinjoin from the registered Alices and Bobs.
    ///
    /// Inputs are ordered by outpoint and outputs by descending value then
    /// script. Coordination fees and unredeemed balance go to the coordinator
    /// script when that output clears dust, to miners otherwise. Returns None
    /// when no output was registered.
    pub fn build_coinjoin(&self, state: &RoundState) -> Option<Transaction> {
        if state.bobs.is_empty() {
            return None;
        }

        let mut outpoints: Vec<&Coin> = state.alices.iter().flat_map(|a| a.coins.iter()).collect();
        outpoints.sort_by_key(|c| c.outpoint);

        let input: Vec<TxIn> = outpoints
            .iter()
            .map(|c| TxIn {
                previous_output: c.outpoint,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            })
            .collect();

        let mut output: Vec<TxOut> = state
            .bobs
            .iter()
            .map(|b| TxOut {
                value: Amount::from_sat(b.amount),
                script_pubkey: b.script.clone(),
            })
            .collect();

        if let Some(script) = &self.params.coordinator_script {
            let total_in: u64 = outpoints.iter().map(|c| c.amount().to_sat()).sum();
            let paid: u64 = output.iter().map(|o| o.value.to_sat()).sum();
            let input_fees: u64 = outpoints.iter().map(|c| self.params.input_fee(c)).sum();
            let output_fees: u64 = state
                .bobs
                .iter()
                .map(|b| b.weight.div_ceil(wabisabi_core::WITNESS_SCALE_FACTOR) * self.params.mining_fee_rate)
                .sum();

            let leftover = total_in
                .saturating_sub(paid)
                .saturating_sub(input_fees)
                .saturating_sub(output_fees)
                .saturating_sub(self.params.shared_fee());

            if leftover >= DUST_THRESHOLD_SATS {
                output.push(TxOut {
                    value: Amount::from_sat(leftover),
                    script_pubkey: script.clone(),
                });
            }
        }

        output.sort_by(|a, b| b.value.cmp(&a.value).then_with(|| a.script_pubkey.cmp(&b.script_pubkey)));

        Some(Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input,
            output,
        })
    }

    /// Snapshot for status queries, copied out under a short hold of the round lock.
    pub fn status(&self, config: &WabiSabiConfig) -> RoundStatus {
        let state = self.lock();
        RoundStatus {
            id: self.id,
            phase: state.phase,
            end_state: state.end_state,
            blame_of: self.blame_of,
            alice_count: state.alices.len(),
            input_count: state.input_count(),
            confirmed_count: state.alices.iter().filter(|a| a.confirmed_connection).count(),
            output_count: state.bobs.len(),
            signature_count: state.witnesses.len(),
            is_disrupted: state.is_disrupted(),
            phase_deadline: self.phase_deadline(&state, config),
            coinjoin_txid: state.coinjoin.as_ref().map(|tx| tx.compute_txid()),
            parameters: self.params.clone(),
        }
    }
}

/// Snapshot of one round for status queries.
#[derive(Clone, Debug, Serialize)]
pub struct RoundStatus {
    pub id: RoundId,
    pub phase: Phase,
    pub end_state: EndRoundState,
    pub blame_of: Option<RoundId>,
    pub alice_count: usize,
    pub input_count: usize,
    pub confirmed_count: usize,
    pub output_count: usize,
    pub signature_count: usize,
    pub is_disrupted: bool,
    pub phase_deadline: Option<DateTime<Utc>>,
    pub coinjoin_txid: Option<Txid>,
    pub parameters: RoundParameters,
}

#[cfg(test)]
mod tests {
    use super::*;
    use wabisabi_core::testing::{coin, p2wpkh_script};

    fn round(config: &WabiSabiConfig) -> Round {
        Round::new(RoundParameters::from_config(config), Utc::now())
    }

    #[test]
    fn test_coinjoin_is_deterministic() {
        let config = WabiSabiConfig::default();
        let round = round(&config);
        let mut state = round.lock();
        state.alices.push(Alice::new(vec![coin(2, 60_000)], vec![vec![1]], Utc::now()));
        state.alices.push(Alice::new(vec![coin(1, 50_000)], vec![vec![1]], Utc::now()));
        state.bobs.push(Bob { script: p2wpkh_script(10), amount: 40_000, weight: 124 });
        state.bobs.push(Bob { script: p2wpkh_script(11), amount: 60_000, weight: 124 });

        let tx = round.build_coinjoin(&state).unwrap();
        assert_eq!(tx.input[0].previous_output, coin(1, 0).outpoint);
        assert_eq!(tx.output[0].value, Amount::from_sat(60_000));
        assert_eq!(tx.output.len(), 2);
        assert_eq!(round.build_coinjoin(&state), Some(tx));
    }

    #[test]
    fn test_coordinator_output_above_dust() {
        let config = WabiSabiConfig {
            coordinator_script_pubkey: Some(hex::encode(p2wpkh_script(99).as_bytes())),
            ..Default::default()
        };
        let round = round(&config);
        let mut state = round.lock();
        state.alices.push(Alice::new(vec![coin(1, 100_000)], vec![vec![1]], Utc::now()));
        state.bobs.push(Bob { script: p2wpkh_script(10), amount: 90_000, weight: 124 });

        let tx = round.build_coinjoin(&state).unwrap();
        let coordinator = tx.output.iter().find(|o| o.script_pubkey == p2wpkh_script(99)).unwrap();
        // 100k in, 90k out, 136 input fee, 62 output fee, (11 + 31) * 2 shared
        assert_eq!(coordinator.value, Amount::from_sat(100_000 - 90_000 - 136 - 62 - 84));
    }

    #[test]
    fn test_no_outputs_no_coinjoin() {
        let config = WabiSabiConfig::default();
        let round = round(&config);
        let state = round.lock();
        assert!(round.build_coinjoin(&state).is_none());
    }

    #[test]
    fn test_full_round_stops_accepting() {
        let config = WabiSabiConfig {
            max_input_count_by_round: 1,
            ..Default::default()
        };
        let round = round(&config);
        let now = Utc::now();
        let mut state = round.lock();
        assert!(round.accepts_inputs(&state, now, &config));
        state.alices.push(Alice::new(vec![coin(1, 100_000)], vec![vec![1]], now));
        assert!(!round.accepts_inputs(&state, now, &config));
    }

    #[test]
    fn test_input_cap_counts_inputs_not_alices() {
        let config = WabiSabiConfig {
            max_input_count_by_round: 3,
            ..Default::default()
        };
        let round = round(&config);
        let now = Utc::now();
        let mut state = round.lock();
        state.alices.push(Alice::new(vec![coin(1, 100_000), coin(2, 100_000)], vec![vec![1], vec![1]], now));

        assert!(round.accepts_inputs(&state, now, &config));
        assert!(round.has_room_for(&state, &[coin(3, 0).outpoint]));
        assert!(!round.has_room_for(&state, &[coin(3, 0).outpoint, coin(4, 0).outpoint]));
        // Replacing the two-input Alice frees her inputs.
        assert!(round.has_room_for(&state, &[coin(1, 0).outpoint, coin(3, 0).outpoint, coin(4, 0).outpoint]));

        state.alices.push(Alice::new(vec![coin(3, 100_000)], vec![vec![1]], now));
        assert!(!round.accepts_inputs(&state, now, &config));
    }

    #[test]
    fn test_signed_coinjoin_applies_witnesses() {
        let config = WabiSabiConfig::default();
        let round = round(&config);
        let mut state = round.lock();
        state.alices.push(Alice::new(vec![coin(1, 100_000)], vec![vec![1]], Utc::now()));
        state.bobs.push(Bob { script: p2wpkh_script(10), amount: 90_000, weight: 124 });
        state.coinjoin = round.build_coinjoin(&state);
        assert!(!state.is_fully_signed());

        state.witnesses.insert(0, wabisabi_core::testing::valid_witness());
        assert!(state.is_fully_signed());
        assert!(!state.signed_coinjoin().unwrap().input[0].witness.is_empty());
    }
}
