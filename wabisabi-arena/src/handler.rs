//! Protocol request handling.
//!
//! Every operation resolves the round, checks the phase, checks the
//! participant, runs its own checks and only then mutates the round. Checks
//! fail with a protocol error carrying the code clients act on.

use std::collections::HashSet;
use std::sync::Arc;

use bitcoin::TxOut;
use tracing::{debug, info, instrument, warn};

use wabisabi_core::{
    Coin, CoordinatorError, Phase, ProtocolErrorCode, Result, ScriptType, COINBASE_MATURITY,
};
use wabisabi_prison::{Offense, Punishment};
use wabisabi_verifier::CandidateCoin;

use crate::arena::Arena;
use crate::messages::*;
use crate::participants::{Alice, Bob};
use crate::round::RoundStatus;

fn reject(code: ProtocolErrorCode, message: impl Into<String>) -> CoordinatorError {
    CoordinatorError::protocol(code, message)
}

/// Adapts protocol requests to arena operations.
#[derive(Clone)]
pub struct ArenaRequestHandler {
    arena: Arc<Arena>,
}

impl ArenaRequestHandler {
    pub fn new(arena: Arc<Arena>) -> Self {
        Self { arena }
    }

    pub fn arena(&self) -> &Arc<Arena> {
        &self.arena
    }

    /// Status of every round the arena holds.
    pub fn status(&self) -> Vec<RoundStatus> {
        self.arena.status()
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // INPUT REGISTRATION
    // ═══════════════════════════════════════════════════════════════════════════

    /// Registers an Alice with one or more inputs.
    #[instrument(skip(self, request), fields(round_id = %request.round_id, inputs = request.input_round_signature_pairs.len()))]
    pub async fn register_input(&self, request: InputsRegistrationRequest) -> Result<InputsRegistrationResponse> {
        let round = self.arena.get_round(&request.round_id)?;
        let config = self.arena.config.read().clone();

        let pairs = &request.input_round_signature_pairs;
        {
            let state = round.lock();
            if state.phase != Phase::InputRegistration || state.input_registration_closed {
                return Err(reject(ProtocolErrorCode::WrongPhase, format!("round is in {}", state.phase)));
            }
            // A full round still lets its own Alices re-register.
            let re_registering = state
                .alices
                .iter()
                .any(|a| a.coins.len() == pairs.len() && pairs.iter().all(|p| a.owns(&p.outpoint)));
            if !re_registering {
                let incoming: Vec<_> = pairs.iter().map(|p| p.outpoint).collect();
                if !round.accepts_inputs(&state, self.arena.now(), &config) || !round.has_room_for(&state, &incoming) {
                    return Err(reject(ProtocolErrorCode::WrongPhase, "round is full or closing"));
                }
            }
        }

        let mut unique = HashSet::with_capacity(pairs.len());
        if !pairs.iter().all(|p| unique.insert(p.outpoint)) {
            return Err(reject(ProtocolErrorCode::NonUniqueInputs, "duplicate input in request"));
        }
        if pairs.is_empty() {
            return Err(CoordinatorError::ValidationError("no inputs in request".into()));
        }
        if pairs.len() > round.params.max_inputs_per_alice {
            return Err(reject(
                ProtocolErrorCode::TooManyInputs,
                format!("{} inputs, at most {} allowed", pairs.len(), round.params.max_inputs_per_alice),
            ));
        }

        for pair in pairs {
            if !round.is_whitelisted_for_blame(&pair.outpoint) {
                return Err(reject(ProtocolErrorCode::InputNotWhitelisted, pair.outpoint.to_string()));
            }
            match self.arena.prison.get_punishment(&pair.outpoint) {
                Punishment::Banned { until } => {
                    return Err(reject(ProtocolErrorCode::InputBanned, format!("{} banned until {}", pair.outpoint, until)));
                }
                Punishment::Noted { until } if !config.allow_noted_input_registration => {
                    return Err(reject(ProtocolErrorCode::InputBanned, format!("{} noted until {}", pair.outpoint, until)));
                }
                _ => {}
            }
            if let Some(other) = self.arena.find_round_with_input(&pair.outpoint) {
                if other.id != round.id {
                    return Err(reject(
                        ProtocolErrorCode::AliceAlreadyRegistered,
                        format!("{} registered in round {}", pair.outpoint, other.id),
                    ));
                }
            }
        }

        let mut coins = Vec::with_capacity(pairs.len());
        let mut confirmations = Vec::with_capacity(pairs.len());
        for pair in pairs {
            let lookup = tokio::time::timeout(config.utxo_lookup_timeout(), self.arena.utxos.get_tx_out(&pair.outpoint, true))
                .await
                .map_err(|_| CoordinatorError::ConnectionTimeout(format!("UTXO lookup for {}", pair.outpoint)))??;

            let Some(utxo) = lookup else {
                return Err(reject(ProtocolErrorCode::InputSpent, pair.outpoint.to_string()));
            };
            if utxo.confirmations == 0 {
                return Err(reject(ProtocolErrorCode::InputUnconfirmed, pair.outpoint.to_string()));
            }
            if utxo.is_coinbase && utxo.confirmations < COINBASE_MATURITY {
                return Err(reject(ProtocolErrorCode::InputImmature, pair.outpoint.to_string()));
            }

            let coin = Coin::new(pair.outpoint, utxo.tx_out);
            match coin.script_type() {
                Some(t) if round.params.allowed_input_types.contains(&t) => {}
                _ => return Err(reject(ProtocolErrorCode::ScriptNotAllowed, pair.outpoint.to_string())),
            }
            if !self.arena.signatures.verify_ownership_proof(&coin, &pair.round_signature, &round.id) {
                return Err(reject(ProtocolErrorCode::WrongRoundSignature, pair.outpoint.to_string()));
            }

            confirmations.push(utxo.confirmations);
            coins.push(coin);
        }

        let total: u64 = coins.iter().map(|c| c.amount().to_sat()).sum();
        let net = round.params.net_amount(&coins);
        if net < round.params.min_amount {
            return Err(reject(
                ProtocolErrorCode::NotEnoughFunds,
                format!("{} sats after fees, {} required", net, round.params.min_amount),
            ));
        }
        if total > round.params.max_amount {
            return Err(reject(
                ProtocolErrorCode::TooMuchFunds,
                format!("{} sats, at most {} allowed", total, round.params.max_amount),
            ));
        }

        let weight = round.params.input_weight(&coins);
        if weight > round.params.max_weight_per_alice {
            return Err(reject(
                ProtocolErrorCode::TooMuchWeight,
                format!("{} weight units, at most {} allowed", weight, round.params.max_weight_per_alice),
            ));
        }

        let proofs = pairs.iter().map(|p| p.round_signature.clone()).collect();
        let alice = Alice::new(coins, proofs, self.arena.now());
        let alice = self.arena.commit_alice(&round, alice)?;

        if let Some(verifier) = &self.arena.coin_verifier {
            for (coin, confirmations) in alice.coins.iter().zip(confirmations) {
                verifier.schedule(&CandidateCoin {
                    coin: coin.clone(),
                    confirmations,
                });
            }
        }

        Ok(InputsRegistrationResponse {
            alice_id: alice.id,
            amount_credentials: vec![round.amount_credentials().issue(0)],
            weight_credentials: vec![round.weight_credentials().issue(0)],
        })
    }

    /// Removes an Alice during input registration.
    #[instrument(skip(self), fields(round_id = %request.round_id, alice_id = %request.alice_id))]
    pub async fn remove_input(&self, request: InputsRemovalRequest) -> Result<()> {
        let round = self.arena.get_round(&request.round_id)?;
        let mut state = round.lock();
        if state.phase != Phase::InputRegistration {
            return Err(reject(ProtocolErrorCode::WrongPhase, format!("round is in {}", state.phase)));
        }

        let alice = state
            .remove_alice(&request.alice_id)
            .ok_or_else(|| reject(ProtocolErrorCode::AliceNotFound, request.alice_id.to_string()))?;

        if let Some(verifier) = &self.arena.coin_verifier {
            for coin in &alice.coins {
                verifier.unschedule(&coin.outpoint, &coin.tx_out.script_pubkey);
            }
        }
        info!(alices = state.alices.len(), "Alice removed");
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // CONNECTION CONFIRMATION
    // ═══════════════════════════════════════════════════════════════════════════

    /// Keeps an Alice alive and, after input registration, hands out her real credentials.
    #[instrument(skip(self), fields(round_id = %request.round_id, alice_id = %request.alice_id))]
    pub async fn confirm_connection(&self, request: ConnectionConfirmationRequest) -> Result<ConnectionConfirmationResponse> {
        let round = self.arena.get_round(&request.round_id)?;
        let timeout = self.arena.config.read().connection_confirmation_timeout();
        let now = self.arena.now();

        let mut state = round.lock();
        let phase = state.phase;
        if !matches!(phase, Phase::InputRegistration | Phase::ConnectionConfirmation) {
            return Err(reject(ProtocolErrorCode::WrongPhase, format!("round is in {}", phase)));
        }

        let alice = state.alice_mut(&request.alice_id)?;

        let (real_amount, real_weight) = if phase == Phase::ConnectionConfirmation {
            if alice.confirmed_connection {
                return Err(reject(ProtocolErrorCode::AliceAlreadyConfirmedConnection, alice.id.to_string()));
            }
            alice.confirmed_connection = true;
            let amount = round.amount_credentials().issue(round.params.net_amount(&alice.coins));
            let weight = round.weight_credentials().issue(round.params.weight_allowance(&alice.coins));
            debug!("Connection confirmed");
            (Some(vec![amount]), Some(vec![weight]))
        } else {
            alice.set_deadline_relative_to(now, timeout);
            (None, None)
        };

        Ok(ConnectionConfirmationResponse {
            zero_amount_credentials: vec![round.amount_credentials().issue(0)],
            zero_weight_credentials: vec![round.weight_credentials().issue(0)],
            real_amount_credentials: real_amount,
            real_weight_credentials: real_weight,
        })
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // OUTPUT REGISTRATION
    // ═══════════════════════════════════════════════════════════════════════════

    /// Registers a Bob paid for with amount and weight credentials.
    #[instrument(skip(self, request), fields(round_id = %request.round_id))]
    pub async fn register_output(&self, request: OutputRegistrationRequest) -> Result<OutputRegistrationResponse> {
        let round = self.arena.get_round(&request.round_id)?;
        let mut state = round.lock();
        if state.phase != Phase::OutputRegistration {
            return Err(reject(ProtocolErrorCode::WrongPhase, format!("round is in {}", state.phase)));
        }

        let script_type = match ScriptType::from_script(&request.script) {
            Some(t) if round.params.allowed_output_types.contains(&t) => t,
            _ => return Err(reject(ProtocolErrorCode::ScriptNotAllowed, "output script type not allowed")),
        };

        let output_weight = script_type.output_weight();
        if request.requested_weight != output_weight {
            return Err(reject(
                ProtocolErrorCode::IncorrectRequestedWeightCredentials,
                format!("requested {}, output weighs {}", request.requested_weight, output_weight),
            ));
        }

        let presented_weight = round.weight_credentials().verify(&request.weight_credentials)?;
        if presented_weight < output_weight {
            return Err(reject(
                ProtocolErrorCode::IncorrectRequestedWeightCredentials,
                format!("presented {} weight, output needs {}", presented_weight, output_weight),
            ));
        }

        let presented_amount = round.amount_credentials().verify(&request.amount_credentials)?;
        let value = presented_amount.saturating_sub(round.params.output_fee(script_type));
        if value < round.params.min_amount {
            return Err(reject(
                ProtocolErrorCode::NotEnoughFunds,
                format!("output of {} sats, {} required", value, round.params.min_amount),
            ));
        }
        if value > round.params.max_amount {
            return Err(reject(
                ProtocolErrorCode::TooMuchFunds,
                format!("output of {} sats, at most {} allowed", value, round.params.max_amount),
            ));
        }

        round.weight_credentials().redeem(&request.weight_credentials)?;
        round.amount_credentials().redeem(&request.amount_credentials)?;

        state.bobs.push(Bob {
            script: request.script,
            amount: value,
            weight: output_weight,
        });
        debug!(value, outputs = state.bobs.len(), "Output registered");

        Ok(OutputRegistrationResponse {
            amount_credentials: vec![round.amount_credentials().issue(0)],
            weight_credentials: vec![round.weight_credentials().issue(presented_weight - output_weight)],
            unsigned_transaction_secret: round.unsigned_transaction_secret().to_string(),
        })
    }

    /// Signals that an Alice registered all her outputs.
    #[instrument(skip(self), fields(round_id = %request.round_id, alice_id = %request.alice_id))]
    pub async fn ready_to_sign(&self, request: ReadyToSignRequest) -> Result<()> {
        let round = self.arena.get_round(&request.round_id)?;
        let mut state = round.lock();
        if state.phase != Phase::OutputRegistration {
            return Err(reject(ProtocolErrorCode::WrongPhase, format!("round is in {}", state.phase)));
        }
        state.alice_mut(&request.alice_id)?.ready_to_sign = true;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // SIGNING
    // ═══════════════════════════════════════════════════════════════════════════

    /// Returns the assembled coinjoin to holders of the round's secret.
    pub async fn unsigned_transaction(&self, request: UnsignedTransactionRequest) -> Result<UnsignedTransactionResponse> {
        let round = self.arena.get_round(&request.round_id)?;
        let state = round.lock();
        if state.phase != Phase::TransactionSigning {
            return Err(reject(ProtocolErrorCode::WrongPhase, format!("round is in {}", state.phase)));
        }
        if request.unsigned_transaction_secret != round.unsigned_transaction_secret() {
            return Err(reject(ProtocolErrorCode::InvalidCredentials, "wrong unsigned transaction secret"));
        }
        let transaction = state
            .coinjoin
            .clone()
            .ok_or_else(|| CoordinatorError::InternalError("signing round without coinjoin".into()))?;
        Ok(UnsignedTransactionResponse { transaction })
    }

    /// Accepts witnesses for coinjoin inputs.
    ///
    /// A witness that does not verify bans every input of its Alice for cheating.
    #[instrument(skip(self, request), fields(round_id = %request.round_id, witnesses = request.input_witness_pairs.len()))]
    pub async fn sign_transaction(&self, request: TransactionSignaturesRequest) -> Result<()> {
        let round = self.arena.get_round(&request.round_id)?;
        let mut state = round.lock();
        if state.phase != Phase::TransactionSigning {
            return Err(reject(ProtocolErrorCode::WrongPhase, format!("round is in {}", state.phase)));
        }

        let tx = state
            .coinjoin
            .clone()
            .ok_or_else(|| CoordinatorError::InternalError("signing round without coinjoin".into()))?;
        let prevouts: Vec<TxOut> = state.spent_coins().into_iter().map(|c| c.tx_out).collect();
        if prevouts.len() != tx.input.len() {
            return Err(CoordinatorError::InternalError("coinjoin input without owner".into()));
        }

        for pair in request.input_witness_pairs {
            let Some(txin) = tx.input.get(pair.input_index) else {
                return Err(reject(
                    ProtocolErrorCode::WrongCoinjoinSignature,
                    format!("no input at index {}", pair.input_index),
                ));
            };

            let (alice_id, outpoints) = {
                let alice = state
                    .alice_owning(&txin.previous_output)
                    .ok_or_else(|| reject(ProtocolErrorCode::AliceNotFound, txin.previous_output.to_string()))?;
                (alice.id, alice.outpoints().copied().collect::<Vec<_>>())
            };

            if !self.arena.signatures.verify_witness(&tx, pair.input_index, &prevouts, &pair.witness) {
                for outpoint in outpoints {
                    self.arena.prison.ban(outpoint, Offense::Cheating, Some(round.id));
                }
                warn!(%alice_id, input_index = pair.input_index, "Invalid coinjoin witness");
                return Err(reject(
                    ProtocolErrorCode::WrongCoinjoinSignature,
                    format!("invalid witness for input {}", pair.input_index),
                ));
            }

            state.witnesses.insert(pair.input_index, pair.witness);
        }

        debug!(signed = state.witnesses.len(), inputs = tx.input.len(), "Witnesses accepted");
        Ok(())
    }
}
