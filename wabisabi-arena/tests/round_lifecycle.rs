//! End-to-end round scenarios driven through the request handler and ticks.

use std::sync::Arc;

use bitcoin::absolute::LockTime;
use bitcoin::transaction::Version;
use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};

use wabisabi_arena::*;
use wabisabi_core::testing::{coin, p2wpkh_script, valid_witness, AcceptAllVerifier, MemoryUtxoProvider};
use wabisabi_core::{
    Coin, CoinJoinIdStore, CoordinatorError, EndRoundState, ManualClock, Phase, ProtocolErrorCode, RoundId,
    SharedConfig, WabiSabiConfig,
};
use wabisabi_prison::{DisruptionMethod, Prison};

struct Harness {
    clock: Arc<ManualClock>,
    config: SharedConfig,
    utxos: Arc<MemoryUtxoProvider>,
    prison: Arc<Prison>,
    coinjoin_ids: Arc<InMemoryCoinJoinIdStore>,
    arena: Arc<Arena>,
    handler: ArenaRequestHandler,
}

impl Harness {
    fn new(configure: impl FnOnce(&mut WabiSabiConfig)) -> Self {
        let mut config = WabiSabiConfig::default();
        configure(&mut config);
        let config = config.into_shared();
        let clock = ManualClock::starting_now();
        let utxos = Arc::new(MemoryUtxoProvider::new());
        let prison = Arc::new(Prison::new(config.clone(), clock.clone()));
        let coinjoin_ids = Arc::new(InMemoryCoinJoinIdStore::new());
        let arena = Arc::new(Arena::new(
            config.clone(),
            clock.clone(),
            prison.clone(),
            utxos.clone(),
            Arc::new(AcceptAllVerifier),
            coinjoin_ids.clone(),
        ));
        let handler = ArenaRequestHandler::new(arena.clone());
        Self {
            clock,
            config,
            utxos,
            prison,
            coinjoin_ids,
            arena,
            handler,
        }
    }

    fn with_max_inputs(max: usize) -> Self {
        Self::new(|c| c.max_input_count_by_round = max)
    }

    /// Opens the first round.
    async fn open_round(&self) -> RoundId {
        self.arena.tick().await;
        self.arena.rounds()[0].id
    }

    fn fund(&self, n: u32) -> Coin {
        let coin = coin(n, 100_000);
        self.utxos.add_coin(&coin);
        coin
    }

    async fn register(&self, round_id: RoundId, coins: &[&Coin]) -> Result<InputsRegistrationResponse, CoordinatorError> {
        self.handler
            .register_input(InputsRegistrationRequest {
                round_id,
                input_round_signature_pairs: coins
                    .iter()
                    .map(|c| InputRoundSignaturePair {
                        outpoint: c.outpoint,
                        round_signature: vec![1u8; 65],
                    })
                    .collect(),
            })
            .await
    }

    fn phase(&self, round_id: RoundId) -> Phase {
        self.arena.get_round(&round_id).unwrap().phase()
    }
}

fn code(result: Result<impl std::fmt::Debug, CoordinatorError>) -> ProtocolErrorCode {
    result.unwrap_err().protocol_code().expect("protocol error")
}

fn spending(outpoint: OutPoint, value: u64) -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: outpoint,
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: valid_witness(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(value),
            script_pubkey: p2wpkh_script(999),
        }],
    }
}

#[tokio::test]
async fn full_round_closes_and_rejects_late_inputs() {
    let h = Harness::with_max_inputs(3);
    let round_id = h.open_round().await;

    for n in 1..=3 {
        let coin = h.fund(n);
        h.register(round_id, &[&coin]).await.unwrap();
    }

    let late = h.fund(4);
    assert_eq!(code(h.register(round_id, &[&late]).await), ProtocolErrorCode::WrongPhase);

    h.arena.tick().await;
    assert_eq!(h.phase(round_id), Phase::ConnectionConfirmation);
    assert_eq!(h.arena.get_round(&round_id).unwrap().lock().alices.len(), 3);
}

#[tokio::test]
async fn unconfirmed_alices_are_noted_not_banned() {
    let h = Harness::new(|c| {
        c.max_input_count_by_round = 4;
        c.min_input_count_by_round_multiplier = 0.5;
    });
    let round_id = h.open_round().await;

    let coins: Vec<Coin> = (1..=4).map(|n| h.fund(n)).collect();
    let mut alice_ids = Vec::new();
    for coin in &coins {
        alice_ids.push(h.register(round_id, &[coin]).await.unwrap().alice_id);
    }

    h.arena.tick().await;
    assert_eq!(h.phase(round_id), Phase::ConnectionConfirmation);

    for alice_id in &alice_ids[..2] {
        let response = h
            .handler
            .confirm_connection(ConnectionConfirmationRequest {
                round_id,
                alice_id: *alice_id,
            })
            .await
            .unwrap();
        assert!(response.real_amount_credentials.is_some());
    }

    h.clock.advance_secs(61);
    h.arena.tick().await;

    assert_eq!(h.phase(round_id), Phase::OutputRegistration);
    assert_eq!(h.arena.get_round(&round_id).unwrap().lock().alices.len(), 2);
    for coin in &coins[2..] {
        assert!(h.prison.is_noted(&coin.outpoint));
        assert!(!h.prison.is_banned(&coin.outpoint));
    }
    for coin in &coins[..2] {
        assert!(!h.prison.is_noted(&coin.outpoint));
    }
}

#[tokio::test]
async fn double_spend_bans_attacker_and_disrupts_round() {
    let h = Harness::new(|c| {
        c.max_input_count_by_round = 4;
        c.min_input_count_by_round_multiplier = 0.5;
    });
    let round_id = h.open_round().await;
    let victim = h.fund(1);
    let other = h.fund(2);
    h.register(round_id, &[&victim]).await.unwrap();
    h.register(round_id, &[&other]).await.unwrap();

    let attack = spending(victim.outpoint, 90_000);
    let mempool = CoinJoinMempoolManager::new(h.arena.clone());
    let verdict = mempool.process_transaction(&attack);

    assert_eq!(verdict.disrupted_rounds, vec![round_id]);
    assert_eq!(verdict.banned_outputs, 1);
    assert!(h.prison.is_banned(&OutPoint::new(attack.compute_txid(), 0)));
    assert!(h.arena.get_round(&round_id).unwrap().is_disrupted());

    h.arena.tick().await;
    let round = h.arena.get_round(&round_id).unwrap();
    assert_eq!(round.end_state(), EndRoundState::AbortedDoubleSpendingDetected);
    // One survivor is below the minimum of two, so no blame round.
    assert!(h.arena.rounds().iter().all(|r| r.blame_of.is_none()));
}

#[tokio::test]
async fn double_spend_with_enough_survivors_starts_blame_round() {
    let h = Harness::new(|c| {
        c.max_input_count_by_round = 4;
        c.min_input_count_by_round_multiplier = 0.5;
    });
    let round_id = h.open_round().await;
    let victim = h.fund(1);
    let survivors = [h.fund(2), h.fund(3)];
    let victim_id = h.register(round_id, &[&victim]).await.unwrap().alice_id;
    let mut survivor_ids = Vec::new();
    for coin in &survivors {
        survivor_ids.push(h.register(round_id, &[coin]).await.unwrap().alice_id);
    }

    CoinJoinMempoolManager::new(h.arena.clone()).process_transaction(&spending(victim.outpoint, 90_000));
    h.arena.tick().await;

    assert_eq!(
        h.arena.get_round(&round_id).unwrap().end_state(),
        EndRoundState::AbortedDoubleSpendingDetected
    );
    let blame = h
        .arena
        .rounds()
        .into_iter()
        .find(|r| r.blame_of == Some(round_id))
        .expect("blame round");
    assert_eq!(blame.params.max_input_count, 2);

    let mut seeded: Vec<_> = blame.lock().alices.iter().map(|a| a.id).collect();
    seeded.sort();
    survivor_ids.sort();
    assert_eq!(seeded, survivor_ids);
    assert!(!seeded.contains(&victim_id));

    for coin in &survivors {
        assert!(blame.is_whitelisted_for_blame(&coin.outpoint));
    }
    assert!(!blame.is_whitelisted_for_blame(&victim.outpoint));
}

#[tokio::test]
async fn own_coinjoin_is_never_punished() {
    let h = Harness::with_max_inputs(4);
    let round_id = h.open_round().await;
    let coin = h.fund(1);
    h.register(round_id, &[&coin]).await.unwrap();

    let coinjoin = spending(coin.outpoint, 90_000);
    h.coinjoin_ids.add(coinjoin.compute_txid());

    let verdict = CoinJoinMempoolManager::new(h.arena.clone()).process_transaction(&coinjoin);
    assert_eq!(verdict, MempoolVerdict::default());
    assert!(!h.prison.is_banned(&OutPoint::new(coinjoin.compute_txid(), 0)));
    assert!(!h.arena.get_round(&round_id).unwrap().is_disrupted());
}

#[tokio::test]
async fn re_registration_returns_same_alice() {
    let h = Harness::with_max_inputs(4);
    let round_id = h.open_round().await;
    let coin = h.fund(1);

    let first = h.register(round_id, &[&coin]).await.unwrap();
    let second = h.register(round_id, &[&coin]).await.unwrap();
    assert_eq!(first.alice_id, second.alice_id);
    assert_eq!(h.arena.get_round(&round_id).unwrap().lock().alices.len(), 1);
}

#[tokio::test]
async fn input_cannot_join_two_rounds() {
    let h = Harness::with_max_inputs(4);
    let first = h.open_round().await;
    let second = h.arena.create_round().id;
    let coin = h.fund(1);

    h.register(first, &[&coin]).await.unwrap();
    assert_eq!(code(h.register(second, &[&coin]).await), ProtocolErrorCode::AliceAlreadyRegistered);
}

#[tokio::test]
async fn admission_rejections() {
    let h = Harness::new(|c| {
        c.max_input_count_by_round = 10;
        c.max_inputs_per_alice = 2;
    });
    let round_id = h.open_round().await;

    let a = h.fund(1);
    assert_eq!(code(h.register(round_id, &[&a, &a]).await), ProtocolErrorCode::NonUniqueInputs);

    let (b, c) = (h.fund(2), h.fund(3));
    assert_eq!(code(h.register(round_id, &[&a, &b, &c]).await), ProtocolErrorCode::TooManyInputs);

    let unknown = coin(50, 100_000);
    assert_eq!(code(h.register(round_id, &[&unknown]).await), ProtocolErrorCode::InputSpent);

    let fresh = coin(51, 100_000);
    h.utxos.add_utxo(&fresh, 0, false);
    assert_eq!(code(h.register(round_id, &[&fresh]).await), ProtocolErrorCode::InputUnconfirmed);

    let coinbase = coin(52, 100_000);
    h.utxos.add_utxo(&coinbase, 99, true);
    assert_eq!(code(h.register(round_id, &[&coinbase]).await), ProtocolErrorCode::InputImmature);

    let dust = coin(53, 1_000);
    h.utxos.add_coin(&dust);
    assert_eq!(code(h.register(round_id, &[&dust]).await), ProtocolErrorCode::NotEnoughFunds);

    h.prison.ban(c.outpoint, wabisabi_prison::Offense::Cheating, None);
    assert_eq!(code(h.register(round_id, &[&c]).await), ProtocolErrorCode::InputBanned);

    let missing = RoundId::new();
    assert_eq!(code(h.register(missing, &[&a]).await), ProtocolErrorCode::RoundNotFound);
}

#[tokio::test]
async fn alice_missing_her_deadline_is_evicted() {
    let h = Harness::with_max_inputs(4);
    let round_id = h.open_round().await;
    let coin = h.fund(1);
    h.register(round_id, &[&coin]).await.unwrap();

    h.clock.advance_secs(55);
    h.arena.tick().await;

    assert!(h.arena.get_round(&round_id).unwrap().lock().alices.is_empty());
    assert!(!h.prison.is_noted(&coin.outpoint));
}

#[tokio::test]
async fn multi_input_alices_fill_round_by_input_count() {
    let h = Harness::with_max_inputs(3);
    let round_id = h.open_round().await;
    let coins: Vec<Coin> = (1..=6).map(|n| h.fund(n)).collect();

    h.register(round_id, &[&coins[0], &coins[1]]).await.unwrap();
    assert_eq!(
        code(h.register(round_id, &[&coins[2], &coins[3]]).await),
        ProtocolErrorCode::WrongPhase
    );
    h.register(round_id, &[&coins[4]]).await.unwrap();
    assert_eq!(code(h.register(round_id, &[&coins[5]]).await), ProtocolErrorCode::WrongPhase);

    h.arena.tick().await;
    assert_eq!(h.phase(round_id), Phase::ConnectionConfirmation);
    let round = h.arena.get_round(&round_id).unwrap();
    let state = round.lock();
    assert_eq!(state.input_count(), 3);
    assert_eq!(state.alices.len(), 2);
}

#[tokio::test]
async fn registration_timeout_with_minimum_starts_confirmation() {
    let h = Harness::new(|c| {
        c.max_input_count_by_round = 4;
        c.min_input_count_by_round_multiplier = 0.5;
    });
    let round_id = h.open_round().await;
    for n in 1..=2 {
        let coin = h.fund(n);
        h.register(round_id, &[&coin]).await.unwrap();
    }

    // Well past every Alice deadline; once registration times out they stay.
    let timeout = h.config.read().input_registration_timeout_seconds as i64;
    h.clock.advance_secs(timeout + 1);
    h.arena.tick().await;

    assert_eq!(h.phase(round_id), Phase::ConnectionConfirmation);
    assert_eq!(h.arena.get_round(&round_id).unwrap().lock().alices.len(), 2);
}

#[tokio::test]
async fn registration_timeout_without_minimum_ends_round() {
    let h = Harness::new(|c| {
        c.max_input_count_by_round = 4;
        c.min_input_count_by_round_multiplier = 0.5;
    });
    let round_id = h.open_round().await;
    let coin = h.fund(1);
    h.register(round_id, &[&coin]).await.unwrap();

    let timeout = h.config.read().input_registration_timeout_seconds as i64;
    h.clock.advance_secs(timeout + 1);
    h.arena.tick().await;

    let round = h.arena.get_round(&round_id).unwrap();
    assert_eq!(round.end_state(), EndRoundState::AbortedNotEnoughAlices);
    assert!(h.arena.rounds().iter().all(|r| r.blame_of.is_none()));
    assert!(!h.prison.is_noted(&coin.outpoint));
}

#[tokio::test]
async fn full_round_keeps_alices_past_their_deadline() {
    let h = Harness::with_max_inputs(2);
    let round_id = h.open_round().await;
    for n in 1..=2 {
        let coin = h.fund(n);
        h.register(round_id, &[&coin]).await.unwrap();
    }

    h.clock.advance_secs(55);
    h.arena.tick().await;

    assert_eq!(h.phase(round_id), Phase::ConnectionConfirmation);
    assert_eq!(h.arena.get_round(&round_id).unwrap().lock().alices.len(), 2);
}

#[tokio::test]
async fn live_timeout_change_applies_on_next_tick() {
    let h = Harness::new(|c| {
        c.max_input_count_by_round = 2;
        c.min_input_count_by_round_multiplier = 0.5;
    });
    let round_id = h.open_round().await;
    let coins = [h.fund(1), h.fund(2)];
    let mut alice_ids = Vec::new();
    for coin in &coins {
        alice_ids.push(h.register(round_id, &[coin]).await.unwrap().alice_id);
    }
    h.arena.tick().await;
    assert_eq!(h.phase(round_id), Phase::ConnectionConfirmation);

    h.handler
        .confirm_connection(ConnectionConfirmationRequest {
            round_id,
            alice_id: alice_ids[0],
        })
        .await
        .unwrap();

    h.clock.advance_secs(11);
    h.arena.tick().await;
    assert_eq!(h.phase(round_id), Phase::ConnectionConfirmation);

    h.config.write().connection_confirmation_timeout_seconds = 10;
    h.arena.tick().await;

    assert_eq!(h.phase(round_id), Phase::OutputRegistration);
    assert!(h.prison.is_noted(&coins[1].outpoint));
    assert!(!h.prison.is_noted(&coins[0].outpoint));
}

#[tokio::test]
async fn removed_input_can_register_again() {
    let h = Harness::with_max_inputs(4);
    let round_id = h.open_round().await;
    let coin = h.fund(1);
    let alice_id = h.register(round_id, &[&coin]).await.unwrap().alice_id;

    h.handler
        .remove_input(InputsRemovalRequest { round_id, alice_id })
        .await
        .unwrap();
    assert!(h.arena.get_round(&round_id).unwrap().lock().alices.is_empty());
    assert_eq!(
        code(h.handler.remove_input(InputsRemovalRequest { round_id, alice_id }).await),
        ProtocolErrorCode::AliceNotFound
    );

    let again = h.register(round_id, &[&coin]).await.unwrap().alice_id;
    assert_ne!(again, alice_id);
    assert!(!h.prison.is_noted(&coin.outpoint));
}

#[tokio::test]
async fn confirming_during_input_registration_keeps_alice_alive() {
    let h = Harness::with_max_inputs(4);
    let round_id = h.open_round().await;
    let coin = h.fund(1);
    let alice_id = h.register(round_id, &[&coin]).await.unwrap().alice_id;

    h.clock.advance_secs(40);
    let response = h
        .handler
        .confirm_connection(ConnectionConfirmationRequest { round_id, alice_id })
        .await
        .unwrap();
    assert!(response.real_amount_credentials.is_none());

    h.clock.advance_secs(40);
    h.arena.tick().await;
    assert_eq!(h.arena.get_round(&round_id).unwrap().lock().alices.len(), 1);
}

#[tokio::test]
async fn happy_path_broadcasts_coinjoin() {
    let h = Harness::with_max_inputs(2);
    let round_id = h.open_round().await;
    let coins = [h.fund(1), h.fund(2)];
    // Noted from an earlier round; noted inputs may still register.
    h.prison
        .note(coins[0].outpoint, DisruptionMethod::DidNotConfirm, coins[0].amount().to_sat(), None);
    assert!(h.prison.is_noted(&coins[0].outpoint));

    let mut alice_ids = Vec::new();
    for coin in &coins {
        alice_ids.push(h.register(round_id, &[coin]).await.unwrap().alice_id);
    }
    h.arena.tick().await;
    assert_eq!(h.phase(round_id), Phase::ConnectionConfirmation);

    let mut credentials = Vec::new();
    for alice_id in &alice_ids {
        let response = h
            .handler
            .confirm_connection(ConnectionConfirmationRequest {
                round_id,
                alice_id: *alice_id,
            })
            .await
            .unwrap();
        credentials.push((
            response.real_amount_credentials.unwrap(),
            response.real_weight_credentials.unwrap(),
        ));
    }
    assert_eq!(
        code(
            h.handler
                .confirm_connection(ConnectionConfirmationRequest {
                    round_id,
                    alice_id: alice_ids[0],
                })
                .await
        ),
        ProtocolErrorCode::AliceAlreadyConfirmedConnection
    );

    h.arena.tick().await;
    assert_eq!(h.phase(round_id), Phase::OutputRegistration);

    let mut secret = String::new();
    for (n, (amount, weight)) in credentials.into_iter().enumerate() {
        let response = h
            .handler
            .register_output(OutputRegistrationRequest {
                round_id,
                script: p2wpkh_script(100 + n as u32),
                requested_weight: 124,
                amount_credentials: amount,
                weight_credentials: weight,
            })
            .await
            .unwrap();
        secret = response.unsigned_transaction_secret;
    }
    for alice_id in &alice_ids {
        h.handler
            .ready_to_sign(ReadyToSignRequest {
                round_id,
                alice_id: *alice_id,
            })
            .await
            .unwrap();
    }

    h.arena.tick().await;
    assert_eq!(h.phase(round_id), Phase::TransactionSigning);

    assert_eq!(
        code(
            h.handler
                .unsigned_transaction(UnsignedTransactionRequest {
                    round_id,
                    unsigned_transaction_secret: "wrong".into(),
                })
                .await
        ),
        ProtocolErrorCode::InvalidCredentials
    );
    let unsigned = h
        .handler
        .unsigned_transaction(UnsignedTransactionRequest {
            round_id,
            unsigned_transaction_secret: secret,
        })
        .await
        .unwrap()
        .transaction;
    assert_eq!(unsigned.input.len(), 2);
    assert_eq!(unsigned.output.len(), 2);

    h.handler
        .sign_transaction(TransactionSignaturesRequest {
            round_id,
            input_witness_pairs: (0..2)
                .map(|input_index| InputWitnessPair {
                    input_index,
                    witness: valid_witness(),
                })
                .collect(),
        })
        .await
        .unwrap();

    h.arena.tick().await;
    let round = h.arena.get_round(&round_id).unwrap();
    assert_eq!(round.end_state(), EndRoundState::TransactionBroadcasted);
    assert!(!h.prison.is_noted(&coins[0].outpoint));

    let broadcasted = h.utxos.broadcasted();
    assert_eq!(broadcasted.len(), 1);
    assert!(h.coinjoin_ids.contains(&broadcasted[0].compute_txid()));
    assert!(broadcasted[0].input.iter().all(|i| !i.witness.is_empty()));
}

#[tokio::test]
async fn invalid_witness_bans_alice_for_cheating() {
    let h = Harness::with_max_inputs(1);
    let round_id = h.open_round().await;
    let coin = h.fund(1);
    let alice_id = h.register(round_id, &[&coin]).await.unwrap().alice_id;

    h.arena.tick().await;
    let response = h
        .handler
        .confirm_connection(ConnectionConfirmationRequest { round_id, alice_id })
        .await
        .unwrap();
    h.arena.tick().await;
    h.handler
        .register_output(OutputRegistrationRequest {
            round_id,
            script: p2wpkh_script(100),
            requested_weight: 124,
            amount_credentials: response.real_amount_credentials.unwrap(),
            weight_credentials: response.real_weight_credentials.unwrap(),
        })
        .await
        .unwrap();
    h.arena.tick().await;
    assert_eq!(h.phase(round_id), Phase::TransactionSigning);

    let result = h
        .handler
        .sign_transaction(TransactionSignaturesRequest {
            round_id,
            input_witness_pairs: vec![InputWitnessPair {
                input_index: 0,
                witness: Witness::new(),
            }],
        })
        .await;
    assert_eq!(code(result), ProtocolErrorCode::WrongCoinjoinSignature);
    assert!(h.prison.is_banned(&coin.outpoint));
}

#[tokio::test]
async fn missing_signatures_start_blame_round() {
    let h = Harness::new(|c| {
        c.max_input_count_by_round = 3;
        c.min_input_count_by_round_multiplier = 0.5;
    });
    let round_id = h.open_round().await;
    let coins = [h.fund(1), h.fund(2), h.fund(3)];
    let mut alice_ids = Vec::new();
    for coin in &coins {
        alice_ids.push(h.register(round_id, &[coin]).await.unwrap().alice_id);
    }
    h.arena.tick().await;

    let mut credentials = Vec::new();
    for alice_id in &alice_ids {
        let response = h
            .handler
            .confirm_connection(ConnectionConfirmationRequest {
                round_id,
                alice_id: *alice_id,
            })
            .await
            .unwrap();
        credentials.push(response);
    }
    h.arena.tick().await;

    for (n, response) in credentials.into_iter().enumerate() {
        h.handler
            .register_output(OutputRegistrationRequest {
                round_id,
                script: p2wpkh_script(200 + n as u32),
                requested_weight: 124,
                amount_credentials: response.real_amount_credentials.unwrap(),
                weight_credentials: response.real_weight_credentials.unwrap(),
            })
            .await
            .unwrap();
    }
    h.arena.tick().await;
    assert_eq!(h.phase(round_id), Phase::TransactionSigning);

    let unsigned = h.arena.get_round(&round_id).unwrap().lock().coinjoin.clone().unwrap();
    let signed_by_first_two: Vec<InputWitnessPair> = unsigned
        .input
        .iter()
        .enumerate()
        .filter(|(_, txin)| txin.previous_output != coins[2].outpoint)
        .map(|(input_index, _)| InputWitnessPair {
            input_index,
            witness: valid_witness(),
        })
        .collect();
    h.handler
        .sign_transaction(TransactionSignaturesRequest {
            round_id,
            input_witness_pairs: signed_by_first_two,
        })
        .await
        .unwrap();

    let timeout = h.config.read().transaction_signing_timeout_seconds as i64;
    h.clock.advance_secs(timeout + 1);
    h.arena.tick().await;

    let round = h.arena.get_round(&round_id).unwrap();
    assert_eq!(round.end_state(), EndRoundState::AbortedNotEnoughAlicesSigned);
    assert!(h.prison.is_banned(&coins[2].outpoint));

    let blame = h
        .arena
        .rounds()
        .into_iter()
        .find(|r| r.blame_of == Some(round_id))
        .expect("blame round");
    assert!(blame.is_whitelisted_for_blame(&coins[0].outpoint));
    assert!(!blame.is_whitelisted_for_blame(&coins[2].outpoint));

    // Seeded Alices keep their identity when they register again.
    let again = h.register(blame.id, &[&coins[0]]).await.unwrap();
    assert_eq!(again.alice_id, alice_ids[0]);
    assert_eq!(code(h.register(blame.id, &[&coins[2]]).await), ProtocolErrorCode::WrongPhase);
}
