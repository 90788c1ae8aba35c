//! Protocol requests and responses.

use bitcoin::{OutPoint, ScriptBuf, Transaction, Witness};
use serde::{Deserialize, Serialize};

use wabisabi_core::{AliceId, Credential, RoundId};

/// One input and the proof binding it to the round.
#[derive(Clone, Debug)]
pub struct InputRoundSignaturePair {
    pub outpoint: OutPoint,
    pub round_signature: Vec<u8>,
}

#[derive(Clone, Debug)]
pub struct InputsRegistrationRequest {
    pub round_id: RoundId,
    pub input_round_signature_pairs: Vec<InputRoundSignaturePair>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InputsRegistrationResponse {
    pub alice_id: AliceId,
    pub amount_credentials: Vec<Credential>,
    pub weight_credentials: Vec<Credential>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct InputsRemovalRequest {
    pub round_id: RoundId,
    pub alice_id: AliceId,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ConnectionConfirmationRequest {
    pub round_id: RoundId,
    pub alice_id: AliceId,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectionConfirmationResponse {
    pub zero_amount_credentials: Vec<Credential>,
    pub zero_weight_credentials: Vec<Credential>,
    /// Issued once, after input registration ended.
    pub real_amount_credentials: Option<Vec<Credential>>,
    pub real_weight_credentials: Option<Vec<Credential>>,
}

#[derive(Clone, Debug)]
pub struct OutputRegistrationRequest {
    pub round_id: RoundId,
    pub script: ScriptBuf,
    pub requested_weight: u64,
    pub amount_credentials: Vec<Credential>,
    pub weight_credentials: Vec<Credential>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutputRegistrationResponse {
    pub amount_credentials: Vec<Credential>,
    pub weight_credentials: Vec<Credential>,
    pub unsigned_transaction_secret: String,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ReadyToSignRequest {
    pub round_id: RoundId,
    pub alice_id: AliceId,
}

#[derive(Clone, Debug)]
pub struct InputWitnessPair {
    pub input_index: usize,
    pub witness: Witness,
}

#[derive(Clone, Debug)]
pub struct TransactionSignaturesRequest {
    pub round_id: RoundId,
    pub input_witness_pairs: Vec<InputWitnessPair>,
}

#[derive(Clone, Debug)]
pub struct UnsignedTransactionRequest {
    pub round_id: RoundId,
    pub unsigned_transaction_secret: String,
}

#[derive(Clone, Debug)]
pub struct UnsignedTransactionResponse {
    pub transaction: Transaction,
}
