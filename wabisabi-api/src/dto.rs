//! DTOs for API requests and responses.
//!
//! Binary fields travel as lowercase hex, outpoints as `txid:vout`.
//! Transactions use consensus encoding.

use std::str::FromStr;

use bitcoin::consensus::encode;
use bitcoin::{OutPoint, ScriptBuf, Witness};
use serde::{Deserialize, Serialize};

use wabisabi_arena::{
    InputRoundSignaturePair, InputWitnessPair, InputsRegistrationRequest, OutputRegistrationRequest, RoundStatus,
    TransactionSignaturesRequest, UnsignedTransactionRequest, UnsignedTransactionResponse,
};
use wabisabi_core::{Credential, RoundId};

use crate::error::ApiError;

fn parse_outpoint(s: &str) -> Result<OutPoint, ApiError> {
    OutPoint::from_str(s).map_err(|e| ApiError::bad_request(format!("Invalid outpoint {}: {}", s, e)))
}

/// One input of an input registration.
#[derive(Debug, Serialize, Deserialize)]
pub struct InputRoundSignaturePairDto {
    /// Outpoint as `txid:vout`
    pub outpoint: String,
    /// Ownership proof bound to the round (hex)
    pub round_signature: String,
}

/// Request to register inputs.
#[derive(Debug, Serialize, Deserialize)]
pub struct InputsRegistrationRequestDto {
    pub round_id: RoundId,
    pub input_round_signature_pairs: Vec<InputRoundSignaturePairDto>,
}

impl TryFrom<InputsRegistrationRequestDto> for InputsRegistrationRequest {
    type Error = ApiError;

    fn try_from(dto: InputsRegistrationRequestDto) -> Result<Self, ApiError> {
        let input_round_signature_pairs = dto
            .input_round_signature_pairs
            .into_iter()
            .map(|pair| {
                Ok(InputRoundSignaturePair {
                    outpoint: parse_outpoint(&pair.outpoint)?,
                    round_signature: hex::decode(&pair.round_signature)?,
                })
            })
            .collect::<Result<Vec<_>, ApiError>>()?;

        Ok(Self {
            round_id: dto.round_id,
            input_round_signature_pairs,
        })
    }
}

/// Request to register an output.
#[derive(Debug, Serialize, Deserialize)]
pub struct OutputRegistrationRequestDto {
    pub round_id: RoundId,
    /// Output script (hex)
    pub script: String,
    pub requested_weight: u64,
    pub amount_credentials: Vec<Credential>,
    pub weight_credentials: Vec<Credential>,
}

impl TryFrom<OutputRegistrationRequestDto> for OutputRegistrationRequest {
    type Error = ApiError;

    fn try_from(dto: OutputRegistrationRequestDto) -> Result<Self, ApiError> {
        Ok(Self {
            round_id: dto.round_id,
            script: ScriptBuf::from_bytes(hex::decode(&dto.script)?),
            requested_weight: dto.requested_weight,
            amount_credentials: dto.amount_credentials,
            weight_credentials: dto.weight_credentials,
        })
    }
}

/// Witness for one coinjoin input.
#[derive(Debug, Serialize, Deserialize)]
pub struct InputWitnessPairDto {
    pub input_index: usize,
    /// Witness stack items (hex)
    pub witness: Vec<String>,
}

/// Request carrying coinjoin witnesses.
#[derive(Debug, Serialize, Deserialize)]
pub struct TransactionSignaturesRequestDto {
    pub round_id: RoundId,
    pub input_witness_pairs: Vec<InputWitnessPairDto>,
}

impl TryFrom<TransactionSignaturesRequestDto> for TransactionSignaturesRequest {
    type Error = ApiError;

    fn try_from(dto: TransactionSignaturesRequestDto) -> Result<Self, ApiError> {
        let input_witness_pairs = dto
            .input_witness_pairs
            .into_iter()
            .map(|pair| {
                let items = pair
                    .witness
                    .iter()
                    .map(hex::decode)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(InputWitnessPair {
                    input_index: pair.input_index,
                    witness: Witness::from_slice(&items),
                })
            })
            .collect::<Result<Vec<_>, ApiError>>()?;

        Ok(Self {
            round_id: dto.round_id,
            input_witness_pairs,
        })
    }
}

/// Request for the unsigned coinjoin.
#[derive(Debug, Serialize, Deserialize)]
pub struct UnsignedTransactionRequestDto {
    pub round_id: RoundId,
    pub unsigned_transaction_secret: String,
}

impl From<UnsignedTransactionRequestDto> for UnsignedTransactionRequest {
    fn from(dto: UnsignedTransactionRequestDto) -> Self {
        Self {
            round_id: dto.round_id,
            unsigned_transaction_secret: dto.unsigned_transaction_secret,
        }
    }
}

/// The unsigned coinjoin.
#[derive(Debug, Serialize, Deserialize)]
pub struct UnsignedTransactionResponseDto {
    pub txid: String,
    /// Consensus-encoded transaction (hex)
    pub transaction: String,
}

impl From<UnsignedTransactionResponse> for UnsignedTransactionResponseDto {
    fn from(response: UnsignedTransactionResponse) -> Self {
        Self {
            txid: response.transaction.compute_txid().to_string(),
            transaction: encode::serialize_hex(&response.transaction),
        }
    }
}

/// Prison occupancy.
#[derive(Debug, Serialize, Deserialize)]
pub struct PrisonStats {
    pub noted: usize,
    pub banned: usize,
}

/// Status of the coordinator.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub protocol_version: u8,
    pub rounds: Vec<RoundStatus>,
    pub prison: PrisonStats,
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub rounds: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use wabisabi_core::testing::outpoint;

    #[test]
    fn test_registration_dto_decodes() {
        let op = outpoint(7, 1);
        let dto = InputsRegistrationRequestDto {
            round_id: RoundId::new(),
            input_round_signature_pairs: vec![InputRoundSignaturePairDto {
                outpoint: op.to_string(),
                round_signature: "abcd".into(),
            }],
        };

        let request = InputsRegistrationRequest::try_from(dto).unwrap();
        assert_eq!(request.input_round_signature_pairs[0].outpoint, op);
        assert_eq!(request.input_round_signature_pairs[0].round_signature, vec![0xab, 0xcd]);
    }

    #[test]
    fn test_bad_hex_is_bad_request() {
        let dto = OutputRegistrationRequestDto {
            round_id: RoundId::new(),
            script: "zz".into(),
            requested_weight: 124,
            amount_credentials: vec![],
            weight_credentials: vec![],
        };
        let err = OutputRegistrationRequest::try_from(dto).unwrap_err();
        assert_eq!(err.code(), "BAD_REQUEST");
    }

    #[test]
    fn test_bad_outpoint_is_bad_request() {
        let dto = InputsRegistrationRequestDto {
            round_id: RoundId::new(),
            input_round_signature_pairs: vec![InputRoundSignaturePairDto {
                outpoint: "nope".into(),
                round_signature: "00".into(),
            }],
        };
        assert!(InputsRegistrationRequest::try_from(dto).is_err());
    }
}
