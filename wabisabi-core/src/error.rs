//! Error types for the coordinator.
//!
//! This module provides the error hierarchy using `thiserror`. Protocol
//! violations carry a [`ProtocolErrorCode`] that is surfaced verbatim to
//! clients; everything else is an infrastructure or internal fault.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using `CoordinatorError`.
pub type Result<T> = std::result::Result<T, CoordinatorError>;

/// Protocol error codes returned to clients.
///
/// The string form of each variant is part of the wire protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolErrorCode {
    RoundNotFound,
    WrongPhase,
    AliceNotFound,
    AliceAlreadyRegistered,
    AliceAlreadyConfirmedConnection,
    InputBanned,
    InputSpent,
    InputUnconfirmed,
    InputImmature,
    InputNotWhitelisted,
    ScriptNotAllowed,
    NonUniqueInputs,
    TooManyInputs,
    NotEnoughFunds,
    TooMuchFunds,
    TooMuchWeight,
    IncorrectRequestedWeightCredentials,
    InvalidCredentials,
    WrongRoundSignature,
    WrongCoinjoinSignature,
}

impl ProtocolErrorCode {
    /// Returns the wire name of the code.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundNotFound => "RoundNotFound",
            Self::WrongPhase => "WrongPhase",
            Self::AliceNotFound => "AliceNotFound",
            Self::AliceAlreadyRegistered => "AliceAlreadyRegistered",
            Self::AliceAlreadyConfirmedConnection => "AliceAlreadyConfirmedConnection",
            Self::InputBanned => "InputBanned",
            Self::InputSpent => "InputSpent",
            Self::InputUnconfirmed => "InputUnconfirmed",
            Self::InputImmature => "InputImmature",
            Self::InputNotWhitelisted => "InputNotWhitelisted",
            Self::ScriptNotAllowed => "ScriptNotAllowed",
            Self::NonUniqueInputs => "NonUniqueInputs",
            Self::TooManyInputs => "TooManyInputs",
            Self::NotEnoughFunds => "NotEnoughFunds",
            Self::TooMuchFunds => "TooMuchFunds",
            Self::TooMuchWeight => "TooMuchWeight",
            Self::IncorrectRequestedWeightCredentials => "IncorrectRequestedWeightCredentials",
            Self::InvalidCredentials => "InvalidCredentials",
            Self::WrongRoundSignature => "WrongRoundSignature",
            Self::WrongCoinjoinSignature => "WrongCoinjoinSignature",
        }
    }

    /// Returns true if the code means the referenced round or participant is unknown.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::RoundNotFound | Self::AliceNotFound)
    }
}

impl fmt::Display for ProtocolErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main error type for all coordinator operations.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    // ═══════════════════════════════════════════════════════════════════════════
    // PROTOCOL ERRORS
    // ═══════════════════════════════════════════════════════════════════════════

    /// A client request violated the protocol.
    #[error("{code}: {message}")]
    Protocol {
        code: ProtocolErrorCode,
        message: String,
    },

    // ═══════════════════════════════════════════════════════════════════════════
    // CHAIN ERRORS
    // ═══════════════════════════════════════════════════════════════════════════

    /// RPC call to the chain backend failed.
    #[error("RPC call failed: {0}")]
    RpcError(String),

    /// Chain backend did not answer in time.
    #[error("Connection timeout: {0}")]
    ConnectionTimeout(String),

    /// Transaction broadcast was rejected.
    #[error("Broadcast rejected: {0}")]
    BroadcastRejected(String),

    // ═══════════════════════════════════════════════════════════════════════════
    // RISK API ERRORS
    // ═══════════════════════════════════════════════════════════════════════════

    /// HTTP request failed.
    #[error("HTTP request failed: {0}")]
    HttpError(String),

    /// Risk API answered with a non-success status.
    #[error("Risk API returned status {status}: {body}")]
    ApiStatus { status: u16, body: String },

    /// Operation was cancelled before it completed.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    // ═══════════════════════════════════════════════════════════════════════════
    // SERIALIZATION ERRORS
    // ═══════════════════════════════════════════════════════════════════════════

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Invalid hex encoding.
    #[error("Invalid hex encoding: {0}")]
    HexError(#[from] hex::FromHexError),

    /// Bitcoin consensus encoding error.
    #[error("Consensus encoding error: {0}")]
    EncodingError(String),

    // ═══════════════════════════════════════════════════════════════════════════
    // STORAGE ERRORS
    // ═══════════════════════════════════════════════════════════════════════════

    /// File I/O error.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Persisted state could not be read back.
    #[error("Storage error: {0}")]
    StorageError(String),

    // ═══════════════════════════════════════════════════════════════════════════
    // VALIDATION ERRORS
    // ═══════════════════════════════════════════════════════════════════════════

    /// Input validation failed.
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    // ═══════════════════════════════════════════════════════════════════════════
    // INTERNAL ERRORS
    // ═══════════════════════════════════════════════════════════════════════════

    /// Internal invariant violation (should never happen).
    #[error("Internal error: {0}")]
    InternalError(String),
}

impl CoordinatorError {
    /// Creates a protocol error.
    pub fn protocol(code: ProtocolErrorCode, message: impl Into<String>) -> Self {
        Self::Protocol {
            code,
            message: message.into(),
        }
    }

    /// Returns the protocol code if this is a protocol violation.
    pub fn protocol_code(&self) -> Option<ProtocolErrorCode> {
        match self {
            Self::Protocol { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Returns true if this error is recoverable (can retry).
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::HttpError(_) | Self::ConnectionTimeout(_) | Self::RpcError(_) => true,
            Self::ApiStatus { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// Returns true if this is an infrastructure fault rather than client misbehavior.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            Self::RpcError(_)
                | Self::ConnectionTimeout(_)
                | Self::BroadcastRejected(_)
                | Self::HttpError(_)
                | Self::ApiStatus { .. }
                | Self::Cancelled(_)
        )
    }
}

impl From<bitcoin::consensus::encode::Error> for CoordinatorError {
    fn from(err: bitcoin::consensus::encode::Error) -> Self {
        Self::EncodingError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_display() {
        let err = CoordinatorError::protocol(ProtocolErrorCode::WrongPhase, "round is full");
        assert_eq!(err.to_string(), "WrongPhase: round is full");
        assert_eq!(err.protocol_code(), Some(ProtocolErrorCode::WrongPhase));
    }

    #[test]
    fn test_code_serializes_verbatim() {
        let json = serde_json::to_string(&ProtocolErrorCode::AliceAlreadyRegistered).unwrap();
        assert_eq!(json, "\"AliceAlreadyRegistered\"");
        let back: ProtocolErrorCode = serde_json::from_str("\"InputBanned\"").unwrap();
        assert_eq!(back, ProtocolErrorCode::InputBanned);
    }

    #[test]
    fn test_error_classification() {
        assert!(CoordinatorError::HttpError("test".into()).is_recoverable());
        assert!(CoordinatorError::ApiStatus { status: 503, body: String::new() }.is_recoverable());
        assert!(!CoordinatorError::ApiStatus { status: 401, body: String::new() }.is_recoverable());
        assert!(!CoordinatorError::protocol(ProtocolErrorCode::InputBanned, "x").is_recoverable());

        assert!(CoordinatorError::RpcError("down".into()).is_infrastructure());
        assert!(!CoordinatorError::ValidationError("bad".into()).is_infrastructure());
    }

    #[test]
    fn test_not_found_codes() {
        assert!(ProtocolErrorCode::RoundNotFound.is_not_found());
        assert!(ProtocolErrorCode::AliceNotFound.is_not_found());
        assert!(!ProtocolErrorCode::WrongPhase.is_not_found());
    }
}
