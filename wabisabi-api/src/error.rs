//! API error handling.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use wabisabi_core::CoordinatorError;

/// API error type.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
    code: String,
}

impl ApiError {
    /// Creates a new API error.
    pub fn new(status: StatusCode, message: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            code: code.into(),
        }
    }

    /// Bad request error.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message, "BAD_REQUEST")
    }

    /// Internal server error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message, "INTERNAL_ERROR")
    }

    /// Validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNPROCESSABLE_ENTITY, message, "VALIDATION_ERROR")
    }

    /// Backend unavailable.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, message, "SERVICE_UNAVAILABLE")
    }

    /// HTTP status of the error.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Machine-readable error code.
    pub fn code(&self) -> &str {
        &self.code
    }
}

/// Error response body.
#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: String,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: ErrorBody {
                code: self.code,
                message: self.message,
            },
        };

        (self.status, Json(body)).into_response()
    }
}

impl From<CoordinatorError> for ApiError {
    fn from(err: CoordinatorError) -> Self {
        match &err {
            CoordinatorError::Protocol { code, message } => {
                let status = if code.is_not_found() {
                    StatusCode::NOT_FOUND
                } else {
                    StatusCode::BAD_REQUEST
                };
                ApiError::new(status, message.clone(), code.as_str())
            }
            CoordinatorError::ValidationError(_) => ApiError::validation(err.to_string()),
            CoordinatorError::HexError(_) | CoordinatorError::EncodingError(_) | CoordinatorError::JsonError(_) => {
                ApiError::bad_request(err.to_string())
            }
            e if e.is_infrastructure() => {
                tracing::warn!(error = %err, "Backend fault while serving request");
                ApiError::unavailable("Chain backend unavailable, retry later")
            }
            _ => {
                tracing::error!(error = %err, "Internal error");
                ApiError::internal("An internal error occurred")
            }
        }
    }
}

impl From<hex::FromHexError> for ApiError {
    fn from(err: hex::FromHexError) -> Self {
        ApiError::bad_request(format!("Invalid hex: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wabisabi_core::ProtocolErrorCode;

    #[test]
    fn test_protocol_codes_pass_through() {
        let err: ApiError = CoordinatorError::protocol(ProtocolErrorCode::InputBanned, "banned").into();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.code(), "InputBanned");

        let err: ApiError = CoordinatorError::protocol(ProtocolErrorCode::RoundNotFound, "gone").into();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_backend_faults_are_unavailable() {
        let err: ApiError = CoordinatorError::ConnectionTimeout("gettxout".into()).into();
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);

        let err: ApiError = CoordinatorError::InternalError("oops".into()).into();
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
