//! API route handlers.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, Json};
use tracing::debug;

use wabisabi_arena::{
    ConnectionConfirmationRequest, ConnectionConfirmationResponse, InputsRegistrationResponse, InputsRemovalRequest,
    OutputRegistrationResponse, ReadyToSignRequest,
};
use wabisabi_core::PROTOCOL_VERSION;

use crate::dto::*;
use crate::error::ApiError;
use crate::state::AppState;

type Result<T> = std::result::Result<T, ApiError>;

/// GET /health
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".into(),
        version: env!("CARGO_PKG_VERSION").into(),
        rounds: state.handler.arena().rounds().len(),
    })
}

/// GET /wabisabi/status
pub async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let (noted, banned) = state.handler.arena().prison().count_inmates();
    Json(StatusResponse {
        protocol_version: PROTOCOL_VERSION,
        rounds: state.handler.status(),
        prison: PrisonStats { noted, banned },
    })
}

/// POST /wabisabi/input-registration
pub async fn register_input(
    State(state): State<Arc<AppState>>,
    Json(req): Json<InputsRegistrationRequestDto>,
) -> Result<Json<InputsRegistrationResponse>> {
    let response = state.handler.register_input(req.try_into()?).await?;
    debug!(alice_id = %response.alice_id, "Input registration served");
    Ok(Json(response))
}

/// POST /wabisabi/input-unregistration
pub async fn remove_input(
    State(state): State<Arc<AppState>>,
    Json(req): Json<InputsRemovalRequest>,
) -> Result<StatusCode> {
    state.handler.remove_input(req).await?;
    Ok(StatusCode::OK)
}

/// POST /wabisabi/connection-confirmation
pub async fn confirm_connection(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ConnectionConfirmationRequest>,
) -> Result<Json<ConnectionConfirmationResponse>> {
    Ok(Json(state.handler.confirm_connection(req).await?))
}

/// POST /wabisabi/output-registration
pub async fn register_output(
    State(state): State<Arc<AppState>>,
    Json(req): Json<OutputRegistrationRequestDto>,
) -> Result<Json<OutputRegistrationResponse>> {
    Ok(Json(state.handler.register_output(req.try_into()?).await?))
}

/// POST /wabisabi/ready-to-sign
pub async fn ready_to_sign(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ReadyToSignRequest>,
) -> Result<StatusCode> {
    state.handler.ready_to_sign(req).await?;
    Ok(StatusCode::OK)
}

/// POST /wabisabi/unsigned-transaction
pub async fn unsigned_transaction(
    State(state): State<Arc<AppState>>,
    Json(req): Json<UnsignedTransactionRequestDto>,
) -> Result<Json<UnsignedTransactionResponseDto>> {
    let response = state.handler.unsigned_transaction(req.into()).await?;
    Ok(Json(response.into()))
}

/// POST /wabisabi/transaction-signature
pub async fn sign_transaction(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TransactionSignaturesRequestDto>,
) -> Result<StatusCode> {
    state.handler.sign_transaction(req.try_into()?).await?;
    Ok(StatusCode::OK)
}
