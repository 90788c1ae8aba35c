//! API route configuration.

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};

use crate::handlers;
use crate::state::AppState;

/// Creates the API router with all routes configured.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Health check
        .route("/health", get(handlers::health_check))

        // Round status
        .route("/wabisabi/status", get(handlers::status))

        // Input registration phase
        .route("/wabisabi/input-registration", post(handlers::register_input))
        .route("/wabisabi/input-unregistration", post(handlers::remove_input))
        .route("/wabisabi/connection-confirmation", post(handlers::confirm_connection))

        // Output registration phase
        .route("/wabisabi/output-registration", post(handlers::register_output))
        .route("/wabisabi/ready-to-sign", post(handlers::ready_to_sign))

        // Signing phase
        .route("/wabisabi/unsigned-transaction", post(handlers::unsigned_transaction))
        .route("/wabisabi/transaction-signature", post(handlers::sign_transaction))

        .with_state(state)
}
