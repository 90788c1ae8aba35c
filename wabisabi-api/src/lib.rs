//! # WabiSabi API Server
//!
//! HTTP surface of the coordinator. Every protocol request is a JSON POST;
//! protocol errors come back as `{"error": {"code", "message"}}` with the code
//! spelled exactly as the protocol names it.
//!
//! ## Endpoints
//!
//! - `GET /wabisabi/status` - Round snapshots and prison occupancy
//! - `POST /wabisabi/input-registration` - Register an Alice
//! - `POST /wabisabi/input-unregistration` - Remove an Alice during input registration
//! - `POST /wabisabi/connection-confirmation` - Keep alive and collect real credentials
//! - `POST /wabisabi/output-registration` - Register a Bob
//! - `POST /wabisabi/ready-to-sign` - Signal all outputs are registered
//! - `POST /wabisabi/unsigned-transaction` - Fetch the coinjoin to sign
//! - `POST /wabisabi/transaction-signature` - Submit witnesses
//!
//! ## Example
//!
//! ```rust,ignore
//! use wabisabi_api::{ApiServer, ApiConfig};
//!
//! let server = ApiServer::new(ApiConfig::from_env(), handler);
//! server.run(shutdown).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

mod dto;
mod error;
mod handlers;
mod routes;
mod state;

pub use dto::*;
pub use error::ApiError;
pub use routes::create_router;
pub use state::{ApiConfig, AppState};

use std::sync::Arc;

use axum::Router;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use wabisabi_arena::ArenaRequestHandler;

/// API server for the coordinator.
pub struct ApiServer {
    state: Arc<AppState>,
}

impl ApiServer {
    /// Creates a new API server serving `handler`.
    pub fn new(config: ApiConfig, handler: ArenaRequestHandler) -> Self {
        Self {
            state: Arc::new(AppState::new(config, handler)),
        }
    }

    /// Creates the router with all routes and layers configured.
    pub fn router(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        create_router(self.state.clone())
            .layer(RequestBodyLimitLayer::new(self.state.config.max_body_bytes))
            .layer(cors)
            .layer(TraceLayer::new_for_http())
    }

    /// Serves until `shutdown` flips to true, then lets in-flight requests finish.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> std::io::Result<()> {
        let addr = self.state.config.bind_addr;
        let listener = tokio::net::TcpListener::bind(addr).await?;

        info!("WabiSabi API server listening on {}", addr);

        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                while shutdown.changed().await.is_ok() {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            })
            .await
    }
}
