//! App state: request handler, config.

use std::net::SocketAddr;

use wabisabi_arena::ArenaRequestHandler;

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub bind_addr: SocketAddr,
    pub max_body_bytes: usize,
}

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:37127";
const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 37127)),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

impl ApiConfig {
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        Self {
            bind_addr: std::env::var("WABISABI_BIND_ADDR")
                .unwrap_or_else(|_| DEFAULT_BIND_ADDR.into())
                .parse()
                .unwrap_or_else(|e| {
                    tracing::warn!(error = %e, "Invalid WABISABI_BIND_ADDR, using default");
                    Self::default().bind_addr
                }),
            max_body_bytes: std::env::var("WABISABI_MAX_BODY_BYTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_MAX_BODY_BYTES),
        }
    }
}

pub struct AppState {
    pub config: ApiConfig,
    pub handler: ArenaRequestHandler,
}

impl AppState {
    pub fn new(config: ApiConfig, handler: ArenaRequestHandler) -> Self {
        Self { config, handler }
    }
}
