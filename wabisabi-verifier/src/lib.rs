//! # WabiSabi Verifier
//!
//! External risk screening of coins entering a round.
//!
//! - [`CoinVerifierApiClient`]: HTTP client for the risk API, with retries
//! - [`CoinVerifier`]: schedules checks and turns reports into ban/remove verdicts
//! - [`Whitelist`]: expiring cache of clean verdicts

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, clippy::all)]

pub mod api_client;
pub mod verifier;
pub mod whitelist;

pub use api_client::{ApiResponse, CoinVerifierApiClient, CscoreSection, RiskFlag};
pub use verifier::{CandidateCoin, CoinVerifier, CoinVerifyResult, VerifyReason};
pub use whitelist::{Innocent, Whitelist};
