//! # WabiSabi Core
//!
//! Core types, errors, configuration and traits for the WabiSabi CoinJoin coordinator.
//!
//! This crate provides the foundational building blocks used by all other coordinator crates:
//!
//! - **Types**: Round and participant identifiers, coins, credentials, phases
//! - **Errors**: The coordinator error hierarchy and the protocol error taxonomy
//! - **Config**: The hot-reloadable JSON configuration
//! - **Traits**: Narrow interfaces to the chain, signature checks and credential pools
//!
//! ## Example
//!
//! ```rust
//! use wabisabi_core::{Phase, ProtocolErrorCode, WabiSabiConfig};
//!
//! let config = WabiSabiConfig::default();
//! assert_eq!(config.min_input_count_by_round(), 50);
//! assert!(Phase::InputRegistration < Phase::OutputRegistration);
//! assert_eq!(ProtocolErrorCode::WrongPhase.to_string(), "WrongPhase");
//! ```

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, clippy::all)]

pub mod clock;
pub mod config;
pub mod constants;
pub mod error;
pub mod traits;
pub mod types;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

// Re-export commonly used items at crate root
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{
    BitcoinRpcConfig, CoinVerifierConfig, ConfigWatcher, CoordinationFeeRate, PrisonConfig,
    SharedConfig, WabiSabiConfig,
};
pub use constants::*;
pub use error::{CoordinatorError, ProtocolErrorCode, Result};
pub use traits::*;
pub use types::*;
