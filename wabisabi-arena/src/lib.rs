//! # WabiSabi Arena
//!
//! Round lifecycle for the WabiSabi coordinator.
//!
//! - **Arena**: owns every round and advances phases on a periodic tick
//! - **Handler**: the admission pipeline and the other client operations
//! - **Mempool**: double-spend detection and punishment inheritance
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use wabisabi_arena::{Arena, ArenaRequestHandler, InMemoryCoinJoinIdStore};
//! use wabisabi_core::testing::{AcceptAllVerifier, MemoryUtxoProvider};
//! use wabisabi_core::{SystemClock, WabiSabiConfig};
//! use wabisabi_prison::Prison;
//!
//! # async fn example() {
//! let config = WabiSabiConfig::default().into_shared();
//! let clock = SystemClock::shared();
//! let prison = Arc::new(Prison::new(config.clone(), clock.clone()));
//! let arena = Arc::new(Arena::new(
//!     config,
//!     clock,
//!     prison,
//!     Arc::new(MemoryUtxoProvider::new()),
//!     Arc::new(AcceptAllVerifier),
//!     Arc::new(InMemoryCoinJoinIdStore::new()),
//! ));
//!
//! arena.tick().await;
//! let handler = ArenaRequestHandler::new(arena);
//! assert_eq!(handler.status().len(), 1);
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, clippy::all)]

pub mod arena;
pub mod coinjoin_ids;
pub mod credentials;
pub mod handler;
pub mod mempool;
pub mod messages;
pub mod params;
pub mod participants;
pub mod round;
pub mod signatures;

pub use arena::Arena;
pub use coinjoin_ids::InMemoryCoinJoinIdStore;
pub use credentials::SerialNumberPool;
pub use handler::ArenaRequestHandler;
pub use mempool::{CoinJoinMempoolManager, MempoolVerdict};
pub use messages::*;
pub use params::RoundParameters;
pub use participants::{Alice, Bob};
pub use round::{Round, RoundState, RoundStatus};
pub use signatures::{ownership_message, Secp256k1Verifier};
