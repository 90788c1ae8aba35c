//! Domain types for the coordinator.
//!
//! - [`RoundId`] / [`AliceId`]: Opaque identifiers handed to clients
//! - [`Coin`]: A registered UTXO and its previous output
//! - [`Credential`]: An issued amount or weight credential
//! - [`Phase`] / [`EndRoundState`]: Round lifecycle
//! - [`ScriptType`]: Script templates a round accepts

mod coin;
mod credential;
mod ids;
mod phase;
mod script;

pub use coin::*;
pub use credential::*;
pub use ids::*;
pub use phase::*;
pub use script::*;
