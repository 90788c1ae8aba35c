//! # WabiSabi Prison
//!
//! Punishment of misbehaving coins.
//!
//! - [`Offense`] / [`Offender`]: what an outpoint did and when
//! - [`punishment`]: pure policy from offense history to [`Punishment`]
//! - [`Prison`]: the concurrent ledger queried during input registration
//! - [`Warden`]: loads the offender log, appends new offenders, releases expired ones
//!
//! ## Example
//!
//! ```rust
//! use wabisabi_core::{SystemClock, WabiSabiConfig};
//! use wabisabi_prison::{DisruptionMethod, Prison};
//!
//! let prison = Prison::new(WabiSabiConfig::default().into_shared(), SystemClock::shared());
//! let outpoint = bitcoin::OutPoint::null();
//!
//! let punishment = prison.note(outpoint, DisruptionMethod::DidNotConfirm, 50_000, None);
//! assert!(punishment.is_noted());
//! assert!(!prison.is_banned(&outpoint));
//! ```

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, clippy::all)]

pub mod offense;
pub mod prison;
pub mod punishment;
pub mod warden;

pub use offense::{DisruptionMethod, Offender, Offense};
pub use prison::{Inmate, Prison};
pub use punishment::{disruption_ban, punishment, Punishment};
pub use warden::{read_offenders, Warden};
