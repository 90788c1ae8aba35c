//! Punishment policy.
//!
//! The effective punishment of an outpoint is a pure function of its offense
//! history and the live policy, so durations follow config changes without
//! rewriting stored offenses.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use wabisabi_core::{PrisonConfig, RoundId};

use crate::offense::{DisruptionMethod, Offender, Offense};

/// Effective punishment of one outpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Punishment {
    None,
    /// Soft punishment: registration allowed only if the coordinator permits noted inputs.
    Noted { until: DateTime<Utc> },
    Banned { until: DateTime<Utc> },
}

impl Punishment {
    pub fn until(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::None => None,
            Self::Noted { until } | Self::Banned { until } => Some(*until),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::None => 0,
            Self::Noted { .. } => 1,
            Self::Banned { .. } => 2,
        }
    }

    /// Returns the harsher of two punishments. Banned beats noted, then the later expiry wins.
    pub fn worse(self, other: Self) -> Self {
        if (other.rank(), other.until()) > (self.rank(), self.until()) {
            other
        } else {
            self
        }
    }

    /// The punishment still in force at `now`.
    pub fn at(self, now: DateTime<Utc>) -> Self {
        match self.until() {
            Some(until) if until > now => self,
            _ => Self::None,
        }
    }

    /// Time left at `now`, zero once expired.
    pub fn remaining(&self, now: DateTime<Utc>) -> chrono::Duration {
        match self.until() {
            Some(until) if until > now => until - now,
            _ => chrono::Duration::zero(),
        }
    }

    pub fn is_banned(&self) -> bool {
        matches!(self, Self::Banned { .. })
    }

    pub fn is_noted(&self) -> bool {
        matches!(self, Self::Noted { .. })
    }
}

/// Ban length for the `k`-th disrupted round (1-based) of a coin worth `value` sats.
///
/// `severity / value * factor * 2^(k-1)` hours, capped at the long ban.
pub fn disruption_ban(method: DisruptionMethod, value: u64, k: u32, policy: &PrisonConfig) -> chrono::Duration {
    let cap = policy.long_ban_duration();
    if value == 0 {
        return cap;
    }

    let exponent = i32::try_from(k.saturating_sub(1).min(62)).unwrap_or(62);
    let hours = policy.dos_severity_sats as f64 / value as f64 * method.penalty_factor(policy) * 2f64.powi(exponent);
    let millis = hours * 3_600_000.0;

    if !millis.is_finite() || millis >= cap.num_milliseconds() as f64 {
        cap
    } else {
        chrono::Duration::milliseconds(millis.max(0.0) as i64)
    }
}

/// Computes the effective punishment from an outpoint's offense history.
///
/// Expiry is not applied here; use [`Punishment::at`] for the punishment in
/// force at a given time.
pub fn punishment(history: &[Offender], policy: &PrisonConfig) -> Punishment {
    let mut ordered: Vec<&Offender> = history.iter().collect();
    ordered.sort_by_key(|o| o.started);

    let mut seen_rounds: HashSet<RoundId> = HashSet::new();
    let mut disrupted_rounds: u32 = 0;
    let mut worst = Punishment::None;

    for offender in ordered {
        let current = match &offender.offense {
            Offense::FailedToVerify => Punishment::Banned {
                until: offender.started + policy.failed_to_verify_duration(),
            },
            Offense::Cheating => Punishment::Banned {
                until: offender.started + policy.cheating_duration(),
            },
            Offense::RoundDisruption { method, value } => {
                let new_round = match offender.round_id {
                    Some(id) => seen_rounds.insert(id),
                    None => true,
                };
                if new_round {
                    disrupted_rounds += 1;
                }

                let lenient = method.is_passive() || *value >= policy.large_coin_threshold_sats;
                if disrupted_rounds <= 1 && lenient {
                    Punishment::Noted {
                        until: offender.started + policy.note_duration(),
                    }
                } else {
                    Punishment::Banned {
                        until: offender.started + disruption_ban(*method, *value, disrupted_rounds, policy),
                    }
                }
            }
            Offense::Inherited {
                parent_remaining_seconds,
                ..
            } => {
                let seconds = parent_remaining_seconds / 2;
                if seconds <= 0 {
                    Punishment::None
                } else {
                    Punishment::Banned {
                        until: offender.started + chrono::Duration::seconds(seconds),
                    }
                }
            }
        };

        worst = worst.worse(current);
    }

    worst
}
