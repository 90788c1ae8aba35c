//! Offense records.

use bitcoin::OutPoint;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use wabisabi_core::{PrisonConfig, Result, RoundId};

/// How a participant disrupted a round.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DisruptionMethod {
    DidNotConfirm,
    DidNotSignalReadyToSign,
    DidNotSign,
    DoubleSpent,
}

impl DisruptionMethod {
    /// Multiplier applied to the base disruption ban.
    pub fn penalty_factor(&self, policy: &PrisonConfig) -> f64 {
        match self {
            Self::DidNotConfirm => policy.penalty_factor_for_disrupting_confirmation,
            Self::DidNotSignalReadyToSign => policy.penalty_factor_for_disrupting_signal_ready_to_sign,
            Self::DidNotSign => policy.penalty_factor_for_disrupting_signing,
            Self::DoubleSpent => policy.penalty_factor_for_disrupting_by_double_spending,
        }
    }

    /// Passive non-cooperation, only noted on a first offense.
    pub fn is_passive(&self) -> bool {
        matches!(self, Self::DidNotConfirm | Self::DidNotSignalReadyToSign)
    }
}

/// Why an outpoint is in prison.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Offense {
    /// The external risk check flagged the coin.
    FailedToVerify,
    /// The coin's owner stalled or sabotaged a round.
    RoundDisruption {
        method: DisruptionMethod,
        /// Value of the disrupting coin in sats.
        value: u64,
    },
    /// Forged proof or signature.
    Cheating,
    /// Created by spending a banned coin.
    Inherited {
        /// Banned coins this one descends from, nearest first.
        ancestors: Vec<OutPoint>,
        /// Ban time the spent parent had left when it was spent.
        parent_remaining_seconds: i64,
    },
}

/// One recorded offense against one outpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Offender {
    pub outpoint: OutPoint,
    pub started: DateTime<Utc>,
    pub offense: Offense,
    /// Round in which the offense happened, if any.
    pub round_id: Option<RoundId>,
}

impl Offender {
    pub fn new(outpoint: OutPoint, started: DateTime<Utc>, offense: Offense, round_id: Option<RoundId>) -> Self {
        Self {
            outpoint,
            started,
            offense,
            round_id,
        }
    }

    /// Serializes to one line of the offender log.
    pub fn to_json_line(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses one line of the offender log.
    pub fn from_json_line(line: &str) -> Result<Self> {
        Ok(serde_json::from_str(line)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wabisabi_core::testing::outpoint;

    #[test]
    fn test_offender_line_format() {
        let offender = Offender::new(
            outpoint(1, 2),
            Utc::now(),
            Offense::RoundDisruption {
                method: DisruptionMethod::DoubleSpent,
                value: 42,
            },
            Some(RoundId::new()),
        );

        let line = offender.to_json_line().unwrap();
        assert!(!line.contains('\n'));
        assert!(line.contains("\"type\":\"RoundDisruption\""));
        assert_eq!(Offender::from_json_line(&line).unwrap(), offender);
    }

    #[test]
    fn test_passive_methods() {
        assert!(DisruptionMethod::DidNotConfirm.is_passive());
        assert!(DisruptionMethod::DidNotSignalReadyToSign.is_passive());
        assert!(!DisruptionMethod::DidNotSign.is_passive());
        assert!(!DisruptionMethod::DoubleSpent.is_passive());
    }
}
