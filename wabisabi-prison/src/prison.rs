//! In-memory offense ledger.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use bitcoin::OutPoint;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info};

use wabisabi_core::{SharedClock, SharedConfig, RoundId};

use crate::offense::{DisruptionMethod, Offender, Offense};
use crate::punishment::{punishment, Punishment};

/// An outpoint with an active punishment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Inmate {
    pub outpoint: OutPoint,
    pub punishment: Punishment,
    /// Round of the most recent offense.
    pub last_disrupted_round_id: Option<RoundId>,
    pub offenses: Vec<Offender>,
}

/// Ledger of punished outpoints.
///
/// Stores the full offense history per outpoint and evaluates punishments
/// against the live policy. Every recorded offense is also pushed to the
/// offender channel, if one is attached.
pub struct Prison {
    offenders: RwLock<HashMap<OutPoint, Vec<Offender>>>,
    config: SharedConfig,
    clock: SharedClock,
    change_id: AtomicU64,
    sink: Option<mpsc::UnboundedSender<Offender>>,
}

impl Prison {
    /// Creates a prison that keeps no offender log.
    pub fn new(config: SharedConfig, clock: SharedClock) -> Self {
        Self {
            offenders: RwLock::new(HashMap::new()),
            config,
            clock,
            change_id: AtomicU64::new(0),
            sink: None,
        }
    }

    /// Creates a prison together with the receiving end of its offender log.
    pub fn with_log(config: SharedConfig, clock: SharedClock) -> (Self, mpsc::UnboundedReceiver<Offender>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut prison = Self::new(config, clock);
        prison.sink = Some(tx);
        (prison, rx)
    }

    /// Loads previously persisted offenders without re-emitting them.
    pub fn restore(&self, offenders: impl IntoIterator<Item = Offender>) {
        let mut map = self.offenders.write();
        for offender in offenders {
            map.entry(offender.outpoint).or_default().push(offender);
        }
        self.bump();
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // RECORDING
    // ═══════════════════════════════════════════════════════════════════════════

    /// Records passive non-cooperation. A first offense only notes the coin.
    pub fn note(&self, outpoint: OutPoint, method: DisruptionMethod, value: u64, round_id: Option<RoundId>) -> Punishment {
        self.ban(outpoint, Offense::RoundDisruption { method, value }, round_id)
    }

    /// Records an offense and returns the resulting punishment.
    pub fn ban(&self, outpoint: OutPoint, offense: Offense, round_id: Option<RoundId>) -> Punishment {
        let offender = Offender::new(outpoint, self.clock.now(), offense, round_id);
        self.record(offender)
    }

    /// Punishes the outputs of a transaction that spent `spent`.
    ///
    /// Each descendant is banned for half of the time `spent` had left.
    /// Returns the number of descendants that ended up banned.
    pub fn inherit_punishment(&self, spent: &OutPoint, descendants: &[OutPoint]) -> usize {
        let now = self.clock.now();
        let (parent, mut ancestors) = {
            let map = self.offenders.read();
            let Some(history) = map.get(spent) else {
                return 0;
            };
            let ancestors = history
                .iter()
                .filter_map(|o| match &o.offense {
                    Offense::Inherited { ancestors, .. } => Some(ancestors.clone()),
                    _ => None,
                })
                .next()
                .unwrap_or_default();
            (self.evaluate(history).at(now), ancestors)
        };

        if !parent.is_banned() {
            return 0;
        }

        let remaining = parent.remaining(now).num_seconds();
        ancestors.insert(0, *spent);

        let mut banned = 0;
        for descendant in descendants {
            let offense = Offense::Inherited {
                ancestors: ancestors.clone(),
                parent_remaining_seconds: remaining,
            };
            if self.record(Offender::new(*descendant, now, offense, None)).is_banned() {
                banned += 1;
            }
        }

        if banned > 0 {
            info!(%spent, descendants = banned, remaining_seconds = remaining, "Punishment inherited");
        }
        banned
    }

    fn record(&self, offender: Offender) -> Punishment {
        let outpoint = offender.outpoint;
        let now = offender.started;

        let result = {
            let mut map = self.offenders.write();
            let history = map.entry(outpoint).or_default();
            history.push(offender.clone());
            self.evaluate(history).at(now)
        };
        self.bump();

        match &result {
            Punishment::Banned { until } => info!(%outpoint, offense = ?offender.offense, %until, "Outpoint banned"),
            Punishment::Noted { until } => info!(%outpoint, offense = ?offender.offense, %until, "Outpoint noted"),
            Punishment::None => debug!(%outpoint, offense = ?offender.offense, "Offense recorded without punishment"),
        }

        if let Some(sink) = &self.sink {
            // Receiver is gone only during shutdown.
            let _ = sink.send(offender);
        }

        result
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // QUERIES
    // ═══════════════════════════════════════════════════════════════════════════

    fn evaluate(&self, history: &[Offender]) -> Punishment {
        punishment(history, &self.config.read().prison)
    }

    /// Punishment currently in force for `outpoint`.
    pub fn get_punishment(&self, outpoint: &OutPoint) -> Punishment {
        let now = self.clock.now();
        self.offenders
            .read()
            .get(outpoint)
            .map(|history| self.evaluate(history).at(now))
            .unwrap_or(Punishment::None)
    }

    pub fn is_banned(&self, outpoint: &OutPoint) -> bool {
        self.get_punishment(outpoint).is_banned()
    }

    pub fn is_noted(&self, outpoint: &OutPoint) -> bool {
        self.get_punishment(outpoint).is_noted()
    }

    /// All outpoints with a punishment in force.
    pub fn inmates(&self) -> Vec<Inmate> {
        let now = self.clock.now();
        let map = self.offenders.read();
        let mut inmates: Vec<Inmate> = map
            .iter()
            .filter_map(|(outpoint, history)| {
                let punishment = self.evaluate(history).at(now);
                if punishment == Punishment::None {
                    return None;
                }
                Some(Inmate {
                    outpoint: *outpoint,
                    punishment,
                    last_disrupted_round_id: history.iter().rev().find_map(|o| o.round_id),
                    offenses: history.clone(),
                })
            })
            .collect();
        inmates.sort_by_key(|i| i.punishment.until());
        inmates
    }

    /// Returns `(noted, banned)` counts.
    pub fn count_inmates(&self) -> (usize, usize) {
        self.inmates().iter().fold((0, 0), |(noted, banned), inmate| match inmate.punishment {
            Punishment::Noted { .. } => (noted + 1, banned),
            Punishment::Banned { .. } => (noted, banned + 1),
            Punishment::None => (noted, banned),
        })
    }

    /// Full offense log ordered by start time.
    pub fn offenders(&self) -> Vec<Offender> {
        let mut all: Vec<Offender> = self.offenders.read().values().flatten().cloned().collect();
        all.sort_by_key(|o| o.started);
        all
    }

    /// Monotonic counter bumped by every mutation.
    pub fn change_id(&self) -> u64 {
        self.change_id.load(Ordering::SeqCst)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // RELEASE
    // ═══════════════════════════════════════════════════════════════════════════

    /// Releases `outpoint` early. Returns true if it had any record.
    pub fn try_release(&self, outpoint: &OutPoint) -> bool {
        let removed = self.offenders.write().remove(outpoint).is_some();
        if removed {
            self.bump();
            info!(%outpoint, "Outpoint released");
        }
        removed
    }

    /// Drops every outpoint whose punishment has expired. Returns the released outpoints.
    pub fn release_eligible_inmates(&self) -> Vec<OutPoint> {
        let now = self.clock.now();
        let released: Vec<OutPoint> = {
            let mut map = self.offenders.write();
            let expired: Vec<OutPoint> = map
                .iter()
                .filter(|(_, history)| self.evaluate(history).at(now) == Punishment::None)
                .map(|(outpoint, _)| *outpoint)
                .collect();
            for outpoint in &expired {
                map.remove(outpoint);
            }
            expired
        };

        if !released.is_empty() {
            self.bump();
            info!(count = released.len(), "Released eligible inmates");
        }
        released
    }

    fn bump(&self) {
        self.change_id.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use wabisabi_core::testing::outpoint;
    use wabisabi_core::{Clock, ManualClock, PrisonConfig, WabiSabiConfig};

    fn prison() -> (Prison, Arc<ManualClock>) {
        let clock = ManualClock::starting_now();
        let prison = Prison::new(WabiSabiConfig::default().into_shared(), clock.clone());
        (prison, clock)
    }

    #[test]
    fn test_note_then_release() {
        let (prison, clock) = prison();
        let op = outpoint(1, 0);

        let p = prison.note(op, DisruptionMethod::DidNotConfirm, 50_000, Some(RoundId::new()));
        assert!(p.is_noted());
        assert!(prison.is_noted(&op));
        assert!(!prison.is_banned(&op));
        assert_eq!(prison.count_inmates(), (1, 0));

        clock.advance(PrisonConfig::default().note_duration());
        assert_eq!(prison.get_punishment(&op), Punishment::None);
        assert_eq!(prison.release_eligible_inmates(), vec![op]);
        assert!(prison.inmates().is_empty());
    }

    #[test]
    fn test_change_id_bumps() {
        let (prison, _) = prison();
        let op = outpoint(2, 0);
        let before = prison.change_id();
        prison.ban(op, Offense::Cheating, None);
        let after_ban = prison.change_id();
        assert!(after_ban > before);
        assert!(prison.try_release(&op));
        assert!(prison.change_id() > after_ban);
        assert!(!prison.try_release(&op));
    }

    #[test]
    fn test_inheritance_halves_and_chains() {
        let (prison, clock) = prison();
        let parent = outpoint(1, 0);
        let child = outpoint(2, 0);
        let grandchild = outpoint(3, 0);

        prison.ban(parent, Offense::Cheating, None);
        clock.advance_secs(3_600);
        let parent_remaining = prison.get_punishment(&parent).remaining(clock.now());

        assert_eq!(prison.inherit_punishment(&parent, &[child]), 1);
        let child_remaining = prison.get_punishment(&child).remaining(clock.now());
        assert_eq!(child_remaining.num_seconds(), parent_remaining.num_seconds() / 2);

        assert_eq!(prison.inherit_punishment(&child, &[grandchild]), 1);
        let inmate = prison.inmates().into_iter().find(|i| i.outpoint == grandchild).unwrap();
        match &inmate.offenses[0].offense {
            Offense::Inherited { ancestors, .. } => assert_eq!(ancestors, &vec![child, parent]),
            other => panic!("unexpected offense {other:?}"),
        }
    }

    #[test]
    fn test_unpunished_coin_passes_nothing_on() {
        let (prison, _) = prison();
        assert_eq!(prison.inherit_punishment(&outpoint(1, 0), &[outpoint(2, 0)]), 0);

        prison.note(outpoint(4, 0), DisruptionMethod::DidNotConfirm, 50_000, None);
        assert_eq!(prison.inherit_punishment(&outpoint(4, 0), &[outpoint(5, 0)]), 0);
    }

    #[tokio::test]
    async fn test_offenders_are_streamed() {
        let clock = ManualClock::starting_now();
        let (prison, mut rx) = Prison::with_log(WabiSabiConfig::default().into_shared(), clock);
        prison.ban(outpoint(7, 1), Offense::FailedToVerify, None);

        let offender = rx.recv().await.unwrap();
        assert_eq!(offender.outpoint, outpoint(7, 1));
        assert_eq!(offender.offense, Offense::FailedToVerify);
    }

    #[test]
    fn test_policy_is_read_live() {
        let clock = ManualClock::starting_now();
        let config = WabiSabiConfig::default().into_shared();
        let prison = Prison::new(config.clone(), clock.clone());
        let op = outpoint(8, 0);
        prison.ban(op, Offense::Cheating, None);

        config.write().prison.min_time_for_cheating_seconds = 10;
        clock.advance_secs(11);
        assert!(!prison.is_banned(&op));
    }
}
