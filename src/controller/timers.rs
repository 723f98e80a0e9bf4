//! Named timer registry
//!
//! Every background activity of a controller is a named deadline here. Arming
//! an already armed timer replaces its deadline; cancelling is idempotent.
//! Handlers re-check their preconditions when a timer fires.

use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TimerKind {
    StartupProbe,
    UpperDebounce,
    BelowLower,
    NoData,
    AutoConnect,
    ResumeMonitor,
    ReclaimMonitor,
    ReclaimRelease,
    Regulation,
    PlannerMonitor,
    Relock,
    EnableRetry,
    PhaseStopPoll,
    PhaseVetoEnd,
    PhaseFallback,
    Midnight,
    PersistFlush,
}

impl TimerKind {
    /// Timers driven by the cable session; cancelled on disconnect
    pub const SESSION: [Self; 9] = [
        Self::UpperDebounce,
        Self::BelowLower,
        Self::NoData,
        Self::AutoConnect,
        Self::ResumeMonitor,
        Self::ReclaimMonitor,
        Self::ReclaimRelease,
        Self::Regulation,
        Self::Relock,
    ];
}

#[derive(Debug, Default)]
pub struct TimerRegistry {
    deadlines: BTreeMap<TimerKind, Instant>,
}

impl TimerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm(&mut self, kind: TimerKind, at: Instant) {
        self.deadlines.insert(kind, at);
    }

    pub fn arm_in(&mut self, kind: TimerKind, now: Instant, after: Duration) {
        self.arm(kind, now + after);
    }

    /// Arm only when not armed already
    pub fn ensure(&mut self, kind: TimerKind, at: Instant) -> bool {
        if self.deadlines.contains_key(&kind) {
            return false;
        }
        self.arm(kind, at);
        true
    }

    pub fn cancel(&mut self, kind: TimerKind) -> bool {
        self.deadlines.remove(&kind).is_some()
    }

    pub fn cancel_where(&mut self, pred: impl Fn(TimerKind) -> bool) {
        self.deadlines.retain(|k, _| !pred(*k));
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.deadlines.contains_key(&kind)
    }

    pub fn deadline(&self, kind: TimerKind) -> Option<Instant> {
        self.deadlines.get(&kind).copied()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.values().min().copied()
    }

    /// Remove and return every timer due at `now`, earliest first
    pub fn take_due(&mut self, now: Instant) -> Vec<TimerKind> {
        let mut due: Vec<(Instant, TimerKind)> = self
            .deadlines
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(k, at)| (*at, *k))
            .collect();
        due.sort();
        for (_, k) in &due {
            self.deadlines.remove(k);
        }
        due.into_iter().map(|(_, k)| k).collect()
    }

    pub fn armed(&self) -> Vec<TimerKind> {
        self.deadlines.keys().copied().collect()
    }
}
