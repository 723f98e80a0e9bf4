//! Charging-enable bookkeeping: what we asked for, whether the switch
//! followed, and how often we retried.

use std::time::Duration;

/// Re-issue interval while an "on" command has no effect
pub const ENABLE_RETRY_INTERVAL: Duration = Duration::from_secs(60);
/// Re-issue interval while an "off" command has no effect
pub const DISABLE_RETRY_INTERVAL: Duration = Duration::from_secs(30);
pub const MAX_ENABLE_RETRIES: u32 = 10;

/// What an observed switch transition means
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnableObservation {
    /// Matches (or is unrelated to) what we asked for
    Expected,
    /// Switched off while we wanted it on
    ExternalOff,
    /// Switched on while we wanted it off
    ExternalOn,
}

/// Outcome of a retry deadline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStep {
    Settled,
    Reissue { on: bool, attempt: u32 },
    GiveUp { on: bool },
}

#[derive(Debug, Default, Clone)]
pub struct EnableTracker {
    desired: Option<bool>,
    awaiting: bool,
    attempts: u32,
}

impl EnableTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub const fn desired(&self) -> Option<bool> {
        self.desired
    }

    pub const fn awaiting(&self) -> bool {
        self.awaiting
    }

    /// Record an issued command; returns the retry interval to arm
    pub fn commanded(&mut self, on: bool) -> Duration {
        if self.desired != Some(on) {
            self.attempts = 0;
        }
        self.desired = Some(on);
        self.awaiting = true;
        Self::interval(on)
    }

    pub const fn interval(on: bool) -> Duration {
        if on {
            ENABLE_RETRY_INTERVAL
        } else {
            DISABLE_RETRY_INTERVAL
        }
    }

    /// Accept a value without commanding it (external change we go along with)
    pub fn adopt(&mut self, on: bool) {
        self.desired = Some(on);
        self.awaiting = false;
        self.attempts = 0;
    }

    /// Enable state as the decision core should see it: the pending command
    /// while one is in flight, the observed state otherwise
    pub fn effective(&self, observed: Option<bool>) -> bool {
        if self.awaiting {
            self.desired == Some(true)
        } else {
            observed == Some(true)
        }
    }

    /// Classify an observed transition of the switch
    pub fn observe(&mut self, old: Option<bool>, new: Option<bool>) -> EnableObservation {
        let Some(new) = new else {
            return EnableObservation::Expected;
        };
        if self.desired == Some(new) {
            self.awaiting = false;
            self.attempts = 0;
            return EnableObservation::Expected;
        }
        if old.is_none() || old == Some(new) || self.awaiting {
            return EnableObservation::Expected;
        }
        match (self.desired, new) {
            (Some(true), false) => EnableObservation::ExternalOff,
            (Some(false), true) => EnableObservation::ExternalOn,
            _ => EnableObservation::Expected,
        }
    }

    /// Retry deadline reached with `observed` as the switch state
    pub fn retry(&mut self, observed: Option<bool>) -> RetryStep {
        let Some(on) = self.desired else {
            return RetryStep::Settled;
        };
        if !self.awaiting || observed == Some(on) {
            self.awaiting = false;
            self.attempts = 0;
            return RetryStep::Settled;
        }
        if self.attempts >= MAX_ENABLE_RETRIES {
            self.awaiting = false;
            self.attempts = 0;
            return RetryStep::GiveUp { on };
        }
        self.attempts += 1;
        RetryStep::Reissue {
            on,
            attempt: self.attempts,
        }
    }
}
