//! Phase switching between single and three phase operation
//!
//! [`PhaseSwitchCoordinator`] is a synchronous state holder driven by the
//! controller: it accepts or rejects switch requests, tracks the stop/switch
//! sequence, detects feedback mismatches and runs the automatic evaluator.
//! It never performs I/O; the controller turns its outcomes into commands
//! and bus events.

use crate::clock::Moment;
use crate::config::{PhaseControlMode, PhaseSwitchConfig};
use crate::persistence::PersistedPhaseState;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Wallbox phase configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum PhaseProfile {
    #[serde(rename = "1p")]
    OnePhase,
    #[serde(rename = "3p")]
    ThreePhase,
}

impl PhaseProfile {
    /// Parse a feedback sensor value ("1", "3", "1p", "3p", "1-phase", ...)
    pub fn parse_feedback(raw: &str) -> Option<Self> {
        let s = raw.trim().to_ascii_lowercase();
        let digits: String = s.chars().take_while(char::is_ascii_digit).collect();
        match digits.as_str() {
            "1" => Some(Self::OnePhase),
            "3" => Some(Self::ThreePhase),
            _ => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OnePhase => "1p",
            Self::ThreePhase => "3p",
        }
    }
}

impl std::fmt::Display for PhaseProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// User-selected phase policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PhaseMode {
    #[default]
    Auto,
    #[serde(rename = "force_1p")]
    Force1p,
    #[serde(rename = "force_3p")]
    Force3p,
}

impl PhaseMode {
    pub const fn forced(self) -> Option<PhaseProfile> {
        match self {
            Self::Auto => None,
            Self::Force1p => Some(PhaseProfile::OnePhase),
            Self::Force3p => Some(PhaseProfile::ThreePhase),
        }
    }
}

/// Who asked for a switch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchSource {
    Auto,
    Manual,
}

/// Why a switch request was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SwitchRejected {
    #[error("phase switching is not configured")]
    Unsupported,
    #[error("the wallbox controls phase switching itself")]
    WallboxControlled,
    #[error("a phase switch is already in progress")]
    InProgress,
    #[error("phase switch cooldown is active")]
    CooldownActive,
}

/// Accepted request outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchAccepted {
    /// Feedback already reports the target; nothing to do
    NoOp,
    /// Sequence started; the controller must stop charging now
    Started,
}

/// Progress of the stop-then-switch sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopProgress {
    Waiting,
    /// Power is down; fire the request event for `target`
    Switch {
        target: PhaseProfile,
        source: SwitchSource,
    },
    /// Power never dropped; sequence abandoned
    Aborted { target: PhaseProfile },
}

/// Mismatch tracker transitions the controller reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedbackNotice {
    None,
    /// Mismatch persisted past the feedback timeout
    Uncertain {
        expected: PhaseProfile,
        feedback: Option<PhaseProfile>,
    },
    /// A previously reported mismatch resolved
    Resolved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    WaitingForStop { deadline: Instant },
    AwaitingFeedback { since: Instant },
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    target: PhaseProfile,
    source: SwitchSource,
    stage: Stage,
}

/// Inputs of one automatic evaluation
#[derive(Debug, Clone, Copy)]
pub struct AutoInput {
    /// start/stop on, cable connected, planner/SoC/priority all pass
    pub gates_ok: bool,
    pub feedback: Option<PhaseProfile>,
    pub current_a: Option<u8>,
    pub max_current_a: u8,
    pub net_w: Option<f64>,
    pub charge_power_w: Option<f64>,
    /// Three phase upper threshold for the active eco mode
    pub upper_3p_w: i32,
    /// Single phase upper threshold for the active eco mode
    pub alternate_upper_w: i32,
    pub stopped_below_lower: bool,
    /// Charging could resume right now at the present thresholds
    pub can_resume_now: bool,
}

/// Phase info for status snapshots
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PhaseStatus {
    pub supported: bool,
    pub mode: PhaseMode,
    pub expected: Option<PhaseProfile>,
    pub in_progress: Option<PhaseProfile>,
    pub fallback_active: bool,
    pub cooldown_until: Option<DateTime<Utc>>,
}

pub struct PhaseSwitchCoordinator {
    config: Option<PhaseSwitchConfig>,
    mode: PhaseMode,
    cooldown_until: Option<DateTime<Utc>>,
    cooldown_target: Option<PhaseProfile>,
    last_requested: Option<PhaseProfile>,
    in_flight: Option<InFlight>,
    veto_until: Option<Instant>,
    mismatch_since: Option<Instant>,
    uncertain_reported: bool,
    up_since: Option<DateTime<Utc>>,
    up_last_seen: Option<DateTime<Utc>>,
    down_since: Option<DateTime<Utc>>,
}

impl PhaseSwitchCoordinator {
    pub fn new(config: Option<PhaseSwitchConfig>) -> Self {
        Self {
            config,
            mode: PhaseMode::Auto,
            cooldown_until: None,
            cooldown_target: None,
            last_requested: None,
            in_flight: None,
            veto_until: None,
            mismatch_since: None,
            uncertain_reported: false,
            up_since: None,
            up_last_seen: None,
            down_since: None,
        }
    }

    pub const fn supported(&self) -> bool {
        self.config.is_some()
    }

    pub const fn mode(&self) -> PhaseMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: PhaseMode) -> bool {
        let changed = self.mode != mode;
        self.mode = mode;
        if changed {
            self.reset_candidates();
        }
        changed
    }

    pub fn cooldown_active(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_until.is_some_and(|until| until > now)
    }

    pub const fn cooldown_until(&self) -> Option<DateTime<Utc>> {
        self.cooldown_until
    }

    /// Move the cooldown end to `until` unless it already ends later
    pub fn extend_cooldown(&mut self, until: DateTime<Utc>, target: PhaseProfile) {
        if self.cooldown_until.is_none_or(|cur| until > cur) {
            self.cooldown_until = Some(until);
            self.cooldown_target = Some(target);
        }
    }

    pub fn in_progress(&self) -> Option<PhaseProfile> {
        self.in_flight.map(|f| f.target)
    }

    pub const fn waiting_for_stop(&self) -> bool {
        matches!(
            self.in_flight,
            Some(InFlight {
                stage: Stage::WaitingForStop { .. },
                ..
            })
        )
    }

    /// Enable commands are suppressed while a switch is running or vetoed
    pub fn blocks_charging(&self, now: Instant) -> bool {
        self.in_flight.is_some() || self.veto_until.is_some_and(|v| now < v)
    }

    pub const fn veto_until(&self) -> Option<Instant> {
        self.veto_until
    }

    /// Phase the wallbox should be in, if known
    pub fn expected(&self) -> Option<PhaseProfile> {
        if let Some(f) = self.in_flight {
            return Some(f.target);
        }
        match self.mode {
            PhaseMode::Auto => self.last_requested,
            forced => forced.forced(),
        }
    }

    pub const fn fallback_active(&self) -> bool {
        self.mismatch_since.is_some()
    }

    /// Single phase confirmed by feedback with no mismatch or switch pending
    pub fn confirmed_one_phase(&self, feedback: Option<PhaseProfile>) -> bool {
        self.supported()
            && feedback == Some(PhaseProfile::OnePhase)
            && !self.fallback_active()
            && self.in_flight.is_none()
    }

    fn cooldown(&self) -> Duration {
        self.config
            .as_ref()
            .map_or(Duration::ZERO, |c| Duration::from_secs(c.cooldown_s))
    }

    fn to_chrono(d: Duration) -> chrono::Duration {
        chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::zero())
    }

    /// Ask for a switch to `target`
    pub fn request_switch(
        &mut self,
        target: PhaseProfile,
        source: SwitchSource,
        feedback: Option<PhaseProfile>,
        now: Moment,
    ) -> Result<SwitchAccepted, SwitchRejected> {
        let Some(cfg) = &self.config else {
            return Err(SwitchRejected::Unsupported);
        };
        if cfg.control_mode == PhaseControlMode::Wallbox {
            return Err(SwitchRejected::WallboxControlled);
        }
        if self.in_flight.is_some() {
            return Err(SwitchRejected::InProgress);
        }
        if feedback == Some(target) {
            if source == SwitchSource::Auto {
                self.last_requested = Some(target);
            }
            return Ok(SwitchAccepted::NoOp);
        }
        if self.cooldown_active(now.wall) {
            return Err(SwitchRejected::CooldownActive);
        }

        let wait = Duration::from_secs(cfg.wait_for_stop_s);
        let until = now.wall + Self::to_chrono(self.cooldown());
        self.extend_cooldown(until, target);
        self.last_requested = Some(target);
        self.in_flight = Some(InFlight {
            target,
            source,
            stage: Stage::WaitingForStop {
                deadline: now.mono + wait,
            },
        });
        self.reset_candidates();
        Ok(SwitchAccepted::Started)
    }

    /// Advance the stop wait with the latest charge power reading
    pub fn poll_stopped(&mut self, charge_power_w: Option<f64>, now: Moment) -> StopProgress {
        let Some(cfg) = &self.config else {
            return StopProgress::Waiting;
        };
        let Some(InFlight {
            target,
            source,
            stage: Stage::WaitingForStop { deadline },
        }) = self.in_flight
        else {
            return StopProgress::Waiting;
        };

        let stopped = charge_power_w.is_some_and(|p| p < f64::from(cfg.stopped_power_w));
        if stopped {
            let veto = Duration::from_secs(cfg.veto_s);
            let until = now.wall + Self::to_chrono(self.cooldown());
            self.extend_cooldown(until, target);
            self.veto_until = Some(now.mono + veto);
            self.in_flight = Some(InFlight {
                target,
                source,
                stage: Stage::AwaitingFeedback { since: now.mono },
            });
            return StopProgress::Switch { target, source };
        }
        if now.mono >= deadline {
            self.in_flight = None;
            return StopProgress::Aborted { target };
        }
        StopProgress::Waiting
    }

    /// Feed the latest feedback; tracks mismatch and completes in-flight switches
    pub fn observe_feedback(&mut self, feedback: Option<PhaseProfile>, now: Instant) -> FeedbackNotice {
        let Some(cfg) = &self.config else {
            return FeedbackNotice::None;
        };
        let timeout = Duration::from_secs(cfg.feedback_timeout_s);

        if let Some(InFlight {
            target,
            stage: Stage::AwaitingFeedback { since },
            ..
        }) = self.in_flight
        {
            if feedback == Some(target) {
                self.in_flight = None;
            } else if now.saturating_duration_since(since) >= timeout {
                // the relay never followed; keep the expectation so the mismatch surfaces
                self.in_flight = None;
            }
        }

        let Some(expected) = self.expected() else {
            return self.clear_mismatch();
        };
        if self.waiting_for_stop() || feedback == Some(expected) {
            return self.clear_mismatch();
        }
        let since = *self.mismatch_since.get_or_insert(now);
        if !self.uncertain_reported && now.saturating_duration_since(since) >= timeout {
            self.uncertain_reported = true;
            return FeedbackNotice::Uncertain { expected, feedback };
        }
        FeedbackNotice::None
    }

    fn clear_mismatch(&mut self) -> FeedbackNotice {
        self.mismatch_since = None;
        if std::mem::take(&mut self.uncertain_reported) {
            FeedbackNotice::Resolved
        } else {
            FeedbackNotice::None
        }
    }

    /// When the feedback timeout for the current mismatch expires
    pub fn fallback_deadline(&self) -> Option<Instant> {
        let cfg = self.config.as_ref()?;
        if self.uncertain_reported {
            return None;
        }
        let base = match self.in_flight {
            Some(InFlight {
                stage: Stage::AwaitingFeedback { since },
                ..
            }) => Some(since),
            _ => self.mismatch_since,
        }?;
        Some(base + Duration::from_secs(cfg.feedback_timeout_s))
    }

    fn reset_candidates(&mut self) {
        self.up_since = None;
        self.up_last_seen = None;
        self.down_since = None;
    }

    /// Decide whether an automatic switch is due; returns the target to request
    pub fn auto_evaluate(&mut self, input: &AutoInput, now: Moment) -> Option<PhaseProfile> {
        let Some(cfg) = &self.config else {
            return None;
        };
        let blocked = self.mode != PhaseMode::Auto
            || cfg.control_mode != PhaseControlMode::Integration
            || !input.gates_ok
            || input.feedback.is_none()
            || self.fallback_active()
            || self.cooldown_active(now.wall)
            || self.in_flight.is_some();
        if blocked {
            self.reset_candidates();
            return None;
        }
        let delay = Self::to_chrono(Duration::from_secs(cfg.auto_delay_min * 60));
        let grace = Self::to_chrono(Duration::from_secs(cfg.auto_reset_grace_s));

        match input.feedback? {
            PhaseProfile::OnePhase => {
                self.down_since = None;
                let headroom = input
                    .net_w
                    .map(|n| n + input.charge_power_w.unwrap_or(0.0));
                let need = f64::from(input.upper_3p_w) + f64::from(cfg.upshift_margin_w);
                let at_max = input.current_a.is_some_and(|a| a >= input.max_current_a);
                if at_max && headroom.is_some_and(|h| h >= need) {
                    let since = *self.up_since.get_or_insert(now.wall);
                    self.up_last_seen = Some(now.wall);
                    if now.wall - since >= delay {
                        return Some(PhaseProfile::ThreePhase);
                    }
                } else if self
                    .up_last_seen
                    .is_some_and(|seen| now.wall - seen > grace)
                {
                    self.up_since = None;
                    self.up_last_seen = None;
                }
                None
            }
            PhaseProfile::ThreePhase => {
                self.up_since = None;
                self.up_last_seen = None;
                let cond = input.stopped_below_lower
                    && !input.can_resume_now
                    && input
                        .net_w
                        .is_some_and(|n| n >= f64::from(input.alternate_upper_w));
                if !cond {
                    self.down_since = None;
                    return None;
                }
                let since = *self.down_since.get_or_insert(now.wall);
                (now.wall - since >= delay).then_some(PhaseProfile::OnePhase)
            }
        }
    }

    pub fn persisted(&self) -> PersistedPhaseState {
        PersistedPhaseState {
            mode: self.mode,
            cooldown_until: self.cooldown_until,
            cooldown_target: self.cooldown_target,
            last_requested: self.last_requested,
            up_candidate_since: self.up_since,
            down_candidate_since: self.down_since,
        }
    }

    pub fn restore(&mut self, state: &PersistedPhaseState) {
        self.mode = state.mode;
        self.cooldown_until = state.cooldown_until;
        self.cooldown_target = state.cooldown_target;
        self.last_requested = state.last_requested;
        self.up_since = state.up_candidate_since;
        self.up_last_seen = state.up_candidate_since;
        self.down_since = state.down_candidate_since;
    }

    pub fn status(&self) -> PhaseStatus {
        PhaseStatus {
            supported: self.supported(),
            mode: self.mode,
            expected: self.expected(),
            in_progress: self.in_progress(),
            fallback_active: self.fallback_active(),
            cooldown_until: self.cooldown_until,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator() -> PhaseSwitchCoordinator {
        PhaseSwitchCoordinator::new(Some(PhaseSwitchConfig {
            feedback_entity: Some("sensor.phases".into()),
            ..PhaseSwitchConfig::default()
        }))
    }

    #[test]
    fn test_parse_feedback() {
        assert_eq!(PhaseProfile::parse_feedback("1"), Some(PhaseProfile::OnePhase));
        assert_eq!(PhaseProfile::parse_feedback(" 3P "), Some(PhaseProfile::ThreePhase));
        assert_eq!(PhaseProfile::parse_feedback("1-phase"), Some(PhaseProfile::OnePhase));
        assert_eq!(PhaseProfile::parse_feedback("2"), None);
        assert_eq!(PhaseProfile::parse_feedback("x"), None);
    }

    #[test]
    fn test_rejections() {
        let now = Moment::now();
        let mut none = PhaseSwitchCoordinator::new(None);
        assert_eq!(
            none.request_switch(PhaseProfile::OnePhase, SwitchSource::Manual, None, now),
            Err(SwitchRejected::Unsupported)
        );

        let mut wallbox = PhaseSwitchCoordinator::new(Some(PhaseSwitchConfig {
            control_mode: PhaseControlMode::Wallbox,
            ..PhaseSwitchConfig::default()
        }));
        assert_eq!(
            wallbox.request_switch(PhaseProfile::OnePhase, SwitchSource::Manual, None, now),
            Err(SwitchRejected::WallboxControlled)
        );

        let mut c = coordinator();
        let fb = Some(PhaseProfile::ThreePhase);
        assert_eq!(
            c.request_switch(PhaseProfile::OnePhase, SwitchSource::Manual, fb, now),
            Ok(SwitchAccepted::Started)
        );
        assert_eq!(
            c.request_switch(PhaseProfile::ThreePhase, SwitchSource::Manual, fb, now),
            Err(SwitchRejected::InProgress)
        );
    }

    #[test]
    fn test_noop_switch_starts_nothing() {
        let now = Moment::now();
        let mut c = coordinator();
        let fb = Some(PhaseProfile::ThreePhase);
        assert_eq!(
            c.request_switch(PhaseProfile::ThreePhase, SwitchSource::Manual, fb, now),
            Ok(SwitchAccepted::NoOp)
        );
        assert!(!c.cooldown_active(now.wall));
        assert!(!c.blocks_charging(now.mono));
    }

    #[test]
    fn test_stop_then_switch_sequence() {
        let now = Moment::now();
        let mut c = coordinator();
        let fb = Some(PhaseProfile::ThreePhase);
        c.request_switch(PhaseProfile::OnePhase, SwitchSource::Manual, fb, now)
            .unwrap();
        assert!(c.blocks_charging(now.mono));
        assert_eq!(c.poll_stopped(Some(2000.0), now.after_secs(5)), StopProgress::Waiting);
        assert_eq!(c.poll_stopped(None, now.after_secs(6)), StopProgress::Waiting);
        let t = now.after_secs(20);
        assert_eq!(
            c.poll_stopped(Some(10.0), t),
            StopProgress::Switch {
                target: PhaseProfile::OnePhase,
                source: SwitchSource::Manual
            }
        );
        // cooldown re-anchored at the switch moment
        assert_eq!(
            c.cooldown_until(),
            Some(t.wall + chrono::Duration::seconds(300))
        );
        assert_eq!(c.observe_feedback(Some(PhaseProfile::OnePhase), t.mono), FeedbackNotice::None);
        assert_eq!(c.in_progress(), None);
        assert!(c.blocks_charging(t.after_secs(5).mono));
        assert!(!c.blocks_charging(t.after_secs(10).mono));
        assert!(c.confirmed_one_phase(Some(PhaseProfile::OnePhase)));
    }

    #[test]
    fn test_stop_wait_times_out() {
        let now = Moment::now();
        let mut c = coordinator();
        c.request_switch(
            PhaseProfile::OnePhase,
            SwitchSource::Manual,
            Some(PhaseProfile::ThreePhase),
            now,
        )
        .unwrap();
        assert_eq!(
            c.poll_stopped(Some(3000.0), now.after_secs(60)),
            StopProgress::Aborted {
                target: PhaseProfile::OnePhase
            }
        );
        assert!(c.cooldown_active(now.after_secs(60).wall));
        assert_eq!(
            c.request_switch(
                PhaseProfile::OnePhase,
                SwitchSource::Manual,
                Some(PhaseProfile::ThreePhase),
                now.after_secs(61)
            ),
            Err(SwitchRejected::CooldownActive)
        );
    }

    #[test]
    fn test_cooldown_only_extends() {
        let mut c = coordinator();
        let t0 = Utc::now();
        c.extend_cooldown(t0 + chrono::Duration::seconds(300), PhaseProfile::OnePhase);
        c.extend_cooldown(t0 + chrono::Duration::seconds(100), PhaseProfile::ThreePhase);
        assert_eq!(c.cooldown_until(), Some(t0 + chrono::Duration::seconds(300)));
        c.extend_cooldown(t0 + chrono::Duration::seconds(400), PhaseProfile::ThreePhase);
        assert_eq!(c.cooldown_until(), Some(t0 + chrono::Duration::seconds(400)));
    }

    #[test]
    fn test_mismatch_reports_after_timeout() {
        let now = Moment::now();
        let mut c = coordinator();
        c.set_mode(PhaseMode::Force1p);
        let fb = Some(PhaseProfile::ThreePhase);
        assert_eq!(c.observe_feedback(fb, now.mono), FeedbackNotice::None);
        assert!(c.fallback_active());
        assert!(!c.confirmed_one_phase(Some(PhaseProfile::OnePhase)));
        assert_eq!(c.fallback_deadline(), Some(now.mono + Duration::from_secs(300)));
        assert!(matches!(
            c.observe_feedback(fb, now.after_secs(300).mono),
            FeedbackNotice::Uncertain { .. }
        ));
        assert_eq!(
            c.observe_feedback(Some(PhaseProfile::OnePhase), now.after_secs(301).mono),
            FeedbackNotice::Resolved
        );
        assert!(!c.fallback_active());
    }

    fn up_input(net: f64) -> AutoInput {
        AutoInput {
            gates_ok: true,
            feedback: Some(PhaseProfile::OnePhase),
            current_a: Some(16),
            max_current_a: 16,
            net_w: Some(net),
            charge_power_w: Some(3600.0),
            upper_3p_w: 4000,
            alternate_upper_w: 1700,
            stopped_below_lower: false,
            can_resume_now: false,
        }
    }

    #[test]
    fn test_upshift_tolerates_short_gaps() {
        let t0 = Moment::now();
        let mut c = coordinator();
        assert_eq!(c.auto_evaluate(&up_input(2000.0), t0), None);
        assert_eq!(c.auto_evaluate(&up_input(2000.0), t0.after_secs(120)), None);
        // dip shorter than the reset grace keeps the candidate
        assert_eq!(c.auto_evaluate(&up_input(0.0), t0.after_secs(200)), None);
        assert_eq!(c.auto_evaluate(&up_input(2000.0), t0.after_secs(260)), None);
        assert_eq!(
            c.auto_evaluate(&up_input(2000.0), t0.after_secs(900)),
            Some(PhaseProfile::ThreePhase)
        );

        // a long gap resets it
        let mut c = coordinator();
        c.auto_evaluate(&up_input(2000.0), t0);
        c.auto_evaluate(&up_input(0.0), t0.after_secs(400));
        assert_eq!(c.auto_evaluate(&up_input(2000.0), t0.after_secs(900)), None);
    }

    #[test]
    fn test_downshift_requires_uninterrupted_condition() {
        let t0 = Moment::now();
        let mut c = coordinator();
        let mut input = up_input(2000.0);
        input.feedback = Some(PhaseProfile::ThreePhase);
        input.stopped_below_lower = true;
        assert_eq!(c.auto_evaluate(&input, t0), None);
        input.net_w = Some(1000.0);
        assert_eq!(c.auto_evaluate(&input, t0.after_secs(300)), None);
        input.net_w = Some(2000.0);
        assert_eq!(c.auto_evaluate(&input, t0.after_secs(301)), None);
        assert_eq!(c.auto_evaluate(&input, t0.after_secs(1200)), None);
        assert_eq!(
            c.auto_evaluate(&input, t0.after_secs(301 + 900)),
            Some(PhaseProfile::OnePhase)
        );
        input.can_resume_now = true;
        assert_eq!(c.auto_evaluate(&input, t0.after_secs(2000)), None);
    }
}
