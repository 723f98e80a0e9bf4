//! Charging controller for one wallbox
//!
//! The controller is split into a synchronous decision core
//! ([`ChargeController`]) and an async actor ([`runtime`]) that feeds it
//! inputs, sleeps until its next timer and executes the [`Effect`]s it
//! queues. The core never awaits: every decision is taken against one
//! consistent [`Readings`] snapshot and the [`Moment`] it was handed.

use crate::clock::Moment;
use crate::config::{ControllerConfig, MIN_CURRENT_A};
use crate::controls::{ModeFlags, PlannerWindow, soc_allows_start};
use crate::hysteresis::{Band, SustainTracker, active_band};
use crate::logging::{LogContext, StructuredLogger, get_logger_with_context};
use crate::persistence::PersistedState;
use crate::phase::PhaseSwitchCoordinator;
use crate::priority::{EligibilityFacts, PriorityArbiter};
use crate::sensor::{Readings, SensorAdapter, StateStore};
use chrono_tz::Tz;
use std::sync::Arc;
use tokio::time::Instant;

mod cable;
mod commands;
mod enable;
mod handlers;
mod monitors;
mod phase_ops;
mod reconcile;
pub mod runtime;
mod snapshot;
mod timers;
mod types;

#[cfg(test)]
mod tests;

pub use enable::{DISABLE_RETRY_INTERVAL, ENABLE_RETRY_INTERVAL, MAX_ENABLE_RETRIES};
pub use runtime::{ControllerHandle, ControllerServices, EffectExecutor, spawn_controller};
pub use timers::TimerKind;
pub use types::{
    ChargeState, ControllerInput, ControllerStatus, Effect, StartOutcome, UserCommand,
};

use enable::EnableTracker;
use timers::TimerRegistry;

/// Debounce between cable connect and the first auto-connect check
pub const CONNECT_DEBOUNCE: std::time::Duration = std::time::Duration::from_secs(1);
/// Export must hold this long before the auto-connect routine starts charging
pub const EXPORT_SUSTAIN: std::time::Duration = std::time::Duration::from_secs(5);
pub const PLANNER_MONITOR_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);
/// Relock this long after charging was detected following an unlock
pub const RELOCK_AFTER_CHARGING: std::time::Duration = std::time::Duration::from_secs(30);
/// Give up waiting for charging after an unlock
pub const RELOCK_WATCH_WINDOW: std::time::Duration = std::time::Duration::from_secs(120);
pub const RELOCK_POLL: std::time::Duration = std::time::Duration::from_secs(1);
/// Startup wait for the cable entity to report a known state
pub const STARTUP_PROBE_WINDOW: std::time::Duration = std::time::Duration::from_secs(180);
pub const STARTUP_PROBE_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5);
pub const PERSIST_DEBOUNCE: std::time::Duration = std::time::Duration::from_millis(500);
pub const PHASE_STOP_POLL: std::time::Duration = std::time::Duration::from_secs(1);

/// Net power above upper since `since`, measured against `upper_w`
#[derive(Debug, Clone, Copy)]
struct AboveUpper {
    since: Instant,
    upper_w: i32,
}

#[derive(Debug, Clone, Copy)]
struct AutoConnect {
    /// The immediate check after the connect debounce has run
    checked: bool,
    export_since: Option<Instant>,
}

#[derive(Debug, Clone, Copy)]
struct Reclaim {
    released: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RelockStage {
    Watching { until: Instant },
    Detected,
}

/// Decision core of one charger
pub struct ChargeController {
    cfg: Arc<ControllerConfig>,
    tz: Tz,
    arbiter: PriorityArbiter,
    sensors: SensorAdapter,
    readings: Readings,
    logger: StructuredLogger,

    modes: ModeFlags,
    planner: PlannerWindow,
    soc_limit: Option<u8>,
    net_target_w: i32,
    auto_unlock: bool,
    ext_import_limit_w: u32,
    external_off_latched: bool,

    active: bool,
    /// Stopped by the below-lower sustain timer and not restarted since
    paused_below_lower: bool,
    last_cable: Option<bool>,
    pending_initial_start: bool,
    session_id: Option<String>,
    enable: EnableTracker,
    phase: PhaseSwitchCoordinator,

    timers: TimerRegistry,
    above_upper: Option<AboveUpper>,
    below_lower: SustainTracker,
    no_data: SustainTracker,
    last_missing: bool,
    regulation_started: Option<Instant>,
    auto_connect: Option<AutoConnect>,
    reclaim: Option<Reclaim>,
    relock: Option<RelockStage>,
    planner_prev: Option<bool>,
    soc_prev: Option<bool>,
    startup_deadline: Option<Instant>,
    dirty: bool,
    outbox: Vec<Effect>,
}

impl ChargeController {
    pub fn new(
        cfg: Arc<ControllerConfig>,
        tz: Tz,
        arbiter: PriorityArbiter,
        store: Arc<dyn StateStore>,
        persisted: &PersistedState,
        started: Instant,
    ) -> Self {
        let logger = get_logger_with_context(LogContext::new("controller").with_charger(&cfg.id));
        let mut phase = PhaseSwitchCoordinator::new(cfg.phase_switch.clone());
        phase.restore(&persisted.phase);
        Self {
            sensors: SensorAdapter::new(cfg.clone(), store, started),
            cfg,
            tz,
            arbiter,
            readings: Readings::default(),
            logger,
            modes: persisted.modes,
            planner: PlannerWindow {
                start: persisted.planner_start,
                stop: persisted.planner_stop,
            },
            soc_limit: persisted.soc_limit_percent,
            net_target_w: persisted.net_power_target_w,
            auto_unlock: persisted.auto_unlock_enabled,
            ext_import_limit_w: persisted.ext_import_limit_w,
            external_off_latched: persisted.external_off_latched,
            active: false,
            paused_below_lower: false,
            last_cable: None,
            pending_initial_start: false,
            session_id: None,
            enable: EnableTracker::new(),
            phase,
            timers: TimerRegistry::new(),
            above_upper: None,
            below_lower: SustainTracker::new(),
            no_data: SustainTracker::new(),
            last_missing: false,
            regulation_started: None,
            auto_connect: None,
            reclaim: None,
            relock: None,
            planner_prev: None,
            soc_prev: None,
            startup_deadline: None,
            dirty: false,
            outbox: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.cfg.id
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.cfg
    }

    pub const fn is_active(&self) -> bool {
        self.active
    }

    pub const fn modes(&self) -> ModeFlags {
        self.modes
    }

    /// Drain queued effects
    pub fn take_effects(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.outbox)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    pub fn is_timer_armed(&self, kind: TimerKind) -> bool {
        self.timers.is_armed(kind)
    }

    fn emit(&mut self, effect: Effect) {
        self.outbox.push(effect);
    }

    // ---------------- Readings and gates ----------------

    /// Re-read every entity and report eligibility facts to the arbiter
    fn refresh(&mut self, now: Moment) {
        self.readings = self.sensors.read(now.mono);
        self.sync_facts(now);
    }

    fn sync_facts(&self, now: Moment) {
        let facts = EligibilityFacts {
            cable_connected: self.readings.cable_connected,
            start_stop: self.modes.start_stop,
            planner_allows: self.planner_ok(now),
            soc_allows: self.soc_ok(),
        };
        self.arbiter.report_facts(&self.cfg.id, facts);
    }

    fn planner_ok(&self, now: Moment) -> bool {
        self.planner.allows(self.modes.planner, now.wall)
    }

    fn soc_ok(&self) -> bool {
        soc_allows_start(self.readings.soc_percent, self.soc_limit)
    }

    fn cable(&self) -> bool {
        self.readings.cable_connected
    }

    fn enabled(&self) -> bool {
        self.enable.effective(self.readings.charging_enable)
    }

    fn priority_mode(&self) -> bool {
        self.arbiter.priority_mode_enabled()
    }

    fn priority_allowed(&self) -> bool {
        self.arbiter.is_allowed(&self.cfg.id)
    }

    /// Align and report whether this controller holds the slot
    fn have_priority_now(&self) -> bool {
        self.arbiter.have_priority_now(&self.cfg.id)
    }

    fn holds_priority(&self) -> bool {
        self.arbiter.get_priority().as_deref() == Some(self.cfg.id.as_str())
    }

    fn align_if_mode(&self) {
        if self.priority_mode() {
            self.arbiter.align_current_with_order();
        }
    }

    fn advance_if_current(&self) {
        if self.priority_mode() && self.holds_priority() {
            self.arbiter.advance_to_next(&self.cfg.id);
        }
    }

    fn one_phase_confirmed(&self) -> bool {
        self.phase.confirmed_one_phase(self.readings.phase_feedback)
    }

    fn band(&self) -> Band {
        active_band(
            &self.cfg,
            self.modes.eco,
            self.one_phase_confirmed(),
            self.ext_import_limit_w,
        )
    }

    /// Shared precondition of the below-lower and upper timers
    fn timer_conditions(&self, now: Moment) -> bool {
        !self.modes.manual
            && self.modes.start_stop
            && self.cable()
            && self.planner_ok(now)
            && self.soc_ok()
            && (self.enabled() || self.active)
    }

    fn set_current_min(&mut self) {
        if self.cfg.entities.current_setting.is_some() {
            self.emit(Effect::SetCurrent(MIN_CURRENT_A));
        }
    }

    // ---------------- Persistence ----------------

    fn mark_dirty(&mut self, now: Moment) {
        self.dirty = true;
        self.timers
            .ensure(TimerKind::PersistFlush, now.mono + PERSIST_DEBOUNCE);
    }

    /// Current durable state
    pub fn persisted_state(&self) -> PersistedState {
        PersistedState {
            modes: self.modes,
            planner_start: self.planner.start,
            planner_stop: self.planner.stop,
            soc_limit_percent: self.soc_limit,
            net_power_target_w: self.net_target_w,
            auto_unlock_enabled: self.auto_unlock,
            ext_import_limit_w: self.ext_import_limit_w,
            external_off_latched: self.external_off_latched,
            phase: self.phase.persisted(),
        }
    }

    fn flush(&mut self) {
        if std::mem::take(&mut self.dirty) {
            self.timers.cancel(TimerKind::PersistFlush);
            let state = self.persisted_state();
            self.emit(Effect::Save(Box::new(state)));
        }
    }

    fn notification_id(&self, topic: &str) -> String {
        format!("evcm_{topic}_{}", self.cfg.id)
    }

    fn notify(&mut self, topic: &str, title: &str, message: String) {
        let id = self.notification_id(topic);
        self.emit(Effect::Notify {
            id,
            title: title.to_string(),
            message,
        });
    }

    fn dismiss(&mut self, topic: &str) {
        let id = self.notification_id(topic);
        self.emit(Effect::Dismiss { id });
    }
}
