//! Entry points of the decision core: startup, upstream state changes,
//! priority notices, timers and start outcomes

use super::enable::{EnableObservation, RetryStep};
use super::types::EntityRole;
use super::{ChargeController, Effect, STARTUP_PROBE_WINDOW, StartOutcome, TimerKind};
use crate::clock::Moment;
use crate::config::GridConfig;
use crate::controls::Mode;
use crate::events::StateChange;
use crate::sensor::EntityState;

fn is_known(state: Option<&EntityState>) -> bool {
    state.is_some_and(EntityState::is_known)
}

impl ChargeController {
    /// First run after construction
    pub fn startup(&mut self, now: Moment) {
        self.refresh(now);
        self.logger.info(&format!(
            "Controller starting (eco={}, start_stop={}, manual={}, planner={})",
            self.modes.eco, self.modes.start_stop, self.modes.manual, self.modes.planner
        ));
        if self.modes.start_stop != self.modes.start_stop_reset {
            self.modes.set(Mode::StartStop, self.modes.start_stop_reset);
            self.mark_dirty(now);
        }
        self.roll_planner_dates(now);
        self.arm_midnight(now);
        if self.modes.planner {
            self.start_planner_monitor(now);
        }
        self.startup_deadline = Some(now.mono + STARTUP_PROBE_WINDOW);
        self.timers.arm(TimerKind::StartupProbe, now.mono);
        self.soc_prev = Some(self.soc_ok());
        self.sync_facts(now);
    }

    /// Cancel everything and persist pending changes
    pub fn shutdown(&mut self, _now: Moment) {
        self.logger.info("Controller shutting down");
        self.timers.cancel_where(|k| k != TimerKind::PersistFlush);
        self.auto_connect = None;
        self.reclaim = None;
        self.relock = None;
        self.flush();
    }

    fn roles_of(&self, entity_id: &str) -> Vec<EntityRole> {
        let e = &self.cfg.entities;
        let mut roles = Vec::new();
        let grid = match &self.cfg.grid {
            GridConfig::Single { net_power } => net_power == entity_id,
            GridConfig::Split {
                import_power,
                export_power,
            } => import_power == entity_id || export_power == entity_id,
        };
        if grid {
            roles.push(EntityRole::Grid);
        }
        let is = |opt: &Option<String>| opt.as_deref() == Some(entity_id);
        if is(&e.charge_power) {
            roles.push(EntityRole::ChargePower);
        }
        if is(&e.wallbox_status) {
            roles.push(EntityRole::Status);
        }
        if e.cable == entity_id {
            roles.push(EntityRole::Cable);
        }
        if e.charging_enable == entity_id {
            roles.push(EntityRole::Enable);
        }
        if is(&e.lock) {
            roles.push(EntityRole::Lock);
        }
        if is(&e.soc) {
            roles.push(EntityRole::Soc);
        }
        if is(&e.current_setting) {
            roles.push(EntityRole::Current);
        }
        let feedback = self
            .cfg
            .phase_switch
            .as_ref()
            .and_then(|p| p.feedback_entity.as_deref());
        if feedback == Some(entity_id) {
            roles.push(EntityRole::PhaseFeedback);
        }
        roles
    }

    /// React to an upstream entity change
    pub fn handle_state_change(&mut self, change: &StateChange, now: Moment) {
        let roles = self.roles_of(&change.entity_id);
        if roles.is_empty() {
            return;
        }
        self.refresh(now);
        let transition = is_known(change.old_state.as_ref()) && is_known(change.new_state.as_ref());

        for role in roles {
            match role {
                EntityRole::Grid => {
                    if transition {
                        self.on_net_power(now);
                    } else {
                        self.evaluate_no_data(now);
                    }
                }
                EntityRole::ChargePower | EntityRole::Status => self.on_charging_signal(now),
                EntityRole::Cable => {
                    if is_known(change.new_state.as_ref()) {
                        self.startup_deadline = None;
                        self.timers.cancel(TimerKind::StartupProbe);
                        let connected = self.readings.cable_connected;
                        self.on_cable_state(connected, now);
                    }
                }
                EntityRole::Enable => {
                    let old = change.old_state.as_ref().and_then(EntityState::is_on);
                    let new = change.new_state.as_ref().and_then(EntityState::is_on);
                    self.on_enable_change(old, new, now);
                }
                EntityRole::Lock => {
                    let lock_value =
                        |s: Option<&EntityState>| s.and_then(|s| s.value()).map(str::to_ascii_lowercase);
                    let old = lock_value(change.old_state.as_ref());
                    let new = lock_value(change.new_state.as_ref());
                    if old.as_deref() == Some("locked") && new.as_deref() == Some("unlocked") {
                        self.on_lock_released(now);
                    }
                }
                EntityRole::Soc => self.on_soc_change(now),
                EntityRole::Current => {}
                EntityRole::PhaseFeedback => self.on_phase_feedback(now),
            }
        }
        self.sync_facts(now);
    }

    fn on_net_power(&mut self, now: Moment) {
        if self.reclaim.is_some() {
            self.reclaim_check(now);
        }
        if self.modes.start_stop && !self.modes.manual {
            self.apply(now, false);
        }
        self.evaluate_no_data(now);
    }

    /// Wallbox status or charge power changed
    fn on_charging_signal(&mut self, now: Moment) {
        if self.cable()
            && self.readings.charging_detected()
            && self.relock.is_none()
            && self.readings.is_unlocked()
        {
            self.schedule_relock(now, true);
        }
        if self.phase.waiting_for_stop() {
            self.on_phase_stop_poll(now);
        }
        self.start_regulation(now);
        if self.modes.start_stop {
            self.apply(now, false);
        }
        self.evaluate_no_data(now);
    }

    fn on_enable_change(&mut self, old: Option<bool>, new: Option<bool>, now: Moment) {
        match self.enable.observe(old, new) {
            EnableObservation::Expected => {
                if new.is_some() && self.enable.desired().is_none() {
                    self.enable.adopt(new == Some(true));
                }
            }
            EnableObservation::ExternalOff => self.on_external_off(now),
            EnableObservation::ExternalOn => {
                self.logger.info("Charging enable switched on externally");
                self.enable.adopt(true);
                if self.external_off_latched {
                    self.external_off_latched = false;
                    self.dismiss("external_off");
                    self.mark_dirty(now);
                }
            }
        }

        if !self.modes.start_stop {
            self.ensure_off(now);
            self.apply(now, false);
            return;
        }
        self.apply(now, false);
        self.evaluate_no_data(now);
        if self.enabled() && !self.modes.manual && self.cable() {
            self.start_regulation(now);
        }
    }

    /// The enable switch went off without us asking
    fn on_external_off(&mut self, now: Moment) {
        self.enable.adopt(false);
        self.timers.cancel(TimerKind::EnableRetry);
        if !self.cable() || !self.modes.start_stop {
            return;
        }
        self.logger
            .warn("Charging enable switched off externally; holding off until cable disconnect");
        self.external_off_latched = true;
        self.active = false;
        self.stop_regulation();
        self.stop_auto_connect();
        self.mark_dirty(now);
        self.notify(
            "external_off",
            "EV charging stopped externally",
            format!(
                "{} was switched off outside the charge manager. Charging stays off until the cable is disconnected.",
                self.cfg.display_name()
            ),
        );
        self.advance_if_current();
    }

    fn on_soc_change(&mut self, now: Moment) {
        let allows = self.soc_ok();
        let prev = self.soc_prev.replace(allows);
        if allows && prev == Some(false) && self.priority_mode() {
            self.arbiter.align_current_with_order();
        }
        if prev != Some(allows) {
            self.logger.info(&format!(
                "SoC {} limit {:?}: start {}",
                self.readings
                    .soc_percent
                    .map_or_else(|| "unknown".to_string(), |s| format!("{s:.0}%")),
                self.soc_limit,
                if allows { "allowed" } else { "blocked" }
            ));
        }
        self.apply(now, false);
        self.evaluate_no_data(now);
    }

    /// A priority notice arrived on the bus
    pub fn handle_priority_refresh(&mut self, now: Moment) {
        self.refresh(now);
        if !self.modes.start_stop || !self.cable() {
            return;
        }
        self.apply(now, false);
        if self.priority_allowed() && !self.modes.manual {
            self.start_resume(now);
            self.start_regulation(now);
        }
        self.evaluate_no_data(now);
        self.sync_facts(now);
    }

    /// Run every timer due at `now`
    pub fn fire_due(&mut self, now: Moment) {
        let due = self.timers.take_due(now.mono);
        if due.is_empty() {
            return;
        }
        self.refresh(now);
        for kind in due {
            self.on_timer(kind, now);
        }
        self.sync_facts(now);
    }

    fn on_timer(&mut self, kind: TimerKind, now: Moment) {
        match kind {
            TimerKind::StartupProbe => self.on_startup_probe(now),
            TimerKind::UpperDebounce => self.on_upper_debounce(now),
            TimerKind::BelowLower => self.on_below_lower(now),
            TimerKind::NoData => self.on_no_data(now),
            TimerKind::AutoConnect => self.on_auto_connect_tick(now),
            TimerKind::ResumeMonitor => self.on_resume_tick(now),
            TimerKind::ReclaimMonitor => self.on_reclaim_tick(now),
            TimerKind::ReclaimRelease => self.on_reclaim_release(),
            TimerKind::Regulation => self.on_regulation_tick(now),
            TimerKind::PlannerMonitor => self.on_planner_tick(now),
            TimerKind::Relock => self.on_relock_tick(now),
            TimerKind::EnableRetry => self.on_enable_retry(now),
            TimerKind::PhaseStopPoll => self.on_phase_stop_poll(now),
            TimerKind::PhaseVetoEnd => self.on_phase_veto_end(now),
            TimerKind::PhaseFallback => self.on_phase_feedback(now),
            TimerKind::Midnight => self.on_midnight(now),
            TimerKind::PersistFlush => self.flush(),
        }
    }

    fn on_enable_retry(&mut self, now: Moment) {
        match self.enable.retry(self.readings.charging_enable) {
            RetryStep::Settled => {}
            RetryStep::Reissue { on, attempt } => {
                if on && (self.phase.blocks_charging(now.mono) || self.external_off_latched) {
                    self.enable
                        .adopt(self.readings.charging_enable.unwrap_or(false));
                    return;
                }
                self.logger.warn(&format!(
                    "Charging enable did not follow {}; retry {attempt}",
                    if on { "on" } else { "off" }
                ));
                self.emit(Effect::SetEnable(on));
                let interval = super::enable::EnableTracker::interval(on);
                self.timers.arm_in(TimerKind::EnableRetry, now.mono, interval);
            }
            RetryStep::GiveUp { on } => {
                let what = if on { "switch on" } else { "switch off" };
                self.logger
                    .error(&format!("Charging enable would not {what}; giving up"));
                self.notify(
                    "enable_retry",
                    "EV charger not responding",
                    format!(
                        "{} did not {what} after {} attempts. Check the wallbox.",
                        self.cfg.display_name(),
                        super::MAX_ENABLE_RETRIES
                    ),
                );
            }
        }
    }

    /// Feed back the result of a lock-aware start
    pub fn handle_start_outcome(&mut self, outcome: StartOutcome, now: Moment) {
        self.refresh(now);
        if outcome.disconnected {
            self.enable
                .adopt(self.readings.charging_enable.unwrap_or(false));
            self.timers.cancel(TimerKind::EnableRetry);
            self.active = false;
            self.stop_regulation();
            if !self.cable() {
                self.on_cable_state(false, now);
            }
            self.sync_facts(now);
            return;
        }
        if outcome.enabled || outcome.unlocked {
            self.pending_initial_start = false;
        }
        if outcome.aborted {
            self.logger
                .warn("Start aborted: cable lock did not release in time");
            self.notify(
                "unlock_failed",
                "EV charger cable lock",
                format!(
                    "{} could not unlock the cable to start charging.",
                    self.cfg.display_name()
                ),
            );
        }
        if !outcome.enabled {
            self.enable
                .adopt(self.readings.charging_enable.unwrap_or(false));
            self.timers.cancel(TimerKind::EnableRetry);
            self.active = false;
            self.stop_regulation();
            self.start_resume(now);
        } else {
            self.start_regulation(now);
        }
        if outcome.unlocked {
            self.schedule_relock(now, false);
        }
        self.sync_facts(now);
    }
}
