//! Cable session: connect/disconnect, auto-connect, cable lock handling

use super::{
    AutoConnect, CONNECT_DEBOUNCE, ChargeController, EXPORT_SUSTAIN, Effect, RELOCK_AFTER_CHARGING,
    RELOCK_POLL, RELOCK_WATCH_WINDOW, RelockStage, STARTUP_PROBE_INTERVAL, TimerKind,
};
use crate::clock::Moment;
use crate::controls::Mode;
use std::time::Duration;

const AUTO_CONNECT_POLL: Duration = Duration::from_secs(1);

impl ChargeController {
    /// Cable entity reported a known state
    pub(crate) fn on_cable_state(&mut self, connected: bool, now: Moment) {
        if self.last_cable == Some(connected) {
            return;
        }
        self.last_cable = Some(connected);
        if connected {
            self.on_connected(now);
        } else {
            self.on_disconnected(now);
        }
    }

    fn on_connected(&mut self, now: Moment) {
        let session = uuid::Uuid::new_v4().to_string();
        self.logger.set_session(Some(session.clone()));
        self.session_id = Some(session);
        self.logger.info("Cable connected");

        self.reset_timers();
        self.pending_initial_start = true;
        self.paused_below_lower = false;
        self.emit(Effect::Lock);
        self.set_current_min();

        if self.priority_mode() {
            self.connect_preemption();
        }

        if self.modes.manual {
            if self.modes.start_stop {
                let gates = self.planner_ok(now)
                    && self.soc_ok()
                    && self.priority_allowed()
                    && self.readings.essential_data_available();
                if gates && (!self.priority_mode() || self.have_priority_now()) {
                    self.start_charging_and_reclaim(now);
                } else {
                    self.ensure_off(now);
                }
            } else {
                self.ensure_off(now);
                self.active = false;
            }
            self.stop_resume();
            self.stop_regulation();
            self.evaluate_no_data(now);
            return;
        }

        if !self.modes.start_stop {
            self.ensure_off(now);
            self.evaluate_no_data(now);
            return;
        }
        if !self.planner_ok(now) || !self.soc_ok() || !self.priority_allowed() {
            self.start_resume(now);
            self.evaluate_no_data(now);
            return;
        }
        self.start_auto_connect(now);
        self.apply(now, false);
        self.start_regulation(now);
        self.start_resume(now);
        self.evaluate_no_data(now);
    }

    /// Preferred or top-ordered controllers take the slot when plugged in;
    /// a holder that lost its cable is moved along
    fn connect_preemption(&mut self) {
        let me = self.cfg.id.clone();
        let current = self.arbiter.get_priority();
        let preferred = self.arbiter.get_preferred_priority();
        if preferred.as_deref() == Some(me.as_str())
            && current.as_deref().is_some_and(|c| c != me)
        {
            self.logger.info("Preferred charger connected; claiming priority");
            self.arbiter.set_priority(Some(&me));
        }
        let top = self.arbiter.get_order().into_iter().next();
        if top.as_deref() == Some(me.as_str()) && self.arbiter.get_priority().as_deref() != Some(&me)
        {
            self.logger.info("Top-ordered charger connected; claiming priority");
            self.arbiter.set_priority(Some(&me));
        }
        if let Some(holder) = self.arbiter.get_priority()
            && holder != me
            && self
                .arbiter
                .facts_of(&holder)
                .is_some_and(|f| !f.cable_connected)
        {
            self.arbiter.advance_to_next(&holder);
        }
        self.arbiter.align_current_with_order();
    }

    fn on_disconnected(&mut self, now: Moment) {
        self.logger.info("Cable disconnected");
        self.pending_initial_start = false;
        self.stop_auto_connect();
        self.stop_regulation();
        self.stop_resume();
        self.stop_reclaim();
        self.cancel_relock();
        self.active = false;
        self.paused_below_lower = false;
        self.reset_timers();
        self.reset_above_upper();
        self.timers.cancel_where(|k| TimerKind::SESSION.contains(&k));
        self.ensure_off(now);
        self.emit(Effect::Lock);
        self.set_current_min();

        if self.modes.start_stop != self.modes.start_stop_reset {
            self.modes.set(Mode::StartStop, self.modes.start_stop_reset);
            self.logger.info(&format!(
                "Start/stop reset to {} on disconnect",
                self.modes.start_stop
            ));
            self.mark_dirty(now);
        }
        if self.external_off_latched {
            self.external_off_latched = false;
            self.logger.info("External override latch cleared");
            self.dismiss("external_off");
            self.mark_dirty(now);
        }
        self.arbiter.clear_all_pauses(&self.cfg.id);
        self.sync_facts(now);
        self.advance_if_current();
        self.evaluate_no_data(now);

        self.session_id = None;
        self.logger.set_session(None);
    }

    // ---------------- Auto-connect routine ----------------

    pub(crate) fn start_auto_connect(&mut self, now: Moment) {
        if self.modes.manual {
            return;
        }
        self.auto_connect = Some(AutoConnect {
            checked: false,
            export_since: None,
        });
        self.timers
            .arm(TimerKind::AutoConnect, now.mono + CONNECT_DEBOUNCE);
    }

    pub(crate) fn stop_auto_connect(&mut self) {
        self.auto_connect = None;
        self.timers.cancel(TimerKind::AutoConnect);
    }

    /// One step of the routine; re-arms itself while it keeps waiting
    pub(crate) fn on_auto_connect_tick(&mut self, now: Moment) {
        let Some(mut state) = self.auto_connect else {
            return;
        };
        let aborted = !self.cable()
            || self.modes.manual
            || !self.modes.start_stop
            || !self.priority_allowed()
            || self.active;
        if aborted {
            self.stop_auto_connect();
            return;
        }
        let gates = self.planner_ok(now)
            && self.soc_ok()
            && self.readings.essential_data_available();
        let band = self.band();
        let net = self.readings.net_power_w;

        if !state.checked {
            if !gates || band.upper_w <= band.lower_w {
                self.stop_auto_connect();
                return;
            }
            if net.is_some_and(|n| band.is_above_upper(n)) {
                if !self.priority_mode() || self.have_priority_now() {
                    self.logger.info("Export above upper at connect; starting");
                    self.start_charging_and_reclaim(now);
                    self.start_regulation(now);
                }
                self.stop_auto_connect();
                return;
            }
            state.checked = true;
        }

        if !gates {
            state.export_since = None;
        } else if net.is_some_and(|n| band.is_above_upper(n)) {
            let since = *state.export_since.get_or_insert(now.mono);
            if now.mono.saturating_duration_since(since) >= EXPORT_SUSTAIN
                && (!self.priority_mode() || self.have_priority_now())
            {
                self.logger
                    .info("Export held above upper after connect; starting");
                self.start_charging_and_reclaim(now);
                self.start_regulation(now);
                self.stop_auto_connect();
                return;
            }
        } else {
            state.export_since = None;
        }
        self.auto_connect = Some(state);
        self.timers
            .arm(TimerKind::AutoConnect, now.mono + AUTO_CONNECT_POLL);
    }

    // ---------------- Lock handling ----------------

    /// Watch for charging after an unlock and lock the cable again.
    /// `detected` skips the wait for charging.
    pub(crate) fn schedule_relock(&mut self, now: Moment, detected: bool) {
        if self.cfg.entities.lock.is_none() {
            return;
        }
        if detected {
            self.relock = Some(RelockStage::Detected);
            self.timers
                .arm(TimerKind::Relock, now.mono + RELOCK_AFTER_CHARGING);
        } else {
            self.relock = Some(RelockStage::Watching {
                until: now.mono + RELOCK_WATCH_WINDOW,
            });
            self.timers.arm(TimerKind::Relock, now.mono + RELOCK_POLL);
        }
    }

    pub(crate) fn cancel_relock(&mut self) {
        self.relock = None;
        self.timers.cancel(TimerKind::Relock);
    }

    pub(crate) fn on_relock_tick(&mut self, now: Moment) {
        let Some(stage) = self.relock else {
            return;
        };
        if !self.cable() {
            self.cancel_relock();
            return;
        }
        match stage {
            RelockStage::Watching { until } => {
                if self.readings.charging_detected() || now.mono >= until {
                    self.relock = Some(RelockStage::Detected);
                    self.timers
                        .arm(TimerKind::Relock, now.mono + RELOCK_AFTER_CHARGING);
                } else {
                    self.timers.arm(TimerKind::Relock, now.mono + RELOCK_POLL);
                }
            }
            RelockStage::Detected => {
                self.logger.info("Re-locking cable");
                self.relock = None;
                self.emit(Effect::Lock);
            }
        }
    }

    /// Lock went from locked to unlocked: the user wants to charge now
    pub(crate) fn on_lock_released(&mut self, now: Moment) {
        let ready = self.modes.start_stop
            && self.cable()
            && self.readings.essential_data_available()
            && self.planner_ok(now)
            && self.soc_ok();
        if !ready {
            return;
        }
        if self.priority_mode() {
            self.arbiter.align_current_with_order();
            if !self.holds_priority() {
                return;
            }
        }
        self.logger.info("Cable unlocked; starting");
        self.start_charging_and_reclaim(now);
        self.start_regulation(now);
    }

    // ---------------- Startup probe ----------------

    /// Wait for the cable entity, then enforce the lock and replay the cable state
    pub(crate) fn on_startup_probe(&mut self, now: Moment) {
        let Some(deadline) = self.startup_deadline else {
            return;
        };
        if self.readings.cable_known {
            self.startup_deadline = None;
            self.emit(Effect::Lock);
            let connected = self.readings.cable_connected;
            self.on_cable_state(connected, now);
            return;
        }
        if now.mono >= deadline {
            self.startup_deadline = None;
            self.logger
                .warn("Cable state still unknown after startup wait; locking anyway");
            self.emit(Effect::Lock);
            return;
        }
        self.timers
            .arm(TimerKind::StartupProbe, now.mono + STARTUP_PROBE_INTERVAL);
    }
}
