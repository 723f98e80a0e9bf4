//! Periodic monitors: resume, reclaim, regulation, planner and midnight rollover

use super::{ChargeController, Effect, PLANNER_MONITOR_INTERVAL, TimerKind};
use crate::clock::Moment;
use crate::controls::next_local_midnight;
use crate::events::BusEvent;
use crate::hysteresis::effective_profile;
use crate::priority::PauseReason;
use crate::regulation::{Adjustment, RegulationInput, next_current};

impl ChargeController {
    // ---------------- Resume monitor ----------------

    fn should_resume(&self) -> bool {
        !self.modes.manual
            && self.modes.start_stop
            && self.cable()
            && !self.enabled()
            && self.priority_allowed()
    }

    pub(crate) fn start_resume(&mut self, now: Moment) {
        if self.should_resume() {
            self.timers
                .ensure(TimerKind::ResumeMonitor, now.mono + self.cfg.scan_interval());
        }
    }

    pub(crate) fn stop_resume(&mut self) {
        self.timers.cancel(TimerKind::ResumeMonitor);
    }

    /// Resume charging once export is back above upper
    pub(crate) fn on_resume_tick(&mut self, now: Moment) {
        if !self.should_resume() {
            return;
        }
        self.phase_housekeeping(now);
        let rearm = now.mono + self.cfg.scan_interval();
        let gates = self.planner_ok(now)
            && self.soc_ok()
            && self.readings.essential_data_available();
        if gates {
            let net = self.readings.net_power_w;
            if self.sustained_above_upper(net, now) {
                if self.priority_mode() && !self.have_priority_now() {
                    self.timers.arm(TimerKind::ResumeMonitor, rearm);
                    return;
                }
                self.logger.info("Resuming: net power back above upper threshold");
                self.start_charging_and_reclaim(now);
                self.start_regulation(now);
                return;
            }
            if net.is_some_and(|n| self.band().is_above_upper(n)) {
                self.schedule_upper_timer();
            }
        }
        self.timers.arm(TimerKind::ResumeMonitor, rearm);
    }

    // ---------------- Reclaim monitor ----------------

    /// Take the priority slot back once export recovers after a below-lower pause
    pub(crate) fn reclaim_check(&mut self, now: Moment) -> bool {
        let Some(reclaim) = self.reclaim else {
            return false;
        };
        if !self.modes.start_stop || !self.cable() {
            self.stop_reclaim();
            return true;
        }
        let net = self.readings.net_power_w;
        if net.is_none() || !self.planner_ok(now) || !self.soc_ok() {
            return false;
        }
        if !self.sustained_above_upper(net, now) {
            return false;
        }
        if self.priority_mode() {
            if reclaim.released {
                self.arbiter
                    .clear_pause(&self.cfg.id, PauseReason::BelowLower);
                self.arbiter.align_current_with_order();
            } else {
                self.logger.info("Reclaiming priority: export recovered");
                self.arbiter.set_priority(Some(&self.cfg.id));
                self.arbiter.align_current_with_order();
            }
        }
        self.stop_reclaim();
        true
    }

    pub(crate) fn on_reclaim_tick(&mut self, now: Moment) {
        self.phase_housekeeping(now);
        if self.reclaim.is_some() && !self.reclaim_check(now) {
            self.timers.arm(
                TimerKind::ReclaimMonitor,
                now.mono + self.cfg.scan_interval(),
            );
        }
    }

    /// Release a held below-lower claim after the configured timeout
    pub(crate) fn on_reclaim_release(&mut self) {
        let Some(reclaim) = self.reclaim.as_mut() else {
            return;
        };
        if reclaim.released {
            return;
        }
        reclaim.released = true;
        self.logger
            .info("Releasing priority claim held since below-lower pause");
        if self.priority_mode() {
            self.arbiter
                .mark_pause(&self.cfg.id, PauseReason::BelowLower);
            self.arbiter.handover_after_pause(&self.cfg.id);
        }
    }

    // ---------------- Regulation loop ----------------

    fn should_regulate(&self, now: Moment) -> bool {
        !self.modes.manual
            && self.modes.start_stop
            && self.cable()
            && self.enabled()
            && self.planner_ok(now)
            && self.soc_ok()
            && self.priority_allowed()
    }

    pub(crate) fn start_regulation(&mut self, now: Moment) {
        if self.timers.is_armed(TimerKind::Regulation) || !self.should_regulate(now) {
            return;
        }
        self.logger.debug("Regulation loop started");
        self.regulation_started = Some(now.mono);
        self.timers.arm(TimerKind::Regulation, now.mono);
    }

    pub(crate) fn stop_regulation(&mut self) {
        if self.timers.cancel(TimerKind::Regulation) {
            self.logger.debug("Regulation loop stopped");
        }
        self.regulation_started = None;
    }

    pub(crate) fn on_regulation_tick(&mut self, now: Moment) {
        if !self.should_regulate(now) {
            let gated = !self.planner_ok(now) || !self.soc_ok();
            if gated && self.active && self.modes.start_stop && self.cable() && !self.modes.manual
            {
                self.pause_basic(now, true);
                self.advance_if_current();
            }
            self.regulation_started = None;
            return;
        }

        self.evaluate_no_data(now);
        if self.readings.charging_detected()
            && self.relock.is_none()
            && self.readings.is_unlocked()
        {
            self.schedule_relock(now, true);
        }

        let band = self.band();
        if let Some(net) = self.readings.net_power_w {
            self.track_below_lower(net, band, now);
        }
        self.regulate_step(now);
        self.phase_housekeeping(now);

        if self.timers.is_armed(TimerKind::Regulation) || !self.should_regulate(now) {
            return;
        }
        self.timers
            .arm(TimerKind::Regulation, now.mono + self.cfg.scan_interval());
    }

    fn regulate_step(&mut self, now: Moment) {
        if self.cfg.entities.current_setting.is_none()
            || !self.readings.essential_data_available()
            || !self.soc_ok()
        {
            return;
        }
        let (Some(net), Some(current)) =
            (self.readings.net_power_w, self.readings.current_setting_a)
        else {
            return;
        };
        let warmed_up = self
            .regulation_started
            .is_some_and(|s| now.mono >= s + self.cfg.scan_interval());
        let input = RegulationInput {
            net_w: net,
            target_w: self.net_target_w,
            charge_power_w: self.readings.charge_power_w,
            status_charging: self.readings.status_charging(),
            current_a: current,
            max_current_a: self.cfg.max_current(),
            warmed_up,
            profile: effective_profile(&self.cfg, self.one_phase_confirmed()),
        };
        match next_current(&input) {
            Adjustment::Hold => {}
            adj @ (Adjustment::Increase(a) | Adjustment::Decrease(a)) => {
                self.logger.debug(&format!(
                    "Regulation {adj:?}: net={net:.0} W target={} W {current} A -> {a} A",
                    self.net_target_w
                ));
                self.emit(Effect::SetCurrent(a));
            }
        }
    }

    // ---------------- Planner ----------------

    pub(crate) fn start_planner_monitor(&mut self, now: Moment) {
        self.planner_prev = None;
        self.timers
            .ensure(TimerKind::PlannerMonitor, now.mono + PLANNER_MONITOR_INTERVAL);
    }

    pub(crate) fn stop_planner_monitor(&mut self) {
        self.timers.cancel(TimerKind::PlannerMonitor);
        self.planner_prev = None;
    }

    /// Pause at the window end, re-align at the window start
    pub(crate) fn on_planner_tick(&mut self, now: Moment) {
        if !self.modes.planner {
            self.planner_prev = None;
            return;
        }
        let allows = self.planner_ok(now);
        if self.modes.start_stop {
            if !allows {
                if self.active {
                    self.logger.info("Planner window closed; pausing");
                    self.pause_basic(now, true);
                }
                self.advance_if_current();
            } else if self.planner_prev == Some(false) {
                self.logger.info("Planner window opened");
                self.align_if_mode();
                self.apply(now, false);
            }
        }
        self.planner_prev = Some(allows);
        self.timers
            .arm(TimerKind::PlannerMonitor, now.mono + PLANNER_MONITOR_INTERVAL);
    }

    // ---------------- Midnight rollover ----------------

    pub(crate) fn arm_midnight(&mut self, now: Moment) {
        let at = next_local_midnight(self.tz, now.wall);
        self.timers.arm(TimerKind::Midnight, now.mono_for(at));
    }

    /// Move past planner dates to today while planner mode is off
    pub(crate) fn roll_planner_dates(&mut self, now: Moment) -> bool {
        if self.modes.planner || !self.planner.roll_to_today_if_past(self.tz, now.wall) {
            return false;
        }
        self.logger.info("Planner dates moved to today");
        self.mark_dirty(now);
        self.emit(Effect::Fire(BusEvent::PlannerDatetimeUpdated {
            entry_id: self.cfg.id.clone(),
        }));
        true
    }

    pub(crate) fn on_midnight(&mut self, now: Moment) {
        self.roll_planner_dates(now);
        self.arm_midnight(now);
    }
}
