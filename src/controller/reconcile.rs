//! Hysteresis reconciliation, start and pause paths

use super::{AboveUpper, ChargeController, Effect, Reclaim, TimerKind};
use crate::clock::Moment;
use crate::hysteresis::Band;
use crate::priority::PauseReason;

impl ChargeController {
    /// Core reconciliation, run on every relevant event.
    ///
    /// `preserve_current` keeps the current setting when a gate pauses an
    /// active session (used for eco toggles).
    pub(crate) fn apply(&mut self, now: Moment, preserve_current: bool) {
        if !self.modes.start_stop {
            self.teardown(now);
            return;
        }
        if !self.cable() {
            self.teardown(now);
            self.advance_if_current();
            return;
        }

        let planner_ok = self.planner_ok(now);
        let soc_ok = self.soc_ok();
        let allowed = self.priority_allowed();

        if self.modes.manual {
            if !planner_ok || !soc_ok || !allowed {
                if self.active {
                    self.pause_basic(now, !preserve_current);
                }
                if !planner_ok || !soc_ok {
                    self.advance_if_current();
                }
                return;
            }
            if !self.active {
                if self.priority_mode() && !self.have_priority_now() {
                    self.start_resume(now);
                    return;
                }
                if self.readings.essential_data_available() {
                    self.start_charging_and_reclaim(now);
                } else {
                    self.ensure_off(now);
                }
            }
            return;
        }

        if !planner_ok || !soc_ok {
            if self.active {
                self.logger.info(if planner_ok {
                    "Pausing: SoC limit reached"
                } else {
                    "Pausing: outside planner window"
                });
                self.pause_basic(now, !preserve_current);
            }
            self.advance_if_current();
            self.start_resume(now);
            self.evaluate_no_data(now);
            self.reset_above_upper();
            return;
        }

        if !allowed {
            if self.active {
                self.logger.info("Pausing: another charger holds priority");
                self.pause_basic(now, !preserve_current);
            }
            self.start_resume(now);
            self.evaluate_no_data(now);
            self.reset_above_upper();
            return;
        }

        let net = self
            .readings
            .net_power_w
            .filter(|_| self.readings.essential_data_available());
        let Some(net) = net else {
            if !self.active {
                self.ensure_off(now);
                self.cancel_relock();
            }
            self.start_resume(now);
            self.start_regulation(now);
            self.reset_above_upper();
            return;
        };

        if self.readings.charging_detected() && self.relock.is_none() && self.readings.is_unlocked()
        {
            self.schedule_relock(now, true);
        }

        let band = self.band();
        if !self.active {
            self.reset_timers();
            if self.sustained_above_upper(Some(net), now) {
                if self.priority_mode() && !self.have_priority_now() {
                    self.start_resume(now);
                    return;
                }
                self.start_charging_and_reclaim(now);
                self.stop_resume();
                self.start_regulation(now);
            } else {
                if band.is_above_upper(net) {
                    self.schedule_upper_timer();
                }
                self.start_resume(now);
                self.start_regulation(now);
            }
            return;
        }

        self.track_below_lower(net, band, now);
    }

    /// Stop everything and force charging off
    fn teardown(&mut self, now: Moment) {
        self.reset_timers();
        self.ensure_off(now);
        self.active = false;
        self.stop_regulation();
        self.stop_resume();
        self.stop_reclaim();
        self.cancel_relock();
        self.reset_above_upper();
    }

    /// Net power at or above upper for the upper debounce window.
    ///
    /// A change of the upper threshold restarts the window.
    pub(crate) fn sustained_above_upper(&mut self, net: Option<f64>, now: Moment) -> bool {
        let Some(net) = net else {
            self.reset_above_upper();
            return false;
        };
        let band = self.band();
        if !band.is_above_upper(net) {
            self.reset_above_upper();
            return false;
        }
        let debounce = self.cfg.upper_debounce();
        match self.above_upper {
            Some(a) if a.upper_w == band.upper_w => {
                now.mono.saturating_duration_since(a.since) >= debounce
            }
            _ => {
                self.above_upper = Some(AboveUpper {
                    since: now.mono,
                    upper_w: band.upper_w,
                });
                debounce.is_zero()
            }
        }
    }

    pub(crate) fn reset_above_upper(&mut self) {
        self.above_upper = None;
        self.timers.cancel(TimerKind::UpperDebounce);
    }

    /// Fire the upper timer when the debounce window of the current run ends
    pub(crate) fn schedule_upper_timer(&mut self) {
        if let Some(a) = self.above_upper {
            let at = a.since + self.cfg.upper_debounce();
            self.timers.arm(TimerKind::UpperDebounce, at);
        }
    }

    pub(crate) fn on_upper_debounce(&mut self, now: Moment) {
        let ready = !self.modes.manual
            && self.modes.start_stop
            && self.cable()
            && !self.enabled()
            && self.priority_allowed()
            && self.planner_ok(now)
            && self.soc_ok()
            && self.readings.essential_data_available();
        if !ready {
            return;
        }
        let band = self.band();
        let Some(net) = self.readings.net_power_w else {
            return;
        };
        if !band.is_above_upper(net) {
            return;
        }
        if self.priority_mode() && !self.have_priority_now() {
            return;
        }
        self.logger
            .info(&format!("Net power {net:.0} W held above {} W; starting", band.upper_w));
        self.start_charging_and_reclaim(now);
        self.stop_resume();
        self.start_regulation(now);
    }

    // ---------------- Below-lower sustain ----------------

    pub(crate) fn track_below_lower(&mut self, net: f64, band: Band, now: Moment) {
        if band.is_below_lower(net) {
            if !self.below_lower.is_tracking()
                && let Some(at) = self.below_lower.observe(true, self.cfg.sustain(), now.mono)
            {
                self.logger.debug(&format!(
                    "Net power {net:.0} W below {} W; pause in {} s",
                    band.lower_w, self.cfg.sustain_s
                ));
                self.timers.arm(TimerKind::BelowLower, at);
            }
        } else {
            self.reset_below_lower();
        }
    }

    fn reset_below_lower(&mut self) {
        self.below_lower.reset();
        self.timers.cancel(TimerKind::BelowLower);
    }

    pub(crate) fn on_below_lower(&mut self, now: Moment) {
        let still_below = self
            .readings
            .net_power_w
            .is_some_and(|n| self.band().is_below_lower(n));
        if self.below_lower.is_tracking() && self.timer_conditions(now) && still_below {
            self.pause_due_below_lower(now);
        } else {
            self.reset_below_lower();
        }
    }

    pub(crate) fn reset_timers(&mut self) {
        self.reset_below_lower();
        self.reset_no_data();
        self.timers.cancel(TimerKind::UpperDebounce);
    }

    // ---------------- No-data sustain ----------------

    pub(crate) fn evaluate_no_data(&mut self, now: Moment) {
        let missing = !self.readings.essential_data_available();
        if !missing {
            if self.last_missing {
                self.logger.info("Essential data available again");
            }
            if self
                .arbiter
                .pause_reasons(&self.cfg.id)
                .contains(&PauseReason::NoData)
            {
                self.arbiter.clear_pause(&self.cfg.id, PauseReason::NoData);
                self.align_if_mode();
            }
        }
        self.last_missing = missing;

        if !self.planner_ok(now) || !(self.timer_conditions(now) && self.enabled()) {
            self.reset_no_data();
            return;
        }
        if missing {
            if !self.no_data.is_tracking()
                && let Some(at) = self.no_data.observe(true, self.cfg.sustain(), now.mono)
            {
                self.logger.debug(&format!(
                    "Essential data missing ({}); pause in {} s",
                    self.readings.missing.join(", "),
                    self.cfg.sustain_s
                ));
                self.timers.arm(TimerKind::NoData, at);
            }
        } else {
            self.reset_no_data();
        }
    }

    fn reset_no_data(&mut self) {
        self.no_data.reset();
        self.timers.cancel(TimerKind::NoData);
    }

    pub(crate) fn on_no_data(&mut self, now: Moment) {
        let still_missing = !self.readings.essential_data_available();
        if self.no_data.is_tracking()
            && self.timer_conditions(now)
            && self.enabled()
            && still_missing
        {
            self.pause_due_no_data(now);
        } else {
            self.reset_no_data();
        }
    }

    // ---------------- Start / pause ----------------

    /// Turn charging on and drop any reclaim state
    pub(crate) fn start_charging_and_reclaim(&mut self, now: Moment) {
        let started = self.ensure_on(now);
        self.active = started;
        if started {
            self.paused_below_lower = false;
            self.logger.info("Charging started");
        }
        self.arbiter.clear_pause(&self.cfg.id, PauseReason::BelowLower);
        self.stop_reclaim();
        self.timers.cancel(TimerKind::UpperDebounce);
        self.align_if_mode();
    }

    /// Pause for a failing gate
    pub(crate) fn pause_basic(&mut self, now: Moment, set_min: bool) {
        self.active = false;
        self.ensure_off(now);
        self.cancel_relock();
        self.timers.cancel(TimerKind::UpperDebounce);
        if set_min {
            self.set_current_min();
        }
        self.stop_regulation();
        self.start_resume(now);
    }

    /// Net power stayed below lower for the sustain window
    pub(crate) fn pause_due_below_lower(&mut self, now: Moment) {
        self.logger.info(&format!(
            "Pausing: net power below {} W for {} s",
            self.band().lower_w,
            self.cfg.sustain_s
        ));
        self.reset_below_lower();
        self.active = false;
        self.paused_below_lower = true;
        self.ensure_off(now);
        self.cancel_relock();
        self.timers.cancel(TimerKind::UpperDebounce);
        self.stop_regulation();
        self.start_resume(now);
        self.reset_above_upper();
        if self.priority_mode() {
            self.arbiter.set_priority(Some(&self.cfg.id));
            self.start_reclaim(now);
        }
    }

    /// Essential data stayed missing for the sustain window
    pub(crate) fn pause_due_no_data(&mut self, now: Moment) {
        self.logger.warn(&format!(
            "Pausing: essential data missing ({}) for {} s",
            self.readings.missing.join(", "),
            self.cfg.sustain_s
        ));
        self.reset_no_data();
        self.active = false;
        self.ensure_off(now);
        self.cancel_relock();
        self.timers.cancel(TimerKind::UpperDebounce);
        self.stop_regulation();
        self.start_resume(now);
        self.reset_above_upper();
        if self.priority_mode() {
            self.arbiter.mark_pause(&self.cfg.id, PauseReason::NoData);
            self.arbiter.handover_after_pause(&self.cfg.id);
        }
    }

    pub(crate) fn start_reclaim(&mut self, now: Moment) {
        self.reclaim = Some(Reclaim { released: false });
        self.timers
            .arm(TimerKind::ReclaimMonitor, now.mono + self.cfg.scan_interval());
        if let Some(secs) = self.cfg.reclaim.timeout_s {
            self.timers.arm_in(
                TimerKind::ReclaimRelease,
                now.mono,
                std::time::Duration::from_secs(secs),
            );
        }
    }

    pub(crate) fn stop_reclaim(&mut self) {
        self.reclaim = None;
        self.timers.cancel(TimerKind::ReclaimMonitor);
        self.timers.cancel(TimerKind::ReclaimRelease);
    }

    // ---------------- Enable switch ----------------

    /// Switch charging on, honouring the cable lock. Returns whether charging
    /// is (or is being) enabled.
    pub(crate) fn ensure_on(&mut self, now: Moment) -> bool {
        if !self.modes.start_stop {
            return false;
        }
        if self.external_off_latched {
            self.logger
                .debug("Start suppressed: external override latched until cable disconnect");
            return false;
        }
        if self.phase.blocks_charging(now.mono) {
            self.logger.debug("Start suppressed: phase switch in progress");
            return false;
        }

        let lock_gated = self.cfg.entities.lock.is_some()
            && !self.readings.is_unlocked()
            && self.cable();
        if lock_gated {
            if self.pending_initial_start {
                if !self.auto_unlock {
                    self.logger
                        .info("Initial start needs an unlock; auto-unlock is disabled");
                    return false;
                }
                let gates = self.planner_ok(now)
                    && self.soc_ok()
                    && self.priority_allowed()
                    && self.readings.essential_data_available();
                if !gates {
                    return false;
                }
            } else if self.enabled() {
                return true;
            }
            let retry = self.enable.commanded(true);
            self.emit(Effect::StartCharging {
                initial: self.pending_initial_start,
                auto_unlock: self.auto_unlock,
            });
            self.timers.arm_in(TimerKind::EnableRetry, now.mono, retry);
            return true;
        }

        if !self.enabled() {
            let retry = self.enable.commanded(true);
            self.emit(Effect::SetEnable(true));
            self.timers.arm_in(TimerKind::EnableRetry, now.mono, retry);
        }
        self.pending_initial_start = false;
        true
    }

    /// Switch charging off (never suppressed)
    pub(crate) fn ensure_off(&mut self, now: Moment) {
        let observed = self.readings.charging_enable;
        let settled_off = self.enable.desired() == Some(false)
            && (self.enable.awaiting() || observed != Some(true));
        if !settled_off {
            if self.enable.desired().is_none() && observed == Some(false) {
                self.enable.adopt(false);
            } else {
                let retry = self.enable.commanded(false);
                self.emit(Effect::SetEnable(false));
                self.timers.arm_in(TimerKind::EnableRetry, now.mono, retry);
            }
        }
        self.cancel_relock();
    }
}
