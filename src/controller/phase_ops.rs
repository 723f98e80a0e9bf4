//! Phase switch sequencing on top of [`PhaseSwitchCoordinator`]
//!
//! [`PhaseSwitchCoordinator`]: crate::phase::PhaseSwitchCoordinator

use super::{ChargeController, Effect, PHASE_STOP_POLL, TimerKind};
use crate::clock::Moment;
use crate::events::BusEvent;
use crate::phase::{
    AutoInput, FeedbackNotice, PhaseMode, PhaseProfile, StopProgress, SwitchAccepted,
    SwitchRejected, SwitchSource,
};

impl ChargeController {
    /// Ask for a switch; on acceptance charging is stopped first
    pub(crate) fn request_phase_switch(
        &mut self,
        target: PhaseProfile,
        source: SwitchSource,
        now: Moment,
    ) -> Result<SwitchAccepted, SwitchRejected> {
        let before = self.phase.persisted();
        let result =
            self.phase
                .request_switch(target, source, self.readings.phase_feedback, now);
        match result {
            Ok(SwitchAccepted::Started) => {
                self.logger.info(&format!(
                    "Phase switch to {target} requested ({source:?}); stopping charging"
                ));
                self.ensure_off(now);
                self.active = false;
                self.stop_regulation();
                self.set_current_min();
                self.timers
                    .arm(TimerKind::PhaseStopPoll, now.mono + PHASE_STOP_POLL);
            }
            Ok(SwitchAccepted::NoOp) => {
                self.logger
                    .debug(&format!("Phase switch to {target}: already active"));
            }
            Err(reason) => {
                self.logger
                    .info(&format!("Phase switch to {target} rejected: {reason}"));
            }
        }
        if self.phase.persisted() != before {
            self.mark_dirty(now);
        }
        result
    }

    /// Wait for charge power to drop, then hand the relay switch downstream
    pub(crate) fn on_phase_stop_poll(&mut self, now: Moment) {
        match self.phase.poll_stopped(self.readings.charge_power_w, now) {
            StopProgress::Waiting => {
                if self.phase.waiting_for_stop() {
                    self.timers
                        .ensure(TimerKind::PhaseStopPoll, now.mono + PHASE_STOP_POLL);
                }
            }
            StopProgress::Switch { target, source } => {
                self.timers.cancel(TimerKind::PhaseStopPoll);
                self.logger
                    .info(&format!("Charging stopped; requesting switch to {target}"));
                self.emit(Effect::Fire(BusEvent::PhaseSwitchRequest {
                    entry_id: self.cfg.id.clone(),
                    target,
                    source,
                }));
                if let Some(until) = self.phase.veto_until() {
                    self.timers.arm(TimerKind::PhaseVetoEnd, until);
                }
                self.arm_phase_fallback();
                self.mark_dirty(now);
            }
            StopProgress::Aborted { target } => {
                self.timers.cancel(TimerKind::PhaseStopPoll);
                self.logger.warn(&format!(
                    "Phase switch to {target} abandoned: charging did not stop"
                ));
                self.notify(
                    "phase_switch",
                    "EV charger phase switch",
                    format!(
                        "{} did not stop charging in time; the switch to {target} was abandoned.",
                        self.cfg.display_name()
                    ),
                );
                self.apply(now, false);
            }
        }
    }

    pub(crate) fn on_phase_veto_end(&mut self, now: Moment) {
        self.logger.debug("Phase switch veto ended");
        self.apply(now, false);
        self.start_regulation(now);
    }

    /// Feedback changed or the feedback timeout expired
    pub(crate) fn on_phase_feedback(&mut self, now: Moment) {
        match self
            .phase
            .observe_feedback(self.readings.phase_feedback, now.mono)
        {
            FeedbackNotice::None => {}
            FeedbackNotice::Uncertain { expected, feedback } => {
                let seen = feedback.map_or_else(|| "unknown".to_string(), |f| f.to_string());
                self.logger.warn(&format!(
                    "Phase feedback reports {seen}, expected {expected}; using three phase thresholds"
                ));
                self.notify(
                    "phase_feedback",
                    "EV charger phase mismatch",
                    format!(
                        "{} reports {seen} while {expected} was requested.",
                        self.cfg.display_name()
                    ),
                );
            }
            FeedbackNotice::Resolved => {
                self.logger.info("Phase feedback matches again");
                self.dismiss("phase_feedback");
            }
        }
        self.arm_phase_fallback();
        if !self.phase.blocks_charging(now.mono) && self.modes.start_stop {
            self.apply(now, false);
        }
    }

    fn arm_phase_fallback(&mut self) {
        match self.phase.fallback_deadline() {
            Some(at) => self.timers.arm(TimerKind::PhaseFallback, at),
            None => {
                self.timers.cancel(TimerKind::PhaseFallback);
            }
        }
    }

    /// Change the phase policy; a forced mode requests its profile right away
    pub(crate) fn set_phase_mode(&mut self, mode: PhaseMode, now: Moment) {
        if !self.phase.supported() {
            self.logger
                .warn("Phase mode change ignored: phase switching is not configured");
            return;
        }
        if self.phase.set_mode(mode) {
            self.logger.info(&format!("Phase mode set to {mode:?}"));
            self.mark_dirty(now);
        }
        if let Some(target) = mode.forced() {
            let _ = self.request_phase_switch(target, SwitchSource::Manual, now);
        }
    }

    /// Run the automatic evaluator with the current readings
    pub(crate) fn phase_housekeeping(&mut self, now: Moment) {
        if !self.phase.supported() || self.phase.mode() != PhaseMode::Auto {
            return;
        }
        let gates_ok = self.modes.start_stop
            && self.cable()
            && self.planner_ok(now)
            && self.soc_ok()
            && self.priority_allowed();
        let upper_3p_w = self.cfg.thresholds.pair(self.modes.eco).0;
        let alternate_upper_w = self.cfg.alternate_thresholds.pair(self.modes.eco).0;
        let can_resume_now = self
            .readings
            .net_power_w
            .is_some_and(|n| self.band().is_above_upper(n));
        let input = AutoInput {
            gates_ok,
            feedback: self.readings.phase_feedback,
            current_a: self.readings.current_setting_a,
            max_current_a: self.cfg.max_current(),
            net_w: self.readings.net_power_w,
            charge_power_w: self.readings.charge_power_w,
            upper_3p_w,
            alternate_upper_w,
            stopped_below_lower: self.paused_below_lower,
            can_resume_now,
        };
        let before = self.phase.persisted();
        let target = self.phase.auto_evaluate(&input, now);
        if self.phase.persisted() != before {
            self.mark_dirty(now);
        }
        if let Some(target) = target {
            self.logger
                .info(&format!("Automatic phase switch to {target} due"));
            let _ = self.request_phase_switch(target, SwitchSource::Auto, now);
        }
    }
}
