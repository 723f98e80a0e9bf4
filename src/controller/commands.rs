//! User controls: mode switches, planner window, limits and phase requests

use super::{ChargeController, ControllerInput, UserCommand};
use crate::clock::Moment;
use crate::controls::{Mode, clamp_ext_import_limit, clamp_net_power_target, clamp_soc_limit};
use crate::phase::SwitchSource;

impl ChargeController {
    /// Dispatch one actor input
    pub fn handle_input(&mut self, input: ControllerInput, now: Moment) {
        match input {
            ControllerInput::StateChanged(change) => self.handle_state_change(&change, now),
            ControllerInput::Command(cmd) => self.handle_command(cmd, now),
            ControllerInput::Shutdown => self.shutdown(now),
        }
    }

    pub fn handle_command(&mut self, cmd: UserCommand, now: Moment) {
        self.refresh(now);
        self.logger.debug(&format!("Command {cmd:?}"));
        match cmd {
            UserCommand::SetMode { mode, enabled } => self.set_mode(mode, enabled, now),
            UserCommand::SetPlannerStart { at } => {
                self.planner.start = at;
                self.on_planner_changed(now);
            }
            UserCommand::SetPlannerStop { at } => {
                self.planner.stop = at;
                self.on_planner_changed(now);
            }
            UserCommand::SetSocLimit { percent } => {
                let was = self.soc_ok();
                self.soc_limit = clamp_soc_limit(percent);
                self.mark_dirty(now);
                let allows = self.soc_ok();
                self.soc_prev = Some(allows);
                if allows && !was {
                    self.align_if_mode();
                }
                self.apply(now, false);
                self.evaluate_no_data(now);
            }
            UserCommand::SetNetPowerTarget { watts } => {
                self.net_target_w = clamp_net_power_target(watts);
                self.mark_dirty(now);
            }
            UserCommand::SetExtImportLimit { watts } => {
                self.ext_import_limit_w = clamp_ext_import_limit(watts);
                self.mark_dirty(now);
                if !self.modes.manual {
                    self.apply(now, false);
                }
            }
            UserCommand::SetAutoUnlock { enabled } => {
                self.auto_unlock = enabled;
                self.mark_dirty(now);
            }
            UserCommand::SetPhaseMode { mode } => self.set_phase_mode(mode, now),
            UserCommand::RequestPhaseSwitch { target } => {
                let _ = self.request_phase_switch(target, SwitchSource::Manual, now);
            }
        }
        self.sync_facts(now);
    }

    fn on_planner_changed(&mut self, now: Moment) {
        self.mark_dirty(now);
        self.sync_facts(now);
        if self.planner_ok(now) {
            self.align_if_mode();
        }
        self.apply(now, false);
        self.evaluate_no_data(now);
    }

    fn set_mode(&mut self, mode: Mode, enabled: bool, now: Moment) {
        if !self.modes.set(mode, enabled) {
            return;
        }
        self.logger
            .info(&format!("Mode {mode:?} set to {enabled}"));
        self.mark_dirty(now);
        self.sync_facts(now);

        match mode {
            Mode::StartStop => {
                self.set_current_min();
                if enabled {
                    self.align_if_mode();
                    self.apply(now, false);
                    if !self.modes.manual {
                        self.start_regulation(now);
                        self.start_resume(now);
                    }
                } else {
                    self.stop_auto_connect();
                    self.apply(now, false);
                    self.advance_if_current();
                }
            }
            Mode::Eco => {
                if !self.modes.manual {
                    self.apply(now, true);
                }
            }
            Mode::Manual => {
                self.set_current_min();
                if enabled {
                    self.reset_timers();
                    self.stop_reclaim();
                    self.stop_auto_connect();
                    self.cancel_relock();
                    self.reset_above_upper();
                    self.stop_regulation();
                    self.stop_resume();
                    self.apply(now, false);
                } else {
                    self.apply(now, false);
                    self.start_regulation(now);
                    self.start_resume(now);
                }
            }
            Mode::Planner => {
                if enabled {
                    self.start_planner_monitor(now);
                } else {
                    self.stop_planner_monitor();
                    self.align_if_mode();
                    self.roll_planner_dates(now);
                }
                self.apply(now, false);
                self.evaluate_no_data(now);
            }
            Mode::StartStopReset => {}
        }
    }
}
