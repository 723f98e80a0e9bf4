use super::{ChargeController, ChargeState, ControllerStatus};
use crate::clock::Moment;
use crate::priority::PauseReason;

impl ChargeController {
    fn charge_state(&self, now: Moment, pauses: &[PauseReason]) -> ChargeState {
        if !self.cable() {
            ChargeState::Disconnected
        } else if self.active {
            ChargeState::Charging
        } else if self.paused_below_lower {
            ChargeState::PausedBelowLower
        } else if pauses.contains(&PauseReason::NoData) {
            ChargeState::PausedNoData
        } else if !self.planner_ok(now) || !self.soc_ok() || !self.priority_allowed() {
            ChargeState::PausedGated
        } else {
            ChargeState::Idle
        }
    }

    /// Point-in-time view for the watch channel and the status surface
    pub fn status(&self, now: Moment) -> ControllerStatus {
        let pauses = self.arbiter.pause_reasons(&self.cfg.id);
        ControllerStatus {
            entry_id: self.cfg.id.clone(),
            name: self.cfg.display_name().to_string(),
            state: self.charge_state(now, &pauses),
            charging_active: self.active,
            cable_connected: self.cable(),
            charging_enabled: self.readings.charging_enable,
            modes: self.modes,
            planner: self.planner,
            planner_allows: self.planner_ok(now),
            soc_percent: self.readings.soc_percent,
            soc_limit_percent: self.soc_limit,
            soc_allows: self.soc_ok(),
            net_power_w: self.readings.net_power_w,
            charge_power_w: self.readings.charge_power_w,
            wallbox_status: self.readings.wallbox_status.clone(),
            current_setting_a: self.readings.current_setting_a,
            net_power_target_w: self.net_target_w,
            ext_import_limit_w: self.ext_import_limit_w,
            auto_unlock_enabled: self.auto_unlock,
            band: self.band(),
            priority_allowed: self.priority_allowed(),
            holds_priority: self.holds_priority(),
            pauses,
            external_off_latched: self.external_off_latched,
            missing: self.readings.missing.clone(),
            phase: self.phase.status(),
            session_id: self.session_id.clone(),
        }
    }
}
