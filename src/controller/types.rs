use crate::controls::{Mode, ModeFlags, PlannerWindow};
use crate::events::{BusEvent, StateChange};
use crate::hysteresis::Band;
use crate::persistence::PersistedState;
use crate::phase::{PhaseMode, PhaseProfile, PhaseStatus};
use crate::priority::PauseReason;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Coarse charging state derived from the controller's flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChargeState {
    Disconnected,
    Idle,
    Charging,
    PausedBelowLower,
    PausedNoData,
    PausedGated,
}

/// User controls accepted by a controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum UserCommand {
    SetMode { mode: Mode, enabled: bool },
    SetPlannerStart { at: Option<DateTime<Utc>> },
    SetPlannerStop { at: Option<DateTime<Utc>> },
    SetSocLimit { percent: Option<i64> },
    SetNetPowerTarget { watts: i64 },
    SetExtImportLimit { watts: i64 },
    SetAutoUnlock { enabled: bool },
    SetPhaseMode { mode: PhaseMode },
    RequestPhaseSwitch { target: PhaseProfile },
}

/// Messages consumed by the controller actor
#[derive(Debug, Clone)]
pub enum ControllerInput {
    StateChanged(StateChange),
    Command(UserCommand),
    Shutdown,
}

/// Side effects requested by the decision core, executed in order
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    SetEnable(bool),
    /// Lock-aware start; the executor reports back a [`StartOutcome`]
    StartCharging { initial: bool, auto_unlock: bool },
    SetCurrent(u8),
    Lock,
    Fire(BusEvent),
    Notify {
        id: String,
        title: String,
        message: String,
    },
    Dismiss { id: String },
    Save(Box<PersistedState>),
}

/// Result of a lock-aware start sequence
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StartOutcome {
    /// Charging enable was switched on (or already on)
    pub enabled: bool,
    /// The cable lock was released for this start
    pub unlocked: bool,
    /// Unlock failed or timed out
    pub aborted: bool,
    /// The cable was pulled before the start completed
    pub disconnected: bool,
}

/// Snapshot published through the controller's watch channel
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControllerStatus {
    pub entry_id: String,
    pub name: String,
    pub state: ChargeState,
    pub charging_active: bool,
    pub cable_connected: bool,
    pub charging_enabled: Option<bool>,
    pub modes: ModeFlags,
    pub planner: PlannerWindow,
    pub planner_allows: bool,
    pub soc_percent: Option<f64>,
    pub soc_limit_percent: Option<u8>,
    pub soc_allows: bool,
    pub net_power_w: Option<f64>,
    pub charge_power_w: Option<f64>,
    pub wallbox_status: Option<String>,
    pub current_setting_a: Option<u8>,
    pub net_power_target_w: i32,
    pub ext_import_limit_w: u32,
    pub auto_unlock_enabled: bool,
    pub band: Band,
    pub priority_allowed: bool,
    pub holds_priority: bool,
    pub pauses: Vec<PauseReason>,
    pub external_off_latched: bool,
    pub missing: Vec<&'static str>,
    pub phase: PhaseStatus,
    pub session_id: Option<String>,
}

/// Role an upstream entity plays for a controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EntityRole {
    Grid,
    ChargePower,
    Status,
    Cable,
    Enable,
    Lock,
    Soc,
    Current,
    PhaseFeedback,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_wire_format() {
        let cmd: UserCommand =
            serde_json::from_str(r#"{"action":"set_mode","mode":"start_stop","enabled":false}"#)
                .unwrap();
        assert_eq!(
            cmd,
            UserCommand::SetMode {
                mode: Mode::StartStop,
                enabled: false
            }
        );
        let cmd: UserCommand =
            serde_json::from_str(r#"{"action":"set_phase_mode","mode":"force_1p"}"#).unwrap();
        assert_eq!(
            cmd,
            UserCommand::SetPhaseMode {
                mode: PhaseMode::Force1p
            }
        );
    }
}
