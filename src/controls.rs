//! User-facing charging controls
//!
//! Mode flags, the charge planner window, the SoC gate and the clamps applied
//! to values coming from user controls.

use chrono::{DateTime, Days, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Net power target range (W)
pub const NET_POWER_TARGET_MIN_W: i32 = -10_000;
pub const NET_POWER_TARGET_MAX_W: i32 = 10_000;
/// External import limit range (W), 0 disables the override
pub const EXT_IMPORT_LIMIT_MAX_W: u32 = 25_000;
pub const DEFAULT_SOC_LIMIT_PERCENT: u8 = 80;

/// Per-charger mode switches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Surplus-only thresholds
    Eco,
    /// Master enable for this charger
    StartStop,
    /// Charge whenever gates allow, without hysteresis
    Manual,
    /// Restrict charging to the planner window
    Planner,
    /// Value start/stop returns to on startup and cable disconnect
    StartStopReset,
}

/// Persisted mode flag values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModeFlags {
    pub eco: bool,
    pub start_stop: bool,
    pub manual: bool,
    pub planner: bool,
    pub start_stop_reset: bool,
}

impl Default for ModeFlags {
    fn default() -> Self {
        Self {
            eco: true,
            start_stop: true,
            manual: false,
            planner: false,
            start_stop_reset: true,
        }
    }
}

impl ModeFlags {
    pub const fn get(&self, mode: Mode) -> bool {
        match mode {
            Mode::Eco => self.eco,
            Mode::StartStop => self.start_stop,
            Mode::Manual => self.manual,
            Mode::Planner => self.planner,
            Mode::StartStopReset => self.start_stop_reset,
        }
    }

    /// Set a flag, returning whether it changed
    pub fn set(&mut self, mode: Mode, value: bool) -> bool {
        let slot = match mode {
            Mode::Eco => &mut self.eco,
            Mode::StartStop => &mut self.start_stop,
            Mode::Manual => &mut self.manual,
            Mode::Planner => &mut self.planner,
            Mode::StartStopReset => &mut self.start_stop_reset,
        };
        let changed = *slot != value;
        *slot = value;
        changed
    }
}

/// Charge planner window
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannerWindow {
    pub start: Option<DateTime<Utc>>,
    pub stop: Option<DateTime<Utc>>,
}

impl PlannerWindow {
    /// Both ends set and start before stop
    pub fn is_valid(&self) -> bool {
        matches!((self.start, self.stop), (Some(a), Some(b)) if a < b)
    }

    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        match (self.start, self.stop) {
            (Some(a), Some(b)) if a < b => a <= now && now < b,
            _ => false,
        }
    }

    /// Whether the planner allows charging; always true while planner mode is off
    pub fn allows(&self, planner_enabled: bool, now: DateTime<Utc>) -> bool {
        !planner_enabled || self.contains(now)
    }

    /// Move dates that lie before today (local) to today, keeping the time of day.
    /// Returns whether anything changed.
    pub fn roll_to_today_if_past(&mut self, tz: Tz, now: DateTime<Utc>) -> bool {
        let today = now.with_timezone(&tz).date_naive();
        let roll = |dt: DateTime<Utc>| -> Option<DateTime<Utc>> {
            let local = dt.with_timezone(&tz);
            if local.date_naive() >= today {
                return None;
            }
            tz.from_local_datetime(&today.and_time(local.time()))
                .earliest()
                .map(|d| d.with_timezone(&Utc))
        };
        let mut changed = false;
        if let Some(new) = self.start.and_then(roll) {
            self.start = Some(new);
            changed = true;
        }
        if let Some(new) = self.stop.and_then(roll) {
            self.stop = Some(new);
            changed = true;
        }
        changed
    }
}

/// SoC gate: charging may start while the car is below the limit.
/// Unknown SoC or an unset limit never blocks.
pub fn soc_allows_start(soc_percent: Option<f64>, limit_percent: Option<u8>) -> bool {
    match (soc_percent, limit_percent) {
        (Some(soc), Some(limit)) => soc < f64::from(limit),
        _ => true,
    }
}

/// Next local midnight strictly after `now`
pub fn next_local_midnight(tz: Tz, now: DateTime<Utc>) -> DateTime<Utc> {
    let mut day = now.with_timezone(&tz).date_naive();
    for _ in 0..3 {
        day = day.checked_add_days(Days::new(1)).unwrap_or(day);
        if let Some(dt) = tz
            .from_local_datetime(&day.and_time(NaiveTime::MIN))
            .earliest()
        {
            let utc = dt.with_timezone(&Utc);
            if utc > now {
                return utc;
            }
        }
    }
    now + chrono::Duration::hours(24)
}

pub fn clamp_net_power_target(value: i64) -> i32 {
    value.clamp(
        i64::from(NET_POWER_TARGET_MIN_W),
        i64::from(NET_POWER_TARGET_MAX_W),
    ) as i32
}

pub fn clamp_ext_import_limit(value: i64) -> u32 {
    value.clamp(0, i64::from(EXT_IMPORT_LIMIT_MAX_W)) as u32
}

pub fn clamp_soc_limit(value: Option<i64>) -> Option<u8> {
    value.map(|v| v.clamp(0, 100) as u8)
}
