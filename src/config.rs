//! Configuration management for evcm
//!
//! This module handles loading and validation of the application configuration
//! from YAML files. Each charger is described by a [`ControllerConfig`] which is
//! validated once at load time and then shared read-only (`Arc`) with its
//! controller; changing it requires a reload.

use crate::error::{EvcmError, Result};
use chrono_tz::Tz;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

mod defaults;
mod profile;

pub use profile::{ProfileSpec, SupplyProfile};

/// Hardware floor for the current setting
pub const MIN_CURRENT_A: u8 = 6;
/// Hardware ceiling for the current setting
pub const MAX_CURRENT_A: u8 = 32;
/// Accepted magnitude for any threshold value
pub const THRESHOLD_LIMIT_W: i32 = 25_000;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct AppConfig {
    /// IANA timezone used for planner windows and midnight rollover
    pub timezone: String,

    /// Directory holding persisted controller and priority state
    pub storage_dir: String,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Global priority arbitration defaults
    pub priority: PriorityConfig,

    /// One entry per managed charger
    pub chargers: Vec<ControllerConfig>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    pub level: String,

    /// Directory or file path for rotated log files; console only when unset
    pub file: Option<String>,

    /// Number of rotated files to keep
    pub backup_count: u32,

    /// Whether to log to the console (stderr; stdout carries the bridge protocol)
    pub console_output: bool,

    /// Whether to use JSON format
    pub json_format: bool,
}

/// Priority arbitration defaults
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct PriorityConfig {
    /// Initial value of the global priority mode switch when nothing is persisted yet
    pub mode_enabled: bool,
}

/// How the grid flow is measured
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum GridConfig {
    /// One signed sensor, positive = export
    Single { net_power: String },
    /// Separate non-negative import and export sensors
    Split {
        import_power: String,
        export_power: String,
    },
}

/// Entity references for one charger
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct EntityConfig {
    /// Cable connected binary sensor
    pub cable: String,
    /// Charging enable switch (`switch.*`)
    pub charging_enable: String,
    /// Current setting number (`number.*`)
    pub current_setting: Option<String>,
    /// Connector lock (`lock.*`)
    pub lock: Option<String>,
    /// Wallbox status sensor
    pub wallbox_status: Option<String>,
    /// Charge power sensor (W)
    pub charge_power: Option<String>,
    /// Vehicle state of charge sensor (%)
    pub soc: Option<String>,
}

/// One hysteresis threshold set (W, positive = export)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ThresholdSet {
    pub eco_on_upper: i32,
    pub eco_on_lower: i32,
    pub eco_off_upper: i32,
    pub eco_off_lower: i32,
}

/// Who performs the physical phase switch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PhaseControlMode {
    /// This controller requests switches via the bus event
    Integration,
    /// The wallbox switches on its own; requests are rejected
    Wallbox,
}

/// Phase switching support
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct PhaseSwitchConfig {
    pub control_mode: PhaseControlMode,
    /// Sensor reporting the active phase count ("1"/"3", "1p"/"3p")
    pub feedback_entity: Option<String>,
    /// Profile in effect while the wallbox runs single phase
    pub single_phase_profile: SupplyProfile,
    pub cooldown_s: u64,
    pub veto_s: u64,
    pub wait_for_stop_s: u64,
    pub stopped_power_w: u32,
    pub feedback_timeout_s: u64,
    /// Sustain delay for automatic switching (minutes, 15..=60)
    pub auto_delay_min: u64,
    /// Interruption tolerated by the 1p to 3p candidate before it resets
    pub auto_reset_grace_s: u64,
    /// Headroom above the three-phase upper threshold required to switch up
    pub upshift_margin_w: u32,
}

/// What happens to a below-lower claim that never recovers
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ReclaimPolicy {
    /// Seconds after which the claim is released to other chargers. Unset keeps it indefinitely.
    pub timeout_s: Option<u64>,
}

/// Immutable per-charger configuration
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ControllerConfig {
    /// Stable identifier, used for persistence keys and priority order
    pub id: String,
    /// Display name, used for default priority ordering
    pub name: String,
    pub grid: GridConfig,
    pub entities: EntityConfig,
    pub supply_profile: SupplyProfile,
    pub thresholds: ThresholdSet,
    /// Lower-magnitude thresholds used while single phase operation is confirmed
    pub alternate_thresholds: ThresholdSet,
    pub scan_interval_s: u64,
    pub sustain_s: u64,
    pub upper_debounce_s: u64,
    pub max_current_a: u8,
    pub phase_switch: Option<PhaseSwitchConfig>,
    pub reclaim: ReclaimPolicy,
}

/// A single field-level validation failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationIssue {
    pub field: String,
    pub code: &'static str,
}

impl ValidationIssue {
    fn new(field: impl Into<String>, code: &'static str) -> Self {
        Self {
            field: field.into(),
            code,
        }
    }
}

impl ThresholdSet {
    /// Validation codes for this set, with field names prefixed by `prefix`
    pub fn issues(&self, prefix: &str, min_band_w: u32) -> Vec<ValidationIssue> {
        let mut out = Vec::new();
        let field = |name: &str| {
            if prefix.is_empty() {
                name.to_string()
            } else {
                format!("{prefix}.{name}")
            }
        };
        let values = [
            ("eco_on_upper", self.eco_on_upper),
            ("eco_on_lower", self.eco_on_lower),
            ("eco_off_upper", self.eco_off_upper),
            ("eco_off_lower", self.eco_off_lower),
        ];
        for (name, v) in values {
            if !(-THRESHOLD_LIMIT_W..=THRESHOLD_LIMIT_W).contains(&v) {
                out.push(ValidationIssue::new(field(name), "value_out_of_range"));
            }
        }
        if !out.is_empty() {
            return out;
        }

        let band = i64::from(min_band_w);
        if self.eco_on_lower >= self.eco_on_upper {
            out.push(ValidationIssue::new(field("eco_on_lower"), "lower_above_upper"));
        } else if i64::from(self.eco_on_upper) - i64::from(self.eco_on_lower) < band {
            out.push(ValidationIssue::new(field("eco_on_upper"), "eco_on_band_small"));
        }
        if self.eco_off_lower >= self.eco_off_upper {
            out.push(ValidationIssue::new(field("eco_off_lower"), "lower_above_upper"));
        } else if i64::from(self.eco_off_upper) - i64::from(self.eco_off_lower) < band {
            out.push(ValidationIssue::new(field("eco_off_upper"), "eco_off_band_small"));
        }
        if self.eco_on_upper <= self.eco_off_upper {
            out.push(ValidationIssue::new(field("eco_on_upper"), "must_exceed_off_upper"));
        }
        if self.eco_on_lower <= self.eco_off_lower {
            out.push(ValidationIssue::new(field("eco_on_lower"), "must_exceed_off_lower"));
        }
        out
    }

    /// (upper, lower) for the given eco mode
    pub const fn pair(&self, eco: bool) -> (i32, i32) {
        if eco {
            (self.eco_on_upper, self.eco_on_lower)
        } else {
            (self.eco_off_upper, self.eco_off_lower)
        }
    }
}

fn check_domain(
    out: &mut Vec<ValidationIssue>,
    field: &str,
    entity: Option<&str>,
    domain: &str,
    required: bool,
) {
    match entity {
        Some(e) if !e.trim().is_empty() => {
            let ok = e
                .split_once('.')
                .is_some_and(|(d, rest)| d == domain && !rest.is_empty());
            if !ok {
                out.push(ValidationIssue::new(field, "invalid_domain"));
            }
        }
        _ if required => out.push(ValidationIssue::new(field, "missing_entity")),
        _ => {}
    }
}

impl ControllerConfig {
    /// Collect every validation problem; empty means the config is usable
    pub fn validation_issues(&self) -> Vec<ValidationIssue> {
        let mut out = Vec::new();

        if self.id.trim().is_empty() {
            out.push(ValidationIssue::new("id", "missing_value"));
        }

        match &self.grid {
            GridConfig::Single { net_power } if net_power.trim().is_empty() => {
                out.push(ValidationIssue::new("grid.net_power", "missing_entity"));
            }
            GridConfig::Split {
                import_power,
                export_power,
            } => {
                if import_power.trim().is_empty() {
                    out.push(ValidationIssue::new("grid.import_power", "missing_entity"));
                }
                if export_power.trim().is_empty() {
                    out.push(ValidationIssue::new("grid.export_power", "missing_entity"));
                }
            }
            GridConfig::Single { .. } => {}
        }

        if self.entities.cable.trim().is_empty() {
            out.push(ValidationIssue::new("entities.cable", "missing_entity"));
        }
        check_domain(
            &mut out,
            "entities.charging_enable",
            Some(self.entities.charging_enable.as_str()),
            "switch",
            true,
        );
        check_domain(
            &mut out,
            "entities.current_setting",
            self.entities.current_setting.as_deref(),
            "number",
            false,
        );
        check_domain(
            &mut out,
            "entities.lock",
            self.entities.lock.as_deref(),
            "lock",
            false,
        );

        out.extend(
            self.thresholds
                .issues("thresholds", self.supply_profile.spec().min_band_w),
        );
        if let Some(ps) = &self.phase_switch {
            out.extend(self.alternate_thresholds.issues(
                "alternate_thresholds",
                ps.single_phase_profile.spec().min_band_w,
            ));
        }

        if self.scan_interval_s < 15 || self.scan_interval_s > 3600 {
            out.push(ValidationIssue::new("scan_interval_s", "value_out_of_range"));
        }
        if !(30..=3600).contains(&self.sustain_s) {
            out.push(ValidationIssue::new("sustain_s", "value_out_of_range"));
        }
        if self.upper_debounce_s > 60 {
            out.push(ValidationIssue::new("upper_debounce_s", "value_out_of_range"));
        }
        if !(MIN_CURRENT_A..=MAX_CURRENT_A).contains(&self.max_current_a) {
            out.push(ValidationIssue::new("max_current_a", "value_out_of_range"));
        }

        if let Some(ps) = &self.phase_switch {
            if !(15..=60).contains(&ps.auto_delay_min) {
                out.push(ValidationIssue::new(
                    "phase_switch.auto_delay_min",
                    "value_out_of_range",
                ));
            }
            if ps.single_phase_profile.is_three_phase() {
                out.push(ValidationIssue::new(
                    "phase_switch.single_phase_profile",
                    "invalid_profile",
                ));
            }
            if ps.control_mode == PhaseControlMode::Integration && ps.feedback_entity.is_none() {
                out.push(ValidationIssue::new(
                    "phase_switch.feedback_entity",
                    "missing_entity",
                ));
            }
        }

        if self.reclaim.timeout_s == Some(0) {
            out.push(ValidationIssue::new("reclaim.timeout_s", "value_out_of_range"));
        }

        out
    }

    /// Validate, returning the first issue as an error
    pub fn validate(&self) -> Result<()> {
        match self.validation_issues().into_iter().next() {
            Some(issue) => Err(EvcmError::validation(
                format!("{}.{}", self.id, issue.field),
                issue.code,
            )),
            None => Ok(()),
        }
    }

    /// Every entity whose state changes this charger reacts to
    pub fn watched_entities(&self) -> Vec<String> {
        let mut out = vec![
            self.entities.cable.clone(),
            self.entities.charging_enable.clone(),
        ];
        match &self.grid {
            GridConfig::Single { net_power } => out.push(net_power.clone()),
            GridConfig::Split {
                import_power,
                export_power,
            } => {
                out.push(import_power.clone());
                out.push(export_power.clone());
            }
        }
        let optional = [
            &self.entities.current_setting,
            &self.entities.lock,
            &self.entities.wallbox_status,
            &self.entities.charge_power,
            &self.entities.soc,
        ];
        out.extend(optional.into_iter().flatten().cloned());
        if let Some(fb) = self
            .phase_switch
            .as_ref()
            .and_then(|p| p.feedback_entity.clone())
        {
            out.push(fb);
        }
        out.retain(|e| !e.is_empty());
        out.sort();
        out.dedup();
        out
    }

    pub fn max_current(&self) -> u8 {
        self.max_current_a.clamp(MIN_CURRENT_A, MAX_CURRENT_A)
    }

    pub const fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_s)
    }

    pub const fn sustain(&self) -> Duration {
        Duration::from_secs(self.sustain_s)
    }

    pub const fn upper_debounce(&self) -> Duration {
        Duration::from_secs(self.upper_debounce_s)
    }

    /// Display name, falling back to the id
    pub fn display_name(&self) -> &str {
        let n = self.name.trim();
        if n.is_empty() { self.id.as_str() } else { n }
    }
}

impl AppConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    /// Load from an explicit path or the default locations, falling back to defaults
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }

        let default_paths = [
            "evcm_config.yaml",
            "/data/evcm_config.yaml",
            "/etc/evcm/config.yaml",
        ];

        for path in &default_paths {
            if Path::new(path).exists() {
                return Self::from_file(path);
            }
        }

        Ok(Self::default())
    }

    /// Save configuration to a YAML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// Parsed timezone
    pub fn tz(&self) -> Result<Tz> {
        self.timezone
            .parse::<Tz>()
            .map_err(|_| EvcmError::validation("timezone", "unknown_timezone"))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.tz()?;

        if self.storage_dir.trim().is_empty() {
            return Err(EvcmError::validation("storage_dir", "missing_value"));
        }

        let mut seen = HashSet::new();
        for charger in &self.chargers {
            if !seen.insert(charger.id.as_str()) {
                return Err(EvcmError::validation(
                    format!("chargers.{}", charger.id),
                    "duplicate_id",
                ));
            }
            charger.validate()?;
        }
        Ok(())
    }
}

/// JSON schema of the configuration file, for external configuration tooling
pub fn config_schema() -> serde_json::Value {
    let schema = schemars::schema_for!(AppConfig);
    serde_json::to_value(&schema).unwrap_or(serde_json::Value::Null)
}
