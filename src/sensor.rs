//! Sensor adapter: reads external entity state for one charger
//!
//! Unknown and unavailable states are plain `None` values. They are reported
//! through [`UnknownReporter`], which is silent during startup and debounces
//! per entity and context afterwards.

use crate::config::{ControllerConfig, GridConfig};
use crate::phase::PhaseProfile;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

/// Charge power above which the car is considered to be drawing current
pub const CHARGING_DETECTED_POWER_W: f64 = 100.0;
/// Unknown-state reports for the same entity and context are this far apart at least
pub const UNKNOWN_DEBOUNCE: Duration = Duration::from_secs(30);
/// No unknown-state reports this soon after startup
pub const UNKNOWN_STARTUP_GRACE: Duration = Duration::from_secs(90);

/// Raw state of one entity as reported by the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityState {
    pub state: String,
}

impl EntityState {
    pub fn new(state: impl Into<String>) -> Self {
        Self {
            state: state.into(),
        }
    }

    /// False for "unknown", "unavailable" and empty states
    pub fn is_known(&self) -> bool {
        !matches!(self.state.trim(), "" | "unknown" | "unavailable")
    }

    pub fn value(&self) -> Option<&str> {
        self.is_known().then_some(self.state.trim())
    }

    pub fn as_f64(&self) -> Option<f64> {
        self.value()?.parse::<f64>().ok().filter(|v| v.is_finite())
    }

    pub fn is_on(&self) -> Option<bool> {
        match self.value()? {
            "on" => Some(true),
            "off" => Some(false),
            _ => None,
        }
    }
}

/// Read access to the host's entity states
pub trait StateStore: Send + Sync {
    fn get_state(&self, entity_id: &str) -> Option<EntityState>;
}

/// In-process state store fed by the bridge or by tests
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    states: RwLock<HashMap<String, EntityState>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set or clear (`None`) the state of an entity
    pub fn set(&self, entity_id: &str, state: Option<&str>) {
        let mut map = self.states.write().unwrap_or_else(PoisonError::into_inner);
        match state {
            Some(s) => {
                map.insert(entity_id.to_string(), EntityState::new(s));
            }
            None => {
                map.remove(entity_id);
            }
        }
    }

    /// Apply a state and return the previous one
    pub fn apply(&self, entity_id: &str, state: Option<EntityState>) -> Option<EntityState> {
        let mut map = self.states.write().unwrap_or_else(PoisonError::into_inner);
        match state {
            Some(s) => map.insert(entity_id.to_string(), s),
            None => map.remove(entity_id),
        }
    }
}

impl StateStore for MemoryStateStore {
    fn get_state(&self, entity_id: &str) -> Option<EntityState> {
        self.states
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(entity_id)
            .cloned()
    }
}

/// Debounced diagnostics for unknown/unavailable states
#[derive(Debug)]
pub struct UnknownReporter {
    started: Instant,
    last_emit: HashMap<(String, String), Instant>,
}

impl UnknownReporter {
    pub fn new(started: Instant) -> Self {
        Self {
            started,
            last_emit: HashMap::new(),
        }
    }

    /// Whether a report for this entity and context should be emitted now
    pub fn should_report(&mut self, entity_id: &str, context: &str, now: Instant) -> bool {
        if now.saturating_duration_since(self.started) < UNKNOWN_STARTUP_GRACE {
            return false;
        }
        let key = (entity_id.to_string(), context.to_string());
        if let Some(last) = self.last_emit.get(&key)
            && now.saturating_duration_since(*last) < UNKNOWN_DEBOUNCE
        {
            return false;
        }
        self.last_emit.insert(key, now);
        true
    }

    pub fn report(
        &mut self,
        charger_id: &str,
        entity_id: &str,
        raw: Option<&str>,
        context: &str,
        now: Instant,
    ) {
        if self.should_report(entity_id, context, now) {
            warn!(
                charger = charger_id,
                entity = entity_id,
                state = raw.unwrap_or("none"),
                context,
                "Unknown/unavailable sensor state"
            );
        }
    }
}

/// One consistent snapshot of everything the controller reads
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Readings {
    /// Signed grid flow, positive = export
    pub net_power_w: Option<f64>,
    pub charge_power_w: Option<f64>,
    pub wallbox_status: Option<String>,
    /// Unknown cable state counts as disconnected
    pub cable_connected: bool,
    pub cable_known: bool,
    pub charging_enable: Option<bool>,
    /// `None` when no lock is configured or its state is unknown
    pub lock_locked: Option<bool>,
    pub soc_percent: Option<f64>,
    pub current_setting_a: Option<u8>,
    pub phase_feedback: Option<PhaseProfile>,
    /// Which essential components are missing ("net", "status", "charge_power")
    pub missing: Vec<&'static str>,
}

impl Readings {
    pub fn essential_data_available(&self) -> bool {
        self.missing.is_empty()
    }

    pub fn status_charging(&self) -> bool {
        self.wallbox_status
            .as_deref()
            .is_some_and(|s| s.trim().eq_ignore_ascii_case("charging"))
    }

    /// Status says charging or the car draws more than 100 W
    pub fn charging_detected(&self) -> bool {
        self.status_charging()
            || self
                .charge_power_w
                .is_some_and(|p| p > CHARGING_DETECTED_POWER_W)
    }

    pub fn is_enabled(&self) -> bool {
        self.charging_enable == Some(true)
    }

    pub fn is_unlocked(&self) -> bool {
        self.lock_locked == Some(false)
    }
}

/// Reads the entities of one charger
pub struct SensorAdapter {
    config: Arc<ControllerConfig>,
    store: Arc<dyn StateStore>,
    reporter: UnknownReporter,
}

impl SensorAdapter {
    pub fn new(config: Arc<ControllerConfig>, store: Arc<dyn StateStore>, started: Instant) -> Self {
        Self {
            config,
            store,
            reporter: UnknownReporter::new(started),
        }
    }

    pub fn reporter_mut(&mut self) -> &mut UnknownReporter {
        &mut self.reporter
    }

    fn get(&mut self, entity_id: &str, context: &str, now: Instant) -> Option<EntityState> {
        let st = self.store.get_state(entity_id);
        match &st {
            Some(s) if s.is_known() => st,
            other => {
                let raw = other.as_ref().map(|s| s.state.clone());
                self.reporter
                    .report(&self.config.id, entity_id, raw.as_deref(), context, now);
                None
            }
        }
    }

    fn float(&mut self, entity_id: &str, context: &str, now: Instant) -> Option<f64> {
        self.get(entity_id, context, now)?.as_f64()
    }

    pub fn net_power_w(&mut self, now: Instant) -> Option<f64> {
        match self.config.grid.clone() {
            GridConfig::Single { net_power } => self.float(&net_power, "net_power_get", now),
            GridConfig::Split {
                import_power,
                export_power,
            } => {
                let exp = self.float(&export_power, "export_get", now)?;
                let imp = self.float(&import_power, "import_get", now)?;
                Some(exp.max(0.0) - imp.max(0.0))
            }
        }
    }

    /// Read every configured entity
    pub fn read(&mut self, now: Instant) -> Readings {
        let entities = self.config.entities.clone();
        let mut r = Readings {
            net_power_w: self.net_power_w(now),
            ..Readings::default()
        };

        if let Some(id) = &entities.charge_power {
            r.charge_power_w = self.float(id, "charge_power_get", now);
        }
        if let Some(id) = &entities.wallbox_status {
            r.wallbox_status = self
                .get(id, "status_get", now)
                .map(|s| s.state.trim().to_string());
        }
        let cable = self.get(&entities.cable, "cable_get", now);
        r.cable_known = cable.is_some();
        r.cable_connected = cable.and_then(|s| s.is_on()).unwrap_or(false);
        r.charging_enable = self
            .get(&entities.charging_enable, "enable_get", now)
            .and_then(|s| s.is_on());
        if let Some(id) = &entities.lock {
            r.lock_locked = self.get(id, "lock_get", now).and_then(|s| {
                match s.state.trim().to_ascii_lowercase().as_str() {
                    "locked" => Some(true),
                    "unlocked" => Some(false),
                    _ => None,
                }
            });
        }
        if let Some(id) = &entities.soc {
            r.soc_percent = self
                .float(id, "soc_get", now)
                .filter(|v| (0.0..=110.0).contains(v));
        }
        if let Some(id) = &entities.current_setting {
            r.current_setting_a = self
                .float(id, "current_get", now)
                .map(|v| v.round().clamp(0.0, 255.0) as u8);
        }
        if let Some(fb) = self
            .config
            .phase_switch
            .as_ref()
            .and_then(|p| p.feedback_entity.clone())
        {
            r.phase_feedback = self
                .get(&fb, "phase_feedback_get", now)
                .and_then(|s| PhaseProfile::parse_feedback(&s.state));
        }

        if r.net_power_w.is_none() {
            r.missing.push("net");
        }
        if entities.wallbox_status.is_some() && r.wallbox_status.is_none() {
            r.missing.push("status");
        }
        if entities.charge_power.is_some() && r.charge_power_w.is_none() {
            r.missing.push("charge_power");
        }
        r
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EntityConfig;

    fn config(grid: GridConfig) -> Arc<ControllerConfig> {
        Arc::new(ControllerConfig {
            id: "garage".into(),
            grid,
            entities: EntityConfig {
                cable: "binary_sensor.cable".into(),
                charging_enable: "switch.enable".into(),
                wallbox_status: Some("sensor.status".into()),
                charge_power: Some("sensor.power".into()),
                soc: Some("sensor.soc".into()),
                ..EntityConfig::default()
            },
            ..ControllerConfig::default()
        })
    }

    #[test]
    fn unknown_states_are_none() {
        assert!(!EntityState::new("unavailable").is_known());
        assert!(!EntityState::new("unknown").is_known());
        assert_eq!(EntityState::new("12.5").as_f64(), Some(12.5));
        assert_eq!(EntityState::new("abc").as_f64(), None);
        assert_eq!(EntityState::new("on").is_on(), Some(true));
    }

    #[test]
    fn split_grid_clamps_and_requires_both() {
        let store = Arc::new(MemoryStateStore::new());
        let cfg = config(GridConfig::Split {
            import_power: "sensor.import".into(),
            export_power: "sensor.export".into(),
        });
        let mut adapter = SensorAdapter::new(cfg, store.clone(), Instant::now());
        store.set("sensor.export", Some("3000"));
        assert_eq!(adapter.net_power_w(Instant::now()), None);
        store.set("sensor.import", Some("-20"));
        assert_eq!(adapter.net_power_w(Instant::now()), Some(3000.0));
        store.set("sensor.import", Some("500"));
        assert_eq!(adapter.net_power_w(Instant::now()), Some(2500.0));
    }

    #[test]
    fn missing_components_follow_configuration() {
        let store = Arc::new(MemoryStateStore::new());
        let cfg = config(GridConfig::Single {
            net_power: "sensor.net".into(),
        });
        let mut adapter = SensorAdapter::new(cfg, store.clone(), Instant::now());
        let r = adapter.read(Instant::now());
        assert_eq!(r.missing, vec!["net", "status", "charge_power"]);
        assert!(!r.cable_connected);

        store.set("sensor.net", Some("100"));
        store.set("sensor.status", Some("Charging"));
        store.set("sensor.power", Some("150"));
        store.set("sensor.soc", Some("140"));
        store.set("binary_sensor.cable", Some("on"));
        let r = adapter.read(Instant::now());
        assert!(r.essential_data_available());
        assert!(r.charging_detected());
        assert!(r.cable_connected);
        assert_eq!(r.soc_percent, None);
    }

    #[test]
    fn reporter_respects_grace_and_debounce() {
        let start = Instant::now();
        let mut rep = UnknownReporter::new(start);
        assert!(!rep.should_report("sensor.net", "get", start + Duration::from_secs(10)));
        let t = start + Duration::from_secs(91);
        assert!(rep.should_report("sensor.net", "get", t));
        assert!(!rep.should_report("sensor.net", "get", t + Duration::from_secs(29)));
        assert!(rep.should_report("sensor.net", "other", t + Duration::from_secs(1)));
        assert!(rep.should_report("sensor.net", "get", t + Duration::from_secs(30)));
    }
}
