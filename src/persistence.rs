//! Persistence layer for controller and priority state
//!
//! State is stored as versioned JSON blobs in a key-value store. Controllers
//! debounce their writes; this module only loads and saves.

use crate::controls::{DEFAULT_SOC_LIMIT_PERCENT, ModeFlags};
use crate::error::{EvcmError, Result};
use crate::logging::get_logger;
use crate::phase::{PhaseMode, PhaseProfile};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

/// Schema version written into every blob
pub const STATE_VERSION: u32 = 1;
/// Key of the global priority record
pub const GLOBAL_KEY: &str = "evcm_global";

/// Key of a controller's state blob
pub fn state_key(entry_id: &str) -> String {
    format!("evcm_state_{entry_id}")
}

/// Key-value blob storage
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<serde_json::Value>>;
    async fn save(&self, key: &str, value: &serde_json::Value) -> Result<()>;
    async fn remove(&self, key: &str) -> Result<()>;
}

/// One pretty-printed JSON file per key
pub struct JsonFileStore {
    dir: PathBuf,
    logger: crate::logging::StructuredLogger,
}

impl JsonFileStore {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            logger: get_logger("persistence"),
        }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() || key.contains(['/', '\\']) || key.starts_with('.') {
            return Err(EvcmError::storage(format!("Invalid storage key: {key}")));
        }
        Ok(self.dir.join(format!("{key}.json")))
    }
}

#[async_trait]
impl KeyValueStore for JsonFileStore {
    async fn load(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let path = self.path_for(key)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => {
                let value = serde_json::from_str(&contents)?;
                self.logger.debug(&format!("Loaded {}", path.display()));
                Ok(Some(value))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        let path = self.path_for(key)?;
        tokio::fs::create_dir_all(&self.dir).await?;
        let tmp = path.with_extension("json.tmp");
        let contents = serde_json::to_string_pretty(value)?;
        tokio::fs::write(&tmp, contents).await?;
        tokio::fs::rename(&tmp, &path).await?;
        self.logger.debug(&format!("Saved {}", path.display()));
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory store for tests and dry runs
#[derive(Debug, Default)]
pub struct MemoryStore {
    map: Mutex<HashMap<String, serde_json::Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.map
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn load(&self, key: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.get(key))
    }

    async fn save(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        self.map
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value.clone());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.map
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct Envelope<T> {
    version: u32,
    data: T,
}

/// Wrap a payload with the schema version
pub fn to_versioned<T: Serialize>(data: &T) -> Result<serde_json::Value> {
    Ok(serde_json::to_value(Envelope {
        version: STATE_VERSION,
        data,
    })?)
}

/// Unwrap a versioned payload; unknown versions are rejected
pub fn from_versioned<T: for<'de> Deserialize<'de>>(value: serde_json::Value) -> Result<T> {
    let env: Envelope<T> = serde_json::from_value(value)?;
    if env.version != STATE_VERSION {
        return Err(EvcmError::storage(format!(
            "Unsupported state version {}",
            env.version
        )));
    }
    Ok(env.data)
}

/// Phase switching state that survives restarts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistedPhaseState {
    pub mode: PhaseMode,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub cooldown_target: Option<PhaseProfile>,
    pub last_requested: Option<PhaseProfile>,
    pub up_candidate_since: Option<DateTime<Utc>>,
    pub down_candidate_since: Option<DateTime<Utc>>,
}

/// Durable per-controller state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistedState {
    pub modes: ModeFlags,
    pub planner_start: Option<DateTime<Utc>>,
    pub planner_stop: Option<DateTime<Utc>>,
    pub soc_limit_percent: Option<u8>,
    pub net_power_target_w: i32,
    pub auto_unlock_enabled: bool,
    /// 0 = no external import limit
    pub ext_import_limit_w: u32,
    pub external_off_latched: bool,
    pub phase: PersistedPhaseState,
}

impl Default for PersistedState {
    fn default() -> Self {
        Self {
            modes: ModeFlags::default(),
            planner_start: None,
            planner_stop: None,
            soc_limit_percent: Some(DEFAULT_SOC_LIMIT_PERCENT),
            net_power_target_w: 0,
            auto_unlock_enabled: true,
            ext_import_limit_w: 0,
            external_off_latched: false,
            phase: PersistedPhaseState::default(),
        }
    }
}

/// Loads and saves one controller's blob
pub struct PersistenceManager {
    store: Arc<dyn KeyValueStore>,
    key: String,
    logger: crate::logging::StructuredLogger,
}

impl PersistenceManager {
    pub fn new(store: Arc<dyn KeyValueStore>, entry_id: &str) -> Self {
        Self {
            store,
            key: state_key(entry_id),
            logger: get_logger("persistence"),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Load state, falling back to defaults when absent or unreadable.
    /// Returns the state and whether it was freshly created.
    pub async fn load(&self) -> (PersistedState, bool) {
        let raw = match self.store.load(&self.key).await {
            Ok(Some(v)) => v,
            Ok(None) => {
                self.logger
                    .info(&format!("No persisted state for {}, using defaults", self.key));
                return (PersistedState::default(), true);
            }
            Err(e) => {
                self.logger
                    .warn(&format!("Failed to read {}: {e}; using defaults", self.key));
                return (PersistedState::default(), true);
            }
        };
        match from_versioned::<PersistedState>(raw) {
            Ok(mut state) => {
                // Older blobs may carry no SoC limit
                if state.soc_limit_percent.is_none() {
                    state.soc_limit_percent = Some(DEFAULT_SOC_LIMIT_PERCENT);
                }
                if let Some(l) = state.soc_limit_percent {
                    state.soc_limit_percent = Some(l.min(100));
                }
                (state, false)
            }
            Err(e) => {
                self.logger
                    .warn(&format!("Discarding unreadable state {}: {e}", self.key));
                (PersistedState::default(), true)
            }
        }
    }

    pub async fn save(&self, state: &PersistedState) -> Result<()> {
        let value = to_versioned(state)?;
        self.store.save(&self.key, &value).await?;
        self.logger.debug("Saved controller state");
        Ok(())
    }

    pub async fn remove(&self) -> Result<()> {
        self.store.remove(&self.key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_first_run() {
        let s = PersistedState::default();
        assert!(s.modes.eco && s.modes.start_stop && s.modes.start_stop_reset);
        assert!(!s.modes.manual && !s.modes.planner);
        assert_eq!(s.soc_limit_percent, Some(80));
        assert_eq!(s.net_power_target_w, 0);
        assert!(s.auto_unlock_enabled);
    }

    #[test]
    fn test_envelope_version_checked() {
        let v = to_versioned(&PersistedState::default()).unwrap();
        assert_eq!(v["version"], 1);
        assert!(from_versioned::<PersistedState>(v).is_ok());
        let bad = serde_json::json!({"version": 7, "data": {}});
        assert!(from_versioned::<PersistedState>(bad).is_err());
    }

    #[tokio::test]
    async fn test_soc_limit_backfilled() {
        let store = Arc::new(MemoryStore::new());
        store
            .save(
                &state_key("a"),
                &serde_json::json!({"version": 1, "data": {"soc_limit_percent": null, "net_power_target_w": 250}}),
            )
            .await
            .unwrap();
        let pm = PersistenceManager::new(store, "a");
        let (state, fresh) = pm.load().await;
        assert!(!fresh);
        assert_eq!(state.soc_limit_percent, Some(80));
        assert_eq!(state.net_power_target_w, 250);
    }

    #[test]
    fn test_invalid_keys_rejected() {
        let store = JsonFileStore::new("/tmp");
        assert!(store.path_for("../etc").is_err());
        assert!(store.path_for("evcm_global").is_ok());
    }
}
