//! Owns every controller of an installation
//!
//! The supervisor loads the shared priority arbiter, spawns one controller
//! task per configured charger and routes upstream state changes to the
//! controllers watching the entity. The state store is updated before a
//! change is routed, so a controller always reads the new value.

use crate::config::AppConfig;
use crate::controller::{
    ControllerHandle, ControllerServices, ControllerStatus, UserCommand, spawn_controller,
};
use crate::dispatch::{CommandDispatcher, Notifier};
use crate::error::{EvcmError, Result};
use crate::events::{EventBus, StateChange};
use crate::logging::{StructuredLogger, get_logger};
use crate::persistence::{KeyValueStore, PersistenceManager};
use crate::priority::{PriorityArbiter, PrioritySnapshot};
use crate::sensor::{EntityState, MemoryStateStore};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

pub struct Supervisor {
    store: Arc<MemoryStateStore>,
    services: ControllerServices,
    handles: BTreeMap<String, ControllerHandle>,
    routes: HashMap<String, Vec<String>>,
    logger: StructuredLogger,
}

impl Supervisor {
    /// Validate the configuration and start every charger
    pub async fn start(
        config: &AppConfig,
        store: Arc<MemoryStateStore>,
        dispatcher: Arc<dyn CommandDispatcher>,
        notifier: Arc<dyn Notifier>,
        kv: Arc<dyn KeyValueStore>,
    ) -> Result<Self> {
        config.validate()?;
        let tz = config.tz()?;
        let logger = get_logger("supervisor");
        let bus = EventBus::new();
        let arbiter = PriorityArbiter::load(kv.clone(), bus, config.priority.mode_enabled).await;
        let services = ControllerServices {
            store: store.clone(),
            dispatcher,
            notifier,
            kv,
            arbiter,
            tz,
        };

        let mut sup = Self {
            store,
            services,
            handles: BTreeMap::new(),
            routes: HashMap::new(),
            logger,
        };
        for cfg in &config.chargers {
            let handle = spawn_controller(Arc::new(cfg.clone()), sup.services.clone()).await?;
            for entity in cfg.watched_entities() {
                sup.routes.entry(entity).or_default().push(cfg.id.clone());
            }
            sup.handles.insert(cfg.id.clone(), handle);
        }
        sup.services.arbiter.cleanup_if_removed();
        sup.services.arbiter.align_current_with_order();
        sup.logger.info(&format!(
            "Started {} charger(s), priority mode {}",
            sup.handles.len(),
            if sup.services.arbiter.priority_mode_enabled() {
                "on"
            } else {
                "off"
            }
        ));
        Ok(sup)
    }

    pub const fn arbiter(&self) -> &PriorityArbiter {
        &self.services.arbiter
    }

    pub fn bus(&self) -> &EventBus {
        self.services.arbiter.bus()
    }

    pub fn charger_ids(&self) -> Vec<String> {
        self.handles.keys().cloned().collect()
    }

    pub fn handle(&self, id: &str) -> Option<&ControllerHandle> {
        self.handles.get(id)
    }

    /// Record a new entity state and notify the controllers watching it.
    /// Returns how many controllers were notified.
    pub fn ingest_state(&self, entity_id: &str, new_state: Option<EntityState>) -> usize {
        let old_state = self.store.apply(entity_id, new_state.clone());
        if old_state == new_state {
            return 0;
        }
        let Some(ids) = self.routes.get(entity_id) else {
            return 0;
        };
        let change = StateChange {
            entity_id: entity_id.to_string(),
            old_state,
            new_state,
        };
        let mut notified = 0;
        for id in ids {
            if let Some(handle) = self.handles.get(id) {
                match handle.state_changed(change.clone()) {
                    Ok(()) => notified += 1,
                    Err(e) => self.logger.warn(&e.to_string()),
                }
            }
        }
        notified
    }

    pub fn command(&self, id: &str, cmd: UserCommand) -> Result<()> {
        self.handles
            .get(id)
            .ok_or_else(|| EvcmError::validation("charger", format!("unknown charger {id}")))?
            .command(cmd)
    }

    pub fn set_priority_mode(&self, enabled: bool) {
        self.services.arbiter.set_priority_mode_enabled(enabled);
    }

    pub fn set_priority_order(&self, order: &[String]) {
        self.services.arbiter.set_order(order);
    }

    /// Move one charger to a 1-based position in the priority order
    pub fn set_order_index(&self, id: &str, index: usize) -> Result<()> {
        if !self.handles.contains_key(id) {
            return Err(EvcmError::priority(format!("unknown charger {id}")));
        }
        self.services.arbiter.set_entry_order_index(id, index);
        Ok(())
    }

    pub fn priority(&self) -> PrioritySnapshot {
        self.services.arbiter.snapshot()
    }

    pub fn statuses(&self) -> Vec<Arc<ControllerStatus>> {
        self.handles.values().map(ControllerHandle::status).collect()
    }

    /// Stop a charger for good: its task, its arbiter entry and its stored state
    pub async fn remove_charger(&mut self, id: &str) -> Result<()> {
        let handle = self
            .handles
            .remove(id)
            .ok_or_else(|| EvcmError::validation("charger", format!("unknown charger {id}")))?;
        handle.shutdown().await;
        for ids in self.routes.values_mut() {
            ids.retain(|c| c != id);
        }
        self.routes.retain(|_, ids| !ids.is_empty());
        self.services.arbiter.unregister(id);
        PersistenceManager::new(self.services.kv.clone(), id)
            .remove()
            .await?;
        self.logger.info(&format!("Charger {id} removed"));
        Ok(())
    }

    /// Stop every controller and flush the priority record
    pub async fn shutdown(mut self) {
        let handles = std::mem::take(&mut self.handles);
        for (_, handle) in handles {
            handle.shutdown().await;
        }
        if let Err(e) = self.services.arbiter.flush().await {
            self.logger
                .warn(&format!("Failed to flush priority record: {e}"));
        }
        self.logger.info("Supervisor stopped");
    }
}
