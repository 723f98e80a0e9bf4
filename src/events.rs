//! Event bus shared by all controllers
//!
//! Carries the events this integration produces for sibling controllers and
//! external automations. Sensor changes arrive separately as [`StateChange`]
//! values routed by the supervisor.

use crate::phase::{PhaseProfile, SwitchSource};
use crate::sensor::EntityState;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, trace};

const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Events fired on the bus
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event_type", content = "data")]
pub enum BusEvent {
    /// Global priority state changed; every controller re-runs its gates
    #[serde(rename = "evcm_priority_refresh")]
    PriorityRefresh,
    /// Downstream automation should perform the physical relay switch
    #[serde(rename = "evcm_phase_switch_request")]
    PhaseSwitchRequest {
        entry_id: String,
        target: PhaseProfile,
        source: SwitchSource,
    },
    /// Planner dates were moved by the midnight rollover
    #[serde(rename = "evcm_planner_datetime_updated")]
    PlannerDatetimeUpdated { entry_id: String },
}

impl BusEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::PriorityRefresh => "evcm_priority_refresh",
            Self::PhaseSwitchRequest { .. } => "evcm_phase_switch_request",
            Self::PlannerDatetimeUpdated { .. } => "evcm_planner_datetime_updated",
        }
    }
}

/// Upstream sensor change (old/new state pair)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    pub entity_id: String,
    #[serde(default)]
    pub old_state: Option<EntityState>,
    #[serde(default)]
    pub new_state: Option<EntityState>,
}

/// Broadcast bus; cloning shares the same channel
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BusEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        trace!("Subscribing to event bus");
        self.tx.subscribe()
    }

    /// Fire an event to all subscribers
    pub fn fire(&self, event: BusEvent) {
        debug!(event_type = event.event_type(), "Firing event");
        // No receivers is not an error
        let _ = self.tx.send(event);
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
