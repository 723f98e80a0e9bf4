//! Outbound collaborators: service calls and user notifications

use crate::error::{EvcmError, Result};
use crate::sensor::MemoryStateStore;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Minimum spacing between two opposite charging-enable commands
pub const MIN_TOGGLE_INTERVAL: Duration = Duration::from_millis(500);

/// One service call towards a downstream device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceCall {
    pub domain: String,
    pub service: String,
    pub entity_id: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub params: serde_json::Value,
}

impl ServiceCall {
    pub fn new(domain: &str, service: &str, entity_id: &str) -> Self {
        Self {
            domain: domain.to_string(),
            service: service.to_string(),
            entity_id: entity_id.to_string(),
            params: serde_json::Value::Null,
        }
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }
}

/// Executes service calls (`switch.turn_on`, `number.set_value`, `lock.unlock`, ...)
#[async_trait]
pub trait CommandDispatcher: Send + Sync {
    async fn call(&self, call: ServiceCall) -> Result<()>;
}

/// Persistent, dismissable user notifications keyed by a stable id
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, id: &str, title: &str, message: &str) -> Result<()>;
    async fn dismiss(&self, id: &str) -> Result<()>;
}

/// Serializes charging-enable commands for one switch entity.
///
/// Identical consecutive commands are dropped when the observed state already
/// matches, and an opposite command is delayed until [`MIN_TOGGLE_INTERVAL`]
/// has passed since the previous one.
#[derive(Debug)]
pub struct EnableWriter {
    entity_id: String,
    last: Option<(bool, Instant)>,
}

impl EnableWriter {
    pub fn new(entity_id: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            last: None,
        }
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    /// Last commanded value, if any
    pub fn last_command(&self) -> Option<bool> {
        self.last.map(|(on, _)| on)
    }

    /// Drive the switch towards `on`; returns whether a call was issued
    pub async fn set(
        &mut self,
        dispatcher: &dyn CommandDispatcher,
        observed: Option<bool>,
        on: bool,
    ) -> Result<bool> {
        if observed == Some(on) {
            return Ok(false);
        }
        if let Some((prev, at)) = self.last
            && prev != on
        {
            let ready = at + MIN_TOGGLE_INTERVAL;
            if Instant::now() < ready {
                debug!(entity = %self.entity_id, "Delaying opposite enable command");
                tokio::time::sleep_until(ready).await;
            }
        }
        let service = if on { "turn_on" } else { "turn_off" };
        let result = dispatcher
            .call(ServiceCall::new("switch", service, &self.entity_id))
            .await;
        self.last = Some((on, Instant::now()));
        result.map(|()| true)
    }
}

/// Dispatcher that records calls and optionally mirrors their effect into a
/// [`MemoryStateStore`], for tests and dry runs
#[derive(Debug, Default)]
pub struct RecordingDispatcher {
    calls: Mutex<Vec<ServiceCall>>,
    notifications: Mutex<Vec<(String, String)>>,
    mirror: Option<Arc<MemoryStateStore>>,
    fail_services: Mutex<Vec<String>>,
}

impl RecordingDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply switch/lock/number effects to `store` as a device would
    pub fn mirroring(store: Arc<MemoryStateStore>) -> Self {
        Self {
            mirror: Some(store),
            ..Self::default()
        }
    }

    /// Make calls to `domain.service` fail
    pub fn fail_service(&self, domain_service: &str) {
        self.fail_services
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(domain_service.to_string());
    }

    pub fn calls(&self) -> Vec<ServiceCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn take_calls(&self) -> Vec<ServiceCall> {
        std::mem::take(&mut *self.calls.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// (id, message) of active notifications
    pub fn notifications(&self) -> Vec<(String, String)> {
        self.notifications
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl CommandDispatcher for RecordingDispatcher {
    async fn call(&self, call: ServiceCall) -> Result<()> {
        let key = format!("{}.{}", call.domain, call.service);
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call.clone());
        if self
            .fail_services
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&key)
        {
            return Err(EvcmError::command(format!("{key} failed")));
        }
        if let Some(store) = &self.mirror {
            let state = match key.as_str() {
                "switch.turn_on" => Some("on".to_string()),
                "switch.turn_off" => Some("off".to_string()),
                "lock.lock" => Some("locked".to_string()),
                "lock.unlock" => Some("unlocked".to_string()),
                "number.set_value" => call.params.get("value").map(|v| v.to_string()),
                _ => None,
            };
            if let Some(s) = state {
                store.set(&call.entity_id, Some(&s));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Notifier for RecordingDispatcher {
    async fn notify(&self, id: &str, _title: &str, message: &str) -> Result<()> {
        let mut list = self
            .notifications
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        list.retain(|(existing, _)| existing != id);
        list.push((id.to_string(), message.to_string()));
        Ok(())
    }

    async fn dismiss(&self, id: &str) -> Result<()> {
        self.notifications
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(existing, _)| existing != id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::StateStore;

    #[tokio::test]
    async fn enable_writer_skips_matching_state() {
        let d = RecordingDispatcher::new();
        let mut w = EnableWriter::new("switch.enable");
        assert!(!w.set(&d, Some(true), true).await.unwrap());
        assert!(w.set(&d, Some(false), true).await.unwrap());
        assert_eq!(d.calls()[0].service, "turn_on");
    }

    #[tokio::test(start_paused = true)]
    async fn enable_writer_spaces_opposite_commands() {
        let d = RecordingDispatcher::new();
        let mut w = EnableWriter::new("switch.enable");
        let t0 = Instant::now();
        w.set(&d, None, true).await.unwrap();
        w.set(&d, None, false).await.unwrap();
        assert!(Instant::now() - t0 >= MIN_TOGGLE_INTERVAL);
        assert_eq!(w.last_command(), Some(false));
    }

    #[tokio::test]
    async fn mirroring_updates_state_store() {
        let store = Arc::new(MemoryStateStore::new());
        let d = RecordingDispatcher::mirroring(store.clone());
        d.call(
            ServiceCall::new("number", "set_value", "number.current")
                .with_params(serde_json::json!({"value": 6})),
        )
        .await
        .unwrap();
        d.call(ServiceCall::new("lock", "unlock", "lock.cable"))
            .await
            .unwrap();
        assert_eq!(store.get_state("number.current").unwrap().state, "6");
        assert_eq!(store.get_state("lock.cable").unwrap().state, "unlocked");
    }

    #[tokio::test]
    async fn failing_service_is_recorded_and_errors() {
        let d = RecordingDispatcher::new();
        d.fail_service("switch.turn_on");
        let err = d
            .call(ServiceCall::new("switch", "turn_on", "switch.x"))
            .await
            .unwrap_err();
        assert!(matches!(err, EvcmError::Command { .. }));
        assert_eq!(d.calls().len(), 1);
    }
}
