//! Global priority arbitration across chargers
//!
//! One [`PriorityArbiter`] is shared by every controller of an installation.
//! All reads and read-modify-write operations go through its internal lock,
//! so each operation is atomic with respect to the others. Every change to
//! the record or the pause map fires [`BusEvent::PriorityRefresh`] and queues
//! a coalesced write of the record.

use crate::error::Result;
use crate::events::{BusEvent, EventBus};
use crate::logging::{StructuredLogger, get_logger};
use crate::persistence::{GLOBAL_KEY, KeyValueStore, from_versioned, to_versioned};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;

/// Why a controller is paused, as seen by the arbiter
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    /// Not enough surplus; keeps its claim and reclaims on recovery
    BelowLower,
    /// Essential sensor data missing; surrenders its claim
    NoData,
}

/// Persisted global record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityRecord {
    pub current_entry_id: Option<String>,
    pub preferred_entry_id: Option<String>,
    pub order: Vec<String>,
    pub priority_mode_enabled: bool,
}

/// Live facts a controller reports so the arbiter can judge eligibility
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EligibilityFacts {
    pub cable_connected: bool,
    pub start_stop: bool,
    pub planner_allows: bool,
    pub soc_allows: bool,
}

impl EligibilityFacts {
    pub const fn all(&self) -> bool {
        self.cable_connected && self.start_stop && self.planner_allows && self.soc_allows
    }
}

/// Read-only view for status reporting
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PrioritySnapshot {
    pub priority_mode_enabled: bool,
    pub current_entry_id: Option<String>,
    pub preferred_entry_id: Option<String>,
    pub order: Vec<String>,
    pub pauses: BTreeMap<String, Vec<PauseReason>>,
}

#[derive(Debug, Clone)]
struct Entry {
    name: String,
    facts: EligibilityFacts,
}

struct Inner {
    record: PriorityRecord,
    entries: BTreeMap<String, Entry>,
    pauses: HashMap<String, BTreeSet<PauseReason>>,
    logger: StructuredLogger,
}

impl Inner {
    fn exists(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    fn name_of<'a>(&'a self, id: Option<&'a str>) -> &'a str {
        match id {
            Some(id) => self.entries.get(id).map_or(id, |e| e.name.as_str()),
            None => "none",
        }
    }

    fn current(&self) -> Option<String> {
        self.record
            .current_entry_id
            .clone()
            .filter(|id| self.exists(id))
    }

    fn preferred(&self) -> Option<String> {
        self.record
            .preferred_entry_id
            .clone()
            .filter(|id| self.exists(id))
    }

    fn is_paused(&self, id: &str) -> bool {
        self.pauses.get(id).is_some_and(|set| !set.is_empty())
    }

    fn is_eligible(&self, id: &str) -> bool {
        self.entries
            .get(id)
            .is_some_and(|e| e.facts.all() && !self.is_paused(id))
    }

    /// Registered ids sorted by lowercase display name
    fn sorted_by_name<'a>(&self, ids: impl Iterator<Item = &'a String>) -> Vec<String> {
        let mut v: Vec<String> = ids.cloned().collect();
        v.sort_by_cached_key(|id| {
            (
                self.entries
                    .get(id)
                    .map(|e| e.name.to_lowercase())
                    .unwrap_or_default(),
                id.clone(),
            )
        });
        v
    }

    /// Stored order restricted to registered ids, deduplicated, with
    /// unlisted ids appended by name
    fn normalize(&self, order: &[String]) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut out: Vec<String> = order
            .iter()
            .filter(|id| self.exists(id) && seen.insert(id.as_str()))
            .cloned()
            .collect();
        let missing: Vec<&String> = self.entries.keys().filter(|id| !out.contains(id)).collect();
        out.extend(self.sorted_by_name(missing.into_iter()));
        out
    }

    fn order(&self) -> Vec<String> {
        self.normalize(&self.record.order)
    }

    fn set_current(&mut self, id: Option<String>) {
        let valid = id.filter(|i| self.exists(i));
        if self.record.current_entry_id != valid {
            self.logger.info(&format!(
                "Global priority (current) set to: {}",
                self.name_of(valid.as_deref())
            ));
        }
        self.record.current_entry_id = valid;
    }

    fn first_eligible(&self, order: &[String]) -> Option<String> {
        order.iter().find(|id| self.is_eligible(id)).cloned()
    }

    fn first_unpaused_excluding(&self, order: &[String], exclude: Option<&str>) -> Option<String> {
        order
            .iter()
            .filter(|id| Some(id.as_str()) != exclude)
            .find(|id| !self.is_paused(id))
            .cloned()
    }

    fn align(&mut self) {
        if !self.record.priority_mode_enabled {
            return;
        }
        let order = self.order();
        let current = self.current();
        if let Some(eligible) = self.first_eligible(&order) {
            if current.as_deref() != Some(eligible.as_str()) {
                self.set_current(Some(eligible));
            }
            return;
        }
        let exclude = current.as_deref().filter(|c| self.is_paused(c));
        let candidate = self.first_unpaused_excluding(&order, exclude);
        if let Some(c) = candidate {
            if current.as_deref() != Some(c.as_str()) {
                self.logger
                    .info(&format!("Align fallback to unpaused {}", self.name_of(Some(&c))));
                self.set_current(Some(c));
            }
            return;
        }
        if let Some(c) = &current
            && !self.is_paused(c)
        {
            return;
        }
        self.set_current(None);
    }

    fn advance(&mut self, from: &str) {
        if !self.exists(from) {
            match self.preferred().filter(|p| self.is_eligible(p)) {
                Some(p) => self.set_current(Some(p)),
                None => self.align(),
            }
            return;
        }
        let order = self.order();
        let Some(idx) = order.iter().position(|id| id == from) else {
            self.align();
            return;
        };
        let n = order.len();
        for step in 1..n {
            let cand = &order[(idx + step) % n];
            if self.is_eligible(cand) {
                self.logger.info(&format!(
                    "Priority advanced from {} to {}",
                    self.name_of(Some(from)),
                    self.name_of(Some(cand))
                ));
                self.set_current(Some(cand.clone()));
                return;
            }
        }
        if let Some(p) = self.preferred().filter(|p| self.is_eligible(p)) {
            self.set_current(Some(p));
            return;
        }
        let exclude = self.is_paused(from).then_some(from);
        if let Some(f) = self.first_unpaused_excluding(&order, exclude)
            && f != from
        {
            self.logger
                .info(&format!("No eligible next; fallback to unpaused {}", self.name_of(Some(&f))));
            self.set_current(Some(f));
            return;
        }
        if !self.is_paused(from) {
            self.logger.info(&format!(
                "No eligible next; retaining {}",
                self.name_of(self.current().as_deref())
            ));
            return;
        }
        self.logger.info("No eligible or unpaused entry; clearing priority");
        self.set_current(None);
    }

    fn prune(&mut self) {
        if self
            .record
            .current_entry_id
            .as_deref()
            .is_some_and(|id| !self.exists(id))
        {
            self.record.current_entry_id = None;
        }
        if self
            .record
            .preferred_entry_id
            .as_deref()
            .is_some_and(|id| !self.exists(id))
        {
            self.record.preferred_entry_id = None;
        }
        self.record.order = self.order();
        let entries = &self.entries;
        self.pauses.retain(|id, _| entries.contains_key(id));
    }
}

struct Shared {
    inner: Mutex<Inner>,
    bus: EventBus,
    writer: Option<mpsc::UnboundedSender<PriorityRecord>>,
    store: Option<Arc<dyn KeyValueStore>>,
}

/// Handle to the shared arbiter; clones refer to the same state
#[derive(Clone)]
pub struct PriorityArbiter {
    shared: Arc<Shared>,
}

impl PriorityArbiter {
    /// Arbiter without persistence
    pub fn in_memory(bus: EventBus, mode_enabled: bool) -> Self {
        Self::build(
            PriorityRecord {
                priority_mode_enabled: mode_enabled,
                ..PriorityRecord::default()
            },
            bus,
            None,
        )
    }

    /// Load the persisted record and start the coalescing writer.
    /// `default_mode_enabled` applies when nothing is stored yet.
    pub async fn load(
        store: Arc<dyn KeyValueStore>,
        bus: EventBus,
        default_mode_enabled: bool,
    ) -> Self {
        let logger = get_logger("priority");
        let record = match store.load(GLOBAL_KEY).await {
            Ok(Some(v)) => match from_versioned::<PriorityRecord>(v) {
                Ok(r) => r,
                Err(e) => {
                    logger.warn(&format!("Discarding unreadable priority record: {e}"));
                    PriorityRecord {
                        priority_mode_enabled: default_mode_enabled,
                        ..PriorityRecord::default()
                    }
                }
            },
            Ok(None) => PriorityRecord {
                priority_mode_enabled: default_mode_enabled,
                ..PriorityRecord::default()
            },
            Err(e) => {
                logger.warn(&format!("Failed to read priority record: {e}"));
                PriorityRecord {
                    priority_mode_enabled: default_mode_enabled,
                    ..PriorityRecord::default()
                }
            }
        };
        Self::build(record, bus, Some(store))
    }

    fn build(record: PriorityRecord, bus: EventBus, store: Option<Arc<dyn KeyValueStore>>) -> Self {
        let writer = store.clone().map(|store| {
            let (tx, mut rx) = mpsc::unbounded_channel::<PriorityRecord>();
            tokio::spawn(async move {
                let logger = get_logger("priority");
                while let Some(mut rec) = rx.recv().await {
                    while let Ok(newer) = rx.try_recv() {
                        rec = newer;
                    }
                    let result = match to_versioned(&rec) {
                        Ok(v) => store.save(GLOBAL_KEY, &v).await,
                        Err(e) => Err(e),
                    };
                    if let Err(e) = result {
                        logger.warn(&format!("Failed to save priority record: {e}"));
                    }
                }
            });
            tx
        });
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    record,
                    entries: BTreeMap::new(),
                    pauses: HashMap::new(),
                    logger: get_logger("priority"),
                }),
                bus,
                writer,
                store,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.shared
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn read<T>(&self, f: impl FnOnce(&Inner) -> T) -> T {
        f(&self.lock())
    }

    /// Run a mutation; on any visible change notify controllers and persist
    fn mutate<T>(&self, f: impl FnOnce(&mut Inner) -> T) -> T {
        let (out, record_changed, changed, record) = {
            let mut inner = self.lock();
            let before = (inner.record.clone(), inner.pauses.clone(), inner.current());
            let out = f(&mut inner);
            let record_changed = inner.record != before.0;
            let changed =
                record_changed || inner.pauses != before.1 || inner.current() != before.2;
            (out, record_changed, changed, inner.record.clone())
        };
        if record_changed && let Some(tx) = &self.shared.writer {
            let _ = tx.send(record);
        }
        if changed {
            self.shared.bus.fire(BusEvent::PriorityRefresh);
        }
        out
    }

    /// Save the record immediately (used on shutdown)
    pub async fn flush(&self) -> Result<()> {
        let Some(store) = &self.shared.store else {
            return Ok(());
        };
        let record = self.read(|i| i.record.clone());
        store.save(GLOBAL_KEY, &to_versioned(&record)?).await
    }

    pub fn bus(&self) -> &EventBus {
        &self.shared.bus
    }

    // ---------------- Registration ----------------

    pub fn register(&self, id: &str, name: &str) {
        self.mutate(|i| {
            i.entries.insert(
                id.to_string(),
                Entry {
                    name: name.to_string(),
                    facts: EligibilityFacts::default(),
                },
            );
        });
    }

    /// Remove a controller and reconcile the record
    pub fn unregister(&self, id: &str) {
        self.mutate(|i| {
            i.entries.remove(id);
            i.pauses.remove(id);
            i.prune();
            i.logger.info(&format!("Priority entry removed: {id}"));
        });
    }

    /// Prune ids that are no longer registered from current, preferred and order
    pub fn cleanup_if_removed(&self) {
        self.mutate(Inner::prune);
    }

    pub fn entry_ids(&self) -> Vec<String> {
        self.read(|i| i.entries.keys().cloned().collect())
    }

    // ---------------- Mode ----------------

    pub fn priority_mode_enabled(&self) -> bool {
        self.read(|i| i.record.priority_mode_enabled)
    }

    pub fn set_priority_mode_enabled(&self, enabled: bool) {
        self.mutate(|i| {
            if i.record.priority_mode_enabled != enabled {
                i.logger.info(&format!("Priority mode set to {enabled}"));
            }
            i.record.priority_mode_enabled = enabled;
            i.align();
        });
    }

    // ---------------- Current / preferred ----------------

    pub fn get_priority(&self) -> Option<String> {
        self.read(Inner::current)
    }

    pub fn get_preferred_priority(&self) -> Option<String> {
        self.read(Inner::preferred)
    }

    /// Explicit claim: sets current, and preferred when the id is valid
    pub fn set_priority(&self, id: Option<&str>) {
        self.mutate(|i| {
            let valid = id.filter(|v| i.exists(v)).map(str::to_string);
            if let Some(v) = &valid {
                i.record.preferred_entry_id = Some(v.clone());
            }
            i.set_current(valid);
        });
    }

    // ---------------- Order ----------------

    pub fn get_order(&self) -> Vec<String> {
        self.read(Inner::order)
    }

    /// Replace the order; the top entry becomes preferred and current is re-aligned
    pub fn set_order(&self, order: &[String]) {
        self.mutate(|i| {
            let order = i.normalize(order);
            i.record.preferred_entry_id = order.first().cloned();
            i.logger.debug(&format!("Priority order updated: {order:?}"));
            i.record.order = order;
            i.align();
        });
    }

    /// Move one entry to a 1-based position (clamped)
    pub fn set_entry_order_index(&self, id: &str, index_one_based: usize) {
        let order = self.read(|i| {
            if !i.exists(id) {
                return None;
            }
            let mut order: Vec<String> = i.order().into_iter().filter(|e| e != id).collect();
            let idx = index_one_based.clamp(1, order.len() + 1);
            order.insert(idx - 1, id.to_string());
            Some(order)
        });
        if let Some(order) = order {
            self.set_order(&order);
        }
    }

    // ---------------- Pauses ----------------

    pub fn mark_pause(&self, id: &str, reason: PauseReason) {
        self.mutate(|i| {
            if i.pauses.entry(id.to_string()).or_default().insert(reason) {
                i.logger
                    .info(&format!("Priority pause marked: entry={} reason={reason:?}", i.name_of(Some(id))));
            }
        });
    }

    pub fn clear_pause(&self, id: &str, reason: PauseReason) {
        self.mutate(|i| {
            if let Some(set) = i.pauses.get_mut(id)
                && set.remove(&reason)
            {
                if set.is_empty() {
                    i.pauses.remove(id);
                }
                i.logger
                    .info(&format!("Priority pause cleared: entry={} reason={reason:?}", i.name_of(Some(id))));
            }
        });
    }

    pub fn clear_all_pauses(&self, id: &str) {
        self.mutate(|i| {
            i.pauses.remove(id);
        });
    }

    pub fn is_paused(&self, id: &str) -> bool {
        self.read(|i| i.is_paused(id))
    }

    pub fn pause_reasons(&self, id: &str) -> Vec<PauseReason> {
        self.read(|i| {
            i.pauses
                .get(id)
                .map(|s| s.iter().copied().collect())
                .unwrap_or_default()
        })
    }

    // ---------------- Eligibility ----------------

    /// Update the facts a controller reports about itself
    pub fn report_facts(&self, id: &str, facts: EligibilityFacts) {
        self.mutate(|i| {
            let Some(entry) = i.entries.get_mut(id) else {
                return;
            };
            if entry.facts == facts {
                return;
            }
            entry.facts = facts;
            if i.record.priority_mode_enabled && i.current().is_none() {
                i.align();
            }
        });
    }

    /// Last facts reported by `id`
    pub fn facts_of(&self, id: &str) -> Option<EligibilityFacts> {
        self.read(|i| i.entries.get(id).map(|e| e.facts))
    }

    pub fn is_entry_eligible(&self, id: &str) -> bool {
        self.read(|i| i.is_eligible(id))
    }

    /// Whether `id` may charge right now under priority rules
    pub fn is_allowed(&self, id: &str) -> bool {
        self.read(|i| {
            if !i.record.priority_mode_enabled {
                return true;
            }
            match i.current() {
                Some(cur) => cur == id,
                None => !i
                    .entries
                    .keys()
                    .any(|other| other != id && i.is_eligible(other)),
            }
        })
    }

    // ---------------- Reconciliation ----------------

    pub fn align_current_with_order(&self) {
        self.mutate(Inner::align);
    }

    pub fn advance_to_next(&self, from: &str) {
        self.mutate(|i| i.advance(from));
    }

    /// Give up the slot after a no-data pause
    pub fn handover_after_pause(&self, id: &str) {
        self.mutate(|i| {
            if !i.record.priority_mode_enabled {
                return;
            }
            if i.current().as_deref() == Some(id) {
                i.advance(id);
            } else {
                i.align();
            }
        });
    }

    /// Align, then report whether `id` holds the slot
    pub fn have_priority_now(&self, id: &str) -> bool {
        self.mutate(|i| {
            if !i.record.priority_mode_enabled {
                return true;
            }
            i.align();
            i.current().as_deref() == Some(id)
        })
    }

    pub fn snapshot(&self) -> PrioritySnapshot {
        self.read(|i| PrioritySnapshot {
            priority_mode_enabled: i.record.priority_mode_enabled,
            current_entry_id: i.current(),
            preferred_entry_id: i.preferred(),
            order: i.order(),
            pauses: i
                .pauses
                .iter()
                .map(|(k, v)| (k.clone(), v.iter().copied().collect()))
                .collect(),
        })
    }
}

impl std::fmt::Debug for PriorityArbiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriorityArbiter")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}
