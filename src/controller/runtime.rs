//! Async actor around the decision core
//!
//! One task per charger: it owns the [`ChargeController`], receives inputs
//! over an mpsc channel and priority notices from the bus, sleeps until the
//! next armed timer and executes queued effects in order. Status snapshots
//! are published on a watch channel after every step.

use super::{ChargeController, ControllerInput, ControllerStatus, Effect, StartOutcome, UserCommand};
use crate::clock::Moment;
use crate::config::ControllerConfig;
use crate::dispatch::{CommandDispatcher, EnableWriter, Notifier, ServiceCall};
use crate::error::{EvcmError, Result};
use crate::events::{BusEvent, EventBus, StateChange};
use crate::logging::{LogContext, StructuredLogger, get_logger_with_context};
use crate::persistence::{KeyValueStore, PersistenceManager};
use crate::priority::PriorityArbiter;
use crate::sensor::{CHARGING_DETECTED_POWER_W, StateStore};
use chrono_tz::Tz;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, sleep_until};

/// How long a start waits for the cable lock to report unlocked
pub const UNLOCK_WAIT: Duration = Duration::from_secs(5);
/// How long a resume waits for charging before falling back to an unlock
pub const CHARGING_DETECT_WAIT: Duration = Duration::from_secs(5);
const WAIT_POLL: Duration = Duration::from_millis(200);

/// Collaborators shared by every controller
#[derive(Clone)]
pub struct ControllerServices {
    pub store: Arc<dyn StateStore>,
    pub dispatcher: Arc<dyn CommandDispatcher>,
    pub notifier: Arc<dyn Notifier>,
    pub kv: Arc<dyn KeyValueStore>,
    pub arbiter: PriorityArbiter,
    pub tz: Tz,
}

/// Handle to a running controller task
pub struct ControllerHandle {
    id: String,
    tx: mpsc::UnboundedSender<ControllerInput>,
    status: watch::Receiver<Arc<ControllerStatus>>,
    join: JoinHandle<()>,
}

impl ControllerHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn send(&self, input: ControllerInput) -> Result<()> {
        self.tx
            .send(input)
            .map_err(|_| EvcmError::generic(format!("controller {} has stopped", self.id)))
    }

    pub fn command(&self, cmd: UserCommand) -> Result<()> {
        self.send(ControllerInput::Command(cmd))
    }

    pub fn state_changed(&self, change: StateChange) -> Result<()> {
        self.send(ControllerInput::StateChanged(change))
    }

    /// Latest published status
    pub fn status(&self) -> Arc<ControllerStatus> {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<Arc<ControllerStatus>> {
        self.status.clone()
    }

    /// Stop the task after it has flushed its state
    pub async fn shutdown(self) {
        let _ = self.tx.send(ControllerInput::Shutdown);
        if let Err(e) = self.join.await {
            tracing::warn!(charger = %self.id, "Controller task ended abnormally: {e}");
        }
    }
}

/// Load persisted state, register with the arbiter and start the actor
pub async fn spawn_controller(
    cfg: Arc<ControllerConfig>,
    services: ControllerServices,
) -> Result<ControllerHandle> {
    if cfg.id.trim().is_empty() {
        return Err(EvcmError::validation("id", "charger id must not be empty"));
    }
    let persistence = PersistenceManager::new(services.kv.clone(), &cfg.id);
    let (persisted, fresh) = persistence.load().await;
    services.arbiter.register(&cfg.id, cfg.display_name());

    let now = Moment::now();
    let mut core = ChargeController::new(
        cfg.clone(),
        services.tz,
        services.arbiter.clone(),
        services.store.clone(),
        &persisted,
        now.mono,
    );
    let executor = EffectExecutor::new(cfg.clone(), &services, persistence);
    let bus_rx = services.arbiter.bus().subscribe();

    core.startup(now);
    if fresh {
        core.mark_dirty(now);
    }
    let (status_tx, status_rx) = watch::channel(Arc::new(core.status(now)));
    let (tx, rx) = mpsc::unbounded_channel();

    let join = tokio::spawn(run(core, executor, rx, bus_rx, status_tx));
    Ok(ControllerHandle {
        id: cfg.id.clone(),
        tx,
        status: status_rx,
        join,
    })
}

async fn run(
    mut core: ChargeController,
    mut executor: EffectExecutor,
    mut rx: mpsc::UnboundedReceiver<ControllerInput>,
    mut bus_rx: broadcast::Receiver<BusEvent>,
    status_tx: watch::Sender<Arc<ControllerStatus>>,
) {
    let mut bus_open = true;
    drain(&mut core, &mut executor).await;
    loop {
        let deadline = core.next_deadline();
        let stop = tokio::select! {
            input = rx.recv() => {
                match input {
                    Some(ControllerInput::Shutdown) | None => {
                        core.shutdown(Moment::now());
                        true
                    }
                    Some(input) => {
                        core.handle_input(input, Moment::now());
                        false
                    }
                }
            }
            event = bus_rx.recv(), if bus_open => {
                match event {
                    Ok(BusEvent::PriorityRefresh) | Err(broadcast::error::RecvError::Lagged(_)) => {
                        core.handle_priority_refresh(Moment::now());
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Closed) => bus_open = false,
                }
                false
            }
            () = wait_for(deadline) => {
                core.fire_due(Moment::now());
                false
            }
        };
        drain(&mut core, &mut executor).await;
        let _ = status_tx.send(Arc::new(core.status(Moment::now())));
        if stop {
            break;
        }
    }
    executor.logger.debug("Controller task stopped");
}

async fn wait_for(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Execute queued effects until the core stops producing new ones
async fn drain(core: &mut ChargeController, executor: &mut EffectExecutor) {
    loop {
        let effects = core.take_effects();
        if effects.is_empty() {
            return;
        }
        for effect in effects {
            if let Some(outcome) = executor.execute(effect).await {
                core.handle_start_outcome(outcome, Moment::now());
            }
        }
    }
}

/// Performs effects against the outside world; failures are logged, never fatal
pub struct EffectExecutor {
    cfg: Arc<ControllerConfig>,
    store: Arc<dyn StateStore>,
    dispatcher: Arc<dyn CommandDispatcher>,
    notifier: Arc<dyn Notifier>,
    persistence: PersistenceManager,
    bus: EventBus,
    enable_writer: EnableWriter,
    logger: StructuredLogger,
}

impl EffectExecutor {
    pub fn new(
        cfg: Arc<ControllerConfig>,
        services: &ControllerServices,
        persistence: PersistenceManager,
    ) -> Self {
        Self {
            enable_writer: EnableWriter::new(cfg.entities.charging_enable.clone()),
            logger: get_logger_with_context(LogContext::new("executor").with_charger(&cfg.id)),
            store: services.store.clone(),
            dispatcher: services.dispatcher.clone(),
            notifier: services.notifier.clone(),
            bus: services.arbiter.bus().clone(),
            persistence,
            cfg,
        }
    }

    fn observed_enable(&self) -> Option<bool> {
        self.store
            .get_state(&self.cfg.entities.charging_enable)
            .and_then(|s| s.is_on())
    }

    fn lock_state(&self) -> Option<String> {
        let id = self.cfg.entities.lock.as_deref()?;
        self.store
            .get_state(id)
            .and_then(|s| s.value().map(str::to_ascii_lowercase))
    }

    fn cable_connected(&self) -> bool {
        self.store
            .get_state(&self.cfg.entities.cable)
            .and_then(|s| s.is_on())
            == Some(true)
    }

    fn charging_detected(&self) -> bool {
        let e = &self.cfg.entities;
        let status = e
            .wallbox_status
            .as_deref()
            .and_then(|id| self.store.get_state(id))
            .is_some_and(|s| s.state.trim().eq_ignore_ascii_case("charging"));
        let power = e
            .charge_power
            .as_deref()
            .and_then(|id| self.store.get_state(id))
            .and_then(|s| s.as_f64())
            .is_some_and(|p| p > CHARGING_DETECTED_POWER_W);
        status || power
    }

    async fn call(&self, call: ServiceCall) -> bool {
        let what = format!("{}.{} {}", call.domain, call.service, call.entity_id);
        match self.dispatcher.call(call).await {
            Ok(()) => true,
            Err(e) => {
                self.logger.warn(&format!("Service call {what} failed: {e}"));
                false
            }
        }
    }

    async fn set_enable(&mut self, on: bool) -> bool {
        let observed = self.observed_enable();
        match self
            .enable_writer
            .set(self.dispatcher.as_ref(), observed, on)
            .await
        {
            Ok(_) => true,
            Err(e) => {
                self.logger
                    .warn(&format!("Failed to switch charging enable {on}: {e}"));
                false
            }
        }
    }

    /// Run one effect; a lock-aware start reports its outcome
    pub async fn execute(&mut self, effect: Effect) -> Option<StartOutcome> {
        match effect {
            Effect::SetEnable(on) => {
                self.set_enable(on).await;
            }
            Effect::StartCharging {
                initial,
                auto_unlock,
            } => return Some(self.start_charging(initial, auto_unlock).await),
            Effect::SetCurrent(amps) => {
                if let Some(id) = self.cfg.entities.current_setting.clone() {
                    let call = ServiceCall::new("number", "set_value", &id)
                        .with_params(serde_json::json!({ "value": amps }));
                    self.call(call).await;
                }
            }
            Effect::Lock => {
                if let Some(id) = self.cfg.entities.lock.clone()
                    && self.lock_state().as_deref() != Some("locked")
                {
                    self.call(ServiceCall::new("lock", "lock", &id)).await;
                }
            }
            Effect::Fire(event) => self.bus.fire(event),
            Effect::Notify { id, title, message } => {
                if let Err(e) = self.notifier.notify(&id, &title, &message).await {
                    self.logger.warn(&format!("Notification {id} failed: {e}"));
                }
            }
            Effect::Dismiss { id } => {
                if let Err(e) = self.notifier.dismiss(&id).await {
                    self.logger.warn(&format!("Dismissing {id} failed: {e}"));
                }
            }
            Effect::Save(state) => {
                if let Err(e) = self.persistence.save(&state).await {
                    self.logger.warn(&format!("Failed to persist state: {e}"));
                }
            }
        }
        None
    }

    async fn wait_until(&self, limit: Duration, mut done: impl FnMut(&Self) -> bool) -> bool {
        let until = Instant::now() + limit;
        loop {
            if done(self) {
                return true;
            }
            if Instant::now() >= until {
                return false;
            }
            sleep(WAIT_POLL).await;
        }
    }

    /// Release the cable lock and wait for it to report unlocked. Gives up
    /// early once the cable is gone.
    async fn unlock(&self, lock_id: &str) -> bool {
        if !self.cable_connected() {
            return false;
        }
        self.logger.info("Unlocking cable to start charging");
        if !self.call(ServiceCall::new("lock", "unlock", lock_id)).await {
            return false;
        }
        self.wait_until(UNLOCK_WAIT, |me| {
            !me.cable_connected() || me.lock_state().as_deref() == Some("unlocked")
        })
        .await
            && self.cable_connected()
    }

    fn abandoned(&self, mut outcome: StartOutcome) -> StartOutcome {
        self.logger
            .info("Cable disconnected while starting; start abandoned");
        outcome.disconnected = true;
        outcome.aborted = false;
        outcome
    }

    /// Initial start: unlock first, then enable. Resume: enable, wait for
    /// charging and unlock only when nothing happens. The cable is checked
    /// again before every command.
    async fn start_charging(&mut self, initial: bool, auto_unlock: bool) -> StartOutcome {
        let mut outcome = StartOutcome::default();
        if !self.cable_connected() {
            return self.abandoned(outcome);
        }
        let lock_id = self
            .cfg
            .entities
            .lock
            .clone()
            .filter(|_| auto_unlock && self.lock_state().as_deref() == Some("locked"));

        if initial {
            if let Some(lock_id) = &lock_id {
                if !self.unlock(lock_id).await {
                    if !self.cable_connected() {
                        return self.abandoned(outcome);
                    }
                    outcome.aborted = true;
                    return outcome;
                }
                outcome.unlocked = true;
            }
            if !self.cable_connected() {
                return self.abandoned(outcome);
            }
            outcome.enabled = self.set_enable(true).await;
            return outcome;
        }

        outcome.enabled = self.set_enable(true).await;
        if !outcome.enabled {
            return outcome;
        }
        let Some(lock_id) = lock_id else {
            return outcome;
        };
        let charging = self
            .wait_until(CHARGING_DETECT_WAIT, |me| {
                !me.cable_connected() || me.charging_detected()
            })
            .await;
        if !self.cable_connected() {
            return self.abandoned(outcome);
        }
        if charging {
            return outcome;
        }
        self.logger
            .debug("No charging detected after enable; unlocking cable");
        if self.unlock(&lock_id).await {
            outcome.unlocked = true;
        } else if !self.cable_connected() {
            return self.abandoned(outcome);
        } else {
            outcome.aborted = true;
        }
        outcome
    }
}
