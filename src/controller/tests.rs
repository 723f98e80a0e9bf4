//! Scenario tests for the decision core, driven by a simulated clock

use super::*;
use crate::config::{EntityConfig, GridConfig, PhaseSwitchConfig, ReclaimPolicy};
use crate::controls::Mode;
use crate::events::{BusEvent, EventBus, StateChange};
use crate::phase::{PhaseProfile, SwitchSource};
use crate::priority::PauseReason;
use crate::sensor::{EntityState, MemoryStateStore};
use chrono::{TimeZone, Utc};
use std::collections::VecDeque;
use tokio::sync::broadcast;

const NET: &str = "sensor.grid_net";

fn charger(id: &str) -> ControllerConfig {
    ControllerConfig {
        id: id.to_string(),
        name: id.to_uppercase(),
        grid: GridConfig::Single {
            net_power: NET.to_string(),
        },
        entities: EntityConfig {
            cable: format!("binary_sensor.{id}_cable"),
            charging_enable: format!("switch.{id}_enable"),
            current_setting: Some(format!("number.{id}_current")),
            soc: Some(format!("sensor.{id}_soc")),
            ..EntityConfig::default()
        },
        ..ControllerConfig::default()
    }
}

fn with_phase_switch(mut cfg: ControllerConfig) -> ControllerConfig {
    let id = cfg.id.clone();
    cfg.entities.charge_power = Some(format!("sensor.{id}_power"));
    cfg.phase_switch = Some(PhaseSwitchConfig {
        feedback_entity: Some(format!("sensor.{id}_phases")),
        ..PhaseSwitchConfig::default()
    });
    cfg
}

struct Harness {
    store: Arc<MemoryStateStore>,
    arbiter: PriorityArbiter,
    bus_rx: broadcast::Receiver<BusEvent>,
    ctls: Vec<ChargeController>,
    now: Moment,
    pending: VecDeque<StateChange>,
    fired: Vec<BusEvent>,
    notified: Vec<String>,
    dismissed: Vec<String>,
    saved: Vec<PersistedState>,
    /// Drop enable commands, as a wallbox that ignores them would
    swallow_enable: bool,
}

impl Harness {
    fn new(configs: Vec<ControllerConfig>, priority_mode: bool) -> Self {
        let store = Arc::new(MemoryStateStore::new());
        let bus = EventBus::new();
        let bus_rx = bus.subscribe();
        let arbiter = PriorityArbiter::in_memory(bus, priority_mode);
        let now = Moment::at(
            Instant::now(),
            Utc.with_ymd_and_hms(2026, 3, 10, 10, 0, 0).unwrap(),
        );
        store.set(NET, Some("0"));
        let mut ctls = Vec::new();
        for cfg in configs {
            let e = &cfg.entities;
            store.set(&e.cable, Some("on"));
            store.set(&e.charging_enable, Some("off"));
            if let Some(c) = &e.current_setting {
                store.set(c, Some("6"));
            }
            if let Some(s) = &e.soc {
                store.set(s, Some("50"));
            }
            if let Some(p) = &e.charge_power {
                store.set(p, Some("0"));
            }
            if let Some(fb) = cfg.phase_switch.as_ref().and_then(|p| p.feedback_entity.as_ref()) {
                store.set(fb, Some("3"));
            }
            arbiter.register(&cfg.id, cfg.display_name());
            ctls.push(ChargeController::new(
                Arc::new(cfg),
                chrono_tz::Europe::Amsterdam,
                arbiter.clone(),
                store.clone(),
                &PersistedState::default(),
                now.mono,
            ));
        }
        Self {
            store,
            arbiter,
            bus_rx,
            ctls,
            now,
            pending: VecDeque::new(),
            fired: Vec::new(),
            notified: Vec::new(),
            dismissed: Vec::new(),
            saved: Vec::new(),
            swallow_enable: false,
        }
    }

    fn single() -> Self {
        Self::new(vec![charger("a")], false)
    }

    /// Run startup and let the startup probe replay the cable state
    fn start(&mut self) {
        let now = self.now;
        for ctl in &mut self.ctls {
            ctl.startup(now);
        }
        self.pump();
        self.advance(0);
    }

    fn idx(&self, id: &str) -> usize {
        self.ctls.iter().position(|c| c.id() == id).unwrap()
    }

    fn ctl(&self, id: &str) -> &ChargeController {
        &self.ctls[self.idx(id)]
    }

    fn status(&self, id: &str) -> ControllerStatus {
        self.ctl(id).status(self.now)
    }

    fn enabled(&self, id: &str) -> bool {
        let entity = self.ctl(id).config().entities.charging_enable.clone();
        self.store.get_state(&entity).and_then(|s| s.is_on()) == Some(true)
    }

    fn write(&mut self, entity: &str, value: Option<&str>) {
        let old = self.store.apply(entity, value.map(EntityState::new));
        self.pending.push_back(StateChange {
            entity_id: entity.to_string(),
            old_state: old,
            new_state: value.map(EntityState::new),
        });
    }

    /// Upstream change delivered to every controller
    fn set(&mut self, entity: &str, value: &str) {
        self.write(entity, Some(value));
        self.pump();
    }

    fn command(&mut self, id: &str, cmd: UserCommand) {
        let i = self.idx(id);
        let now = self.now;
        self.ctls[i].handle_command(cmd, now);
        self.pump();
    }

    fn apply_effect(&mut self, i: usize, effect: Effect) {
        let cfg = self.ctls[i].config().clone();
        match effect {
            Effect::SetEnable(_) if self.swallow_enable => {}
            Effect::SetEnable(on) => {
                self.write(&cfg.entities.charging_enable, Some(if on { "on" } else { "off" }));
            }
            Effect::StartCharging { auto_unlock, .. } => {
                let mut outcome = StartOutcome::default();
                if let Some(lock) = &cfg.entities.lock
                    && auto_unlock
                    && self.store.get_state(lock).map(|s| s.state) == Some("locked".into())
                {
                    self.write(lock, Some("unlocked"));
                    outcome.unlocked = true;
                }
                self.write(&cfg.entities.charging_enable, Some("on"));
                outcome.enabled = true;
                let now = self.now;
                self.ctls[i].handle_start_outcome(outcome, now);
            }
            Effect::SetCurrent(a) => {
                if let Some(c) = &cfg.entities.current_setting {
                    self.write(c, Some(&a.to_string()));
                }
            }
            Effect::Lock => {
                if let Some(lock) = &cfg.entities.lock {
                    self.write(lock, Some("locked"));
                }
            }
            Effect::Fire(event) => self.fired.push(event),
            Effect::Notify { id, .. } => self.notified.push(id),
            Effect::Dismiss { id } => self.dismissed.push(id),
            Effect::Save(state) => self.saved.push(*state),
        }
    }

    /// Deliver state changes, effects and priority notices until quiet
    fn pump(&mut self) {
        for _ in 0..10_000 {
            let now = self.now;
            if let Some(change) = self.pending.pop_front() {
                for ctl in &mut self.ctls {
                    ctl.handle_state_change(&change, now);
                }
                continue;
            }
            let mut progressed = false;
            for i in 0..self.ctls.len() {
                for effect in self.ctls[i].take_effects() {
                    progressed = true;
                    self.apply_effect(i, effect);
                }
            }
            if progressed {
                continue;
            }
            let mut refresh = false;
            while let Ok(event) = self.bus_rx.try_recv() {
                refresh |= event == BusEvent::PriorityRefresh;
            }
            if refresh {
                for ctl in &mut self.ctls {
                    ctl.handle_priority_refresh(now);
                }
                continue;
            }
            return;
        }
        panic!("controllers did not settle");
    }

    /// Move the clock forward, firing timers at their exact deadlines
    fn advance(&mut self, secs: u64) {
        let target = self.now.after_secs(secs);
        loop {
            let next = self.ctls.iter().filter_map(ChargeController::next_deadline).min();
            match next {
                Some(at) if at <= target.mono => {
                    if at > self.now.mono {
                        self.now = self.now.after(at - self.now.mono);
                    }
                    let now = self.now;
                    for ctl in &mut self.ctls {
                        ctl.fire_due(now);
                    }
                    self.pump();
                }
                _ => break,
            }
        }
        self.now = target;
    }
}

fn cable(id: &str) -> String {
    format!("binary_sensor.{id}_cable")
}

#[test]
fn starts_once_export_holds_above_upper_for_debounce() {
    let mut h = Harness::single();
    h.start();
    h.advance(2);
    h.set(NET, "5000");
    h.advance(2);
    assert!(!h.enabled("a"), "must wait for the upper debounce");
    h.advance(1);
    assert!(h.enabled("a"));
    assert!(h.ctl("a").is_active());
    assert_eq!(h.status("a").state, ChargeState::Charging);
}

#[test]
fn short_export_spike_does_not_start() {
    let mut h = Harness::single();
    h.start();
    h.advance(2);
    h.set(NET, "5000");
    h.advance(1);
    h.set(NET, "1000");
    h.advance(10);
    assert!(!h.enabled("a"));
    assert!(!h.ctl("a").is_timer_armed(TimerKind::UpperDebounce));
}

#[test]
fn starts_immediately_when_already_exporting_at_connect() {
    let mut h = Harness::single();
    h.store.set(NET, Some("6000"));
    h.start();
    h.advance(1);
    assert!(h.enabled("a"));
}

#[test]
fn pauses_after_sustained_import_below_lower() {
    let mut h = Harness::single();
    h.store.set(NET, Some("6000"));
    h.start();
    h.advance(1);
    assert!(h.enabled("a"));

    h.set(NET, "-2500");
    h.advance(119);
    assert!(h.enabled("a"));
    h.advance(1);
    assert!(!h.enabled("a"));
    assert_eq!(h.status("a").state, ChargeState::PausedBelowLower);
}

#[test]
fn recovery_cancels_pending_below_lower_pause() {
    let mut h = Harness::single();
    h.store.set(NET, Some("6000"));
    h.start();
    h.advance(1);

    h.set(NET, "-2500");
    h.advance(60);
    h.set(NET, "0");
    assert!(!h.ctl("a").is_timer_armed(TimerKind::BelowLower));
    h.advance(200);
    assert!(h.enabled("a"));
}

#[test]
fn soc_reaching_limit_pauses_and_sets_minimum_current() {
    let mut h = Harness::single();
    h.store.set(NET, Some("6000"));
    h.store.set("sensor.a_soc", Some("79"));
    h.start();
    h.advance(1);
    assert!(h.enabled("a"));
    h.store.set("number.a_current", Some("12"));

    h.set("sensor.a_soc", "81");
    assert!(!h.enabled("a"));
    let st = h.status("a");
    assert!(!st.soc_allows);
    assert_eq!(st.state, ChargeState::PausedGated);
    assert_eq!(st.current_setting_a, Some(MIN_CURRENT_A));
}

#[test]
fn external_import_limit_moves_the_band() {
    let mut h = Harness::single();
    h.start();
    h.command("a", UserCommand::SetExtImportLimit { watts: 1000 });
    let band = h.status("a").band;
    assert_eq!(band.lower_w, -1000);
    assert!(band.import_limited);
    assert!(band.upper_w > band.lower_w);

    h.command("a", UserCommand::SetExtImportLimit { watts: 3000 });
    let band = h.status("a").band;
    assert_eq!(band.lower_w, -2000);
    assert!(!band.import_limited);
}

#[test]
fn manual_mode_charges_regardless_of_export() {
    let mut h = Harness::single();
    h.store.set(NET, Some("-5000"));
    h.start();
    assert!(!h.enabled("a"));
    h.command(
        "a",
        UserCommand::SetMode {
            mode: Mode::Manual,
            enabled: true,
        },
    );
    assert!(h.enabled("a"));
    h.advance(600);
    assert!(h.enabled("a"), "manual mode never pauses on import");
}

#[test]
fn planner_without_window_blocks_start() {
    let mut h = Harness::single();
    h.store.set(NET, Some("6000"));
    h.command(
        "a",
        UserCommand::SetMode {
            mode: Mode::Planner,
            enabled: true,
        },
    );
    h.start();
    h.advance(60);
    assert!(!h.enabled("a"));
    assert_eq!(h.status("a").state, ChargeState::PausedGated);
}

#[test]
fn start_stop_off_forces_charging_off_and_disconnect_resets_it() {
    let mut h = Harness::single();
    h.store.set(NET, Some("6000"));
    h.start();
    h.advance(1);
    assert!(h.enabled("a"));

    h.command(
        "a",
        UserCommand::SetMode {
            mode: Mode::StartStop,
            enabled: false,
        },
    );
    assert!(!h.enabled("a"));
    h.advance(60);
    assert!(!h.enabled("a"));

    h.set(&cable("a"), "off");
    assert!(h.ctl("a").modes().start_stop);
    h.advance(1);
    let last = h.saved.last().expect("state flushed");
    assert!(last.modes.start_stop);
}

#[test]
fn external_off_latches_until_disconnect() {
    let mut h = Harness::single();
    h.store.set(NET, Some("6000"));
    h.start();
    h.advance(1);
    assert!(h.enabled("a"));

    h.set("switch.a_enable", "off");
    assert!(h.status("a").external_off_latched);
    assert!(h.notified.contains(&"evcm_external_off_a".to_string()));
    h.advance(300);
    assert!(!h.enabled("a"), "latched override must not be fought");

    h.set(&cable("a"), "off");
    assert!(!h.status("a").external_off_latched);
    assert!(h.dismissed.contains(&"evcm_external_off_a".to_string()));
}

#[test]
fn enable_command_is_retried_when_switch_does_not_follow() {
    let mut h = Harness::single();
    h.swallow_enable = true;
    h.store.set(NET, Some("6000"));
    h.start();
    h.advance(1);
    assert!(!h.enabled("a"));
    assert!(h.ctl("a").is_timer_armed(TimerKind::EnableRetry));

    h.swallow_enable = false;
    h.advance(ENABLE_RETRY_INTERVAL.as_secs());
    assert!(h.enabled("a"), "retry re-issues the command");
}

#[test]
fn only_priority_holder_charges() {
    let mut h = Harness::new(vec![charger("a"), charger("b")], true);
    h.arbiter.set_order(&["a".to_string(), "b".to_string()]);
    h.store.set(NET, Some("9000"));
    h.start();
    h.advance(5);
    assert!(h.enabled("a"));
    assert!(!h.enabled("b"));
    assert_eq!(h.arbiter.get_priority().as_deref(), Some("a"));

    h.set(&cable("a"), "off");
    assert_eq!(h.arbiter.get_priority().as_deref(), Some("b"));
    h.advance(3);
    assert!(h.enabled("b"));
    assert!(!h.enabled("a"));
}

#[test]
fn no_data_pause_hands_priority_over() {
    let mut h = Harness::new(vec![charger("a"), charger("b")], true);
    h.arbiter.set_order(&["a".to_string(), "b".to_string()]);
    h.store.set(NET, Some("9000"));
    h.start();
    h.advance(5);
    assert!(h.enabled("a"));

    h.set(NET, "unavailable");
    h.advance(119);
    assert!(h.enabled("a"));
    h.advance(1);
    assert!(!h.enabled("a"));
    assert_eq!(h.status("a").pauses, vec![PauseReason::NoData]);
    assert_eq!(h.arbiter.get_priority().as_deref(), Some("b"));

    h.set(NET, "9000");
    assert!(h.status("a").pauses.is_empty());
}

#[test]
fn below_lower_pause_keeps_claim_until_release_timeout() {
    let mut a = charger("a");
    a.reclaim = ReclaimPolicy {
        timeout_s: Some(300),
    };
    let mut h = Harness::new(vec![a, charger("b")], true);
    h.arbiter.set_order(&["a".to_string(), "b".to_string()]);
    h.store.set(NET, Some("9000"));
    h.start();
    h.advance(5);
    assert!(h.enabled("a"));

    h.set(NET, "-3000");
    h.advance(120);
    assert!(!h.enabled("a"));
    assert_eq!(h.arbiter.get_priority().as_deref(), Some("a"));
    assert!(h.ctl("a").is_timer_armed(TimerKind::ReclaimMonitor));

    h.advance(300);
    assert_eq!(h.arbiter.get_priority().as_deref(), Some("b"));
    assert_eq!(h.status("a").pauses, vec![PauseReason::BelowLower]);
}

#[test]
fn phase_switch_request_for_active_profile_is_a_no_op() {
    let mut h = Harness::new(vec![with_phase_switch(charger("a"))], false);
    h.store.set(NET, Some("6000"));
    h.start();
    h.advance(1);
    assert!(h.enabled("a"));

    h.command(
        "a",
        UserCommand::RequestPhaseSwitch {
            target: PhaseProfile::ThreePhase,
        },
    );
    assert!(h.enabled("a"));
    assert!(h.fired.is_empty());
}

#[test]
fn phase_switch_stops_charging_before_requesting_relay_change() {
    let mut h = Harness::new(vec![with_phase_switch(charger("a"))], false);
    h.store.set(NET, Some("6000"));
    h.start();
    h.advance(1);
    assert!(h.enabled("a"));

    h.command(
        "a",
        UserCommand::RequestPhaseSwitch {
            target: PhaseProfile::OnePhase,
        },
    );
    assert!(!h.enabled("a"));
    assert_eq!(h.status("a").phase.in_progress, Some(PhaseProfile::OnePhase));

    h.advance(1);
    assert!(h.fired.contains(&BusEvent::PhaseSwitchRequest {
        entry_id: "a".into(),
        target: PhaseProfile::OnePhase,
        source: SwitchSource::Manual,
    }));
    assert!(!h.enabled("a"), "charging stays off during the veto");
}

#[test]
fn persisted_changes_are_flushed_after_debounce() {
    let mut h = Harness::single();
    h.start();
    h.saved.clear();
    h.command("a", UserCommand::SetNetPowerTarget { watts: 250 });
    h.command("a", UserCommand::SetAutoUnlock { enabled: false });
    assert!(h.saved.is_empty());
    h.advance(1);
    assert_eq!(h.saved.len(), 1);
    assert_eq!(h.saved[0].net_power_target_w, 250);
    assert!(!h.saved[0].auto_unlock_enabled);
}

/// Charger reporting wallbox status and charge power, so regulation engages
fn regulated(id: &str) -> ControllerConfig {
    let mut cfg = charger(id);
    cfg.entities.wallbox_status = Some(format!("sensor.{id}_status"));
    cfg.entities.charge_power = Some(format!("sensor.{id}_power"));
    cfg
}

fn charging_regulated() -> Harness {
    let mut h = Harness::new(vec![regulated("a")], false);
    h.store.set(NET, Some("6000"));
    h.store.set("sensor.a_status", Some("charging"));
    h.store.set("sensor.a_power", Some("5000"));
    h.start();
    h.advance(1);
    assert!(h.enabled("a"));
    h
}

fn phase_requests(h: &Harness) -> Vec<(PhaseProfile, SwitchSource)> {
    h.fired
        .iter()
        .filter_map(|e| match e {
            BusEvent::PhaseSwitchRequest { target, source, .. } => Some((*target, *source)),
            _ => None,
        })
        .collect()
}

#[test]
fn regulation_steps_one_amp_per_scan_after_warm_up() {
    let mut h = charging_regulated();
    assert!(h.ctl("a").is_timer_armed(TimerKind::Regulation));

    h.advance(28);
    assert_eq!(h.status("a").current_setting_a, Some(6), "no step during warm-up");
    h.advance(2);
    assert_eq!(h.status("a").current_setting_a, Some(7));
    h.advance(30);
    assert_eq!(h.status("a").current_setting_a, Some(8));

    h.set(NET, "-500");
    h.advance(30);
    assert_eq!(h.status("a").current_setting_a, Some(7));
}

#[test]
fn regulation_stops_when_a_gate_closes() {
    let mut h = charging_regulated();
    h.advance(61);
    assert_eq!(h.status("a").current_setting_a, Some(8));

    h.set("sensor.a_soc", "85");
    assert!(!h.enabled("a"));
    assert!(!h.ctl("a").is_timer_armed(TimerKind::Regulation));
    assert_eq!(h.status("a").current_setting_a, Some(MIN_CURRENT_A));
    h.advance(120);
    assert_eq!(h.status("a").current_setting_a, Some(MIN_CURRENT_A));
}

#[test]
fn setting_above_max_walks_down_even_on_a_balanced_grid() {
    let mut h = charging_regulated();
    h.set("number.a_current", "24");
    h.set(NET, "0");

    h.advance(30);
    assert_eq!(h.status("a").current_setting_a, Some(23));
    h.advance(30);
    assert_eq!(h.status("a").current_setting_a, Some(22));
}

#[test]
fn eco_toggle_restarts_upper_debounce() {
    let mut h = Harness::single();
    h.start();
    h.advance(2);
    h.set(NET, "5000");
    h.advance(2);
    h.command(
        "a",
        UserCommand::SetMode {
            mode: Mode::Eco,
            enabled: false,
        },
    );
    h.advance(2);
    assert!(!h.enabled("a"), "window restarted at the new threshold");
    h.advance(1);
    assert!(h.enabled("a"));
}

#[test]
fn auto_upshift_survives_short_dips_and_waits_for_power_to_drop() {
    let mut h = Harness::new(vec![with_phase_switch(charger("a"))], false);
    h.store.set(NET, Some("6000"));
    h.store.set("sensor.a_phases", Some("1"));
    h.start();
    h.advance(1);
    assert!(h.enabled("a"));
    h.set("number.a_current", "16");
    h.set("sensor.a_power", "3600");

    h.advance(300);
    h.set(NET, "0");
    h.advance(120);
    h.set(NET, "6000");
    h.advance(480);
    assert_eq!(h.status("a").phase.in_progress, None);

    h.advance(40);
    assert_eq!(h.status("a").phase.in_progress, Some(PhaseProfile::ThreePhase));
    assert!(!h.enabled("a"));
    assert!(phase_requests(&h).is_empty(), "car is still drawing power");

    h.set("sensor.a_power", "10");
    assert_eq!(
        phase_requests(&h),
        vec![(PhaseProfile::ThreePhase, SwitchSource::Auto)]
    );
}

#[test]
fn auto_upshift_candidate_resets_after_long_dip() {
    let mut h = Harness::new(vec![with_phase_switch(charger("a"))], false);
    h.store.set(NET, Some("6000"));
    h.store.set("sensor.a_phases", Some("1"));
    h.start();
    h.advance(1);
    h.set("number.a_current", "16");
    h.set("sensor.a_power", "3600");

    h.advance(300);
    h.set(NET, "0");
    h.advance(300);
    h.set(NET, "6000");
    h.advance(600);
    assert_eq!(h.status("a").phase.in_progress, None);
    h.advance(360);
    assert_eq!(h.status("a").phase.in_progress, Some(PhaseProfile::ThreePhase));
}

#[test]
fn auto_downshift_after_sustained_low_export_while_paused() {
    let mut h = Harness::new(vec![with_phase_switch(charger("a"))], false);
    h.store.set(NET, Some("6000"));
    h.start();
    h.advance(1);
    assert!(h.enabled("a"));
    h.set("sensor.a_power", "5000");

    h.set(NET, "-3000");
    h.advance(120);
    assert_eq!(h.status("a").state, ChargeState::PausedBelowLower);
    h.set("sensor.a_power", "0");
    h.set(NET, "2000");

    h.advance(600);
    assert!(phase_requests(&h).is_empty());
    h.advance(400);
    assert_eq!(
        phase_requests(&h),
        vec![(PhaseProfile::OnePhase, SwitchSource::Auto)]
    );
}

#[test]
fn blocked_enable_retry_drops_the_pending_on() {
    let mut h = Harness::single();
    h.swallow_enable = true;
    h.store.set(NET, Some("6000"));
    h.start();
    h.advance(1);
    assert!(h.ctl("a").enabled(), "pending command counts as on");

    let i = h.idx("a");
    h.ctls[i].external_off_latched = true;
    h.advance(ENABLE_RETRY_INTERVAL.as_secs());
    assert!(!h.ctl("a").enabled());
    assert!(!h.ctl("a").enable.awaiting());
    assert!(!h.ctl("a").is_timer_armed(TimerKind::EnableRetry));
}

#[test]
fn manual_charger_without_priority_waits_for_the_slot() {
    let mut h = Harness::new(vec![charger("a"), charger("b")], true);
    h.arbiter.set_order(&["a".to_string(), "b".to_string()]);
    h.store.set(NET, Some("9000"));
    h.start();
    h.advance(5);
    assert!(h.enabled("a"));

    h.command(
        "b",
        UserCommand::SetMode {
            mode: Mode::Manual,
            enabled: true,
        },
    );
    assert!(!h.enabled("b"));
    assert!(!h.ctl("b").is_timer_armed(TimerKind::ResumeMonitor));

    h.set(&cable("a"), "off");
    assert!(h.enabled("b"));
}
