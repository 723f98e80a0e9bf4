//! Threshold selection and sustain tracking
//!
//! The active band depends on eco mode, confirmed single phase operation and
//! the external import limit. Anything short of a confirmed single phase
//! reading keeps the three phase set.

use crate::config::{ControllerConfig, ProfileSpec};
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

/// Net power band (W, positive = export)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Band {
    pub upper_w: i32,
    pub lower_w: i32,
    /// Whether the external import limit replaced the configured lower bound
    pub import_limited: bool,
}

impl Band {
    pub fn is_above_upper(&self, net_w: f64) -> bool {
        net_w >= f64::from(self.upper_w)
    }

    pub fn is_below_lower(&self, net_w: f64) -> bool {
        net_w < f64::from(self.lower_w)
    }
}

/// Electrical profile in effect: the single phase profile only when confirmed
pub fn effective_profile(cfg: &ControllerConfig, one_phase_confirmed: bool) -> ProfileSpec {
    match (&cfg.phase_switch, one_phase_confirmed) {
        (Some(ps), true) => ps.single_phase_profile.spec(),
        _ => cfg.supply_profile.spec(),
    }
}

/// Band for the current modes
pub fn active_band(
    cfg: &ControllerConfig,
    eco: bool,
    one_phase_confirmed: bool,
    ext_import_limit_w: u32,
) -> Band {
    let single = one_phase_confirmed && cfg.phase_switch.is_some();
    let set = if single {
        cfg.alternate_thresholds
    } else {
        cfg.thresholds
    };
    let (mut upper, mut lower) = set.pair(eco);
    let mut import_limited = false;

    if ext_import_limit_w > 0 {
        let limit = i32::try_from(ext_import_limit_w).unwrap_or(i32::MAX);
        if -limit > lower {
            let band = effective_profile(cfg, single).min_band_w;
            lower = -limit;
            upper = lower.saturating_add(i32::try_from(band).unwrap_or(i32::MAX));
            import_limited = true;
        }
    }

    Band {
        upper_w: upper,
        lower_w: lower,
        import_limited,
    }
}

/// Tracks how long a condition has held without interruption
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SustainTracker {
    since: Option<Instant>,
}

impl SustainTracker {
    pub const fn new() -> Self {
        Self { since: None }
    }

    /// Record a sample; returns the deadline at which the condition counts as sustained
    pub fn observe(&mut self, holds: bool, window: Duration, now: Instant) -> Option<Instant> {
        if holds {
            let since = *self.since.get_or_insert(now);
            Some(since + window)
        } else {
            self.since = None;
            None
        }
    }

    pub fn sustained(&self, window: Duration, now: Instant) -> bool {
        self.since.is_some_and(|s| now >= s + window)
    }

    pub fn deadline(&self, window: Duration) -> Option<Instant> {
        self.since.map(|s| s + window)
    }

    pub const fn since(&self) -> Option<Instant> {
        self.since
    }

    pub const fn is_tracking(&self) -> bool {
        self.since.is_some()
    }

    pub fn reset(&mut self) {
        self.since = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PhaseSwitchConfig, SupplyProfile};

    #[test]
    fn test_eco_selects_pair() {
        let cfg = ControllerConfig::default();
        let b = active_band(&cfg, true, false, 0);
        assert_eq!((b.upper_w, b.lower_w), (4000, -2000));
        let b = active_band(&cfg, false, false, 0);
        assert_eq!((b.upper_w, b.lower_w), (-2000, -7000));
    }

    #[test]
    fn test_alternate_set_needs_phase_support() {
        let mut cfg = ControllerConfig::default();
        let b = active_band(&cfg, true, true, 0);
        assert_eq!(b.upper_w, 4000);
        cfg.phase_switch = Some(PhaseSwitchConfig::default());
        let b = active_band(&cfg, true, true, 0);
        assert_eq!((b.upper_w, b.lower_w), (1700, -1000));
    }

    #[test]
    fn test_import_limit_overrides_when_stricter() {
        let cfg = ControllerConfig::default();
        let b = active_band(&cfg, false, false, 5000);
        assert_eq!(b.lower_w, -5000);
        assert_eq!(b.upper_w, -5000 + 4500);
        assert!(b.import_limited);
        assert!(b.upper_w > b.lower_w);

        // eco on lower (-2000) is already stricter than -5000
        let b = active_band(&cfg, true, false, 5000);
        assert_eq!((b.upper_w, b.lower_w), (4000, -2000));
        assert!(!b.import_limited);
    }

    #[test]
    fn test_import_limit_uses_single_phase_band() {
        let cfg = ControllerConfig {
            supply_profile: SupplyProfile::Eu3Ph400,
            phase_switch: Some(PhaseSwitchConfig::default()),
            ..ControllerConfig::default()
        };
        let b = active_band(&cfg, false, true, 2000);
        assert_eq!((b.upper_w, b.lower_w), (-2000 + 1700, -2000));
    }

    #[test]
    fn test_sustain_tracker() {
        let t0 = Instant::now();
        let w = Duration::from_secs(120);
        let mut t = SustainTracker::new();
        assert_eq!(t.observe(true, w, t0), Some(t0 + w));
        assert_eq!(t.observe(true, w, t0 + Duration::from_secs(100)), Some(t0 + w));
        assert!(!t.sustained(w, t0 + Duration::from_secs(119)));
        assert!(t.sustained(w, t0 + w));
        assert_eq!(t.observe(false, w, t0 + Duration::from_secs(121)), None);
        assert!(!t.is_tracking());
    }
}
