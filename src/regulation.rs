//! Current regulation step
//!
//! A discrete integral controller: each tick moves the current setting by at
//! most one ampere towards the net power target.

use crate::config::{MIN_CURRENT_A, ProfileSpec};
use serde::Serialize;

/// Everything one regulation tick looks at
#[derive(Debug, Clone, Copy)]
pub struct RegulationInput {
    pub net_w: f64,
    pub target_w: i32,
    pub charge_power_w: Option<f64>,
    pub status_charging: bool,
    pub current_a: u8,
    pub max_current_a: u8,
    /// At least one scan interval passed since regulation started
    pub warmed_up: bool,
    pub profile: ProfileSpec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Adjustment {
    Hold,
    Increase(u8),
    Decrease(u8),
}

impl Adjustment {
    pub const fn new_current(self) -> Option<u8> {
        match self {
            Self::Hold => None,
            Self::Increase(a) | Self::Decrease(a) => Some(a),
        }
    }
}

/// Next current setting for one tick
pub fn next_current(input: &RegulationInput) -> Adjustment {
    if !input.status_charging || !input.warmed_up {
        return Adjustment::Hold;
    }
    let max = input.max_current_a.max(MIN_CURRENT_A);
    // Above the configured max: step down whatever the grid does
    if input.current_a > max {
        return Adjustment::Decrease(input.current_a - 1);
    }
    let deviation = input.net_w - f64::from(input.target_w);
    let export_w = deviation.max(0.0);
    let import_w = (-deviation).max(0.0);

    let drawing = input
        .charge_power_w
        .is_some_and(|p| p >= f64::from(input.profile.regulation_min_w));

    if drawing && export_w >= f64::from(input.profile.export_inc_w) && input.current_a < max {
        return Adjustment::Increase(input.current_a.saturating_add(1).min(max));
    }
    if import_w >= f64::from(input.profile.import_dec_w) && input.current_a > MIN_CURRENT_A {
        return Adjustment::Decrease(input.current_a - 1);
    }
    Adjustment::Hold
}
