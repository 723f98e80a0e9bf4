use super::*;

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            timezone: "Europe/Amsterdam".to_string(),
            storage_dir: "/data/evcm".to_string(),
            logging: LoggingConfig::default(),
            priority: PriorityConfig::default(),
            chargers: Vec::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "INFO".to_string(),
            file: None,
            backup_count: 5,
            console_output: true,
            json_format: false,
        }
    }
}

impl Default for PriorityConfig {
    fn default() -> Self {
        Self {
            mode_enabled: false,
        }
    }
}

impl Default for GridConfig {
    fn default() -> Self {
        Self::Single {
            net_power: String::new(),
        }
    }
}

impl ThresholdSet {
    /// Three-phase eco on/off defaults
    pub const PRIMARY: Self = Self {
        eco_on_upper: 4000,
        eco_on_lower: -2000,
        eco_off_upper: -2000,
        eco_off_lower: -7000,
    };

    /// Single-phase defaults
    pub const ALTERNATE: Self = Self {
        eco_on_upper: 1700,
        eco_on_lower: -1000,
        eco_off_upper: -1000,
        eco_off_lower: -3500,
    };
}

impl Default for ThresholdSet {
    fn default() -> Self {
        Self::PRIMARY
    }
}

impl Default for PhaseSwitchConfig {
    fn default() -> Self {
        Self {
            control_mode: PhaseControlMode::Integration,
            feedback_entity: None,
            single_phase_profile: SupplyProfile::Eu1Ph230,
            cooldown_s: 300,
            veto_s: 10,
            wait_for_stop_s: 60,
            stopped_power_w: 50,
            feedback_timeout_s: 300,
            auto_delay_min: 15,
            auto_reset_grace_s: 180,
            upshift_margin_w: 1000,
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            grid: GridConfig::default(),
            entities: EntityConfig::default(),
            supply_profile: SupplyProfile::Eu3Ph400,
            thresholds: ThresholdSet::PRIMARY,
            alternate_thresholds: ThresholdSet::ALTERNATE,
            scan_interval_s: 30,
            sustain_s: 120,
            upper_debounce_s: 3,
            max_current_a: 16,
            phase_switch: None,
            reclaim: ReclaimPolicy::default(),
        }
    }
}
