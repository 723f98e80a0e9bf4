//! # evcm - EV charge manager
//!
//! Surplus-driven charging controller for home wallboxes. Each charger is
//! driven by its own controller that follows the grid export with a
//! hysteresis band, regulates the charging current, honours the planner
//! window and the vehicle state-of-charge limit, and coordinates 1p/3p
//! phase switching. Several chargers share one priority arbiter so only
//! the charger holding priority draws the surplus.
//!
//! ## Architecture
//!
//! - `config`: YAML configuration, defaults and validation
//! - `logging`: structured logging and tracing
//! - `sensor`: entity state store and typed readings
//! - `hysteresis`: threshold bands and sustain timers
//! - `regulation`: current regulation step
//! - `phase`: phase-switch state machine
//! - `priority`: shared priority arbiter
//! - `controls`: user modes, planner window and limits
//! - `persistence`: versioned state blobs
//! - `dispatch`: outbound service calls and notifications
//! - `controller`: per-charger decision core and its async actor
//! - `supervisor`: owns all controllers and routes state changes
//! - `bridge`: JSON-lines host bridge used by the `evcm` binary

pub mod bridge;
pub mod clock;
pub mod config;
pub mod controller;
pub mod controls;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod hysteresis;
pub mod logging;
pub mod persistence;
pub mod phase;
pub mod priority;
pub mod regulation;
pub mod sensor;
pub mod supervisor;

// Re-export commonly used types
pub use config::{AppConfig, ControllerConfig};
pub use controller::{ChargeController, ControllerHandle, ControllerStatus, UserCommand};
pub use error::{EvcmError, Result};
pub use priority::PriorityArbiter;
pub use supervisor::Supervisor;
