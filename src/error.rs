//! Error types and handling for evcm
//!
//! Sensor unavailability is deliberately absent here: an unknown entity state is
//! modelled as `None` by the sensor adapter and never surfaces as an error.

use thiserror::Error;

/// Result type alias for evcm operations
pub type Result<T> = std::result::Result<T, EvcmError>;

/// Main error type for evcm
#[derive(Debug, Error)]
pub enum EvcmError {
    /// Configuration-related errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Field-level validation errors; `message` carries the stable error code
    #[error("Validation error: {field} - {message}")]
    Validation { field: String, message: String },

    /// Serialization/deserialization errors
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// File I/O errors
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Persistent key-value store errors
    #[error("Storage error: {message}")]
    Storage { message: String },

    /// Downstream service call failures
    #[error("Command error: {message}")]
    Command { message: String },

    /// Timeout errors
    #[error("Timeout error: {message}")]
    Timeout { message: String },

    /// Priority arbitration errors
    #[error("Priority error: {message}")]
    Priority { message: String },

    /// Phase switching errors
    #[error("Phase switch error: {message}")]
    PhaseSwitch { message: String },

    /// Generic errors with context
    #[error("Error: {message}")]
    Generic { message: String },
}

impl EvcmError {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a new validation error
    pub fn validation<F: Into<String>, S: Into<String>>(field: F, message: S) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a new serialization error
    pub fn serialization<S: Into<String>>(message: S) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    /// Create a new storage error
    pub fn storage<S: Into<String>>(message: S) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Create a new command error
    pub fn command<S: Into<String>>(message: S) -> Self {
        Self::Command {
            message: message.into(),
        }
    }

    /// Create a new timeout error
    pub fn timeout<S: Into<String>>(message: S) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    /// Create a new priority error
    pub fn priority<S: Into<String>>(message: S) -> Self {
        Self::Priority {
            message: message.into(),
        }
    }

    /// Create a new phase switch error
    pub fn phase_switch<S: Into<String>>(message: S) -> Self {
        Self::PhaseSwitch {
            message: message.into(),
        }
    }

    /// Create a new generic error
    pub fn generic<S: Into<String>>(message: S) -> Self {
        Self::Generic {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for EvcmError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

impl From<serde_yaml::Error> for EvcmError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::serialization(err.to_string())
    }
}

impl From<serde_json::Error> for EvcmError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}

impl From<chrono::ParseError> for EvcmError {
    fn from(err: chrono::ParseError) -> Self {
        Self::validation("datetime", err.to_string())
    }
}
