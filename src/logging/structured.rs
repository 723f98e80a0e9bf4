use std::collections::BTreeMap;
use tracing::{debug, error, info, trace, warn};

/// Context attached to every message of a [`StructuredLogger`]
#[derive(Debug, Clone)]
pub struct LogContext {
    /// Component name (e.g., "controller", "priority", "bridge")
    pub component: String,
    /// Charger this logger speaks for
    pub charger_id: Option<String>,
    /// Per-cable-session id, regenerated on every connect
    pub session_id: Option<String>,
    /// Additional context fields, emitted in key order
    pub extra_fields: BTreeMap<String, String>,
}

impl LogContext {
    pub fn new(component: &str) -> Self {
        Self {
            component: component.to_string(),
            charger_id: None,
            session_id: None,
            extra_fields: BTreeMap::new(),
        }
    }

    pub fn with_charger(mut self, charger_id: &str) -> Self {
        self.charger_id = Some(charger_id.to_string());
        self
    }

    pub fn with_session_id(mut self, session_id: String) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn with_field(mut self, key: &str, value: String) -> Self {
        self.extra_fields.insert(key.to_string(), value);
        self
    }
}

/// Structured logger with context
#[derive(Debug, Clone)]
pub struct StructuredLogger {
    pub(crate) context: LogContext,
}

impl StructuredLogger {
    pub fn new(context: LogContext) -> Self {
        Self { context }
    }

    /// Replace the session id, e.g. when a new cable session starts
    pub fn set_session(&mut self, session_id: Option<String>) {
        self.context.session_id = session_id;
    }

    pub fn session_id(&self) -> Option<&str> {
        self.context.session_id.as_deref()
    }

    pub fn info(&self, message: &str) {
        let fields = self.format_fields();
        info!(%fields, "{}", message);
    }

    pub fn warn(&self, message: &str) {
        let fields = self.format_fields();
        warn!(%fields, "{}", message);
    }

    pub fn error(&self, message: &str) {
        let fields = self.format_fields();
        error!(%fields, "{}", message);
    }

    pub fn debug(&self, message: &str) {
        let fields = self.format_fields();
        debug!(%fields, "{}", message);
    }

    pub fn trace(&self, message: &str) {
        let fields = self.format_fields();
        trace!(%fields, "{}", message);
    }

    fn format_fields(&self) -> String {
        let mut fields = vec![format!("component={}", self.context.component)];
        if let Some(ref id) = self.context.charger_id {
            fields.push(format!("charger={id}"));
        }
        if let Some(ref session_id) = self.context.session_id {
            fields.push(format!("session_id={session_id}"));
        }
        for (key, value) in &self.context.extra_fields {
            fields.push(format!("{key}={value}"));
        }
        fields.join(",")
    }
}

/// Create a logger for a specific component
pub fn get_logger(component: &str) -> StructuredLogger {
    StructuredLogger::new(LogContext::new(component))
}

/// Create a logger with full context
pub fn get_logger_with_context(context: LogContext) -> StructuredLogger {
    StructuredLogger::new(context)
}
