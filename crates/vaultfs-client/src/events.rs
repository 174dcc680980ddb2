//! Engine events for front-ends.
//!
//! Every event is also logged through `tracing` at the matching level.

use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

/// Severity of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EventLevel {
    /// Normal progress, such as a finished upload.
    Info,
    /// A transient failure that will be retried.
    Warning,
    /// An operation failed.
    Error,
    /// Local resources are exhausted.
    Critical,
}

impl std::fmt::Display for EventLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventLevel::Info => "INFO",
            EventLevel::Warning => "WARNING",
            EventLevel::Error => "ERROR",
            EventLevel::Critical => "CRITICAL",
        };
        f.write_str(s)
    }
}

/// A single event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Severity.
    pub level: EventLevel,
    /// Emitting component, e.g. `"upload"` or `"journal"`.
    pub source: String,
    /// Human-readable description.
    pub message: String,
}

/// Callback receiving events.
pub type EventListener = Arc<dyn Fn(&Event) + Send + Sync>;

/// Fan-out of events to subscribed listeners.
#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<Vec<(EventLevel, EventListener)>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listeners.read().len())
            .finish()
    }
}

impl EventBus {
    /// Creates a bus with no listeners.
    pub fn new() -> Self {
        Self::default()
    }

    /// Delivers events at `min_level` or above to `listener`.
    pub fn subscribe(&self, min_level: EventLevel, listener: EventListener) {
        self.listeners.write().push((min_level, listener));
    }

    /// Emits an event.
    pub fn emit(&self, level: EventLevel, source: &str, message: impl Into<String>) {
        let event = Event {
            level,
            source: source.to_string(),
            message: message.into(),
        };
        match level {
            EventLevel::Info => info!(source, "{}", event.message),
            EventLevel::Warning => warn!(source, "{}", event.message),
            EventLevel::Error | EventLevel::Critical => error!(source, level = %level, "{}", event.message),
        }
        let listeners: Vec<EventListener> = self
            .listeners
            .read()
            .iter()
            .filter(|(min, _)| level >= *min)
            .map(|(_, l)| l.clone())
            .collect();
        for listener in listeners {
            listener(&event);
        }
    }

    /// Emits at INFO.
    pub fn info(&self, source: &str, message: impl Into<String>) {
        self.emit(EventLevel::Info, source, message);
    }

    /// Emits at WARNING.
    pub fn warning(&self, source: &str, message: impl Into<String>) {
        self.emit(EventLevel::Warning, source, message);
    }

    /// Emits at ERROR.
    pub fn error(&self, source: &str, message: impl Into<String>) {
        self.emit(EventLevel::Error, source, message);
    }

    /// Emits at CRITICAL.
    pub fn critical(&self, source: &str, message: impl Into<String>) {
        self.emit(EventLevel::Critical, source, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_level_filtering() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.subscribe(
            EventLevel::Error,
            Arc::new(move |e: &Event| sink.lock().push(e.level)),
        );
        bus.info("test", "ignored");
        bus.warning("test", "ignored");
        bus.error("test", "kept");
        bus.critical("test", "kept");
        assert_eq!(*seen.lock(), vec![EventLevel::Error, EventLevel::Critical]);
    }

    #[test]
    fn test_levels_ordered() {
        assert!(EventLevel::Info < EventLevel::Warning);
        assert!(EventLevel::Error < EventLevel::Critical);
        assert_eq!(EventLevel::Critical.to_string(), "CRITICAL");
    }
}
