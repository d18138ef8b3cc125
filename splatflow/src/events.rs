//! Structured event sink for pipeline and process observability.
//!
//! Instead of a global mutable logger, a sink is passed explicitly into
//! [`crate::pipeline::PipelineEngine`] and [`crate::process::ProcessRunner`]
//! at construction. Tests assert on emitted events through
//! [`CollectingEventSink`] rather than captured stdout.

use tracing::{debug, error, info, warn};

/// Severity of an emitted event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventLevel {
    /// Diagnostic detail.
    Debug,
    /// Normal progress information.
    Info,
    /// Recoverable problems (missing optional artifacts, skipped stages).
    Warn,
    /// Failures (nonzero exit codes, aborted pipeline).
    Error,
}

/// Trait for event sinks that receive structured pipeline events.
pub trait EventSink: Send + Sync {
    /// Emits an event.
    ///
    /// # Arguments
    ///
    /// * `level` - Event severity
    /// * `step` - The step or component the event belongs to (e.g., "OpenSplat")
    /// * `message` - Human-readable message
    /// * `fields` - Optional structured payload
    fn emit(&self, level: EventLevel, step: &str, message: &str, fields: Option<serde_json::Value>);
}

/// A no-op event sink that discards all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

impl EventSink for NoOpEventSink {
    fn emit(
        &self,
        _level: EventLevel,
        _step: &str,
        _message: &str,
        _fields: Option<serde_json::Value>,
    ) {
        // Intentionally empty - discards all events
    }
}

/// An event sink that forwards events to the tracing framework.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, level: EventLevel, step: &str, message: &str, fields: Option<serde_json::Value>) {
        match level {
            EventLevel::Debug => debug!(step = %step, fields = ?fields, "[{}] {}", step, message),
            EventLevel::Info => info!(step = %step, fields = ?fields, "[{}] {}", step, message),
            EventLevel::Warn => warn!(step = %step, fields = ?fields, "[{}] {}", step, message),
            EventLevel::Error => error!(step = %step, fields = ?fields, "[{}] {}", step, message),
        }
    }
}

/// One event captured by [`CollectingEventSink`].
#[derive(Debug, Clone)]
pub struct EmittedEvent {
    /// Event severity.
    pub level: EventLevel,
    /// Step the event was tagged with.
    pub step: String,
    /// Human-readable message.
    pub message: String,
    /// Structured payload, if any.
    pub fields: Option<serde_json::Value>,
}

/// A collecting event sink for testing purposes.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: parking_lot::RwLock<Vec<EmittedEvent>>,
}

impl CollectingEventSink {
    /// Creates a new collecting sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected events.
    #[must_use]
    pub fn events(&self) -> Vec<EmittedEvent> {
        self.events.read().clone()
    }

    /// Returns the number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if no events have been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Returns events whose message contains the given fragment.
    #[must_use]
    pub fn events_matching(&self, fragment: &str) -> Vec<EmittedEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.message.contains(fragment))
            .cloned()
            .collect()
    }

    /// Returns events at the given level.
    #[must_use]
    pub fn events_at(&self, level: EventLevel) -> Vec<EmittedEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.level == level)
            .cloned()
            .collect()
    }
}

impl EventSink for CollectingEventSink {
    fn emit(&self, level: EventLevel, step: &str, message: &str, fields: Option<serde_json::Value>) {
        self.events.write().push(EmittedEvent {
            level,
            step: step.to_string(),
            message: message.to_string(),
            fields,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noop_sink() {
        let sink = NoOpEventSink;
        sink.emit(EventLevel::Info, "test", "hello", None);
        // Should not panic
    }

    #[test]
    fn test_tracing_sink() {
        let sink = TracingEventSink;
        sink.emit(
            EventLevel::Warn,
            "OpenSplat",
            "probe failed",
            Some(serde_json::json!({"exit_code": 1})),
        );
        // Should not panic
    }

    #[test]
    fn test_collecting_sink() {
        let sink = CollectingEventSink::new();
        assert!(sink.is_empty());

        sink.emit(EventLevel::Info, "sfm", "Stage started", None);
        sink.emit(
            EventLevel::Error,
            "sfm",
            "Failed with exit code 1",
            Some(serde_json::json!({"exit_code": 1})),
        );

        assert_eq!(sink.len(), 2);
        assert_eq!(sink.events_at(EventLevel::Error).len(), 1);
        assert_eq!(sink.events_matching("Stage started").len(), 1);
        assert_eq!(sink.events()[0].step, "sfm");
    }
}
