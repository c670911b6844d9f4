//! Lifecycle events emitted by the pipeline.
//!
//! The engine never formats or displays events; it hands them to an
//! [`EventSink`] passed into each run, so concurrent runs report independently.

use parking_lot::Mutex;
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ReadLasHeaderStarted,
    ReadLasHeaderCompleted,
    ReadLasHeaderError,
    PointLoadingStarted,
    PointLoadingCompleted,
    PointLoadingError,
    BuildStarted,
    BuildCompleted,
    BuildError,
    ExportStarted,
    ExportCompleted,
    ExportError,
}

impl EventKind {
    pub fn is_error(self) -> bool {
        matches!(
            self,
            EventKind::ReadLasHeaderError
                | EventKind::PointLoadingError
                | EventKind::BuildError
                | EventKind::ExportError
        )
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventKind::ReadLasHeaderStarted => "read_header_started",
            EventKind::ReadLasHeaderCompleted => "read_header_completed",
            EventKind::ReadLasHeaderError => "read_header_error",
            EventKind::PointLoadingStarted => "point_loading_started",
            EventKind::PointLoadingCompleted => "point_loading_completed",
            EventKind::PointLoadingError => "point_loading_error",
            EventKind::BuildStarted => "build_started",
            EventKind::BuildCompleted => "build_completed",
            EventKind::BuildError => "build_error",
            EventKind::ExportStarted => "export_started",
            EventKind::ExportCompleted => "export_completed",
            EventKind::ExportError => "export_error",
        };

        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct TilerEvent {
    pub kind: EventKind,
    /// Job (or file) the event refers to.
    pub subject: String,
    /// Time spent in the stage so far.
    pub elapsed: Duration,
    pub message: String,
}

/// Pure consumer of lifecycle events.
pub trait EventSink: Send + Sync {
    fn on_event(&self, event: &TilerEvent);
}

impl<F> EventSink for F
where
    F: Fn(&TilerEvent) + Send + Sync,
{
    fn on_event(&self, event: &TilerEvent) {
        self(event)
    }
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn on_event(&self, _event: &TilerEvent) {}
}

/// Forwards events to the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl EventSink for LogSink {
    fn on_event(&self, event: &TilerEvent) {
        if event.kind.is_error() {
            log::error!(
                "[{}] {} ({:.3}s)",
                event.subject,
                event.message,
                event.elapsed.as_secs_f64()
            );
        } else {
            log::info!(
                "[{}] {} ({:.3}s)",
                event.subject,
                event.message,
                event.elapsed.as_secs_f64()
            );
        }
    }
}

/// Keeps every event in memory, in arrival order.
#[derive(Debug, Default)]
pub struct CollectingSink {
    events: Mutex<Vec<TilerEvent>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TilerEvent> {
        self.events.lock().clone()
    }

    /// Kinds seen for `subject`, in order.
    pub fn kinds_for(&self, subject: &str) -> Vec<EventKind> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.subject == subject)
            .map(|e| e.kind)
            .collect()
    }
}

impl EventSink for CollectingSink {
    fn on_event(&self, event: &TilerEvent) {
        self.events.lock().push(event.clone());
    }
}
