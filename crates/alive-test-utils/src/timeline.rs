//! Ordered record of `tracing` events and test markers
//!
//! Fakes push markers (`"suspend"`, `"write"`, ...) into the same timeline the
//! subscriber appends events to, so tests can check what was logged and when.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::prelude::*;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimelineEntry {
    Event { level: Level, message: String },
    Marker(String),
}

/// Shared, cloneable timeline; also a `tracing_subscriber` layer
#[derive(Debug, Clone, Default)]
pub struct Timeline {
    entries: Arc<Mutex<Vec<TimelineEntry>>>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&self, marker: &str) {
        self.entries
            .lock()
            .push(TimelineEntry::Marker(marker.to_string()));
    }

    pub fn entries(&self) -> Vec<TimelineEntry> {
        self.entries.lock().clone()
    }

    /// Messages of every event logged at `level`
    pub fn messages_at(&self, level: Level) -> Vec<String> {
        self.entries
            .lock()
            .iter()
            .filter_map(|entry| match entry {
                TimelineEntry::Event { level: l, message } if *l == level => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    /// Entries recorded between each `open` marker and the next `close` marker
    pub fn between(&self, open: &str, close: &str) -> Vec<TimelineEntry> {
        let mut inside = false;
        let mut found = Vec::new();
        for entry in self.entries.lock().iter() {
            match entry {
                TimelineEntry::Marker(m) if m == open => inside = true,
                TimelineEntry::Marker(m) if m == close => inside = false,
                other if inside => found.push(other.clone()),
                _ => {}
            }
        }
        found
    }

    /// Subscriber recording into this timeline, for `tracing::subscriber::with_default`
    pub fn subscriber(&self) -> impl Subscriber + Send + Sync + 'static {
        tracing_subscriber::registry().with(self.clone())
    }
}

impl<S: Subscriber> Layer<S> for Timeline {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        self.entries.lock().push(TimelineEntry::Event {
            level: *event.metadata().level(),
            message: visitor.0,
        });
    }
}

#[derive(Default)]
struct MessageVisitor(String);

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.0 = format!("{:?}", value);
        }
    }
}
