//! Human-readable event messages for display.
//!
//! [`EventLayer`] copies every info-or-louder tracing event into a bounded
//! [`EventLog`] that a front-end can read at any time.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::field::{Field, Visit};
use tracing::{Level, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::Context;

pub const DEFAULT_CAPACITY: usize = 200;
const EMPTY_MESSAGE: &str = "No Messages!";

#[derive(Debug, Clone, PartialEq)]
pub struct EventMessage {
    pub level: Level,
    pub target: String,
    pub message: String,
    pub timestamp_ms: i64,
}

/// Ring buffer of the most recent event messages.
pub struct EventLog {
    buffer: Mutex<VecDeque<EventMessage>>,
    capacity: usize,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
        }
    }

    pub fn publish(&self, event: EventMessage) {
        if let Ok(mut buffer) = self.buffer.lock() {
            buffer.push_back(event);
            while buffer.len() > self.capacity {
                buffer.pop_front();
            }
        }
    }

    pub fn last_message(&self) -> String {
        self.buffer
            .lock()
            .ok()
            .and_then(|buf| buf.back().map(|e| e.message.clone()))
            .unwrap_or_else(|| EMPTY_MESSAGE.to_string())
    }

    pub fn all(&self) -> Vec<EventMessage> {
        self.buffer
            .lock()
            .map(|buf| buf.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn count(&self) -> usize {
        self.buffer.lock().map(|buf| buf.len()).unwrap_or(0)
    }
}

pub struct EventLayer {
    log: Arc<EventLog>,
}

impl EventLayer {
    pub fn new(log: Arc<EventLog>) -> Self {
        Self { log }
    }
}

impl<S> Layer<S> for EventLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        if level > Level::INFO {
            return;
        }
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let mut message = visitor.message.unwrap_or_else(|| "event".to_string());
        if !visitor.fields.is_empty() {
            message = format!("{message} {}", visitor.fields.join(" "));
        }
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        self.log.publish(EventMessage {
            level,
            target: event.metadata().target().to_string(),
            message,
            timestamp_ms,
        });
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: Option<String>,
    fields: Vec<String>,
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.fields.push(format!("{}={}", field.name(), value));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let formatted = format!("{value:?}");
        if field.name() == "message" {
            self.message = Some(formatted.trim_matches('"').to_string());
        } else {
            self.fields.push(format!("{}={}", field.name(), formatted));
        }
    }
}
