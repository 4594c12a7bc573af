mod nats;

use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use nats::{NatsPublisher, NatsPublisherConfig};

/// Envelope schema version.
pub const ENVELOPE_VERSION: &str = "1.0";

/// Domain event types. The serialized name doubles as the bus subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "queue.position.enqueued")]
    PositionEnqueued,
    #[serde(rename = "queue.position.admitted")]
    PositionAdmitted,
    #[serde(rename = "queue.position.expired")]
    PositionExpired,
    #[serde(rename = "queue.position.cancelled")]
    PositionCancelled,
    #[serde(rename = "queue.position.heartbeat")]
    PositionHeartbeat,
    #[serde(rename = "queue.session.started")]
    SessionStarted,
    #[serde(rename = "queue.session.active")]
    SessionActive,
    #[serde(rename = "queue.session.expired")]
    SessionExpired,
    #[serde(rename = "queue.session.terminated")]
    SessionTerminated,
    #[serde(rename = "queue.queue.created")]
    QueueCreated,
    #[serde(rename = "queue.queue.updated")]
    QueueUpdated,
    #[serde(rename = "queue.queue.paused")]
    QueuePaused,
    #[serde(rename = "queue.queue.resumed")]
    QueueResumed,
    #[serde(rename = "queue.queue.maintenance")]
    QueueMaintenance,
    #[serde(rename = "queue.system.health")]
    SystemHealth,
    #[serde(rename = "queue.system.error")]
    SystemError,
}

impl EventType {
    /// The bus subject this event is published on.
    pub fn subject(self) -> &'static str {
        match self {
            EventType::PositionEnqueued => "queue.position.enqueued",
            EventType::PositionAdmitted => "queue.position.admitted",
            EventType::PositionExpired => "queue.position.expired",
            EventType::PositionCancelled => "queue.position.cancelled",
            EventType::PositionHeartbeat => "queue.position.heartbeat",
            EventType::SessionStarted => "queue.session.started",
            EventType::SessionActive => "queue.session.active",
            EventType::SessionExpired => "queue.session.expired",
            EventType::SessionTerminated => "queue.session.terminated",
            EventType::QueueCreated => "queue.queue.created",
            EventType::QueueUpdated => "queue.queue.updated",
            EventType::QueuePaused => "queue.queue.paused",
            EventType::QueueResumed => "queue.queue.resumed",
            EventType::QueueMaintenance => "queue.queue.maintenance",
            EventType::SystemHealth => "queue.system.health",
            EventType::SystemError => "queue.system.error",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.subject())
    }
}

/// Event envelope as published on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub version: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    pub queue_id: String,
    pub data: serde_json::Value,
}

/// Destination for domain events. `publish` must never block and must never
/// fail the calling operation: delivery effort is the sink's problem.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: Event);
}

/// Cheap cloneable handle the core components emit through. Stamps the
/// envelope (id, version, timestamp, source) so call sites only supply the
/// event type, queue, and payload.
#[derive(Clone)]
pub struct Events {
    sink: Arc<dyn EventSink>,
    source: String,
}

impl Events {
    pub fn new(sink: Arc<dyn EventSink>, source: impl Into<String>) -> Self {
        Self {
            sink,
            source: source.into(),
        }
    }

    /// A handle that drops everything; for tests and tools that don't care.
    pub fn disabled() -> Self {
        struct Discard;
        impl EventSink for Discard {
            fn publish(&self, _event: Event) {}
        }
        Self::new(Arc::new(Discard), "disabled")
    }

    pub fn emit(&self, event_type: EventType, queue_id: &str, data: serde_json::Value) {
        self.emit_traced(event_type, queue_id, data, None)
    }

    pub fn emit_traced(
        &self,
        event_type: EventType,
        queue_id: &str,
        data: serde_json::Value,
        trace_id: Option<String>,
    ) {
        self.sink.publish(Event {
            id: Uuid::now_v7(),
            version: ENVELOPE_VERSION.to_string(),
            event_type,
            timestamp: Utc::now(),
            source: self.source.clone(),
            trace_id,
            queue_id: queue_id.to_string(),
            data,
        });
    }
}

/// Collecting sink for tests: records everything published.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<Event>>,
}

impl MemorySink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn take(&self) -> Vec<Event> {
        self.events.lock().map(|mut e| std::mem::take(&mut *e)).unwrap_or_default()
    }

    pub fn snapshot(&self) -> Vec<Event> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn count_of(&self, event_type: EventType) -> usize {
        self.events
            .lock()
            .map(|e| e.iter().filter(|ev| ev.event_type == event_type).count())
            .unwrap_or(0)
    }
}

impl EventSink for MemorySink {
    fn publish(&self, event: Event) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
