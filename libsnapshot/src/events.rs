//! User-visible events attached to objects.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::{ObjectReference, Resource};

pub const REASON_SNAPSHOT_CREATED: &str = "SnapshotCreated";
pub const REASON_SNAPSHOT_READY: &str = "SnapshotReady";
pub const REASON_SNAPSHOT_CREATION_FAILED: &str = "SnapshotCreationFailed";
pub const REASON_CREATE_CONTENT_FAILED: &str = "CreateSnapshotContentFailed";
pub const REASON_CLASS_RESOLUTION_FAILED: &str = "GetSnapshotClassFailed";
pub const REASON_CONTENT_MISSING: &str = "SnapshotContentMissing";
pub const REASON_SNAPSHOT_LOST: &str = "SnapshotLost";
pub const REASON_SNAPSHOT_MISBOUND: &str = "SnapshotMisbound";
pub const REASON_BIND_FAILED: &str = "SnapshotBindFailed";
pub const REASON_STATUS_CHECK_FAILED: &str = "SnapshotStatusCheckFailed";
pub const REASON_INVALID_SOURCE: &str = "InvalidSnapshotSource";
pub const REASON_CONTENT_ORPHANED: &str = "SnapshotContentOrphaned";
pub const REASON_SNAPSHOT_DELETED: &str = "SnapshotDeleted";
pub const REASON_SNAPSHOT_DELETE_FAILED: &str = "SnapshotDeleteFailed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    Normal,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub involved_object: ObjectReference,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub reason: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Sink for events.
pub trait EventRecorder: Send + Sync {
    fn record(&self, event: Event);

    fn normal<K: Resource>(&self, obj: &K, reason: &str, message: &str)
    where
        Self: Sized,
    {
        self.record(event(obj, EventType::Normal, reason, message));
    }

    fn warning<K: Resource>(&self, obj: &K, reason: &str, message: &str)
    where
        Self: Sized,
    {
        self.record(event(obj, EventType::Warning, reason, message));
    }
}

/// Build an event about `obj`.
pub fn event<K: Resource>(obj: &K, event_type: EventType, reason: &str, message: &str) -> Event {
    Event {
        involved_object: ObjectReference::to(obj),
        event_type,
        reason: reason.to_owned(),
        message: message.to_owned(),
        timestamp: Utc::now(),
    }
}

/// Bounded in-memory recorder that also mirrors events into `tracing`.
#[derive(Debug)]
pub struct EventLog {
    events: Mutex<Vec<Event>>,
    capacity: usize,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventLog {
    /// Keep at most `capacity` events, dropping the oldest.
    pub fn new(capacity: usize) -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            capacity: capacity.max(1),
        }
    }

    /// Every retained event, oldest first.
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    /// Reasons recorded for the object with this kind and name, oldest first.
    pub fn reasons_for(&self, kind: &str, name: &str) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.involved_object.kind == kind && e.involved_object.name == name)
            .map(|e| e.reason.clone())
            .collect()
    }

    /// Whether any retained event carries `reason`.
    pub fn contains_reason(&self, reason: &str) -> bool {
        self.events.lock().iter().any(|e| e.reason == reason)
    }
}

impl EventRecorder for EventLog {
    fn record(&self, event: Event) {
        match event.event_type {
            EventType::Normal => info!(
                object = %event.involved_object,
                reason = %event.reason,
                "{}",
                event.message
            ),
            EventType::Warning => warn!(
                object = %event.involved_object,
                reason = %event.reason,
                "{}",
                event.message
            ),
        }
        let mut events = self.events.lock();
        if events.len() >= self.capacity {
            events.remove(0);
        }
        events.push(event);
    }
}
