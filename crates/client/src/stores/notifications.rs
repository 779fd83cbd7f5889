//! Notification store: bounded history of change notifications and the
//! read/unread projection over it.
//!
//! Both the realtime connection and the polling engine deliver into the same
//! [`NotificationSink`], so switching engines never loses or duplicates
//! records that were already delivered.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use backdesk_shared::{ChangeKind, NotificationRecord};
use serde_json::Value;
use tokio::sync::broadcast;

/// Maximum number of records kept. The oldest record is evicted past this.
pub const NOTIFICATION_CAPACITY: usize = 100;

const UPDATES_CAPACITY: usize = 256;

/// Ordered notification history, newest first.
///
/// There is no stored unread counter: [`unread_count`](Self::unread_count) is
/// derived from the records on every read, so it cannot drift.
#[derive(Debug, Clone)]
pub struct NotificationBuffer {
    records: VecDeque<NotificationRecord>,
    capacity: usize,
}

impl NotificationBuffer {
    pub fn new() -> Self {
        Self::with_capacity(NOTIFICATION_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Insert at the head. Returns the evicted tail record, if any.
    pub fn append(&mut self, record: NotificationRecord) -> Option<NotificationRecord> {
        self.records.push_front(record);
        if self.records.len() > self.capacity {
            self.records.pop_back()
        } else {
            None
        }
    }

    /// Mark one record read. Returns true if it existed and was unread.
    pub fn mark_read(&mut self, id: &str) -> bool {
        match self.records.iter_mut().find(|r| r.id == id) {
            Some(record) if !record.read => {
                record.read = true;
                true
            }
            _ => false,
        }
    }

    pub fn mark_all_read(&mut self) {
        for record in self.records.iter_mut() {
            record.read = true;
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<NotificationRecord> {
        let index = self.records.iter().position(|r| r.id == id)?;
        self.records.remove(index)
    }

    pub fn get(&self, id: &str) -> Option<&NotificationRecord> {
        self.records.iter().find(|r| r.id == id)
    }

    pub fn unread_count(&self) -> usize {
        self.records.iter().filter(|r| !r.read).count()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Records, newest first.
    pub fn iter(&self) -> impl Iterator<Item = &NotificationRecord> {
        self.records.iter()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}

impl Default for NotificationBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared handle that change sources deliver into.
///
/// Cloning is cheap; every clone refers to the same buffer. Each delivered
/// record is also broadcast to live listeners.
#[derive(Debug, Clone)]
pub struct NotificationSink {
    buffer: Arc<Mutex<NotificationBuffer>>,
    updates: broadcast::Sender<NotificationRecord>,
}

impl NotificationSink {
    pub fn new() -> Self {
        Self::with_buffer(NotificationBuffer::new())
    }

    pub fn with_buffer(buffer: NotificationBuffer) -> Self {
        let (updates, _) = broadcast::channel(UPDATES_CAPACITY);
        Self {
            buffer: Arc::new(Mutex::new(buffer)),
            updates,
        }
    }

    fn buffer(&self) -> MutexGuard<'_, NotificationBuffer> {
        self.buffer.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append a record and notify listeners.
    pub fn deliver(&self, record: NotificationRecord) {
        tracing::debug!(
            topic = %record.topic,
            kind = ?record.change_kind,
            "notification: {}",
            record.title
        );
        self.buffer().append(record.clone());
        // No listeners is fine; the buffer is the source of truth.
        let _ = self.updates.send(record);
    }

    /// Listen for records delivered from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<NotificationRecord> {
        self.updates.subscribe()
    }

    /// Records, newest first.
    pub fn snapshot(&self) -> Vec<NotificationRecord> {
        self.buffer().iter().cloned().collect()
    }

    pub fn unread_count(&self) -> usize {
        self.buffer().unread_count()
    }

    pub fn len(&self) -> usize {
        self.buffer().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer().is_empty()
    }

    pub fn mark_read(&self, id: &str) -> bool {
        self.buffer().mark_read(id)
    }

    pub fn mark_all_read(&self) {
        self.buffer().mark_all_read()
    }

    pub fn remove(&self, id: &str) -> Option<NotificationRecord> {
        self.buffer().remove(id)
    }
}

impl Default for NotificationSink {
    fn default() -> Self {
        Self::new()
    }
}

/// Build the record for a change in `topic`, labelled with `label`.
pub fn change_notification(
    topic: &str,
    label: &str,
    kind: ChangeKind,
    data: Value,
) -> NotificationRecord {
    let verb = kind.past_tense();
    let title = format!("{} {}", label, verb);
    let message = match &data {
        Value::Array(items) if items.len() > 1 => {
            format!("{} {} records were {}", items.len(), label, verb)
        }
        Value::Array(items) => match items.first().and_then(record_id) {
            Some(id) => format!("{} {} was {}", label, id, verb),
            None => format!("{} record was {}", label, verb),
        },
        other => match record_id(other) {
            Some(id) => format!("{} {} was {}", label, id, verb),
            None => format!("{} record was {}", label, verb),
        },
    };
    NotificationRecord::new(topic, kind, title, message, data)
}

/// Primary key of a record payload: a bare key, or the `id` field of an object.
fn record_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Object(map) => map.get("id").and_then(|id| match id {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }),
        _ => None,
    }
}
