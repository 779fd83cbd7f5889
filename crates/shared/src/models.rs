//! Shared data models: notification records and the discovery document.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::protocol::SubscriptionEvent;

// --- Notifications ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangeKind {
    Create,
    Update,
    Delete,
}

impl ChangeKind {
    /// Map a subscription event to a change kind. Non-change events map to `None`.
    pub fn from_event(event: SubscriptionEvent) -> Option<Self> {
        match event {
            SubscriptionEvent::Create => Some(ChangeKind::Create),
            SubscriptionEvent::Update => Some(ChangeKind::Update),
            SubscriptionEvent::Delete => Some(ChangeKind::Delete),
            SubscriptionEvent::Other => None,
        }
    }

    pub fn past_tense(&self) -> &'static str {
        match self {
            ChangeKind::Create => "created",
            ChangeKind::Update => "updated",
            ChangeKind::Delete => "deleted",
        }
    }
}

/// A user-facing notification.
///
/// Realtime pushes and polling deltas both produce this shape, so consumers
/// never need to know which engine was active.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRecord {
    pub id: String,
    pub topic: String,
    pub change_kind: ChangeKind,
    pub title: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub read: bool,
    pub payload: serde_json::Value,
}

impl NotificationRecord {
    /// Create an unread record stamped with the current time.
    pub fn new(
        topic: impl Into<String>,
        change_kind: ChangeKind,
        title: impl Into<String>,
        message: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            topic: topic.into(),
            change_kind,
            title: title.into(),
            message: message.into(),
            timestamp: Utc::now(),
            read: false,
            payload,
        }
    }
}

// --- Discovery ---

/// Response of the backend configuration endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredConfig {
    /// Realtime socket URL. Derived from `endpoint` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ws_url: Option<String>,
    /// GraphQL endpoint.
    pub endpoint: String,
    #[serde(default)]
    pub auth_mode: String,
    pub success: bool,
}
