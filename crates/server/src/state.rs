//! Application state shared across request handlers.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use backdesk_shared::SubscriptionEvent;
use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use uuid::Uuid;

const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub base_url: String,
    pub dev_token: String,
    pub changes: Arc<ChangeLog>,
}

impl AppState {
    /// Environment variables:
    /// - `BACKDESK_BASE_URL`: public URL of this server (default: "http://localhost:8080")
    /// - `BACKDESK_DEV_TOKEN`: the only accepted access token (default: "dev-token")
    pub fn from_env() -> Self {
        let base_url = std::env::var("BACKDESK_BASE_URL")
            .unwrap_or_else(|_| "http://localhost:8080".to_string());
        let dev_token =
            std::env::var("BACKDESK_DEV_TOKEN").unwrap_or_else(|_| "dev-token".to_string());
        Self::new(base_url, dev_token)
    }

    pub fn new(base_url: impl Into<String>, dev_token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            dev_token: dev_token.into(),
            changes: Arc::new(ChangeLog::new()),
        }
    }

    /// Realtime URL advertised in the discovery document.
    pub fn ws_url(&self) -> String {
        let base = self
            .base_url
            .replacen("https://", "wss://", 1)
            .replacen("http://", "ws://", 1);
        format!("{}/websocket", base)
    }

    pub fn graphql_url(&self) -> String {
        format!("{}/graphql", self.base_url)
    }

    pub fn token_matches(&self, token: &str) -> bool {
        !token.is_empty() && token == self.dev_token
    }
}

/// A change pushed to realtime subscribers.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub collection: String,
    pub event: SubscriptionEvent,
    pub data: Value,
}

/// In-memory rows per collection, most recently changed last.
pub struct ChangeLog {
    rows: RwLock<HashMap<String, Vec<Value>>>,
    events: broadcast::Sender<ChangeEvent>,
}

impl ChangeLog {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            rows: RwLock::new(HashMap::new()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.events.subscribe()
    }

    /// Apply a change, stamp it, and notify subscribers. Returns the stored row.
    pub fn record(&self, collection: &str, event: SubscriptionEvent, data: Value) -> Value {
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
        let mut fields = match data {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        let id = fields
            .get("id")
            .cloned()
            .filter(|id| id.is_string() || id.is_number())
            .unwrap_or_else(|| Value::String(Uuid::new_v4().to_string()));
        fields.insert("id".to_string(), id.clone());

        let mut rows = self.rows.write().unwrap_or_else(|e| e.into_inner());
        let table = rows.entry(collection.to_string()).or_default();
        let existing = table
            .iter()
            .position(|row| row.get("id") == Some(&id))
            .map(|index| table.remove(index));

        let row = match event {
            SubscriptionEvent::Delete => existing.unwrap_or(Value::Object(fields)),
            _ => {
                let mut row = match existing {
                    Some(Value::Object(mut previous)) => {
                        previous.extend(fields);
                        previous
                    }
                    _ => fields,
                };
                if event == SubscriptionEvent::Create || !row.contains_key("date_created") {
                    row.insert("date_created".to_string(), Value::String(now.clone()));
                }
                let updated = match event {
                    SubscriptionEvent::Create => Value::Null,
                    _ => Value::String(now),
                };
                row.insert("date_updated".to_string(), updated);
                let row = Value::Object(row);
                table.push(row.clone());
                row
            }
        };
        drop(rows);

        tracing::debug!("{:?} in {}: {}", event, collection, row);
        let _ = self.events.send(ChangeEvent {
            collection: collection.to_string(),
            event,
            data: row.clone(),
        });
        row
    }

    /// The most recently created or updated row of a collection.
    pub fn latest(&self, collection: &str) -> Option<Value> {
        let rows = self.rows.read().unwrap_or_else(|e| e.into_inner());
        rows.get(collection).and_then(|table| table.last().cloned())
    }
}

impl Default for ChangeLog {
    fn default() -> Self {
        Self::new()
    }
}
