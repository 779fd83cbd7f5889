//! Polling fallback engine.
//!
//! Each cycle asks the backend for the most recently changed record of every
//! polled topic and compares its change timestamp with the cursor from the
//! previous cycle. A different timestamp becomes one `Update` notification.
//! The first observation of a topic only seeds the cursor.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use backdesk_shared::{ChangeKind, RealtimeError};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use crate::api_client::ApiClient;
use crate::config::PollingConfig;
use crate::discovery::EndpointSource;
use crate::source::ChangeSource;
use crate::stores::{change_notification, NotificationSink};
use crate::topics::TopicRegistry;

/// The newest change the backend reports for a topic.
#[derive(Debug, Clone, PartialEq)]
pub struct LatestChange {
    pub record_id: Option<String>,
    /// Opaque change timestamp; only compared for equality.
    pub changed_at: String,
    pub data: Value,
}

/// Fetches the newest change for a topic.
#[async_trait]
pub trait ChangeProbe: Send + Sync + 'static {
    /// `Ok(None)` when the topic has no records yet.
    async fn latest(&self, topic: &str) -> Result<Option<LatestChange>, RealtimeError>;
}

/// Last observed change timestamp per topic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollingCursor {
    last_seen: HashMap<String, String>,
}

impl PollingCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `changed_at` for `topic`. Returns true when a previous value
    /// existed and differs, i.e. when a notification is due.
    pub fn observe(&mut self, topic: &str, changed_at: &str) -> bool {
        match self.last_seen.insert(topic.to_string(), changed_at.to_string()) {
            Some(previous) => previous != changed_at,
            None => false,
        }
    }

    pub fn get(&self, topic: &str) -> Option<&str> {
        self.last_seen.get(topic).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.last_seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_seen.is_empty()
    }

    pub fn clear(&mut self) {
        self.last_seen.clear();
    }
}

struct PollState {
    generation: u64,
    cursor: PollingCursor,
    task: Option<JoinHandle<()>>,
}

struct PollInner {
    probe: Arc<dyn ChangeProbe>,
    config: PollingConfig,
    topics: TopicRegistry,
    state: Mutex<PollState>,
}

/// Periodic poller over a [`ChangeProbe`].
pub struct PollingEngine {
    inner: Arc<PollInner>,
}

impl PollingEngine {
    pub fn new(probe: Arc<dyn ChangeProbe>, config: PollingConfig, topics: TopicRegistry) -> Self {
        Self {
            inner: Arc::new(PollInner {
                probe,
                config,
                topics,
                state: Mutex::new(PollState {
                    generation: 0,
                    cursor: PollingCursor::new(),
                    task: None,
                }),
            }),
        }
    }

    pub fn config(&self) -> &PollingConfig {
        &self.inner.config
    }

    /// Start cycling every `interval`, the first cycle immediately.
    /// A no-op while already running.
    pub fn start_polling(&self, sink: NotificationSink) {
        let mut state = self.inner.lock();
        if state.task.is_some() {
            debug!("polling already running");
            return;
        }
        state.generation += 1;
        let generation = state.generation;
        let inner = Arc::clone(&self.inner);
        state.task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inner.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let produced = inner.cycle(generation, &sink).await;
                trace!("polling cycle produced {} notifications", produced);
            }
        }));
        info!(
            "polling {} topics every {:?}",
            self.inner.config.topics.len(),
            self.inner.config.interval
        );
    }

    /// Stop cycling and forget every cursor. A no-op while stopped.
    pub fn stop_polling(&self) {
        let mut state = self.inner.lock();
        state.generation += 1;
        state.cursor.clear();
        if let Some(task) = state.task.take() {
            task.abort();
            info!("polling stopped");
        }
    }

    /// Run one cycle now. Returns how many notifications were synthesized.
    pub async fn run_cycle(&self, sink: &NotificationSink) -> usize {
        let generation = self.inner.lock().generation;
        self.inner.cycle(generation, sink).await
    }

    pub fn cursor_snapshot(&self) -> PollingCursor {
        self.inner.lock().cursor.clone()
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().task.is_some()
    }
}

impl Drop for PollingEngine {
    fn drop(&mut self) {
        if let Some(task) = self.inner.lock().task.take() {
            task.abort();
        }
    }
}

impl ChangeSource for PollingEngine {
    fn name(&self) -> &'static str {
        "polling"
    }

    fn start(&self, sink: NotificationSink) {
        self.start_polling(sink);
    }

    fn stop(&self) {
        self.stop_polling();
    }

    fn is_running(&self) -> bool {
        PollingEngine::is_running(self)
    }
}

impl PollInner {
    fn lock(&self) -> MutexGuard<'_, PollState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn cycle(&self, generation: u64, sink: &NotificationSink) -> usize {
        let mut produced = 0;
        for topic in &self.config.topics {
            let probe = tokio::time::timeout(self.config.probe_timeout, self.probe.latest(topic));
            let result = probe.await.unwrap_or_else(|_| {
                Err(RealtimeError::PollingFetch {
                    topic: topic.clone(),
                    reason: format!("no response within {:?}", self.config.probe_timeout),
                })
            });
            let change = match result {
                Ok(Some(change)) => change,
                Ok(None) => {
                    trace!("{} has no records yet", topic);
                    continue;
                }
                Err(e) => {
                    warn!("skipping {} this cycle: {}", topic, e);
                    continue;
                }
            };

            let due = {
                let mut state = self.lock();
                if state.generation != generation {
                    return produced;
                }
                state.cursor.observe(topic, &change.changed_at)
            };
            if due {
                debug!(
                    "{} changed at {} (record {:?})",
                    topic, change.changed_at, change.record_id
                );
                let label = self.topics.label_for(topic);
                sink.deliver(change_notification(topic, label, ChangeKind::Update, change.data));
                produced += 1;
            }
        }
        produced
    }
}

/// [`ChangeProbe`] over the backend's GraphQL endpoint.
pub struct GraphqlProbe {
    api: ApiClient,
    endpoints: Arc<dyn EndpointSource>,
}

impl GraphqlProbe {
    pub fn new(api: ApiClient, endpoints: Arc<dyn EndpointSource>) -> Self {
        Self { api, endpoints }
    }
}

/// Query for the newest record of `topic`, newest change first.
pub fn latest_change_query(topic: &str) -> String {
    format!(
        "query {{ {}(sort: [\"-date_updated\", \"-date_created\"], limit: 1) {{ id date_updated date_created }} }}",
        topic
    )
}

fn valid_topic(topic: &str) -> bool {
    !topic.is_empty() && topic.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Pick the change timestamp out of a row: `date_updated`, else `date_created`.
fn latest_from_row(row: Value) -> Option<LatestChange> {
    let stamp = |field: &str| row.get(field).and_then(Value::as_str).map(str::to_string);
    let changed_at = stamp("date_updated").or_else(|| stamp("date_created"))?;
    let record_id = match row.get("id") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    };
    Some(LatestChange {
        record_id,
        changed_at,
        data: row,
    })
}

#[async_trait]
impl ChangeProbe for GraphqlProbe {
    async fn latest(&self, topic: &str) -> Result<Option<LatestChange>, RealtimeError> {
        if !valid_topic(topic) {
            return Err(RealtimeError::PollingFetch {
                topic: topic.to_string(),
                reason: "not a valid collection name".to_string(),
            });
        }
        let endpoints = self.endpoints.endpoints().await.map_err(|e| RealtimeError::PollingFetch {
            topic: topic.to_string(),
            reason: e.to_string(),
        })?;
        let mut data: HashMap<String, Vec<Value>> = self
            .api
            .graphql(&endpoints.graphql_url, &latest_change_query(topic), json!({}))
            .await
            .map_err(|e| e.into_polling_error(topic))?;
        let row = data.remove(topic).and_then(|rows| rows.into_iter().next());
        Ok(row.and_then(latest_from_row))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_reports_only_changes_after_the_first_observation() {
        let mut cursor = PollingCursor::new();
        assert!(!cursor.observe("orders", "t0"));
        assert!(!cursor.observe("orders", "t0"));
        assert!(cursor.observe("orders", "t1"));
        assert_eq!(cursor.get("orders"), Some("t1"));
        assert!(!cursor.observe("products", "t1"));
        cursor.clear();
        assert!(cursor.is_empty());
    }

    #[test]
    fn query_sorts_by_latest_change() {
        assert_eq!(
            latest_change_query("orders"),
            r#"query { orders(sort: ["-date_updated", "-date_created"], limit: 1) { id date_updated date_created } }"#
        );
        assert!(valid_topic("order_items"));
        assert!(!valid_topic("orders { secrets }"));
        assert!(!valid_topic(""));
    }

    #[test]
    fn row_timestamp_falls_back_to_creation() {
        let updated = latest_from_row(json!({"id": 7, "date_updated": "u", "date_created": "c"})).unwrap();
        assert_eq!(updated.changed_at, "u");
        assert_eq!(updated.record_id.as_deref(), Some("7"));

        let created = latest_from_row(json!({"id": "a1", "date_updated": null, "date_created": "c"})).unwrap();
        assert_eq!(created.changed_at, "c");

        assert!(latest_from_row(json!({"id": 1})).is_none());
    }
}
