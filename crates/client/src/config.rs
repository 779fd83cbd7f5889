//! Client configuration from environment variables.

use std::time::Duration;

use crate::topics::DEFAULT_POLLED_TOPICS;

/// Time bounds on every suspension point of the realtime connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealtimeTimeouts {
    /// Opening the socket (TCP + TLS + upgrade). Default: 10 seconds
    pub connect: Duration,
    /// Waiting for the server to acknowledge the auth frame. Default: 3 seconds
    pub auth: Duration,
    /// How long the coordinator waits for `Ready` before polling. Default: 10 seconds
    pub health_window: Duration,
}

impl Default for RealtimeTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            auth: Duration::from_secs(3),
            health_window: Duration::from_secs(10),
        }
    }
}

/// Polling fallback configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollingConfig {
    pub interval: Duration,
    pub topics: Vec<String>,
    /// Longest a single topic probe may take before it is skipped. Default: 10 seconds
    pub probe_timeout: Duration,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            topics: DEFAULT_POLLED_TOPICS.iter().map(|t| t.to_string()).collect(),
            probe_timeout: Duration::from_secs(10),
        }
    }
}

/// Everything the client binary needs to start the feed.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the dashboard API that serves the discovery endpoint.
    pub api_url: String,
    /// Path of the discovery endpoint, relative to `api_url`.
    pub config_path: String,
    pub access_token: Option<String>,
    pub timeouts: RealtimeTimeouts,
    pub polling: PollingConfig,
}

impl ClientConfig {
    /// Parse configuration from environment variables.
    ///
    /// Environment variables:
    /// - `BACKDESK_API_URL`: API base URL (default: "http://localhost:8080")
    /// - `BACKDESK_CONFIG_PATH`: discovery path (default: "/api/config")
    /// - `BACKDESK_ACCESS_TOKEN`: access token for handshake and polling
    /// - `BACKDESK_POLL_INTERVAL_SECS`: polling interval (default: 15)
    /// - `BACKDESK_POLL_TOPICS`: comma-separated polled collections
    /// - `BACKDESK_HEALTH_WINDOW_SECS`: seconds to wait for realtime before polling (default: 10)
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let api_url = lookup("BACKDESK_API_URL").unwrap_or_else(|| "http://localhost:8080".to_string());
        let config_path = lookup("BACKDESK_CONFIG_PATH").unwrap_or_else(|| "/api/config".to_string());
        let access_token = lookup("BACKDESK_ACCESS_TOKEN").filter(|t| !t.is_empty());

        let mut timeouts = RealtimeTimeouts::default();
        if let Some(secs) = lookup("BACKDESK_HEALTH_WINDOW_SECS").and_then(|v| v.parse().ok()) {
            timeouts.health_window = Duration::from_secs(secs);
        }

        let mut polling = PollingConfig::default();
        if let Some(secs) = lookup("BACKDESK_POLL_INTERVAL_SECS")
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|s| *s > 0)
        {
            polling.interval = Duration::from_secs(secs);
        }
        if let Some(topics) = lookup("BACKDESK_POLL_TOPICS") {
            let topics: Vec<String> = topics
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect();
            if !topics.is_empty() {
                polling.topics = topics;
            }
        }

        Self {
            api_url,
            config_path,
            access_token,
            timeouts,
            polling,
        }
    }
}
