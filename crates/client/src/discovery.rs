//! Discovery of the backend's realtime and GraphQL endpoints.
//!
//! The discovery document is fetched once; the resolved endpoints are cached
//! for the lifetime of the process and reused on every reconnect. A failed
//! fetch is not cached, so the next connect attempt tries again.

use async_trait::async_trait;
use backdesk_shared::{DiscoveredConfig, RealtimeError};
use tokio::sync::OnceCell;
use url::Url;

use crate::api_client::ApiClient;

/// Path of the realtime socket on the backend, relative to its origin.
pub const REALTIME_PATH: &str = "/websocket";

/// Resolved backend endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendEndpoints {
    pub ws_url: String,
    pub graphql_url: String,
    pub auth_mode: String,
}

impl BackendEndpoints {
    /// Resolve a discovery document. `endpoint` must already be absolute.
    pub fn from_document(doc: DiscoveredConfig) -> Result<Self, RealtimeError> {
        if !doc.success {
            return Err(RealtimeError::ConfigUnavailable(
                "discovery endpoint reported failure".to_string(),
            ));
        }
        let ws_url = match doc.ws_url.filter(|u| !u.is_empty()) {
            Some(url) => url,
            None => derive_ws_url(&doc.endpoint)?,
        };
        Ok(Self {
            ws_url,
            graphql_url: doc.endpoint,
            auth_mode: doc.auth_mode,
        })
    }
}

/// Derive the realtime URL from the GraphQL endpoint: same host, `ws`/`wss`
/// scheme, realtime path.
pub fn derive_ws_url(endpoint: &str) -> Result<String, RealtimeError> {
    let mut url = Url::parse(endpoint).map_err(|e| {
        RealtimeError::ConfigUnavailable(format!("invalid endpoint {:?}: {}", endpoint, e))
    })?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(RealtimeError::ConfigUnavailable(format!(
                "unsupported endpoint scheme {:?}",
                other
            )))
        }
    };
    url.set_scheme(scheme).map_err(|_| {
        RealtimeError::ConfigUnavailable(format!("cannot derive realtime URL from {}", endpoint))
    })?;
    url.set_path(REALTIME_PATH);
    url.set_query(None);
    url.set_fragment(None);
    Ok(url.to_string())
}

/// Source of backend endpoints.
#[async_trait]
pub trait EndpointSource: Send + Sync + 'static {
    async fn endpoints(&self) -> Result<BackendEndpoints, RealtimeError>;
}

/// Endpoints known up front.
#[derive(Debug, Clone)]
pub struct FixedEndpoints(pub BackendEndpoints);

#[async_trait]
impl EndpointSource for FixedEndpoints {
    async fn endpoints(&self) -> Result<BackendEndpoints, RealtimeError> {
        Ok(self.0.clone())
    }
}

/// Endpoints fetched from the dashboard's discovery endpoint and cached.
#[derive(Debug)]
pub struct ConfigDiscovery {
    api: ApiClient,
    path: String,
    cached: OnceCell<BackendEndpoints>,
}

impl ConfigDiscovery {
    pub fn new(api: ApiClient, path: impl Into<String>) -> Self {
        Self {
            api,
            path: path.into(),
            cached: OnceCell::new(),
        }
    }

    async fn fetch(&self) -> Result<BackendEndpoints, RealtimeError> {
        let mut doc: DiscoveredConfig = self.api.get_json(&self.path).await?;
        doc.endpoint = self.api.url(&doc.endpoint);
        let endpoints = BackendEndpoints::from_document(doc)?;
        tracing::info!(
            ws_url = %endpoints.ws_url,
            graphql_url = %endpoints.graphql_url,
            "discovered backend endpoints"
        );
        Ok(endpoints)
    }
}

#[async_trait]
impl EndpointSource for ConfigDiscovery {
    async fn endpoints(&self) -> Result<BackendEndpoints, RealtimeError> {
        self.cached.get_or_try_init(|| self.fetch()).await.cloned()
    }
}
