//! Backdesk Client - realtime update feed for the admin dashboard
//!
//! Keeps one authenticated, subscribed socket to the backend's change
//! channel, falls back to polling when realtime is unhealthy, and serves
//! every consumer from a single notification buffer.

pub mod api_client;
pub mod auth;
pub mod config;
pub mod discovery;
pub mod polling;
pub mod source;
pub mod stores;
pub mod topics;
pub mod ws;

pub use api_client::ApiClient;
pub use auth::{CredentialSource, SharedToken, StaticToken};
pub use config::{ClientConfig, PollingConfig, RealtimeTimeouts};
pub use discovery::{BackendEndpoints, ConfigDiscovery, EndpointSource, FixedEndpoints};
pub use polling::{ChangeProbe, GraphqlProbe, LatestChange, PollingCursor, PollingEngine};
pub use source::ChangeSource;
pub use stores::{NotificationBuffer, NotificationSink};
pub use topics::{Topic, TopicRegistry};
pub use ws::{
    use_connection_status, use_feed, FeedCoordinator, FeedHandle, FeedMode, FeedNotice,
    FeedStatus, RealtimeConnection, RealtimeHub,
};
