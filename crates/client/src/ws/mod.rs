//! Realtime change feed for the dashboard.
//!
//! This module provides:
//! - One authenticated, subscribed socket with auto-reconnect
//! - Fallback to polling when realtime cannot be kept healthy
//! - A single shared notification buffer fed by whichever engine is active
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                  FeedCoordinator                    │
//! │   (mode selection, consumer leases, health timer)   │
//! └─────────────────────────────────────────────────────┘
//!            │ LinkSignal ▲                │
//!            ▼            │                ▼
//!   ┌────────────────────────┐    ┌────────────────┐
//!   │   RealtimeConnection   │    │ PollingEngine  │
//!   │ (auth, subscribe,      │    │ (cursor deltas)│
//!   │  backoff)              │    └────────────────┘
//!   └────────────────────────┘             │
//!            │                             │
//!            └──────────────┬──────────────┘
//!                           ▼
//!                ┌─────────────────────┐
//!                │  NotificationSink   │
//!                └─────────────────────┘
//!                           │
//!          ┌────────────────┼────────────────┐
//!          ▼                ▼                ▼
//!   ┌────────────┐   ┌────────────┐   ┌────────────┐
//!   │ FeedHandle │   │ FeedHandle │   │ FeedHandle │
//!   └────────────┘   └────────────┘   └────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! // At startup
//! RealtimeHub::install(FeedCoordinator::from_config(&ClientConfig::from_env()))?;
//!
//! // In a view
//! let feed = use_feed().expect("hub installed");
//! for record in feed.notifications() {
//!     println!("{}: {}", record.title, record.message);
//! }
//! ```

pub mod connection;
mod hooks;
mod manager;
pub mod realtime;
pub mod reconnect;

pub use connection::{
    ConnectionState, Connector, NativeConnector, Outbound, SocketEvent, SocketLink, SocketPeer,
};
pub use hooks::{use_connection_status, use_feed};
pub use manager::{
    CoordinatorOptions, FeedCoordinator, FeedHandle, FeedMode, FeedNotice, FeedStatus, RealtimeHub,
};
pub use realtime::{LinkEvent, LinkSignal, RealtimeConnection, RealtimeOptions};
pub use reconnect::{ReconnectAttempt, ReconnectPolicy};
