//! Consumer entry points over the process-wide hub.
//!
//! Views call these instead of holding the coordinator themselves, so every
//! consumer in the process shares one connection.

use super::manager::{FeedHandle, FeedStatus, RealtimeHub};

/// Lease the shared feed. `None` until a coordinator is installed.
///
/// Keep the handle for as long as the view needs updates; dropping the last
/// handle closes the connection.
pub fn use_feed() -> Option<FeedHandle> {
    RealtimeHub::acquire()
}

/// Current feed status without taking a lease.
pub fn use_connection_status() -> Option<FeedStatus> {
    RealtimeHub::global().map(|coordinator| coordinator.status())
}
