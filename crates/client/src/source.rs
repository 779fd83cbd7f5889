//! The capability shared by the realtime connection and the polling engine.

use crate::stores::NotificationSink;

/// An engine that produces change notifications into a sink.
///
/// The coordinator swaps engines through this interface alone. Both calls are
/// idempotent: starting a running source or stopping a stopped one does nothing.
pub trait ChangeSource: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Begin producing records into `sink`.
    fn start(&self, sink: NotificationSink);

    /// Stop producing records and release any timers or sockets.
    fn stop(&self);

    fn is_running(&self) -> bool;
}
