//! Socket plumbing underneath the realtime connection state machine.
//!
//! A [`Connector`] opens one physical socket and hands back a [`SocketLink`]:
//! an outbound queue of frames to write and an inbound stream of socket
//! events. The state machine only ever talks to the link, so the native
//! tungstenite transport and in-memory test transports are interchangeable.

use std::fmt;

use async_trait::async_trait;
use backdesk_shared::RealtimeError;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// Lifecycle state of the realtime connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Authenticating,
    Subscribing,
    Ready,
    Closing,
    Backoff,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Ready)
    }

    /// Whether a connection is being established or retried.
    pub fn is_connecting(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting
                | ConnectionState::Authenticating
                | ConnectionState::Subscribing
                | ConnectionState::Backoff
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::Subscribing => "subscribing",
            ConnectionState::Ready => "ready",
            ConnectionState::Closing => "closing",
            ConnectionState::Backoff => "backoff",
        };
        f.write_str(name)
    }
}

/// Something that happened on the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    /// A text frame.
    Text(String),
    /// The socket closed. `None` means no close frame was received.
    Closed(Option<u16>),
    /// Read or protocol error; the socket is unusable afterwards.
    Error(String),
}

/// A frame to write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    /// Close the socket with this code.
    Close(u16),
}

/// Client side of an open socket.
#[derive(Debug)]
pub struct SocketLink {
    pub outbound: UnboundedSender<Outbound>,
    pub inbound: UnboundedReceiver<SocketEvent>,
}

/// Far side of a [`SocketLink`]: whoever drives the real transport (or plays
/// the server in tests) reads `outbound` and feeds `inbound`.
#[derive(Debug)]
pub struct SocketPeer {
    pub outbound: UnboundedReceiver<Outbound>,
    pub inbound: UnboundedSender<SocketEvent>,
}

impl SocketLink {
    /// Create a connected link/peer pair.
    pub fn pair() -> (SocketLink, SocketPeer) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        (
            SocketLink {
                outbound: outbound_tx,
                inbound: inbound_rx,
            },
            SocketPeer {
                outbound: outbound_rx,
                inbound: inbound_tx,
            },
        )
    }
}

/// Opens physical sockets.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn open(&self, url: &str) -> Result<SocketLink, RealtimeError>;
}

mod connection_native;
pub use connection_native::NativeConnector;
