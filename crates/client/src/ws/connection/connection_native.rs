//! Native WebSocket transport using tokio-tungstenite.

use async_trait::async_trait;
use backdesk_shared::RealtimeError;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        protocol::{frame::coding::CloseCode, CloseFrame},
        Message,
    },
};

use super::{Connector, Outbound, SocketEvent, SocketLink, SocketPeer};

/// Opens real WebSocket connections. Each link is backed by a read task and a
/// write task that end when the socket closes.
#[derive(Debug, Clone, Default)]
pub struct NativeConnector;

impl NativeConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for NativeConnector {
    async fn open(&self, url: &str) -> Result<SocketLink, RealtimeError> {
        let (ws_stream, _response) = connect_async(url)
            .await
            .map_err(|e| RealtimeError::Transport(format!("connect to {} failed: {}", url, e)))?;
        tracing::info!("WebSocket connected to {}", url);

        let (link, peer) = SocketLink::pair();
        let SocketPeer {
            outbound: mut outbound_rx,
            inbound,
        } = peer;
        let (mut write, mut read) = ws_stream.split();

        // Read task
        let url_for_read = url.to_string();
        tokio::spawn(async move {
            let closing = loop {
                match read.next().await {
                    Some(Ok(Message::Text(text))) => {
                        if inbound.send(SocketEvent::Text(text.to_string())).is_err() {
                            // Link dropped; nobody is listening any more.
                            return;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let code = frame.map(|f| u16::from(f.code));
                        tracing::debug!("WebSocket to {} received close frame {:?}", url_for_read, code);
                        break SocketEvent::Closed(code);
                    }
                    Some(Ok(Message::Ping(_))) => {
                        // Pong is handled automatically by tungstenite
                    }
                    Some(Ok(_)) => {
                        // Ignore binary, pong, etc.
                    }
                    Some(Err(e)) => {
                        tracing::warn!("WebSocket read error from {}: {}", url_for_read, e);
                        break SocketEvent::Error(e.to_string());
                    }
                    None => break SocketEvent::Closed(None),
                }
            };
            let _ = inbound.send(closing);
        });

        // Write task
        let url_for_write = url.to_string();
        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                match frame {
                    Outbound::Text(text) => {
                        tracing::trace!("Sending to {}: {}", url_for_write, text);
                        if let Err(e) = write.send(Message::Text(text.into())).await {
                            tracing::warn!("Send to {} failed: {}", url_for_write, e);
                            return;
                        }
                    }
                    Outbound::Close(code) => {
                        let frame = CloseFrame {
                            code: CloseCode::from(code),
                            reason: "client closing".into(),
                        };
                        let _ = write.send(Message::Close(Some(frame))).await;
                        return;
                    }
                }
            }
            // Link dropped without an explicit close.
            let _ = write.close().await;
        });

        Ok(link)
    }
}
