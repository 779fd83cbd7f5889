//! WebSocket handler for the realtime change channel.

use std::collections::HashSet;
use std::time::Duration;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use backdesk_shared::{ClientFrame, ServerFrame};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use crate::state::AppState;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const AUTH_WINDOW: Duration = Duration::from_secs(10);
/// Application close code for failed authentication.
const CLOSE_UNAUTHORIZED: u16 = 4001;

/// WebSocket upgrade handler. Authentication happens in-band.
pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

enum Outgoing {
    Frame(ServerFrame),
    Close(u16, &'static str),
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let conn_id = Uuid::new_v4();
    let (forward_tx, mut forward_rx) = mpsc::unbounded_channel::<Outgoing>();

    // Task to forward frames to the WebSocket
    let send_task = tokio::spawn(async move {
        while let Some(outgoing) = forward_rx.recv().await {
            match outgoing {
                Outgoing::Frame(frame) => {
                    let Ok(json) = frame.to_text() else {
                        continue;
                    };
                    if sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Outgoing::Close(code, reason) => {
                    let _ = sender
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    match tokio::time::timeout(AUTH_WINDOW, authenticate(&mut receiver, &state)).await {
        Ok(Ok(())) => {
            tracing::info!("Realtime connection {} authenticated", conn_id);
            let _ = forward_tx.send(Outgoing::Frame(ServerFrame::auth_ok()));
            serve_changes(&mut receiver, &forward_tx, &state, conn_id).await;
        }
        Ok(Err(reason)) => {
            tracing::warn!("Realtime connection {} rejected: {}", conn_id, reason);
            let _ = forward_tx.send(Outgoing::Frame(ServerFrame::auth_error(reason)));
            let _ = forward_tx.send(Outgoing::Close(CLOSE_UNAUTHORIZED, "unauthorized"));
        }
        Err(_) => {
            tracing::warn!("Realtime connection {} never authenticated", conn_id);
            let _ = forward_tx.send(Outgoing::Close(CLOSE_UNAUTHORIZED, "auth timeout"));
        }
    }

    drop(forward_tx);
    let _ = send_task.await;
    tracing::info!("Realtime connection {} closed", conn_id);
}

/// Wait for the first auth frame and check its token.
async fn authenticate(
    receiver: &mut futures_util::stream::SplitStream<WebSocket>,
    state: &AppState,
) -> Result<(), String> {
    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientFrame>(text.as_str()) {
                Ok(ClientFrame::Auth { access_token }) if state.token_matches(&access_token) => {
                    return Ok(())
                }
                Ok(ClientFrame::Auth { .. }) => return Err("invalid access token".to_string()),
                Ok(other) => tracing::debug!("Ignoring {:?} before authentication", other),
                Err(e) => tracing::debug!("Ignoring malformed frame: {}", e),
            },
            Ok(Message::Close(_)) | Err(_) => break,
            _ => {}
        }
    }
    Err("socket closed before authenticating".to_string())
}

/// Push subscribed changes and heartbeats until the client leaves.
async fn serve_changes(
    receiver: &mut futures_util::stream::SplitStream<WebSocket>,
    forward_tx: &mpsc::UnboundedSender<Outgoing>,
    state: &AppState,
    conn_id: Uuid,
) {
    let mut subscribed: HashSet<String> = HashSet::new();
    let mut changes = state.changes.subscribe();
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            msg = receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientFrame>(text.as_str()) {
                    Ok(ClientFrame::Subscribe { collection, .. }) => {
                        tracing::debug!("Connection {} subscribed to {}", conn_id, collection);
                        subscribed.insert(collection);
                    }
                    Ok(ClientFrame::Auth { .. }) => {
                        tracing::debug!("Ignoring repeated auth on {}", conn_id)
                    }
                    Err(e) => tracing::debug!("Ignoring malformed frame: {}", e),
                },
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            change = changes.recv() => match change {
                Ok(change) if subscribed.contains(&change.collection) => {
                    let frame = ServerFrame::Subscription {
                        event: change.event,
                        collection: change.collection,
                        data: change.data,
                    };
                    if forward_tx.send(Outgoing::Frame(frame)).is_err() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Connection {} lagged by {} changes", conn_id, skipped)
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = heartbeat.tick() => {
                if forward_tx.send(Outgoing::Frame(ServerFrame::Heartbeat)).is_err() {
                    break;
                }
            }
        }
    }
}
