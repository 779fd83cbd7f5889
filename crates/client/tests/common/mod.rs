#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use backdesk_client::polling::{ChangeProbe, LatestChange};
use backdesk_client::ws::{
    ConnectionState, Connector, LinkEvent, Outbound, RealtimeConnection, RealtimeOptions,
    ReconnectPolicy, SocketEvent, SocketLink, SocketPeer,
};
use backdesk_client::{
    BackendEndpoints, ChangeSource, EndpointSource, FixedEndpoints, NotificationSink, StaticToken,
};
use backdesk_shared::{ClientFrame, RealtimeError, ServerFrame};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

pub const TOKEN: &str = "test-token";

/// Connector that hands every opened socket's far side to the test.
pub struct FakeConnector {
    opens: AtomicUsize,
    accepting: AtomicBool,
    peers: UnboundedSender<SocketPeer>,
}

impl FakeConnector {
    pub fn new() -> (Arc<Self>, UnboundedReceiver<SocketPeer>) {
        let (peers, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            opens: AtomicUsize::new(0),
            accepting: AtomicBool::new(true),
            peers,
        });
        (connector, rx)
    }

    /// Sockets opened (or attempted) so far.
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn set_accepting(&self, accepting: bool) {
        self.accepting.store(accepting, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn open(&self, _url: &str) -> Result<SocketLink, RealtimeError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(RealtimeError::Transport("connection refused".to_string()));
        }
        let (link, peer) = SocketLink::pair();
        let _ = self.peers.send(peer);
        Ok(link)
    }
}

/// The backend's side of one fake socket.
pub struct FakeServer {
    pub peer: SocketPeer,
}

impl FakeServer {
    pub fn new(peer: SocketPeer) -> Self {
        Self { peer }
    }

    pub async fn accept(peers: &mut UnboundedReceiver<SocketPeer>) -> Self {
        Self::new(peers.recv().await.expect("connector dropped"))
    }

    /// Next frame the client wrote, parsed.
    pub async fn next_frame(&mut self) -> ClientFrame {
        match self.peer.outbound.recv().await {
            Some(Outbound::Text(text)) => serde_json::from_str(&text).expect("valid client frame"),
            other => panic!("expected a text frame, got {:?}", other),
        }
    }

    pub async fn expect_auth(&mut self) -> String {
        match self.next_frame().await {
            ClientFrame::Auth { access_token } => access_token,
            other => panic!("expected auth frame, got {:?}", other),
        }
    }

    /// Accept the auth frame and collect `topics` subscribe frames.
    pub async fn handshake(&mut self, topics: usize) -> Vec<String> {
        assert_eq!(self.expect_auth().await, TOKEN);
        self.send(&ServerFrame::auth_ok());
        let mut collections = Vec::new();
        for _ in 0..topics {
            match self.next_frame().await {
                ClientFrame::Subscribe { collection, .. } => collections.push(collection),
                other => panic!("expected subscribe frame, got {:?}", other),
            }
        }
        collections
    }

    pub fn send(&self, frame: &ServerFrame) {
        self.send_raw(&frame.to_text().unwrap());
    }

    pub fn send_raw(&self, text: &str) {
        let _ = self.peer.inbound.send(SocketEvent::Text(text.to_string()));
    }

    pub fn close(&self, code: u16) {
        let _ = self.peer.inbound.send(SocketEvent::Closed(Some(code)));
    }

    /// Frames already written and not yet read.
    pub fn pending_frames(&mut self) -> Vec<Outbound> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.peer.outbound.try_recv() {
            frames.push(frame);
        }
        frames
    }
}

pub fn endpoints() -> Arc<dyn EndpointSource> {
    Arc::new(FixedEndpoints(BackendEndpoints {
        ws_url: "ws://backend.test/websocket".to_string(),
        graphql_url: "http://backend.test/graphql".to_string(),
        auth_mode: "handshake".to_string(),
    }))
}

/// Endpoint source that is always down.
#[derive(Default)]
pub struct UnreachableEndpoints {
    pub calls: AtomicUsize,
}

#[async_trait]
impl EndpointSource for UnreachableEndpoints {
    async fn endpoints(&self) -> Result<BackendEndpoints, RealtimeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(RealtimeError::ConfigUnavailable("HTTP 503: unavailable".to_string()))
    }
}

/// Endpoint source whose lookup never completes.
#[derive(Default)]
pub struct HangingEndpoints {
    pub calls: AtomicUsize,
}

#[async_trait]
impl EndpointSource for HangingEndpoints {
    async fn endpoints(&self) -> Result<BackendEndpoints, RealtimeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::future::pending().await
    }
}

pub fn options() -> RealtimeOptions {
    RealtimeOptions {
        policy: ReconnectPolicy::realtime().without_jitter(),
        ..RealtimeOptions::default()
    }
}

pub fn realtime(
    connector: Arc<FakeConnector>,
) -> (RealtimeConnection, UnboundedReceiver<LinkEvent>) {
    RealtimeConnection::new(connector, endpoints(), Arc::new(StaticToken::new(TOKEN)), options())
}

pub async fn wait_for_state(conn: &RealtimeConnection, state: ConnectionState) {
    let mut rx = conn.watch_state();
    tokio::time::timeout(Duration::from_secs(600), rx.wait_for(|s| *s == state))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}", state))
        .expect("state channel closed");
}

/// Let spawned tasks run without moving the clock.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

/// Polling stand-in that only records whether it is running.
#[derive(Default)]
pub struct RecordingSource {
    running: AtomicBool,
    pub starts: AtomicUsize,
}

impl ChangeSource for RecordingSource {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn start(&self, _sink: NotificationSink) {
        if !self.running.swap(true, Ordering::SeqCst) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Probe that replays a per-topic script, then reports no records.
#[derive(Default)]
pub struct ScriptedProbe {
    script: Mutex<HashMap<String, VecDeque<Result<Option<LatestChange>, RealtimeError>>>>,
}

impl ScriptedProbe {
    pub fn push_change(&self, topic: &str, changed_at: &str) {
        self.push(
            topic,
            Ok(Some(LatestChange {
                record_id: Some("1".to_string()),
                changed_at: changed_at.to_string(),
                data: serde_json::json!({ "id": 1, "date_updated": changed_at }),
            })),
        );
    }

    pub fn push_failure(&self, topic: &str) {
        self.push(
            topic,
            Err(RealtimeError::PollingFetch {
                topic: topic.to_string(),
                reason: "HTTP 500: boom".to_string(),
            }),
        );
    }

    fn push(&self, topic: &str, result: Result<Option<LatestChange>, RealtimeError>) {
        self.script
            .lock()
            .unwrap()
            .entry(topic.to_string())
            .or_default()
            .push_back(result);
    }
}

#[async_trait]
impl ChangeProbe for ScriptedProbe {
    async fn latest(&self, topic: &str) -> Result<Option<LatestChange>, RealtimeError> {
        self.script
            .lock()
            .unwrap()
            .get_mut(topic)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Ok(None))
    }
}
