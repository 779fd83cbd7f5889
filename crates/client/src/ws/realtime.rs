//! Realtime connection state machine.
//!
//! Owns at most one physical socket to the backend's change-notification
//! endpoint, runs the auth handshake, subscribes every registered topic and
//! reconnects with backoff after unplanned closes.
//!
//! ```text
//!  Idle ──connect()──▶ Connecting ──open──▶ Authenticating ──ack ok──▶ Subscribing ──▶ Ready
//!   ▲                      ▲                     │ error/timeout                        │ abnormal close
//!   │                      │                     ▼                                      ▼
//!   └──── disconnect() ────┴────── delay ───── Backoff ◀─────────────────────────────────┘
//! ```
//!
//! Every `connect()`/`disconnect()` bumps a generation counter. Session tasks
//! and backoff timers capture the generation they were started under and do
//! nothing once it is stale, so a timer that fires after a manual disconnect
//! can never reopen the socket.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use backdesk_shared::{
    AuthStatus, ChangeKind, ClientFrame, RealtimeError, ServerFrame, CLOSE_ABNORMAL, CLOSE_NORMAL,
};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use super::connection::{ConnectionState, Connector, Outbound, SocketEvent, SocketLink};
use super::reconnect::{ReconnectAttempt, ReconnectPolicy};
use crate::auth::CredentialSource;
use crate::config::RealtimeTimeouts;
use crate::discovery::EndpointSource;
use crate::source::ChangeSource;
use crate::stores::{change_notification, NotificationSink};
use crate::topics::TopicRegistry;

/// Lifecycle signals for whoever decides between realtime and polling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkSignal {
    /// A connection attempt started (initial or after backoff).
    Connecting,
    /// Authenticated and fully subscribed.
    Ready,
    /// An unplanned close; the next attempt is scheduled after `delay`.
    Backoff { attempt: u32, delay: Duration },
    /// The server closed the socket cleanly; no reconnect is scheduled.
    ClosedCleanly,
    /// The realtime URL could not be discovered; no reconnect is scheduled.
    ConfigUnavailable(String),
    /// The reconnect policy gave up.
    Exhausted { attempts: u32, reason: String },
}

/// A [`LinkSignal`] stamped with the connect generation that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkEvent {
    pub generation: u64,
    pub signal: LinkSignal,
}

/// Tunables for a [`RealtimeConnection`].
#[derive(Debug, Clone, Default)]
pub struct RealtimeOptions {
    pub topics: TopicRegistry,
    pub policy: ReconnectPolicy,
    pub timeouts: RealtimeTimeouts,
}

/// How a session task ended.
enum SessionEnd {
    /// A newer connect/disconnect took over; touch nothing.
    Superseded,
    /// Clean close from the server.
    Clean,
    Failed(RealtimeError),
}

struct Core {
    generation: u64,
    /// Set from `connect()` until the attempt reaches `Ready` or the machine
    /// returns to `Idle`. Guards against concurrent callers starting two
    /// attempts before the first socket is open.
    in_flight: bool,
    state: ConnectionState,
    attempt: ReconnectAttempt,
    outbound: Option<UnboundedSender<Outbound>>,
    task: Option<JoinHandle<()>>,
    backoff_timer: Option<JoinHandle<()>>,
}

struct Inner {
    connector: Arc<dyn Connector>,
    endpoints: Arc<dyn EndpointSource>,
    credentials: Arc<dyn CredentialSource>,
    topics: TopicRegistry,
    policy: ReconnectPolicy,
    timeouts: RealtimeTimeouts,
    core: Mutex<Core>,
    state_tx: watch::Sender<ConnectionState>,
    signals: UnboundedSender<LinkEvent>,
    sink: Mutex<Option<NotificationSink>>,
}

/// The single realtime connection. Dropping it disconnects.
pub struct RealtimeConnection {
    inner: Arc<Inner>,
}

impl RealtimeConnection {
    /// Create an idle connection. The returned receiver carries its lifecycle signals.
    pub fn new(
        connector: Arc<dyn Connector>,
        endpoints: Arc<dyn EndpointSource>,
        credentials: Arc<dyn CredentialSource>,
        options: RealtimeOptions,
    ) -> (Self, UnboundedReceiver<LinkEvent>) {
        let (signals, signal_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        let attempt = ReconnectAttempt::new(&options.policy);
        let inner = Inner {
            connector,
            endpoints,
            credentials,
            topics: options.topics,
            policy: options.policy,
            timeouts: options.timeouts,
            core: Mutex::new(Core {
                generation: 0,
                in_flight: false,
                state: ConnectionState::Idle,
                attempt,
                outbound: None,
                task: None,
                backoff_timer: None,
            }),
            state_tx,
            signals,
            sink: Mutex::new(None),
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            signal_rx,
        )
    }

    /// Start connecting. A no-op unless the connection is idle.
    ///
    /// Must be called within a Tokio runtime.
    pub fn connect(&self) {
        self.inner.connect();
    }

    /// Close the socket cleanly and cancel any pending attempt or timer.
    /// Always leaves the connection `Idle`.
    pub fn disconnect(&self) {
        self.inner.disconnect();
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    /// Watch state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn attempt(&self) -> ReconnectAttempt {
        self.inner.lock().attempt
    }

    /// Bumped by every `connect()` and `disconnect()`. Events stamped with an
    /// older generation describe a connection that no longer exists.
    pub fn generation(&self) -> u64 {
        self.inner.lock().generation
    }

    /// Whether a session task or backoff timer is alive.
    pub fn has_pending_tasks(&self) -> bool {
        let core = self.inner.lock();
        core.task.is_some() || core.backoff_timer.is_some()
    }

    pub fn topics(&self) -> &TopicRegistry {
        &self.inner.topics
    }

    /// Where change notifications go. Without a sink they are logged and dropped.
    pub fn set_sink(&self, sink: Option<NotificationSink>) {
        *self.inner.sink.lock().unwrap_or_else(|e| e.into_inner()) = sink;
    }
}

impl Drop for RealtimeConnection {
    fn drop(&mut self) {
        self.inner.disconnect();
    }
}

impl ChangeSource for RealtimeConnection {
    fn name(&self) -> &'static str {
        "realtime"
    }

    fn start(&self, sink: NotificationSink) {
        self.set_sink(Some(sink));
        self.connect();
    }

    fn stop(&self) {
        self.disconnect();
    }

    fn is_running(&self) -> bool {
        self.state() != ConnectionState::Idle
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Core> {
        self.core.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, core: &mut Core, state: ConnectionState) {
        if core.state != state {
            trace!("realtime state {} -> {}", core.state, state);
            core.state = state;
            self.state_tx.send_replace(state);
        }
    }

    /// Signals are sent while the core lock is held so they arrive in
    /// transition order.
    fn signal(&self, core: &Core, signal: LinkSignal) {
        // A dropped receiver only means nobody is coordinating.
        let _ = self.signals.send(LinkEvent {
            generation: core.generation,
            signal,
        });
    }

    fn connect(self: &Arc<Self>) {
        let mut core = self.lock();
        if core.in_flight || core.state != ConnectionState::Idle {
            debug!("connect ignored; connection is {}", core.state);
            return;
        }
        core.in_flight = true;
        core.generation += 1;
        let generation = core.generation;
        core.attempt.reset(&self.policy);
        self.set_state(&mut core, ConnectionState::Connecting);
        core.task = Some(tokio::spawn(run_session(Arc::clone(self), generation)));
        self.signal(&core, LinkSignal::Connecting);
        info!("realtime connecting (generation {})", generation);
    }

    fn disconnect(&self) {
        let mut core = self.lock();
        if core.state == ConnectionState::Idle
            && !core.in_flight
            && core.task.is_none()
            && core.backoff_timer.is_none()
        {
            trace!("disconnect ignored; already idle");
            return;
        }
        core.generation += 1;
        self.set_state(&mut core, ConnectionState::Closing);
        if let Some(timer) = core.backoff_timer.take() {
            timer.abort();
        }
        if let Some(task) = core.task.take() {
            task.abort();
        }
        if let Some(outbound) = core.outbound.take() {
            let _ = outbound.send(Outbound::Close(CLOSE_NORMAL));
        }
        core.in_flight = false;
        core.attempt.reset(&self.policy);
        self.set_state(&mut core, ConnectionState::Idle);
        info!("realtime connection closed by client");
    }

    fn deliver(&self, generation: u64, collection: &str, kind: ChangeKind, data: serde_json::Value) {
        if self.lock().generation != generation {
            return;
        }
        let record = change_notification(collection, self.topics.label_for(collection), kind, data);
        let sink = self.sink.lock().unwrap_or_else(|e| e.into_inner()).clone();
        match sink {
            Some(sink) => sink.deliver(record),
            None => debug!("no sink attached; dropping {} notification", collection),
        }
    }

    /// Move to `state` if `generation` is still current, optionally adopting
    /// the socket's writer.
    fn advance(
        &self,
        generation: u64,
        state: ConnectionState,
        outbound: Option<UnboundedSender<Outbound>>,
    ) -> bool {
        let mut core = self.lock();
        if core.generation != generation {
            return false;
        }
        if outbound.is_some() {
            core.outbound = outbound;
        }
        self.set_state(&mut core, state);
        true
    }

    async fn session(&self, generation: u64) -> SessionEnd {
        let mut inbound = match self.establish(generation).await {
            Ok(inbound) => inbound,
            Err(end) => return end,
        };
        self.pump(generation, &mut inbound).await
    }

    /// Open, authenticate and subscribe. Returns the inbound stream once `Ready`.
    ///
    /// Discovery and the socket open share one `timeouts.connect` deadline.
    async fn establish(
        &self,
        generation: u64,
    ) -> Result<UnboundedReceiver<SocketEvent>, SessionEnd> {
        let deadline = tokio::time::Instant::now() + self.timeouts.connect;
        let endpoints = match tokio::time::timeout_at(deadline, self.endpoints.endpoints()).await {
            Ok(result) => result.map_err(|e| SessionEnd::Failed(as_config_error(e)))?,
            Err(_) => {
                return Err(SessionEnd::Failed(RealtimeError::ConfigUnavailable(format!(
                    "endpoint discovery timed out after {:?}",
                    self.timeouts.connect
                ))))
            }
        };

        let link = match tokio::time::timeout_at(deadline, self.connector.open(&endpoints.ws_url)).await
        {
            Ok(Ok(link)) => link,
            Ok(Err(e)) => return Err(SessionEnd::Failed(e)),
            Err(_) => {
                return Err(SessionEnd::Failed(RealtimeError::Transport(format!(
                    "connect timed out after {:?}",
                    self.timeouts.connect
                ))))
            }
        };
        let SocketLink {
            outbound,
            mut inbound,
        } = link;

        if !self.advance(generation, ConnectionState::Authenticating, Some(outbound.clone())) {
            let _ = outbound.send(Outbound::Close(CLOSE_NORMAL));
            return Err(SessionEnd::Superseded);
        }

        let token = self.credentials.access_token().ok_or_else(|| {
            SessionEnd::Failed(RealtimeError::AuthRejected(
                "no access token available".to_string(),
            ))
        })?;
        send_frame(&outbound, &ClientFrame::auth(token)).map_err(SessionEnd::Failed)?;

        match tokio::time::timeout(self.timeouts.auth, await_auth_ack(&mut inbound)).await {
            Ok(Ok(())) => {}
            Ok(Err(end)) => return Err(end),
            Err(_) => {
                return Err(SessionEnd::Failed(RealtimeError::AuthRejected(format!(
                    "no acknowledgement within {:?}",
                    self.timeouts.auth
                ))))
            }
        }

        self.subscribe_all(generation, &outbound)?;
        Ok(inbound)
    }

    /// Send the full subscription set and enter `Ready`.
    fn subscribe_all(
        &self,
        generation: u64,
        outbound: &UnboundedSender<Outbound>,
    ) -> Result<(), SessionEnd> {
        let mut core = self.lock();
        if core.generation != generation {
            return Err(SessionEnd::Superseded);
        }
        self.set_state(&mut core, ConnectionState::Subscribing);
        for frame in self.topics.subscribe_frames() {
            send_frame(outbound, &frame).map_err(SessionEnd::Failed)?;
        }
        core.attempt.reset(&self.policy);
        core.in_flight = false;
        self.set_state(&mut core, ConnectionState::Ready);
        self.signal(&core, LinkSignal::Ready);
        info!("realtime ready; subscribed to {} topics", self.topics.len());
        Ok(())
    }

    async fn pump(&self, generation: u64, inbound: &mut UnboundedReceiver<SocketEvent>) -> SessionEnd {
        while let Some(event) = inbound.recv().await {
            match event {
                SocketEvent::Text(text) => self.handle_frame(generation, &text),
                SocketEvent::Closed(Some(CLOSE_NORMAL)) => return SessionEnd::Clean,
                SocketEvent::Closed(code) => {
                    return SessionEnd::Failed(RealtimeError::Transport(format!(
                        "socket closed abnormally (code {})",
                        code.unwrap_or(CLOSE_ABNORMAL)
                    )))
                }
                SocketEvent::Error(e) => return SessionEnd::Failed(RealtimeError::Transport(e)),
            }
        }
        SessionEnd::Failed(RealtimeError::Transport("socket stream ended".to_string()))
    }

    fn handle_frame(&self, generation: u64, text: &str) {
        match ServerFrame::parse(text) {
            Ok(ServerFrame::Subscription {
                event,
                collection,
                data,
            }) => match ChangeKind::from_event(event) {
                Some(kind) => self.deliver(generation, &collection, kind, data),
                None => debug!("ignoring {:?} event for {}", event, collection),
            },
            Ok(ServerFrame::Heartbeat) => trace!("heartbeat"),
            Ok(ServerFrame::Auth { status, .. }) => {
                debug!("ignoring auth frame ({:?}) after handshake", status)
            }
            Ok(ServerFrame::Unknown) => debug!("dropping frame of unknown type: {}", text),
            Err(e) => warn!("dropping inbound frame: {}", e),
        }
    }

    fn finish_session(self: &Arc<Self>, generation: u64, end: SessionEnd) {
        match end {
            SessionEnd::Superseded => debug!("session {} superseded", generation),
            SessionEnd::Clean => {
                let mut core = self.lock();
                if core.generation != generation {
                    return;
                }
                core.outbound = None;
                core.task = None;
                core.in_flight = false;
                core.attempt.reset(&self.policy);
                self.set_state(&mut core, ConnectionState::Idle);
                self.signal(&core, LinkSignal::ClosedCleanly);
                info!("realtime socket closed cleanly by server");
            }
            SessionEnd::Failed(err) => self.handle_failure(generation, err),
        }
    }

    fn handle_failure(self: &Arc<Self>, generation: u64, err: RealtimeError) {
        let mut core = self.lock();
        if core.generation != generation {
            return;
        }
        if let Some(outbound) = core.outbound.take() {
            let _ = outbound.send(Outbound::Close(CLOSE_NORMAL));
        }
        core.task = None;

        if let RealtimeError::ConfigUnavailable(reason) = &err {
            core.in_flight = false;
            self.set_state(&mut core, ConnectionState::Idle);
            self.signal(&core, LinkSignal::ConfigUnavailable(reason.clone()));
            warn!("realtime connect aborted: {}", err);
            return;
        }

        if self.policy.give_up(core.attempt.count) {
            let attempts = core.attempt.count;
            core.in_flight = false;
            self.set_state(&mut core, ConnectionState::Idle);
            self.signal(
                &core,
                LinkSignal::Exhausted {
                    attempts,
                    reason: err.to_string(),
                },
            );
            error!(
                "{}; last error: {}",
                RealtimeError::ReconnectExhausted { attempts },
                err
            );
            return;
        }

        let attempt = core.attempt.count;
        let delay = self.policy.next_delay(attempt);
        core.attempt.count += 1;
        core.attempt.next_delay = delay;
        self.set_state(&mut core, ConnectionState::Backoff);

        let weak: Weak<Inner> = Arc::downgrade(self);
        core.backoff_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.resume_after_backoff(generation);
            }
        }));
        self.signal(
            &core,
            LinkSignal::Backoff {
                attempt: attempt + 1,
                delay,
            },
        );
        warn!(
            "realtime connection lost ({}); reconnect attempt {} in {:?}",
            err,
            attempt + 1,
            delay
        );
    }

    fn resume_after_backoff(self: &Arc<Self>, generation: u64) {
        let mut core = self.lock();
        if core.generation != generation || core.state != ConnectionState::Backoff {
            debug!("stale backoff timer ignored");
            return;
        }
        core.backoff_timer = None;
        self.set_state(&mut core, ConnectionState::Connecting);
        core.task = Some(tokio::spawn(run_session(Arc::clone(self), generation)));
        self.signal(&core, LinkSignal::Connecting);
    }
}

async fn run_session(inner: Arc<Inner>, generation: u64) {
    let end = inner.session(generation).await;
    inner.finish_session(generation, end);
}

async fn await_auth_ack(inbound: &mut UnboundedReceiver<SocketEvent>) -> Result<(), SessionEnd> {
    loop {
        let event = inbound.recv().await.ok_or_else(|| {
            SessionEnd::Failed(RealtimeError::Transport(
                "socket closed during handshake".to_string(),
            ))
        })?;
        match event {
            SocketEvent::Text(text) => match ServerFrame::parse(&text) {
                Ok(ServerFrame::Auth {
                    status: AuthStatus::Ok,
                    ..
                }) => return Ok(()),
                Ok(ServerFrame::Auth {
                    status: AuthStatus::Error,
                    error,
                }) => {
                    let reason = error
                        .map(|e| e.to_string())
                        .unwrap_or_else(|| "server rejected credentials".to_string());
                    return Err(SessionEnd::Failed(RealtimeError::AuthRejected(reason)));
                }
                Ok(ServerFrame::Heartbeat) => trace!("heartbeat during handshake"),
                Ok(other) => debug!("dropping {:?} received before authentication", other),
                Err(e) => warn!("dropping inbound frame: {}", e),
            },
            SocketEvent::Closed(Some(CLOSE_NORMAL)) => return Err(SessionEnd::Clean),
            SocketEvent::Closed(code) => {
                return Err(SessionEnd::Failed(RealtimeError::Transport(format!(
                    "socket closed during handshake (code {})",
                    code.unwrap_or(CLOSE_ABNORMAL)
                ))))
            }
            SocketEvent::Error(e) => return Err(SessionEnd::Failed(RealtimeError::Transport(e))),
        }
    }
}

fn send_frame(outbound: &UnboundedSender<Outbound>, frame: &ClientFrame) -> Result<(), RealtimeError> {
    let text = frame.to_text()?;
    outbound
        .send(Outbound::Text(text))
        .map_err(|_| RealtimeError::Transport("socket writer has gone away".to_string()))
}

fn as_config_error(err: RealtimeError) -> RealtimeError {
    match err {
        RealtimeError::ConfigUnavailable(_) => err,
        other => RealtimeError::ConfigUnavailable(other.to_string()),
    }
}
