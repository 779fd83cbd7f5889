//! Feed coordinator: chooses between the realtime connection and polling and
//! exposes one notification feed to every consumer.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use once_cell::sync::OnceCell;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use backdesk_shared::NotificationRecord;

use super::connection::{ConnectionState, NativeConnector};
use super::realtime::{LinkEvent, LinkSignal, RealtimeConnection, RealtimeOptions};
use super::reconnect::ReconnectPolicy;
use crate::api_client::ApiClient;
use crate::auth::{CredentialSource, StaticToken};
use crate::config::ClientConfig;
use crate::discovery::{ConfigDiscovery, EndpointSource};
use crate::polling::{GraphqlProbe, PollingEngine};
use crate::source::ChangeSource;
use crate::stores::NotificationSink;
use crate::topics::TopicRegistry;

/// Which engine currently feeds the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedMode {
    Realtime,
    Polling,
}

/// Snapshot of the feed for consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedStatus {
    pub mode: FeedMode,
    pub connection: ConnectionState,
    /// The realtime connection is `Ready`.
    pub connected: bool,
    /// The realtime connection is working towards `Ready`.
    pub loading: bool,
}

/// User-visible failure notice. Sent at most once until realtime recovers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedNotice {
    RealtimeUnavailable { attempts: u32, reason: String },
}

/// Coordinator tunables.
#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    /// How long realtime may take to reach `Ready` before polling starts.
    pub health_window: Duration,
    /// Drives realtime re-attempts after discovery failures.
    pub degraded_policy: ReconnectPolicy,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            health_window: Duration::from_secs(10),
            degraded_policy: ReconnectPolicy::degraded(),
        }
    }
}

struct CoordState {
    consumers: usize,
    /// Bumped whenever the last consumer leaves; timers from an older epoch do nothing.
    epoch: u64,
    health_timer: Option<JoinHandle<()>>,
    degraded_timer: Option<JoinHandle<()>>,
    degraded_attempts: u32,
    notice_sent: bool,
}

struct CoordInner {
    realtime: RealtimeConnection,
    polling: Arc<dyn ChangeSource>,
    sink: NotificationSink,
    options: CoordinatorOptions,
    mode_tx: watch::Sender<FeedMode>,
    notices: broadcast::Sender<FeedNotice>,
    state: Mutex<CoordState>,
    signal_task: Mutex<Option<JoinHandle<()>>>,
}

/// Owner of the realtime connection, the polling engine and the shared buffer.
///
/// Cheap to clone; all clones coordinate the same feed. Consumers hold a
/// [`FeedHandle`] lease; the connection lives while at least one lease does.
#[derive(Clone)]
pub struct FeedCoordinator {
    inner: Arc<CoordInner>,
}

impl FeedCoordinator {
    /// Wire a coordinator around an idle realtime connection and its signal
    /// stream. Must be called within a Tokio runtime.
    pub fn new(
        realtime: RealtimeConnection,
        signals: UnboundedReceiver<LinkEvent>,
        polling: Arc<dyn ChangeSource>,
        sink: NotificationSink,
        options: CoordinatorOptions,
    ) -> Self {
        let (mode_tx, _) = watch::channel(FeedMode::Realtime);
        let (notices, _) = broadcast::channel(16);
        let inner = Arc::new(CoordInner {
            realtime,
            polling,
            sink,
            options,
            mode_tx,
            notices,
            state: Mutex::new(CoordState {
                consumers: 0,
                epoch: 0,
                health_timer: None,
                degraded_timer: None,
                degraded_attempts: 0,
                notice_sent: false,
            }),
            signal_task: Mutex::new(None),
        });
        let task = tokio::spawn(signal_loop(Arc::downgrade(&inner), signals));
        *inner.signal_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
        Self { inner }
    }

    /// Production wiring: native sockets, discovery through the dashboard
    /// API, GraphQL polling, and the configured token.
    pub fn from_config(config: &ClientConfig) -> Self {
        let credentials: Arc<dyn CredentialSource> =
            Arc::new(StaticToken::new(config.access_token.clone().unwrap_or_default()));
        let api = ApiClient::new()
            .with_base_url(config.api_url.clone())
            .with_credentials(Arc::clone(&credentials));
        let endpoints: Arc<dyn EndpointSource> =
            Arc::new(ConfigDiscovery::new(api.clone(), config.config_path.clone()));
        let topics = TopicRegistry::default();

        let (realtime, signals) = RealtimeConnection::new(
            Arc::new(NativeConnector),
            Arc::clone(&endpoints),
            credentials,
            RealtimeOptions {
                topics: topics.clone(),
                policy: ReconnectPolicy::realtime(),
                timeouts: config.timeouts.clone(),
            },
        );
        let polling = PollingEngine::new(
            Arc::new(GraphqlProbe::new(api, endpoints)),
            config.polling.clone(),
            topics,
        );
        Self::new(
            realtime,
            signals,
            Arc::new(polling),
            NotificationSink::new(),
            CoordinatorOptions {
                health_window: config.timeouts.health_window,
                ..CoordinatorOptions::default()
            },
        )
    }

    /// Take a lease on the feed. The first lease starts realtime.
    pub fn acquire(&self) -> FeedHandle {
        self.inner.acquire();
        FeedHandle {
            coordinator: self.clone(),
        }
    }

    pub fn consumers(&self) -> usize {
        self.inner.lock().consumers
    }

    pub fn mode(&self) -> FeedMode {
        *self.inner.mode_tx.borrow()
    }

    pub fn status(&self) -> FeedStatus {
        let connection = self.inner.realtime.state();
        FeedStatus {
            mode: self.mode(),
            connection,
            connected: connection.is_connected(),
            loading: connection.is_connecting(),
        }
    }

    pub fn realtime(&self) -> &RealtimeConnection {
        &self.inner.realtime
    }

    pub fn sink(&self) -> &NotificationSink {
        &self.inner.sink
    }
}

impl CoordInner {
    fn lock(&self) -> MutexGuard<'_, CoordState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn acquire(self: &Arc<Self>) {
        let mut state = self.lock();
        state.consumers += 1;
        if state.consumers > 1 {
            debug!("feed acquired ({} consumers)", state.consumers);
            return;
        }
        info!("first consumer attached; starting realtime feed");
        self.set_mode(FeedMode::Realtime);
        self.realtime.start(self.sink.clone());
    }

    fn release(&self) {
        let mut state = self.lock();
        state.consumers = state.consumers.saturating_sub(1);
        if state.consumers > 0 {
            debug!("feed released ({} consumers remain)", state.consumers);
            return;
        }
        state.epoch += 1;
        cancel(&mut state.health_timer);
        cancel(&mut state.degraded_timer);
        state.degraded_attempts = 0;
        state.notice_sent = false;
        self.realtime.stop();
        self.polling.stop();
        info!("last consumer released the feed; realtime and polling stopped");
    }

    fn set_mode(&self, mode: FeedMode) {
        let previous = self.mode_tx.send_replace(mode);
        if previous != mode {
            info!("feed mode {:?} -> {:?}", previous, mode);
        }
    }

    /// Only the engine matching the mode writes to the sink, so one backend
    /// change never becomes two records.
    fn enter_polling(&self) {
        self.realtime.set_sink(None);
        if !self.polling.is_running() {
            self.polling.start(self.sink.clone());
        }
        self.set_mode(FeedMode::Polling);
    }

    fn enter_realtime(&self) {
        self.polling.stop();
        self.realtime.set_sink(Some(self.sink.clone()));
        self.set_mode(FeedMode::Realtime);
    }

    fn on_signal(self: &Arc<Self>, event: LinkEvent) {
        let mut state = self.lock();
        if state.consumers == 0 {
            debug!("ignoring {:?}; feed has no consumers", event.signal);
            return;
        }
        let current = self.realtime.generation();
        if event.generation != current {
            debug!(
                "ignoring {:?} from generation {} (now {})",
                event.signal, event.generation, current
            );
            return;
        }
        match event.signal {
            LinkSignal::Connecting => {
                // Retries keep the window that is already running.
                if state.health_timer.is_none() {
                    self.arm_health_check(&mut state);
                }
            }
            LinkSignal::Ready => {
                cancel(&mut state.health_timer);
                cancel(&mut state.degraded_timer);
                state.degraded_attempts = 0;
                state.notice_sent = false;
                self.enter_realtime();
            }
            LinkSignal::Backoff { attempt, delay } => {
                debug!("realtime retry {} scheduled in {:?}", attempt, delay)
            }
            LinkSignal::ClosedCleanly => {
                cancel(&mut state.health_timer);
                self.enter_polling();
            }
            LinkSignal::ConfigUnavailable(reason) => {
                cancel(&mut state.health_timer);
                self.enter_polling();
                self.schedule_degraded_retry(&mut state, reason);
            }
            LinkSignal::Exhausted { attempts, reason } => {
                cancel(&mut state.health_timer);
                self.enter_polling();
                self.send_notice(&mut state, attempts, reason);
            }
        }
    }

    fn arm_health_check(self: &Arc<Self>, state: &mut CoordState) {
        cancel(&mut state.health_timer);
        let epoch = state.epoch;
        let window = self.options.health_window;
        let weak = Arc::downgrade(self);
        state.health_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(window).await;
            if let Some(inner) = weak.upgrade() {
                inner.on_health_check(epoch);
            }
        }));
    }

    fn on_health_check(&self, epoch: u64) {
        let mut state = self.lock();
        if state.epoch != epoch || state.consumers == 0 {
            return;
        }
        state.health_timer = None;
        let connection = self.realtime.state();
        if connection != ConnectionState::Ready {
            warn!(
                "realtime not ready after {:?} (state {}); falling back to polling",
                self.options.health_window, connection
            );
            self.enter_polling();
        }
    }

    fn schedule_degraded_retry(self: &Arc<Self>, state: &mut CoordState, reason: String) {
        let policy = &self.options.degraded_policy;
        if policy.give_up(state.degraded_attempts) {
            let attempts = state.degraded_attempts;
            self.send_notice(state, attempts, reason);
            return;
        }
        let delay = policy.next_delay(state.degraded_attempts);
        state.degraded_attempts += 1;
        info!(
            "realtime unavailable ({}); retrying in {:?} (degraded attempt {})",
            reason, delay, state.degraded_attempts
        );
        cancel(&mut state.degraded_timer);
        let epoch = state.epoch;
        let weak = Arc::downgrade(self);
        state.degraded_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.retry_realtime(epoch);
            }
        }));
    }

    fn retry_realtime(&self, epoch: u64) {
        let mut state = self.lock();
        if state.epoch != epoch || state.consumers == 0 {
            return;
        }
        state.degraded_timer = None;
        self.realtime.connect();
    }

    fn send_notice(&self, state: &mut CoordState, attempts: u32, reason: String) {
        if state.notice_sent {
            return;
        }
        state.notice_sent = true;
        warn!("realtime updates unavailable after {} attempts: {}", attempts, reason);
        // Nobody listening is fine; the notice is not replayed.
        let _ = self
            .notices
            .send(FeedNotice::RealtimeUnavailable { attempts, reason });
    }

    fn switch_to_realtime(self: &Arc<Self>) {
        let mut state = self.lock();
        if state.consumers == 0 {
            return;
        }
        self.enter_realtime();
        match self.realtime.state() {
            ConnectionState::Idle => {
                cancel(&mut state.degraded_timer);
                state.degraded_attempts = 0;
                self.realtime.connect();
            }
            ConnectionState::Ready => {}
            _ => self.arm_health_check(&mut state),
        }
    }

    fn switch_to_polling(&self) {
        if self.lock().consumers == 0 {
            return;
        }
        self.enter_polling();
    }
}

impl Drop for CoordInner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(|e| e.into_inner());
        cancel(&mut state.health_timer);
        cancel(&mut state.degraded_timer);
        if let Some(task) = self
            .signal_task
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
        self.polling.stop();
    }
}

fn cancel(timer: &mut Option<JoinHandle<()>>) {
    if let Some(timer) = timer.take() {
        timer.abort();
    }
}

async fn signal_loop(inner: Weak<CoordInner>, mut signals: UnboundedReceiver<LinkEvent>) {
    while let Some(event) = signals.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.on_signal(event);
    }
}

/// A consumer's lease on the shared feed. Dropping the last one tears the
/// connection down; cloning takes another lease.
pub struct FeedHandle {
    coordinator: FeedCoordinator,
}

impl FeedHandle {
    /// Buffered notifications, newest first.
    pub fn notifications(&self) -> Vec<NotificationRecord> {
        self.coordinator.inner.sink.snapshot()
    }

    pub fn unread_count(&self) -> usize {
        self.coordinator.inner.sink.unread_count()
    }

    pub fn mark_read(&self, id: &str) -> bool {
        self.coordinator.inner.sink.mark_read(id)
    }

    pub fn mark_all_read(&self) {
        self.coordinator.inner.sink.mark_all_read()
    }

    pub fn remove(&self, id: &str) -> Option<NotificationRecord> {
        self.coordinator.inner.sink.remove(id)
    }

    pub fn status(&self) -> FeedStatus {
        self.coordinator.status()
    }

    /// New records as they arrive, from either engine.
    pub fn updates(&self) -> broadcast::Receiver<NotificationRecord> {
        self.coordinator.inner.sink.subscribe()
    }

    pub fn notices(&self) -> broadcast::Receiver<FeedNotice> {
        self.coordinator.inner.notices.subscribe()
    }

    pub fn mode_changes(&self) -> watch::Receiver<FeedMode> {
        self.coordinator.inner.mode_tx.subscribe()
    }

    pub fn connection_changes(&self) -> watch::Receiver<ConnectionState> {
        self.coordinator.inner.realtime.watch_state()
    }

    /// Stop polling and use realtime, reconnecting if it is idle.
    pub fn switch_to_realtime(&self) {
        self.coordinator.inner.switch_to_realtime();
    }

    /// Poll from now on. The realtime connection stays open but its records
    /// are not buffered; it takes over again the next time it reaches `Ready`.
    pub fn switch_to_polling(&self) {
        self.coordinator.inner.switch_to_polling();
    }
}

impl Clone for FeedHandle {
    fn clone(&self) -> Self {
        self.coordinator.acquire()
    }
}

impl Drop for FeedHandle {
    fn drop(&mut self) {
        self.coordinator.inner.release();
    }
}

static HUB: OnceCell<FeedCoordinator> = OnceCell::new();

/// Process-wide home of the single coordinator.
pub struct RealtimeHub;

impl RealtimeHub {
    /// Install the coordinator every consumer will share. Fails, returning
    /// the argument, if one is already installed.
    pub fn install(coordinator: FeedCoordinator) -> Result<(), FeedCoordinator> {
        HUB.set(coordinator)
    }

    pub fn global() -> Option<&'static FeedCoordinator> {
        HUB.get()
    }

    /// Lease the global feed, if a coordinator is installed.
    pub fn acquire() -> Option<FeedHandle> {
        HUB.get().map(FeedCoordinator::acquire)
    }
}
