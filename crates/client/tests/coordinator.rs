mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use backdesk_client::ws::{
    ConnectionState, CoordinatorOptions, FeedCoordinator, FeedMode, FeedNotice, LinkEvent,
    LinkSignal, RealtimeConnection, ReconnectPolicy,
};
use backdesk_client::{ChangeSource, NotificationSink, PollingConfig, PollingEngine, StaticToken, TopicRegistry};
use backdesk_shared::{ServerFrame, SubscriptionEvent};
use common::*;
use serde_json::json;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::sync::mpsc;

fn test_options() -> CoordinatorOptions {
    CoordinatorOptions {
        health_window: Duration::from_secs(10),
        degraded_policy: ReconnectPolicy::degraded().without_jitter(),
    }
}

fn coordinator(connector: Arc<FakeConnector>) -> (FeedCoordinator, Arc<RecordingSource>) {
    let (conn, signals) = realtime(connector);
    let polling = Arc::new(RecordingSource::default());
    let coordinator = FeedCoordinator::new(
        conn,
        signals,
        polling.clone(),
        NotificationSink::new(),
        test_options(),
    );
    (coordinator, polling)
}

async fn wait_for_mode(feed: &backdesk_client::FeedHandle, mode: FeedMode) {
    let mut modes = feed.mode_changes();
    tokio::time::timeout(Duration::from_secs(600), modes.wait_for(|m| *m == mode))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {:?}", mode))
        .expect("mode channel closed");
}

#[tokio::test(start_paused = true)]
async fn first_consumer_starts_in_realtime() {
    let (connector, mut peers) = FakeConnector::new();
    let (coordinator, polling) = coordinator(connector.clone());
    assert_eq!(coordinator.realtime().state(), ConnectionState::Idle);

    let feed = coordinator.acquire();
    let mut server = FakeServer::accept(&mut peers).await;
    assert!(feed.status().loading);
    server.handshake(9).await;
    wait_for_state(coordinator.realtime(), ConnectionState::Ready).await;

    let status = feed.status();
    assert_eq!(status.mode, FeedMode::Realtime);
    assert!(status.connected);
    assert!(!status.loading);
    assert!(!polling.is_running());
    assert_eq!(connector.opens(), 1);
}

#[tokio::test(start_paused = true)]
async fn slow_realtime_falls_back_to_polling_and_back() {
    let (connector, mut peers) = FakeConnector::new();
    connector.set_accepting(false);
    let (coordinator, polling) = coordinator(connector.clone());

    let feed = coordinator.acquire();
    let started = tokio::time::Instant::now();
    wait_for_mode(&feed, FeedMode::Polling).await;

    // Refused at 0s, 3s and 9s; the health window closes at 10s.
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(10) && elapsed < Duration::from_secs(11));
    assert!(polling.is_running());
    assert_eq!(coordinator.realtime().state(), ConnectionState::Backoff);

    connector.set_accepting(true);
    let mut server = FakeServer::accept(&mut peers).await;
    server.handshake(9).await;
    wait_for_mode(&feed, FeedMode::Realtime).await;

    assert!(!polling.is_running());
    assert!(feed.status().connected);
    assert_eq!(polling.starts.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn exhaustion_sends_a_single_notice() {
    let (connector, _peers) = FakeConnector::new();
    connector.set_accepting(false);
    let (coordinator, polling) = coordinator(connector.clone());

    let feed = coordinator.acquire();
    let mut notices = feed.notices();
    let notice = tokio::time::timeout(Duration::from_secs(600), notices.recv())
        .await
        .expect("timed out waiting for notice")
        .unwrap();
    assert!(matches!(
        notice,
        FeedNotice::RealtimeUnavailable { attempts: 5, .. }
    ));

    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(notices.try_recv(), Err(TryRecvError::Empty));
    assert_eq!(feed.status().mode, FeedMode::Polling);
    assert_eq!(feed.status().connection, ConnectionState::Idle);
    assert!(polling.is_running());
    assert_eq!(connector.opens(), 6);
}

#[tokio::test(start_paused = true)]
async fn manual_retry_after_exhaustion_reconnects() {
    let (connector, mut peers) = FakeConnector::new();
    connector.set_accepting(false);
    let (coordinator, polling) = coordinator(connector.clone());

    let feed = coordinator.acquire();
    let mut notices = feed.notices();
    tokio::time::timeout(Duration::from_secs(600), notices.recv())
        .await
        .expect("timed out waiting for notice")
        .unwrap();

    connector.set_accepting(true);
    feed.switch_to_realtime();
    assert_eq!(feed.status().mode, FeedMode::Realtime);
    assert!(!polling.is_running());

    let mut server = FakeServer::accept(&mut peers).await;
    server.handshake(9).await;
    wait_for_state(coordinator.realtime(), ConnectionState::Ready).await;
    assert!(feed.status().connected);
}

#[tokio::test(start_paused = true)]
async fn unreachable_discovery_polls_and_retries_on_the_degraded_schedule() {
    let (connector, _peers) = FakeConnector::new();
    let discovery = Arc::new(UnreachableEndpoints::default());
    let (conn, signals) = RealtimeConnection::new(
        connector.clone(),
        discovery.clone(),
        Arc::new(StaticToken::new(TOKEN)),
        options(),
    );
    let polling = Arc::new(RecordingSource::default());
    let coordinator = FeedCoordinator::new(
        conn,
        signals,
        polling.clone(),
        NotificationSink::new(),
        test_options(),
    );

    let feed = coordinator.acquire();
    let mut notices = feed.notices();
    wait_for_mode(&feed, FeedMode::Polling).await;
    assert!(polling.is_running());

    let started = tokio::time::Instant::now();
    tokio::time::timeout(Duration::from_secs(600), notices.recv())
        .await
        .expect("timed out waiting for notice")
        .unwrap();

    // Retries after 5, 10, 20, 20 and 20 seconds.
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(75) && elapsed < Duration::from_secs(76));
    assert_eq!(discovery.calls.load(Ordering::SeqCst), 6);
    assert_eq!(connector.opens(), 0);
    assert_eq!(feed.status().mode, FeedMode::Polling);
}

#[tokio::test(start_paused = true)]
async fn clean_close_switches_to_polling() {
    let (connector, mut peers) = FakeConnector::new();
    let (coordinator, polling) = coordinator(connector);

    let feed = coordinator.acquire();
    let mut server = FakeServer::accept(&mut peers).await;
    server.handshake(9).await;
    wait_for_state(coordinator.realtime(), ConnectionState::Ready).await;

    server.close(1000);
    wait_for_mode(&feed, FeedMode::Polling).await;
    assert!(polling.is_running());
    assert_eq!(feed.status().connection, ConnectionState::Idle);
}

#[tokio::test(start_paused = true)]
async fn manual_polling_keeps_realtime_alive() {
    let (connector, mut peers) = FakeConnector::new();
    let (coordinator, polling) = coordinator(connector);

    let feed = coordinator.acquire();
    let mut server = FakeServer::accept(&mut peers).await;
    server.handshake(9).await;
    wait_for_state(coordinator.realtime(), ConnectionState::Ready).await;

    feed.switch_to_polling();
    assert_eq!(feed.status().mode, FeedMode::Polling);
    assert!(polling.is_running());
    assert_eq!(coordinator.realtime().state(), ConnectionState::Ready);

    feed.switch_to_realtime();
    assert_eq!(feed.status().mode, FeedMode::Realtime);
    assert!(!polling.is_running());
}

#[tokio::test(start_paused = true)]
async fn connection_lives_until_the_last_handle_drops() {
    let (connector, mut peers) = FakeConnector::new();
    let (coordinator, polling) = coordinator(connector.clone());

    let first = coordinator.acquire();
    let second = first.clone();
    assert_eq!(coordinator.consumers(), 2);

    let mut server = FakeServer::accept(&mut peers).await;
    server.handshake(9).await;
    wait_for_state(coordinator.realtime(), ConnectionState::Ready).await;

    drop(first);
    settle().await;
    assert_eq!(coordinator.consumers(), 1);
    assert_eq!(coordinator.realtime().state(), ConnectionState::Ready);
    assert!(server.pending_frames().is_empty());

    drop(second);
    settle().await;
    assert_eq!(coordinator.consumers(), 0);
    assert_eq!(coordinator.realtime().state(), ConnectionState::Idle);
    assert!(!coordinator.realtime().has_pending_tasks());
    assert!(!polling.is_running());

    // Nothing wakes the connection back up once every consumer is gone.
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(connector.opens(), 1);
}

#[tokio::test(start_paused = true)]
async fn both_engines_feed_the_same_buffer() {
    let (connector, mut peers) = FakeConnector::new();
    let (conn, signals) = realtime(connector);
    let probe = Arc::new(ScriptedProbe::default());
    let sink = NotificationSink::new();
    let engine = Arc::new(PollingEngine::new(
        probe.clone(),
        PollingConfig {
            interval: Duration::from_secs(15),
            topics: vec!["products".to_string()],
            ..PollingConfig::default()
        },
        TopicRegistry::default(),
    ));
    let coordinator = FeedCoordinator::new(conn, signals, engine.clone(), sink, test_options());

    let feed = coordinator.acquire();
    let mut server = FakeServer::accept(&mut peers).await;
    server.handshake(9).await;
    wait_for_state(coordinator.realtime(), ConnectionState::Ready).await;

    let mut updates = feed.updates();
    server.send(&ServerFrame::Subscription {
        event: SubscriptionEvent::Create,
        collection: "orders".to_string(),
        data: json!({"id": 1}),
    });
    updates.recv().await.unwrap();

    probe.push_change("products", "t0");
    probe.push_change("products", "t1");
    feed.switch_to_polling();
    tokio::time::sleep(Duration::from_secs(16)).await;

    let topics: Vec<String> = feed.notifications().into_iter().map(|r| r.topic).collect();
    assert_eq!(topics, vec!["products", "orders"]);
    assert_eq!(feed.unread_count(), 2);

    let newest = feed.notifications()[0].id.clone();
    assert!(feed.mark_read(&newest));
    assert_eq!(feed.unread_count(), 1);
    feed.mark_all_read();
    assert_eq!(feed.unread_count(), 0);
    assert!(feed.remove(&newest).is_some());
    assert_eq!(feed.notifications().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn realtime_changes_are_not_buffered_while_polling() {
    let (connector, mut peers) = FakeConnector::new();
    let (conn, signals) = realtime(connector);
    let probe = Arc::new(ScriptedProbe::default());
    let engine = Arc::new(PollingEngine::new(
        probe.clone(),
        PollingConfig {
            interval: Duration::from_secs(15),
            topics: vec!["orders".to_string()],
            ..PollingConfig::default()
        },
        TopicRegistry::default(),
    ));
    let coordinator =
        FeedCoordinator::new(conn, signals, engine, NotificationSink::new(), test_options());

    let feed = coordinator.acquire();
    let mut server = FakeServer::accept(&mut peers).await;
    server.handshake(9).await;
    wait_for_state(coordinator.realtime(), ConnectionState::Ready).await;

    // One backend change, seen by both the open socket and the next poll.
    probe.push_change("orders", "t0");
    probe.push_change("orders", "t1");
    feed.switch_to_polling();
    settle().await;
    server.send(&ServerFrame::Subscription {
        event: SubscriptionEvent::Update,
        collection: "orders".to_string(),
        data: json!({"id": 42}),
    });
    tokio::time::sleep(Duration::from_secs(16)).await;

    assert_eq!(feed.status().mode, FeedMode::Polling);
    assert_eq!(coordinator.realtime().state(), ConnectionState::Ready);
    assert_eq!(feed.notifications().len(), 1);

    feed.switch_to_realtime();
    let mut updates = feed.updates();
    server.send(&ServerFrame::Subscription {
        event: SubscriptionEvent::Create,
        collection: "orders".to_string(),
        data: json!({"id": 43}),
    });
    updates.recv().await.unwrap();
    assert_eq!(feed.notifications().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn events_from_an_earlier_generation_are_ignored() {
    let (connector, _peers) = FakeConnector::new();
    let (conn, _own_signals) = realtime(connector);
    let (events, signals) = mpsc::unbounded_channel();
    let polling = Arc::new(RecordingSource::default());
    let coordinator = FeedCoordinator::new(
        conn,
        signals,
        polling.clone(),
        NotificationSink::new(),
        test_options(),
    );

    let feed = coordinator.acquire();
    let mut notices = feed.notices();
    let current = coordinator.realtime().generation();
    let exhausted = LinkSignal::Exhausted {
        attempts: 5,
        reason: "connection refused".to_string(),
    };

    events
        .send(LinkEvent {
            generation: current - 1,
            signal: exhausted.clone(),
        })
        .unwrap();
    settle().await;
    assert_eq!(notices.try_recv(), Err(TryRecvError::Empty));
    assert_eq!(feed.status().mode, FeedMode::Realtime);
    assert!(!polling.is_running());

    events
        .send(LinkEvent {
            generation: current,
            signal: exhausted,
        })
        .unwrap();
    settle().await;
    assert!(matches!(
        notices.try_recv(),
        Ok(FeedNotice::RealtimeUnavailable { attempts: 5, .. })
    ));
    assert_eq!(feed.status().mode, FeedMode::Polling);
}
