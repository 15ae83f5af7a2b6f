//! Integration tests for alert delivery.
//!
//! Runs the full pipeline (source, pump, subscriptions) against the
//! simulated engine through the public `Services` API.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use tokio::time::timeout;
use tokio_test::{assert_err, assert_ok};
use undertow_core::config::UndertowConfig;
use undertow_core::engine::{Alert, AlertCategory, AlertKind, PieceIndex, Session, SimulatedSession};
use undertow_core::{AlertError, Services, SourceMode, SubscribeRequest};

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Running services over a fresh simulated engine.
struct DriverFixture {
    engine: Arc<SimulatedSession>,
    services: Services,
}

impl DriverFixture {
    fn new() -> Self {
        Self::with_engine(SimulatedSession::new(), UndertowConfig::for_testing())
    }

    /// Forces the worker-thread source on an engine without callbacks.
    fn with_thread_source() -> Self {
        let mut config = UndertowConfig::for_testing();
        config.alerts.source_mode = SourceMode::Thread;
        Self::with_engine(SimulatedSession::new().with_notify_support(false), config)
    }

    fn with_engine(engine: SimulatedSession, config: UndertowConfig) -> Self {
        let engine = Arc::new(engine);
        let services = Services::start(config, engine.clone()).unwrap();
        Self { engine, services }
    }

    fn pieces(count: usize) -> Vec<Bytes> {
        (0..count).map(|i| Bytes::from(vec![i as u8; 32])).collect()
    }
}

#[tokio::test]
async fn test_subscription_sees_matching_alerts_in_order() {
    let fixture = DriverFixture::new();
    let driver = fixture.services.driver();
    let mut logs = driver.subscribe(SubscribeRequest::new([AlertKind::Log]));

    for i in 0..5 {
        fixture.engine.post_log(&format!("message {i}"));
    }

    for i in 0..5 {
        let alert = timeout(TEST_TIMEOUT, logs.next()).await.unwrap().unwrap();
        assert_eq!(alert.message(), format!("message {i}"));
    }
}

#[tokio::test]
async fn test_handle_filter_excludes_other_torrents() {
    let fixture = DriverFixture::new();
    let driver = fixture.services.driver();
    let first = fixture.engine.add_torrent("first", DriverFixture::pieces(4));
    let second = fixture.engine.add_torrent("second", DriverFixture::pieces(4));

    let mut finished = driver.subscribe(
        SubscribeRequest::new([AlertKind::PieceFinished, AlertKind::TorrentRemoved])
            .for_handle(first),
    );

    fixture.engine.feed_piece(second, PieceIndex(0)).unwrap();
    fixture.engine.feed_piece(first, PieceIndex(2)).unwrap();
    fixture.engine.remove_torrent(second).unwrap();
    fixture.engine.remove_torrent(first).unwrap();

    let alert = timeout(TEST_TIMEOUT, finished.next()).await.unwrap().unwrap();
    assert!(matches!(
        *alert,
        Alert::PieceFinished { piece: PieceIndex(2), .. }
    ));
    let alert = timeout(TEST_TIMEOUT, finished.next()).await.unwrap().unwrap();
    assert_eq!(alert.kind(), AlertKind::TorrentRemoved);
    assert_eq!(alert.handle(), Some(first));
}

#[tokio::test]
async fn test_unfiltered_subscription_sees_every_enabled_alert() {
    let fixture = DriverFixture::new();
    let driver = fixture.services.driver();
    let everything = driver.subscribe(SubscribeRequest::default().with_mask(AlertCategory::STATUS));

    let handle = fixture.engine.add_torrent("ubuntu.iso", DriverFixture::pieces(1));
    fixture.engine.remove_torrent(handle).unwrap();

    let kinds: Vec<AlertKind> = timeout(
        TEST_TIMEOUT,
        everything
            .into_stream()
            .take(3)
            .map(|alert| alert.unwrap().kind())
            .collect(),
    )
    .await
    .unwrap();
    assert_eq!(
        kinds,
        vec![
            AlertKind::AddTorrent,
            AlertKind::TorrentAdded,
            AlertKind::TorrentRemoved
        ]
    );
}

#[tokio::test]
async fn test_mask_follows_live_subscriptions() {
    let fixture = DriverFixture::new();
    let driver = fixture.services.driver();
    assert_eq!(fixture.engine.alert_mask(), AlertCategory::ERROR | AlertCategory::STATUS);

    let reads = driver.subscribe(SubscribeRequest::new([AlertKind::ReadPiece]));
    let more_reads = driver.subscribe(SubscribeRequest::new([AlertKind::ReadPiece]));
    assert!(fixture.engine.alert_mask().contains(AlertCategory::STORAGE));

    drop(reads);
    assert!(fixture.engine.alert_mask().contains(AlertCategory::STORAGE));
    drop(more_reads);
    assert!(!fixture.engine.alert_mask().contains(AlertCategory::STORAGE));
}

#[tokio::test]
async fn test_raise_if_removed_fails_fast() {
    let fixture = DriverFixture::new();
    let driver = fixture.services.driver();
    let handle = fixture.engine.add_torrent("gone", DriverFixture::pieces(1));
    fixture.engine.remove_torrent(handle).unwrap();

    let mut subscription = driver.subscribe(
        SubscribeRequest::new([AlertKind::ReadPiece])
            .for_handle(handle)
            .raise_if_removed(),
    );
    let result = timeout(TEST_TIMEOUT, subscription.next()).await.unwrap();
    assert_eq!(assert_err!(result), AlertError::HandleInvalid);
}

#[tokio::test]
async fn test_shutdown_resolves_waiting_subscriber() {
    let fixture = DriverFixture::new();
    let mut subscription = fixture
        .services
        .driver()
        .subscribe(SubscribeRequest::new([AlertKind::Log]));

    let waiter = tokio::spawn(async move { subscription.next().await });
    tokio::task::yield_now().await;

    assert_ok!(fixture.services.shutdown().await);
    let result = timeout(TEST_TIMEOUT, waiter).await.unwrap().unwrap();
    assert_eq!(assert_err!(result), AlertError::Shutdown);
}

#[tokio::test]
async fn test_wait_until_idle_reports_slow_subscriber() {
    let fixture = DriverFixture::new();
    let driver = fixture.services.driver();
    let mut fast = driver.subscribe(SubscribeRequest::new([AlertKind::Log]));
    let mut slow = driver.subscribe(SubscribeRequest::new([AlertKind::Log]));

    fixture.engine.post_log("batch");
    // Once the fast subscriber has it, the whole batch was dispatched
    timeout(TEST_TIMEOUT, fast.next()).await.unwrap().unwrap();

    let idle = driver.wait_until_idle(Duration::from_millis(50)).await;
    assert!(matches!(idle, Err(AlertError::IdleTimeout { .. })));

    assert_ok!(slow.next().await);
    assert_ok!(driver.wait_until_idle(TEST_TIMEOUT).await);
}

#[tokio::test]
async fn test_slow_subscriber_delays_but_does_not_drop_alerts() {
    let fixture = DriverFixture::new();
    let driver = fixture.services.driver();
    let mut slow = driver.subscribe(SubscribeRequest::new([AlertKind::Log]));

    fixture.engine.post_log("first");
    tokio::time::sleep(Duration::from_millis(50)).await;
    fixture.engine.post_log("second");
    fixture.engine.post_log("third");

    // Longer than the testing stall timeout, so the pump warns and retries
    tokio::time::sleep(Duration::from_millis(700)).await;

    let mut messages = Vec::new();
    for _ in 0..3 {
        let alert = timeout(TEST_TIMEOUT, slow.next()).await.unwrap().unwrap();
        messages.push(alert.message());
    }
    assert_eq!(messages, vec!["first", "second", "third"]);
}

#[tokio::test]
async fn test_thread_source_delivers_batches() {
    let fixture = DriverFixture::with_thread_source();
    let driver = fixture.services.driver();
    let mut logs = driver.subscribe(SubscribeRequest::new([AlertKind::Log]));

    for round in 0..3 {
        fixture.engine.post_log(&format!("round {round}"));
        let alert = timeout(TEST_TIMEOUT, logs.next()).await.unwrap().unwrap();
        assert_eq!(alert.message(), format!("round {round}"));
    }
    drop(logs);
    assert_ok!(fixture.services.shutdown().await);
}

#[tokio::test]
async fn test_stage_alert_mask_replaces_static_mask() {
    let fixture = DriverFixture::new();
    let reads = fixture
        .services
        .driver()
        .subscribe(SubscribeRequest::new([AlertKind::ReadPiece]));

    fixture
        .services
        .stage_alert_mask(AlertCategory::TRACKER, TEST_TIMEOUT)
        .await;

    let mask = fixture.engine.alert_mask();
    assert!(mask.contains(AlertCategory::TRACKER));
    assert!(mask.contains(AlertCategory::STORAGE));
    assert!(!mask.contains(AlertCategory::ERROR));
    drop(reads);
}

#[tokio::test]
async fn test_source_without_readiness_is_rejected() {
    let engine = Arc::new(
        SimulatedSession::new()
            .with_notify_support(false)
            .with_wait_support(false),
    );
    let result = Services::start(UndertowConfig::for_testing(), engine);
    assert!(matches!(
        result,
        Err(undertow_core::UndertowError::Alert(AlertError::Unsupported))
    ));
}

#[tokio::test]
async fn test_dropping_subscriber_between_batches_loses_nothing_for_others() {
    let fixture = DriverFixture::new();
    let driver = fixture.services.driver();
    let mut first = driver.subscribe(SubscribeRequest::new([AlertKind::Log]));
    let mut leaving = driver.subscribe(SubscribeRequest::new([AlertKind::Log]));
    let mut last = driver.subscribe(SubscribeRequest::new([AlertKind::Log]));

    // Posted without yielding, so the pump drains them as one batch
    for i in 0..5 {
        fixture.engine.post_log(&format!("message {i}"));
    }
    let mut seen_first = Vec::new();
    let mut seen_last = Vec::new();
    for _ in 0..5 {
        seen_first.push(timeout(TEST_TIMEOUT, first.next()).await.unwrap().unwrap().message());
        seen_last.push(timeout(TEST_TIMEOUT, last.next()).await.unwrap().unwrap().message());
    }
    // Leaves with part of its slice still unread
    timeout(TEST_TIMEOUT, leaving.next()).await.unwrap().unwrap();
    drop(leaving);

    for i in 5..10 {
        fixture.engine.post_log(&format!("message {i}"));
    }
    for _ in 5..10 {
        seen_first.push(timeout(TEST_TIMEOUT, first.next()).await.unwrap().unwrap().message());
        seen_last.push(timeout(TEST_TIMEOUT, last.next()).await.unwrap().unwrap().message());
    }

    let expected: Vec<String> = (0..10).map(|i| format!("message {i}")).collect();
    assert_eq!(seen_first, expected);
    assert_eq!(seen_last, expected);
    assert_ok!(driver.wait_until_idle(TEST_TIMEOUT).await);
}
