//! The six concrete scenarios from spec §8, run against the facade and the
//! fakes in [`super::fakes`].

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::fakes::{
    init_logging, msg, test_config, Control, FakeFactory, NoopSettingsProvider, OpenScript,
};
use super::{Error, LinkState, Receiver};

fn new_factory() -> (Arc<Control>, Arc<Mutex<OpenScript>>, FakeFactory) {
    init_logging();
    let control = Arc::new(Control::default());
    let script = Arc::new(Mutex::new(OpenScript::default()));
    let factory = FakeFactory::new(control.clone(), script.clone());
    (control, script, factory)
}

/// Scenario 1: caller asks for up to 5, only 3 arrive; the future completes
/// with those 3 well inside the timeout window rather than waiting for it to
/// elapse.
#[tokio::test]
async fn scenario_1_partial_batch_completes_before_timeout() {
    let (control, _script, factory) = new_factory();
    let config =
        test_config(Arc::new(NoopSettingsProvider)).with_operation_timeout(Duration::from_secs(1));
    let receiver = Receiver::create(config, Arc::new(factory)).await.unwrap();
    let handler = control.last_handler();

    let recv = tokio::spawn(async move { receiver.receive(5).await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    handler.on_receive_complete(msg("a"));
    handler.on_receive_complete(msg("b"));
    handler.on_receive_complete(msg("c"));

    let started = tokio::time::Instant::now();
    let batch = tokio::time::timeout(Duration::from_millis(500), recv)
        .await
        .expect("should not wait for the full 1s timeout")
        .unwrap()
        .unwrap();
    assert_eq!(batch.len(), 3);
    assert!(started.elapsed() < Duration::from_secs(1));
}

/// Scenario 2: prefetch=100, 100 messages delivered then drained by ten
/// `receive(10)` calls. Credit accumulates by one per poll and flushes in a
/// single `flow(100)` once the threshold is reached (on top of the initial
/// open flow).
#[tokio::test]
async fn scenario_2_prefetch_drain_triggers_a_single_batched_flow() {
    let (control, _script, factory) = new_factory();
    let config = test_config(Arc::new(NoopSettingsProvider)).with_prefetch(100);
    let receiver = Receiver::create(config, Arc::new(factory)).await.unwrap();
    let handler = control.last_handler();

    // Initial open flow: prefetch_target(100) - buffered(0).
    assert_eq!(control.flows.lock().unwrap().clone(), vec![100]);

    for i in 0..100 {
        handler.on_receive_complete(msg(&format!("m{i}")));
    }
    // Let the reactor finish pushing all 100 deliveries before draining.
    tokio::time::sleep(Duration::from_millis(20)).await;

    for _ in 0..10 {
        let batch = receiver.receive(10).await.unwrap();
        assert_eq!(batch.len(), 10);
    }

    assert_eq!(control.flows.lock().unwrap().clone(), vec![100, 100]);
}

/// Scenario 3: a transient error tears the link down; the retry policy
/// grants a delay; the recreated link opens and the caller's still-pending
/// `receive` is satisfied by a message arriving on the new link.
#[tokio::test]
async fn scenario_3_transient_error_then_recover() {
    let (control, _script, factory) = {
        let (control, script, factory) = new_factory();
        (control, script, factory.with_retry_delay(Some(Duration::from_millis(30))))
    };
    let config =
        test_config(Arc::new(NoopSettingsProvider)).with_operation_timeout(Duration::from_secs(5));
    let receiver = Receiver::create(config, Arc::new(factory)).await.unwrap();

    let first_handler = control.last_handler();
    assert_eq!(control.open_attempts.load(Ordering::SeqCst), 1);

    let recv = tokio::spawn(async move { receiver.receive(1).await });
    tokio::time::sleep(Duration::from_millis(20)).await;

    first_handler.on_error(crate::error::LinkError::transient("transport reset"));

    // Wait for the retry delay to elapse and the recreated link to open
    // (the fake auto-acks the attach).
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(control.open_attempts.load(Ordering::SeqCst), 2);

    let second_handler = control.last_handler();
    second_handler.on_receive_complete(msg("recovered"));

    let batch = tokio::time::timeout(Duration::from_secs(1), recv)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].body, b"recovered");
}

/// Scenario 4: a non-transient error (no retry granted) fails every pending
/// receive with the cause, and the link is terminally dead: a subsequent
/// `receive` fails with "already closed".
#[tokio::test]
async fn scenario_4_non_transient_error_drains_pending_with_the_cause() {
    let (control, _script, factory) = {
        let (control, script, factory) = new_factory();
        (control, script, factory.with_retry_delay(None))
    };
    let config =
        test_config(Arc::new(NoopSettingsProvider)).with_operation_timeout(Duration::from_secs(5));
    let receiver = Arc::new(Receiver::create(config, Arc::new(factory)).await.unwrap());
    let handler = control.last_handler();

    let mut pending = Vec::new();
    for _ in 0..3 {
        let receiver = receiver.clone();
        pending.push(tokio::spawn(async move { receiver.receive(1).await }));
    }
    tokio::time::sleep(Duration::from_millis(20)).await;

    handler.on_error(crate::error::LinkError::fatal("non-transient protocol violation"));

    for task in pending {
        let result = task.await.unwrap();
        assert!(matches!(result, Err(Error::Protocol(_))));
    }

    let err = receiver.receive(1).await.unwrap_err();
    assert!(matches!(err, Error::AlreadyClosed));
    assert_eq!(receiver.error_context().state, LinkState::Closed);
}

/// Scenario 5: the peer never acks the attach; the open future fails with a
/// timeout once `operation_timeout` elapses.
#[tokio::test]
async fn scenario_5_open_timeout() {
    let (_control, script, factory) = new_factory();
    script.lock().unwrap().auto_ack_open = false;
    let config = test_config(Arc::new(NoopSettingsProvider))
        .with_prefetch(10)
        .with_operation_timeout(Duration::from_millis(100));

    let started = tokio::time::Instant::now();
    let err = Receiver::create(config, Arc::new(factory)).await.unwrap_err();
    // No prior link error precedes this timeout, so its cause is `None`.
    assert!(matches!(err, Error::Timeout(None)));
    assert!(started.elapsed() >= Duration::from_millis(100));
}

/// `last_error` is exactly the value `open_timeout_fire`/`close_timeout_fire`
/// attach as a timeout's cause (spec §8 scenario 5), so it must keep
/// recording the most recent link error even once a link is past its initial
/// attach and is just retrying in the background — not only during the
/// window `create()` itself observes.
#[tokio::test]
async fn last_error_is_recorded_for_a_transient_failure_on_an_already_open_link() {
    let (control, _script, factory) = {
        let (control, script, factory) = new_factory();
        (control, script, factory.with_retry_delay(Some(Duration::from_millis(20))))
    };
    let config =
        test_config(Arc::new(NoopSettingsProvider)).with_operation_timeout(Duration::from_secs(5));
    let receiver = Receiver::create(config, Arc::new(factory)).await.unwrap();
    let handler = control.last_handler();

    // The link is fully open now, so `create()` has already resolved; error
    // it so a retry is scheduled and `last_error` is recorded in the
    // background, independent of any lifecycle future.
    handler.on_error(crate::error::LinkError::transient("transport reset"));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let ctx = receiver.error_context();
    assert_eq!(
        ctx.last_error.map(|e| e.message),
        Some("transport reset".to_string())
    );
}

/// Scenario 6: closing with in-flight receives completes them with an empty
/// batch (not an error), and the close future itself succeeds.
#[tokio::test]
async fn scenario_6_graceful_close_completes_in_flight_receives_with_null() {
    let (_control, _script, factory) = new_factory();
    let config =
        test_config(Arc::new(NoopSettingsProvider)).with_operation_timeout(Duration::from_secs(5));
    let receiver = Arc::new(Receiver::create(config, Arc::new(factory)).await.unwrap());

    let mut pending = Vec::new();
    for _ in 0..2 {
        let receiver = receiver.clone();
        pending.push(tokio::spawn(async move { receiver.receive(1).await }));
    }
    tokio::time::sleep(Duration::from_millis(20)).await;

    receiver.close().await.unwrap();

    for task in pending {
        let batch = task.await.unwrap().unwrap();
        assert!(batch.is_empty());
    }
}
