//! Facade-level tests against the fakes in [`super::fakes`]: the basic
//! `create`/`receive`/`close` contract, argument validation and the
//! round-trip/idempotence properties from spec §8.
//!
//! Grounded on `kanin/src/tests/basic.rs`'s "one test module, fakes defined
//! inline, `#[tokio::test]`" shape.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::fakes::{
    init_logging, msg, test_config, Control, FakeFactory, NoopSettingsProvider, OpenScript,
};
use super::{Error, Receiver};

fn new_factory() -> (Arc<Control>, Arc<Mutex<OpenScript>>, FakeFactory) {
    init_logging();
    let control = Arc::new(Control::default());
    let script = Arc::new(Mutex::new(OpenScript::default()));
    let factory = FakeFactory::new(control.clone(), script.clone());
    (control, script, factory)
}

async fn create_open_receiver() -> (Receiver, Arc<Control>) {
    let (control, _script, factory) = new_factory();
    let config = test_config(Arc::new(NoopSettingsProvider));
    let receiver = Receiver::create(config, Arc::new(factory))
        .await
        .expect("open should succeed");
    (receiver, control)
}

#[tokio::test]
async fn create_completes_once_attach_is_acked() {
    let (receiver, control) = create_open_receiver().await;
    assert_eq!(control.open_attempts.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert!(!control.handlers.lock().unwrap().is_empty());
    drop(receiver);
}

#[tokio::test]
async fn receive_delivers_a_message_handed_in_after_the_call() {
    let (receiver, control) = create_open_receiver().await;

    let handler = control.last_handler();
    let recv = tokio::spawn(async move { receiver.receive(5).await });

    // Give the reactor a moment to enqueue the pending request before the
    // delivery arrives, matching the spec's "arrives after receive" framing.
    tokio::time::sleep(Duration::from_millis(20)).await;
    handler.on_receive_complete(msg("hello"));

    let batch = recv.await.unwrap().unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].body, b"hello");
}

#[tokio::test]
async fn receive_zero_fails_synchronously_with_argument_error() {
    let (receiver, _control) = create_open_receiver().await;
    let err = receiver.receive(0).await.unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
}

#[tokio::test]
async fn receive_above_prefetch_target_fails_synchronously_with_argument_error() {
    let (receiver, _control) = create_open_receiver().await;
    let prefetch = usize::try_from(receiver.get_prefetch()).unwrap();
    let err = receiver.receive(prefetch + 1).await.unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
}

#[tokio::test]
async fn consecutive_receives_with_no_arrivals_time_out_with_empty_batches() {
    let (_control, script, factory) = new_factory();
    script.lock().unwrap().auto_ack_open = true;
    let config = test_config(Arc::new(NoopSettingsProvider))
        .with_operation_timeout(Duration::from_millis(60));
    let receiver = Receiver::create(config, Arc::new(factory)).await.unwrap();

    for _ in 0..3 {
        let batch = receiver.receive(1).await.unwrap();
        assert!(batch.is_empty());
    }
}

#[tokio::test]
async fn close_is_idempotent() {
    let (receiver, _control) = create_open_receiver().await;
    receiver.close().await.unwrap();
    receiver.close().await.unwrap();
}

#[tokio::test]
async fn receive_after_close_fails_with_already_closed() {
    let (receiver, _control) = create_open_receiver().await;
    receiver.close().await.unwrap();
    let err = receiver.receive(1).await.unwrap_err();
    assert!(matches!(err, Error::AlreadyClosed));
}

#[tokio::test]
async fn set_prefetch_then_get_prefetch_round_trips() {
    let (receiver, _control) = create_open_receiver().await;
    receiver.set_prefetch(7).unwrap();
    assert_eq!(receiver.get_prefetch(), 7);
}

#[tokio::test]
async fn error_context_reports_open_state_and_tracking_id() {
    let (receiver, _control) = create_open_receiver().await;
    let ctx = receiver.error_context();
    assert_eq!(ctx.state, crate::LinkState::Open);
    assert!(ctx.remote_tracking_id.is_some());
    assert!(ctx.last_error.is_none());
    assert_eq!(ctx.host, "fake.host");
    assert_eq!(ctx.entity_path, "entity-path");
    assert_eq!(ctx.prefetch_target, receiver.get_prefetch());
}

#[tokio::test]
async fn open_fails_when_session_acquisition_fails_and_no_retry_is_granted() {
    use crate::error::LinkError;

    let control = Arc::new(Control::default());
    let script = Arc::new(Mutex::new(OpenScript::default()));
    let factory = FakeFactory::new(control, script)
        .with_retry_delay(None)
        .with_get_session_error(LinkError::fatal("session refused"));
    let config = test_config(Arc::new(NoopSettingsProvider));

    let err = Receiver::create(config, Arc::new(factory)).await.unwrap_err();
    assert!(matches!(err, Error::Protocol(_)));
}
