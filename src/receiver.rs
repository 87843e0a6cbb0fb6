//! The public single-link receive API.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::instrument;

use crate::amqp::MessagingFactory;
use crate::config::ReceiverConfig;
use crate::error::Error;
use crate::link_state::{
    job_begin_open, job_close, job_match_pending, job_set_prefetch_delta, ErrorContextSnapshot,
    LinkState, LinkStateMachine,
};
use crate::pending_queue::{PendingQueue, PendingReceive};
use crate::reactor::ReactorBridge;
use crate::timeout_tracker::TimeoutTracker;

/// A single AMQP 1.0 receiver link, exposing batched, timeout-bounded
/// receives over an auto-recreating link.
///
/// Construct with [`Receiver::create`]; every other method may be called
/// from any number of concurrent callers and any thread.
pub struct Receiver {
    bridge: ReactorBridge,
    pending_queue: Arc<PendingQueue>,
    snapshot: Arc<Mutex<ErrorContextSnapshot>>,
    prefetch: Mutex<u32>,
    receive_timeout: Mutex<Duration>,
    closed: Mutex<bool>,
}

impl Receiver {
    /// Validates `config`, spawns the reactor task owning the link, and
    /// drives the initial attach. Resolves once the first attach succeeds or
    /// fails terminally (no retry was granted) or times out; a link that
    /// fails but *is* granted a retry still resolves this call with the
    /// failure, since [`crate::Receiver::create`] only ever represents the
    /// first attempt.
    #[instrument(skip(config, factory), fields(entity_path = %config.entity_path, link_name = %config.link_name))]
    pub async fn create(config: ReceiverConfig, factory: Arc<dyn MessagingFactory>) -> Result<Self, Error> {
        config.validate()?;

        let pending_queue = Arc::new(PendingQueue::new());
        let snapshot = Arc::new(Mutex::new(ErrorContextSnapshot::default()));
        let prefetch = config.prefetch;
        let operation_timeout = config.operation_timeout;

        let state = LinkStateMachine::new(config, factory, pending_queue.clone(), snapshot.clone());
        let bridge = ReactorBridge::spawn(state);

        let (tx, rx) = oneshot::channel();
        bridge
            .dispatch(job_begin_open(Some(tx)))
            .map_err(|_| Error::SchedulerRejected)?;

        match tokio::time::timeout(operation_timeout, rx).await {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => return Err(Error::SchedulerRejected),
            Err(_) => {
                let cause = snapshot.lock().unwrap().last_error.clone().map(Box::new);
                return Err(Error::Timeout(cause));
            }
        }

        Ok(Self {
            bridge,
            pending_queue,
            snapshot,
            prefetch: Mutex::new(prefetch),
            receive_timeout: Mutex::new(operation_timeout),
            closed: Mutex::new(false),
        })
    }

    /// Waits for up to `max_batch` messages, returning as soon as at least
    /// one is available, or an empty `Vec` once [`Receiver::get_receive_timeout`]
    /// elapses with nothing available.
    ///
    /// `max_batch` must be positive.
    pub async fn receive(&self, max_batch: usize) -> Result<Vec<crate::amqp::Message>, Error> {
        if max_batch == 0 {
            return Err(Error::InvalidArgument(
                "max_batch must be positive".to_string(),
            ));
        }
        let prefetch_target = *self.prefetch.lock().unwrap();
        if max_batch > usize::try_from(prefetch_target).unwrap_or(usize::MAX) {
            return Err(Error::InvalidArgument(format!(
                "max_batch ({max_batch}) must not exceed the prefetch target ({prefetch_target})"
            )));
        }
        if *self.closed.lock().unwrap() || self.snapshot.lock().unwrap().state == LinkState::Closed {
            return Err(Error::AlreadyClosed);
        }

        let timeout = *self.receive_timeout.lock().unwrap();
        let (tx, rx) = oneshot::channel();
        let pending = PendingReceive::new(tx, TimeoutTracker::starting_now(timeout), max_batch);
        self.pending_queue.push(pending);

        if self.bridge.dispatch(job_match_pending()).is_err() {
            return Err(Error::SchedulerRejected);
        }

        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::SchedulerRejected),
        }
    }

    /// Sets the prefetch target to `target`. Takes effect no later than the
    /// next credit flush after the reactor job runs (spec §5); the signed
    /// delta applied to AMQP credit (`target − previous_value`) is computed
    /// here, under the prefetch mutex, and only the delta crosses onto the
    /// reactor job (spec §9: `nextCreditToFlow` is never touched off the
    /// reactor thread).
    pub fn set_prefetch(&self, target: u32) -> Result<(), Error> {
        if *self.closed.lock().unwrap() {
            return Err(Error::AlreadyClosed);
        }
        let delta = {
            let mut prefetch = self.prefetch.lock().unwrap();
            let delta = i64::from(target) - i64::from(*prefetch);
            *prefetch = target;
            delta
        };
        self.bridge
            .dispatch(job_set_prefetch_delta(delta))
            .map_err(|_| Error::SchedulerRejected)
    }

    /// The locally tracked prefetch target (may briefly lag the reactor's
    /// authoritative value immediately after a concurrent [`Receiver::set_prefetch`]).
    pub fn get_prefetch(&self) -> u32 {
        *self.prefetch.lock().unwrap()
    }

    /// Overrides the timeout applied to subsequent [`Receiver::receive`]
    /// calls. Must be positive.
    pub fn set_receive_timeout(&self, timeout: Duration) -> Result<(), Error> {
        if timeout.is_zero() {
            return Err(Error::InvalidArgument(
                "receive timeout must be positive".to_string(),
            ));
        }
        *self.receive_timeout.lock().unwrap() = timeout;
        Ok(())
    }

    /// The timeout currently applied to new [`Receiver::receive`] calls.
    pub fn get_receive_timeout(&self) -> Duration {
        *self.receive_timeout.lock().unwrap()
    }

    /// A snapshot of the link's current health: state, last error, and the
    /// peer's tracking id from the last successful attach, if any.
    pub fn error_context(&self) -> ErrorContextSnapshot {
        self.snapshot.lock().unwrap().clone()
    }

    /// Requests a graceful detach and waits for it to complete or time out.
    /// Idempotent: closing an already-closed receiver succeeds immediately.
    /// Every outstanding and subsequent [`Receiver::receive`] resolves with
    /// [`Error::AlreadyClosed`].
    pub async fn close(&self) -> Result<(), Error> {
        {
            let mut closed = self.closed.lock().unwrap();
            if *closed {
                return Ok(());
            }
            *closed = true;
        }

        let (tx, rx) = oneshot::channel();
        if self.bridge.dispatch(job_close(tx)).is_err() {
            // The reactor is already gone, which only happens once it has
            // already torn everything down; treat that as already closed.
            return Ok(());
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Ok(()),
        }
    }
}
