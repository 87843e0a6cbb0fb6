//! The reactor-owned link lifecycle: attach, credit, matching, retry and
//! detach, all serialized by running exclusively as jobs on the single
//! reactor task (see [`crate::reactor`]).
//!
//! Grounded on `kanin/src/app/task.rs`'s single-task ownership of connection
//! state, generalized from AMQP 0-9-1 reconnect handling to the attach/detach
//! and credit-flow lifecycle of an AMQP 1.0 receiver link (spec §4.4).

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::oneshot;
use tracing::warn;

use crate::amqp::{
    AmqpReceiverLink, Message, MessagingFactory, ReceiverLinkOptions, ReceiverSettleMode,
    SenderSettleMode,
};
use crate::config::ReceiverConfig;
use crate::credit::CreditController;
use crate::error::{Error, LinkError, TrackingId};
use crate::pending_queue::PendingQueue;
use crate::prefetch_buffer::PrefetchBuffer;
use crate::reactor::{Job, LinkHandlerSink, ReactorBridge};
use crate::timer::TimerHandle;
use crate::token_manager::TokenManager;

/// The lifecycle state of a single receiver link.
///
/// See spec §4.4 for the full transition table; `Errored` does not carry its
/// cause directly (that lives in [`ErrorContextSnapshot::last_error`]) so
/// that the enum stays `Copy` and cheap to snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// No attach has ever been attempted.
    Uninitialized,
    /// A session/link/token/attach sequence is in flight.
    Creating,
    /// The link is attached and serving receives.
    Open,
    /// The link has failed; either waiting on a scheduled retry or
    /// permanently failed (no retry was granted).
    Errored,
    /// A local close was requested; waiting on the peer's detach ack or the
    /// close timeout.
    Closing,
    /// Closed, either cleanly or forced by a close timeout.
    Closed,
}

/// A point-in-time snapshot of link health, exposed via
/// [`crate::Receiver::error_context`].
#[derive(Debug, Clone)]
pub struct ErrorContextSnapshot {
    /// Current lifecycle state.
    pub state: LinkState,
    /// The most recent failure, if the link has ever errored.
    pub last_error: Option<LinkError>,
    /// The AMQP host name this link connects to.
    pub host: String,
    /// The link's configured name.
    pub link_name: String,
    /// The entity path this link reads from.
    pub entity_path: String,
    /// The peer-supplied tracking id from the last successful attach, if any.
    pub remote_tracking_id: Option<TrackingId>,
    /// The current prefetch target, as tracked on the reactor thread.
    pub prefetch_target: u32,
    /// Current outstanding AMQP credit, as last flowed to the link.
    pub current_credit: u32,
    /// Number of messages currently sitting in the prefetch buffer, awaiting
    /// a matching pending receive.
    pub prefetch_buffer_len: usize,
}

impl Default for ErrorContextSnapshot {
    fn default() -> Self {
        Self {
            state: LinkState::Uninitialized,
            last_error: None,
            host: String::new(),
            link_name: String::new(),
            entity_path: String::new(),
            remote_tracking_id: None,
            prefetch_target: 0,
            current_credit: 0,
            prefetch_buffer_len: 0,
        }
    }
}

fn cancel_timer(handle: &mut Option<TimerHandle>) {
    if let Some(h) = handle.take() {
        h.cancel();
    }
}

/// Boxes an async method call into a [`Job`] the reactor can run.
fn box_job<F>(f: F) -> Job
where
    F: for<'a> FnOnce(&'a mut LinkStateMachine) -> BoxFuture<'a, ()> + Send + 'static,
{
    Box::new(f)
}

/// The peer has acked (or failed) the link attach.
pub(crate) fn job_on_open_complete(err: Option<LinkError>) -> Job {
    box_job(move |state| Box::pin(async move { state.on_open_complete(err).await }))
}

/// A delivery has arrived and been settled.
pub(crate) fn job_on_receive_complete(message: Message) -> Job {
    box_job(move |state| Box::pin(async move { state.on_receive_complete(message).await }))
}

/// The link failed (peer detach with error, or a transport failure).
pub(crate) fn job_on_error(cause: LinkError) -> Job {
    box_job(move |state| Box::pin(async move { state.on_error(cause).await }))
}

/// The peer has acked a detach.
pub(crate) fn job_on_close(error_condition: Option<LinkError>) -> Job {
    box_job(move |state| Box::pin(async move { state.on_close(error_condition).await }))
}

/// Begins (or retries) the open procedure, completing `completion` once the
/// attach either succeeds or fails terminally for this attempt.
pub(crate) fn job_begin_open(completion: Option<oneshot::Sender<Result<(), Error>>>) -> Job {
    box_job(move |state| Box::pin(async move { state.open_procedure(completion).await }))
}

/// Requests a graceful close, completing `completion` once the detach is
/// acked, the close times out, or the link was never open.
pub(crate) fn job_close(completion: oneshot::Sender<Result<(), Error>>) -> Job {
    box_job(move |state| Box::pin(async move { state.close_procedure(completion).await }))
}

/// A new receive request was pushed onto the pending queue; attempts to
/// match it (and any ahead of it) against the prefetch buffer.
pub(crate) fn job_match_pending() -> Job {
    box_job(|state| Box::pin(state.match_pending()))
}

/// [`crate::Receiver::set_prefetch`] requested a change to the credit target.
pub(crate) fn job_set_prefetch_delta(delta: i64) -> Job {
    box_job(move |state| Box::pin(async move { state.apply_prefetch_delta(delta).await }))
}

/// The timer tracking the head of the pending queue's deadline fired.
pub(crate) fn job_operation_timer_fire() -> Job {
    box_job(|state| Box::pin(state.handle_operation_timer_fire()))
}

/// The retry delay scheduled by [`LinkStateMachine::fail_link`] elapsed.
pub(crate) fn job_retry_open() -> Job {
    box_job(|state| Box::pin(state.retry_open()))
}

/// The open operation's timeout elapsed before an attach completion arrived.
pub(crate) fn job_open_timeout() -> Job {
    box_job(|state| Box::pin(state.open_timeout_fire()))
}

/// The close operation's timeout elapsed before a detach ack arrived.
pub(crate) fn job_close_timeout() -> Job {
    box_job(|state| Box::pin(state.close_timeout_fire()))
}

/// Owns the receiver link's lifecycle, credit accounting and the prefetch
/// buffer. Every method here runs exclusively on the reactor task: there is
/// no internal synchronization because [`crate::reactor::ReactorBridge`]
/// guarantees only one job touches this struct at a time.
pub(crate) struct LinkStateMachine {
    state: LinkState,
    config: ReceiverConfig,
    factory: Arc<dyn MessagingFactory>,
    link: Option<Box<dyn AmqpReceiverLink>>,
    prefetch_buffer: PrefetchBuffer,
    pending_queue: Arc<PendingQueue>,
    credit: CreditController,
    token_manager: Option<TokenManager>,
    bridge: Option<ReactorBridge>,
    operation_timer: Option<TimerHandle>,
    retry_timer: Option<TimerHandle>,
    open_timeout_handle: Option<TimerHandle>,
    close_timeout_handle: Option<TimerHandle>,
    open_completion: Option<oneshot::Sender<Result<(), Error>>>,
    close_completion: Option<oneshot::Sender<Result<(), Error>>>,
    last_received_message: Option<Message>,
    last_error: Option<LinkError>,
    snapshot: Arc<Mutex<ErrorContextSnapshot>>,
}

impl LinkStateMachine {
    pub(crate) fn new(
        config: ReceiverConfig,
        factory: Arc<dyn MessagingFactory>,
        pending_queue: Arc<PendingQueue>,
        snapshot: Arc<Mutex<ErrorContextSnapshot>>,
    ) -> Self {
        let credit = CreditController::new(config.prefetch);
        {
            let mut guard = snapshot.lock().unwrap();
            guard.host = config.host.clone();
            guard.link_name = config.link_name.clone();
            guard.entity_path = config.entity_path.clone();
            guard.prefetch_target = config.prefetch;
        }
        Self {
            state: LinkState::Uninitialized,
            config,
            factory,
            link: None,
            prefetch_buffer: PrefetchBuffer::new(),
            pending_queue,
            credit,
            token_manager: None,
            bridge: None,
            operation_timer: None,
            retry_timer: None,
            open_timeout_handle: None,
            close_timeout_handle: None,
            open_completion: None,
            close_completion: None,
            last_received_message: None,
            last_error: None,
            snapshot,
        }
    }

    /// Installs the bridge used to dispatch further jobs and timers. Called
    /// once by [`ReactorBridge::spawn`] before the reactor loop starts.
    pub(crate) fn attach_bridge(&mut self, bridge: ReactorBridge) {
        self.bridge = Some(bridge);
    }

    fn bridge(&self) -> ReactorBridge {
        self.bridge
            .clone()
            .expect("reactor bridge is attached before any job can run")
    }

    fn update_snapshot(&self) {
        let mut guard = self.snapshot.lock().unwrap();
        guard.state = self.state;
        guard.last_error = self.last_error.clone();
        guard.remote_tracking_id = self
            .link
            .as_deref()
            .and_then(AmqpReceiverLink::remote_tracking_id);
        guard.prefetch_target = self.credit.prefetch_target();
        guard.current_credit = self.link.as_deref().map_or(0, AmqpReceiverLink::credit);
        guard.prefetch_buffer_len = self.prefetch_buffer.len();
    }

    /// Runs (or re-runs, for a retry) the session/link/token/attach
    /// sequence. `completion` is `Some` only for the call that originated
    /// from [`crate::Receiver::create`]; retries pass `None` since no
    /// external future is waiting on them.
    async fn open_procedure(&mut self, completion: Option<oneshot::Sender<Result<(), Error>>>) {
        if matches!(self.state, LinkState::Closing | LinkState::Closed) {
            if let Some(tx) = completion {
                let _ = tx.send(Err(Error::AlreadyClosed));
            }
            return;
        }

        cancel_timer(&mut self.retry_timer);
        if let Some(stale) = self.open_completion.take() {
            let _ = stale.send(Err(Error::AlreadyClosed));
        }
        self.open_completion = completion;
        self.state = LinkState::Creating;
        self.update_snapshot();

        cancel_timer(&mut self.open_timeout_handle);
        self.open_timeout_handle = Some(
            self.bridge()
                .dispatch_after(self.config.operation_timeout, job_open_timeout()),
        );

        // Spec §4.4: the token manager must send a valid CBS token for
        // `tokenAudience` before any session acquisition — session creation
        // is chained after token-send completion, not the other way round.
        let mut token_manager =
            TokenManager::new(self.factory.clone(), self.config.token_audience.clone());
        if let Err(cause) = token_manager.send_token().await {
            self.on_error(cause).await;
            return;
        }

        let session = match self.factory.get_session(&self.config.entity_path).await {
            Ok(session) => session,
            Err(cause) => {
                self.on_error(cause).await;
                return;
            }
        };

        let handler = LinkHandlerSink::new(self.bridge());
        let link = match session
            .create_receiver_link(&self.config.link_name, &self.config.entity_path, handler)
            .await
        {
            Ok(link) => link,
            Err(cause) => {
                self.on_error(cause).await;
                return;
            }
        };

        let options = ReceiverLinkOptions {
            filter: self
                .config
                .settings_provider
                .get_filter(self.last_received_message.as_ref()),
            properties: self.config.settings_provider.get_properties(),
            desired_capabilities: self.config.settings_provider.get_desired_capabilities(),
            sender_settle_mode: SenderSettleMode::Unsettled,
            receiver_settle_mode: ReceiverSettleMode::Second,
        };

        if let Err(cause) = link.open(options).await {
            self.on_error(cause).await;
            return;
        }

        token_manager.start_periodic_refresh();
        self.token_manager = Some(token_manager);
        self.link = Some(link);
        // Completion is deferred until `on_open_complete` is driven by the
        // engine reporting the attach as acked; `link.open` above only sends
        // the attach frame.
    }

    /// The engine reported the attach request as acked (`None`) or failed
    /// (`Some`).
    async fn on_open_complete(&mut self, err: Option<LinkError>) {
        cancel_timer(&mut self.open_timeout_handle);
        match err {
            Some(cause) => self.on_error(cause).await,
            None => {
                self.state = LinkState::Open;
                self.last_error = None;
                self.update_snapshot();

                if let Some(link) = self.link.as_deref() {
                    if let Err(cause) = self
                        .credit
                        .on_open_complete(link, self.prefetch_buffer.len())
                        .await
                    {
                        self.fail_link(cause).await;
                        return;
                    }
                }

                if let Some(tx) = self.open_completion.take() {
                    let _ = tx.send(Ok(()));
                }

                self.match_pending().await;
            }
        }
    }

    /// A delivery has arrived and been settled by the engine.
    async fn on_receive_complete(&mut self, message: Message) {
        if !matches!(self.state, LinkState::Open) {
            // A stray delivery arriving after the link has moved on (e.g.
            // mid-close): nothing meaningful to do with it.
            return;
        }
        self.prefetch_buffer.push(message);
        self.match_pending().await;
    }

    /// The link failed, whether during attach, while open, or via a peer
    /// detach with an error condition. Completes a pending open future (if
    /// any) with the cause, then hands off to [`LinkStateMachine::fail_link`]
    /// for the shared teardown/retry logic.
    async fn on_error(&mut self, cause: LinkError) {
        if let Some(tx) = self.open_completion.take() {
            let _ = tx.send(Err(Error::Protocol(cause.clone())));
        }
        self.fail_link(cause).await;
    }

    /// Shared teardown for any link failure: clears transient state, asks
    /// the retry policy whether to recreate the link, and either schedules a
    /// retry or fails every pending receive outright.
    async fn fail_link(&mut self, cause: LinkError) {
        cancel_timer(&mut self.open_timeout_handle);
        cancel_timer(&mut self.operation_timer);
        cancel_timer(&mut self.retry_timer);

        self.prefetch_buffer.clear();
        self.link = None;
        self.token_manager = None;
        self.last_error = Some(cause.clone());

        if matches!(self.state, LinkState::Closing | LinkState::Closed) {
            // Spec §4.4 error path: an error arriving while already
            // closing/closed skips the retry policy entirely — cancel the
            // close timer, drain with the error, complete the close future.
            cancel_timer(&mut self.close_timeout_handle);
            self.state = LinkState::Closed;
            self.update_snapshot();
            self.drain_pending_with_error(Error::Protocol(cause.clone()));
            if let Some(tx) = self.close_completion.take() {
                let _ = tx.send(Err(Error::Protocol(cause)));
            }
            return;
        }

        let head_pending_deadline_remaining = self
            .pending_queue
            .front_deadline()
            .map(|deadline| deadline.remaining())
            .unwrap_or(Duration::ZERO);

        let retry = self.factory.retry_policy().retry_after(
            self.factory.client_id(),
            &cause,
            head_pending_deadline_remaining,
        );

        match retry {
            Some(delay) => {
                self.state = LinkState::Errored;
                self.update_snapshot();
                self.schedule_retry(delay);
            }
            None => {
                // No retry was granted: permanent (non-transient cause) or no
                // retry budget remains. Either way nothing will ever recreate
                // this link on its own, so it is terminally dead — generalizes
                // the state diagram's "Errored -> Closed (on non-transient
                // error)" transition to cover both cases (spec §8 scenario 4).
                self.state = LinkState::Closed;
                self.update_snapshot();
                if cause.transient {
                    // Spec §3/§7: a transient cause with no retry granted
                    // still completes pending receives on the success path
                    // (null batch), leaving the caller to retry at its own
                    // layer, rather than surfacing the cause as an error.
                    self.drain_pending_with_null();
                } else {
                    self.drain_pending_with_error(Error::Protocol(cause));
                }
            }
        }
    }

    fn schedule_retry(&mut self, delay: Duration) {
        (self.config.on_open_retry)();
        cancel_timer(&mut self.retry_timer);
        self.retry_timer = Some(self.bridge().dispatch_after(delay, job_retry_open()));
    }

    /// A scheduled retry fired. Stale if the link has moved on (closed, or
    /// another open already completed) by the time it runs.
    async fn retry_open(&mut self) {
        if !matches!(self.state, LinkState::Errored) {
            return;
        }
        self.open_procedure(None).await;
    }

    /// No attach completion arrived before the open operation's timeout.
    async fn open_timeout_fire(&mut self) {
        let Some(tx) = self.open_completion.take() else {
            return;
        };
        let cause = self.last_error.clone().map(Box::new);
        let _ = tx.send(Err(Error::Timeout(cause)));
        self.fail_link(LinkError::transient("open operation timed out"))
            .await;
    }

    /// Requests a graceful close. If no link was ever open, completes
    /// immediately; otherwise requests a detach and waits for
    /// [`LinkStateMachine::on_close`] or the close timeout.
    async fn close_procedure(&mut self, completion: oneshot::Sender<Result<(), Error>>) {
        if matches!(self.state, LinkState::Closed) {
            let _ = completion.send(Ok(()));
            return;
        }

        cancel_timer(&mut self.retry_timer);
        cancel_timer(&mut self.operation_timer);
        cancel_timer(&mut self.open_timeout_handle);

        if let Some(tx) = self.open_completion.take() {
            let _ = tx.send(Err(Error::AlreadyClosed));
        }
        if let Some(tx) = self.close_completion.take() {
            let _ = tx.send(Err(Error::AlreadyClosed));
        }

        self.state = LinkState::Closing;
        self.update_snapshot();
        self.close_completion = Some(completion);
        // Graceful close discards any buffered batch and completes every
        // outstanding receive with an empty batch rather than an error (spec
        // §3, §8 scenario 6): a close is not itself a failure.
        self.drain_pending_with_null();
        self.token_manager = None;

        match self.link.take() {
            Some(link) => {
                self.close_timeout_handle = Some(
                    self.bridge()
                        .dispatch_after(self.config.operation_timeout, job_close_timeout()),
                );
                if let Err(cause) = link.close().await {
                    warn!("local detach request failed, finishing close locally: {cause}");
                    self.on_close(Some(cause)).await;
                }
                // Otherwise completion arrives asynchronously via `on_close`
                // once the peer acks the detach.
            }
            None => self.on_close(None).await,
        }
    }

    /// No detach ack arrived before the close operation's timeout. Forces
    /// the link closed locally rather than leaving the caller hanging.
    async fn close_timeout_fire(&mut self) {
        let Some(tx) = self.close_completion.take() else {
            return;
        };
        let cause = self.last_error.clone().map(Box::new);
        let _ = tx.send(Err(Error::Timeout(cause)));
        self.link = None;
        self.state = LinkState::Closed;
        self.update_snapshot();
    }

    /// The peer acked a detach, with or without an error condition.
    async fn on_close(&mut self, error_condition: Option<LinkError>) {
        cancel_timer(&mut self.close_timeout_handle);
        self.link = None;
        self.last_error = error_condition.clone();
        self.state = LinkState::Closed;
        self.update_snapshot();

        if let Some(tx) = self.close_completion.take() {
            let result = match error_condition {
                None => Ok(()),
                Some(cause) => Err(Error::Protocol(cause)),
            };
            let _ = tx.send(result);
        }

        self.drain_pending_with_error(Error::AlreadyClosed);
    }

    /// Matches buffered messages against outstanding receive requests in
    /// FIFO order, handing out partial batches rather than waiting to fill
    /// `max_batch` (spec §4.2: one buffered message is enough to satisfy a
    /// request). Stops as soon as the buffer runs dry, and reschedules the
    /// operation timer for whatever now sits at the front of the queue.
    async fn match_pending(&mut self) {
        while !self.prefetch_buffer.is_empty() {
            let Some(pending) = self.pending_queue.pop_front() else {
                break;
            };
            if pending.is_cancelled() {
                continue;
            }

            let batch = self.prefetch_buffer.drain_up_to(pending.max_batch());
            let delivered = batch.len();
            if let Some(last) = batch.last() {
                self.last_received_message = Some(last.clone());
            }
            pending.complete(Ok(batch));

            if let Some(link) = self.link.as_deref() {
                for _ in 0..delivered {
                    if let Err(cause) = self.credit.on_message_polled(link).await {
                        self.fail_link(cause).await;
                        return;
                    }
                }
            }
        }
        self.update_snapshot();
        self.reschedule_operation_timer();
    }

    /// The operation timer fired: completes every request at the front of
    /// the queue whose deadline has (within slop) expired, with an empty
    /// batch, per spec §7's "timeout is a success-path completion".
    async fn handle_operation_timer_fire(&mut self) {
        loop {
            let Some(deadline) = self.pending_queue.front_deadline() else {
                break;
            };
            if !deadline.is_within_slop() {
                break;
            }
            let Some(pending) = self.pending_queue.pop_front() else {
                break;
            };
            if pending.is_cancelled() {
                continue;
            }
            pending.complete(Ok(Vec::new()));
        }
        self.reschedule_operation_timer();
    }

    /// Re-arms the operation timer for whatever request now sits at the
    /// front of the pending queue, if any.
    fn reschedule_operation_timer(&mut self) {
        cancel_timer(&mut self.operation_timer);
        if let Some(deadline) = self.pending_queue.front_deadline() {
            self.operation_timer = Some(
                self.bridge()
                    .dispatch_after(deadline.remaining(), job_operation_timer_fire()),
            );
        }
    }

    /// Fails every currently queued receive request with `err`. Used on a
    /// permanent failure, and on an error that arrives while already
    /// closing/closed.
    fn drain_pending_with_error(&self, err: Error) {
        for pending in self.pending_queue.drain() {
            pending.complete(Err(err.clone()));
        }
    }

    /// Completes every currently queued receive request with an empty batch.
    /// Used on a graceful close and on a transient failure with no retry
    /// granted (spec §7: "drain with `null` on transient errors").
    fn drain_pending_with_null(&self) {
        for pending in self.pending_queue.drain() {
            pending.complete(Ok(Vec::new()));
        }
    }

    /// Applies a signed prefetch delta (spec §4.1). Flows credit immediately
    /// through the live link if one is open; otherwise just updates the
    /// bookkeeping so the next open issues the right catch-up flow.
    async fn apply_prefetch_delta(&mut self, delta: i64) {
        match self.link.as_deref() {
            Some(link) => {
                if let Err(cause) = self.credit.apply_prefetch_delta(link, delta).await {
                    self.fail_link(cause).await;
                    return;
                }
            }
            None => self.credit.bump_target_only(delta),
        }
        self.update_snapshot();
    }
}
