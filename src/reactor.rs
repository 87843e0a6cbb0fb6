//! Dispatches work onto the single reactor task and relays link callbacks
//! back onto it.
//!
//! Grounded on `kanin/src/app.rs`'s `conn.on_error` + `mpsc::channel(1)`
//! pattern for posting events from callback-land onto an async task, and
//! `kanin/src/app/task.rs`'s `tokio::select! { biased; ... }` loop for the
//! processing loop itself.

use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tracing::{trace, warn};

use crate::error::{Error, LinkError};
use crate::link_state::LinkStateMachine;
use crate::timer::{Timer, TimerHandle};

/// A unit of work run against the reactor-owned [`LinkStateMachine`].
///
/// Jobs are `FnOnce` closures producing a boxed future that borrows the
/// state mutably for the duration of the job; the reactor loop awaits each
/// job to completion before pulling the next one off the channel, which is
/// what gives every job exclusive access to link-adjacent state.
pub(crate) type Job = Box<dyn for<'a> FnOnce(&'a mut LinkStateMachine) -> BoxFuture<'a, ()> + Send>;

/// A handle to the single reactor task that owns a receiver's link state.
///
/// Cloning a [`ReactorBridge`] is cheap (it's just a channel sender) and
/// every clone dispatches onto the same underlying task.
#[derive(Clone)]
pub struct ReactorBridge {
    sender: mpsc::UnboundedSender<Job>,
}

impl ReactorBridge {
    /// Spawns the reactor loop owning `state`, returning a bridge that can
    /// dispatch jobs onto it. `state` is given a clone of the bridge before
    /// the loop starts, so job bodies can themselves schedule further jobs
    /// (retries, timers) without threading the bridge through every call.
    pub(crate) fn spawn(mut state: LinkStateMachine) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Job>();
        let bridge = Self { sender };
        state.attach_bridge(bridge.clone());

        tokio::spawn(async move {
            while let Some(job) = receiver.recv().await {
                job(&mut state).await;
            }
            trace!("reactor loop exiting: no more senders remain");
        });

        bridge
    }

    /// Enqueues `job` to run on the reactor task as soon as it's free.
    ///
    /// Fails with [`Error::SchedulerRejected`] if the reactor has already
    /// shut down (its receiving end was dropped).
    pub(crate) fn dispatch(&self, job: Job) -> Result<(), Error> {
        self.sender.send(job).map_err(|_| Error::SchedulerRejected)
    }

    /// Enqueues `job` to run on the reactor task after `delay` elapses.
    ///
    /// Returns a [`TimerHandle`] that cancels the delayed submission (not
    /// the job itself, which by then may already be running) if it hasn't
    /// fired yet.
    pub(crate) fn dispatch_after(&self, delay: Duration, job: Job) -> TimerHandle {
        let sender = self.sender.clone();
        Timer::schedule_once(delay, move || {
            if sender.send(job).is_err() {
                warn!("reactor rejected a delayed job submission: the reactor has shut down");
            }
        })
    }
}

/// The handler interface the surrounding AMQP engine invokes as link events
/// occur (spec §6, "Downstream (exposed)").
///
/// This is the production wiring point: a concrete [`crate::amqp::AmqpReceiverLink`]
/// implementation is expected to hold a clone of this sink and call the
/// appropriate method whenever the underlying transport reports an attach
/// completion, a delivery, an error, or a detach. Every method simply
/// dispatches the corresponding job onto the reactor, so the callback can be
/// invoked from any thread.
#[derive(Clone)]
pub struct LinkHandlerSink {
    bridge: ReactorBridge,
}

impl LinkHandlerSink {
    /// Wraps `bridge` as a handler sink.
    pub(crate) fn new(bridge: ReactorBridge) -> Self {
        Self { bridge }
    }

    /// The peer has acked (or failed) the link attach.
    pub fn on_open_complete(&self, err: Option<LinkError>) {
        if self
            .bridge
            .dispatch(crate::link_state::job_on_open_complete(err))
            .is_err()
        {
            warn!("dropped on_open_complete callback: reactor has shut down");
        }
    }

    /// A delivery has arrived and been settled.
    pub fn on_receive_complete(&self, message: crate::amqp::Message) {
        if self
            .bridge
            .dispatch(crate::link_state::job_on_receive_complete(message))
            .is_err()
        {
            warn!("dropped on_receive_complete callback: reactor has shut down");
        }
    }

    /// The link failed (peer detach with error, or a transport failure).
    pub fn on_error(&self, cause: LinkError) {
        if self
            .bridge
            .dispatch(crate::link_state::job_on_error(cause))
            .is_err()
        {
            warn!("dropped on_error callback: reactor has shut down");
        }
    }

    /// The peer has acked a detach.
    pub fn on_close(&self, error_condition: Option<LinkError>) {
        if self
            .bridge
            .dispatch(crate::link_state::job_on_close(error_condition))
            .is_err()
        {
            warn!("dropped on_close callback: reactor has shut down");
        }
    }
}
