//! The FIFO of outstanding receive requests with their own deadline.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::oneshot;

use crate::amqp::Message;
use crate::timeout_tracker::TimeoutTracker;

/// The result a [`PendingReceive`] is completed with.
///
/// A timeout is a *success* path completion (spec §5, §7): `None` means "no
/// messages arrived before the deadline", not an error.
pub type PendingOutcome = Result<Vec<Message>, crate::error::Error>;

/// A single outstanding `receive` call, created on a caller thread and
/// consumed by the reactor's matcher.
pub struct PendingReceive {
    sender: oneshot::Sender<PendingOutcome>,
    deadline: TimeoutTracker,
    max_batch: usize,
}

impl PendingReceive {
    /// Constructs a new pending receive with a deadline fixed at construction.
    pub fn new(
        sender: oneshot::Sender<PendingOutcome>,
        deadline: TimeoutTracker,
        max_batch: usize,
    ) -> Self {
        Self {
            sender,
            deadline,
            max_batch,
        }
    }

    /// The maximum number of messages this request will accept, fixed at
    /// construction per spec §3.
    pub fn max_batch(&self) -> usize {
        self.max_batch
    }

    /// The fixed deadline for this request.
    pub fn deadline(&self) -> TimeoutTracker {
        self.deadline
    }

    /// `true` if the caller side of the oneshot channel has already gone
    /// away (e.g. the caller's future was dropped/cancelled). Per spec §4.1,
    /// cancellation is advisory: the matcher still pops the request, it
    /// simply has nowhere to deliver the result.
    pub fn is_cancelled(&self) -> bool {
        self.sender.is_closed()
    }

    /// Completes this request exactly once with `outcome`.
    pub fn complete(self, outcome: PendingOutcome) {
        // Completion failing just means the caller's future was dropped; the
        // matcher already popped the request either way, so there's nothing
        // further to do.
        let _ = self.sender.send(outcome);
    }
}

/// Multi-producer (callers), single-consumer (reactor matcher) FIFO of
/// [`PendingReceive`]s.
///
/// Spec §5 calls for a lock-free FIFO; this crate realizes that contract
/// with a `std::sync::Mutex<VecDeque<_>>` instead (see DESIGN.md) since
/// enqueue only happens from `receive` calls and dequeue only from the
/// reactor's matcher — contention is never more than incidental.
#[derive(Default)]
pub struct PendingQueue {
    queue: Mutex<VecDeque<PendingReceive>>,
}

impl PendingQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues `pending` at the back of the queue. May be called from any
    /// thread.
    pub fn push(&self, pending: PendingReceive) {
        self.queue.lock().unwrap().push_back(pending);
    }

    /// Pops the request at the front of the queue, if any. Only the reactor
    /// matcher should call this.
    pub fn pop_front(&self) -> Option<PendingReceive> {
        self.queue.lock().unwrap().pop_front()
    }

    /// Peeks at the deadline of the request at the front of the queue,
    /// without removing it.
    pub fn front_deadline(&self) -> Option<TimeoutTracker> {
        self.queue.lock().unwrap().front().map(PendingReceive::deadline)
    }

    /// `true` if no requests are queued.
    pub fn is_empty(&self) -> bool {
        self.queue.lock().unwrap().is_empty()
    }

    /// Drains every queued request. Used when the link fails terminally or
    /// transiently without a retry, and on close.
    pub fn drain(&self) -> Vec<PendingReceive> {
        self.queue.lock().unwrap().drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn pending(max_batch: usize, timeout: Duration) -> (PendingReceive, oneshot::Receiver<PendingOutcome>) {
        let (tx, rx) = oneshot::channel();
        (
            PendingReceive::new(tx, TimeoutTracker::starting_now(timeout), max_batch),
            rx,
        )
    }

    #[test]
    fn pops_in_enqueue_order() {
        let queue = PendingQueue::new();
        let (p1, _r1) = pending(1, Duration::from_secs(1));
        let (p2, _r2) = pending(2, Duration::from_secs(1));
        queue.push(p1);
        queue.push(p2);

        assert_eq!(queue.pop_front().unwrap().max_batch(), 1);
        assert_eq!(queue.pop_front().unwrap().max_batch(), 2);
        assert!(queue.pop_front().is_none());
    }

    #[tokio::test]
    async fn complete_delivers_outcome_to_caller() {
        let (p, rx) = pending(5, Duration::from_secs(1));
        p.complete(Ok(vec![]));
        let outcome = rx.await.unwrap();
        assert_eq!(outcome.unwrap().len(), 0);
    }

    #[test]
    fn is_cancelled_reflects_dropped_receiver() {
        let (p, rx) = pending(1, Duration::from_secs(1));
        drop(rx);
        assert!(p.is_cancelled());
    }
}
