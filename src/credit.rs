//! Computes and batches AMQP credit top-ups.
//!
//! All mutation happens on the reactor thread; the controller itself has no
//! synchronization. [`crate::receiver::Receiver::set_prefetch`] applies its
//! delta through a reactor-dispatched job rather than touching
//! [`CreditController`] directly, per spec §9's note on `nextCreditToFlow`.

use crate::amqp::AmqpReceiverLink;

/// Batches credit top-ups so that the link doesn't emit a `flow` frame for
/// every single message handed out.
pub struct CreditController {
    /// The current prefetch target. Mirrors (but is independent of) the
    /// mutex-guarded copy on [`crate::receiver::Receiver`] — this is the
    /// reactor-thread's authoritative value, updated only via
    /// [`CreditController::apply_prefetch_delta`].
    prefetch_target: i64,
    /// Accumulated credit not yet flushed to the peer.
    next_credit_to_flow: i64,
}

impl CreditController {
    /// Creates a controller for the given initial prefetch target.
    pub fn new(prefetch_target: u32) -> Self {
        Self {
            prefetch_target: i64::from(prefetch_target),
            next_credit_to_flow: 0,
        }
    }

    /// The flush threshold: batch credit until it reaches this many, to keep
    /// wire chatter low. Per spec §4.3/§6: `min(prefetch_target, 100)`.
    fn flush_threshold(&self) -> i64 {
        self.prefetch_target.min(100).max(1)
    }

    /// Called by the matcher after handing one message out of the prefetch
    /// buffer to a caller. Adds 1 to the accumulator and flushes if the
    /// threshold is reached.
    pub async fn on_message_polled(&mut self, link: &dyn AmqpReceiverLink) -> Result<(), crate::error::LinkError> {
        self.next_credit_to_flow += 1;
        self.maybe_flush(link).await
    }

    /// Called on successful link (re)open. Resets the accumulator and issues
    /// an initial flow covering the gap between the prefetch target and
    /// however many messages are already buffered (e.g. left over from
    /// before a brief disconnect — though in practice the buffer is cleared
    /// on every error per spec §4.4, so this is usually just
    /// `prefetch_target`).
    pub async fn on_open_complete(
        &mut self,
        link: &dyn AmqpReceiverLink,
        prefetch_buffer_len: usize,
    ) -> Result<(), crate::error::LinkError> {
        self.next_credit_to_flow = 0;
        let initial = self.prefetch_target - i64::try_from(prefetch_buffer_len).unwrap_or(i64::MAX);
        if initial > 0 {
            link.flow(u32::try_from(initial).unwrap_or(u32::MAX)).await?;
        }
        Ok(())
    }

    /// Applies a signed delta to the prefetch target, as requested by
    /// [`crate::receiver::Receiver::set_prefetch`]. Negative deltas only
    /// suppress future top-ups; they never drive already-issued AMQP credit
    /// below zero (spec §4.1). Flushes immediately if the delta alone
    /// crosses the batching threshold, otherwise the adjustment simply
    /// waits in the accumulator for the next flush, same as any other
    /// credit addition.
    pub async fn apply_prefetch_delta(
        &mut self,
        link: &dyn AmqpReceiverLink,
        delta: i64,
    ) -> Result<(), crate::error::LinkError> {
        self.prefetch_target = (self.prefetch_target + delta).max(0);
        self.next_credit_to_flow = (self.next_credit_to_flow + delta).max(0);
        self.maybe_flush(link).await
    }

    /// Applies a signed delta to the prefetch target without touching the
    /// link, for use while no link is currently open (e.g. the receiver is
    /// mid-retry). The accumulated credit is adjusted the same way it would
    /// be with a live link; it simply can't flush until the link reopens, at
    /// which point [`CreditController::on_open_complete`] issues the catch-up
    /// flow.
    pub fn bump_target_only(&mut self, delta: i64) {
        self.prefetch_target = (self.prefetch_target + delta).max(0);
        self.next_credit_to_flow = (self.next_credit_to_flow + delta).max(0);
    }

    /// Current prefetch target, as tracked on the reactor thread.
    pub fn prefetch_target(&self) -> u32 {
        u32::try_from(self.prefetch_target).unwrap_or(0)
    }

    /// Current value of the accumulator, exposed for diagnostics and tests.
    pub fn next_credit_to_flow(&self) -> i64 {
        self.next_credit_to_flow
    }

    /// Flushes the accumulated credit to the link if it has reached the
    /// batching threshold.
    async fn maybe_flush(&mut self, link: &dyn AmqpReceiverLink) -> Result<(), crate::error::LinkError> {
        if self.next_credit_to_flow >= self.flush_threshold() {
            let credits = u32::try_from(self.next_credit_to_flow).unwrap_or(u32::MAX);
            link.flow(credits).await?;
            self.next_credit_to_flow = 0;
        }
        Ok(())
    }
}
