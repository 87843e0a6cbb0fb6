//! One-shot and periodic timers, driven on their own tokio tasks.
//!
//! Per spec §5, callbacks fired from a timer "must either be short and
//! thread-safe or re-dispatch to the reactor" — in practice every timer in
//! this crate is constructed with a callback that only pushes a job onto the
//! [`crate::reactor::ReactorBridge`], never touching reactor-owned state
//! directly.

use std::time::Duration;

use tokio::task::JoinHandle;

/// A handle to a scheduled timer. Dropping the handle does *not* cancel the
/// timer (that would make it easy to accidentally lose a timeout); call
/// [`TimerHandle::cancel`] explicitly.
#[must_use = "dropping a TimerHandle does not cancel the timer, call .cancel() explicitly"]
pub struct TimerHandle {
    join: JoinHandle<()>,
}

impl TimerHandle {
    /// Cancels the timer. If it already fired, this is a no-op. Idempotent.
    pub fn cancel(&self) {
        self.join.abort();
    }

    /// `true` if the timer has already fired or been cancelled.
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

/// Schedules one-shot and periodic callbacks on dedicated tokio tasks.
pub struct Timer;

impl Timer {
    /// Schedules `callback` to run once, after `delay` elapses.
    pub fn schedule_once<F>(delay: Duration, callback: F) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let join = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            callback();
        });
        TimerHandle { join }
    }

    /// Schedules `callback` to run every `interval`, starting after the
    /// first `interval` elapses. Used by [`crate::token_manager::TokenManager`]
    /// for periodic token refresh. Stops when the returned handle is
    /// cancelled.
    pub fn schedule_periodic<F>(interval: Duration, mut callback: F) -> TimerHandle
    where
        F: FnMut() + Send + 'static,
    {
        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; skip it so the first callback
            // happens after one full interval, matching a "periodic refresh"
            // rather than an "also refresh right now" semantics.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                callback();
            }
        });
        TimerHandle { join }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn schedule_once_fires_after_delay() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        let _handle = Timer::schedule_once(Duration::from_millis(10), move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancel_before_fire_prevents_callback() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        let handle = Timer::schedule_once(Duration::from_millis(50), move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });
        handle.cancel();

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
