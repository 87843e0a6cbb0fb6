//! Monotonic deadline bookkeeping for a single operation.

use std::time::{Duration, Instant};

/// The minimum slop, in milliseconds, below which a remaining deadline is
/// treated as "now" rather than rescheduling the operation timer for it.
///
/// See spec §4.2 and §6 ("Tunables"): `MIN_TIMEOUT_DURATION_MILLIS`.
pub const MIN_TIMEOUT_DURATION_MILLIS: u64 = 20;

/// Tracks the deadline of a single in-flight operation (an open, a close,
/// or a receive), computed once at construction and never mutated
/// afterwards, per spec §3's `PendingReceive` invariant ("deadline is fixed
/// at enqueue").
#[derive(Debug, Clone, Copy)]
pub struct TimeoutTracker {
    deadline: Instant,
}

impl TimeoutTracker {
    /// Starts tracking a deadline `timeout` from now.
    pub fn starting_now(timeout: Duration) -> Self {
        Self {
            deadline: Instant::now() + timeout,
        }
    }

    /// Returns the absolute deadline.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Returns the time remaining until the deadline, or `Duration::ZERO` if
    /// it has already passed.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// `true` if the remaining time is at or below [`MIN_TIMEOUT_DURATION_MILLIS`],
    /// i.e. close enough to the deadline that the matcher should treat the
    /// operation as expired rather than rescheduling for the remainder.
    pub fn is_within_slop(&self) -> bool {
        self.remaining() <= Duration::from_millis(MIN_TIMEOUT_DURATION_MILLIS)
    }
}
