//! Crate-wide error types.

use derive_more::{Deref, Display as DeriveDisplay};
use thiserror::Error as ThisError;

/// An opaque tracking id, either supplied by a peer in its remote link
/// properties or generated locally for correlation in logs.
#[derive(Debug, Clone, PartialEq, Eq, Deref, DeriveDisplay)]
pub struct TrackingId(String);

impl TrackingId {
    /// Wraps a raw id string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

/// Errors returned by the public [`crate::Receiver`] API.
#[derive(Debug, Clone, ThisError)]
pub enum Error {
    /// A caller passed an argument outside its valid range (e.g. `max_batch == 0`,
    /// a non-positive timeout, or `max_batch` greater than the prefetch target).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An open or close lifecycle future did not complete before its timeout
    /// fired. Carries the last known link error, if any, as its cause (spec
    /// §8 scenario 5: "the open future fails with a timeout error whose
    /// cause is the last known link error").
    #[error("operation timed out")]
    Timeout(Option<Box<LinkError>>),

    /// The link failed with a non-transient protocol error.
    #[error("link failed: {0}")]
    Protocol(#[from] LinkError),

    /// The receiver was already closed (or closing) when the call was made.
    #[error("receiver is already closed")]
    AlreadyClosed,

    /// The reactor rejected a job submission because it has shut down.
    #[error("reactor rejected the submitted job")]
    SchedulerRejected,
}

/// A protocol-level error surfaced by the underlying AMQP engine.
///
/// Carries the peer-supplied diagnostic message plus whether the retry policy
/// should be given a chance to recover the link.
#[derive(Debug, Clone, ThisError)]
#[error("{message}")]
pub struct LinkError {
    /// Human-readable description of the cause, usually copied from the peer's
    /// `error` performative or from a local transport failure.
    pub message: String,
    /// `true` if this cause is worth retrying (e.g. a transient detach); `false`
    /// if the link should be torn down permanently.
    pub transient: bool,
    /// Opaque tracking id supplied by the peer in remote link properties, if any.
    pub tracking_id: Option<TrackingId>,
}

impl LinkError {
    /// Constructs a new transient [`LinkError`].
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: true,
            tracking_id: None,
        }
    }

    /// Constructs a new non-transient [`LinkError`].
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: false,
            tracking_id: None,
        }
    }

    /// Attaches a tracking id to this error, returning the updated value.
    #[must_use]
    pub fn with_tracking_id(mut self, tracking_id: impl Into<String>) -> Self {
        self.tracking_id = Some(TrackingId::new(tracking_id));
        self
    }
}
