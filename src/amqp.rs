//! Interfaces for the external collaborators this crate consumes.
//!
//! None of these traits describe wire-level AMQP 1.0 framing: that work
//! belongs to the surrounding reactor/transport implementation. What's here
//! is the seam the receiver core dispatches through, so that the core can be
//! exercised with fakes in tests and swapped onto a real engine in
//! production without the core knowing the difference.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{LinkError, TrackingId};
use crate::reactor::LinkHandlerSink;

/// A decoded AMQP message handed to the receiver by the reactor.
///
/// The core never inspects the body; it only moves messages between the
/// prefetch buffer and caller-supplied batches.
#[derive(Debug, Clone)]
pub struct Message {
    /// Raw message body, already decoded from the wire by the reactor.
    pub body: Vec<u8>,
    /// Application properties carried on the message, if any.
    pub application_properties: BTreeMap<String, String>,
}

/// A filter map as attached to a receiver link's source, keyed by filter
/// name (e.g. `"apache.org:selector-filter:string"`).
pub type FilterMap = BTreeMap<String, String>;

/// A properties map attached to a link's attach frame.
pub type PropertiesMap = BTreeMap<String, String>;

/// Sender/receiver settle mode negotiated on link attach.
///
/// Spec mandates `sender-settle-mode = unsettled` and
/// `receiver-settle-mode = second` for every receiver link this crate opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderSettleMode {
    /// The sender will send all deliveries unsettled.
    Unsettled,
}

/// See [`SenderSettleMode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverSettleMode {
    /// Settlement happens in a second disposition round-trip ("second" mode).
    Second,
}

/// Options used to construct a receiver link's attach frame.
#[derive(Debug, Clone)]
pub struct ReceiverLinkOptions {
    /// Filter map, usually derived from [`ReceiverSettingsProvider::get_filter`].
    pub filter: Option<FilterMap>,
    /// Link properties, from [`ReceiverSettingsProvider::get_properties`].
    pub properties: Option<PropertiesMap>,
    /// Desired capabilities, from [`ReceiverSettingsProvider::get_desired_capabilities`].
    pub desired_capabilities: Option<Vec<String>>,
    /// Always [`SenderSettleMode::Unsettled`] for this crate; kept as a field
    /// rather than hardcoded at the call site so fakes can assert on it.
    pub sender_settle_mode: SenderSettleMode,
    /// Always [`ReceiverSettleMode::Second`] for this crate.
    pub receiver_settle_mode: ReceiverSettleMode,
}

/// Provides the per-link settings (filter, properties, capabilities) used
/// when constructing or recreating a receiver link.
///
/// Implementations typically derive the filter from `last_received_message`
/// to resume from an offset after a recreate.
pub trait ReceiverSettingsProvider: Send + Sync {
    /// Computes the filter map for a (re)attach, given the last message this
    /// receiver successfully handed to a caller, if any.
    fn get_filter(&self, last_received_message: Option<&Message>) -> Option<FilterMap>;

    /// Computes the link properties for a (re)attach.
    fn get_properties(&self) -> Option<PropertiesMap>;

    /// Computes the desired capabilities for a (re)attach.
    fn get_desired_capabilities(&self) -> Option<Vec<String>>;
}

/// A single AMQP 1.0 receiver link, as seen by the core.
///
/// The reactor is expected to invoke the four handler methods on
/// [`crate::link_state::LinkStateMachine`] (`on_open_complete`,
/// `on_receive_complete`, `on_error`, `on_close`) as the underlying engine
/// reports attach completion, deliveries, errors and detaches; this trait
/// only covers the operations the core *calls outward*.
#[async_trait]
pub trait AmqpReceiverLink: Send + Sync {
    /// Requests the peer to open (attach) the link with the given options.
    async fn open(&self, options: ReceiverLinkOptions) -> Result<(), LinkError>;

    /// Issues an AMQP `flow` frame granting `credits` additional messages.
    async fn flow(&self, credits: u32) -> Result<(), LinkError>;

    /// Returns the link's current outstanding credit, as last flowed.
    fn credit(&self) -> u32;

    /// Requests a graceful local detach. Does not wait for the peer's ack;
    /// completion is reported asynchronously via `on_close`.
    async fn close(&self) -> Result<(), LinkError>;

    /// `true` once the local endpoint has sent (or received) a detach.
    fn local_closed(&self) -> bool;

    /// `true` once the remote endpoint has sent a detach.
    fn remote_closed(&self) -> bool;

    /// Opaque tracking id the peer supplied in its remote link properties,
    /// available only after a successful open.
    fn remote_tracking_id(&self) -> Option<TrackingId>;
}

/// An AMQP session, able to mint receiver links.
#[async_trait]
pub trait AmqpSession: Send + Sync {
    /// Creates (but does not open) a receiver link with the given name,
    /// bound to the given entity path.
    ///
    /// `handler` is this receiver's callback sink: the returned link is
    /// expected to hold onto it and invoke the matching method
    /// (`on_open_complete`, `on_receive_complete`, `on_error`, `on_close`) as
    /// the underlying engine reports each event, from whatever thread the
    /// engine's own I/O runs on.
    async fn create_receiver_link(
        &self,
        link_name: &str,
        entity_path: &str,
        handler: LinkHandlerSink,
    ) -> Result<Box<dyn AmqpReceiverLink>, LinkError>;
}

/// The retry policy consulted whenever the link errors.
///
/// Mirrors spec §4.4/§7: consulted with `(client_id, cause, head pending
/// deadline remaining, or zero if there is no pending request)`.
pub trait RetryPolicy: Send + Sync {
    /// Returns `Some(delay)` if a retry should be scheduled after `delay`,
    /// or `None` if the cause is permanent or no retry budget remains.
    fn retry_after(
        &self,
        client_id: &str,
        cause: &LinkError,
        head_pending_deadline_remaining: Duration,
    ) -> Option<Duration>;
}

/// The claims-based-security channel used to send auth tokens prior to
/// opening application links.
#[async_trait]
pub trait CbsChannel: Send + Sync {
    /// Sends `token` for `audience` over the CBS channel.
    async fn send_token(&self, token: &str, audience: &str) -> Result<(), LinkError>;
}

/// Supplies auth tokens for a given audience.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Obtains a token valid for at least `validity` for `audience`.
    async fn get_token(&self, audience: &str, validity: Duration) -> Result<String, LinkError>;
}

/// The surrounding factory this receiver is built from.
///
/// Modeled as a non-owning handle (an `Arc` the embedder controls the
/// lifetime of) per spec §9's note on avoiding an ownership cycle between a
/// receiver and its factory.
#[async_trait]
pub trait MessagingFactory: Send + Sync {
    /// Default operation timeout new receivers should use unless overridden.
    fn operation_timeout(&self) -> Duration;

    /// The AMQP host name, used in error contexts.
    fn host_name(&self) -> &str;

    /// An identifier for the owning client, passed to the retry policy.
    fn client_id(&self) -> &str;

    /// Opens (or reuses) a session for `entity_path`.
    async fn get_session(&self, entity_path: &str) -> Result<Box<dyn AmqpSession>, LinkError>;

    /// The retry policy shared by every link the factory produces.
    fn retry_policy(&self) -> &dyn RetryPolicy;

    /// The CBS channel used to authenticate links before they attach.
    fn cbs_channel(&self) -> &dyn CbsChannel;

    /// The token provider used to mint CBS tokens.
    fn token_provider(&self) -> &dyn TokenProvider;
}
