//! Holds [`ReceiverConfig`]'s implementation.

use std::sync::Arc;
use std::time::Duration;

use crate::amqp::ReceiverSettingsProvider;
use crate::error::Error;

/// A hook invoked right before a recreate-on-retry is scheduled.
///
/// This is a test seam (spec §9, "Injectable test hook `onOpenRetry`") and
/// defaults to a no-op. It is not a process-global: it lives on the
/// receiver's configuration so that multiple receivers in the same process
/// can be instrumented independently.
pub type OnOpenRetryHook = Arc<dyn Fn() + Send + Sync>;

/// Configuration for a single AMQP 1.0 receiver link, immutable after
/// construction (the mutable parts, prefetch and receive-timeout, live on
/// [`crate::Receiver`] itself, guarded by their own mutexes).
#[derive(Clone)]
pub struct ReceiverConfig {
    /// AMQP host name, surfaced in error contexts.
    pub(crate) host: String,
    /// The entity path (e.g. event hub / queue name) this link reads from.
    pub(crate) entity_path: String,
    /// The link's name, used to identify it to the peer and in logs.
    pub(crate) link_name: String,
    /// Prefetch target: how many messages the receiver tries to keep
    /// buffered ahead of caller demand.
    pub(crate) prefetch: u32,
    /// Timeout applied to the open and close lifecycle futures.
    pub(crate) operation_timeout: Duration,
    /// Audience used when requesting CBS tokens for this link.
    pub(crate) token_audience: String,
    /// Supplies the filter/properties/capabilities used on (re)attach.
    pub(crate) settings_provider: Arc<dyn ReceiverSettingsProvider>,
    /// Test seam invoked before a recreate-on-retry; defaults to no-op.
    pub(crate) on_open_retry: OnOpenRetryHook,
}

impl ReceiverConfig {
    /// The default value for the prefetch target.
    pub const DEFAULT_PREFETCH: u32 = 500;

    /// Starts building a [`ReceiverConfig`] for the given host, entity path
    /// and link name, using `settings_provider` for (re)attach settings.
    pub fn new(
        host: impl Into<String>,
        entity_path: impl Into<String>,
        link_name: impl Into<String>,
        token_audience: impl Into<String>,
        settings_provider: Arc<dyn ReceiverSettingsProvider>,
    ) -> Self {
        Self {
            host: host.into(),
            entity_path: entity_path.into(),
            link_name: link_name.into(),
            prefetch: Self::DEFAULT_PREFETCH,
            operation_timeout: Duration::from_secs(60),
            token_audience: token_audience.into(),
            settings_provider,
            on_open_retry: Arc::new(|| {}),
        }
    }

    /// Overrides the prefetch target. Must be positive; validated at
    /// [`crate::Receiver::create`] time, not here, since a builder method
    /// can't synchronously fail without breaking the chain.
    #[must_use]
    pub fn with_prefetch(mut self, prefetch: u32) -> Self {
        self.prefetch = prefetch;
        self
    }

    /// Overrides the operation timeout applied to open/close/receive.
    #[must_use]
    pub fn with_operation_timeout(mut self, operation_timeout: Duration) -> Self {
        self.operation_timeout = operation_timeout;
        self
    }

    /// Installs a test hook invoked just before a recreate-on-retry is
    /// scheduled. See [`OnOpenRetryHook`].
    #[must_use]
    pub fn with_on_open_retry(mut self, hook: OnOpenRetryHook) -> Self {
        self.on_open_retry = hook;
        self
    }

    /// Validates the configuration, returning an [`Error::InvalidArgument`]
    /// if `prefetch` or `operation_timeout` are non-positive.
    ///
    /// Resolves the open question in spec §9: neither the source's
    /// unchecked `null`/zero `receiveTimeout` nor a zero prefetch target are
    /// accepted here.
    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.prefetch == 0 {
            return Err(Error::InvalidArgument(
                "prefetch target must be positive".to_string(),
            ));
        }
        if self.operation_timeout.is_zero() {
            return Err(Error::InvalidArgument(
                "operation_timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
