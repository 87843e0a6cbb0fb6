//! Periodic auth-token refresh on the reactor thread.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::amqp::MessagingFactory;
use crate::error::LinkError;

/// Default interval between CBS token refreshes. Not load-bearing for
/// correctness, only for refresh cadence in production; embedders that need
/// a different cadence should construct [`TokenManager`] directly rather
/// than relying on this constant.
pub const TOKEN_REFRESH_INTERVAL: Duration = Duration::from_secs(20 * 60);

/// Default validity requested for each minted token.
pub const TOKEN_VALIDITY: Duration = Duration::from_secs(90 * 60);

/// Sends CBS tokens for a link's audience, once immediately (as part of the
/// open procedure, spec §4.4) and then periodically in the background.
pub struct TokenManager {
    factory: Arc<dyn MessagingFactory>,
    audience: String,
    refresh_interval: Duration,
    token_validity: Duration,
    shutdown: Option<broadcast::Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl TokenManager {
    /// Constructs a token manager for `audience`. Does not send any token or
    /// start the background refresh loop yet; call [`TokenManager::send_token`]
    /// and [`TokenManager::start_periodic_refresh`] explicitly.
    pub fn new(factory: Arc<dyn MessagingFactory>, audience: String) -> Self {
        Self {
            factory,
            audience,
            refresh_interval: TOKEN_REFRESH_INTERVAL,
            token_validity: TOKEN_VALIDITY,
            shutdown: None,
            join: None,
        }
    }

    /// Obtains a token for this manager's audience and sends it over the
    /// factory's CBS channel. Used both for the initial send that must
    /// precede session acquisition, and for each periodic refresh tick.
    pub async fn send_token(&self) -> Result<(), LinkError> {
        let token = self
            .factory
            .token_provider()
            .get_token(&self.audience, self.token_validity)
            .await?;
        self.factory.cbs_channel().send_token(&token, &self.audience).await
    }

    /// Starts the periodic background refresh loop, if not already running.
    /// Idempotent.
    pub fn start_periodic_refresh(&mut self) {
        if self.join.is_some() {
            return;
        }

        let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);
        let factory = self.factory.clone();
        let audience = self.audience.clone();
        let validity = self.token_validity;
        let interval = self.refresh_interval;

        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; the initial token send
            // already happened synchronously as part of the open procedure,
            // so we consume this first tick without acting on it.
            ticker.tick().await;

            loop {
                tokio::select! {
                    biased;

                    _ = shutdown_rx.recv() => {
                        info!("token manager for audience {audience:?} cancelled");
                        break;
                    }

                    _ = ticker.tick() => {
                        match factory.token_provider().get_token(&audience, validity).await {
                            Ok(token) => match factory.cbs_channel().send_token(&token, &audience).await {
                                Ok(()) => debug!("refreshed CBS token for audience {audience:?}"),
                                Err(e) => warn!("failed to send refreshed CBS token for audience {audience:?}: {e}"),
                            },
                            Err(e) => warn!("failed to obtain refreshed CBS token for audience {audience:?}: {e}"),
                        }
                    }
                }
            }
        });

        self.shutdown = Some(shutdown_tx);
        self.join = Some(join);
    }

    /// Cancels the background refresh loop, if running. Idempotent and
    /// synchronous: the background task is told to stop and its handle is
    /// aborted so this returns without waiting for the task to notice.
    pub fn cancel(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(join) = self.join.take() {
            join.abort();
        }
    }
}

impl Drop for TokenManager {
    fn drop(&mut self) {
        self.cancel();
    }
}
