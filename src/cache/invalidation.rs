//! Invalidation subscriber.
//!
//! Listens on `<invalidation-prefix>*` and applies each invalidation to the
//! shared store. Removal is idempotent, so a replica receiving its own
//! broadcast, or a duplicate, is harmless.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{CacheKeys, CacheMetrics};
use crate::error::Result;
use crate::store::{
    take_reply, with_timeout, CoordinationStore, Notification, StoreResult, Subscription,
    Transaction,
};

/// Pause before re-subscribing after the store closed the subscription.
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

pub(crate) struct InvalidationSubscriber<S: CoordinationStore> {
    store: Arc<S>,
    keys: CacheKeys,
    metrics: Arc<CacheMetrics>,
    listeners: broadcast::Sender<String>,
    op_timeout: Duration,
}

impl<S: CoordinationStore> InvalidationSubscriber<S> {
    pub(crate) fn new(
        store: Arc<S>,
        keys: CacheKeys,
        metrics: Arc<CacheMetrics>,
        listeners: broadcast::Sender<String>,
        op_timeout: Duration,
    ) -> Self {
        Self {
            store,
            keys,
            metrics,
            listeners,
            op_timeout,
        }
    }

    /// Subscribes before returning, so an invalidation published after
    /// `spawn` resolves is never missed.
    pub(crate) async fn spawn(self, shutdown: CancellationToken) -> Result<JoinHandle<()>> {
        let subscription = self.subscribe().await?;
        info!(pattern = %self.keys.channel_pattern(), "subscribed to invalidations");
        Ok(tokio::spawn(self.run(subscription, shutdown)))
    }

    async fn subscribe(&self) -> StoreResult<Subscription> {
        let pattern = self.keys.channel_pattern();
        with_timeout(self.op_timeout, self.store.psubscribe(&pattern)).await
    }

    async fn run(self, mut subscription: Subscription, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                message = subscription.recv() => match message {
                    Some(notification) => self.apply(notification).await,
                    None => {
                        warn!("invalidation subscription closed, resubscribing");
                        match self.resubscribe(&shutdown).await {
                            Some(fresh) => subscription = fresh,
                            None => break,
                        }
                    }
                },
            }
        }
        debug!("invalidation subscriber stopped");
    }

    async fn resubscribe(&self, shutdown: &CancellationToken) -> Option<Subscription> {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return None,
                _ = tokio::time::sleep(RESUBSCRIBE_DELAY) => {}
            }
            match self.subscribe().await {
                Ok(subscription) => {
                    info!("invalidation subscription restored");
                    return Some(subscription);
                }
                Err(err) => warn!(error = %err, "resubscribe failed"),
            }
        }
    }

    async fn apply(&self, notification: Notification) {
        let Some(id) = self.keys.id_from_channel(&notification.channel) else {
            debug!(channel = %notification.channel, "ignoring notification outside namespace");
            return;
        };

        let tx = Transaction::new()
            .del(self.keys.payload_key(id))
            .zrem(self.keys.order_key(), id);
        match with_timeout(self.op_timeout, self.store.exec(tx)).await {
            Ok(mut replies) => {
                let unindexed = take_reply(&mut replies, 1)
                    .and_then(|reply| reply.as_int())
                    .unwrap_or(0);
                if unindexed > 0 {
                    self.metrics.reduce_size(1);
                }
                debug!(id, "applied invalidation");
            }
            Err(err) => {
                self.metrics.record_error();
                warn!(id, error = %err, "failed to apply invalidation");
            }
        }

        self.metrics.record_invalidation();
        // no receivers is fine
        let _ = self.listeners.send(id.to_string());
    }
}
