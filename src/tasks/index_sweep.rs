//! Stale Index Sweep Task
//!
//! Payload keys expire on their own in the store, but their order index
//! entries do not. This task periodically removes those leftovers so the
//! index cardinality tracks live entries.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::BoundedCache;
use crate::store::CoordinationStore;

/// Spawns the sweep loop. The first sweep runs one `interval` after start.
///
/// # Example
/// ```ignore
/// let shutdown = CancellationToken::new();
/// let handle = spawn_index_sweep_task(cache.clone(), Duration::from_secs(300), shutdown.clone());
/// // Later, during shutdown:
/// shutdown.cancel();
/// handle.await?;
/// ```
pub fn spawn_index_sweep_task<S: CoordinationStore>(
    cache: Arc<BoundedCache<S>>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            interval_secs = interval.as_secs(),
            "starting stale index sweep task"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            match cache.sweep_stale_index().await {
                Ok(0) => debug!("index sweep: no stale entries found"),
                Ok(removed) => info!(removed, "index sweep: removed stale entries"),
                Err(err) => warn!(error = %err, "index sweep failed"),
            }
        }

        debug!("stale index sweep task stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::store::MemoryStore;

    async fn cache() -> Arc<BoundedCache<MemoryStore>> {
        Arc::new(
            BoundedCache::start(Arc::new(MemoryStore::new()), CacheConfig::default())
                .await
                .unwrap(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_task_removes_expired_entries() {
        let cache = cache().await;
        cache
            .set("expire_soon", b"value", Duration::from_secs(1))
            .await
            .unwrap();
        cache
            .set("long_lived", b"value", Duration::from_secs(3600))
            .await
            .unwrap();

        let shutdown = CancellationToken::new();
        let handle = spawn_index_sweep_task(cache.clone(), Duration::from_secs(2), shutdown.clone());

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(cache.order().await.unwrap(), vec!["long_lived"]);

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_sweep_task_stops_on_cancel() {
        let shutdown = CancellationToken::new();
        let handle = spawn_index_sweep_task(cache().await, Duration::from_secs(3600), shutdown.clone());

        shutdown.cancel();
        handle.await.unwrap();
    }
}
