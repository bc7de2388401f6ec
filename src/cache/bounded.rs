//! Bounded Cache Module
//!
//! FIFO-bounded cache whose entries, order index and invalidation traffic all
//! live in the shared store. Replicas hold no entry state of their own; the
//! only per-replica pieces are the metrics and the invalidation subscriber.
//!
//! # Write path
//! 1. `WATCH` the payload key and read it. In one transaction `SET` the
//!    payload with TTL, index the identifier with a fresh monotonic score and
//!    `ZCARD` the index. A live payload keeps its score (`ZADD NX`); an absent
//!    or expired one is indexed anew (plain `ZADD`), so it lines up behind
//!    everything already cached.
//! 2. If the cardinality is above the bound, read the lowest-score identifier
//!    and remove its payload and index entry in a second transaction.
//!
//! One eviction per write: concurrent writers may overshoot briefly, and the
//! overshoot drains on the following writes.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::entry::{validate_id, validate_payload};
use crate::cache::invalidation::InvalidationSubscriber;
use crate::cache::{
    CacheEntry, CacheKeys, CacheMetrics, CacheStats, MonotonicClock, Operation,
    INVALIDATE_PAYLOAD,
};
use crate::config::CacheConfig;
use crate::error::{CoordError, Result};
use crate::store::{
    take_reply, with_timeout, CoordinationStore, Reply, StoreResult, Transaction,
};

/// Buffered invalidations per in-process listener.
const LISTENER_BUFFER: usize = 256;

/// Victim picks per write when concurrent writers race for the same one.
const EVICTION_ATTEMPTS: u32 = 3;

/// Watched write attempts before the payload is assumed live.
const WRITE_ATTEMPTS: u32 = 3;

// == Bounded Cache ==
/// Store-backed cache with a global FIFO bound.
///
/// Construct with [`BoundedCache::start`], which also starts the invalidation
/// subscriber; stop it with [`BoundedCache::shutdown`]. Dropping the cache
/// cancels the subscriber as well.
///
/// Every store call is bounded by `CacheConfig::op_timeout`. For a tighter
/// per-call budget wrap the call in `tokio::time::timeout`; dropping the
/// future cancels the pending store call.
pub struct BoundedCache<S: CoordinationStore> {
    store: Arc<S>,
    config: CacheConfig,
    keys: CacheKeys,
    metrics: Arc<CacheMetrics>,
    clock: &'static MonotonicClock,
    listeners: broadcast::Sender<String>,
    shutdown: CancellationToken,
    subscriber: Mutex<Option<JoinHandle<()>>>,
}

impl<S: CoordinationStore> std::fmt::Debug for BoundedCache<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedCache")
            .field("config", &self.config)
            .field("stopped", &self.shutdown.is_cancelled())
            .finish()
    }
}

impl<S: CoordinationStore> BoundedCache<S> {
    // == Constructor ==
    /// Subscribes to the namespace's invalidation channels and returns the
    /// running cache.
    pub async fn start(store: Arc<S>, config: CacheConfig) -> Result<Self> {
        let keys = CacheKeys::new(&config);
        let metrics = Arc::new(CacheMetrics::new());
        let (listeners, _) = broadcast::channel(LISTENER_BUFFER);
        let shutdown = CancellationToken::new();

        let subscriber = InvalidationSubscriber::new(
            store.clone(),
            keys.clone(),
            metrics.clone(),
            listeners.clone(),
            config.op_timeout,
        );
        let handle = subscriber.spawn(shutdown.clone()).await?;

        info!(
            max_entries = config.max_entries,
            default_ttl_secs = config.default_ttl.as_secs(),
            order_key = %config.order_key,
            "bounded cache started"
        );

        Ok(Self {
            store,
            config,
            keys,
            metrics,
            clock: MonotonicClock::process(),
            listeners,
            shutdown,
            subscriber: Mutex::new(Some(handle)),
        })
    }

    /// Stops the invalidation subscriber and waits for it to exit.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handle = self.subscriber.lock().take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                warn!(error = %err, "invalidation subscriber ended abnormally");
            }
            info!("bounded cache stopped");
        }
    }

    async fn call<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = StoreResult<T>>,
    {
        with_timeout(self.config.op_timeout, fut)
            .await
            .map_err(CoordError::from)
    }

    fn effective_ttl(&self, ttl: Duration) -> Duration {
        if ttl.is_zero() {
            self.config.default_ttl
        } else {
            ttl
        }
    }

    fn check_id(&self, id: &str) -> Result<()> {
        validate_id(id)?;
        if self.keys.collides_with_index(id) {
            return Err(CoordError::InvalidRequest(format!(
                "Identifier '{}' collides with the order index key",
                id
            )));
        }
        Ok(())
    }

    // == Get ==
    /// Looks up a payload. A miss is `Ok(None)`; a store failure is
    /// `Err(StoreUnavailable)` and callers should treat it as a miss.
    pub async fn get(&self, id: &str) -> Result<Option<Vec<u8>>> {
        self.check_id(id)?;
        let key = self.keys.payload_key(id);
        let started = Instant::now();
        let result = self.call(self.store.get(&key)).await;
        self.metrics.record_latency(Operation::Get, started.elapsed());

        match result {
            Ok(Some(payload)) => {
                self.metrics.record_hit();
                debug!(id, latency_us = started.elapsed().as_micros() as u64, "cache hit");
                Ok(Some(payload))
            }
            Ok(None) => {
                let streak = self.metrics.record_miss();
                debug!(id, consecutive_misses = streak, "cache miss");
                Ok(None)
            }
            Err(err) => {
                self.metrics.record_failed_request();
                warn!(id, error = %err, "cache lookup failed");
                Err(err)
            }
        }
    }

    /// Looks up and decodes a JSON payload.
    pub async fn get_json<T: DeserializeOwned>(&self, id: &str) -> Result<Option<T>> {
        let Some(payload) = self.get(id).await? else {
            return Ok(None);
        };
        serde_json::from_slice(&payload).map(Some).map_err(|err| {
            self.metrics.record_error();
            warn!(id, error = %err, "cached payload failed to decode");
            CoordError::from(err)
        })
    }

    // == Set ==
    /// Stores `payload` under `id`. A zero `ttl` uses the configured default.
    ///
    /// Replacing a live identifier keeps its FIFO position. One whose payload
    /// already expired is a new entry and goes to the back.
    pub async fn set(&self, id: &str, payload: &[u8], ttl: Duration) -> Result<()> {
        self.check_id(id)?;
        validate_payload(payload)?;

        let started = Instant::now();
        let result = self.insert(id, payload, ttl).await;
        self.metrics.record_latency(Operation::Set, started.elapsed());
        if let Err(err) = &result {
            self.metrics.record_error();
            warn!(id, error = %err, "cache write failed");
        }
        result
    }

    /// Encodes `value` as JSON and stores it.
    pub async fn set_json<T: Serialize>(&self, id: &str, value: &T, ttl: Duration) -> Result<()> {
        let payload = serde_json::to_vec(value).map_err(|err| {
            self.metrics.record_error();
            CoordError::from(err)
        })?;
        self.set(id, &payload, ttl).await
    }

    async fn insert(&self, id: &str, payload: &[u8], ttl: Duration) -> Result<()> {
        let ttl = self.effective_ttl(ttl);
        let order_key = self.keys.order_key();
        let payload_key = self.keys.payload_key(id);

        let mut replies = self
            .write_watched(std::slice::from_ref(&payload_key), |live| {
                let live = live.first().copied().unwrap_or(true);
                self.queue_write(Transaction::new(), id, payload.to_vec(), ttl, live)
                    .zcard(order_key)
            })
            .await?;
        let count = take_reply(&mut replies, 2)?.as_int()?.max(0) as u64;
        self.metrics.set_size(count);
        debug!(id, ttl_secs = ttl.as_secs(), size = count, "cache entry written");

        if count > self.config.max_entries {
            debug!(
                size = count,
                max = self.config.max_entries,
                "cache over capacity, evicting oldest entry"
            );
            self.evict_one().await?;
        }
        Ok(())
    }

    /// Queues the payload write and the index update for one entry.
    fn queue_write(
        &self,
        tx: Transaction,
        id: &str,
        payload: Vec<u8>,
        ttl: Duration,
        live: bool,
    ) -> Transaction {
        let order_key = self.keys.order_key();
        let score = self.clock.next_score();
        let tx = tx.set(self.keys.payload_key(id), payload, ttl);
        if live {
            tx.zadd_nx(order_key, id, score)
        } else {
            tx.zadd(order_key, id, score)
        }
    }

    /// Runs the transaction `build` makes from the liveness of each payload
    /// key, under a watch on those keys.
    async fn write_watched<F>(&self, payload_keys: &[String], build: F) -> Result<Vec<Reply>>
    where
        F: Fn(&[bool]) -> Transaction,
    {
        for attempt in 1..=WRITE_ATTEMPTS {
            let session = self.call(self.store.watch_all(payload_keys)).await?;
            let live: Vec<bool> = session.values().iter().map(Option::is_some).collect();
            if let Some(replies) = self.call(session.exec(build(&live))).await? {
                return Ok(replies);
            }
            debug!(attempt, keys = payload_keys.len(), "payload changed during write, retrying");
        }
        // only concurrent writers keep breaking the watch, so the payloads
        // are live and keep their positions
        let live = vec![true; payload_keys.len()];
        self.call(self.store.exec(build(&live))).await
    }

    /// Evicts the lowest-score identifier. When a concurrent writer removed
    /// the same victim first, the cardinality is re-read and, if still over
    /// the bound, the next one is taken.
    async fn evict_one(&self) -> Result<u64> {
        for _ in 0..EVICTION_ATTEMPTS {
            let removed = self.evict_oldest(1).await?;
            if removed > 0 {
                return Ok(removed);
            }
            let count = self.call(self.store.zcard(self.keys.order_key())).await?;
            self.metrics.set_size(count);
            if count <= self.config.max_entries {
                return Ok(0);
            }
            debug!(size = count, "lost eviction race, picking next victim");
        }
        Ok(0)
    }

    /// Removes the `n` lowest-score identifiers. Returns how many index
    /// entries this call actually removed.
    async fn evict_oldest(&self, n: u64) -> Result<u64> {
        if n == 0 {
            return Ok(0);
        }
        let stop = isize::try_from(n - 1).unwrap_or(isize::MAX);
        let victims = self
            .call(self.store.zrange(self.keys.order_key(), 0, stop))
            .await?;
        if victims.is_empty() {
            return Ok(0);
        }
        self.remove_indexed(&victims).await
    }

    /// Deletes payloads and index entries for `ids` in one transaction.
    async fn remove_indexed(&self, ids: &[String]) -> Result<u64> {
        let order_key = self.keys.order_key();
        let tx = ids.iter().fold(Transaction::new(), |tx, id| {
            tx.del(self.keys.payload_key(id)).zrem(order_key, id.as_str())
        });
        let mut replies = self.call(self.store.exec(tx)).await?;

        let mut removed = 0;
        for (i, id) in ids.iter().enumerate() {
            let payload_deleted = take_reply(&mut replies, 2 * i)?.as_int()? > 0;
            let unindexed = take_reply(&mut replies, 2 * i + 1)?.as_int()? > 0;
            if !unindexed {
                // another replica evicted it first
                continue;
            }
            removed += 1;
            if payload_deleted {
                info!(id = %id, "evicted cache entry");
            } else {
                debug!(id = %id, "dropped stale index entry for expired payload");
            }
        }

        self.metrics.record_evictions(removed);
        self.metrics.reduce_size(removed);
        Ok(removed)
    }

    // == Delete ==
    /// Removes `id` and broadcasts an invalidation for it. Returns whether a
    /// payload was present.
    ///
    /// The broadcast is best effort: a failed publish is logged, not returned,
    /// since the shared entry is already gone.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        self.check_id(id)?;
        let started = Instant::now();
        let result = self.remove_and_publish(id).await;
        self.metrics.record_latency(Operation::Delete, started.elapsed());
        if let Err(err) = &result {
            self.metrics.record_error();
            warn!(id, error = %err, "cache delete failed");
        }
        result
    }

    async fn remove_and_publish(&self, id: &str) -> Result<bool> {
        let tx = Transaction::new()
            .del(self.keys.payload_key(id))
            .zrem(self.keys.order_key(), id);
        let mut replies = self.call(self.store.exec(tx)).await?;
        let existed = take_reply(&mut replies, 0)?.as_int()? > 0;
        if take_reply(&mut replies, 1)?.as_int()? > 0 {
            self.metrics.reduce_size(1);
        }

        let channel = self.keys.channel(id);
        match self
            .call(self.store.publish(&channel, INVALIDATE_PAYLOAD))
            .await
        {
            Ok(receivers) => debug!(id, receivers, "invalidation published"),
            Err(err) => warn!(id, error = %err, "failed to publish invalidation"),
        }
        Ok(existed)
    }

    // == Warm ==
    /// Bulk-loads `entries` in one transaction, then evicts the oldest
    /// `count - max` identifiers in one batch. Returns the number evicted.
    pub async fn warm(&self, entries: Vec<CacheEntry>) -> Result<u64> {
        if entries.is_empty() {
            return Ok(0);
        }
        for entry in &entries {
            self.check_id(&entry.id)?;
            entry.validate()?;
        }
        info!(count = entries.len(), "warming cache");

        let started = Instant::now();
        let result = self.bulk_insert(entries).await;
        self.metrics.record_latency(Operation::Set, started.elapsed());
        match &result {
            Ok(evicted) => info!(evicted, "cache warming completed"),
            Err(err) => {
                self.metrics.record_error();
                warn!(error = %err, "cache warming failed");
            }
        }
        result
    }

    async fn bulk_insert(&self, entries: Vec<CacheEntry>) -> Result<u64> {
        let order_key = self.keys.order_key();
        let payload_keys: Vec<String> = entries
            .iter()
            .map(|entry| self.keys.payload_key(&entry.id))
            .collect();

        let mut replies = self
            .write_watched(&payload_keys, |live| {
                entries
                    .iter()
                    .enumerate()
                    .fold(Transaction::new(), |tx, (i, entry)| {
                        let ttl = self.effective_ttl(entry.ttl.unwrap_or(Duration::ZERO));
                        let live = live.get(i).copied().unwrap_or(true);
                        self.queue_write(tx, &entry.id, entry.payload.clone(), ttl, live)
                    })
                    .zcard(order_key)
            })
            .await?;
        let count = take_reply(&mut replies, 2 * entries.len())?
            .as_int()?
            .max(0) as u64;
        self.metrics.set_size(count);

        if count <= self.config.max_entries {
            return Ok(0);
        }
        let excess = count - self.config.max_entries;
        debug!(size = count, excess, "warm load over capacity");
        self.evict_oldest(excess).await
    }

    // == Maintenance ==
    /// Removes index entries whose payload is gone (TTL expiry). Each check
    /// watches the payload key, so an identifier re-`set` concurrently keeps
    /// its index entry.
    pub async fn sweep_stale_index(&self) -> Result<u64> {
        let ids = self
            .call(self.store.zrange(self.keys.order_key(), 0, -1))
            .await?;
        let mut removed = 0;
        for id in ids {
            let session = self
                .call(self.store.watch(&self.keys.payload_key(&id)))
                .await?;
            if session.value().is_some() {
                self.call(session.discard()).await?;
                continue;
            }
            let tx = Transaction::new().zrem(self.keys.order_key(), id.as_str());
            if let Some(mut replies) = self.call(session.exec(tx)).await? {
                if take_reply(&mut replies, 0)?.as_int()? > 0 {
                    debug!(id = %id, "swept stale index entry");
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            self.metrics.reduce_size(removed);
        }
        Ok(removed)
    }

    /// Number of identifiers in the order index.
    pub async fn len(&self) -> Result<u64> {
        let count = self.call(self.store.zcard(self.keys.order_key())).await?;
        self.metrics.set_size(count);
        Ok(count)
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Identifiers from oldest to newest.
    pub async fn order(&self) -> Result<Vec<String>> {
        self.call(self.store.zrange(self.keys.order_key(), 0, -1))
            .await
    }

    // == Accessors ==
    pub fn stats(&self) -> CacheStats {
        self.metrics.snapshot()
    }

    pub fn metrics(&self) -> Arc<CacheMetrics> {
        self.metrics.clone()
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Identifiers invalidated by any replica, for in-process consumers such
    /// as a negative cache.
    pub fn subscribe_invalidations(&self) -> broadcast::Receiver<String> {
        self.listeners.subscribe()
    }
}

impl<S: CoordinationStore> Drop for BoundedCache<S> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
