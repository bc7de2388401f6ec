//! Redis store backend
//!
//! Plain commands and `MULTI`/`EXEC` batches go over a shared
//! [`ConnectionManager`], which reconnects on its own. `WATCH` is connection
//! scoped, so every watch session checks a connection out of a small pool
//! and holds it alone until `EXEC` or `UNWATCH` clears the watch; otherwise
//! one caller's transaction could trip another caller's watch.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::{Client, Pipeline, RedisError};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use super::{
    CoordinationStore, Notification, Reply, StoreError, StoreOp, StoreResult, Subscription,
    Transaction, WatchSession,
};

const SUBSCRIPTION_BUFFER: usize = 1024;

/// Dedicated connections kept for watch sessions unless configured otherwise.
pub const DEFAULT_WATCH_POOL_SIZE: usize = 16;

impl From<RedisError> for StoreError {
    fn from(err: RedisError) -> Self {
        if err.is_io_error()
            || err.is_connection_dropped()
            || err.is_connection_refusal()
            || err.is_timeout()
        {
            StoreError::Connection(err.to_string())
        } else {
            StoreError::Command(err.to_string())
        }
    }
}

// == Watch Pool ==
/// Bounded checkout queue of dedicated connections.
///
/// At most `capacity` connections exist at once: a session holds a permit for
/// as long as it holds its connection, and callers beyond the bound wait.
/// Only connections whose watch was cleared are put back.
struct ConnectionPool<C> {
    idle: Mutex<Vec<C>>,
    permits: Arc<Semaphore>,
}

impl<C> ConnectionPool<C> {
    fn new(capacity: usize) -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            permits: Arc::new(Semaphore::new(capacity.clamp(1, Semaphore::MAX_PERMITS))),
        }
    }

    async fn permit(&self) -> StoreResult<OwnedSemaphorePermit> {
        self.permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| StoreError::Connection("watch pool closed".to_string()))
    }

    fn take_idle(&self) -> Option<C> {
        self.idle.lock().pop()
    }

    fn put_back(&self, conn: C) {
        self.idle.lock().push(conn);
    }

    fn idle_len(&self) -> usize {
        self.idle.lock().len()
    }
}

// == Redis Store ==
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    conn: ConnectionManager,
    watch_pool: Arc<ConnectionPool<MultiplexedConnection>>,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("addr", &self.client.get_connection_info().addr)
            .finish()
    }
}

impl RedisStore {
    /// Connects to `url` (e.g. `redis://127.0.0.1:6379`) and verifies the
    /// server answers `PING`.
    pub async fn connect(url: &str) -> StoreResult<Self> {
        Self::connect_with_pool(url, DEFAULT_WATCH_POOL_SIZE).await
    }

    /// Like [`RedisStore::connect`], keeping at most `watch_pool_size`
    /// dedicated connections for watch sessions.
    pub async fn connect_with_pool(url: &str, watch_pool_size: usize) -> StoreResult<Self> {
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        let store = Self {
            client,
            conn,
            watch_pool: Arc::new(ConnectionPool::new(watch_pool_size)),
        };
        store.ping().await?;
        info!(url, watch_pool_size, "connected to redis");
        Ok(store)
    }

    async fn dedicated(&self) -> StoreResult<MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    /// Watches `keys` on a pooled connection, falling back to a fresh one
    /// when the idle connection turns out to be dead.
    async fn open_watch(
        &self,
        keys: &[String],
    ) -> StoreResult<(MultiplexedConnection, Vec<Option<Vec<u8>>>)> {
        if let Some(mut conn) = self.watch_pool.take_idle() {
            match watch_and_read(&mut conn, keys).await {
                Ok(values) => return Ok((conn, values)),
                Err(err) => debug!(error = %err, "pooled watch connection failed, reconnecting"),
            }
        }
        let mut conn = self.dedicated().await?;
        let values = watch_and_read(&mut conn, keys).await?;
        Ok((conn, values))
    }
}

async fn watch_and_read(
    conn: &mut MultiplexedConnection,
    keys: &[String],
) -> StoreResult<Vec<Option<Vec<u8>>>> {
    let _: () = redis::cmd("WATCH").arg(keys).query_async(conn).await?;
    // MGET answers nil for keys holding another type
    Ok(redis::cmd("MGET").arg(keys).query_async(conn).await?)
}

fn queue(pipe: &mut Pipeline, op: &StoreOp) {
    match op {
        StoreOp::Get { key } => {
            pipe.cmd("GET").arg(key);
        }
        StoreOp::Set { key, value, ttl } => {
            pipe.cmd("SET").arg(key).arg(value.as_slice());
            if !ttl.is_zero() {
                pipe.arg("PX").arg(ttl_millis(*ttl));
            }
        }
        StoreOp::Del { key } => {
            pipe.cmd("DEL").arg(key);
        }
        StoreOp::Exists { key } => {
            pipe.cmd("EXISTS").arg(key);
        }
        StoreOp::ZAdd {
            key,
            member,
            score,
            only_new,
        } => {
            pipe.cmd("ZADD").arg(key);
            if *only_new {
                pipe.arg("NX");
            }
            pipe.arg(*score).arg(member);
        }
        StoreOp::ZRange { key, start, stop } => {
            pipe.cmd("ZRANGE").arg(key).arg(*start).arg(*stop);
        }
        StoreOp::ZRem { key, member } => {
            pipe.cmd("ZREM").arg(key).arg(member);
        }
        StoreOp::ZCard { key } => {
            pipe.cmd("ZCARD").arg(key);
        }
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

fn decode(op: &StoreOp, value: &redis::Value) -> StoreResult<Reply> {
    Ok(match op {
        StoreOp::Get { .. } => match redis::from_redis_value::<Option<Vec<u8>>>(value)? {
            Some(data) => Reply::Bytes(data),
            None => Reply::Nil,
        },
        StoreOp::Set { .. } => Reply::Ok,
        StoreOp::Del { .. }
        | StoreOp::Exists { .. }
        | StoreOp::ZAdd { .. }
        | StoreOp::ZRem { .. }
        | StoreOp::ZCard { .. } => Reply::Int(redis::from_redis_value::<i64>(value)?),
        StoreOp::ZRange { .. } => Reply::Members(redis::from_redis_value::<Vec<String>>(value)?),
    })
}

fn build(tx: &Transaction) -> Pipeline {
    let mut pipe = redis::pipe();
    pipe.atomic();
    for op in tx.ops() {
        queue(&mut pipe, op);
    }
    pipe
}

fn decode_all(tx: &Transaction, values: Vec<redis::Value>) -> StoreResult<Vec<Reply>> {
    if values.len() != tx.len() {
        return Err(StoreError::UnexpectedReply(format!(
            "expected {} replies, got {}",
            tx.len(),
            values.len()
        )));
    }
    tx.ops()
        .iter()
        .zip(values.iter())
        .map(|(op, value)| decode(op, value))
        .collect()
}

#[async_trait]
impl CoordinationStore for RedisStore {
    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn exec(&self, tx: Transaction) -> StoreResult<Vec<Reply>> {
        if tx.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let values: Vec<redis::Value> = build(&tx).query_async(&mut conn).await?;
        decode_all(&tx, values)
    }

    async fn watch_all(&self, keys: &[String]) -> StoreResult<Box<dyn WatchSession>> {
        if keys.is_empty() {
            return Err(StoreError::Command("WATCH needs at least one key".to_string()));
        }
        let permit = self.watch_pool.permit().await?;
        let (conn, values) = self.open_watch(keys).await?;
        Ok(Box::new(RedisWatch {
            conn,
            values,
            pool: self.watch_pool.clone(),
            _permit: permit,
        }))
    }

    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<u64> {
        let mut conn = self.conn.clone();
        let receivers: i64 = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(receivers.max(0) as u64)
    }

    async fn psubscribe(&self, pattern: &str) -> StoreResult<Subscription> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.psubscribe(pattern).await?;
        debug!(pattern, "redis pattern subscription opened");

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let pattern = pattern.to_string();
        let forwarder = tokio::spawn(async move {
            let mut messages = Box::pin(pubsub.into_on_message());
            while let Some(msg) = messages.next().await {
                let payload: String = msg.get_payload().unwrap_or_default();
                let notification = Notification {
                    channel: msg.get_channel_name().to_string(),
                    payload,
                };
                if tx.send(notification).await.is_err() {
                    break;
                }
            }
            warn!(pattern = %pattern, "redis subscription stream ended");
        });

        Ok(Subscription::new(rx, Some(forwarder)))
    }

    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        Ok(redis::cmd("GET").arg(key).query_async(&mut conn).await?)
    }

    async fn del(&self, key: &str) -> StoreResult<u64> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(removed.max(0) as u64)
    }

    async fn zrange(&self, key: &str, start: isize, stop: isize) -> StoreResult<Vec<String>> {
        let mut conn = self.conn.clone();
        Ok(redis::cmd("ZRANGE")
            .arg(key)
            .arg(start)
            .arg(stop)
            .query_async(&mut conn)
            .await?)
    }

    async fn zcard(&self, key: &str) -> StoreResult<u64> {
        let mut conn = self.conn.clone();
        let count: i64 = redis::cmd("ZCARD").arg(key).query_async(&mut conn).await?;
        Ok(count.max(0) as u64)
    }
}

struct RedisWatch {
    conn: MultiplexedConnection,
    values: Vec<Option<Vec<u8>>>,
    pool: Arc<ConnectionPool<MultiplexedConnection>>,
    _permit: OwnedSemaphorePermit,
}

#[async_trait]
impl WatchSession for RedisWatch {
    fn values(&self) -> &[Option<Vec<u8>>] {
        &self.values
    }

    async fn exec(self: Box<Self>, tx: Transaction) -> StoreResult<Option<Vec<Reply>>> {
        if tx.is_empty() {
            self.discard().await?;
            return Ok(Some(Vec::new()));
        }
        let RedisWatch {
            mut conn,
            pool,
            _permit,
            ..
        } = *self;
        // EXEC answers nil when a watched key changed; either way it clears
        // the watch, so the connection can be reused
        let values: Option<Vec<redis::Value>> = build(&tx).query_async(&mut conn).await?;
        pool.put_back(conn);
        values.map(|values| decode_all(&tx, values)).transpose()
    }

    async fn discard(self: Box<Self>) -> StoreResult<()> {
        let RedisWatch {
            mut conn,
            pool,
            _permit,
            ..
        } = *self;
        let _: () = redis::cmd("UNWATCH").query_async(&mut conn).await?;
        pool.put_back(conn);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_millis_rounds_up_to_one() {
        assert_eq!(ttl_millis(Duration::from_micros(10)), 1);
        assert_eq!(ttl_millis(Duration::from_secs(60)), 60_000);
    }

    #[test]
    fn test_watch_ops_queue_nx_flag() {
        let tx = Transaction::new()
            .zadd_nx("idx", "a", 1.0)
            .set("k", b"v".to_vec(), Duration::from_secs(1));
        let packed = String::from_utf8_lossy(&build(&tx).get_packed_pipeline()).to_string();
        assert!(packed.contains("NX"));
        assert!(packed.contains("PX"));
        assert!(packed.contains("MULTI"));
    }

    #[tokio::test]
    async fn test_pool_reuses_idle_connections() {
        let pool: ConnectionPool<u32> = ConnectionPool::new(2);
        assert!(pool.take_idle().is_none());

        pool.put_back(7);
        assert_eq!(pool.idle_len(), 1);
        assert_eq!(pool.take_idle(), Some(7));
        assert_eq!(pool.idle_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pool_bounds_checked_out_connections() {
        let pool: ConnectionPool<u32> = ConnectionPool::new(2);
        let first = pool.permit().await.unwrap();
        let _second = pool.permit().await.unwrap();

        let third = tokio::time::timeout(Duration::from_millis(100), pool.permit()).await;
        assert!(third.is_err());

        drop(first);
        let third = tokio::time::timeout(Duration::from_millis(100), pool.permit()).await;
        assert!(third.is_ok());
    }
}
