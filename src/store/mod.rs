//! Store Adapter Module
//!
//! Thin capability interface over the shared key-value store that every
//! replica coordinates through. The cache and the counter hold an explicit
//! `Arc` handle to an implementation; nothing in this crate reaches for a
//! global connection.
//!
//! # Implementations
//! - [`RedisStore`] - the production backend
//! - [`MemoryStore`] - in-process emulation with the same semantics

mod memory;
mod redis_store;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub use memory::{pattern_matches, MemoryStore};
pub use redis_store::RedisStore;

// == Store Error ==
/// Failures raised by a store backend.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("command failed: {0}")]
    Command(String),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

// == Commands ==
/// A single command queued inside a [`Transaction`].
#[derive(Debug, Clone, PartialEq)]
pub enum StoreOp {
    Get { key: String },
    /// `ttl` of zero means no expiry.
    Set { key: String, value: Vec<u8>, ttl: Duration },
    Del { key: String },
    Exists { key: String },
    /// `only_new` maps to `ZADD NX`: an existing member keeps its score.
    ZAdd { key: String, member: String, score: f64, only_new: bool },
    /// Inclusive range by rank, negative indexes count from the end.
    ZRange { key: String, start: isize, stop: isize },
    ZRem { key: String, member: String },
    ZCard { key: String },
}

impl StoreOp {
    /// The single key every command addresses.
    pub fn key(&self) -> &str {
        match self {
            StoreOp::Get { key }
            | StoreOp::Set { key, .. }
            | StoreOp::Del { key }
            | StoreOp::Exists { key }
            | StoreOp::ZAdd { key, .. }
            | StoreOp::ZRange { key, .. }
            | StoreOp::ZRem { key, .. }
            | StoreOp::ZCard { key } => key,
        }
    }
}

/// Batch of commands executed all-or-nothing (`MULTI` / `EXEC`).
#[derive(Debug, Clone, Default)]
pub struct Transaction {
    ops: Vec<StoreOp>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(mut self, key: impl Into<String>) -> Self {
        self.ops.push(StoreOp::Get { key: key.into() });
        self
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<Vec<u8>>, ttl: Duration) -> Self {
        self.ops.push(StoreOp::Set {
            key: key.into(),
            value: value.into(),
            ttl,
        });
        self
    }

    pub fn del(mut self, key: impl Into<String>) -> Self {
        self.ops.push(StoreOp::Del { key: key.into() });
        self
    }

    pub fn exists(mut self, key: impl Into<String>) -> Self {
        self.ops.push(StoreOp::Exists { key: key.into() });
        self
    }

    pub fn zadd(mut self, key: impl Into<String>, member: impl Into<String>, score: f64) -> Self {
        self.ops.push(StoreOp::ZAdd {
            key: key.into(),
            member: member.into(),
            score,
            only_new: false,
        });
        self
    }

    /// Adds `member` only if it is not already in the set.
    pub fn zadd_nx(mut self, key: impl Into<String>, member: impl Into<String>, score: f64) -> Self {
        self.ops.push(StoreOp::ZAdd {
            key: key.into(),
            member: member.into(),
            score,
            only_new: true,
        });
        self
    }

    pub fn zrange(mut self, key: impl Into<String>, start: isize, stop: isize) -> Self {
        self.ops.push(StoreOp::ZRange {
            key: key.into(),
            start,
            stop,
        });
        self
    }

    pub fn zrem(mut self, key: impl Into<String>, member: impl Into<String>) -> Self {
        self.ops.push(StoreOp::ZRem {
            key: key.into(),
            member: member.into(),
        });
        self
    }

    pub fn zcard(mut self, key: impl Into<String>) -> Self {
        self.ops.push(StoreOp::ZCard { key: key.into() });
        self
    }

    pub fn ops(&self) -> &[StoreOp] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

// == Replies ==
/// Decoded reply for one queued command, in queue order.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Ok,
    Nil,
    Int(i64),
    Bytes(Vec<u8>),
    Members(Vec<String>),
}

impl Reply {
    pub fn as_int(&self) -> StoreResult<i64> {
        match self {
            Reply::Int(n) => Ok(*n),
            other => Err(StoreError::UnexpectedReply(format!(
                "expected integer, got {:?}",
                other
            ))),
        }
    }

    pub fn into_bytes(self) -> StoreResult<Option<Vec<u8>>> {
        match self {
            Reply::Bytes(data) => Ok(Some(data)),
            Reply::Nil => Ok(None),
            other => Err(StoreError::UnexpectedReply(format!(
                "expected bulk string, got {:?}",
                other
            ))),
        }
    }

    pub fn into_members(self) -> StoreResult<Vec<String>> {
        match self {
            Reply::Members(members) => Ok(members),
            Reply::Nil => Ok(Vec::new()),
            other => Err(StoreError::UnexpectedReply(format!(
                "expected member list, got {:?}",
                other
            ))),
        }
    }
}

/// Pulls the reply at `index` out of an `exec` result.
pub(crate) fn take_reply(replies: &mut [Reply], index: usize) -> StoreResult<Reply> {
    replies
        .get_mut(index)
        .map(|slot| std::mem::replace(slot, Reply::Nil))
        .ok_or_else(|| StoreError::UnexpectedReply(format!("missing reply #{}", index)))
}

// == Pub/Sub ==
/// A message received on a pattern subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub channel: String,
    pub payload: String,
}

/// Live pattern subscription. Dropping it tears down the forwarding task.
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::Receiver<Notification>,
    forwarder: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn new(rx: mpsc::Receiver<Notification>, forwarder: Option<JoinHandle<()>>) -> Self {
        Self { rx, forwarder }
    }

    /// Waits for the next message. `None` once the store side has closed.
    pub async fn recv(&mut self) -> Option<Notification> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(handle) = self.forwarder.take() {
            handle.abort();
        }
    }
}

// == Watch ==
/// An optimistic lock on one or more keys, opened by
/// [`CoordinationStore::watch`] or [`CoordinationStore::watch_all`].
///
/// `exec` returns `Ok(None)` when any watched key changed (written, deleted
/// or expired) after the watch was taken; nothing from the transaction is
/// applied in that case.
#[async_trait]
pub trait WatchSession: Send {
    /// Values of the watched keys as read right after `WATCH`, in the order
    /// the keys were given.
    fn values(&self) -> &[Option<Vec<u8>>];

    /// Value of the first watched key.
    fn value(&self) -> Option<&[u8]> {
        self.values().first().and_then(|value| value.as_deref())
    }

    async fn exec(self: Box<Self>, tx: Transaction) -> StoreResult<Option<Vec<Reply>>>;

    /// Releases the watch without writing.
    async fn discard(self: Box<Self>) -> StoreResult<()>;
}

// == Store Capability ==
/// Command surface consumed from the shared store.
///
/// Implementations must be usable from many tasks at once without a
/// process-wide lock serializing unrelated keys.
#[async_trait]
pub trait CoordinationStore: Send + Sync + 'static {
    async fn ping(&self) -> StoreResult<()>;

    /// Runs every command in `tx` atomically and returns one reply per command.
    async fn exec(&self, tx: Transaction) -> StoreResult<Vec<Reply>>;

    /// Opens a dedicated `WATCH` on every key in `keys` and reads their
    /// current values.
    async fn watch_all(&self, keys: &[String]) -> StoreResult<Box<dyn WatchSession>>;

    async fn watch(&self, key: &str) -> StoreResult<Box<dyn WatchSession>> {
        self.watch_all(&[key.to_string()]).await
    }

    /// Returns the number of subscribers that received the message.
    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<u64>;

    async fn psubscribe(&self, pattern: &str) -> StoreResult<Subscription>;

    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let mut replies = self.exec(Transaction::new().get(key)).await?;
        take_reply(&mut replies, 0)?.into_bytes()
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<()> {
        self.exec(Transaction::new().set(key, value.to_vec(), ttl))
            .await
            .map(|_| ())
    }

    async fn del(&self, key: &str) -> StoreResult<u64> {
        let mut replies = self.exec(Transaction::new().del(key)).await?;
        Ok(take_reply(&mut replies, 0)?.as_int()?.max(0) as u64)
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let mut replies = self.exec(Transaction::new().exists(key)).await?;
        Ok(take_reply(&mut replies, 0)?.as_int()? > 0)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<u64> {
        let mut replies = self.exec(Transaction::new().zadd(key, member, score)).await?;
        Ok(take_reply(&mut replies, 0)?.as_int()?.max(0) as u64)
    }

    async fn zrange(&self, key: &str, start: isize, stop: isize) -> StoreResult<Vec<String>> {
        let mut replies = self.exec(Transaction::new().zrange(key, start, stop)).await?;
        take_reply(&mut replies, 0)?.into_members()
    }

    async fn zrem(&self, key: &str, member: &str) -> StoreResult<u64> {
        let mut replies = self.exec(Transaction::new().zrem(key, member)).await?;
        Ok(take_reply(&mut replies, 0)?.as_int()?.max(0) as u64)
    }

    async fn zcard(&self, key: &str) -> StoreResult<u64> {
        let mut replies = self.exec(Transaction::new().zcard(key)).await?;
        Ok(take_reply(&mut replies, 0)?.as_int()?.max(0) as u64)
    }
}

// == Deadline ==
/// Bounds a store call by `limit`; expiry becomes [`StoreError::Timeout`].
pub async fn with_timeout<T, F>(limit: Duration, fut: F) -> StoreResult<T>
where
    F: Future<Output = StoreResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(limit)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_builder_keeps_order() {
        let tx = Transaction::new()
            .set("a", b"1".to_vec(), Duration::from_secs(1))
            .zadd_nx("idx", "a", 1.0)
            .zcard("idx");

        assert_eq!(tx.len(), 3);
        assert!(matches!(tx.ops()[0], StoreOp::Set { .. }));
        assert!(matches!(
            tx.ops()[1],
            StoreOp::ZAdd { only_new: true, .. }
        ));
        assert!(matches!(tx.ops()[2], StoreOp::ZCard { .. }));
        assert_eq!(tx.ops()[1].key(), "idx");
    }

    #[test]
    fn test_reply_conversions() {
        assert_eq!(Reply::Int(4).as_int().unwrap(), 4);
        assert_eq!(Reply::Nil.into_bytes().unwrap(), None);
        assert_eq!(
            Reply::Bytes(b"x".to_vec()).into_bytes().unwrap(),
            Some(b"x".to_vec())
        );
        assert!(Reply::Ok.as_int().is_err());
        assert!(Reply::Nil.into_members().unwrap().is_empty());
    }

    #[test]
    fn test_take_reply_out_of_range() {
        let mut replies = vec![Reply::Ok];
        assert!(take_reply(&mut replies, 1).is_err());
        assert_eq!(take_reply(&mut replies, 0).unwrap(), Reply::Ok);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout_expires() {
        let result: StoreResult<()> = with_timeout(Duration::from_millis(50), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        assert!(matches!(result, Err(StoreError::Timeout(_))));
    }
}
