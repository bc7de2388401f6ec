//! Renewing-window counter.
//!
//! Each key holds a decimal count whose TTL is reset to the window length on
//! every increment. An absent key counts as zero. Sustained traffic therefore
//! keeps extending the current window; there are no calendar buckets.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::CounterConfig;
use crate::error::{CoordError, Result};
use crate::store::{with_timeout, CoordinationStore, StoreResult, Transaction};

// == Increment Outcome ==
/// Result of [`SlidingWindowCounter::increment`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncrementOutcome {
    /// The write committed; holds the new count.
    Counted(u64),
    /// Every attempt lost the watch to a concurrent writer.
    LockExhausted { attempts: u32 },
}

impl IncrementOutcome {
    pub fn count(&self) -> Option<u64> {
        match self {
            IncrementOutcome::Counted(n) => Some(*n),
            IncrementOutcome::LockExhausted { .. } => None,
        }
    }

    /// Converts lock exhaustion into [`CoordError::OptimisticLockExhausted`].
    pub fn into_result(self, key: &str) -> Result<u64> {
        match self {
            IncrementOutcome::Counted(n) => Ok(n),
            IncrementOutcome::LockExhausted { attempts } => Err(CoordError::OptimisticLockExhausted {
                key: key.to_string(),
                attempts,
            }),
        }
    }
}

// == Sliding Window Counter ==
/// Per-key counter kept in the shared store.
///
/// Increments are read-modify-write under `WATCH`, retried a bounded number
/// of times without backoff. No replica-local lock is involved.
///
/// Each store call is bounded by `CounterConfig::op_timeout`; callers that
/// need a tighter budget wrap the call in `tokio::time::timeout`, and
/// dropping the future cancels it.
#[derive(Debug)]
pub struct SlidingWindowCounter<S: CoordinationStore> {
    store: Arc<S>,
    config: CounterConfig,
}

impl<S: CoordinationStore> Clone for SlidingWindowCounter<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            config: self.config.clone(),
        }
    }
}

fn parse_count(key: &str, raw: Option<&[u8]>) -> Result<u64> {
    let Some(raw) = raw else {
        return Ok(0);
    };
    std::str::from_utf8(raw)
        .ok()
        .and_then(|text| text.trim().parse::<u64>().ok())
        .ok_or_else(|| {
            CoordError::Serialization(format!("counter '{}' does not hold an integer", key))
        })
}

fn check_window(window: Duration) -> Result<()> {
    if window.is_zero() {
        return Err(CoordError::InvalidRequest(
            "Window length must be positive".to_string(),
        ));
    }
    Ok(())
}

impl<S: CoordinationStore> SlidingWindowCounter<S> {
    pub fn new(store: Arc<S>, config: CounterConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &CounterConfig {
        &self.config
    }

    /// `<rate-prefix><key>`
    pub fn store_key(&self, key: &str) -> String {
        format!("{}{}", self.config.key_prefix, key)
    }

    async fn call<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = StoreResult<T>>,
    {
        with_timeout(self.config.op_timeout, fut)
            .await
            .map_err(CoordError::from)
    }

    // == Peek ==
    /// Current count for `key`, surfacing store failures.
    ///
    /// The window is implicit in the key's TTL; it is accepted here so both
    /// calls of the rate-limit policy take the same arguments.
    pub async fn try_peek(&self, key: &str, window: Duration) -> Result<u64> {
        check_window(window)?;
        let store_key = self.store_key(key);
        let raw = self.call(self.store.get(&store_key)).await?;
        parse_count(&store_key, raw.as_deref())
    }

    /// Current count for `key`; 0 when absent or when the read fails.
    pub async fn peek(&self, key: &str, window: Duration) -> u64 {
        match self.try_peek(key, window).await {
            Ok(count) => count,
            Err(err) => {
                warn!(key, error = %err, "counter read failed, assuming zero");
                0
            }
        }
    }

    // == Increment ==
    /// Adds one to `key` and renews its TTL to `window`.
    ///
    /// Store failures are returned immediately; only a broken watch is
    /// retried, up to `max_attempts` times.
    pub async fn increment(&self, key: &str, window: Duration) -> Result<IncrementOutcome> {
        check_window(window)?;
        let store_key = self.store_key(key);
        let attempts = self.config.max_attempts.max(1);

        for attempt in 1..=attempts {
            let session = self.call(self.store.watch(&store_key)).await?;
            let current = match parse_count(&store_key, session.value()) {
                Ok(count) => count,
                Err(err) => {
                    self.call(session.discard()).await?;
                    return Err(err);
                }
            };

            let next = current.saturating_add(1);
            let tx = Transaction::new().set(store_key.as_str(), next.to_string(), window);
            match self.call(session.exec(tx)).await? {
                Some(_) => {
                    debug!(key, count = next, attempt, "counter incremented");
                    return Ok(IncrementOutcome::Counted(next));
                }
                None => debug!(key, attempt, "counter watch broken, retrying"),
            }
        }

        warn!(key, attempts, "counter increment lost every optimistic lock attempt");
        Ok(IncrementOutcome::LockExhausted { attempts })
    }
}
