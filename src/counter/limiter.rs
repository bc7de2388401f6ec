//! Rate Limiter Module
//!
//! Fixed-limit policy over [`SlidingWindowCounter`]: peek, then increment only
//! if the client is still under the limit.
//!
//! The peek and the increment are two separate store round trips, so
//! concurrent requests from one client can both pass the check and overshoot
//! the limit slightly. This is a soft limit.
//!
//! Store failures and lock exhaustion let the request through.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::{CounterConfig, LimiterConfig};
use crate::counter::{IncrementOutcome, SlidingWindowCounter};
use crate::store::CoordinationStore;

// == Decision ==
/// Verdict for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Counted against the quota.
    Allowed {
        limit: u64,
        remaining: u64,
        /// Epoch seconds
        reset_at: i64,
    },
    /// Over the limit; nothing was counted.
    Denied {
        limit: u64,
        reset_at: i64,
        retry_after: Duration,
    },
    /// The counter could not be consulted; the request goes through uncounted.
    FailOpen,
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Decision::Denied { .. })
    }

    /// Response headers for this decision. `FailOpen` carries none.
    pub fn headers(&self, prefix: &str) -> Vec<(String, String)> {
        match self {
            Decision::Allowed {
                limit,
                remaining,
                reset_at,
            } => vec![
                (format!("{}Limit", prefix), limit.to_string()),
                (format!("{}Remaining", prefix), remaining.to_string()),
                (format!("{}Reset", prefix), reset_at.to_string()),
            ],
            Decision::Denied {
                limit,
                reset_at,
                retry_after,
            } => vec![
                (format!("{}Limit", prefix), limit.to_string()),
                (format!("{}Remaining", prefix), "0".to_string()),
                (format!("{}Reset", prefix), reset_at.to_string()),
                ("Retry-After".to_string(), retry_after.as_secs().to_string()),
            ],
            Decision::FailOpen => Vec::new(),
        }
    }
}

// == Statistics ==
/// Running totals of decisions.
#[derive(Debug, Default)]
pub struct RateLimitStats {
    allowed: AtomicU64,
    denied: AtomicU64,
    fail_open: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RateLimitSnapshot {
    pub allowed: u64,
    pub denied: u64,
    pub fail_open: u64,
}

impl RateLimitStats {
    fn record(&self, decision: &Decision) {
        let slot = match decision {
            Decision::Allowed { .. } => &self.allowed,
            Decision::Denied { .. } => &self.denied,
            Decision::FailOpen => &self.fail_open,
        };
        slot.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RateLimitSnapshot {
        RateLimitSnapshot {
            allowed: self.allowed.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
            fail_open: self.fail_open.load(Ordering::Relaxed),
        }
    }
}

// == Rate Limiter ==
#[derive(Debug)]
pub struct RateLimiter<S: CoordinationStore> {
    counter: SlidingWindowCounter<S>,
    config: LimiterConfig,
    stats: Arc<RateLimitStats>,
}

impl<S: CoordinationStore> RateLimiter<S> {
    pub fn new(store: Arc<S>, counter: CounterConfig, config: LimiterConfig) -> Self {
        Self::with_counter(SlidingWindowCounter::new(store, counter), config)
    }

    pub fn with_counter(counter: SlidingWindowCounter<S>, config: LimiterConfig) -> Self {
        Self {
            counter,
            config,
            stats: Arc::new(RateLimitStats::default()),
        }
    }

    pub fn config(&self) -> &LimiterConfig {
        &self.config
    }

    pub fn counter(&self) -> &SlidingWindowCounter<S> {
        &self.counter
    }

    pub fn stats(&self) -> Arc<RateLimitStats> {
        self.stats.clone()
    }

    fn reset_at(&self) -> i64 {
        let window = i64::try_from(self.config.window.as_secs()).unwrap_or(i64::MAX);
        Utc::now().timestamp().saturating_add(window)
    }

    // == Check ==
    /// Applies the policy to one request from `client`.
    pub async fn check(&self, client: &str) -> Decision {
        let decision = self.decide(client).await;
        self.stats.record(&decision);
        decision
    }

    async fn decide(&self, client: &str) -> Decision {
        let limit = self.config.limit;
        let window = self.config.window;

        let count = match self.counter.try_peek(client, window).await {
            Ok(count) => count,
            Err(err) => {
                warn!(client, error = %err, "rate limit check failed, allowing request");
                return Decision::FailOpen;
            }
        };

        if count >= limit {
            debug!(client, count, limit, "rate limit exceeded");
            return Decision::Denied {
                limit,
                reset_at: self.reset_at(),
                retry_after: window,
            };
        }

        match self.counter.increment(client, window).await {
            Ok(IncrementOutcome::Counted(count)) => Decision::Allowed {
                limit,
                remaining: limit.saturating_sub(count),
                reset_at: self.reset_at(),
            },
            Ok(IncrementOutcome::LockExhausted { attempts }) => {
                warn!(client, attempts, "rate limit counter contended, allowing request");
                Decision::FailOpen
            }
            Err(err) => {
                warn!(client, error = %err, "rate limit increment failed, allowing request");
                Decision::FailOpen
            }
        }
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn limiter(store: &MemoryStore, limit: u64) -> RateLimiter<MemoryStore> {
        RateLimiter::new(
            Arc::new(store.clone()),
            CounterConfig::default(),
            LimiterConfig {
                limit,
                window: Duration::from_secs(60),
                header_prefix: "X-RateLimit-".to_string(),
            },
        )
    }

    #[tokio::test]
    async fn test_allows_until_limit_then_denies() {
        let store = MemoryStore::new();
        let limiter = limiter(&store, 3);

        for expected_remaining in [2, 1, 0] {
            match limiter.check("c").await {
                Decision::Allowed { remaining, .. } => assert_eq!(remaining, expected_remaining),
                other => panic!("expected allow, got {:?}", other),
            }
        }
        let denied = limiter.check("c").await;
        assert!(!denied.is_allowed());
        // a denial is not counted
        assert_eq!(limiter.counter().peek("c", Duration::from_secs(60)).await, 3);

        let stats = limiter.stats().snapshot();
        assert_eq!(stats.allowed, 3);
        assert_eq!(stats.denied, 1);
    }

    #[tokio::test]
    async fn test_clients_are_independent() {
        let store = MemoryStore::new();
        let limiter = limiter(&store, 1);

        assert!(limiter.check("a").await.is_allowed());
        assert!(!limiter.check("a").await.is_allowed());
        assert!(limiter.check("b").await.is_allowed());
    }

    #[tokio::test]
    async fn test_fail_open_when_store_down() {
        let store = MemoryStore::new();
        let limiter = limiter(&store, 1);
        store.set_online(false);

        assert_eq!(limiter.check("c").await, Decision::FailOpen);
        assert_eq!(limiter.check("c").await, Decision::FailOpen);
        assert_eq!(limiter.stats().snapshot().fail_open, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fail_open_when_store_stalls() {
        let store = MemoryStore::new();
        let limiter = limiter(&store, 1);
        store.set_latency(Duration::from_secs(5));

        let started = tokio::time::Instant::now();
        assert_eq!(limiter.check("c").await, Decision::FailOpen);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(limiter.stats().snapshot().fail_open, 1);
    }

    #[tokio::test]
    async fn test_fail_open_on_lock_exhaustion() {
        let store = MemoryStore::new();
        let limiter = limiter(&store, 5);
        store.inject_watch_conflicts(3);

        assert_eq!(limiter.check("c").await, Decision::FailOpen);
    }

    #[test]
    fn test_allowed_headers() {
        let decision = Decision::Allowed {
            limit: 100,
            remaining: 99,
            reset_at: 1_700_000_060,
        };
        assert_eq!(
            decision.headers("X-RateLimit-"),
            vec![
                ("X-RateLimit-Limit".to_string(), "100".to_string()),
                ("X-RateLimit-Remaining".to_string(), "99".to_string()),
                ("X-RateLimit-Reset".to_string(), "1700000060".to_string()),
            ]
        );
    }

    #[test]
    fn test_denied_headers() {
        let decision = Decision::Denied {
            limit: 100,
            reset_at: 1_700_000_060,
            retry_after: Duration::from_secs(60),
        };
        let headers = decision.headers("X-Custom-");
        assert!(headers.contains(&("X-Custom-Remaining".to_string(), "0".to_string())));
        assert!(headers.contains(&("Retry-After".to_string(), "60".to_string())));
        assert!(Decision::FailOpen.headers("X-").is_empty());
    }
}
