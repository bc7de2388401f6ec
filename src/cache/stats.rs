//! Cache Statistics Module
//!
//! Tracks cache performance metrics including hits, misses, evictions,
//! errors and per-operation latency. Recording is lock-free so concurrent
//! requests never contend on bookkeeping.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;

/// Operations whose latency is tracked separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Get,
    Set,
    Delete,
}

// == Cache Metrics ==
/// Live counters owned by one cache instance.
#[derive(Debug, Default)]
pub struct CacheMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    errors: AtomicU64,
    get_latency_ns: AtomicU64,
    set_latency_ns: AtomicU64,
    delete_latency_ns: AtomicU64,
    operations: AtomicU64,
    total_requests: AtomicU64,
    failed_requests: AtomicU64,
    consecutive_misses: AtomicU64,
    cache_size: AtomicU64,
    invalidations: AtomicU64,
    last_eviction_ms: AtomicU64,
    last_operation_ms: AtomicU64,
}

fn now_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

impl CacheMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    // == Record Hit ==
    /// Counts a hit and resets the miss streak.
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.consecutive_misses.store(0, Ordering::Relaxed);
    }

    // == Record Miss ==
    /// Counts a miss and returns the current miss streak.
    pub fn record_miss(&self) -> u64 {
        self.misses.fetch_add(1, Ordering::Relaxed);
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.consecutive_misses.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Counts a lookup that failed on the store side.
    pub fn record_failed_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a failed write, delete or decode.
    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    // == Record Eviction ==
    pub fn record_evictions(&self, count: u64) {
        if count == 0 {
            return;
        }
        self.evictions.fetch_add(count, Ordering::Relaxed);
        self.last_eviction_ms.store(now_ms(), Ordering::Relaxed);
    }

    pub fn record_invalidation(&self) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_latency(&self, op: Operation, elapsed: Duration) {
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        let slot = match op {
            Operation::Get => &self.get_latency_ns,
            Operation::Set => &self.set_latency_ns,
            Operation::Delete => &self.delete_latency_ns,
        };
        slot.fetch_add(nanos, Ordering::Relaxed);
        self.operations.fetch_add(1, Ordering::Relaxed);
        self.last_operation_ms.store(now_ms(), Ordering::Relaxed);
    }

    // == Update Entry Count ==
    /// Stores the index cardinality last observed by a write.
    pub fn set_size(&self, size: u64) {
        self.cache_size.store(size, Ordering::Relaxed);
    }

    pub fn reduce_size(&self, by: u64) {
        let _ = self
            .cache_size
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |size| {
                Some(size.saturating_sub(by))
            });
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            get_latency_ns: self.get_latency_ns.load(Ordering::Relaxed),
            set_latency_ns: self.set_latency_ns.load(Ordering::Relaxed),
            delete_latency_ns: self.delete_latency_ns.load(Ordering::Relaxed),
            operations: self.operations.load(Ordering::Relaxed),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            consecutive_misses: self.consecutive_misses.load(Ordering::Relaxed),
            cache_size: self.cache_size.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            last_eviction_ms: self.last_eviction_ms.load(Ordering::Relaxed),
            last_operation_ms: self.last_operation_ms.load(Ordering::Relaxed),
        }
    }
}

// == Cache Stats ==
/// Snapshot of [`CacheMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    /// Lookups that found a payload
    pub hits: u64,
    /// Lookups that found nothing
    pub misses: u64,
    /// Entries removed by FIFO eviction
    pub evictions: u64,
    /// Failed operations of any kind
    pub errors: u64,
    pub get_latency_ns: u64,
    pub set_latency_ns: u64,
    pub delete_latency_ns: u64,
    /// Timed operations (get, set, delete)
    pub operations: u64,
    /// Lookups, including failed ones
    pub total_requests: u64,
    /// Lookups that failed on the store side
    pub failed_requests: u64,
    pub consecutive_misses: u64,
    /// Index cardinality last observed
    pub cache_size: u64,
    /// Invalidation notifications received
    pub invalidations: u64,
    /// Unix millis, 0 = never
    pub last_eviction_ms: u64,
    /// Unix millis, 0 = never
    pub last_operation_ms: u64,
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

impl CacheStats {
    // == Hit Rate ==
    /// Returns hits / (hits + misses), or 0.0 if no lookups have completed.
    pub fn hit_rate(&self) -> f64 {
        ratio(self.hits, self.hits + self.misses)
    }

    /// Misses over all lookups.
    pub fn miss_rate(&self) -> f64 {
        ratio(self.misses, self.total_requests)
    }

    /// Errors over all timed operations.
    pub fn error_rate(&self) -> f64 {
        ratio(self.errors, self.operations)
    }

    pub fn average_latency(&self) -> Duration {
        if self.operations == 0 {
            return Duration::ZERO;
        }
        let total = self.get_latency_ns + self.set_latency_ns + self.delete_latency_ns;
        Duration::from_nanos(total / self.operations)
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_new() {
        let stats = CacheMetrics::new().snapshot();
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.misses, 0);
        assert_eq!(stats.evictions, 0);
        assert_eq!(stats.cache_size, 0);
    }

    #[test]
    fn test_hit_rate_no_requests() {
        let stats = CacheMetrics::new().snapshot();
        assert_eq!(stats.hit_rate(), 0.0);
        assert_eq!(stats.miss_rate(), 0.0);
        assert_eq!(stats.error_rate(), 0.0);
        assert_eq!(stats.average_latency(), Duration::ZERO);
    }

    #[test]
    fn test_hit_rate_mixed() {
        let metrics = CacheMetrics::new();
        metrics.record_hit();
        metrics.record_miss();
        assert_eq!(metrics.snapshot().hit_rate(), 0.5);
    }

    #[test]
    fn test_consecutive_misses_reset_on_hit() {
        let metrics = CacheMetrics::new();
        assert_eq!(metrics.record_miss(), 1);
        assert_eq!(metrics.record_miss(), 2);
        assert_eq!(metrics.record_miss(), 3);
        assert_eq!(metrics.snapshot().consecutive_misses, 3);

        metrics.record_hit();
        assert_eq!(metrics.snapshot().consecutive_misses, 0);
    }

    #[test]
    fn test_failed_request_counts_as_error() {
        let metrics = CacheMetrics::new();
        metrics.record_failed_request();
        let stats = metrics.snapshot();
        assert_eq!(stats.total_requests, 1);
        assert_eq!(stats.failed_requests, 1);
        assert_eq!(stats.errors, 1);
    }

    #[test]
    fn test_record_evictions() {
        let metrics = CacheMetrics::new();
        metrics.record_evictions(0);
        assert_eq!(metrics.snapshot().last_eviction_ms, 0);

        metrics.record_evictions(2);
        let stats = metrics.snapshot();
        assert_eq!(stats.evictions, 2);
        assert!(stats.last_eviction_ms > 0);
    }

    #[test]
    fn test_average_latency() {
        let metrics = CacheMetrics::new();
        metrics.record_latency(Operation::Get, Duration::from_millis(10));
        metrics.record_latency(Operation::Set, Duration::from_millis(30));

        let stats = metrics.snapshot();
        assert_eq!(stats.operations, 2);
        assert_eq!(stats.average_latency(), Duration::from_millis(20));
    }

    #[test]
    fn test_size_tracking() {
        let metrics = CacheMetrics::new();
        metrics.set_size(5);
        metrics.reduce_size(2);
        assert_eq!(metrics.snapshot().cache_size, 3);
        metrics.reduce_size(10);
        assert_eq!(metrics.snapshot().cache_size, 0);
    }
}
