//! Prometheus telemetry sink.
//!
//! Cache and rate-limit counters are cumulative at the source, so each sample
//! is diffed against the previous one and only the increase is added.

use parking_lot::Mutex;
use prometheus::{
    exponential_buckets, register_gauge_with_registry, register_histogram_with_registry,
    register_int_counter_with_registry, register_int_gauge_with_registry, Encoder, Gauge,
    Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry, TextEncoder,
};

use crate::cache::CacheStats;
use crate::counter::RateLimitSnapshot;
use crate::metrics::{MetricsSample, TelemetrySink};

/// Content type of the text exposition format.
pub const TEXT_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

#[derive(Debug, Clone, Default)]
struct Previous {
    cache: CacheStats,
    rate_limit: RateLimitSnapshot,
}

pub struct PrometheusSink {
    registry: Registry,
    hits: IntCounter,
    misses: IntCounter,
    evictions: IntCounter,
    errors: IntCounter,
    operations: IntCounter,
    size: IntGauge,
    hit_ratio: Gauge,
    latency: Histogram,
    allowed: IntCounter,
    denied: IntCounter,
    fail_open: IntCounter,
    previous: Mutex<Previous>,
}

impl std::fmt::Debug for PrometheusSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrometheusSink").finish_non_exhaustive()
    }
}

impl PrometheusSink {
    /// Registers every metric on a fresh registry.
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let hits = register_int_counter_with_registry!(
            Opts::new("cache_hits_total", "Total number of cache hits"),
            registry
        )?;
        let misses = register_int_counter_with_registry!(
            Opts::new("cache_misses_total", "Total number of cache misses"),
            registry
        )?;
        let evictions = register_int_counter_with_registry!(
            Opts::new("cache_evictions_total", "Total number of FIFO evictions"),
            registry
        )?;
        let errors = register_int_counter_with_registry!(
            Opts::new("cache_errors_total", "Total number of failed cache operations"),
            registry
        )?;
        let operations = register_int_counter_with_registry!(
            Opts::new("cache_operations_total", "Total number of timed cache operations"),
            registry
        )?;
        let size = register_int_gauge_with_registry!(
            Opts::new("cache_size", "Entries in the order index"),
            registry
        )?;
        let hit_ratio = register_gauge_with_registry!(
            Opts::new("cache_hit_ratio", "Hits over completed lookups"),
            registry
        )?;
        let latency = register_histogram_with_registry!(
            HistogramOpts::new(
                "cache_operation_latency_seconds",
                "Average cache operation latency per sample interval"
            )
            .buckets(exponential_buckets(0.001, 2.0, 10)?),
            registry
        )?;
        let allowed = register_int_counter_with_registry!(
            Opts::new("ratelimit_allowed_total", "Requests counted and allowed"),
            registry
        )?;
        let denied = register_int_counter_with_registry!(
            Opts::new("ratelimit_denied_total", "Requests denied over the limit"),
            registry
        )?;
        let fail_open = register_int_counter_with_registry!(
            Opts::new(
                "ratelimit_fail_open_total",
                "Requests allowed because the counter was unavailable"
            ),
            registry
        )?;

        Ok(Self {
            registry,
            hits,
            misses,
            evictions,
            errors,
            operations,
            size,
            hit_ratio,
            latency,
            allowed,
            denied,
            fail_open,
            previous: Mutex::new(Previous::default()),
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Renders every registered metric in the text exposition format.
    pub fn encode(&self) -> prometheus::Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

fn delta(current: u64, previous: u64) -> u64 {
    current.saturating_sub(previous)
}

impl TelemetrySink for PrometheusSink {
    fn record(&self, sample: &MetricsSample) {
        let cache = &sample.cache;
        let limits = &sample.rate_limit;
        let mut previous = self.previous.lock();

        self.hits.inc_by(delta(cache.hits, previous.cache.hits));
        self.misses.inc_by(delta(cache.misses, previous.cache.misses));
        self.evictions
            .inc_by(delta(cache.evictions, previous.cache.evictions));
        self.errors.inc_by(delta(cache.errors, previous.cache.errors));

        let ops = delta(cache.operations, previous.cache.operations);
        self.operations.inc_by(ops);
        if ops > 0 {
            let total_ns = |s: &CacheStats| s.get_latency_ns + s.set_latency_ns + s.delete_latency_ns;
            let interval_ns = delta(total_ns(cache), total_ns(&previous.cache));
            self.latency
                .observe(interval_ns as f64 / ops as f64 / 1_000_000_000.0);
        }

        self.size
            .set(i64::try_from(cache.cache_size).unwrap_or(i64::MAX));
        self.hit_ratio.set(cache.hit_rate());

        self.allowed
            .inc_by(delta(limits.allowed, previous.rate_limit.allowed));
        self.denied
            .inc_by(delta(limits.denied, previous.rate_limit.denied));
        self.fail_open
            .inc_by(delta(limits.fail_open, previous.rate_limit.fail_open));

        *previous = Previous {
            cache: cache.clone(),
            rate_limit: *limits,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample(hits: u64, allowed: u64) -> MetricsSample {
        MetricsSample {
            cache: CacheStats {
                hits,
                misses: 1,
                total_requests: hits + 1,
                operations: hits + 1,
                get_latency_ns: (hits + 1) * 2_000_000,
                cache_size: 7,
                ..CacheStats::default()
            },
            rate_limit: RateLimitSnapshot {
                allowed,
                denied: 0,
                fail_open: 0,
            },
            max_entries: 10,
            sampled_at: Utc::now(),
        }
    }

    #[test]
    fn test_repeated_samples_do_not_double_count() {
        let sink = PrometheusSink::new().unwrap();

        sink.record(&sample(4, 2));
        sink.record(&sample(4, 2));
        assert_eq!(sink.hits.get(), 4);
        assert_eq!(sink.allowed.get(), 2);

        sink.record(&sample(9, 5));
        assert_eq!(sink.hits.get(), 9);
        assert_eq!(sink.misses.get(), 1);
        assert_eq!(sink.allowed.get(), 5);
        assert_eq!(sink.size.get(), 7);
    }

    #[test]
    fn test_latency_observed_per_interval() {
        let sink = PrometheusSink::new().unwrap();
        sink.record(&sample(1, 0));
        sink.record(&sample(1, 0));
        // second sample had no new operations
        assert_eq!(sink.latency.get_sample_count(), 1);
        assert!((sink.latency.get_sample_sum() - 0.002).abs() < 1e-9);
    }

    #[test]
    fn test_encode_contains_metric_names() {
        let sink = PrometheusSink::new().unwrap();
        sink.record(&sample(3, 1));

        let text = sink.encode().unwrap();
        for name in [
            "cache_hits_total 3",
            "cache_size 7",
            "cache_hit_ratio",
            "cache_operation_latency_seconds_bucket",
            "ratelimit_allowed_total 1",
            "ratelimit_fail_open_total 0",
        ] {
            assert!(text.contains(name), "missing {} in\n{}", name, text);
        }
    }
}
