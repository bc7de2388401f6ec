//! Coordination Monitor Task
//!
//! Samples cache and rate-limit counters on a fixed interval, forwards each
//! sample to a [`TelemetrySink`] and logs threshold alerts.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::CacheMetrics;
use crate::counter::RateLimitStats;
use crate::metrics::{evaluate_alerts, Alert, AlertThresholds, MetricsSample, TelemetrySink};

/// Read-only view over the counters being sampled.
pub struct Monitor {
    cache: Arc<CacheMetrics>,
    rate_limit: Arc<RateLimitStats>,
    max_entries: u64,
    sink: Arc<dyn TelemetrySink>,
    thresholds: AlertThresholds,
}

impl Monitor {
    pub fn new(
        cache: Arc<CacheMetrics>,
        rate_limit: Arc<RateLimitStats>,
        max_entries: u64,
        sink: Arc<dyn TelemetrySink>,
    ) -> Self {
        Self {
            cache,
            rate_limit,
            max_entries,
            sink,
            thresholds: AlertThresholds::default(),
        }
    }

    pub fn with_thresholds(mut self, thresholds: AlertThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn sample(&self) -> MetricsSample {
        MetricsSample {
            cache: self.cache.snapshot(),
            rate_limit: self.rate_limit.snapshot(),
            max_entries: self.max_entries,
            sampled_at: Utc::now(),
        }
    }

    /// Takes one sample, exports it and returns the alerts it raised.
    pub fn tick(&self) -> Vec<Alert> {
        let sample = self.sample();
        self.sink.record(&sample);

        let alerts = evaluate_alerts(&sample, &self.thresholds);
        for alert in &alerts {
            warn!(target: "coord_cache::alert", kind = alert.kind(), "{}", alert);
        }
        debug!(
            hits = sample.cache.hits,
            misses = sample.cache.misses,
            size = sample.cache.cache_size,
            hit_rate = sample.cache.hit_rate(),
            alerts = alerts.len(),
            "metrics sampled"
        );
        alerts
    }
}

/// Spawns the sampling loop. Stops within one tick of `shutdown`.
pub fn spawn_monitor_task(
    monitor: Monitor,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(interval_secs = interval.as_secs(), "starting metrics monitor");

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    monitor.tick();
                }
            }
        }

        debug!("metrics monitor stopped");
    })
}
