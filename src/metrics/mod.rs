//! Metrics Module
//!
//! Sampling types, alert rules and the telemetry sink seam. Sampling only
//! reads counters; nothing here mutates cache or counter state.

mod exporter;

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::cache::CacheStats;
use crate::counter::RateLimitSnapshot;

pub use exporter::{PrometheusSink, TEXT_CONTENT_TYPE};

// == Sample ==
/// Everything the monitor reads on one tick.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSample {
    pub cache: CacheStats,
    pub rate_limit: RateLimitSnapshot,
    /// Configured FIFO bound, for the size alert
    pub max_entries: u64,
    pub sampled_at: DateTime<Utc>,
}

// == Telemetry Sink ==
/// Destination for periodic samples.
pub trait TelemetrySink: Send + Sync + 'static {
    fn record(&self, sample: &MetricsSample);
}

// == Alerts ==
/// Limits above which the monitor raises an alert.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertThresholds {
    pub error_rate: f64,
    pub average_latency: Duration,
    pub miss_rate: f64,
    pub consecutive_misses: u64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            error_rate: 0.10,
            average_latency: Duration::from_millis(20),
            miss_rate: 0.50,
            consecutive_misses: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Alert {
    HighErrorRate(f64),
    HighLatency(Duration),
    HighMissRate(f64),
    ConsecutiveMisses(u64),
    SizeExceeded { size: u64, max: u64 },
}

impl Alert {
    /// Stable identifier used as a log field.
    pub fn kind(&self) -> &'static str {
        match self {
            Alert::HighErrorRate(_) => "high_error_rate",
            Alert::HighLatency(_) => "high_latency",
            Alert::HighMissRate(_) => "high_miss_rate",
            Alert::ConsecutiveMisses(_) => "consecutive_misses",
            Alert::SizeExceeded { .. } => "size_exceeded",
        }
    }
}

impl fmt::Display for Alert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Alert::HighErrorRate(rate) => write!(f, "high error rate: {:.2}%", rate * 100.0),
            Alert::HighLatency(avg) => write!(f, "high average latency: {:?}", avg),
            Alert::HighMissRate(rate) => write!(f, "high miss rate: {:.2}%", rate * 100.0),
            Alert::ConsecutiveMisses(n) => write!(f, "{} consecutive cache misses", n),
            Alert::SizeExceeded { size, max } => {
                write!(f, "cache size {} exceeds maximum {}", size, max)
            }
        }
    }
}

/// Alerts triggered by `sample`, in a fixed order.
pub fn evaluate_alerts(sample: &MetricsSample, thresholds: &AlertThresholds) -> Vec<Alert> {
    let stats = &sample.cache;
    let mut alerts = Vec::new();

    let error_rate = stats.error_rate();
    if error_rate > thresholds.error_rate {
        alerts.push(Alert::HighErrorRate(error_rate));
    }
    let latency = stats.average_latency();
    if latency > thresholds.average_latency {
        alerts.push(Alert::HighLatency(latency));
    }
    let miss_rate = stats.miss_rate();
    if miss_rate > thresholds.miss_rate {
        alerts.push(Alert::HighMissRate(miss_rate));
    }
    if stats.consecutive_misses > thresholds.consecutive_misses {
        alerts.push(Alert::ConsecutiveMisses(stats.consecutive_misses));
    }
    if stats.cache_size > sample.max_entries {
        alerts.push(Alert::SizeExceeded {
            size: stats.cache_size,
            max: sample.max_entries,
        });
    }
    alerts
}
