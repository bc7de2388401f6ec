//! Configuration Module
//!
//! Handles loading and managing service configuration from environment variables.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::error::{CoordError, Result};

/// Which store backend the process coordinates through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Redis,
    Memory,
}

impl FromStr for StoreBackend {
    type Err = CoordError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "redis" => Ok(StoreBackend::Redis),
            "memory" => Ok(StoreBackend::Memory),
            other => Err(CoordError::Config(format!(
                "unknown store backend '{}'",
                other
            ))),
        }
    }
}

/// Service configuration parameters.
///
/// All values can be configured via environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// Store backend (`redis` or `memory`)
    pub store_backend: StoreBackend,
    /// Store connection URL
    pub redis_url: String,
    /// Timeout applied to every store call, in milliseconds
    pub store_timeout_ms: u64,
    /// Dedicated connections kept for `WATCH` sessions
    pub store_watch_pool: u64,
    /// Maximum number of cached entries before FIFO eviction
    pub cache_max_entries: u64,
    /// Default TTL in seconds for entries set without one
    pub cache_default_ttl: u64,
    /// Prefix for payload keys
    pub cache_key_prefix: String,
    /// Sorted set holding insertion order
    pub cache_order_key: String,
    /// Prefix for invalidation channels
    pub invalidation_prefix: String,
    /// Stale index sweep interval in seconds
    pub index_sweep_interval: u64,
    /// Requests allowed per window
    pub rate_limit_requests: u64,
    /// Rate limit window in seconds
    pub rate_limit_window_secs: u64,
    /// Prefix for rate counter keys
    pub rate_limit_key_prefix: String,
    /// Prefix for rate limit response headers
    pub rate_limit_header_prefix: String,
    /// Metrics sampling interval in seconds
    pub metrics_interval_secs: u64,
    /// HTTP server port
    pub server_port: u16,
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(raw) => parse_or(name, &raw, default),
        Err(_) => default,
    }
}

/// Parses `raw`, keeping `default` (with a warning) when it is malformed.
fn parse_or<T: FromStr>(name: &str, raw: &str, default: T) -> T {
    match raw.trim().parse() {
        Ok(value) => value,
        Err(_) => {
            warn!(variable = name, value = raw, "ignoring malformed value, using default");
            default
        }
    }
}

fn env_string(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

impl Config {
    /// Creates a new Config by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `STORE_BACKEND` - `redis` or `memory` (default: redis)
    /// - `REDIS_URL` - store URL (default: redis://127.0.0.1:6379)
    /// - `STORE_TIMEOUT_MS` - per-call timeout (default: 500)
    /// - `STORE_WATCH_POOL` - dedicated `WATCH` connections (default: 16)
    /// - `CACHE_MAX_ENTRIES` - FIFO bound (default: 10)
    /// - `CACHE_DEFAULT_TTL` - default TTL in seconds (default: 3600)
    /// - `CACHE_KEY_PREFIX` - payload key prefix (default: profile:)
    /// - `CACHE_ORDER_KEY` - order index key (default: profile:order)
    /// - `INVALIDATION_PREFIX` - invalidation channel prefix (default: invalidation:)
    /// - `INDEX_SWEEP_INTERVAL` - stale index sweep in seconds (default: 300)
    /// - `RATE_LIMIT_REQUESTS` - requests per window (default: 100)
    /// - `RATE_LIMIT_WINDOW_SECS` - window length (default: 60)
    /// - `RATE_LIMIT_KEY_PREFIX` - counter key prefix (default: ratelimit:)
    /// - `RATE_LIMIT_HEADER_PREFIX` - header prefix (default: X-RateLimit-)
    /// - `METRICS_INTERVAL_SECS` - sampler interval (default: 5)
    /// - `SERVER_PORT` - HTTP server port (default: 3000)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            store_backend: env_or("STORE_BACKEND", defaults.store_backend),
            redis_url: env_string("REDIS_URL", &defaults.redis_url),
            store_timeout_ms: env_or("STORE_TIMEOUT_MS", defaults.store_timeout_ms),
            store_watch_pool: env_or("STORE_WATCH_POOL", defaults.store_watch_pool),
            cache_max_entries: env_or("CACHE_MAX_ENTRIES", defaults.cache_max_entries),
            cache_default_ttl: env_or("CACHE_DEFAULT_TTL", defaults.cache_default_ttl),
            cache_key_prefix: env_string("CACHE_KEY_PREFIX", &defaults.cache_key_prefix),
            cache_order_key: env_string("CACHE_ORDER_KEY", &defaults.cache_order_key),
            invalidation_prefix: env_string("INVALIDATION_PREFIX", &defaults.invalidation_prefix),
            index_sweep_interval: env_or("INDEX_SWEEP_INTERVAL", defaults.index_sweep_interval),
            rate_limit_requests: env_or("RATE_LIMIT_REQUESTS", defaults.rate_limit_requests),
            rate_limit_window_secs: env_or(
                "RATE_LIMIT_WINDOW_SECS",
                defaults.rate_limit_window_secs,
            ),
            rate_limit_key_prefix: env_string(
                "RATE_LIMIT_KEY_PREFIX",
                &defaults.rate_limit_key_prefix,
            ),
            rate_limit_header_prefix: env_string(
                "RATE_LIMIT_HEADER_PREFIX",
                &defaults.rate_limit_header_prefix,
            ),
            metrics_interval_secs: env_or("METRICS_INTERVAL_SECS", defaults.metrics_interval_secs),
            server_port: env_or("SERVER_PORT", defaults.server_port),
        }
    }

    /// Checks the values that would otherwise fail at runtime.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("STORE_TIMEOUT_MS", self.store_timeout_ms),
            ("STORE_WATCH_POOL", self.store_watch_pool),
            ("CACHE_MAX_ENTRIES", self.cache_max_entries),
            ("CACHE_DEFAULT_TTL", self.cache_default_ttl),
            ("INDEX_SWEEP_INTERVAL", self.index_sweep_interval),
            ("RATE_LIMIT_REQUESTS", self.rate_limit_requests),
            ("RATE_LIMIT_WINDOW_SECS", self.rate_limit_window_secs),
            ("METRICS_INTERVAL_SECS", self.metrics_interval_secs),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(CoordError::Config(format!("{} must be positive", name)));
            }
        }

        let required = [
            ("REDIS_URL", &self.redis_url),
            ("CACHE_KEY_PREFIX", &self.cache_key_prefix),
            ("CACHE_ORDER_KEY", &self.cache_order_key),
            ("INVALIDATION_PREFIX", &self.invalidation_prefix),
        ];
        for (name, value) in required {
            if value.is_empty() {
                return Err(CoordError::Config(format!("{} is required", name)));
            }
        }
        Ok(())
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn cache(&self) -> CacheConfig {
        CacheConfig {
            max_entries: self.cache_max_entries,
            default_ttl: Duration::from_secs(self.cache_default_ttl),
            key_prefix: self.cache_key_prefix.clone(),
            order_key: self.cache_order_key.clone(),
            invalidation_prefix: self.invalidation_prefix.clone(),
            op_timeout: self.store_timeout(),
        }
    }

    pub fn counter(&self) -> CounterConfig {
        CounterConfig {
            key_prefix: self.rate_limit_key_prefix.clone(),
            op_timeout: self.store_timeout(),
            ..CounterConfig::default()
        }
    }

    pub fn limiter(&self) -> LimiterConfig {
        LimiterConfig {
            limit: self.rate_limit_requests,
            window: Duration::from_secs(self.rate_limit_window_secs),
            header_prefix: self.rate_limit_header_prefix.clone(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_backend: StoreBackend::Redis,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            store_timeout_ms: 500,
            store_watch_pool: 16,
            cache_max_entries: 10,
            cache_default_ttl: 3600,
            cache_key_prefix: "profile:".to_string(),
            cache_order_key: "profile:order".to_string(),
            invalidation_prefix: "invalidation:".to_string(),
            index_sweep_interval: 300,
            rate_limit_requests: 100,
            rate_limit_window_secs: 60,
            rate_limit_key_prefix: "ratelimit:".to_string(),
            rate_limit_header_prefix: "X-RateLimit-".to_string(),
            metrics_interval_secs: 5,
            server_port: 3000,
        }
    }
}

// == Sub-configs ==
/// Settings for one [`BoundedCache`](crate::cache::BoundedCache) namespace.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub max_entries: u64,
    pub default_ttl: Duration,
    pub key_prefix: String,
    pub order_key: String,
    pub invalidation_prefix: String,
    pub op_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Config::default().cache()
    }
}

/// Settings for the [`SlidingWindowCounter`](crate::counter::SlidingWindowCounter).
#[derive(Debug, Clone)]
pub struct CounterConfig {
    pub key_prefix: String,
    pub op_timeout: Duration,
    /// Attempts of the watch/read/write cycle before giving up
    pub max_attempts: u32,
}

impl Default for CounterConfig {
    fn default() -> Self {
        Self {
            key_prefix: "ratelimit:".to_string(),
            op_timeout: Duration::from_millis(500),
            max_attempts: 3,
        }
    }
}

/// Rate-limit policy applied per client.
#[derive(Debug, Clone)]
pub struct LimiterConfig {
    pub limit: u64,
    pub window: Duration,
    pub header_prefix: String,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Config::default().limiter()
    }
}
