//! Response DTOs for the coordination service API
//!
//! Defines the structure of outgoing HTTP response bodies.

use serde::Serialize;
use serde_json::Value;

use crate::cache::CacheStats;
use crate::counter::RateLimitSnapshot;

/// Response body for `GET /cache/:id`
#[derive(Debug, Clone, Serialize)]
pub struct GetResponse {
    /// The requested identifier
    pub id: String,
    /// The stored value
    pub value: Value,
}

impl GetResponse {
    pub fn new(id: impl Into<String>, value: Value) -> Self {
        Self {
            id: id.into(),
            value,
        }
    }
}

/// Response body for `PUT /cache/:id`
#[derive(Debug, Clone, Serialize)]
pub struct SetResponse {
    /// Success message
    pub message: String,
    /// The identifier that was set
    pub id: String,
}

impl SetResponse {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            message: format!("Entry '{}' set successfully", id),
            id,
        }
    }
}

/// Response body for `DELETE /cache/:id`
#[derive(Debug, Clone, Serialize)]
pub struct DeleteResponse {
    /// Success message
    pub message: String,
    /// The identifier that was deleted
    pub id: String,
    /// Whether a payload was present
    pub existed: bool,
}

impl DeleteResponse {
    pub fn new(id: impl Into<String>, existed: bool) -> Self {
        let id = id.into();
        Self {
            message: format!("Entry '{}' invalidated", id),
            id,
            existed,
        }
    }
}

/// Response body for `POST /cache/warm`
#[derive(Debug, Clone, Serialize)]
pub struct WarmResponse {
    pub loaded: usize,
    pub evicted: u64,
}

/// Response body for the stats endpoint (`GET /stats`)
#[derive(Debug, Clone, Serialize)]
pub struct StatsResponse {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub errors: u64,
    pub invalidations: u64,
    /// Index cardinality last observed by this replica
    pub cache_size: u64,
    pub max_entries: u64,
    pub hit_rate: f64,
    pub miss_rate: f64,
    pub error_rate: f64,
    pub average_latency_ms: f64,
    pub rate_limit: RateLimitSnapshot,
}

impl StatsResponse {
    pub fn new(stats: &CacheStats, max_entries: u64, rate_limit: RateLimitSnapshot) -> Self {
        Self {
            hits: stats.hits,
            misses: stats.misses,
            evictions: stats.evictions,
            errors: stats.errors,
            invalidations: stats.invalidations,
            cache_size: stats.cache_size,
            max_entries,
            hit_rate: stats.hit_rate(),
            miss_rate: stats.miss_rate(),
            error_rate: stats.error_rate(),
            average_latency_ms: stats.average_latency().as_secs_f64() * 1000.0,
            rate_limit,
        }
    }
}

/// Response body for the health endpoint (`GET /health`)
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// `healthy` or `degraded`
    pub status: String,
    /// `up` or `down`
    pub store: String,
    /// Current timestamp in ISO 8601 format
    pub timestamp: String,
}

impl HealthResponse {
    pub fn new(store_up: bool) -> Self {
        let (status, store) = if store_up {
            ("healthy", "up")
        } else {
            ("degraded", "down")
        };
        Self {
            status: status.to_string(),
            store: store.to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

/// Error response body for all error conditions
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    /// Error message describing what went wrong
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_get_response_serialize() {
        let resp = GetResponse::new("42", json!({"name": "ada"}));
        let json = serde_json::to_string(&resp).unwrap();
        assert_eq!(json, r#"{"id":"42","value":{"name":"ada"}}"#);
    }

    #[test]
    fn test_delete_response_serialize() {
        let resp = DeleteResponse::new("7", true);
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains(r#""id":"7""#));
        assert!(json.contains(r#""existed":true"#));
    }

    #[test]
    fn test_stats_response_rates() {
        let stats = CacheStats {
            hits: 80,
            misses: 20,
            total_requests: 100,
            ..CacheStats::default()
        };
        let resp = StatsResponse::new(&stats, 10, RateLimitSnapshot::default());
        assert!((resp.hit_rate - 0.8).abs() < 0.001);
        assert!((resp.miss_rate - 0.2).abs() < 0.001);
        assert_eq!(resp.error_rate, 0.0);
    }

    #[test]
    fn test_health_response() {
        assert!(HealthResponse::new(true).is_healthy());
        let degraded = HealthResponse::new(false);
        assert_eq!(degraded.status, "degraded");
        assert_eq!(degraded.store, "down");
    }

    #[test]
    fn test_error_response_serialize() {
        let resp = ErrorResponse::new("Something went wrong");
        let json = serde_json::to_string(&resp).unwrap();
        assert_eq!(json, r#"{"error":"Something went wrong"}"#);
    }
}
