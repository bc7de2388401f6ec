//! Request DTOs for the coordination service API
//!
//! Defines the structure of incoming HTTP request bodies.

use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use crate::cache::CacheEntry;
use crate::error::Result;

/// Request body for `PUT /cache/:id`
///
/// # Fields
/// - `value`: Any JSON document, stored as its serialized bytes
/// - `ttl`: Optional TTL in seconds (uses default if not specified)
#[derive(Debug, Clone, Deserialize)]
pub struct SetRequest {
    /// The value to store
    pub value: Value,
    /// Optional TTL in seconds
    #[serde(default)]
    pub ttl: Option<u64>,
}

impl SetRequest {
    /// TTL to pass to the cache; zero selects the cache default.
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl.unwrap_or(0))
    }
}

/// One entry of a warm request.
#[derive(Debug, Clone, Deserialize)]
pub struct WarmEntry {
    pub id: String,
    pub value: Value,
    #[serde(default)]
    pub ttl: Option<u64>,
}

/// Request body for `POST /cache/warm`
#[derive(Debug, Clone, Deserialize)]
pub struct WarmRequest {
    pub entries: Vec<WarmEntry>,
}

impl WarmRequest {
    /// Serializes every value into a cache entry.
    pub fn into_entries(self) -> Result<Vec<CacheEntry>> {
        self.entries
            .into_iter()
            .map(|entry| -> Result<CacheEntry> {
                let built = CacheEntry::from_json(entry.id, &entry.value)?;
                Ok(match entry.ttl.filter(|secs| *secs > 0) {
                    Some(secs) => built.with_ttl(Duration::from_secs(secs)),
                    None => built,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_request_deserialize() {
        let json = r#"{"value": {"name": "ada"}}"#;
        let req: SetRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.value["name"], "ada");
        assert!(req.ttl.is_none());
        assert_eq!(req.ttl(), Duration::ZERO);
    }

    #[test]
    fn test_set_request_with_ttl() {
        let json = r#"{"value": "hello", "ttl": 60}"#;
        let req: SetRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.ttl(), Duration::from_secs(60));
    }

    #[test]
    fn test_warm_request_into_entries() {
        let json = r#"{"entries": [
            {"id": "1", "value": {"a": 1}},
            {"id": "2", "value": [1, 2], "ttl": 30}
        ]}"#;
        let req: WarmRequest = serde_json::from_str(json).unwrap();
        let entries = req.into_entries().unwrap();

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].payload, br#"{"a":1}"#);
        assert!(entries[0].ttl.is_none());
        assert_eq!(entries[1].ttl, Some(Duration::from_secs(30)));
    }
}
