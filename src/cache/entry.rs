//! Cache Entry Module
//!
//! Defines an entry handed to the cache for bulk loading, and the identifier
//! and payload limits every write is checked against.

use std::time::Duration;

use serde::Serialize;

use crate::cache::{MAX_ID_LENGTH, MAX_PAYLOAD_SIZE};
use crate::error::{CoordError, Result};

// == Cache Entry ==
/// An identifier with its serialized payload.
///
/// The cache never looks inside `payload`; the insertion timestamp that
/// orders eviction is assigned by the cache when the entry is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// Externally assigned identifier
    pub id: String,
    /// Opaque payload bytes
    pub payload: Vec<u8>,
    /// TTL override, None = cache default
    pub ttl: Option<Duration>,
}

impl CacheEntry {
    // == Constructor ==
    /// Creates an entry that will use the cache's default TTL.
    pub fn new(id: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id: id.into(),
            payload: payload.into(),
            ttl: None,
        }
    }

    /// Sets an explicit TTL for this entry.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Serializes `value` as JSON into a new entry.
    pub fn from_json<T: Serialize>(id: impl Into<String>, value: &T) -> Result<Self> {
        Ok(Self::new(id, serde_json::to_vec(value)?))
    }

    // == Validate ==
    /// Checks identifier and payload limits.
    pub fn validate(&self) -> Result<()> {
        validate_id(&self.id)?;
        validate_payload(&self.payload)
    }
}

/// Rejects empty or oversized identifiers.
pub fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(CoordError::InvalidRequest(
            "Identifier cannot be empty".to_string(),
        ));
    }
    if id.len() > MAX_ID_LENGTH {
        return Err(CoordError::InvalidRequest(format!(
            "Identifier exceeds maximum length of {} bytes",
            MAX_ID_LENGTH
        )));
    }
    Ok(())
}

/// Rejects payloads above the size limit.
pub fn validate_payload(payload: &[u8]) -> Result<()> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(CoordError::InvalidRequest(format!(
            "Payload exceeds maximum size of {} bytes",
            MAX_PAYLOAD_SIZE
        )));
    }
    Ok(())
}
