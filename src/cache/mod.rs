//! Cache Module
//!
//! Store-backed cache with a global FIFO bound, shared by every replica, and
//! cross-replica invalidation over pattern pub/sub.

mod bounded;
mod clock;
mod entry;
mod invalidation;
mod keys;
mod stats;

#[cfg(test)]
mod property_tests;

// Re-export public types
pub use bounded::BoundedCache;
pub use clock::MonotonicClock;
pub use entry::{validate_id, validate_payload, CacheEntry};
pub use keys::{CacheKeys, INVALIDATE_PAYLOAD};
pub use stats::{CacheMetrics, CacheStats, Operation};

// == Public Constants ==
/// Maximum allowed identifier length in bytes
pub const MAX_ID_LENGTH: usize = 256;

/// Maximum allowed payload size in bytes
pub const MAX_PAYLOAD_SIZE: usize = 1024 * 1024; // 1 MB
