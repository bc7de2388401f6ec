//! Coord Cache - store-coordinated state for stateless replicas
//!
//! Provides a FIFO-bounded cache with cross-replica invalidation and a
//! renewing-window rate limiter, both coordinated through a shared store.

pub mod api;
pub mod cache;
pub mod config;
pub mod counter;
pub mod error;
pub mod metrics;
pub mod models;
pub mod store;
pub mod tasks;

pub use api::AppState;
pub use cache::BoundedCache;
pub use config::Config;
pub use counter::{RateLimiter, SlidingWindowCounter};
pub use error::{CoordError, Result};
pub use store::{CoordinationStore, MemoryStore, RedisStore};
