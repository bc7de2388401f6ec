//! Counter Module
//!
//! Renewing-window request counter coordinated through the shared store, and
//! the rate-limit policy built on top of it.

mod limiter;
mod window;

pub use limiter::{Decision, RateLimitSnapshot, RateLimitStats, RateLimiter};
pub use window::{IncrementOutcome, SlidingWindowCounter};
