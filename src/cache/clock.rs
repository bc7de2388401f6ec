//! Insertion timestamps for the FIFO order index.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;

/// Strictly increasing wall-clock microseconds.
///
/// Scores are stored as `f64`; microseconds since the epoch stay well below
/// 2^53, so every value is represented exactly and two calls in this process
/// never produce the same score.
#[derive(Debug)]
pub struct MonotonicClock {
    last: AtomicU64,
}

static PROCESS_CLOCK: MonotonicClock = MonotonicClock::new();

impl MonotonicClock {
    pub const fn new() -> Self {
        Self {
            last: AtomicU64::new(0),
        }
    }

    /// Clock shared by every cache in this process.
    pub fn process() -> &'static MonotonicClock {
        &PROCESS_CLOCK
    }

    /// Next timestamp: the current time, or one past the previous value if
    /// the wall clock has not moved (or went backwards).
    pub fn next(&self) -> u64 {
        let now = Utc::now().timestamp_micros().max(0) as u64;
        let mut prev = self.last.load(Ordering::Relaxed);
        loop {
            let candidate = now.max(prev + 1);
            match self
                .last
                .compare_exchange_weak(prev, candidate, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return candidate,
                Err(actual) => prev = actual,
            }
        }
    }

    pub fn next_score(&self) -> f64 {
        self.next() as f64
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}
