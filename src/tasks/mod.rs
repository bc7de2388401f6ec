//! Background Tasks Module
//!
//! Long-lived tasks that run periodically during server operation. Each one
//! is bound to a `CancellationToken` and exits promptly once it is cancelled.
//!
//! # Tasks
//! - Index sweep: drops order index entries whose payload has expired
//! - Monitor: samples cache and rate-limit counters into a telemetry sink

mod index_sweep;
mod monitor;

pub use index_sweep::spawn_index_sweep_task;
pub use monitor::{spawn_monitor_task, Monitor};
