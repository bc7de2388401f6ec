//! API Module
//!
//! HTTP handlers, middleware and routing for the coordination service.
//!
//! # Endpoints
//! - `GET /cache/:id` - Retrieve an entry
//! - `PUT /cache/:id` - Store an entry
//! - `DELETE /cache/:id` - Delete an entry and invalidate it on every replica
//! - `POST /cache/warm` - Bulk load entries
//! - `GET /stats` - Cache and rate-limit statistics
//! - `GET /health` - Store connectivity check
//! - `GET /metrics` - Prometheus text exposition

pub mod handlers;
pub mod middleware;
pub mod routes;

pub use handlers::*;
pub use middleware::{client_key, rate_limit_middleware};
pub use routes::create_router;
