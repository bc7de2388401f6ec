//! API Routes
//!
//! Configures the Axum router with all coordination service endpoints.

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use super::handlers::{
    delete_handler, get_handler, health_handler, metrics_handler, set_handler, stats_handler,
    warm_handler, AppState,
};
use super::middleware::rate_limit_middleware;
use crate::store::CoordinationStore;

/// Creates the main router with all endpoints configured.
///
/// # Middleware
/// - Rate limiting: per client, applied to every route
/// - CORS: Allows any origin (configurable for production)
/// - Tracing: Logs all requests for debugging
pub fn create_router<S: CoordinationStore>(state: AppState<S>) -> Router {
    // Configure CORS middleware
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/cache/warm", post(warm_handler::<S>))
        .route(
            "/cache/:id",
            get(get_handler::<S>)
                .put(set_handler::<S>)
                .delete(delete_handler::<S>),
        )
        .route("/stats", get(stats_handler::<S>))
        .route("/health", get(health_handler::<S>))
        .route("/metrics", get(metrics_handler::<S>))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit_middleware::<S>,
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
