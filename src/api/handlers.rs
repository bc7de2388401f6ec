//! API Handlers
//!
//! HTTP request handlers for each coordination service endpoint.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use tracing::warn;

use crate::cache::BoundedCache;
use crate::config::Config;
use crate::counter::RateLimiter;
use crate::error::{CoordError, Result};
use crate::metrics::{PrometheusSink, TEXT_CONTENT_TYPE};
use crate::models::{
    DeleteResponse, GetResponse, HealthResponse, SetRequest, SetResponse, StatsResponse,
    WarmRequest, WarmResponse,
};
use crate::store::{with_timeout, CoordinationStore};

/// Application state shared across all handlers.
pub struct AppState<S: CoordinationStore> {
    pub cache: Arc<BoundedCache<S>>,
    pub limiter: Arc<RateLimiter<S>>,
    pub sink: Arc<PrometheusSink>,
}

impl<S: CoordinationStore> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
            limiter: self.limiter.clone(),
            sink: self.sink.clone(),
        }
    }
}

impl<S: CoordinationStore> AppState<S> {
    pub fn new(
        cache: Arc<BoundedCache<S>>,
        limiter: Arc<RateLimiter<S>>,
        sink: Arc<PrometheusSink>,
    ) -> Self {
        Self {
            cache,
            limiter,
            sink,
        }
    }

    /// Builds the cache and limiter over `store` from configuration.
    ///
    /// Starts the cache's invalidation subscriber.
    pub async fn from_config(store: Arc<S>, config: &Config) -> Result<Self> {
        let cache = BoundedCache::start(store.clone(), config.cache()).await?;
        let limiter = RateLimiter::new(store, config.counter(), config.limiter());
        let sink = PrometheusSink::new()
            .map_err(|err| CoordError::Config(format!("metrics registry: {}", err)))?;
        Ok(Self::new(Arc::new(cache), Arc::new(limiter), Arc::new(sink)))
    }
}

/// Handler for `GET /cache/:id`
///
/// A store failure degrades to a miss.
pub async fn get_handler<S: CoordinationStore>(
    State(state): State<AppState<S>>,
    Path(id): Path<String>,
) -> Result<Json<GetResponse>> {
    let value = match state.cache.get_json::<serde_json::Value>(&id).await {
        Ok(value) => value,
        Err(err) if err.is_recoverable() => {
            warn!(id = %id, error = %err, "serving miss while store is unavailable");
            None
        }
        Err(err) => return Err(err),
    };

    value
        .map(|value| Json(GetResponse::new(id.clone(), value)))
        .ok_or_else(|| CoordError::NotFound(format!("Entry '{}' not found", id)))
}

/// Handler for `PUT /cache/:id`
pub async fn set_handler<S: CoordinationStore>(
    State(state): State<AppState<S>>,
    Path(id): Path<String>,
    Json(req): Json<SetRequest>,
) -> Result<Json<SetResponse>> {
    state.cache.set_json(&id, &req.value, req.ttl()).await?;
    Ok(Json(SetResponse::new(id)))
}

/// Handler for `DELETE /cache/:id`
///
/// Deleting an absent identifier still broadcasts the invalidation.
pub async fn delete_handler<S: CoordinationStore>(
    State(state): State<AppState<S>>,
    Path(id): Path<String>,
) -> Result<Json<DeleteResponse>> {
    let existed = state.cache.delete(&id).await?;
    Ok(Json(DeleteResponse::new(id, existed)))
}

/// Handler for `POST /cache/warm`
pub async fn warm_handler<S: CoordinationStore>(
    State(state): State<AppState<S>>,
    Json(req): Json<WarmRequest>,
) -> Result<Json<WarmResponse>> {
    let entries = req.into_entries()?;
    let loaded = entries.len();
    let evicted = state.cache.warm(entries).await?;
    Ok(Json(WarmResponse { loaded, evicted }))
}

/// Handler for `GET /stats`
pub async fn stats_handler<S: CoordinationStore>(
    State(state): State<AppState<S>>,
) -> Json<StatsResponse> {
    let stats = state.cache.stats();
    Json(StatsResponse::new(
        &stats,
        state.cache.config().max_entries,
        state.limiter.stats().snapshot(),
    ))
}

/// Handler for `GET /health`
///
/// Pings the store; answers 503 with `degraded` when it does not respond.
pub async fn health_handler<S: CoordinationStore>(State(state): State<AppState<S>>) -> Response {
    let timeout = state.cache.config().op_timeout;
    let store_up = match with_timeout(timeout, state.cache.store().ping()).await {
        Ok(()) => true,
        Err(err) => {
            warn!(error = %err, "health check: store ping failed");
            false
        }
    };

    let body = HealthResponse::new(store_up);
    let status = if body.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body)).into_response()
}

/// Handler for `GET /metrics`
pub async fn metrics_handler<S: CoordinationStore>(State(state): State<AppState<S>>) -> Response {
    match state.sink.encode() {
        Ok(text) => ([(header::CONTENT_TYPE, TEXT_CONTENT_TYPE)], text).into_response(),
        Err(err) => {
            warn!(error = %err, "failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
