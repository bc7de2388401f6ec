//! Error types for the coordination layer
//!
//! Provides unified error handling using thiserror.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::store::StoreError;

// == Coordination Error Enum ==
/// Unified error type for the cache and counter subsystems.
///
/// A cache miss is never an error: lookups return `Ok(None)`.
#[derive(Error, Debug)]
pub enum CoordError {
    /// Transport or connectivity failure talking to the shared store.
    /// Always recoverable; callers degrade instead of failing the request.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// The store rejected a command or answered with an unexpected reply.
    /// Retrying the same command will not help.
    #[error("Store command failed: {0}")]
    StoreCommand(String),

    /// Payload could not be encoded or decoded. Never retried.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Counter increment lost the optimistic lock on every attempt
    #[error("Optimistic lock exhausted for '{key}' after {attempts} attempts")]
    OptimisticLockExhausted { key: String, attempts: u32 },

    /// Invalid request data
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Identifier not present (HTTP surface only)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl CoordError {
    /// True for failures the caller is expected to absorb (treat as miss,
    /// let the request through).
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CoordError::StoreUnavailable(_) | CoordError::OptimisticLockExhausted { .. }
        )
    }
}

impl From<StoreError> for CoordError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Connection(_) | StoreError::Timeout(_) => {
                CoordError::StoreUnavailable(err.to_string())
            }
            StoreError::Command(_) | StoreError::UnexpectedReply(_) => {
                CoordError::StoreCommand(err.to_string())
            }
        }
    }
}

impl From<serde_json::Error> for CoordError {
    fn from(err: serde_json::Error) -> Self {
        CoordError::Serialization(err.to_string())
    }
}

// == IntoResponse Implementation ==
impl IntoResponse for CoordError {
    fn into_response(self) -> Response {
        let status = match &self {
            CoordError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            CoordError::StoreCommand(_) => StatusCode::INTERNAL_SERVER_ERROR,
            CoordError::Serialization(_) => StatusCode::UNPROCESSABLE_ENTITY,
            CoordError::OptimisticLockExhausted { .. } => StatusCode::CONFLICT,
            CoordError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            CoordError::NotFound(_) => StatusCode::NOT_FOUND,
            CoordError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(json!({
            "error": self.to_string()
        }));

        (status, body).into_response()
    }
}

// == Result Type Alias ==
/// Convenience Result type for the coordination layer.
pub type Result<T> = std::result::Result<T, CoordError>;
