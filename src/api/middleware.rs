//! HTTP Rate Limiting Middleware
//!
//! Applies the [`RateLimiter`](crate::counter::RateLimiter) to every request
//! and attaches the quota headers to the response.

use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use tracing::{debug, warn};

use crate::api::AppState;
use crate::counter::Decision;
use crate::models::ErrorResponse;
use crate::store::CoordinationStore;

const FORWARDED_FOR: &str = "x-forwarded-for";

/// Client key: first `X-Forwarded-For` entry, else the peer address.
pub fn client_key(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    headers
        .get(FORWARDED_FOR)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}

fn apply_headers(headers: &mut HeaderMap, decision: &Decision, prefix: &str) {
    for (name, value) in decision.headers(prefix) {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => warn!(header = %name, "skipping invalid rate limit header"),
        }
    }
}

/// Axum middleware enforcing the per-client limit.
pub async fn rate_limit_middleware<S: CoordinationStore>(
    State(state): State<AppState<S>>,
    request: Request,
    next: Next,
) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    let client = client_key(request.headers(), peer);

    let decision = state.limiter.check(&client).await;
    let prefix = state.limiter.config().header_prefix.as_str();

    let mut response = if decision.is_allowed() {
        next.run(request).await
    } else {
        debug!(client = %client, "request denied by rate limit");
        (
            StatusCode::TOO_MANY_REQUESTS,
            Json(ErrorResponse::new("Rate limit exceeded")),
        )
            .into_response()
    };
    apply_headers(response.headers_mut(), &decision, prefix);
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_client_key_prefers_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert(
            FORWARDED_FOR,
            HeaderValue::from_static("10.0.0.5, 172.16.0.1"),
        );
        let peer: SocketAddr = "192.168.1.1:4000".parse().unwrap();
        assert_eq!(client_key(&headers, Some(peer)), "10.0.0.5");
    }

    #[test]
    fn test_client_key_falls_back_to_peer() {
        let peer: SocketAddr = "192.168.1.1:4000".parse().unwrap();
        assert_eq!(client_key(&HeaderMap::new(), Some(peer)), "192.168.1.1");
        assert_eq!(client_key(&HeaderMap::new(), None), "unknown");
    }

    #[test]
    fn test_apply_headers() {
        let mut headers = HeaderMap::new();
        let decision = Decision::Denied {
            limit: 100,
            reset_at: 1_700_000_000,
            retry_after: Duration::from_secs(60),
        };
        apply_headers(&mut headers, &decision, "X-RateLimit-");

        assert_eq!(headers["x-ratelimit-limit"], "100");
        assert_eq!(headers["x-ratelimit-remaining"], "0");
        assert_eq!(headers["retry-after"], "60");
    }
}
