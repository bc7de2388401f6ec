//! Integration Tests for API Endpoints
//!
//! Tests the full request/response cycle for each endpoint, including the
//! rate-limit middleware in front of them.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{Request, Response, StatusCode},
    Router,
};
use coord_cache::{
    api::create_router,
    config::Config,
    store::MemoryStore,
    tasks::Monitor,
    AppState,
};
use serde_json::Value;
use tower::ServiceExt;

// == Helper Functions ==

async fn create_state(config: &Config) -> (AppState<MemoryStore>, MemoryStore) {
    let store = MemoryStore::new();
    let state = AppState::from_config(Arc::new(store.clone()), config)
        .await
        .unwrap();
    (state, store)
}

async fn create_test_app() -> (Router, MemoryStore) {
    let (state, store) = create_state(&Config::default()).await;
    (create_router(state), store)
}

async fn body_to_json(body: Body) -> Value {
    let bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn send(app: &Router, request: Request<Body>) -> Response<Body> {
    app.clone().oneshot(request).await.unwrap()
}

fn put(uri: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method("PUT")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn header(response: &Response<Body>, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .map(|value| value.to_str().unwrap().to_string())
}

// == SET Endpoint Tests ==

#[tokio::test]
async fn test_set_endpoint_success() {
    let (app, _) = create_test_app().await;

    let response = send(&app, put("/cache/p1", r#"{"value":{"name":"ada"}}"#)).await;
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_to_json(response.into_body()).await;
    assert_eq!(json["id"], "p1");
    assert!(json["message"].as_str().unwrap().contains("p1"));
}

#[tokio::test]
async fn test_set_endpoint_with_ttl() {
    let (app, _) = create_test_app().await;

    let response = send(&app, put("/cache/ttl_key", r#"{"value":"v","ttl":60}"#)).await;
    assert_eq!(response.status(), StatusCode::OK);
}

// == GET Endpoint Tests ==

#[tokio::test]
async fn test_get_endpoint_success() {
    let (app, _) = create_test_app().await;

    send(&app, put("/cache/p1", r#"{"value":{"name":"ada","age":36}}"#)).await;
    let response = send(&app, get("/cache/p1")).await;

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_to_json(response.into_body()).await;
    assert_eq!(json["id"], "p1");
    assert_eq!(json["value"]["name"], "ada");
    assert_eq!(json["value"]["age"], 36);
}

#[tokio::test]
async fn test_get_endpoint_not_found() {
    let (app, _) = create_test_app().await;

    let response = send(&app, get("/cache/nonexistent")).await;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let json = body_to_json(response.into_body()).await;
    assert!(json["error"].as_str().unwrap().contains("nonexistent"));
}

// == DELETE Endpoint Tests ==

#[tokio::test]
async fn test_delete_endpoint_success() {
    let (app, _) = create_test_app().await;

    send(&app, put("/cache/p1", r#"{"value":1}"#)).await;
    let response = send(
        &app,
        Request::builder()
            .method("DELETE")
            .uri("/cache/p1")
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_to_json(response.into_body()).await;
    assert_eq!(json["existed"], true);

    let response = send(&app, get("/cache/p1")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_delete_endpoint_not_found() {
    let (app, _) = create_test_app().await;

    let response = send(
        &app,
        Request::builder()
            .method("DELETE")
            .uri("/cache/nonexistent")
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_to_json(response.into_body()).await;
    assert_eq!(json["existed"], false);
}

// == WARM Endpoint Tests ==

#[tokio::test]
async fn test_warm_endpoint_evicts_overflow() {
    let (app, _) = create_test_app().await;

    let entries: Vec<String> = (1..=15)
        .map(|i| format!(r#"{{"id":"{}","value":{}}}"#, i, i))
        .collect();
    let body = format!(r#"{{"entries":[{}]}}"#, entries.join(","));
    let response = send(
        &app,
        Request::builder()
            .method("POST")
            .uri("/cache/warm")
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap(),
    )
    .await;

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_to_json(response.into_body()).await;
    assert_eq!(json["loaded"], 15);
    assert_eq!(json["evicted"], 5);

    assert_eq!(send(&app, get("/cache/5")).await.status(), StatusCode::NOT_FOUND);
    assert_eq!(send(&app, get("/cache/6")).await.status(), StatusCode::OK);
}

// == STATS Endpoint Tests ==

#[tokio::test]
async fn test_stats_endpoint() {
    let (app, _) = create_test_app().await;

    send(&app, put("/cache/p1", r#"{"value":1}"#)).await;
    send(&app, get("/cache/p1")).await;
    send(&app, get("/cache/missing")).await;

    let response = send(&app, get("/stats")).await;
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_to_json(response.into_body()).await;
    assert_eq!(json["hits"], 1);
    assert_eq!(json["misses"], 1);
    assert_eq!(json["cache_size"], 1);
    assert_eq!(json["max_entries"], 10);
    assert_eq!(json["hit_rate"], 0.5);
    // the stats request itself is counted before the handler runs
    assert_eq!(json["rate_limit"]["allowed"], 4);
}

// == HEALTH Endpoint Tests ==

#[tokio::test]
async fn test_health_endpoint() {
    let (app, _) = create_test_app().await;

    let response = send(&app, get("/health")).await;

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_to_json(response.into_body()).await;
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["store"], "up");
    assert!(json.get("timestamp").is_some());
}

#[tokio::test]
async fn test_health_endpoint_degraded() {
    let (app, store) = create_test_app().await;
    store.set_online(false);

    let response = send(&app, get("/health")).await;

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let json = body_to_json(response.into_body()).await;
    assert_eq!(json["status"], "degraded");
}

// == METRICS Endpoint Tests ==

#[tokio::test]
async fn test_metrics_endpoint_after_sample() {
    let (state, _) = create_state(&Config::default()).await;
    state
        .cache
        .set("p1", b"1", Duration::ZERO)
        .await
        .unwrap();
    state.cache.get("p1").await.unwrap();

    let monitor = Monitor::new(
        state.cache.metrics(),
        state.limiter.stats(),
        10,
        state.sink.clone(),
    );
    monitor.tick();

    let app = create_router(state);
    let response = send(&app, get("/metrics")).await;
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("cache_hits_total 1"));
    assert!(text.contains("cache_size 1"));
}

// == Error Handling Tests ==

#[tokio::test]
async fn test_invalid_json_request() {
    let (app, _) = create_test_app().await;

    let response = send(&app, put("/cache/p1", r#"{"value": "#)).await;

    assert!(response.status().is_client_error());
}

#[tokio::test]
async fn test_oversized_id_request() {
    let (app, _) = create_test_app().await;
    let uri = format!("/cache/{}", "k".repeat(300));

    let response = send(&app, put(&uri, r#"{"value":1}"#)).await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_to_json(response.into_body()).await;
    assert!(json["error"].as_str().unwrap().contains("maximum length"));
}

#[tokio::test]
async fn test_get_index_key_rejected() {
    let (app, _) = create_test_app().await;
    send(&app, put("/cache/p1", r#"{"value":1}"#)).await;

    // "profile:" + "order" names the order index, not a payload
    let response = send(&app, get("/cache/order")).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_store_outage_on_write() {
    let (app, store) = create_test_app().await;
    store.set_online(false);

    let response = send(&app, put("/cache/p1", r#"{"value":1}"#)).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    // reads degrade to a miss
    let response = send(&app, get("/cache/p1")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

// == Rate Limit Tests ==

#[tokio::test]
async fn test_rate_limit_101_requests() {
    let (app, _) = create_test_app().await;

    for i in 1..=100u64 {
        let response = send(
            &app,
            Request::builder()
                .uri("/health")
                .header("x-forwarded-for", "10.0.0.5")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK, "request {}", i);
        assert_eq!(header(&response, "x-ratelimit-limit").unwrap(), "100");
        assert_eq!(
            header(&response, "x-ratelimit-remaining").unwrap(),
            (100 - i).to_string()
        );
    }

    let response = send(
        &app,
        Request::builder()
            .uri("/health")
            .header("x-forwarded-for", "10.0.0.5")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(header(&response, "x-ratelimit-remaining").unwrap(), "0");
    assert_eq!(header(&response, "retry-after").unwrap(), "60");
    let reset: i64 = header(&response, "x-ratelimit-reset").unwrap().parse().unwrap();
    assert!(reset > chrono::Utc::now().timestamp());

    // another client is unaffected
    let response = send(
        &app,
        Request::builder()
            .uri("/health")
            .header("x-forwarded-for", "10.0.0.6")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_custom_header_prefix() {
    let config = Config {
        rate_limit_requests: 2,
        rate_limit_header_prefix: "X-Quota-".to_string(),
        ..Config::default()
    };
    let (state, _) = create_state(&config).await;
    let app = create_router(state);

    let response = send(&app, get("/health")).await;
    assert_eq!(header(&response, "x-quota-remaining").unwrap(), "1");
    assert!(header(&response, "x-ratelimit-remaining").is_none());
}

#[tokio::test]
async fn test_rate_limit_fails_open_when_store_down() {
    let config = Config {
        rate_limit_requests: 1,
        ..Config::default()
    };
    let (state, store) = create_state(&config).await;
    let app = create_router(state);
    store.set_online(false);

    for _ in 0..3 {
        let response = send(&app, get("/stats")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(header(&response, "x-ratelimit-remaining").is_none());
    }
}

// == TTL Tests ==

#[tokio::test(start_paused = true)]
async fn test_ttl_expiration_via_api() {
    let (app, _) = create_test_app().await;

    send(&app, put("/cache/short", r#"{"value":"v","ttl":1}"#)).await;
    assert_eq!(send(&app, get("/cache/short")).await.status(), StatusCode::OK);

    tokio::time::advance(Duration::from_secs(2)).await;
    assert_eq!(
        send(&app, get("/cache/short")).await.status(),
        StatusCode::NOT_FOUND
    );
}
