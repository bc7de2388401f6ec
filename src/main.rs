//! Coord Cache - store-coordinated cache and rate limiter service
//!
//! Serves the bounded cache over HTTP behind the per-client rate limiter.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use coord_cache::api::{create_router, AppState};
use coord_cache::config::{Config, StoreBackend};
use coord_cache::store::{CoordinationStore, MemoryStore, RedisStore};
use coord_cache::tasks::{spawn_index_sweep_task, spawn_monitor_task, Monitor};

/// Main entry point for the coordination service.
///
/// # Startup Sequence
/// 1. Initialize tracing subscriber for logging
/// 2. Load and validate configuration from environment variables
/// 3. Connect to the configured store backend
/// 4. Start the cache (invalidation subscriber) and background tasks
/// 5. Serve the Axum router on the configured port
/// 6. Handle graceful shutdown on SIGINT/SIGTERM
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Defaults to "info" level, can be overridden with RUST_LOG env var
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "coord_cache=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting coordination service");

    let config = Config::from_env();
    config.validate().context("invalid configuration")?;
    info!(
        backend = ?config.store_backend,
        max_entries = config.cache_max_entries,
        default_ttl_secs = config.cache_default_ttl,
        rate_limit = config.rate_limit_requests,
        window_secs = config.rate_limit_window_secs,
        port = config.server_port,
        "configuration loaded"
    );

    match config.store_backend {
        StoreBackend::Redis => {
            let pool_size = usize::try_from(config.store_watch_pool).unwrap_or(usize::MAX);
            let store = RedisStore::connect_with_pool(&config.redis_url, pool_size)
                .await
                .with_context(|| format!("failed to connect to {}", config.redis_url))?;
            serve(Arc::new(store), config).await
        }
        StoreBackend::Memory => {
            warn!("using in-process memory store; replicas will not share state");
            serve(Arc::new(MemoryStore::new()), config).await
        }
    }
}

async fn serve<S: CoordinationStore>(store: Arc<S>, config: Config) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();

    let state = AppState::from_config(store, &config)
        .await
        .context("failed to start cache")?;
    let cache = state.cache.clone();

    let sweep_handle = spawn_index_sweep_task(
        cache.clone(),
        Duration::from_secs(config.index_sweep_interval),
        shutdown.clone(),
    );
    let monitor = Monitor::new(
        cache.metrics(),
        state.limiter.stats(),
        config.cache_max_entries,
        state.sink.clone(),
    );
    let monitor_handle = spawn_monitor_task(
        monitor,
        Duration::from_secs(config.metrics_interval_secs),
        shutdown.clone(),
    );
    info!("background tasks started");

    let app = create_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server_port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("Server listening on http://{}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
    .await
    .context("server error")?;

    shutdown.cancel();
    cache.shutdown().await;
    for handle in [sweep_handle, monitor_handle] {
        if let Err(err) = handle.await {
            warn!(error = %err, "background task ended abnormally");
        }
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Waits for Ctrl+C or SIGTERM, then cancels `shutdown`.
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        }
        _ = shutdown.cancelled() => {}
    }

    shutdown.cancel();
}
