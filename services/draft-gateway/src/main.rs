//! Draft Gateway
//!
//! Single-binary service that:
//! 1. Loads a pool of API keys for the hosted model API
//! 2. Serves generation requests, one dispatch at a time through the pool
//! 3. Rotates to the next key when one hits its quota
//! 4. Exposes pool health, key administration, and Prometheus metrics

mod admin;
mod api;
mod config;
mod error;
mod metrics;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use key_pool::{CredentialPool, Dispatcher, StatusSnapshot, SystemClock};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use transport::{GeminiTransport, Transport};

use crate::admin::AdminState;
use crate::config::Config;
use crate::metrics::CredentialGauges;

/// Time allowed for in-flight requests after the shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    dispatcher: Arc<Dispatcher>,
    transport: Arc<dyn Transport>,
    /// Cancelled on shutdown; aborts dispatch backoff and batch pacing waits.
    shutdown: CancellationToken,
    prometheus: PrometheusHandle,
    started_at: Instant,
}

/// Build the public axum router with all routes and shared state.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/v1/generate", post(api::generate))
        .route("/v1/batch", post(api::batch))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

/// Log and publish every pool state change.
fn observe_pool(gauges: &CredentialGauges, snapshot: &StatusSnapshot) {
    debug!(
        version = snapshot.version,
        selected = snapshot.selected,
        available = snapshot.count(key_pool::CredentialState::Available),
        exhausted = snapshot.count(key_pool::CredentialState::Exhausted),
        errored = snapshot.count(key_pool::CredentialState::Errored),
        "key pool status"
    );
    gauges.record(snapshot);
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting draft-gateway");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder()?;

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.server.listen_addr,
        admin_listen_addr = %config.server.admin_listen_addr,
        base_url = %config.upstream.base_url,
        model = %config.upstream.model,
        keys = config.keys.api_keys.len(),
        "configuration loaded"
    );

    let keys = config
        .keys
        .api_keys
        .iter()
        .map(|k| k.expose().clone())
        .collect();
    let pool = Arc::new(
        CredentialPool::new(keys, Arc::new(SystemClock)).context("failed to build key pool")?,
    );
    let gauges = Arc::new(CredentialGauges::default());
    let _pool_observer = pool.subscribe({
        let gauges = gauges.clone();
        move |snapshot| observe_pool(&gauges, snapshot)
    });
    observe_pool(&gauges, &pool.status());

    let client = reqwest::Client::builder()
        .build()
        .context("failed to build HTTP client")?;
    let transport: Arc<dyn Transport> = Arc::new(GeminiTransport::new(
        client,
        config.upstream.base_url.clone(),
        config.upstream.model.clone(),
        Duration::from_secs(config.upstream.timeout_secs),
    ));

    let shutdown = CancellationToken::new();
    let dispatcher = Arc::new(Dispatcher::new(pool.clone(), config.dispatch.clone()));

    let app_state = AppState {
        dispatcher: dispatcher.clone(),
        transport,
        shutdown: shutdown.clone(),
        prometheus: prometheus_handle,
        started_at: Instant::now(),
    };
    let app = build_router(app_state, config.server.max_connections);
    let admin_app = admin::build_admin_router(AdminState::new(dispatcher.clone()));

    let listener = TcpListener::bind(config.server.listen_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.server.listen_addr))?;
    let admin_listener = TcpListener::bind(config.server.admin_listen_addr)
        .await
        .with_context(|| {
            format!(
                "failed to bind admin listener to {}",
                config.server.admin_listen_addr
            )
        })?;
    info!(
        addr = %config.server.listen_addr,
        admin_addr = %config.server.admin_listen_addr,
        "accepting requests"
    );

    let server_handle = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
        })
    };
    let admin_handle = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            axum::serve(admin_listener, admin_app)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
        })
    };

    // Wait for the OS signal, then cancel every dispatch and drain.
    // The drain timeout starts at signal receipt.
    shutdown_signal().await;
    shutdown.cancel();

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => info!("all in-flight requests drained"),
        Ok(Ok(Err(e))) => error!(error = %e, "server error during shutdown"),
        Ok(Err(e)) => error!(error = %e, "server task panicked"),
        Err(_) => warn!(
            drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
            "drain timeout exceeded, forcing shutdown"
        ),
    }
    match admin_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "admin server error during shutdown"),
        Err(e) => error!(error = %e, "admin server task panicked"),
    }

    info!("shutdown complete");
    Ok(())
}

/// Pool health: 200 while any key is available, 503 when none is.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.dispatcher.pool().status();
    let mut body = status.health();
    body["uptime_seconds"] = state.started_at.elapsed().as_secs().into();

    let status_code = if status.health_label() == "unhealthy" {
        axum::http::StatusCode::SERVICE_UNAVAILABLE
    } else {
        axum::http::StatusCode::OK
    };

    (
        status_code,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint, returns metrics in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
