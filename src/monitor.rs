//! Prometheus metrics and the exposition endpoint.

use anyhow::{Context, Result};
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_gauge, register_histogram, Counter, Gauge, Histogram, TextEncoder,
};
use tokio::net::TcpListener;
use tracing::info;

lazy_static! {
    // Pool metrics
    pub static ref POOL_IDLE_COUNT: Gauge = register_gauge!(
        "agent_platform_pool_idle_count",
        "Current number of idle containers in the pool"
    )
    .expect("metric registration");
    pub static ref POOL_MANAGED_COUNT: Gauge = register_gauge!(
        "agent_platform_pool_managed_count",
        "Total number of containers managed by the pool (idle + leased)"
    )
    .expect("metric registration");
    pub static ref POOL_ACQUISITION_LATENCY: Histogram = register_histogram!(
        "agent_platform_pool_acquisition_latency_seconds",
        "Latency of acquiring a container from the pool",
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .expect("metric registration");
    pub static ref CONTAINER_CREATION_ERRORS: Counter = register_counter!(
        "agent_platform_pool_container_creation_errors_total",
        "Total number of container creation errors"
    )
    .expect("metric registration");

    // Dispatcher metrics
    pub static ref DISPATCHER_ACTIVE_STREAMS: Gauge = register_gauge!(
        "agent_platform_dispatcher_active_streams",
        "Number of currently active gRPC streams"
    )
    .expect("metric registration");
    pub static ref DISPATCHER_REQUESTS_TOTAL: Counter = register_counter!(
        "agent_platform_dispatcher_requests_total",
        "Total number of dispatch requests"
    )
    .expect("metric registration");
    pub static ref DISPATCHER_ERRORS_TOTAL: Counter = register_counter!(
        "agent_platform_dispatcher_errors_total",
        "Total number of dispatch errors"
    )
    .expect("metric registration");

    // Session metrics
    pub static ref SESSION_ACTIVE_COUNT: Gauge = register_gauge!(
        "agent_platform_session_active_count",
        "Number of currently active sessions"
    )
    .expect("metric registration");
    pub static ref SESSION_CREATION_LATENCY: Histogram = register_histogram!(
        "agent_platform_session_creation_latency_seconds",
        "Latency of creating a new session",
        vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    )
    .expect("metric registration");
}

async fn metrics_handler() -> Result<String, StatusCode> {
    let encoder = TextEncoder::new();
    encoder
        .encode_to_string(&prometheus::gather())
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

async fn healthz_handler() -> &'static str {
    "ok"
}

/// Serve `/metrics` and `/healthz` until `shutdown` resolves.
pub async fn serve_metrics(
    addr: &str,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler));

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding metrics server on {addr}"))?;
    info!(addr, "metrics server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("metrics server")?;
    Ok(())
}
