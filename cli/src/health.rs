//! HTTP health endpoints for liveness and readiness checks.

use std::net::SocketAddr;

use axum::{http::StatusCode, response::IntoResponse, routing::get, Extension, Router};
use chainingest_core::{CancellationToken, IngestorHandle};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::info;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    ready: bool,
    shutting_down: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    head_drift_secs: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    lib_num: Option<u64>,
}

async fn respond(handle: &IngestorHandle, healthy: bool) -> impl IntoResponse {
    let snapshot = handle.health().snapshot();
    let response = HealthResponse {
        status: if healthy { "ok" } else { "unavailable" },
        ready: snapshot.ready,
        shutting_down: snapshot.shutting_down,
        head_drift_secs: handle.drift().await.map(|d| d.num_seconds()),
        lib_num: handle.lib().await.map(|r| r.num()),
    };
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, axum::Json(response))
}

async fn health_handler(Extension(handle): Extension<IngestorHandle>) -> impl IntoResponse {
    let healthy = handle.health().is_healthy();
    respond(&handle, healthy).await
}

async fn ready_handler(Extension(handle): Extension<IngestorHandle>) -> impl IntoResponse {
    let ready = handle.health().is_ready();
    respond(&handle, ready).await
}

pub fn router(handle: IngestorHandle) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/ready", get(ready_handler))
        .layer(Extension(handle))
}

/// Serve the endpoints until `shutdown` is cancelled.
pub async fn start_health_server(
    addr: SocketAddr,
    handle: IngestorHandle,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "Starting health server");

    axum::serve(listener, router(handle).into_make_service())
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(Into::into)
}
