//! HTTP endpoints for scraping.
//!
//! - `/metrics` - Prometheus text exposition of [`ExporterMetrics`]
//! - `/health` - liveness probe
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde_json::json;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

use crate::metrics::ExporterMetrics;
use crate::version::VERSION;

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

pub fn create_router(metrics: ExporterMetrics) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .with_state(metrics)
}

async fn metrics_handler(State(metrics): State<ExporterMetrics>) -> impl IntoResponse {
    match metrics.encode() {
        Ok(output) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)],
            output,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics.");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to encode metrics: {e}"),
            )
                .into_response()
        }
    }
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok", "version": VERSION }))
}

/// Binds `listen_address` and serves until `shutdown` flips to true (or its
/// sender is dropped).
pub async fn serve(
    listen_address: &str,
    metrics: ExporterMetrics,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(listen_address).await?;
    let local_addr: SocketAddr = listener.local_addr()?;
    info!(address = %local_addr, "Metrics server listening.");

    axum::serve(listener, create_router(metrics))
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow_and_update() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
            info!("Metrics server shutting down.");
        })
        .await
}
