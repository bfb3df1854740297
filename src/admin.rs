//! Admin endpoint.
//!
//! Serves the live stats snapshot and a liveness probe.

use std::sync::Arc;

use anyhow::Result;
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use tokio::net::TcpListener;
use tracing::info;

use crate::proxy::{ProxyService, Stats};

/// Build the admin router.
pub fn router(service: Arc<ProxyService>) -> Router {
    Router::new()
        .route("/v1/status", get(status))
        .route("/healthz", get(healthz))
        .with_state(service)
}

/// Serve the admin endpoint forever.
pub async fn serve(addr: &str, service: Arc<ProxyService>) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "admin endpoint listening");
    axum::serve(listener, router(service)).await?;
    Ok(())
}

async fn status(State(service): State<Arc<ProxyService>>) -> Json<Stats> {
    Json(service.stats().await)
}

async fn healthz() -> &'static str {
    "ok"
}
