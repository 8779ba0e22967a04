//! Liveness endpoint for external uptime pings.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{Value, json};
use tracing::info;

use crate::feedback::scheduler::Scheduler;

pub fn router(scheduler: Arc<Scheduler>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .with_state(scheduler)
}

async fn root() -> &'static str {
    "OK - Telegram Feedback Bot running"
}

async fn health(State(scheduler): State<Arc<Scheduler>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "jobs": scheduler.status(),
    }))
}

/// Serve the liveness endpoint until the process exits.
pub async fn serve(port: u16, scheduler: Arc<Scheduler>) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Health endpoint listening on {}", addr);
    axum::serve(listener, router(scheduler)).await
}
