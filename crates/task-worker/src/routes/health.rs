//! Health and status endpoints

use axum::{extract::State, routing::get, Json, Router};
use relay_core::queue::WorkQueue;
use serde::Serialize;

use crate::state::AppState;
use crate::worker::WorkerStatus;

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    provider: String,
}

#[derive(Serialize)]
struct StatusResponse {
    #[serde(flatten)]
    worker: WorkerStatus,
    queue_length: Option<usize>,
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        provider: state.worker().config().provider.to_string(),
    })
}

async fn worker_status(State(state): State<AppState>) -> Json<StatusResponse> {
    let queue_length = match state.queue().len().await {
        Ok(len) => Some(len),
        Err(e) => {
            tracing::warn!("Queue length unavailable: {}", e);
            None
        }
    };
    Json(StatusResponse {
        worker: state.worker().status(),
        queue_length,
    })
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/status", get(worker_status))
}
