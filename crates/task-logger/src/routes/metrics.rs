//! Consumer metrics

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use relay_core::stream::GroupInfo;
use serde::Serialize;

use super::{route_error, RouteError};
use crate::correlator::MetricsSnapshot;
use crate::state::AppState;
use crate::task_log;

#[derive(Serialize)]
struct MetricsResponse {
    stream: String,
    stream_length: u64,
    consumer_group: GroupInfo,
    tasks_logged: usize,
    correlator: MetricsSnapshot,
}

async fn get_metrics(State(state): State<AppState>) -> Result<Json<MetricsResponse>, RouteError> {
    let unavailable = |e: &dyn std::fmt::Display| {
        tracing::warn!("Metrics unavailable: {}", e);
        route_error(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
    };

    let stream_length = state.stream().len().await.map_err(|e| unavailable(&e))?;
    let consumer_group = state
        .stream()
        .group_info(&state.config().consumer_group)
        .await
        .map_err(|e| unavailable(&e))?;
    let tasks_logged = task_log::count_task_dirs(state.logs_dir()).map_err(|e| unavailable(&e))?;

    Ok(Json(MetricsResponse {
        stream: state.config().stream_name.clone(),
        stream_length,
        consumer_group,
        tasks_logged,
        correlator: state.metrics().snapshot(),
    }))
}

pub fn router() -> Router<AppState> {
    Router::new().route("/metrics", get(get_metrics))
}
