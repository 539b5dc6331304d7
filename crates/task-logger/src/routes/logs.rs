//! Assembled task logs

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde_json::Value;

use super::{route_error, RouteError};
use crate::state::AppState;
use crate::task_log;

async fn get_task_logs(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<Value>, RouteError> {
    let dir = task_log::resolve(state.logs_dir(), &task_id).ok_or_else(|| {
        route_error(
            StatusCode::NOT_FOUND,
            format!("No logs for task {}", task_id),
        )
    })?;

    let mut logs = task_log::assemble(&dir).map_err(|e| {
        tracing::error!(%task_id, "Failed to assemble logs: {}", e);
        route_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    })?;
    if let Value::Object(map) = &mut logs {
        map.insert("task_id".to_string(), Value::String(task_id));
    }
    Ok(Json(logs))
}

pub fn router() -> Router<AppState> {
    Router::new().route("/tasks/{id}/logs", get(get_task_logs))
}
