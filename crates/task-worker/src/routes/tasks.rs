//! Task intake and lookup endpoints

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use relay_core::queue::WorkQueue;
use relay_core::task::{Task, TaskDescriptor, TaskRepository};
use serde::Serialize;
use uuid::Uuid;

use super::{route_error, RouteError};
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct EnqueueResponse {
    pub task_id: String,
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct OutputResponse {
    pub task_id: String,
    pub output: Option<String>,
    pub raw_output: Option<String>,
}

/// POST /tasks - Put a descriptor on the work queue
async fn enqueue_task(
    State(state): State<AppState>,
    Json(mut descriptor): Json<TaskDescriptor>,
) -> Result<(StatusCode, Json<EnqueueResponse>), RouteError> {
    if descriptor.prompt.trim().is_empty() {
        return Err(route_error(
            StatusCode::BAD_REQUEST,
            "Prompt cannot be empty",
        ));
    }
    if descriptor.task_id.trim().is_empty() {
        descriptor.task_id = Uuid::new_v4().to_string();
    }

    state
        .queue()
        .push(&descriptor)
        .await
        .map_err(|e| route_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    tracing::info!(task_id = %descriptor.task_id, source = %descriptor.source, "Task enqueued");

    Ok((
        StatusCode::ACCEPTED,
        Json(EnqueueResponse {
            task_id: descriptor.task_id,
            status: "queued".to_string(),
        }),
    ))
}

/// GET /tasks/{id} - Mirrored state of a task the worker has picked up
async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Task>, RouteError> {
    let task = state
        .task_store()
        .get(&id)
        .await
        .map_err(|e| route_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    match task {
        Some(task) => Ok(Json(task)),
        None => Err(route_error(
            StatusCode::NOT_FOUND,
            format!("Task {} not found", id),
        )),
    }
}

/// GET /tasks/{id}/output - Persisted cleaned and raw output
async fn get_task_output(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<OutputResponse>, RouteError> {
    let outputs = &state.worker().deps().outputs;
    let internal = |e: relay_core::Error| route_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
    let output = outputs.load_clean(&id).await.map_err(internal)?;
    let raw_output = outputs.load_raw(&id).await.map_err(internal)?;

    if output.is_none() && raw_output.is_none() {
        return Err(route_error(
            StatusCode::NOT_FOUND,
            format!("No output for task {}", id),
        ));
    }
    Ok(Json(OutputResponse {
        task_id: id,
        output,
        raw_output,
    }))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/tasks", post(enqueue_task))
        .route("/tasks/{id}", get(get_task))
        .route("/tasks/{id}/output", get(get_task_output))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use axum::{
        body::{to_bytes, Body},
        http::Request,
    };
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use crate::test_support::idle_worker;

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("Content-Type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_enqueue_generates_task_id() {
        let (worker, _dir) = idle_worker(1).await;
        let state = AppState::new(worker);

        let response = router()
            .with_state(state.clone())
            .oneshot(post_json(
                "/tasks",
                json!({"prompt": "Fix the build", "source": "slack", "channel": "C1"}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let payload = json_body(response).await;
        let task_id = payload["task_id"].as_str().unwrap().to_string();
        assert!(Uuid::parse_str(&task_id).is_ok());
        assert_eq!(payload["status"], "queued");

        let queued = state
            .queue()
            .pop(Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(queued.task_id, task_id);
        assert_eq!(queued.field(&["channel"]), Some(&json!("C1")));
    }

    #[tokio::test]
    async fn test_enqueue_rejects_empty_prompt() {
        let (worker, _dir) = idle_worker(1).await;
        let response = router()
            .with_state(AppState::new(worker))
            .oneshot(post_json("/tasks", json!({"task_id": "t-1", "prompt": "  "})))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error"], "Prompt cannot be empty");
    }

    #[tokio::test]
    async fn test_get_processed_task_and_output() {
        let (worker, _dir) = idle_worker(1).await;
        worker
            .process(TaskDescriptor::new(
                "t-9",
                relay_core::task::TaskSource::Api,
                "hello",
            ))
            .await;
        let app = router().with_state(AppState::new(worker));

        let response = app.clone().oneshot(get("/tasks/t-9")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let task = json_body(response).await;
        assert_eq!(task["status"], "completed");
        assert_eq!(task["result"], "hello");

        let response = app.clone().oneshot(get("/tasks/t-9/output")).await.unwrap();
        assert_eq!(json_body(response).await["output"], "hello");

        let response = app.oneshot(get("/tasks/missing")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
