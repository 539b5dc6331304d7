//! Loop-prevention lookup
//!
//! Webhook ingestion asks here before turning a platform comment into a
//! task, so the relay never answers its own posts.

use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use serde::Serialize;

use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct CommentLookup {
    pub comment_id: String,
    pub own: bool,
}

/// GET /comments/{id} - Whether the relay posted this comment recently
async fn lookup_comment(
    State(state): State<AppState>,
    Path(comment_id): Path<String>,
) -> Json<CommentLookup> {
    let own = state.ledger().is_own_comment(&comment_id);
    Json(CommentLookup { comment_id, own })
}

pub fn router() -> Router<AppState> {
    Router::new().route("/comments/{id}", get(lookup_comment))
}
