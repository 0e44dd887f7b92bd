use super::chat::ChatView;
use super::ApiError;
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use std::sync::Arc;
use tutorchat_messaging::{ConversationId, ConversationSummary};
use uuid::Uuid;

#[derive(Debug, Default, Deserialize)]
pub struct ArchivePayload {
    #[serde(default)]
    pub title: Option<String>,
}

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/history", get(list_history).post(archive_current))
        .route("/history/:id/resume", post(resume))
}

async fn list_history(State(state): State<Arc<AppState>>) -> Json<Vec<ConversationSummary>> {
    Json(state.store().chat_history())
}

async fn archive_current(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ArchivePayload>,
) -> Result<Json<ConversationSummary>, ApiError> {
    let conversation = state.store().archive_current_chat(payload.title)?;
    Ok(Json(conversation.summary()))
}

async fn resume(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<ChatView>, ApiError> {
    state.store().load_chat_history(ConversationId(id))?;
    Ok(Json(ChatView::of(&state)))
}
