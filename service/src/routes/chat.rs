use super::ApiError;
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;
use tutorchat_messaging::{AttachmentStaging, ConversationId, Feedback, Message, MessageId};
use uuid::Uuid;

#[derive(Debug, Serialize)]
pub struct ChatView {
    pub conversation_id: ConversationId,
    pub messages: Vec<Message>,
}

impl ChatView {
    pub(crate) fn of(state: &AppState) -> Self {
        let (conversation_id, messages) = state.store().snapshot();
        Self {
            conversation_id,
            messages,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ComposePayload {
    #[serde(default)]
    pub text: String,
    #[serde(flatten)]
    pub staging: AttachmentStaging,
}

#[derive(Debug, Serialize)]
pub struct SendResponse {
    pub message_ids: Vec<MessageId>,
}

#[derive(Debug, Deserialize)]
pub struct FeedbackPayload {
    pub feedback: Feedback,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub cancelled: bool,
}

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/chat", get(current_chat))
        .route("/chat/new", post(start_new_chat))
        .route("/chat/messages", post(send_message))
        .route("/chat/messages/:id/retry", post(retry_message))
        .route("/chat/messages/:id/cancel", post(cancel_message))
        .route("/chat/messages/:id/feedback", post(set_feedback))
}

async fn current_chat(State(state): State<Arc<AppState>>) -> Json<ChatView> {
    Json(ChatView::of(&state))
}

async fn start_new_chat(State(state): State<Arc<AppState>>) -> Json<ChatView> {
    let detached = state.store().start_new_chat();
    debug!(previous = %detached.id, dropped = detached.messages.len(), "chat reset");
    Json(ChatView::of(&state))
}

async fn send_message(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ComposePayload>,
) -> Result<(StatusCode, Json<SendResponse>), ApiError> {
    let handles = state
        .coordinator()
        .send_composition(&payload.text, payload.staging)?;
    let message_ids = handles.iter().map(|h| h.message_id()).collect();
    Ok((StatusCode::ACCEPTED, Json(SendResponse { message_ids })))
}

async fn retry_message(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<SendResponse>), ApiError> {
    let handle = state.coordinator().retry(MessageId(id))?;
    Ok((
        StatusCode::ACCEPTED,
        Json(SendResponse {
            message_ids: vec![handle.message_id()],
        }),
    ))
}

async fn cancel_message(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Json<CancelResponse> {
    Json(CancelResponse {
        cancelled: state.coordinator().cancel(MessageId(id)),
    })
}

async fn set_feedback(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<FeedbackPayload>,
) -> Result<StatusCode, ApiError> {
    state.store().set_feedback(MessageId(id), payload.feedback)?;
    Ok(StatusCode::NO_CONTENT)
}
