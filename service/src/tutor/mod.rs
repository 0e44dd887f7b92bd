//! Boundary to the remote tutor that answers a child's message.

mod http;

pub use http::HttpTutor;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tutorchat_messaging::Message;

#[derive(Debug, Clone, Serialize)]
pub struct TutorRequest {
    /// Recent messages of the conversation, oldest first.
    pub context: Vec<Message>,
    pub message: Message,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TutorResponse {
    pub answer: String,
    #[serde(default)]
    pub illustration_url: Option<String>,
    #[serde(default)]
    pub audio_url: Option<String>,
}

impl TutorResponse {
    pub fn text(answer: impl Into<String>) -> Self {
        Self {
            answer: answer.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum TutorError {
    #[error("tutor rejected the request: {0}")]
    Rejected(String),
    #[error("tutor transport error: {0}")]
    Transport(String),
}

#[async_trait]
pub trait TutorBoundary: Send + Sync {
    async fn respond(&self, request: TutorRequest) -> Result<TutorResponse, TutorError>;
}
