use super::{TutorBoundary, TutorError, TutorRequest, TutorResponse};
use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

/// Posts the request as JSON to a tutor endpoint.
#[derive(Clone)]
pub struct HttpTutor {
    client: Client,
    endpoint: String,
}

impl HttpTutor {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl TutorBoundary for HttpTutor {
    async fn respond(&self, request: TutorRequest) -> Result<TutorResponse, TutorError> {
        debug!(message_id = %request.message.id(), endpoint = %self.endpoint, "asking tutor");

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| TutorError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TutorError::Rejected(format!("{status}: {body}")));
        }

        response
            .json::<TutorResponse>()
            .await
            .map_err(|e| TutorError::Rejected(format!("malformed answer: {e}")))
    }
}
