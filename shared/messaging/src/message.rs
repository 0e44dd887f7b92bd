//! A single chat turn and its delivery lifecycle.

use crate::{now_ms, MessageId, MessagingError, Result};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sender {
    User,
    Ai,
}

/// Delivery state of a user-originated message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Sending,
    Sent,
    Failed,
}

impl DeliveryStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, DeliveryStatus::Sending)
    }
}

impl Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DeliveryStatus::Sending => "sending",
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Failed => "failed",
        })
    }
}

/// Author of a message. Only user messages carry a delivery status; tutor
/// replies are created already delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "sender", rename_all = "snake_case")]
pub enum Author {
    User { status: DeliveryStatus },
    Ai,
}

/// User feedback on a message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feedback {
    Like,
    Dislike,
    #[default]
    None,
}

/// Renderable payload of a message bubble.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "media_type", rename_all = "snake_case")]
pub enum MediaContent {
    Text,
    Image { media_url: String },
    Audio { media_url: String },
    Document { media_url: String },
}

impl MediaContent {
    pub fn kind(&self) -> &'static str {
        match self {
            MediaContent::Text => "text",
            MediaContent::Image { .. } => "image",
            MediaContent::Audio { .. } => "audio",
            MediaContent::Document { .. } => "document",
        }
    }

    pub fn media_url(&self) -> Option<&str> {
        match self {
            MediaContent::Text => None,
            MediaContent::Image { media_url }
            | MediaContent::Audio { media_url }
            | MediaContent::Document { media_url } => Some(media_url),
        }
    }

    fn placeholder(&self) -> &'static str {
        match self {
            MediaContent::Text => "",
            MediaContent::Image { .. } => "[image]",
            MediaContent::Audio { .. } => "[audio]",
            MediaContent::Document { .. } => "[document]",
        }
    }
}

/// One chat turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    id: MessageId,
    text: String,
    #[serde(flatten)]
    author: Author,
    created_ms: i64,
    #[serde(flatten)]
    media: MediaContent,
    #[serde(default)]
    feedback: Feedback,
    /// Lesson question or exercise that produced this message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    metadata: Option<serde_json::Value>,
}

impl Message {
    /// Creates a user message in the `sending` state.
    pub fn user(text: impl Into<String>, media: MediaContent) -> Self {
        Self::new(
            text.into(),
            Author::User {
                status: DeliveryStatus::Sending,
            },
            media,
        )
    }

    /// Creates a tutor reply, which is always `sent`.
    pub fn ai(text: impl Into<String>, media: MediaContent) -> Self {
        Self::new(text.into(), Author::Ai, media)
    }

    fn new(text: String, author: Author, media: MediaContent) -> Self {
        Self {
            id: MessageId::new(),
            text,
            author,
            created_ms: now_ms(),
            media,
            feedback: Feedback::None,
            metadata: None,
        }
    }

    pub fn with_id(mut self, id: MessageId) -> Self {
        self.id = id;
        self
    }

    pub fn with_timestamp(mut self, created_ms: i64) -> Self {
        self.created_ms = created_ms;
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn author(&self) -> Author {
        self.author
    }

    pub fn sender(&self) -> Sender {
        match self.author {
            Author::User { .. } => Sender::User,
            Author::Ai => Sender::Ai,
        }
    }

    pub fn status(&self) -> DeliveryStatus {
        match self.author {
            Author::User { status } => status,
            Author::Ai => DeliveryStatus::Sent,
        }
    }

    pub fn created_ms(&self) -> i64 {
        self.created_ms
    }

    pub fn media(&self) -> &MediaContent {
        &self.media
    }

    pub fn feedback(&self) -> Feedback {
        self.feedback
    }

    pub fn metadata(&self) -> Option<&serde_json::Value> {
        self.metadata.as_ref()
    }

    pub fn set_feedback(&mut self, feedback: Feedback) {
        self.feedback = feedback;
    }

    /// Rejects messages that must never enter a conversation.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_nil() {
            return Err(MessagingError::NilMessageId);
        }
        if self.created_ms < 0 {
            return Err(MessagingError::InvalidTimestamp(self.created_ms));
        }
        if let Some(url) = self.media.media_url() {
            if url.trim().is_empty() {
                return Err(MessagingError::MissingMediaUrl(self.media.kind()));
            }
        }
        Ok(())
    }

    pub fn mark_sent(&mut self) -> Result<()> {
        self.transition(DeliveryStatus::Sent)
    }

    pub fn mark_failed(&mut self) -> Result<()> {
        self.transition(DeliveryStatus::Failed)
    }

    fn transition(&mut self, to: DeliveryStatus) -> Result<()> {
        match &mut self.author {
            Author::User { status } if *status == DeliveryStatus::Sending => {
                *status = to;
                Ok(())
            }
            _ => Err(MessagingError::InvalidTransition {
                id: self.id,
                from: self.status(),
                to,
            }),
        }
    }

    /// Builds a fresh attempt for a failed user message. The failed record is
    /// left untouched.
    pub fn retry_of(&self) -> Result<Message> {
        if self.author
            != (Author::User {
                status: DeliveryStatus::Failed,
            })
        {
            return Err(MessagingError::NotRetryable(self.id));
        }

        let mut attempt = Message::user(self.text.clone(), self.media.clone());
        attempt.metadata = self.metadata.clone();
        Ok(attempt)
    }

    /// History preview: the text, or a placeholder for media-only bubbles.
    pub fn preview(&self) -> String {
        if self.text.trim().is_empty() {
            self.media.placeholder().to_string()
        } else {
            self.text.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn user_messages_start_sending_and_ai_messages_are_sent() {
        let user = Message::user("Bonjour", MediaContent::Text);
        assert_eq!(user.sender(), Sender::User);
        assert_eq!(user.status(), DeliveryStatus::Sending);

        let ai = Message::ai("Salut !", MediaContent::Text);
        assert_eq!(ai.sender(), Sender::Ai);
        assert_eq!(ai.status(), DeliveryStatus::Sent);
    }

    #[test]
    fn status_only_leaves_sending_once() {
        let mut message = Message::user("hi", MediaContent::Text);
        message.mark_sent().unwrap();
        assert_eq!(message.status(), DeliveryStatus::Sent);

        let err = message.mark_failed().unwrap_err();
        assert_eq!(
            err,
            MessagingError::InvalidTransition {
                id: message.id(),
                from: DeliveryStatus::Sent,
                to: DeliveryStatus::Failed,
            }
        );
        assert!(message.mark_sent().is_err());
        assert_eq!(message.status(), DeliveryStatus::Sent);
    }

    #[test]
    fn ai_messages_reject_transitions() {
        let mut reply = Message::ai("answer", MediaContent::Text);
        assert!(reply.mark_failed().is_err());
        assert_eq!(reply.status(), DeliveryStatus::Sent);
    }

    #[test]
    fn validation_catches_malformed_fields() {
        let nil = Message::user("x", MediaContent::Text).with_id(MessageId(uuid::Uuid::nil()));
        assert_eq!(nil.validate(), Err(MessagingError::NilMessageId));

        let early = Message::user("x", MediaContent::Text).with_timestamp(-5);
        assert_eq!(early.validate(), Err(MessagingError::InvalidTimestamp(-5)));

        let no_url = Message::user(
            "",
            MediaContent::Image {
                media_url: "  ".into(),
            },
        );
        assert_eq!(
            no_url.validate(),
            Err(MessagingError::MissingMediaUrl("image"))
        );

        let media_only = Message::user(
            "",
            MediaContent::Audio {
                media_url: "file:///rec.m4a".into(),
            },
        );
        assert!(media_only.validate().is_ok());
    }

    #[test]
    fn retry_creates_new_attempt_and_keeps_original() {
        let mut failed = Message::user(
            "look",
            MediaContent::Image {
                media_url: "file:///cat.png".into(),
            },
        )
        .with_metadata(json!({ "question_id": "q-7" }));
        failed.mark_failed().unwrap();
        let snapshot = failed.clone();

        let attempt = failed.retry_of().unwrap();
        assert_ne!(attempt.id(), failed.id());
        assert_eq!(attempt.status(), DeliveryStatus::Sending);
        assert_eq!(attempt.text(), "look");
        assert_eq!(attempt.media(), failed.media());
        assert_eq!(attempt.metadata(), Some(&json!({ "question_id": "q-7" })));
        assert_eq!(failed, snapshot);
    }

    #[test]
    fn only_failed_user_messages_are_retryable() {
        let sending = Message::user("x", MediaContent::Text);
        assert_eq!(
            sending.retry_of().unwrap_err(),
            MessagingError::NotRetryable(sending.id())
        );
        let ai = Message::ai("x", MediaContent::Text);
        assert!(ai.retry_of().is_err());
    }

    #[test]
    fn preview_uses_placeholder_for_media_only() {
        let doc = Message::user(
            "",
            MediaContent::Document {
                media_url: "file:///worksheet.pdf".into(),
            },
        );
        assert_eq!(doc.preview(), "[document]");

        let captioned = Message::user(
            "my drawing",
            MediaContent::Image {
                media_url: "file:///d.png".into(),
            },
        );
        assert_eq!(captioned.preview(), "my drawing");
    }

    #[test]
    fn wire_shape_is_flat() {
        let message = Message::user(
            "",
            MediaContent::Image {
                media_url: "file:///a.png".into(),
            },
        )
        .with_timestamp(10);
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["sender"], "user");
        assert_eq!(value["status"], "sending");
        assert_eq!(value["media_type"], "image");
        assert_eq!(value["media_url"], "file:///a.png");
        assert_eq!(value["feedback"], "none");

        let parsed: Message = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, message);
    }
}
