//! Chat models shared by the TutorChat conversation store and delivery layers.

pub mod conversation;
pub mod message;
pub mod staging;

pub use conversation::{Conversation, ConversationSummary};
pub use message::{Author, DeliveryStatus, Feedback, MediaContent, Message, Sender};
pub use staging::AttachmentStaging;

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Unique identifier assigned to a single chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Unique identifier assigned to a logical conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationId(pub Uuid);

impl ConversationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConversationId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Messaging-specific errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessagingError {
    #[error("message id must not be nil")]
    NilMessageId,
    #[error("message timestamp {0} is before the epoch")]
    InvalidTimestamp(i64),
    #[error("{0} attachment is missing its media url")]
    MissingMediaUrl(&'static str),
    #[error("nothing to send: text is blank and no attachments are staged")]
    EmptyComposition,
    #[error("message {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: MessageId,
        from: DeliveryStatus,
        to: DeliveryStatus,
    },
    #[error("message {0} is not a failed user message and cannot be retried")]
    NotRetryable(MessageId),
    #[error("message {0} is not a user message awaiting delivery")]
    NotPending(MessageId),
    #[error("message id {0} is already used in this conversation")]
    DuplicateMessageId(MessageId),
}

pub type Result<T> = std::result::Result<T, MessagingError>;
