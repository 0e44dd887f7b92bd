//! Drives user messages through `sending -> sent | failed` against the tutor.

mod coordinator;

pub use coordinator::DeliveryCoordinator;

use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::warn;
use tutorchat_messaging::{now_ms, ConversationId, DeliveryStatus, MessageId};

/// Why a delivery ended in `failed`. Only reported through notices; the
/// message record itself just says `failed`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("tutor did not answer within {0:?}")]
    Timeout(Duration),
    #[error("tutor rejected the message: {0}")]
    Rejected(String),
    #[error("delivery cancelled")]
    Cancelled,
}

/// Configuration for the delivery coordinator.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// How long to wait for the tutor before failing the message.
    pub timeout: Duration,
    /// Number of preceding messages sent along as context.
    pub context_window: usize,
}

impl DeliveryConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_context_window(mut self, context_window: usize) -> Self {
        self.context_window = context_window;
        self
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            context_window: 20,
        }
    }
}

/// Transient notification for the UI layer about a finished delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryNotice {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub status: DeliveryStatus,
    pub error: Option<DeliveryError>,
    /// Tutor messages appended after the user message.
    pub replies: Vec<MessageId>,
    pub resolved_at_ms: i64,
}

impl DeliveryNotice {
    fn sent(
        message_id: MessageId,
        conversation_id: ConversationId,
        replies: Vec<MessageId>,
    ) -> Self {
        Self {
            message_id,
            conversation_id,
            status: DeliveryStatus::Sent,
            error: None,
            replies,
            resolved_at_ms: now_ms(),
        }
    }

    fn failed(
        message_id: MessageId,
        conversation_id: ConversationId,
        error: DeliveryError,
    ) -> Self {
        Self {
            message_id,
            conversation_id,
            status: DeliveryStatus::Failed,
            error: Some(error),
            replies: Vec::new(),
            resolved_at_ms: now_ms(),
        }
    }
}

/// An accepted send whose outcome is still pending.
#[derive(Debug)]
pub struct DeliveryHandle {
    message_id: MessageId,
    conversation_id: ConversationId,
    task: JoinHandle<DeliveryNotice>,
}

impl DeliveryHandle {
    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }

    /// Waits for the message to reach `sent` or `failed`.
    pub async fn outcome(self) -> DeliveryNotice {
        match self.task.await {
            Ok(notice) => notice,
            Err(err) => {
                warn!(message_id = %self.message_id, %err, "delivery task aborted");
                DeliveryNotice::failed(
                    self.message_id,
                    self.conversation_id,
                    DeliveryError::Cancelled,
                )
            }
        }
    }
}
