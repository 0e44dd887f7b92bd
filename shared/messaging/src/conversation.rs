//! Conversation threads and their history-listing projection.

use crate::message::{Message, Sender};
use crate::{now_ms, ConversationId};
use serde::{Deserialize, Serialize};

const DERIVED_TITLE_CHARS: usize = 40;
const UNTITLED: &str = "New chat";

/// An ordered, titled thread of messages.
///
/// The preview (`last_message`) and activity date are not stored: they are
/// derived from the tail of `messages` whenever they are read, so they can
/// never drift from the sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    /// Title chosen by the user, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub created_ms: i64,
    pub messages: Vec<Message>,
}

impl Conversation {
    pub fn new(id: ConversationId, messages: Vec<Message>) -> Self {
        Self {
            id,
            title: None,
            created_ms: now_ms(),
            messages,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// User-set title, else the opening of the first user message.
    pub fn title(&self) -> String {
        if let Some(title) = self.title.as_deref().filter(|t| !t.trim().is_empty()) {
            return title.to_string();
        }

        self.messages
            .iter()
            .filter(|m| m.sender() == Sender::User)
            .map(|m| m.text().trim())
            .find(|text| !text.is_empty())
            .map(|text| {
                let mut derived: String = text.chars().take(DERIVED_TITLE_CHARS).collect();
                if text.chars().count() > DERIVED_TITLE_CHARS {
                    derived.push('…');
                }
                derived
            })
            .unwrap_or_else(|| UNTITLED.to_string())
    }

    pub fn last_message(&self) -> String {
        self.messages
            .last()
            .map(Message::preview)
            .unwrap_or_default()
    }

    pub fn date_ms(&self) -> i64 {
        self.messages
            .last()
            .map(Message::created_ms)
            .unwrap_or(self.created_ms)
    }

    pub fn summary(&self) -> ConversationSummary {
        ConversationSummary {
            id: self.id,
            title: self.title(),
            last_message: self.last_message(),
            date_ms: self.date_ms(),
            message_count: self.messages.len(),
        }
    }
}

/// Row shown in the chat history list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: ConversationId,
    pub title: String,
    pub last_message: String,
    pub date_ms: i64,
    pub message_count: usize,
}
