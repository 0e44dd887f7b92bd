//! Media references gathered while the user composes a message.

use crate::message::{MediaContent, Message};
use crate::{now_ms, MessagingError, Result};
use serde::{Deserialize, Serialize};

/// Pre-send bundle of attachment URIs. Never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentStaging {
    #[serde(default)]
    images: Vec<String>,
    #[serde(default)]
    audio_recording: Option<String>,
    #[serde(default)]
    documents: Vec<String>,
}

impl AttachmentStaging {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_image(&mut self, uri: impl Into<String>) {
        self.images.push(uri.into());
    }

    pub fn add_document(&mut self, uri: impl Into<String>) {
        self.documents.push(uri.into());
    }

    /// Stages a recording, returning the unsent one it replaces.
    pub fn set_audio_recording(&mut self, uri: impl Into<String>) -> Option<String> {
        self.audio_recording.replace(uri.into())
    }

    pub fn clear_audio_recording(&mut self) -> Option<String> {
        self.audio_recording.take()
    }

    pub fn remove_image(&mut self, index: usize) -> Option<String> {
        (index < self.images.len()).then(|| self.images.remove(index))
    }

    pub fn remove_document(&mut self, index: usize) -> Option<String> {
        (index < self.documents.len()).then(|| self.documents.remove(index))
    }

    pub fn images(&self) -> &[String] {
        &self.images
    }

    pub fn audio_recording(&self) -> Option<&str> {
        self.audio_recording.as_deref()
    }

    pub fn documents(&self) -> &[String] {
        &self.documents
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty() && self.audio_recording.is_none() && self.documents.is_empty()
    }

    /// Converts the bundle plus optional text into user messages, one per
    /// bubble.
    ///
    /// Order is images, then the audio recording, then documents. Text rides
    /// on the first image when there is one; otherwise it is sent as its own
    /// leading message. Every message in the batch shares one timestamp.
    pub fn into_messages(self, text: &str) -> Result<Vec<Message>> {
        let blank = text.trim().is_empty();
        if blank && self.is_empty() {
            return Err(MessagingError::EmptyComposition);
        }

        let media = self
            .images
            .into_iter()
            .map(|media_url| MediaContent::Image { media_url })
            .chain(
                self.audio_recording
                    .map(|media_url| MediaContent::Audio { media_url }),
            )
            .chain(
                self.documents
                    .into_iter()
                    .map(|media_url| MediaContent::Document { media_url }),
            );

        let created_ms = now_ms();
        let mut batch = Vec::new();
        let mut caption = (!blank).then(|| text.to_string());

        for item in media {
            let body = match (&item, caption.take()) {
                (MediaContent::Image { .. }, Some(caption)) => caption,
                (_, Some(caption)) => {
                    batch.push(Message::user(caption, MediaContent::Text));
                    String::new()
                }
                (_, None) => String::new(),
            };
            batch.push(Message::user(body, item));
        }
        if let Some(caption) = caption {
            batch.push(Message::user(caption, MediaContent::Text));
        }

        let batch = batch
            .into_iter()
            .map(|message| message.with_timestamp(created_ms))
            .collect::<Vec<_>>();
        for message in &batch {
            message.validate()?;
        }
        Ok(batch)
    }
}
