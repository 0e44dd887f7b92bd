use std::path::Path;

use anyhow::{Context, Result};
use tutorchat_messaging::Conversation;

/// Durable home of the chat history.
pub trait ChatArchive: Send + Sync {
    /// Every archived conversation, read once at startup.
    fn load_all(&self) -> Result<Vec<Conversation>>;

    /// Inserts or replaces one conversation.
    fn save(&self, conversation: &Conversation) -> Result<()>;
}

#[derive(Clone)]
pub struct SledArchive {
    db: sled::Db,
}

impl SledArchive {
    const TREE: &'static str = "conversations";

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)
            .with_context(|| format!("failed to create storage directory {:?}", path))?;
        let db = sled::open(path)
            .with_context(|| format!("failed to open sled database at {:?}", path))?;
        Ok(Self { db })
    }

    /// Throwaway database removed on drop.
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .context("failed to open temporary sled database")?;
        Ok(Self { db })
    }

    fn tree(&self) -> sled::Result<sled::Tree> {
        self.db.open_tree(Self::TREE)
    }
}

impl ChatArchive for SledArchive {
    fn load_all(&self) -> Result<Vec<Conversation>> {
        let tree = self.tree()?;
        let mut conversations = Vec::new();
        for entry in tree.iter() {
            let (key, value) = entry?;
            let conversation: Conversation = serde_json::from_slice(&value).with_context(|| {
                format!(
                    "stored conversation {} is corrupt",
                    String::from_utf8_lossy(&key)
                )
            })?;
            conversations.push(conversation);
        }
        Ok(conversations)
    }

    fn save(&self, conversation: &Conversation) -> Result<()> {
        let tree = self.tree()?;
        let key = conversation.id.to_string();
        let encoded = serde_json::to_vec(conversation)?;
        tree.insert(key.as_bytes(), encoded)?;
        tree.flush()?;
        Ok(())
    }
}
