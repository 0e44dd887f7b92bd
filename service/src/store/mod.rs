//! Single owner of the active chat and the archive of past conversations.

use crate::storage::ChatArchive;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use tutorchat_messaging::{
    now_ms, Conversation, ConversationId, ConversationSummary, DeliveryStatus, Feedback, Message,
    MessageId, MessagingError,
};

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("invalid message: {0}")]
    Validation(#[from] MessagingError),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("persistence failed: {0}")]
    Persistence(String),
}

impl StoreError {
    pub(crate) fn conversation_not_found(id: ConversationId) -> Self {
        Self::NotFound {
            entity: "conversation",
            id: id.to_string(),
        }
    }

    pub(crate) fn message_not_found(id: MessageId) -> Self {
        Self::NotFound {
            entity: "message",
            id: id.to_string(),
        }
    }
}

/// Proof that a message was appended as `sending` while a given chat was
/// active. Resolutions carrying a ticket from an earlier chat are ignored.
#[derive(Debug, Clone)]
pub struct DeliveryTicket {
    pub message: Message,
    pub conversation_id: ConversationId,
    pub epoch: u64,
    /// Messages preceding `message`, oldest first.
    pub context: Vec<Message>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Applied,
    /// The ticket's chat is no longer active.
    Stale,
}

#[derive(Debug)]
struct ActiveChat {
    conversation_id: ConversationId,
    title: Option<String>,
    created_ms: i64,
    messages: Vec<Message>,
}

impl ActiveChat {
    fn fresh() -> Self {
        Self {
            conversation_id: ConversationId::new(),
            title: None,
            created_ms: now_ms(),
            messages: Vec::new(),
        }
    }

    fn resumed(conversation: &Conversation) -> Self {
        Self {
            conversation_id: conversation.id,
            title: conversation.title.clone(),
            created_ms: conversation.created_ms,
            messages: conversation.messages.clone(),
        }
    }

    fn position(&self, id: MessageId) -> Option<usize> {
        self.messages.iter().position(|m| m.id() == id)
    }

    fn to_conversation(&self) -> Conversation {
        Conversation {
            id: self.conversation_id,
            title: self.title.clone(),
            created_ms: self.created_ms,
            messages: self.messages.clone(),
        }
    }

    fn into_conversation(self) -> Conversation {
        Conversation {
            id: self.conversation_id,
            title: self.title,
            created_ms: self.created_ms,
            messages: self.messages,
        }
    }
}

#[derive(Debug)]
struct StoreState {
    active: ActiveChat,
    history: HashMap<ConversationId, Conversation>,
    epoch: u64,
}

/// Serializes every mutation behind one lock; none of its operations await.
pub struct ConversationStore {
    state: Mutex<StoreState>,
    archive: Option<Arc<dyn ChatArchive>>,
    switches: watch::Sender<u64>,
}

impl ConversationStore {
    /// In-memory store with no durable history.
    pub fn new() -> Self {
        Self::from_parts(HashMap::new(), None)
    }

    /// Loads the archived history and writes every later upsert through to it.
    pub fn with_archive(archive: Arc<dyn ChatArchive>) -> anyhow::Result<Self> {
        let mut history = HashMap::new();
        for mut conversation in archive.load_all()? {
            // A delivery persisted mid-flight can never complete after a restart.
            let abandoned = fail_pending(&mut conversation.messages);
            if abandoned > 0 {
                debug!(conversation_id = %conversation.id, abandoned, "resolved stale deliveries");
            }
            history.insert(conversation.id, conversation);
        }
        info!(conversations = history.len(), "loaded chat history");
        Ok(Self::from_parts(history, Some(archive)))
    }

    fn from_parts(
        history: HashMap<ConversationId, Conversation>,
        archive: Option<Arc<dyn ChatArchive>>,
    ) -> Self {
        let (switches, _) = watch::channel(0);
        Self {
            state: Mutex::new(StoreState {
                active: ActiveChat::fresh(),
                history,
                epoch: 0,
            }),
            archive,
            switches,
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends to the active chat in call order. An out-of-order timestamp is
    /// still placed after the current tail.
    pub fn add_message(&self, message: Message) -> StoreResult<()> {
        let mut state = self.lock();
        Self::append(&mut state.active, message)
    }

    fn append(active: &mut ActiveChat, message: Message) -> StoreResult<()> {
        message.validate()?;
        if active.position(message.id()).is_some() {
            return Err(MessagingError::DuplicateMessageId(message.id()).into());
        }
        if let Some(tail) = active.messages.last() {
            if message.created_ms() < tail.created_ms() {
                debug!(message_id = %message.id(), "appending message older than tail");
            }
        }
        active.messages.push(message);
        Ok(())
    }

    /// Clears the active chat and returns what was detached, with any
    /// in-flight message resolved to `failed`. Only the detached chat's own
    /// archived copy is touched, to settle deliveries it saved mid-flight.
    pub fn start_new_chat(&self) -> Conversation {
        let mut state = self.lock();
        let previous = self.switch(&mut state, ActiveChat::fresh());
        info!(conversation_id = %state.active.conversation_id, "started new chat");
        previous.into_conversation()
    }

    /// Replaces the active chat with a copy of an archived conversation.
    pub fn load_chat_history(&self, id: ConversationId) -> StoreResult<()> {
        let mut state = self.lock();
        let resumed = state
            .history
            .get(&id)
            .map(ActiveChat::resumed)
            .ok_or_else(|| StoreError::conversation_not_found(id))?;
        self.switch(&mut state, resumed);
        info!(conversation_id = %id, "resumed chat");
        Ok(())
    }

    fn switch(&self, state: &mut StoreState, next: ActiveChat) -> ActiveChat {
        let mut previous = std::mem::replace(&mut state.active, next);
        let cancelled = fail_pending(&mut previous.messages);
        if cancelled > 0 {
            debug!(
                conversation_id = %previous.conversation_id,
                cancelled,
                "in-flight messages failed by chat switch"
            );
        }

        // Nothing of the detached chat stays in flight, so an archived copy
        // saved mid-delivery takes the final statuses of the detached one.
        if let Some(archived) = state.history.get_mut(&previous.conversation_id) {
            if settle_pending(&mut archived.messages, &previous.messages) > 0 {
                if let Some(archive) = &self.archive {
                    if let Err(err) = archive.save(archived) {
                        warn!(
                            conversation_id = %archived.id,
                            error = %err,
                            "failed to persist settled deliveries"
                        );
                    }
                }
            }
        }
        if state.active.conversation_id == previous.conversation_id {
            settle_pending(&mut state.active.messages, &previous.messages);
        }

        state.epoch += 1;
        self.switches.send_replace(state.epoch);
        previous
    }

    /// Upserts a conversation by id. The only write path into the history.
    ///
    /// For a known id only the message sequence is replaced; the stored title
    /// survives unless a new one is given. A persistence failure is returned
    /// but the in-memory history keeps the new value.
    pub fn update_chat_history(&self, conversation: Conversation) -> StoreResult<()> {
        let mut state = self.lock();
        self.upsert(&mut state, conversation).map(|_| ())
    }

    fn upsert(
        &self,
        state: &mut StoreState,
        conversation: Conversation,
    ) -> StoreResult<Conversation> {
        let mut seen = HashSet::new();
        for message in &conversation.messages {
            message.validate()?;
            if !seen.insert(message.id()) {
                return Err(MessagingError::DuplicateMessageId(message.id()).into());
            }
        }

        let id = conversation.id;
        let stored = match state.history.entry(id) {
            Entry::Occupied(entry) => {
                let stored = entry.into_mut();
                stored.messages = conversation.messages;
                if conversation.title.is_some() {
                    stored.title = conversation.title;
                }
                stored
            }
            Entry::Vacant(entry) => entry.insert(conversation),
        };
        debug!(conversation_id = %id, "chat history updated");

        if let Some(archive) = &self.archive {
            archive.save(stored).map_err(|err| {
                warn!(conversation_id = %id, error = %err, "failed to persist conversation");
                StoreError::Persistence(format!("{err:#}"))
            })?;
        }
        Ok(stored.clone())
    }

    /// Saves the active chat into the history under its conversation id.
    pub fn archive_current_chat(&self, title: Option<String>) -> StoreResult<Conversation> {
        let mut state = self.lock();
        if title.is_some() {
            state.active.title = title;
        }
        let conversation = state.active.to_conversation();
        self.upsert(&mut state, conversation)
    }

    pub fn set_feedback(&self, message_id: MessageId, feedback: Feedback) -> StoreResult<()> {
        let mut state = self.lock();
        let message = state
            .active
            .messages
            .iter_mut()
            .find(|m| m.id() == message_id)
            .ok_or_else(|| StoreError::message_not_found(message_id))?;
        message.set_feedback(feedback);
        Ok(())
    }

    pub fn current_chat(&self) -> Vec<Message> {
        self.lock().active.messages.clone()
    }

    pub fn active_conversation_id(&self) -> ConversationId {
        self.lock().active.conversation_id
    }

    /// Active conversation id and its messages, read under one lock.
    pub fn snapshot(&self) -> (ConversationId, Vec<Message>) {
        let state = self.lock();
        (state.active.conversation_id, state.active.messages.clone())
    }

    pub fn conversation(&self, id: ConversationId) -> Option<Conversation> {
        self.lock().history.get(&id).cloned()
    }

    pub fn find_message(&self, id: MessageId) -> Option<Message> {
        let state = self.lock();
        state
            .active
            .position(id)
            .map(|index| state.active.messages[index].clone())
    }

    /// History rows, most recently active first.
    pub fn chat_history(&self) -> Vec<ConversationSummary> {
        let mut summaries: Vec<_> = self
            .lock()
            .history
            .values()
            .map(Conversation::summary)
            .collect();
        summaries.sort_by(|a, b| b.date_ms.cmp(&a.date_ms));
        summaries
    }

    /// Observes chat switches; the value changes on every new or resumed chat.
    pub fn subscribe_switches(&self) -> watch::Receiver<u64> {
        self.switches.subscribe()
    }

    /// Appends a pending user message and returns the ticket used to resolve it.
    pub fn begin_delivery(
        &self,
        message: Message,
        context_window: usize,
    ) -> StoreResult<DeliveryTicket> {
        if message.status() != DeliveryStatus::Sending {
            return Err(MessagingError::NotPending(message.id()).into());
        }

        let mut state = self.lock();
        Self::append(&mut state.active, message.clone())?;

        let preceding = state.active.messages.len() - 1;
        let start = preceding.saturating_sub(context_window);
        Ok(DeliveryTicket {
            context: state.active.messages[start..preceding].to_vec(),
            message,
            conversation_id: state.active.conversation_id,
            epoch: state.epoch,
        })
    }

    /// Marks the ticket's message `sent` and places the replies directly
    /// after it, even if later messages were appended meanwhile.
    pub fn complete_delivery(&self, ticket: &DeliveryTicket, replies: Vec<Message>) -> Resolution {
        let mut state = self.lock();
        let Some(index) = Self::pending_position(&state, ticket) else {
            return Resolution::Stale;
        };

        let messages = &mut state.active.messages;
        if let Err(err) = messages[index].mark_sent() {
            warn!(message_id = %ticket.message.id(), %err, "cannot complete delivery");
            return Resolution::Stale;
        }

        let floor = messages[index].created_ms();
        let ceiling = messages.get(index + 1).map(Message::created_ms);
        for (offset, reply) in replies.into_iter().enumerate() {
            let mut created_ms = reply.created_ms().max(floor);
            if let Some(ceiling) = ceiling {
                created_ms = created_ms.min(ceiling);
            }
            messages.insert(index + 1 + offset, reply.with_timestamp(created_ms));
        }
        Resolution::Applied
    }

    pub fn fail_delivery(&self, ticket: &DeliveryTicket) -> Resolution {
        let mut state = self.lock();
        let Some(index) = Self::pending_position(&state, ticket) else {
            return Resolution::Stale;
        };
        match state.active.messages[index].mark_failed() {
            Ok(()) => Resolution::Applied,
            Err(err) => {
                warn!(message_id = %ticket.message.id(), %err, "cannot fail delivery");
                Resolution::Stale
            }
        }
    }

    fn pending_position(state: &StoreState, ticket: &DeliveryTicket) -> Option<usize> {
        if state.epoch != ticket.epoch {
            debug!(message_id = %ticket.message.id(), "delivery resolved after chat switch");
            return None;
        }
        state.active.position(ticket.message.id())
    }
}

/// Resolves every `sending` message to `failed`, returning how many changed.
fn fail_pending(messages: &mut [Message]) -> usize {
    let mut failed = 0;
    for message in messages.iter_mut() {
        if message.status() == DeliveryStatus::Sending && message.mark_failed().is_ok() {
            failed += 1;
        }
    }
    failed
}

/// Resolves `sending` messages of a stored copy to the status the detached
/// chat ended with: `sent` if it was answered there, `failed` otherwise.
fn settle_pending(messages: &mut [Message], detached: &[Message]) -> usize {
    let mut settled = 0;
    for message in messages.iter_mut() {
        if message.status() != DeliveryStatus::Sending {
            continue;
        }
        let answered = detached
            .iter()
            .any(|d| d.id() == message.id() && d.status() == DeliveryStatus::Sent);
        let result = if answered {
            message.mark_sent()
        } else {
            message.mark_failed()
        };
        if result.is_ok() {
            settled += 1;
        }
    }
    settled
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new()
    }
}
