//! Delivery coordinator racing the tutor call against timeout, cancellation
//! and chat switches.

use super::{DeliveryConfig, DeliveryError, DeliveryHandle, DeliveryNotice};
use crate::store::{ConversationStore, DeliveryTicket, Resolution, StoreError, StoreResult};
use crate::tutor::{TutorBoundary, TutorRequest, TutorResponse};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};
use tutorchat_messaging::{AttachmentStaging, MediaContent, Message, MessageId};

type InFlight = Arc<Mutex<HashMap<MessageId, oneshot::Sender<()>>>>;

pub struct DeliveryCoordinator {
    store: Arc<ConversationStore>,
    tutor: Arc<dyn TutorBoundary>,
    config: DeliveryConfig,
    in_flight: InFlight,
    notice_tx: mpsc::UnboundedSender<DeliveryNotice>,
}

impl DeliveryCoordinator {
    pub fn new(
        store: Arc<ConversationStore>,
        tutor: Arc<dyn TutorBoundary>,
        config: DeliveryConfig,
    ) -> (Self, mpsc::UnboundedReceiver<DeliveryNotice>) {
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();

        let coordinator = Self {
            store,
            tutor,
            config,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            notice_tx,
        };

        (coordinator, notice_rx)
    }

    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    /// Appends the message as `sending`, then asks the tutor in the background.
    pub fn send(&self, message: Message) -> StoreResult<DeliveryHandle> {
        let ticket = self
            .store
            .begin_delivery(message, self.config.context_window)?;
        let message_id = ticket.message.id();
        let conversation_id = ticket.conversation_id;

        let (cancel_tx, cancel_rx) = oneshot::channel();
        lock(&self.in_flight).insert(message_id, cancel_tx);
        info!(%message_id, %conversation_id, "delivering message");

        let delivery = Delivery {
            store: Arc::clone(&self.store),
            tutor: Arc::clone(&self.tutor),
            config: self.config.clone(),
            in_flight: Arc::clone(&self.in_flight),
            notice_tx: self.notice_tx.clone(),
        };
        let task = tokio::spawn(delivery.run(ticket, cancel_rx));

        Ok(DeliveryHandle {
            message_id,
            conversation_id,
            task,
        })
    }

    /// Turns text plus staged attachments into bubbles and sends each one.
    pub fn send_composition(
        &self,
        text: &str,
        staging: AttachmentStaging,
    ) -> StoreResult<Vec<DeliveryHandle>> {
        staging
            .into_messages(text)?
            .into_iter()
            .map(|message| self.send(message))
            .collect()
    }

    /// Sends a new attempt of a failed message. The failed record stays as is.
    pub fn retry(&self, failed_id: MessageId) -> StoreResult<DeliveryHandle> {
        let failed = self
            .store
            .find_message(failed_id)
            .ok_or_else(|| StoreError::message_not_found(failed_id))?;
        let attempt = failed.retry_of()?;
        info!(%failed_id, attempt_id = %attempt.id(), "retrying message");
        self.send(attempt)
    }

    /// Cancels an in-flight delivery. Returns false if nothing was pending.
    pub fn cancel(&self, message_id: MessageId) -> bool {
        match lock(&self.in_flight).remove(&message_id) {
            Some(cancel_tx) => {
                debug!(%message_id, "cancelling delivery");
                cancel_tx.send(()).is_ok()
            }
            None => false,
        }
    }

    pub fn in_flight(&self) -> usize {
        lock(&self.in_flight).len()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Delivery {
    store: Arc<ConversationStore>,
    tutor: Arc<dyn TutorBoundary>,
    config: DeliveryConfig,
    in_flight: InFlight,
    notice_tx: mpsc::UnboundedSender<DeliveryNotice>,
}

impl Delivery {
    async fn run(self, ticket: DeliveryTicket, cancel_rx: oneshot::Receiver<()>) -> DeliveryNotice {
        let message_id = ticket.message.id();
        let switches = self.store.subscribe_switches();
        let request = TutorRequest {
            context: ticket.context.clone(),
            message: ticket.message.clone(),
        };
        let timeout = self.config.timeout;

        let outcome = tokio::select! {
            result = tokio::time::timeout(timeout, self.tutor.respond(request)) => match result {
                Ok(Ok(response)) => Ok(response),
                Ok(Err(err)) => Err(DeliveryError::Rejected(err.to_string())),
                Err(_) => Err(DeliveryError::Timeout(timeout)),
            },
            _ = cancel_rx => Err(DeliveryError::Cancelled),
            _ = switched_away(switches, ticket.epoch) => Err(DeliveryError::Cancelled),
        };

        let notice = match outcome {
            Ok(response) => {
                let replies = reply_messages(response);
                let reply_ids = replies.iter().map(Message::id).collect();
                match self.store.complete_delivery(&ticket, replies) {
                    Resolution::Applied => {
                        info!(%message_id, "message sent");
                        DeliveryNotice::sent(message_id, ticket.conversation_id, reply_ids)
                    }
                    Resolution::Stale => DeliveryNotice::failed(
                        message_id,
                        ticket.conversation_id,
                        DeliveryError::Cancelled,
                    ),
                }
            }
            Err(error) => {
                self.store.fail_delivery(&ticket);
                warn!(%message_id, %error, "message failed");
                DeliveryNotice::failed(message_id, ticket.conversation_id, error)
            }
        };

        lock(&self.in_flight).remove(&message_id);
        let _ = self.notice_tx.send(notice.clone());
        notice
    }
}

/// Resolves once the chat that owned `epoch` is no longer active.
async fn switched_away(mut switches: watch::Receiver<u64>, epoch: u64) {
    let closed = switches.wait_for(|current| *current != epoch).await.is_err();
    if closed {
        std::future::pending::<()>().await;
    }
}

/// One bubble per media item: the answer carries the illustration, or the
/// audio when there is no illustration.
fn reply_messages(response: TutorResponse) -> Vec<Message> {
    let TutorResponse {
        answer,
        illustration_url,
        audio_url,
    } = response;
    let illustration = illustration_url.filter(|url| !url.trim().is_empty());
    let audio = audio_url.filter(|url| !url.trim().is_empty());

    match (illustration, audio) {
        (Some(image), audio) => {
            let mut replies = vec![Message::ai(answer, MediaContent::Image { media_url: image })];
            if let Some(media_url) = audio {
                replies.push(Message::ai("", MediaContent::Audio { media_url }));
            }
            replies
        }
        (None, Some(media_url)) => vec![Message::ai(answer, MediaContent::Audio { media_url })],
        (None, None) => vec![Message::ai(answer, MediaContent::Text)],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tutor::TutorError;
    use async_trait::async_trait;
    use std::time::Duration;
    use tutorchat_messaging::{DeliveryStatus, Sender};

    /// Answers after a delay read from the message text ("slow" or anything else).
    struct PacedTutor;

    #[async_trait]
    impl TutorBoundary for PacedTutor {
        async fn respond(&self, request: TutorRequest) -> Result<TutorResponse, TutorError> {
            let delay = if request.message.text().starts_with("slow") {
                Duration::from_secs(5)
            } else {
                Duration::from_secs(1)
            };
            tokio::time::sleep(delay).await;
            Ok(TutorResponse::text(format!("re: {}", request.message.text())))
        }
    }

    struct SilentTutor;

    #[async_trait]
    impl TutorBoundary for SilentTutor {
        async fn respond(&self, _request: TutorRequest) -> Result<TutorResponse, TutorError> {
            std::future::pending().await
        }
    }

    struct FixedTutor(TutorResponse);

    #[async_trait]
    impl TutorBoundary for FixedTutor {
        async fn respond(&self, _request: TutorRequest) -> Result<TutorResponse, TutorError> {
            Ok(self.0.clone())
        }
    }

    fn harness(
        tutor: impl TutorBoundary + 'static,
    ) -> (DeliveryCoordinator, mpsc::UnboundedReceiver<DeliveryNotice>) {
        DeliveryCoordinator::new(
            Arc::new(ConversationStore::new()),
            Arc::new(tutor),
            DeliveryConfig::default().with_timeout(Duration::from_secs(30)),
        )
    }

    fn texts(messages: &[Message]) -> Vec<String> {
        messages.iter().map(|m| m.text().to_string()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn reply_is_placed_after_its_trigger_even_when_tail_moved() {
        let (coordinator, _rx) = harness(PacedTutor);
        let slow = coordinator
            .send(Message::user("slow question", MediaContent::Text))
            .unwrap();
        let fast = coordinator
            .send(Message::user("fast question", MediaContent::Text))
            .unwrap();

        assert_eq!(fast.outcome().await.status, DeliveryStatus::Sent);
        assert_eq!(slow.outcome().await.status, DeliveryStatus::Sent);

        let chat = coordinator.store().current_chat();
        assert_eq!(
            texts(&chat),
            [
                "slow question",
                "re: slow question",
                "fast question",
                "re: fast question"
            ]
        );
        let senders: Vec<_> = chat.iter().map(Message::sender).collect();
        assert_eq!(senders, [Sender::User, Sender::Ai, Sender::User, Sender::Ai]);
    }

    #[tokio::test]
    async fn message_is_sending_before_the_tutor_answers() {
        let (coordinator, _rx) = harness(SilentTutor);
        let handle = coordinator
            .send(Message::user("hello?", MediaContent::Text))
            .unwrap();

        let chat = coordinator.store().current_chat();
        assert_eq!(chat.len(), 1);
        assert_eq!(chat[0].status(), DeliveryStatus::Sending);
        assert_eq!(coordinator.in_flight(), 1);

        assert!(coordinator.cancel(handle.message_id()));
        let notice = handle.outcome().await;
        assert_eq!(notice.error, Some(DeliveryError::Cancelled));
        assert_eq!(
            coordinator.store().current_chat()[0].status(),
            DeliveryStatus::Failed
        );
        assert_eq!(coordinator.in_flight(), 0);
        assert!(!coordinator.cancel(notice.message_id));
    }

    #[tokio::test]
    async fn switching_chats_cancels_without_touching_the_new_chat() {
        let (coordinator, mut rx) = harness(SilentTutor);
        let handle = coordinator
            .send(Message::user("about dinosaurs", MediaContent::Text))
            .unwrap();

        let detached = coordinator.store().start_new_chat();
        assert_eq!(detached.messages[0].status(), DeliveryStatus::Failed);

        let notice = handle.outcome().await;
        assert_eq!(notice.status, DeliveryStatus::Failed);
        assert_eq!(notice.error, Some(DeliveryError::Cancelled));
        assert_eq!(notice.conversation_id, detached.id);
        assert!(coordinator.store().current_chat().is_empty());
        assert_eq!(rx.recv().await, Some(notice));
    }

    #[tokio::test]
    async fn chat_saved_mid_delivery_can_be_retried_after_switching_back() {
        let (coordinator, _rx) = harness(SilentTutor);
        let store = coordinator.store();
        let handle = coordinator
            .send(Message::user("about volcanoes", MediaContent::Text))
            .unwrap();
        let saved = store.archive_current_chat(Some("Volcanoes".into())).unwrap();

        store.start_new_chat();
        let notice = handle.outcome().await;
        assert_eq!(notice.error, Some(DeliveryError::Cancelled));

        store.load_chat_history(saved.id).unwrap();
        assert_eq!(store.current_chat()[0].status(), DeliveryStatus::Failed);

        let retried = coordinator.retry(notice.message_id).unwrap();
        assert_ne!(retried.message_id(), notice.message_id);
        let chat = store.current_chat();
        assert_eq!(texts(&chat), ["about volcanoes", "about volcanoes"]);
        assert_eq!(chat[1].status(), DeliveryStatus::Sending);
    }

    #[tokio::test]
    async fn rejected_answer_fails_the_message() {
        struct RejectingTutor;

        #[async_trait]
        impl TutorBoundary for RejectingTutor {
            async fn respond(&self, _request: TutorRequest) -> Result<TutorResponse, TutorError> {
                Err(TutorError::Rejected("content filtered".into()))
            }
        }

        let (coordinator, _rx) = harness(RejectingTutor);
        let notice = coordinator
            .send(Message::user("hmm", MediaContent::Text))
            .unwrap()
            .outcome()
            .await;

        assert!(matches!(
            notice.error,
            Some(DeliveryError::Rejected(ref r)) if r.contains("content filtered")
        ));
        let chat = coordinator.store().current_chat();
        assert_eq!(chat.len(), 1);
        assert_eq!(chat[0].status(), DeliveryStatus::Failed);
    }

    #[tokio::test]
    async fn retry_sends_a_new_message_and_keeps_the_failed_one() {
        let (coordinator, _rx) = harness(FixedTutor(TutorResponse::text("ok")));
        let store = coordinator.store();
        let mut failed = Message::user("try me", MediaContent::Text);
        failed.mark_failed().unwrap();
        store.add_message(failed.clone()).unwrap();

        let notice = coordinator.retry(failed.id()).unwrap().outcome().await;
        assert_ne!(notice.message_id, failed.id());
        assert_eq!(notice.status, DeliveryStatus::Sent);

        let chat = store.current_chat();
        assert_eq!(chat[0], failed);
        assert_eq!(texts(&chat), ["try me", "try me", "ok"]);

        assert!(matches!(
            coordinator.retry(notice.message_id),
            Err(StoreError::Validation(_))
        ));
        assert!(matches!(
            coordinator.retry(MessageId::new()),
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn illustrated_answer_with_audio_becomes_two_bubbles() {
        let response = TutorResponse {
            answer: "This is a volcano.".into(),
            illustration_url: Some("https://cdn.example/volcano.png".into()),
            audio_url: Some("https://cdn.example/volcano.mp3".into()),
        };
        let (coordinator, _rx) = harness(FixedTutor(response));
        let notice = coordinator
            .send(Message::user("what is a volcano", MediaContent::Text))
            .unwrap()
            .outcome()
            .await;
        assert_eq!(notice.replies.len(), 2);

        let chat = coordinator.store().current_chat();
        let kinds: Vec<_> = chat.iter().map(|m| m.media().kind()).collect();
        assert_eq!(kinds, ["text", "image", "audio"]);
        assert_eq!(chat[1].text(), "This is a volcano.");
        assert_eq!(chat[2].id(), notice.replies[1]);
    }

    #[test]
    fn audio_only_answer_rides_on_the_text() {
        let replies = reply_messages(TutorResponse {
            answer: "Listen!".into(),
            illustration_url: Some(" ".into()),
            audio_url: Some("https://cdn.example/a.mp3".into()),
        });
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].media().kind(), "audio");
        assert_eq!(replies[0].text(), "Listen!");
    }

    #[tokio::test]
    async fn composition_sends_each_bubble_in_order() {
        let (coordinator, _rx) = harness(SilentTutor);
        let mut staging = AttachmentStaging::new();
        staging.add_image("file:///drawing.png");
        staging.add_document("file:///worksheet.pdf");

        let handles = coordinator
            .send_composition("my homework", staging)
            .unwrap();
        assert_eq!(handles.len(), 2);

        let chat = coordinator.store().current_chat();
        let ids: Vec<_> = chat.iter().map(Message::id).collect();
        let handle_ids: Vec<_> = handles.iter().map(DeliveryHandle::message_id).collect();
        assert_eq!(ids, handle_ids);
        assert_eq!(chat[0].text(), "my homework");

        assert!(matches!(
            coordinator.send_composition(" ", AttachmentStaging::new()),
            Err(StoreError::Validation(_))
        ));
    }
}
