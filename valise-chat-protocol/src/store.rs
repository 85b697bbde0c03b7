//! Message store interface
//!
//! The persisted side of the chat feature, reduced to the four operations the
//! synchronization core needs: a bidirectional conversation fetch bounded by a
//! watermark, the persist call behind send, the bulk read-state update, and
//! the raw feed the conversation list is derived from.
//!
//! [`InMemoryMessageStore`] is the reference backend: it keeps rows in memory
//! and fans inserts/updates out to push subscribers, which makes it a faithful
//! stand-in for a remote store with change notifications.

use crate::{
    now_millis, Message, MessageId, PushChannel, PushEvent, PushSubscription, Result,
    SubscriptionGuard,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, warn};

/// Buffer for the push fan-out channel
const EVENT_BUFFER: usize = 256;

/// Persisted message operations consumed by the synchronization core
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Fetch the conversation between `user_a` and `user_b`, both directions,
    /// ascending by creation time
    ///
    /// `after` restricts the result to rows with `created_at >= after`.
    async fn fetch_conversation(
        &self,
        user_a: &str,
        user_b: &str,
        after: Option<i64>,
    ) -> Result<Vec<Message>>;

    /// Persist a new message and return the confirmed row
    /// (server id and creation timestamp assigned)
    async fn send_message(
        &self,
        sender_id: &str,
        receiver_id: &str,
        content: &str,
    ) -> Result<Message>;

    /// Mark every unread message from `counterpart_id` to `reader_id` as read
    ///
    /// Idempotent and monotonic; returns the number of rows updated.
    async fn mark_read(&self, reader_id: &str, counterpart_id: &str) -> Result<usize>;

    /// Fetch every message where `user_id` is sender or receiver,
    /// ascending by creation time
    async fn fetch_touching(&self, user_id: &str) -> Result<Vec<Message>>;
}

/// In-memory message store with push fan-out
///
/// Rows live in insertion order; reads sort ascending by `created_at`, so
/// same-millisecond rows keep their arrival order. Every insert and read-state
/// update is broadcast to push subscribers.
pub struct InMemoryMessageStore {
    rows: Arc<RwLock<Vec<Message>>>,
    events: broadcast::Sender<PushEvent>,
    next_id: AtomicU64,
}

impl InMemoryMessageStore {
    /// Create an empty store
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            rows: Arc::new(RwLock::new(Vec::new())),
            events,
            next_id: AtomicU64::new(1),
        }
    }

    /// Insert a confirmed row directly, without emitting a push event
    ///
    /// Fixture hook for tests and data import.
    pub async fn seed(&self, message: Message) {
        self.rows.write().await.push(message);
    }

    fn allocate_id(&self) -> String {
        format!("msg-{}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn emit(&self, event: PushEvent) {
        // No receivers is fine; the poll path covers delivery.
        let _ = self.events.send(event);
    }
}

impl Default for InMemoryMessageStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn fetch_conversation(
        &self,
        user_a: &str,
        user_b: &str,
        after: Option<i64>,
    ) -> Result<Vec<Message>> {
        let rows = self.rows.read().await;
        let mut result: Vec<Message> = rows
            .iter()
            .filter(|m| m.is_between(user_a, user_b))
            .filter(|m| after.map_or(true, |cutoff| m.created_at >= cutoff))
            .cloned()
            .collect();
        result.sort_by_key(|m| m.created_at);
        Ok(result)
    }

    async fn send_message(
        &self,
        sender_id: &str,
        receiver_id: &str,
        content: &str,
    ) -> Result<Message> {
        let message = Message {
            id: MessageId::Confirmed(self.allocate_id()),
            sender_id: sender_id.to_string(),
            receiver_id: receiver_id.to_string(),
            content: content.to_string(),
            created_at: now_millis(),
            read_at: None,
        };

        self.rows.write().await.push(message.clone());
        debug!("Persisted message {} from {}", message.id, sender_id);

        self.emit(PushEvent::Insert(message.clone()));
        Ok(message)
    }

    async fn mark_read(&self, reader_id: &str, counterpart_id: &str) -> Result<usize> {
        let now = now_millis();
        let mut updated = Vec::new();

        {
            let mut rows = self.rows.write().await;
            for message in rows.iter_mut() {
                if message.sender_id == counterpart_id
                    && message.receiver_id == reader_id
                    && message.read_at.is_none()
                {
                    message.read_at = Some(now);
                    updated.push(message.clone());
                }
            }
        }

        for message in &updated {
            self.emit(PushEvent::Update(message.clone()));
        }

        if !updated.is_empty() {
            debug!(
                "Marked {} messages from {} as read by {}",
                updated.len(),
                counterpart_id,
                reader_id
            );
        }
        Ok(updated.len())
    }

    async fn fetch_touching(&self, user_id: &str) -> Result<Vec<Message>> {
        let rows = self.rows.read().await;
        let mut result: Vec<Message> = rows
            .iter()
            .filter(|m| m.involves(user_id))
            .cloned()
            .collect();
        result.sort_by_key(|m| m.created_at);
        Ok(result)
    }
}

#[async_trait]
impl PushChannel for InMemoryMessageStore {
    async fn subscribe(&self, user_id: &str) -> Result<PushSubscription> {
        let mut source = self.events.subscribe();
        let (tx, rx) = mpsc::unbounded_channel();
        let user = user_id.to_string();

        let task = tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(event) => {
                        if !event.message().involves(&user) {
                            continue;
                        }
                        if tx.send(event).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // Dropped events are recovered by the poll cycle.
                        warn!("Push subscriber for {} lagged, skipped {}", user, skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        debug!("Push subscription established for {}", user_id);
        Ok(PushSubscription::new(rx, SubscriptionGuard::from_task(task)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: &str, sender: &str, receiver: &str, created_at: i64) -> Message {
        Message {
            id: MessageId::Confirmed(id.to_string()),
            sender_id: sender.to_string(),
            receiver_id: receiver.to_string(),
            content: format!("content of {}", id),
            created_at,
            read_at: None,
        }
    }

    #[tokio::test]
    async fn test_fetch_conversation_is_bidirectional_and_ordered() {
        let store = InMemoryMessageStore::new();
        store.seed(row("m2", "u2", "u1", 200)).await;
        store.seed(row("m1", "u1", "u2", 100)).await;
        store.seed(row("m3", "u1", "u3", 150)).await;

        let messages = store.fetch_conversation("u1", "u2", None).await.unwrap();
        let ids: Vec<&str> = messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m2"]);
    }

    #[tokio::test]
    async fn test_fetch_conversation_watermark_is_inclusive() {
        let store = InMemoryMessageStore::new();
        store.seed(row("m1", "u1", "u2", 100)).await;
        store.seed(row("m2", "u2", "u1", 200)).await;

        let messages = store
            .fetch_conversation("u1", "u2", Some(200))
            .await
            .unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id.as_str(), "m2");
    }

    #[tokio::test]
    async fn test_send_assigns_id_and_emits_insert() {
        let store = InMemoryMessageStore::new();
        let mut subscription = store.subscribe("u2").await.unwrap();

        let confirmed = store.send_message("u1", "u2", "hello").await.unwrap();
        assert!(!confirmed.is_temporary());
        assert!(confirmed.created_at > 0);

        let event = subscription.recv().await.unwrap();
        assert!(event.is_insert());
        assert_eq!(event.message().id, confirmed.id);
    }

    #[tokio::test]
    async fn test_mark_read_is_idempotent_and_emits_updates() {
        let store = InMemoryMessageStore::new();
        store.seed(row("m1", "u2", "u1", 100)).await;
        store.seed(row("m2", "u2", "u1", 200)).await;
        store
            .seed(Message {
                read_at: Some(250),
                ..row("m3", "u2", "u1", 220)
            })
            .await;

        let mut subscription = store.subscribe("u1").await.unwrap();

        assert_eq!(store.mark_read("u1", "u2").await.unwrap(), 2);
        assert_eq!(store.mark_read("u1", "u2").await.unwrap(), 0);

        let first = subscription.recv().await.unwrap();
        let second = subscription.recv().await.unwrap();
        assert!(first.is_update());
        assert!(second.is_update());
        assert!(first.message().read_at.is_some());
    }

    #[tokio::test]
    async fn test_subscribe_filters_to_involved_user() {
        let store = InMemoryMessageStore::new();
        let mut subscription = store.subscribe("u3").await.unwrap();

        store.send_message("u1", "u2", "not for u3").await.unwrap();
        store.send_message("u1", "u3", "for u3").await.unwrap();

        let event = subscription.recv().await.unwrap();
        assert_eq!(event.message().content, "for u3");
    }

    #[tokio::test]
    async fn test_fetch_touching_spans_counterparts() {
        let store = InMemoryMessageStore::new();
        store.seed(row("m1", "u1", "u2", 100)).await;
        store.seed(row("m2", "u3", "u1", 200)).await;
        store.seed(row("m3", "u2", "u3", 300)).await;

        let feed = store.fetch_touching("u1").await.unwrap();
        let ids: Vec<&str> = feed.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m2"]);
    }
}
