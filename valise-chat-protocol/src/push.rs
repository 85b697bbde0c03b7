//! Push channel interface
//!
//! Server-push transports deliver raw inserted/updated rows for every message
//! touching the subscribed user. This module normalizes those rows into
//! [`PushEvent`]s and defines the subscription seam the synchronization core
//! consumes; the finer per-conversation filter is applied downstream by the
//! core, not here.

use crate::{Message, Result};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// A normalized push notification
#[derive(Debug, Clone)]
pub enum PushEvent {
    /// A new message row was inserted
    Insert(Message),
    /// An existing message row changed (read receipts)
    Update(Message),
}

impl PushEvent {
    /// Normalize a raw inserted row
    pub fn from_insert_row(row: Value) -> Result<Self> {
        let row: crate::MessageRow = serde_json::from_value(row)?;
        Ok(Self::Insert(row.into()))
    }

    /// Normalize a raw updated row
    pub fn from_update_row(row: Value) -> Result<Self> {
        let row: crate::MessageRow = serde_json::from_value(row)?;
        Ok(Self::Update(row.into()))
    }

    /// The message carried by this event
    pub fn message(&self) -> &Message {
        match self {
            Self::Insert(message) | Self::Update(message) => message,
        }
    }

    /// Consume the event, returning the carried message
    pub fn into_message(self) -> Message {
        match self {
            Self::Insert(message) | Self::Update(message) => message,
        }
    }

    /// Check if this is an insert event
    pub fn is_insert(&self) -> bool {
        matches!(self, Self::Insert(_))
    }

    /// Check if this is an update event
    pub fn is_update(&self) -> bool {
        matches!(self, Self::Update(_))
    }
}

/// Guard that tears down a subscription's forwarding task when dropped
#[derive(Debug)]
pub struct SubscriptionGuard {
    task: Option<JoinHandle<()>>,
}

impl SubscriptionGuard {
    /// Guard a spawned forwarding task
    pub fn from_task(task: JoinHandle<()>) -> Self {
        Self { task: Some(task) }
    }

    /// Guard for subscriptions with no forwarding task of their own
    pub fn noop() -> Self {
        Self { task: None }
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// An active push subscription
///
/// Dropping the subscription (or calling [`unsubscribe`](Self::unsubscribe))
/// detaches it from the transport; no further events are delivered.
#[derive(Debug)]
pub struct PushSubscription {
    events: mpsc::UnboundedReceiver<PushEvent>,
    _guard: SubscriptionGuard,
}

impl PushSubscription {
    /// Wrap an event receiver and its teardown guard
    pub fn new(events: mpsc::UnboundedReceiver<PushEvent>, guard: SubscriptionGuard) -> Self {
        Self {
            events,
            _guard: guard,
        }
    }

    /// Receive the next event; `None` once the transport side is gone
    pub async fn recv(&mut self) -> Option<PushEvent> {
        self.events.recv().await
    }

    /// Tear the subscription down explicitly
    pub fn unsubscribe(self) {
        debug!("Push subscription closed");
    }
}

/// A transport that pushes message inserts/updates for a user
///
/// Implementations deliver events for every row where the subscribed user is
/// sender or receiver. Delivery is best-effort: events may be duplicated or
/// missed entirely, and consumers must stay correct either way.
#[async_trait]
pub trait PushChannel: Send + Sync {
    /// Subscribe to insert/update events touching `user_id`
    async fn subscribe(&self, user_id: &str) -> Result<PushSubscription>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ChatError, MessageId};
    use serde_json::json;

    #[test]
    fn test_insert_row_normalization() {
        let event = PushEvent::from_insert_row(json!({
            "id": "m7",
            "sender_id": "u1",
            "receiver_id": "u2",
            "content": "bag at gate 4",
            "created_at": 1_700_000_000_000i64,
            "read_at": null
        }))
        .unwrap();

        assert!(event.is_insert());
        assert_eq!(event.message().id, MessageId::Confirmed("m7".to_string()));
        assert_eq!(event.message().content, "bag at gate 4");
    }

    #[test]
    fn test_malformed_row_is_json_error() {
        let result = PushEvent::from_update_row(json!({ "id": "m7" }));
        assert!(matches!(result, Err(ChatError::Json(_))));
    }

    #[test]
    fn test_event_predicates() {
        let row = json!({
            "id": "m1",
            "sender_id": "a",
            "receiver_id": "b",
            "content": "x",
            "created_at": 1i64
        });
        let insert = PushEvent::from_insert_row(row.clone()).unwrap();
        let update = PushEvent::from_update_row(row).unwrap();

        assert!(insert.is_insert());
        assert!(!insert.is_update());
        assert!(update.is_update());
        assert_eq!(insert.into_message().id, update.into_message().id);
    }

    #[tokio::test]
    async fn test_subscription_delivers_until_sender_dropped() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscription = PushSubscription::new(rx, SubscriptionGuard::noop());

        let row = json!({
            "id": "m1",
            "sender_id": "a",
            "receiver_id": "b",
            "content": "x",
            "created_at": 1i64
        });
        tx.send(PushEvent::from_insert_row(row).unwrap()).unwrap();
        drop(tx);

        assert!(subscription.recv().await.is_some());
        assert!(subscription.recv().await.is_none());
    }
}
