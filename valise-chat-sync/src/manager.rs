//! Conversation scope management
//!
//! [`ConversationManager`] owns "which conversation is open" and is the facade
//! the operator console drives. Opening a conversation atomically tears down
//! the previous scope's push subscription and poll loop and builds them for
//! the new counterpart; the scope epoch, a monotonically increasing counter
//! checked inside the reconciler's merge lock, guarantees that no event from
//! a torn-down scope can reach the new view.
//!
//! ## Architecture
//!
//! ```text
//! ConversationManager (facade)
//!   ├── push forwarding task ──► MessageReconciler (serialized merge point)
//!   ├── PollScheduler ─────────► MessageReconciler
//!   └── SummaryAggregator ───── MessageStore
//! ```

use crate::{
    reconciler::{IngestOutcome, MessageReconciler},
    summary::SummaryAggregator,
    PollScheduler, SyncConfig, SyncEvent,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use valise_chat_protocol::{
    ConversationSummary, Message, MessageStore, PushChannel, PushSubscription, Result,
};

/// Shared handle the per-scope background tasks operate through
pub(crate) struct ScopeContext {
    pub(crate) self_id: String,
    pub(crate) counterpart_id: String,
    /// Epoch this scope was created under
    pub(crate) scope_epoch: u64,
    /// Live epoch counter owned by the manager
    pub(crate) epoch: Arc<AtomicU64>,
    pub(crate) reconciler: Arc<MessageReconciler>,
    pub(crate) store: Arc<dyn MessageStore>,
    pub(crate) summaries: Arc<SummaryAggregator>,
    pub(crate) events: broadcast::Sender<SyncEvent>,
}

impl ScopeContext {
    /// Whether this scope is still the live one
    pub(crate) fn is_current(&self) -> bool {
        self.epoch.load(Ordering::SeqCst) == self.scope_epoch
    }

    pub(crate) fn emit(&self, event: SyncEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Side effects after a merge: inbound messages are read immediately
    /// while the conversation is on screen, and view changes are announced
    pub(crate) async fn handle_outcome(&self, outcome: IngestOutcome) {
        if outcome.is_inbound() {
            if let Err(error) = self
                .store
                .mark_read(&self.self_id, &self.counterpart_id)
                .await
            {
                warn!("Failed to mark conversation read: {}", error);
            }
        }
        if outcome.changed_view() {
            self.emit(SyncEvent::ConversationUpdated {
                counterpart_id: self.counterpart_id.clone(),
            });
        }
    }

    /// Re-derive the conversation list, announcing only real changes
    pub(crate) async fn refresh_summaries(&self) {
        match self.summaries.refresh().await {
            Ok(true) => self.emit(SyncEvent::SummariesUpdated),
            Ok(false) => {}
            Err(error) => warn!("Summary refresh failed: {}", error),
        }
    }
}

/// Resources of the currently open scope
struct ActiveScope {
    counterpart_id: String,
    /// Push forwarding task; `None` when the subscription failed to establish
    push_task: Option<JoinHandle<()>>,
    poll: PollScheduler,
}

impl ActiveScope {
    fn shutdown(mut self) {
        if let Some(task) = self.push_task.take() {
            task.abort();
        }
        self.poll.stop();
    }
}

/// Owns the open conversation and the synchronization resources bound to it
pub struct ConversationManager {
    self_id: String,
    store: Arc<dyn MessageStore>,
    push: Arc<dyn PushChannel>,
    config: SyncConfig,
    reconciler: Arc<MessageReconciler>,
    summaries: Arc<SummaryAggregator>,
    epoch: Arc<AtomicU64>,
    active: Mutex<Option<ActiveScope>>,
    events: broadcast::Sender<SyncEvent>,
}

impl ConversationManager {
    /// Create a manager for the signed-in operator
    pub fn new(
        self_id: &str,
        store: Arc<dyn MessageStore>,
        push: Arc<dyn PushChannel>,
        config: SyncConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity);
        Self {
            reconciler: Arc::new(MessageReconciler::new(store.clone())),
            summaries: Arc::new(SummaryAggregator::new(self_id, store.clone())),
            self_id: self_id.to_string(),
            store,
            push,
            config,
            epoch: Arc::new(AtomicU64::new(0)),
            active: Mutex::new(None),
            events,
        }
    }

    /// Open the conversation with `counterpart_id`
    ///
    /// Reselecting the already-open counterpart refreshes the view in place
    /// without tearing anything down. Switching counterparts advances the
    /// epoch before the previous scope's resources are released, so events
    /// already in flight are discarded rather than applied to the new view.
    pub async fn open_conversation(&self, counterpart_id: &str) -> Result<()> {
        let mut active = self.active.lock().await;

        if let Some(scope) = active.as_ref() {
            if scope.counterpart_id == counterpart_id {
                debug!("Reselected conversation with {}, refreshing", counterpart_id);
                let epoch = self.epoch.load(Ordering::SeqCst);
                match self.reconciler.refresh(epoch).await {
                    Ok(outcome) if outcome.changed_view() => {
                        self.emit(SyncEvent::ConversationUpdated {
                            counterpart_id: counterpart_id.to_string(),
                        });
                    }
                    Ok(_) => {}
                    Err(error) => {
                        warn!("Refresh fetch failed, poll will recover: {}", error)
                    }
                }
                return Ok(());
            }
        }

        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(previous) = active.take() {
            info!(
                "Switching conversation from {} to {}",
                previous.counterpart_id, counterpart_id
            );
            previous.shutdown();
        }

        let context = Arc::new(ScopeContext {
            self_id: self.self_id.clone(),
            counterpart_id: counterpart_id.to_string(),
            scope_epoch: epoch,
            epoch: self.epoch.clone(),
            reconciler: self.reconciler.clone(),
            store: self.store.clone(),
            summaries: self.summaries.clone(),
            events: self.events.clone(),
        });

        // A failed push subscription never blocks entering the conversation;
        // polling bounds the staleness instead.
        let push_task = match self.push.subscribe(&self.self_id).await {
            Ok(subscription) => Some(spawn_push_loop(context.clone(), subscription)),
            Err(error) => {
                warn!("Push subscription failed, relying on poll: {}", error);
                self.emit(SyncEvent::SubscriptionError {
                    message: error.to_string(),
                });
                None
            }
        };

        match self
            .reconciler
            .open(&self.self_id, counterpart_id, epoch)
            .await
        {
            Ok(count) => info!(
                "Opened conversation with {} ({} messages)",
                counterpart_id, count
            ),
            Err(error) if error.is_stale_scope() => {
                debug!("Open superseded during initial fetch: {}", error)
            }
            Err(error) => {
                // The scope is installed; the first successful poll completes
                // the initial fill.
                warn!("Initial conversation fetch failed, poll will recover: {}", error);
            }
        }

        let poll = PollScheduler::start(context.clone(), self.config.poll_interval);

        if let Err(error) = self.store.mark_read(&self.self_id, counterpart_id).await {
            warn!("Failed to mark conversation read: {}", error);
        }
        context.refresh_summaries().await;

        *active = Some(ActiveScope {
            counterpart_id: counterpart_id.to_string(),
            push_task,
            poll,
        });

        self.emit(SyncEvent::ConversationUpdated {
            counterpart_id: counterpart_id.to_string(),
        });
        Ok(())
    }

    /// Close the open conversation and release its resources
    pub async fn close(&self) {
        let mut active = self.active.lock().await;
        if let Some(scope) = active.take() {
            self.epoch.fetch_add(1, Ordering::SeqCst);
            let counterpart_id = scope.counterpart_id.clone();
            scope.shutdown();
            self.reconciler.close().await;
            info!("Closed conversation with {}", counterpart_id);
            self.emit(SyncEvent::ConversationClosed { counterpart_id });
        }
    }

    /// Send a message in the open conversation
    ///
    /// The view shows a temporary entry immediately; the returned message is
    /// the server-confirmed row. Validation failures are rejected before any
    /// network call, and a failed persist rolls the temporary entry back.
    pub async fn send_message(&self, content: &str) -> Result<Message> {
        let confirmed = self.reconciler.send(content).await?;
        self.emit(SyncEvent::ConversationUpdated {
            counterpart_id: confirmed.receiver_id.clone(),
        });
        if let Err(error) = self.refresh_summaries().await {
            warn!("Summary refresh after send failed: {}", error);
        }
        Ok(confirmed)
    }

    /// Mark every unread message from `counterpart_id` as read
    ///
    /// Idempotent; returns the number of messages updated.
    pub async fn mark_read(&self, counterpart_id: &str) -> Result<usize> {
        let updated = self.store.mark_read(&self.self_id, counterpart_id).await?;
        if let Err(error) = self.refresh_summaries().await {
            warn!("Summary refresh after mark_read failed: {}", error);
        }
        Ok(updated)
    }

    /// The open conversation's message list
    pub async fn current_view(&self) -> Vec<Message> {
        self.reconciler.current_view().await
    }

    /// The latest conversation summary list
    pub async fn summaries(&self) -> Vec<ConversationSummary> {
        self.summaries.summaries().await
    }

    /// Re-derive the conversation list now
    ///
    /// Returns whether it changed. The manager also refreshes on the poll
    /// cadence and after sends, reads, and inbound messages.
    pub async fn refresh_summaries(&self) -> Result<bool> {
        let changed = self.summaries.refresh().await?;
        if changed {
            self.emit(SyncEvent::SummariesUpdated);
        }
        Ok(changed)
    }

    /// Counterpart of the open conversation, if any
    pub async fn open_counterpart(&self) -> Option<String> {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|scope| scope.counterpart_id.clone())
    }

    /// Subscribe to change notifications
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }
}

/// Forward push events into the merge point until the scope is torn down
fn spawn_push_loop(context: Arc<ScopeContext>, mut subscription: PushSubscription) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = subscription.recv().await {
            if !context.is_current() {
                debug!(
                    "Push loop for epoch {} ended by scope change",
                    context.scope_epoch
                );
                break;
            }
            let outcome = context
                .reconciler
                .ingest_push(event, context.scope_epoch)
                .await;
            context.handle_outcome(outcome).await;
            if outcome.changed_view() {
                context.refresh_summaries().await;
            }
        }
        debug!("Push forwarding loop ended");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use valise_chat_protocol::{ChatError, InMemoryMessageStore};

    fn manager_over(store: &Arc<InMemoryMessageStore>) -> ConversationManager {
        ConversationManager::new(
            "u1",
            store.clone() as Arc<dyn MessageStore>,
            store.clone() as Arc<dyn PushChannel>,
            SyncConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_send_requires_open_conversation() {
        let store = Arc::new(InMemoryMessageStore::new());
        let manager = manager_over(&store);
        let result = manager.send_message("hello").await;
        assert!(matches!(result, Err(ChatError::NoOpenConversation)));
    }

    #[tokio::test]
    async fn test_open_send_and_view() {
        let store = Arc::new(InMemoryMessageStore::new());
        let manager = manager_over(&store);

        manager.open_conversation("u2").await.unwrap();
        assert_eq!(manager.open_counterpart().await.as_deref(), Some("u2"));

        let confirmed = manager.send_message("hello").await.unwrap();
        let view = manager.current_view().await;
        assert_eq!(view.len(), 1);
        assert_eq!(view[0].id, confirmed.id);
    }

    #[tokio::test]
    async fn test_reselect_keeps_scope() {
        let store = Arc::new(InMemoryMessageStore::new());
        let manager = manager_over(&store);

        manager.open_conversation("u2").await.unwrap();
        manager.send_message("hello").await.unwrap();
        manager.open_conversation("u2").await.unwrap();

        assert_eq!(manager.current_view().await.len(), 1);
        assert_eq!(manager.open_counterpart().await.as_deref(), Some("u2"));
    }

    #[tokio::test]
    async fn test_switch_resets_view() {
        let store = Arc::new(InMemoryMessageStore::new());
        let manager = manager_over(&store);

        manager.open_conversation("u2").await.unwrap();
        manager.send_message("for u2").await.unwrap();

        manager.open_conversation("u3").await.unwrap();
        assert!(manager.current_view().await.is_empty());
        assert_eq!(manager.open_counterpart().await.as_deref(), Some("u3"));
    }

    #[tokio::test]
    async fn test_close_clears_view() {
        let store = Arc::new(InMemoryMessageStore::new());
        let manager = manager_over(&store);

        manager.open_conversation("u2").await.unwrap();
        manager.send_message("hello").await.unwrap();
        manager.close().await;

        assert!(manager.current_view().await.is_empty());
        assert_eq!(manager.open_counterpart().await, None);
    }

    #[tokio::test]
    async fn test_open_marks_existing_messages_read() {
        let store = Arc::new(InMemoryMessageStore::new());
        store
            .send_message("u2", "u1", "waiting for you")
            .await
            .unwrap();

        let manager = manager_over(&store);
        manager.open_conversation("u2").await.unwrap();

        let summaries = manager.summaries().await;
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].unread_count, 0);
    }

    #[tokio::test]
    async fn test_send_emits_change_notification() {
        let store = Arc::new(InMemoryMessageStore::new());
        let manager = manager_over(&store);
        manager.open_conversation("u2").await.unwrap();

        let mut events = manager.subscribe();
        manager.send_message("hello").await.unwrap();

        let event = events.recv().await.unwrap();
        assert!(event.is_conversation_updated());
        assert_eq!(event.counterpart_id(), Some("u2"));
    }
}
