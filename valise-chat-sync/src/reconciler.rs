//! Message reconciliation
//!
//! Merges the three concurrent inputs of an open conversation (local
//! optimistic sends, server-push events, and incremental poll batches) into
//! one ordered, duplicate-free message list.
//!
//! Every mutation goes through a single serialized entry point (one tokio
//! `Mutex` around the open-conversation state) and is tagged with the caller's
//! scope epoch; entries carrying an expired epoch are discarded without
//! touching the view. The list is held as an id-indexed map plus an ordered
//! index, so replacing a temporary entry with its confirmed counterpart is a
//! defined remove/insert, not positional splicing.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use valise_chat_protocol::{ChatError, Message, MessageId, MessageStore, PushEvent, Result};

/// Which source handed a confirmed message to the reconciler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IngestSource {
    /// Server-push insert/update stream
    Push,
    /// Incremental poll batch
    Poll,
    /// Confirmation of a local optimistic send
    Send,
}

/// Result of feeding one event or batch into the reconciler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// The view changed and at least one new counterpart-authored message landed
    AppliedInbound,
    /// The view changed with nothing new inbound (own echo, read-state update)
    Applied,
    /// Nothing to do: duplicate, foreign pair, or absent update target
    Ignored,
    /// Carried an expired epoch; discarded without touching the view
    Stale,
}

impl IngestOutcome {
    /// Whether the open conversation's view changed
    pub fn changed_view(&self) -> bool {
        matches!(self, Self::AppliedInbound | Self::Applied)
    }

    /// Whether a new counterpart-authored message was applied
    pub fn is_inbound(&self) -> bool {
        matches!(self, Self::AppliedInbound)
    }
}

/// State of the currently open conversation
struct OpenState {
    self_id: String,
    counterpart_id: String,
    epoch: u64,
    by_id: HashMap<MessageId, Message>,
    /// Message ids ascending by created_at; equal timestamps keep first-seen order
    order: Vec<MessageId>,
    /// Newest created_at the incremental poll has to look past
    watermark: Option<i64>,
}

impl OpenState {
    fn new(self_id: &str, counterpart_id: &str, epoch: u64) -> Self {
        Self {
            self_id: self_id.to_string(),
            counterpart_id: counterpart_id.to_string(),
            epoch,
            by_id: HashMap::new(),
            order: Vec::new(),
            watermark: None,
        }
    }

    fn pair_matches(&self, message: &Message) -> bool {
        message.is_between(&self.self_id, &self.counterpart_id)
    }

    fn insert_ordered(&mut self, message: Message) {
        let position = self.order.partition_point(|id| {
            self.by_id
                .get(id)
                .map_or(false, |existing| existing.created_at <= message.created_at)
        });
        self.order.insert(position, message.id.clone());
        self.by_id.insert(message.id.clone(), message);
    }

    fn remove(&mut self, id: &MessageId) -> Option<Message> {
        let removed = self.by_id.remove(id)?;
        self.order.retain(|entry| entry != id);
        Some(removed)
    }

    /// First temporary entry, in view order, whose content equals `content`
    ///
    /// Content equality is the only correlation key between a temporary entry
    /// and its confirmed counterpart; with two identical outstanding sends the
    /// first one wins.
    fn first_unmatched_temporary(&self, content: &str) -> Option<MessageId> {
        self.order
            .iter()
            .find(|&id| {
                id.is_temporary()
                    && self
                        .by_id
                        .get(id)
                        .map_or(false, |message| message.content == content)
            })
            .cloned()
    }

    /// Unified merge path for confirmed messages from push, poll, and send
    ///
    /// Returns true if the view changed.
    fn apply_incoming(&mut self, message: Message, source: IngestSource) -> bool {
        if self.by_id.contains_key(&message.id) {
            debug!("Dropping duplicate {} from {:?}", message.id, source);
            return false;
        }

        if let Some(temp_id) = self.first_unmatched_temporary(&message.content) {
            debug!("Temporary {} confirmed as {}", temp_id, message.id);
            self.remove(&temp_id);
        }

        self.insert_ordered(message);
        true
    }

    /// Replace an existing message in place; absent ids are ignored
    fn apply_update(&mut self, message: Message) -> bool {
        match self.by_id.get_mut(&message.id) {
            Some(existing) => {
                *existing = message;
                true
            }
            None => false,
        }
    }

    fn advance_watermark(&mut self, created_at: i64) {
        self.watermark = Some(self.watermark.map_or(created_at, |w| w.max(created_at)));
    }

    fn view(&self) -> Vec<Message> {
        self.order
            .iter()
            .filter_map(|id| self.by_id.get(id).cloned())
            .collect()
    }
}

/// The serialized merge point for one open conversation
///
/// Owns the in-memory message list exclusively; push events, poll batches and
/// local sends all funnel through this type, so two simultaneous merges can
/// never race into inconsistent state.
pub struct MessageReconciler {
    store: Arc<dyn MessageStore>,
    state: Mutex<Option<OpenState>>,
}

impl MessageReconciler {
    /// Create a reconciler over the given store
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self {
            store,
            state: Mutex::new(None),
        }
    }

    /// Open the conversation with `counterpart_id`, replacing any previous view
    ///
    /// Fetches the full bidirectional history and positions the poll watermark
    /// at the newest fetched timestamp, or leaves it unset when the history is
    /// empty. Returns the number of fetched messages.
    pub async fn open(&self, self_id: &str, counterpart_id: &str, epoch: u64) -> Result<usize> {
        {
            let mut guard = self.state.lock().await;
            if let Some(existing) = guard.as_ref() {
                if existing.epoch > epoch {
                    debug!(
                        "Open for {} superseded before install (epoch {} < {})",
                        counterpart_id, epoch, existing.epoch
                    );
                    return Err(ChatError::StaleScope {
                        callback_epoch: epoch,
                        current_epoch: existing.epoch,
                    });
                }
            }
            // Install the empty scope before any I/O so the merge point
            // exists even if the initial fetch fails; polling completes the
            // fill in that case.
            *guard = Some(OpenState::new(self_id, counterpart_id, epoch));
        }

        let history = self
            .store
            .fetch_conversation(self_id, counterpart_id, None)
            .await?;
        let count = history.len();
        self.ingest_poll(history, epoch).await;

        debug!(
            "Opened conversation with {} ({} messages)",
            counterpart_id, count
        );
        Ok(count)
    }

    /// Close the conversation and clear the view
    pub async fn close(&self) {
        let mut guard = self.state.lock().await;
        if guard.take().is_some() {
            debug!("Conversation view cleared");
        }
    }

    /// Re-fetch the open conversation and merge the result in place
    ///
    /// Unlike [`open`](Self::open) this preserves outstanding temporary
    /// entries; used when the operator reselects the already-open counterpart.
    pub async fn refresh(&self, epoch: u64) -> Result<IngestOutcome> {
        let (self_id, counterpart_id) = {
            let guard = self.state.lock().await;
            match guard.as_ref() {
                Some(state) if state.epoch == epoch => {
                    (state.self_id.clone(), state.counterpart_id.clone())
                }
                Some(state) => {
                    return Err(ChatError::StaleScope {
                        callback_epoch: epoch,
                        current_epoch: state.epoch,
                    })
                }
                None => return Err(ChatError::NoOpenConversation),
            }
        };

        let history = self
            .store
            .fetch_conversation(&self_id, &counterpart_id, None)
            .await?;
        Ok(self.ingest_poll(history, epoch).await)
    }

    /// Send a message in the open conversation
    ///
    /// A temporary entry appears in the view immediately; the persist call
    /// runs without holding the merge lock, and its result is reconciled
    /// afterwards. On failure the temporary entry is rolled back and the error
    /// returned; content is not retried.
    pub async fn send(&self, content: &str) -> Result<Message> {
        let trimmed = content.trim();
        if trimmed.is_empty() {
            return Err(ChatError::EmptyContent);
        }

        let (temp_id, sender, receiver, epoch) = {
            let mut guard = self.state.lock().await;
            let state = guard.as_mut().ok_or(ChatError::NoOpenConversation)?;
            let temp = Message::outgoing(&state.self_id, &state.counterpart_id, trimmed);
            let temp_id = temp.id.clone();
            state.insert_ordered(temp);
            (
                temp_id,
                state.self_id.clone(),
                state.counterpart_id.clone(),
                state.epoch,
            )
        };

        match self.store.send_message(&sender, &receiver, trimmed).await {
            Ok(confirmed) => {
                let mut guard = self.state.lock().await;
                match guard.as_mut() {
                    Some(state) if state.epoch == epoch => {
                        state.apply_incoming(confirmed.clone(), IngestSource::Send);
                    }
                    _ => debug!("Send confirmed after scope change, view untouched"),
                }
                Ok(confirmed)
            }
            Err(error) => {
                let mut guard = self.state.lock().await;
                if let Some(state) = guard.as_mut() {
                    if state.epoch == epoch {
                        state.remove(&temp_id);
                    }
                }
                warn!("Send failed, optimistic entry rolled back: {}", error);
                Err(error)
            }
        }
    }

    /// Merge one push event into the view
    pub async fn ingest_push(&self, event: PushEvent, epoch: u64) -> IngestOutcome {
        let mut guard = self.state.lock().await;
        let state = match guard.as_mut() {
            Some(state) if state.epoch == epoch => state,
            Some(state) => {
                debug!(
                    "Discarding push event from epoch {} (current {})",
                    epoch, state.epoch
                );
                return IngestOutcome::Stale;
            }
            None => return IngestOutcome::Stale,
        };

        match event {
            PushEvent::Insert(message) => {
                if !state.pair_matches(&message) {
                    return IngestOutcome::Ignored;
                }
                let inbound = message.sender_id != state.self_id;
                let created_at = message.created_at;
                if !state.apply_incoming(message, IngestSource::Push) {
                    return IngestOutcome::Ignored;
                }
                if inbound {
                    state.advance_watermark(created_at);
                    IngestOutcome::AppliedInbound
                } else {
                    IngestOutcome::Applied
                }
            }
            PushEvent::Update(message) => {
                if !state.pair_matches(&message) {
                    return IngestOutcome::Ignored;
                }
                let inbound = message.sender_id != state.self_id;
                let created_at = message.created_at;
                if !state.apply_update(message) {
                    return IngestOutcome::Ignored;
                }
                if inbound {
                    state.advance_watermark(created_at);
                }
                IngestOutcome::Applied
            }
        }
    }

    /// Merge one incremental poll batch into the view
    ///
    /// The batch is defensively re-filtered to the open pair and deduplicated
    /// by id; the watermark advances to the batch maximum only when the
    /// filtered batch is non-empty, so an empty poll can never reset the
    /// cursor.
    pub async fn ingest_poll(&self, batch: Vec<Message>, epoch: u64) -> IngestOutcome {
        let mut guard = self.state.lock().await;
        let state = match guard.as_mut() {
            Some(state) if state.epoch == epoch => state,
            Some(state) => {
                debug!(
                    "Discarding poll batch from epoch {} (current {})",
                    epoch, state.epoch
                );
                return IngestOutcome::Stale;
            }
            None => return IngestOutcome::Stale,
        };

        let before = batch.len();
        let batch: Vec<Message> = batch
            .into_iter()
            .filter(|message| state.pair_matches(message))
            .collect();
        if batch.len() < before {
            warn!(
                "Poll batch carried {} rows outside the open conversation",
                before - batch.len()
            );
        }
        if batch.is_empty() {
            return IngestOutcome::Ignored;
        }

        let batch_max = batch.iter().map(|m| m.created_at).fold(i64::MIN, i64::max);
        let mut changed = false;
        let mut inbound = false;
        for message in batch {
            let from_counterpart = message.sender_id != state.self_id;
            if state.apply_incoming(message, IngestSource::Poll) {
                changed = true;
                inbound = inbound || from_counterpart;
            }
        }
        state.advance_watermark(batch_max);

        if inbound {
            IngestOutcome::AppliedInbound
        } else if changed {
            IngestOutcome::Applied
        } else {
            IngestOutcome::Ignored
        }
    }

    /// The current view: ascending by created_at, first-seen tie order
    ///
    /// Empty when no conversation is open.
    pub async fn current_view(&self) -> Vec<Message> {
        let guard = self.state.lock().await;
        guard.as_ref().map(|state| state.view()).unwrap_or_default()
    }

    /// Watermark bounding the next incremental poll
    pub async fn watermark(&self) -> Option<i64> {
        let guard = self.state.lock().await;
        guard.as_ref().and_then(|state| state.watermark)
    }

    /// Counterpart of the open conversation, if any
    pub async fn open_counterpart(&self) -> Option<String> {
        let guard = self.state.lock().await;
        guard.as_ref().map(|state| state.counterpart_id.clone())
    }
}
