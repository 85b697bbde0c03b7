//! Conversation summary aggregation
//!
//! Derives the per-counterpart conversation list (last message and unread
//! count, newest conversation first) from the raw feed of every message
//! touching the operator. Aggregation itself is a pure function; the
//! aggregator caches the latest result and reports whether a refresh actually
//! changed anything, so callers only broadcast real changes.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;
use valise_chat_protocol::{ConversationSummary, Message, MessageStore, Result};

/// Group a message feed into per-counterpart summaries
///
/// `last_message` is the message with the maximum `created_at` in the group
/// (the first one seen wins a timestamp tie); `unread_count` counts messages
/// addressed to `self_id` with no read timestamp. The result is ordered
/// newest conversation first, with the counterpart id as a deterministic
/// tie-break.
pub fn aggregate(self_id: &str, messages: &[Message]) -> Vec<ConversationSummary> {
    let mut groups: HashMap<&str, ConversationSummary> = HashMap::new();

    for message in messages {
        let Some(counterpart) = message.counterpart_of(self_id) else {
            continue;
        };
        let unread = usize::from(message.is_unread_for(self_id));

        match groups.get_mut(counterpart) {
            Some(summary) => {
                summary.unread_count += unread;
                if message.created_at > summary.last_message.created_at {
                    summary.last_message = message.clone();
                }
            }
            None => {
                groups.insert(
                    counterpart,
                    ConversationSummary {
                        counterpart_id: counterpart.to_string(),
                        last_message: message.clone(),
                        unread_count: unread,
                    },
                );
            }
        }
    }

    let mut summaries: Vec<ConversationSummary> = groups.into_values().collect();
    summaries.sort_by(|a, b| {
        b.last_message
            .created_at
            .cmp(&a.last_message.created_at)
            .then_with(|| a.counterpart_id.cmp(&b.counterpart_id))
    });
    summaries
}

/// Derives and caches the conversation list for one operator
pub struct SummaryAggregator {
    self_id: String,
    store: Arc<dyn MessageStore>,
    current: RwLock<Vec<ConversationSummary>>,
}

impl SummaryAggregator {
    /// Create an aggregator for `self_id` over the given store
    pub fn new(self_id: &str, store: Arc<dyn MessageStore>) -> Self {
        Self {
            self_id: self_id.to_string(),
            store,
            current: RwLock::new(Vec::new()),
        }
    }

    /// The most recently computed summary list
    pub async fn summaries(&self) -> Vec<ConversationSummary> {
        self.current.read().await.clone()
    }

    /// Re-derive the summary list from the store
    ///
    /// Returns whether the result differs from the previous one.
    pub async fn refresh(&self) -> Result<bool> {
        let feed = self.store.fetch_touching(&self.self_id).await?;
        let next = aggregate(&self.self_id, &feed);

        let mut current = self.current.write().await;
        if *current == next {
            return Ok(false);
        }
        debug!(
            "Conversation list changed ({} counterparts)",
            next.len()
        );
        *current = next;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use valise_chat_protocol::{InMemoryMessageStore, MessageId};

    fn message(id: &str, sender: &str, receiver: &str, created_at: i64) -> Message {
        Message {
            id: MessageId::Confirmed(id.to_string()),
            sender_id: sender.to_string(),
            receiver_id: receiver.to_string(),
            content: format!("content of {}", id),
            created_at,
            read_at: None,
        }
    }

    #[test]
    fn test_aggregate_groups_by_counterpart() {
        let feed = vec![
            message("m1", "u2", "u1", 100),
            message("m2", "u1", "u2", 200),
            message("m3", "u3", "u1", 150),
        ];

        let summaries = aggregate("u1", &feed);
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].counterpart_id, "u2");
        assert_eq!(summaries[0].last_message.id.as_str(), "m2");
        assert_eq!(summaries[1].counterpart_id, "u3");
    }

    #[test]
    fn test_aggregate_counts_unread_for_self_only() {
        let feed = vec![
            message("m1", "u2", "u1", 100),
            Message {
                read_at: Some(150),
                ..message("m2", "u2", "u1", 120)
            },
            message("m3", "u1", "u2", 200),
        ];

        let summaries = aggregate("u1", &feed);
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].unread_count, 1);
    }

    #[test]
    fn test_aggregate_orders_newest_first() {
        let feed = vec![
            message("m1", "u2", "u1", 100),
            message("m2", "u3", "u1", 300),
            message("m3", "u4", "u1", 200),
        ];

        let summaries = aggregate("u1", &feed);
        let order: Vec<&str> = summaries.iter().map(|s| s.counterpart_id.as_str()).collect();
        assert_eq!(order, vec!["u3", "u4", "u2"]);
    }

    #[test]
    fn test_aggregate_tie_break_is_deterministic() {
        let feed = vec![
            message("m1", "u3", "u1", 100),
            message("m2", "u2", "u1", 100),
        ];

        let summaries = aggregate("u1", &feed);
        let order: Vec<&str> = summaries.iter().map(|s| s.counterpart_id.as_str()).collect();
        assert_eq!(order, vec!["u2", "u3"]);
    }

    #[test]
    fn test_aggregate_skips_foreign_messages() {
        let feed = vec![message("m1", "u2", "u3", 100)];
        assert!(aggregate("u1", &feed).is_empty());
    }

    #[tokio::test]
    async fn test_refresh_reports_change_once() {
        let store = Arc::new(InMemoryMessageStore::new());
        store.seed(message("m1", "u2", "u1", 100)).await;

        let aggregator = SummaryAggregator::new("u1", store.clone() as Arc<dyn MessageStore>);
        assert!(aggregator.refresh().await.unwrap());
        assert!(!aggregator.refresh().await.unwrap());

        store.seed(message("m2", "u2", "u1", 200)).await;
        assert!(aggregator.refresh().await.unwrap());

        let summaries = aggregator.summaries().await;
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].unread_count, 2);
        assert_eq!(summaries[0].last_message.id.as_str(), "m2");
    }
}
