//! Change notifications emitted by the synchronization core

/// Events emitted after any mutation to the open conversation view or the
/// summary list
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// The open conversation's message list changed
    ConversationUpdated {
        /// Counterpart of the conversation that changed
        counterpart_id: String,
    },

    /// A conversation was closed and its view cleared
    ConversationClosed {
        /// Counterpart of the conversation that was closed
        counterpart_id: String,
    },

    /// The conversation summary list changed
    SummariesUpdated,

    /// The push channel failed to establish; polling remains the backstop
    SubscriptionError {
        /// Error message
        message: String,
    },
}

impl SyncEvent {
    /// Check if this event reports a view change
    pub fn is_conversation_updated(&self) -> bool {
        matches!(self, Self::ConversationUpdated { .. })
    }

    /// Check if this event reports a summary change
    pub fn is_summaries_updated(&self) -> bool {
        matches!(self, Self::SummariesUpdated)
    }

    /// Counterpart id if this event is tied to one conversation
    pub fn counterpart_id(&self) -> Option<&str> {
        match self {
            Self::ConversationUpdated { counterpart_id }
            | Self::ConversationClosed { counterpart_id } => Some(counterpart_id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_predicates() {
        let updated = SyncEvent::ConversationUpdated {
            counterpart_id: "u2".to_string(),
        };
        assert!(updated.is_conversation_updated());
        assert_eq!(updated.counterpart_id(), Some("u2"));

        let summaries = SyncEvent::SummariesUpdated;
        assert!(summaries.is_summaries_updated());
        assert_eq!(summaries.counterpart_id(), None);
    }
}
