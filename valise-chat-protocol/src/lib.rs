//! Valise Chat Protocol
//!
//! Data model and external interfaces for the operator chat feature:
//! the message/summary types, the [`MessageStore`] operations backing
//! persistence, and the [`PushChannel`] seam through which server-push
//! transports deliver normalized insert/update events. The synchronization
//! logic itself lives in the `valise-chat-sync` crate.

pub mod message;
pub mod push;
pub mod store;

mod error;

pub use error::{ChatError, Result};
pub use message::{now_millis, ConversationSummary, Message, MessageId, MessageRow};
pub use push::{PushChannel, PushEvent, PushSubscription, SubscriptionGuard};
pub use store::{InMemoryMessageStore, MessageStore};
